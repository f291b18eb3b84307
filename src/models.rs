//! Core data models used throughout repochat.
//!
//! These types represent the documents, chunks, and query results that flow
//! through the ingestion and retrieval pipeline.

use serde::Serialize;

/// Text encoding a document was decoded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Encoding {
    Utf8,
    Utf8Bom,
    Utf16Le,
    Utf16Be,
}

impl Encoding {
    pub fn as_str(&self) -> &'static str {
        match self {
            Encoding::Utf8 => "utf-8",
            Encoding::Utf8Bom => "utf-8-bom",
            Encoding::Utf16Le => "utf-16le",
            Encoding::Utf16Be => "utf-16be",
        }
    }
}

/// A text file loaded from a working copy.
#[derive(Debug, Clone)]
pub struct Document {
    /// Path relative to the repository root, `/`-separated.
    pub path: String,
    pub content: String,
    pub encoding: Encoding,
}

/// A contiguous slice of a document's content.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub text: String,
    pub source_path: String,
    /// Character offset of `text` within the document content.
    pub start_offset: usize,
    /// Position among the chunks of the same document.
    pub sequence_index: usize,
    /// SHA-256 of `text`, hex encoded.
    pub hash: String,
}

/// One ranked match from the vector index.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub content: String,
    pub source: String,
    pub offset: usize,
    /// Cosine similarity of the match (higher is closer).
    pub score: f32,
}

/// Assembled retrieval output handed to generation.
#[derive(Debug, Clone, Default)]
pub struct RetrievedContext {
    pub context: String,
    /// Originating files, most relevant first, without duplicates.
    pub sources: Vec<String>,
    pub matches: Vec<SearchHit>,
}

impl RetrievedContext {
    pub fn is_empty(&self) -> bool {
        self.context.is_empty()
    }
}

/// Outcome of an ingestion run.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct IngestReport {
    pub success: bool,
    pub message: String,
    pub repository: String,
    pub documents: usize,
    pub chunks: usize,
    /// Error code of a failed run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl IngestReport {
    pub fn failed(repository: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            repository: repository.into(),
            documents: 0,
            chunks: 0,
            code: None,
        }
    }
}

/// Non-streaming chat answer.
#[derive(Debug, Clone, Serialize)]
pub struct ChatAnswer {
    pub answer: String,
    pub sources: Vec<String>,
}
