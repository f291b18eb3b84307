//! Prompt composition and the deep-read policy.
//!
//! A chat turn is a fixed system prompt plus a user message that carries
//! the question, the retrieved code context, and answer instructions.
//!
//! Questions that ask to see a whole file ("show me", "complete", ...) get
//! an extra excerpt of the top-ranked source file appended to the context.
//! [`wants_full_file`] decides that; [`read_excerpt`] fetches the excerpt
//! from the working copy without ever leaving it.

use std::path::{Component, Path};

use crate::error::{RagError, Result};

pub const SYSTEM_PROMPT: &str = "You are RepoChat, an AI assistant that helps developers understand codebases.
You answer questions based ONLY on the provided code context.
Always include relevant code snippets in your answers.
Be concise but thorough.
If the context doesn't contain enough information to answer, say so.";

/// Phrases that ask for a whole file rather than a snippet.
const FULL_FILE_KEYWORDS: &[&str] = &["show me", "example of", "complete", "full", "entire"];

/// A composed chat-completions request body, minus backend parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

/// Build the prompt for `question` over already assembled `context`.
pub fn compose(question: &str, context: &str) -> Prompt {
    let user = format!(
        "Question: {question}

Code Context:
{context}

Instructions:
1. Answer the question based on the code above
2. Include relevant code snippets with file paths
3. Be specific and accurate
4. If unsure, say so"
    );
    Prompt {
        system: SYSTEM_PROMPT.to_string(),
        user,
    }
}

/// Whether `question` asks to see a full file. Case-insensitive.
pub fn wants_full_file(question: &str) -> bool {
    let lowered = question.to_lowercase();
    FULL_FILE_KEYWORDS.iter().any(|k| lowered.contains(k))
}

/// Context block appended for a deep read.
pub fn full_file_block(path: &str, excerpt: &str) -> String {
    format!("\n\nFull content of {}:\n{}", path, excerpt)
}

/// First `max_chars` characters of `relative` inside `root`.
///
/// Absolute paths, `..` components, and symlinks resolving outside `root`
/// are rejected.
pub async fn read_excerpt(root: &Path, relative: &str, max_chars: usize) -> Result<String> {
    let rejected = |reason: &str| RagError::Load {
        path: relative.to_string(),
        reason: reason.to_string(),
    };

    let rel = Path::new(relative);
    if rel
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
    {
        return Err(rejected("path escapes the working copy"));
    }

    let io_err = |e: std::io::Error| RagError::Load {
        path: relative.to_string(),
        reason: e.to_string(),
    };
    let root = tokio::fs::canonicalize(root).await.map_err(io_err)?;
    let full = tokio::fs::canonicalize(root.join(rel)).await.map_err(io_err)?;
    if !full.starts_with(&root) {
        return Err(rejected("path escapes the working copy"));
    }

    let bytes = tokio::fs::read(&full).await.map_err(io_err)?;
    let text = String::from_utf8_lossy(&bytes);
    Ok(text.chars().take(max_chars).collect())
}
