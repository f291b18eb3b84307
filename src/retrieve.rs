//! Retrieval and context assembly.
//!
//! [`ActiveIndex`] pairs a [`VectorIndex`] with the embedder whose backend
//! built it. Queries are only ever embedded through that pair, so query and
//! index vectors always come from the same model.
//!
//! Assembled context is a sequence of blocks, one per retrieved chunk:
//!
//! ```text
//! --- File: src/app.py ---
//! <chunk text>
//! ```
//!
//! joined by blank lines and bounded by the configured context window.

use std::collections::HashSet;
use std::sync::Arc;

use crate::config::RetrievalConfig;
use crate::embedding::Embedder;
use crate::error::{RagError, Result};
use crate::index::VectorIndex;
use crate::models::{Chunk, RetrievedContext, SearchHit};

/// Appended when blocks were dropped or cut to fit the context window.
pub const TRUNCATION_MARKER: &str = "\n... [truncated]";

const BLOCK_SEPARATOR: &str = "\n\n";

/// The index currently served, with the embedder that can query it.
pub struct ActiveIndex {
    index: VectorIndex,
    embedder: Arc<dyn Embedder>,
}

impl ActiveIndex {
    /// Fails with [`RagError::IndexCorrupt`] when `embedder` is not the
    /// backend recorded in the index.
    pub fn new(index: VectorIndex, embedder: Arc<dyn Embedder>) -> Result<Self> {
        let tag = embedder.tag();
        if tag != index.meta().tag {
            return Err(RagError::IndexCorrupt(format!(
                "index was built with {} but was paired with {}",
                index.meta().tag,
                tag
            )));
        }
        Ok(Self { index, embedder })
    }

    pub fn index(&self) -> &VectorIndex {
        &self.index
    }

    /// Raw ranked matches for `query`, most similar first.
    pub async fn search(&self, query: &str, k: usize) -> Result<Vec<SearchHit>> {
        if k == 0 || self.index.is_empty() {
            return Ok(Vec::new());
        }
        let vector = self.embedder.embed_query(query).await?;
        let hits = self
            .index
            .query(&vector, k)?
            .into_iter()
            .map(|(chunk, distance)| SearchHit {
                content: chunk.text.clone(),
                source: chunk.source_path.clone(),
                offset: chunk.start_offset,
                score: 1.0 - distance,
            })
            .collect();
        Ok(hits)
    }

    /// Top-`k` chunks for `query` assembled into a bounded context.
    ///
    /// Chunks scoring below `min_score` are left out; when none remain the
    /// context is empty.
    pub async fn retrieve(&self, query: &str, config: &RetrievalConfig) -> Result<RetrievedContext> {
        if config.k == 0 || self.index.is_empty() {
            return Ok(RetrievedContext::default());
        }
        let vector = self.embedder.embed_query(query).await?;
        let mut ranked = self.index.query(&vector, config.k)?;
        if let Some(min) = config.min_score {
            ranked.retain(|(_, distance)| 1.0 - distance >= min);
        }
        let mut assembled = assemble(ranked.iter().map(|(chunk, _)| *chunk), config.context_window);
        assembled.matches = ranked
            .into_iter()
            .map(|(chunk, distance)| SearchHit {
                content: chunk.text.clone(),
                source: chunk.source_path.clone(),
                offset: chunk.start_offset,
                score: 1.0 - distance,
            })
            .collect();
        Ok(assembled)
    }
}

/// Format ranked chunks into a context of at most `context_window`
/// characters (plus the truncation marker when anything was cut).
///
/// Duplicate chunks (same path and offset) are skipped. Whole blocks are
/// dropped from the end to fit; a label always stays with its text. When
/// even the first block is too long, its text is cut after the label.
/// `sources` lists the files that made it into the context, in rank order.
pub fn assemble<'a>(ranked: impl IntoIterator<Item = &'a Chunk>, context_window: usize) -> RetrievedContext {
    let mut seen = HashSet::new();
    let blocks: Vec<(&str, String, &str)> = ranked
        .into_iter()
        .filter(|chunk| seen.insert((chunk.source_path.as_str(), chunk.start_offset)))
        .map(|chunk| {
            (
                chunk.source_path.as_str(),
                format!("--- File: {} ---\n", chunk.source_path),
                chunk.text.as_str(),
            )
        })
        .collect();

    if blocks.is_empty() {
        return RetrievedContext::default();
    }

    let separator_len = BLOCK_SEPARATOR.chars().count();
    let mut used = 0usize;
    let mut kept = 0usize;
    for (i, (_, label, text)) in blocks.iter().enumerate() {
        let len = label.chars().count() + text.chars().count() + if i > 0 { separator_len } else { 0 };
        if used + len > context_window {
            break;
        }
        used += len;
        kept += 1;
    }

    let mut context = String::with_capacity(used + TRUNCATION_MARKER.len());
    let mut sources: Vec<String> = Vec::new();

    if kept == 0 {
        let (path, label, text) = &blocks[0];
        let room = context_window.saturating_sub(label.chars().count());
        context.push_str(label);
        context.extend(text.chars().take(room));
        context.push_str(TRUNCATION_MARKER);
        push_source(&mut sources, path);
    } else {
        for (i, (path, label, text)) in blocks.iter().take(kept).enumerate() {
            if i > 0 {
                context.push_str(BLOCK_SEPARATOR);
            }
            context.push_str(label);
            context.push_str(text);
            push_source(&mut sources, path);
        }
        if kept < blocks.len() {
            context.push_str(TRUNCATION_MARKER);
        }
    }

    RetrievedContext {
        context,
        sources,
        matches: Vec::new(),
    }
}

fn push_source(sources: &mut Vec<String>, path: &str) {
    if !sources.iter().any(|s| s == path) {
        sources.push(path.to_string());
    }
}
