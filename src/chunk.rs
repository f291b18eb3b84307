//! Recursive separator text chunker.
//!
//! Splits document content into [`Chunk`]s of at most `chunk_size`
//! characters, carrying up to `chunk_overlap` characters of trailing context
//! from one chunk into the next. Splitting prefers structural boundaries:
//! class definitions, then function definitions, blank lines, single
//! newlines, spaces, and finally individual characters. A finer separator
//! is only tried on pieces that are still larger than `chunk_size`.
//!
//! Separators stay attached to the piece that follows them, so every chunk
//! is a contiguous slice of the source and its `start_offset` (in
//! characters) is exact.

use sha2::{Digest, Sha256};
use std::collections::VecDeque;

use crate::error::{RagError, Result};
use crate::models::{Chunk, Document};

/// Split boundaries in priority order. The empty separator splits between
/// characters and always applies.
pub const SEPARATORS: &[&str] = &["\nclass ", "\ndef ", "\n\n", "\n", " ", ""];

/// Validated chunk size and overlap, both in characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkerConfig {
    chunk_size: usize,
    chunk_overlap: usize,
}

impl ChunkerConfig {
    /// Rejects configurations that could not make forward progress.
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Result<Self> {
        if chunk_size == 0 {
            return Err(RagError::ChunkingConfig(
                "chunk_size must be > 0".to_string(),
            ));
        }
        if chunk_overlap >= chunk_size {
            return Err(RagError::ChunkingConfig(format!(
                "chunk_overlap ({}) must be smaller than chunk_size ({})",
                chunk_overlap, chunk_size
            )));
        }
        Ok(Self {
            chunk_size,
            chunk_overlap,
        })
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn chunk_overlap(&self) -> usize {
        self.chunk_overlap
    }
}

/// Chunk a loaded document.
pub fn chunk_document(doc: &Document, config: &ChunkerConfig) -> Vec<Chunk> {
    chunk_text(&doc.path, &doc.content, config)
}

/// Split `text` into offset-ordered chunks with contiguous sequence indices.
pub fn chunk_text(source_path: &str, text: &str, config: &ChunkerConfig) -> Vec<Chunk> {
    if text.trim().is_empty() {
        return Vec::new();
    }

    if text.chars().count() <= config.chunk_size {
        return vec![make_chunk(source_path, 0, 0, text)];
    }

    let mut spans = Vec::new();
    split_recursive(text, 0, SEPARATORS, config, &mut spans);

    // Spans are byte ranges with strictly increasing starts; convert starts
    // to character offsets with a single forward scan.
    let mut chunks = Vec::with_capacity(spans.len());
    let mut byte_cursor = 0;
    let mut char_cursor = 0;
    for (index, (start, end)) in spans.into_iter().enumerate() {
        char_cursor += text[byte_cursor..start].chars().count();
        byte_cursor = start;
        chunks.push(make_chunk(source_path, index, char_cursor, &text[start..end]));
    }
    chunks
}

/// A piece of text: absolute byte range plus its length in characters.
type Piece = (usize, usize, usize);

fn split_recursive(
    text: &str,
    base: usize,
    separators: &[&str],
    config: &ChunkerConfig,
    out: &mut Vec<(usize, usize)>,
) {
    let position = separators
        .iter()
        .position(|sep| sep.is_empty() || text.contains(sep))
        .unwrap_or(separators.len().saturating_sub(1));
    let separator = separators.get(position).copied().unwrap_or("");
    let finer = separators.get(position + 1..).unwrap_or(&[]);

    let mut fitting: Vec<Piece> = Vec::new();
    for (start, end) in split_keeping_separator(text, separator) {
        let len = text[start..end].chars().count();
        if len <= config.chunk_size {
            fitting.push((base + start, base + end, len));
            continue;
        }

        merge_pieces(&fitting, config, out);
        fitting.clear();
        if finer.is_empty() {
            out.push((base + start, base + end));
        } else {
            split_recursive(&text[start..end], base + start, finer, config, out);
        }
    }
    merge_pieces(&fitting, config, out);
}

/// Relative byte ranges of `text` split before each occurrence of `separator`.
fn split_keeping_separator(text: &str, separator: &str) -> Vec<(usize, usize)> {
    if separator.is_empty() {
        return text
            .char_indices()
            .map(|(i, c)| (i, i + c.len_utf8()))
            .collect();
    }

    let mut starts = vec![0];
    for (idx, _) in text.match_indices(separator) {
        if idx > 0 {
            starts.push(idx);
        }
    }
    let mut ranges = Vec::with_capacity(starts.len());
    for (i, &start) in starts.iter().enumerate() {
        let end = starts.get(i + 1).copied().unwrap_or(text.len());
        if end > start {
            ranges.push((start, end));
        }
    }
    ranges
}

/// Greedily pack adjacent pieces into windows of at most `chunk_size`
/// characters, keeping up to `chunk_overlap` characters between windows.
fn merge_pieces(pieces: &[Piece], config: &ChunkerConfig, out: &mut Vec<(usize, usize)>) {
    let mut window: VecDeque<Piece> = VecDeque::new();
    let mut total = 0usize;

    for &piece in pieces {
        let len = piece.2;
        if total + len > config.chunk_size && !window.is_empty() {
            if let (Some(first), Some(last)) = (window.front(), window.back()) {
                out.push((first.0, last.1));
            }
            // Always drops at least one piece, so window starts advance.
            while total > config.chunk_overlap || (total + len > config.chunk_size && total > 0) {
                match window.pop_front() {
                    Some(dropped) => total -= dropped.2,
                    None => break,
                }
            }
        }
        window.push_back(piece);
        total += len;
    }

    if let (Some(first), Some(last)) = (window.front(), window.back()) {
        out.push((first.0, last.1));
    }
}

fn make_chunk(source_path: &str, index: usize, start_offset: usize, text: &str) -> Chunk {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let hash = format!("{:x}", hasher.finalize());

    Chunk {
        text: text.to_string(),
        source_path: source_path.to_string(),
        start_offset,
        sequence_index: index,
        hash,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(size: usize, overlap: usize) -> ChunkerConfig {
        ChunkerConfig::new(size, overlap).unwrap()
    }

    /// Character ranges covered by each chunk.
    fn ranges(chunks: &[Chunk]) -> Vec<(usize, usize)> {
        chunks
            .iter()
            .map(|c| (c.start_offset, c.start_offset + c.text.chars().count()))
            .collect()
    }

    fn sample_source() -> String {
        let mut text = String::from("import os\nimport sys\n\n");
        for i in 0..12 {
            text.push_str(&format!(
                "class Widget{i}:\n    def render(self):\n        return 'widget {i}'\n\n    def size(self):\n        return {i}\n\n"
            ));
            text.push_str(&format!("def helper_{i}(value):\n    return value * {i}\n"));
        }
        text
    }

    #[test]
    fn test_short_document_single_chunk() {
        let text = "def main():\n    print('hello world from a tiny file')\n";
        let chunks = chunk_text("main.py", text, &cfg(1000, 200));
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].start_offset, 0);
        assert_eq!(chunks[0].sequence_index, 0);
        assert_eq!(chunks[0].text, text);
        assert_eq!(chunks[0].source_path, "main.py");
    }

    #[test]
    fn test_document_exactly_chunk_size() {
        let text = "x".repeat(50);
        let chunks = chunk_text("a.txt", &text, &cfg(50, 10));
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, text);
    }

    #[test]
    fn test_empty_and_blank_documents() {
        assert!(chunk_text("a", "", &cfg(10, 2)).is_empty());
        assert!(chunk_text("a", " \n\n \t", &cfg(10, 2)).is_empty());
    }

    #[test]
    fn test_invalid_configs_rejected() {
        assert!(matches!(
            ChunkerConfig::new(100, 100),
            Err(RagError::ChunkingConfig(_))
        ));
        assert!(matches!(
            ChunkerConfig::new(100, 250),
            Err(RagError::ChunkingConfig(_))
        ));
        assert!(matches!(
            ChunkerConfig::new(0, 0),
            Err(RagError::ChunkingConfig(_))
        ));
        assert!(ChunkerConfig::new(100, 99).is_ok());
    }

    #[test]
    fn test_offsets_increase_and_cover_document() {
        let text = sample_source();
        let total = text.chars().count();
        for (size, overlap) in [(80, 0), (120, 30), (200, 199), (57, 13), (1000, 200)] {
            let chunks = chunk_text("widgets.py", &text, &cfg(size, overlap));
            let ranges = ranges(&chunks);
            assert_eq!(ranges[0].0, 0, "size={size} overlap={overlap}");
            for pair in ranges.windows(2) {
                assert!(pair[1].0 > pair[0].0, "offsets must strictly increase");
                assert!(pair[1].0 <= pair[0].1, "gap between chunks");
            }
            assert_eq!(ranges.last().unwrap().1, total);
        }
    }

    #[test]
    fn test_chunks_respect_size_and_offsets_match_source() {
        let text = sample_source();
        let chars: Vec<char> = text.chars().collect();
        let chunks = chunk_text("widgets.py", &text, &cfg(150, 40));
        assert!(chunks.len() > 1);
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.sequence_index, i);
            let len = chunk.text.chars().count();
            assert!(len <= 150);
            let slice: String = chars[chunk.start_offset..chunk.start_offset + len]
                .iter()
                .collect();
            assert_eq!(slice, chunk.text);
        }
    }

    #[test]
    fn test_prefers_class_boundaries() {
        let text = sample_source();
        let chunks = chunk_text("widgets.py", &text, &cfg(400, 0));
        let starting_at_class = chunks
            .iter()
            .skip(1)
            .filter(|c| c.text.starts_with("\nclass "))
            .count();
        assert!(starting_at_class >= chunks.len() / 2);
    }

    #[test]
    fn test_overlap_carries_context() {
        let text = (0..200).map(|i| format!("w{i}")).collect::<Vec<_>>().join(" ");
        let chunks = chunk_text("words.txt", &text, &cfg(60, 20));
        let ranges = ranges(&chunks);
        let overlapping = ranges.windows(2).filter(|p| p[1].0 < p[0].1).count();
        assert!(overlapping > 0);
        for pair in ranges.windows(2) {
            assert!(pair[0].1 - pair[1].0 <= 20);
        }
    }

    #[test]
    fn test_unbroken_text_falls_back_to_characters() {
        let text = "é".repeat(95);
        let chunks = chunk_text("blob.txt", &text, &cfg(30, 5));
        assert!(chunks.len() >= 4);
        assert!(chunks.iter().all(|c| c.text.chars().count() <= 30));
        assert_eq!(ranges(&chunks).last().unwrap().1, 95);
    }

    #[test]
    fn test_deterministic() {
        let text = sample_source();
        let a = chunk_text("w.py", &text, &cfg(120, 30));
        let b = chunk_text("w.py", &text, &cfg(120, 30));
        assert_eq!(a, b);
    }
}
