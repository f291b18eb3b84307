//! Working-copy document loader.
//!
//! Walks a repository checkout and reads every text file into a
//! [`Document`]. Version-control metadata, dependency and build output
//! directories are skipped by name, and configured globs exclude more.
//!
//! Per-file problems never fail the load. Oversized, binary, undecodable
//! and unreadable files are logged and recorded in the [`LoadReport`].
//! Only an unreadable root is an error.

use futures::stream::{self, StreamExt};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::fmt;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::config::LoaderConfig;
use crate::error::{RagError, Result};
use crate::models::{Document, Encoding};

/// Directory names never descended into.
const EXCLUDED_DIRS: &[&str] = &[
    ".git",
    "__pycache__",
    "node_modules",
    "target",
    "dist",
    "build",
    ".venv",
    "venv",
];

const DEFAULT_EXCLUDE_GLOBS: &[&str] = &["**/*.pyc"];

/// Bytes inspected for NUL when classifying a file as binary.
const BINARY_SNIFF_LEN: usize = 8192;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    TooLarge(u64),
    Binary,
    Undecodable,
    Unreadable(String),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::TooLarge(size) => write!(f, "file too large ({} bytes)", size),
            SkipReason::Binary => f.write_str("binary content"),
            SkipReason::Undecodable => f.write_str("unsupported text encoding"),
            SkipReason::Unreadable(e) => write!(f, "unreadable: {}", e),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedFile {
    pub path: String,
    pub reason: SkipReason,
}

/// Files seen but not turned into documents.
#[derive(Debug, Clone, Default)]
pub struct LoadReport {
    pub skipped: Vec<SkippedFile>,
}

/// Load all text documents under `root`, sorted by relative path.
pub async fn load_documents(root: &Path, config: &LoaderConfig) -> Result<(Vec<Document>, LoadReport)> {
    let load_err = |reason: String| RagError::Load {
        path: root.display().to_string(),
        reason,
    };

    let meta = tokio::fs::metadata(root)
        .await
        .map_err(|e| load_err(e.to_string()))?;
    if !meta.is_dir() {
        return Err(load_err("not a directory".to_string()));
    }

    let mut patterns: Vec<String> = DEFAULT_EXCLUDE_GLOBS.iter().map(|s| s.to_string()).collect();
    patterns.extend(config.exclude_globs.iter().cloned());
    let exclude_set =
        build_globset(&patterns).map_err(|e| RagError::Config(format!("invalid exclude glob: {}", e)))?;

    let walk_root = root.to_path_buf();
    let max_bytes = config.max_file_bytes;
    let (candidates, mut skipped) =
        tokio::task::spawn_blocking(move || walk(&walk_root, &exclude_set, max_bytes)).await?;

    let results: Vec<(String, std::result::Result<Document, SkipReason>)> =
        stream::iter(candidates)
            .map(|(abs, rel)| async move {
                let outcome = read_document(&abs, &rel).await;
                (rel, outcome)
            })
            .buffer_unordered(config.concurrency.max(1))
            .collect()
            .await;

    let mut documents = Vec::with_capacity(results.len());
    for (path, outcome) in results {
        match outcome {
            Ok(doc) => {
                if doc.encoding != Encoding::Utf8 {
                    tracing::debug!(path = %doc.path, encoding = doc.encoding.as_str(), "decoded non-UTF-8 file");
                }
                documents.push(doc)
            }
            Err(reason) => skipped.push(SkippedFile { path, reason }),
        }
    }

    for file in &skipped {
        tracing::warn!(path = %file.path, reason = %file.reason, "skipping file");
    }

    documents.sort_by(|a, b| a.path.cmp(&b.path));
    skipped.sort_by(|a, b| a.path.cmp(&b.path));

    tracing::info!(
        root = %root.display(),
        documents = documents.len(),
        skipped = skipped.len(),
        "documents loaded"
    );
    Ok((documents, LoadReport { skipped }))
}

/// Candidate files as (absolute, relative) paths, plus files rejected
/// before reading.
fn walk(root: &Path, exclude_set: &GlobSet, max_bytes: u64) -> (Vec<(PathBuf, String)>, Vec<SkippedFile>) {
    let mut candidates = Vec::new();
    let mut skipped = Vec::new();

    let walker = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| {
            e.depth() == 0
                || !(e.file_type().is_dir()
                    && EXCLUDED_DIRS.contains(&e.file_name().to_string_lossy().as_ref()))
        });

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                let path = e
                    .path()
                    .map(|p| relative_path(root, p))
                    .unwrap_or_default();
                skipped.push(SkippedFile {
                    path,
                    reason: SkipReason::Unreadable(e.to_string()),
                });
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let rel = relative_path(root, entry.path());
        if exclude_set.is_match(&rel) {
            continue;
        }

        match entry.metadata() {
            Ok(meta) if meta.len() > max_bytes => skipped.push(SkippedFile {
                path: rel,
                reason: SkipReason::TooLarge(meta.len()),
            }),
            Ok(_) => candidates.push((entry.path().to_path_buf(), rel)),
            Err(e) => skipped.push(SkippedFile {
                path: rel,
                reason: SkipReason::Unreadable(e.to_string()),
            }),
        }
    }

    (candidates, skipped)
}

async fn read_document(abs: &Path, rel: &str) -> std::result::Result<Document, SkipReason> {
    let bytes = tokio::fs::read(abs)
        .await
        .map_err(|e| SkipReason::Unreadable(e.to_string()))?;
    let (content, encoding) = decode(&bytes)?;
    Ok(Document {
        path: rel.to_string(),
        content,
        encoding,
    })
}

/// Decode file bytes as text. A byte-order mark selects UTF-16; otherwise
/// the content must be NUL-free UTF-8.
pub fn decode(bytes: &[u8]) -> std::result::Result<(String, Encoding), SkipReason> {
    if let Some(rest) = bytes.strip_prefix(&[0xFF, 0xFE]) {
        return decode_utf16(rest, u16::from_le_bytes).map(|s| (s, Encoding::Utf16Le));
    }
    if let Some(rest) = bytes.strip_prefix(&[0xFE, 0xFF]) {
        return decode_utf16(rest, u16::from_be_bytes).map(|s| (s, Encoding::Utf16Be));
    }

    let sniff = &bytes[..bytes.len().min(BINARY_SNIFF_LEN)];
    if sniff.contains(&0) {
        return Err(SkipReason::Binary);
    }

    match bytes.strip_prefix(&[0xEF, 0xBB, 0xBF]) {
        Some(rest) => std::str::from_utf8(rest)
            .map(|s| (s.to_string(), Encoding::Utf8Bom))
            .map_err(|_| SkipReason::Undecodable),
        None => std::str::from_utf8(bytes)
            .map(|s| (s.to_string(), Encoding::Utf8))
            .map_err(|_| SkipReason::Undecodable),
    }
}

fn decode_utf16(bytes: &[u8], unit: fn([u8; 2]) -> u16) -> std::result::Result<String, SkipReason> {
    if bytes.len() % 2 != 0 {
        return Err(SkipReason::Undecodable);
    }
    let units: Vec<u16> = bytes.chunks_exact(2).map(|p| unit([p[0], p[1]])).collect();
    String::from_utf16(&units).map_err(|_| SkipReason::Undecodable)
}

fn relative_path(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn build_globset(patterns: &[String]) -> std::result::Result<GlobSet, globset::Error> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    builder.build()
}
