//! In-memory vector index with SQLite persistence.
//!
//! The index is a flat list of (chunk, vector) entries searched by brute
//! force cosine distance. Repositories are small enough that an exhaustive
//! scan is fast, and results are exact and fully deterministic.
//!
//! On disk an index is one SQLite file with two tables:
//!
//! | Table | Contents |
//! |-------|----------|
//! | `index_meta` | key/value rows: backend tag, dims, repository, counts, build id, timestamps, format version |
//! | `entries` | one row per chunk, vector stored as little-endian `f32` BLOB |

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::config::BackendKind;
use crate::db::{self, FORMAT_VERSION};
use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob, BackendTag};
use crate::error::{RagError, Result};
use crate::models::Chunk;

/// Descriptive data stored alongside the entries.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexMeta {
    pub tag: BackendTag,
    /// Vector dimension. Set by [`VectorIndex::build`].
    pub dims: usize,
    pub repository: String,
    /// Checkout the entries were read from.
    pub working_copy: PathBuf,
    pub document_count: usize,
    pub build_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub format_version: u32,
}

impl IndexMeta {
    pub fn new(
        tag: BackendTag,
        repository: impl Into<String>,
        working_copy: impl Into<PathBuf>,
        document_count: usize,
    ) -> Self {
        Self {
            tag,
            dims: 0,
            repository: repository.into(),
            working_copy: working_copy.into(),
            document_count,
            build_id: Uuid::new_v4(),
            created_at: Utc::now(),
            format_version: FORMAT_VERSION,
        }
    }

    fn to_rows(&self) -> Vec<(&'static str, String)> {
        vec![
            ("format_version", self.format_version.to_string()),
            ("backend_kind", self.tag.kind.as_str().to_string()),
            ("backend_model", self.tag.model.clone()),
            ("dims", self.dims.to_string()),
            ("repository", self.repository.clone()),
            ("working_copy", self.working_copy.display().to_string()),
            ("document_count", self.document_count.to_string()),
            ("build_id", self.build_id.to_string()),
            ("created_at", self.created_at.to_rfc3339()),
        ]
    }

    fn from_rows(rows: HashMap<String, String>) -> Result<Self> {
        let get = |key: &str| {
            rows.get(key)
                .cloned()
                .ok_or_else(|| RagError::IndexCorrupt(format!("missing metadata key '{}'", key)))
        };
        let bad = |key: &str, value: &str| {
            RagError::IndexCorrupt(format!("invalid metadata value for '{}': {}", key, value))
        };

        let version = get("format_version")?;
        let format_version: u32 = version.parse().map_err(|_| bad("format_version", &version))?;
        if format_version != FORMAT_VERSION {
            return Err(RagError::IndexCorrupt(format!(
                "index format version {} is not supported (expected {})",
                format_version, FORMAT_VERSION
            )));
        }

        let kind = get("backend_kind")?;
        let kind: BackendKind = kind.parse().map_err(|_| bad("backend_kind", &kind))?;
        let dims = get("dims")?;
        let dims: usize = dims.parse().map_err(|_| bad("dims", &dims))?;
        let count = get("document_count")?;
        let document_count: usize = count.parse().map_err(|_| bad("document_count", &count))?;
        let build_id = get("build_id")?;
        let build_id = Uuid::parse_str(&build_id).map_err(|_| bad("build_id", &build_id))?;
        let created_at = get("created_at")?;
        let created_at = DateTime::parse_from_rfc3339(&created_at)
            .map_err(|_| bad("created_at", &created_at))?
            .with_timezone(&Utc);

        Ok(Self {
            tag: BackendTag {
                kind,
                model: get("backend_model")?,
            },
            dims,
            repository: get("repository")?,
            working_copy: PathBuf::from(get("working_copy")?),
            document_count,
            build_id,
            created_at,
            format_version,
        })
    }
}

#[derive(Debug, Clone)]
struct Entry {
    chunk: Chunk,
    vector: Vec<f32>,
}

/// An immutable, fully built index.
#[derive(Debug, Clone)]
pub struct VectorIndex {
    meta: IndexMeta,
    entries: Vec<Entry>,
}

impl VectorIndex {
    /// Pair chunks with their vectors. Every vector must have the same
    /// nonzero length.
    pub fn build(mut meta: IndexMeta, chunks: Vec<Chunk>, vectors: Vec<Vec<f32>>) -> Result<Self> {
        if chunks.len() != vectors.len() {
            return Err(RagError::Internal(format!(
                "{} chunks but {} vectors",
                chunks.len(),
                vectors.len()
            )));
        }

        let dims = vectors.first().map(|v| v.len()).unwrap_or(0);
        if vectors.iter().any(|v| v.len() != dims || v.is_empty()) {
            return Err(RagError::EmbeddingBackendUnavailable(
                "malformed response: vectors have inconsistent dimensions".to_string(),
            ));
        }
        meta.dims = dims;

        let entries = chunks
            .into_iter()
            .zip(vectors)
            .map(|(chunk, vector)| Entry { chunk, vector })
            .collect();

        Ok(Self { meta, entries })
    }

    pub fn meta(&self) -> &IndexMeta {
        &self.meta
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The `k` nearest entries by cosine distance (`1 - similarity`),
    /// closest first. Equal distances keep insertion order.
    pub fn query(&self, vector: &[f32], k: usize) -> Result<Vec<(&Chunk, f32)>> {
        if k == 0 || self.entries.is_empty() {
            return Ok(Vec::new());
        }
        if vector.len() != self.meta.dims {
            return Err(RagError::IndexCorrupt(format!(
                "query vector has {} dimensions but the index has {}",
                vector.len(),
                self.meta.dims
            )));
        }

        let mut scored: Vec<(&Chunk, f32)> = self
            .entries
            .iter()
            .map(|e| (&e.chunk, 1.0 - cosine_similarity(vector, &e.vector)))
            .collect();
        scored.sort_by(|a, b| a.1.total_cmp(&b.1));
        scored.truncate(k);
        Ok(scored)
    }

    /// Write the index to `path`, replacing any existing file atomically.
    pub async fn persist(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                RagError::Internal(format!("failed to create {}: {}", parent.display(), e))
            })?;
        }

        let tmp = temp_path(path);
        let result = self.write_file(&tmp).await;
        let result = match result {
            Ok(()) => tokio::fs::rename(&tmp, path).await.map_err(|e| {
                RagError::Internal(format!("failed to move index into place: {}", e))
            }),
            Err(e) => Err(e),
        };

        if result.is_err() {
            let _ = tokio::fs::remove_file(&tmp).await;
        } else {
            tracing::info!(
                path = %path.display(),
                chunks = self.len(),
                build_id = %self.meta.build_id,
                "index persisted"
            );
        }
        result
    }

    async fn write_file(&self, tmp: &Path) -> Result<()> {
        let to_internal = |e: sqlx::Error| RagError::Internal(format!("failed to write index: {}", e));
        let pool = db::create(tmp).await.map_err(to_internal)?;

        let mut tx = pool.begin().await.map_err(to_internal)?;
        for (key, value) in self.meta.to_rows() {
            sqlx::query("INSERT INTO index_meta (key, value) VALUES (?, ?)")
                .bind(key)
                .bind(value)
                .execute(&mut *tx)
                .await
                .map_err(to_internal)?;
        }
        for (position, entry) in self.entries.iter().enumerate() {
            sqlx::query(
                "INSERT INTO entries (position, source_path, start_offset, sequence_index, text, hash, vector)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(position as i64)
            .bind(&entry.chunk.source_path)
            .bind(entry.chunk.start_offset as i64)
            .bind(entry.chunk.sequence_index as i64)
            .bind(&entry.chunk.text)
            .bind(&entry.chunk.hash)
            .bind(vec_to_blob(&entry.vector))
            .execute(&mut *tx)
            .await
            .map_err(to_internal)?;
        }
        tx.commit().await.map_err(to_internal)?;

        pool.close().await;
        Ok(())
    }

    /// Read an index file. `Ok(None)` when no file exists at `path`.
    pub async fn load(path: &Path) -> Result<Option<Self>> {
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            return Ok(None);
        }

        let pool = db::open_read_only(path).await?;
        let result = read_index(&pool).await;
        pool.close().await;

        let index = result?;
        tracing::info!(
            path = %path.display(),
            repository = %index.meta.repository,
            chunks = index.len(),
            backend = %index.meta.tag,
            "index loaded"
        );
        Ok(Some(index))
    }
}

async fn read_index(pool: &sqlx::SqlitePool) -> Result<VectorIndex> {
    let rows: Vec<(String, String)> = sqlx::query_as("SELECT key, value FROM index_meta")
        .fetch_all(pool)
        .await?;
    let meta = IndexMeta::from_rows(rows.into_iter().collect())?;

    let rows: Vec<(i64, String, i64, i64, String, String, Vec<u8>)> = sqlx::query_as(
        "SELECT position, source_path, start_offset, sequence_index, text, hash, vector
         FROM entries ORDER BY position",
    )
    .fetch_all(pool)
    .await?;

    let mut entries = Vec::with_capacity(rows.len());
    for (position, source_path, start_offset, sequence_index, text, hash, blob) in rows {
        if blob.len() != meta.dims * 4 {
            return Err(RagError::IndexCorrupt(format!(
                "entry {} has a {}-byte vector, expected {}",
                position,
                blob.len(),
                meta.dims * 4
            )));
        }
        if start_offset < 0 || sequence_index < 0 {
            return Err(RagError::IndexCorrupt(format!(
                "entry {} has a negative offset",
                position
            )));
        }
        entries.push(Entry {
            chunk: Chunk {
                text,
                source_path,
                start_offset: start_offset as usize,
                sequence_index: sequence_index as usize,
                hash,
            },
            vector: blob_to_vec(&blob),
        });
    }

    Ok(VectorIndex { meta, entries })
}

fn temp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "index".to_string());
    path.with_file_name(format!("{}.{}.tmp", name, Uuid::new_v4()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn chunk(path: &str, offset: usize, text: &str) -> Chunk {
        Chunk {
            text: text.to_string(),
            source_path: path.to_string(),
            start_offset: offset,
            sequence_index: 0,
            hash: format!("h{offset}"),
        }
    }

    fn tag() -> BackendTag {
        BackendTag {
            kind: BackendKind::Local,
            model: "test-model".to_string(),
        }
    }

    fn sample_index() -> VectorIndex {
        let chunks = vec![
            chunk("a.py", 0, "alpha"),
            chunk("b.py", 0, "beta"),
            chunk("c.py", 0, "gamma"),
            chunk("d.py", 0, "alpha again"),
        ];
        let vectors = vec![
            vec![1.0, 0.0, 0.0],
            vec![0.0, 1.0, 0.0],
            vec![0.0, 0.0, 1.0],
            vec![1.0, 0.0, 0.0],
        ];
        VectorIndex::build(IndexMeta::new(tag(), "tiny", "/tmp/tiny", 4), chunks, vectors).unwrap()
    }

    #[test]
    fn query_orders_by_distance_with_stable_ties() {
        let index = sample_index();
        let hits = index.query(&[1.0, 0.1, 0.0], 3).unwrap();
        let paths: Vec<&str> = hits.iter().map(|(c, _)| c.source_path.as_str()).collect();
        assert_eq!(paths, vec!["a.py", "d.py", "b.py"]);
        assert!(hits[0].1 <= hits[2].1);
    }

    #[test]
    fn query_zero_k_or_empty_index() {
        let index = sample_index();
        assert!(index.query(&[1.0, 0.0, 0.0], 0).unwrap().is_empty());

        let empty = VectorIndex::build(IndexMeta::new(tag(), "none", "/tmp/none", 0), vec![], vec![]).unwrap();
        assert!(empty.query(&[1.0], 5).unwrap().is_empty());
    }

    #[test]
    fn build_rejects_mismatched_inputs() {
        let meta = IndexMeta::new(tag(), "r", "/tmp/r", 1);
        assert!(VectorIndex::build(meta.clone(), vec![chunk("a", 0, "x")], vec![]).is_err());
        assert!(VectorIndex::build(
            meta,
            vec![chunk("a", 0, "x"), chunk("b", 0, "y")],
            vec![vec![1.0, 2.0], vec![1.0]],
        )
        .is_err());
    }

    #[tokio::test]
    async fn persist_and_load_round_trip() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested").join("index.sqlite");
        let index = sample_index();
        index.persist(&path).await.unwrap();

        let loaded = VectorIndex::load(&path).await.unwrap().unwrap();
        assert_eq!(loaded.meta(), index.meta());
        assert_eq!(loaded.len(), 4);

        let query = [0.3, 0.9, 0.1];
        let before: Vec<(Chunk, f32)> = index
            .query(&query, 4)
            .unwrap()
            .into_iter()
            .map(|(c, d)| (c.clone(), d))
            .collect();
        let after: Vec<(Chunk, f32)> = loaded
            .query(&query, 4)
            .unwrap()
            .into_iter()
            .map(|(c, d)| (c.clone(), d))
            .collect();
        assert_eq!(before, after);

        let leftovers: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn missing_file_is_none() {
        let tmp = TempDir::new().unwrap();
        let loaded = VectorIndex::load(&tmp.path().join("absent.sqlite")).await.unwrap();
        assert!(loaded.is_none());
    }

    #[tokio::test]
    async fn garbage_file_is_corrupt() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("index.sqlite");
        std::fs::write(&path, vec![0x5Au8; 4096]).unwrap();
        let err = VectorIndex::load(&path).await.unwrap_err();
        assert!(matches!(err, RagError::IndexCorrupt(_)));
    }

    #[tokio::test]
    async fn persist_replaces_previous_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("index.sqlite");
        sample_index().persist(&path).await.unwrap();

        let smaller = VectorIndex::build(
            IndexMeta::new(tag(), "other", "/tmp/other", 1),
            vec![chunk("z.py", 0, "zeta")],
            vec![vec![0.5, 0.5]],
        )
        .unwrap();
        smaller.persist(&path).await.unwrap();

        let loaded = VectorIndex::load(&path).await.unwrap().unwrap();
        assert_eq!(loaded.meta().repository, "other");
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded.meta().dims, 2);
    }
}
