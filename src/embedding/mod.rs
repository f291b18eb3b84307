//! Embedding backend abstraction and implementations.
//!
//! Defines the [`Embedder`] trait and its two implementations:
//! - **[`LocalEmbedder`]**: runs a sentence-embedding model in-process via fastembed.
//! - **[`RemoteEmbedder`]**: calls an inference endpoint over HTTP (Hugging Face or
//!   OpenAI-compatible) with batching, retry, and backoff.
//!
//! Every embedder reports a [`BackendTag`]. The tag is stored with a built
//! index, and at query time the index can only be paired with an embedder
//! whose tag matches (see [`EmbedderFactory::restore`]), so vectors from
//! different models are never compared.
//!
//! Also provides vector utilities:
//! - [`cosine_similarity`]: compute similarity between two embedding vectors
//! - [`vec_to_blob`]: encode a `Vec<f32>` as little-endian bytes for SQLite BLOB storage
//! - [`blob_to_vec`]: decode a SQLite BLOB back into a `Vec<f32>`

mod local;
mod remote;

pub use local::LocalEmbedder;
pub use remote::RemoteEmbedder;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, OnceLock};

use crate::config::{BackendKind, EmbeddingConfig};
use crate::error::{RagError, Result};

/// Identity of the backend and model that produced a set of vectors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendTag {
    pub kind: BackendKind,
    pub model: String,
}

impl fmt::Display for BackendTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.model)
    }
}

/// Maps text to fixed-length vectors.
///
/// Implementations must be deterministic for identical input and model
/// version, and must return one vector per input text, in input order.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Backend identity recorded alongside any index built with this embedder.
    fn tag(&self) -> BackendTag;

    /// Embed a batch of texts.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Embed a single query text.
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        let results = self.embed(&[text.to_string()]).await?;
        results.into_iter().next().ok_or_else(|| {
            RagError::EmbeddingBackendUnavailable("empty embedding response".to_string())
        })
    }
}

/// Embed `texts` in batches of `batch_size`, checking that the backend
/// returned one vector per text and that all vectors share a dimension.
pub async fn embed_all(
    embedder: &dyn Embedder,
    texts: &[String],
    batch_size: usize,
) -> Result<Vec<Vec<f32>>> {
    let mut vectors = Vec::with_capacity(texts.len());
    for batch in texts.chunks(batch_size.max(1)) {
        let embedded = embedder.embed(batch).await?;
        if embedded.len() != batch.len() {
            return Err(RagError::EmbeddingBackendUnavailable(format!(
                "malformed response: {} vectors for {} texts",
                embedded.len(),
                batch.len()
            )));
        }
        vectors.extend(embedded);
    }

    if let Some(first) = vectors.first() {
        let dims = first.len();
        if dims == 0 || vectors.iter().any(|v| v.len() != dims) {
            return Err(RagError::EmbeddingBackendUnavailable(
                "malformed response: vectors have inconsistent dimensions".to_string(),
            ));
        }
    }
    tracing::debug!(count = vectors.len(), backend = %embedder.tag(), "embedded texts");
    Ok(vectors)
}

/// Creates embedders for ingestion and reconstructs them for persisted indexes.
pub trait EmbedderFactory: Send + Sync {
    /// Embedder for the given backend family, as currently configured.
    fn create(&self, kind: BackendKind) -> Result<Arc<dyn Embedder>>;

    /// Embedder matching a persisted index's tag.
    ///
    /// Fails with [`RagError::IndexCorrupt`] when the configured backend of
    /// that kind uses a different model than the one that built the index.
    fn restore(&self, tag: &BackendTag) -> Result<Arc<dyn Embedder>> {
        let embedder = self.create(tag.kind)?;
        let active = embedder.tag();
        if active != *tag {
            return Err(RagError::IndexCorrupt(format!(
                "index was built with {} but the configured backend is {}; re-ingest the repository",
                tag, active
            )));
        }
        Ok(embedder)
    }
}

/// Production factory backed by [`EmbeddingConfig`].
pub struct ConfiguredEmbedders {
    config: EmbeddingConfig,
    client: reqwest::Client,
    local: OnceLock<Arc<LocalEmbedder>>,
}

impl ConfiguredEmbedders {
    pub fn new(config: EmbeddingConfig, client: reqwest::Client) -> Self {
        Self {
            config,
            client,
            local: OnceLock::new(),
        }
    }
}

impl EmbedderFactory for ConfiguredEmbedders {
    fn create(&self, kind: BackendKind) -> Result<Arc<dyn Embedder>> {
        match kind {
            BackendKind::Local => {
                if let Some(existing) = self.local.get() {
                    return Ok(existing.clone());
                }
                // One shared instance; its model loads on first use.
                let created = Arc::new(LocalEmbedder::new(&self.config.local, self.config.batch_size)?);
                Ok(self.local.get_or_init(|| created).clone())
            }
            BackendKind::Remote => Ok(Arc::new(RemoteEmbedder::new(
                &self.config.remote,
                self.client.clone(),
            ))),
        }
    }
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
///
/// # Example
///
/// ```rust
/// use repochat::embedding::{vec_to_blob, blob_to_vec};
///
/// let v = vec![1.0f32, -2.5, 3.125];
/// let blob = vec_to_blob(&v);
/// assert_eq!(blob.len(), 12); // 3 × 4 bytes
/// assert_eq!(blob_to_vec(&blob), v);
/// ```
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
///
/// Trailing bytes that do not form a whole `f32` are ignored; callers that
/// need to detect truncation compare `blob.len()` against the expected size.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns a value in `[-1.0, 1.0]`, or `0.0` for empty vectors, vectors of
/// different lengths, or zero vectors.
///
/// ```text
///            a · b
/// cos(θ) = ─────────
///          ‖a‖ × ‖b‖
/// ```
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedEmbedder {
        dims: Vec<usize>,
    }

    #[async_trait]
    impl Embedder for FixedEmbedder {
        fn tag(&self) -> BackendTag {
            BackendTag {
                kind: BackendKind::Local,
                model: "fixed".to_string(),
            }
        }

        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts
                .iter()
                .enumerate()
                .map(|(i, _)| vec![1.0; self.dims[i % self.dims.len()]])
                .collect())
        }
    }

    struct FixedFactory;

    impl EmbedderFactory for FixedFactory {
        fn create(&self, _kind: BackendKind) -> Result<Arc<dyn Embedder>> {
            Ok(Arc::new(FixedEmbedder { dims: vec![3] }))
        }
    }

    #[test]
    fn test_vec_blob_roundtrip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        let blob = vec_to_blob(&vec);
        let restored = blob_to_vec(&blob);
        assert_eq!(vec, restored);
    }

    #[test]
    fn test_cosine_identical() {
        let v = vec![1.0, 2.0, 3.0];
        let sim = cosine_similarity(&v, &v);
        assert!((sim - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![0.0, 1.0, 0.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_degenerate_inputs() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }

    #[tokio::test]
    async fn test_embed_all_batches_and_checks_dims() {
        let texts: Vec<String> = (0..5).map(|i| format!("t{i}")).collect();
        let ok = FixedEmbedder { dims: vec![4] };
        let vectors = embed_all(&ok, &texts, 2).await.unwrap();
        assert_eq!(vectors.len(), 5);

        let ragged = FixedEmbedder { dims: vec![4, 3] };
        let err = embed_all(&ragged, &texts, 10).await.unwrap_err();
        assert!(matches!(err, RagError::EmbeddingBackendUnavailable(_)));
    }

    #[test]
    fn test_restore_rejects_other_model() {
        let factory = FixedFactory;
        let same = BackendTag {
            kind: BackendKind::Local,
            model: "fixed".to_string(),
        };
        assert!(factory.restore(&same).is_ok());

        let other = BackendTag {
            kind: BackendKind::Local,
            model: "bge-small-en-v1.5".to_string(),
        };
        let err = factory.restore(&other).err().unwrap();
        assert!(matches!(err, RagError::IndexCorrupt(_)));
    }
}
