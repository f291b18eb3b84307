//! In-process sentence embeddings via fastembed.
//!
//! The ONNX model is downloaded (once, into the fastembed cache) and loaded
//! on first use, then kept for the life of the embedder. Inference is CPU
//! bound and runs on the blocking thread pool.

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use super::{BackendTag, Embedder};
use crate::config::{BackendKind, LocalEmbeddingConfig};
use crate::error::{RagError, Result};

/// Model names accepted in `embedding.local.model`.
pub const SUPPORTED_MODELS: &[&str] = &[
    "all-minilm-l6-v2",
    "bge-small-en-v1.5",
    "bge-base-en-v1.5",
    "bge-large-en-v1.5",
    "nomic-embed-text-v1",
    "nomic-embed-text-v1.5",
    "multilingual-e5-small",
    "multilingual-e5-base",
    "multilingual-e5-large",
];

#[cfg(feature = "local-embeddings")]
type Model = fastembed::TextEmbedding;
#[cfg(not(feature = "local-embeddings"))]
type Model = ();

pub struct LocalEmbedder {
    model_name: String,
    cache_dir: Option<PathBuf>,
    batch_size: usize,
    model: Arc<Mutex<Option<Model>>>,
}

impl LocalEmbedder {
    /// Validates the model name; weights are not touched until the first
    /// call to [`Embedder::embed`].
    pub fn new(config: &LocalEmbeddingConfig, batch_size: usize) -> Result<Self> {
        if !SUPPORTED_MODELS.contains(&config.model.as_str()) {
            return Err(RagError::ModelLoad(format!(
                "unknown local embedding model '{}'. Supported models: {}",
                config.model,
                SUPPORTED_MODELS.join(", ")
            )));
        }
        Ok(Self {
            model_name: config.model.clone(),
            cache_dir: config.cache_dir.clone(),
            batch_size,
            model: Arc::new(Mutex::new(None)),
        })
    }
}

#[cfg(feature = "local-embeddings")]
fn config_to_fastembed_model(name: &str) -> Result<fastembed::EmbeddingModel> {
    match name {
        "all-minilm-l6-v2" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2),
        "bge-small-en-v1.5" => Ok(fastembed::EmbeddingModel::BGESmallENV15),
        "bge-base-en-v1.5" => Ok(fastembed::EmbeddingModel::BGEBaseENV15),
        "bge-large-en-v1.5" => Ok(fastembed::EmbeddingModel::BGELargeENV15),
        "nomic-embed-text-v1" => Ok(fastembed::EmbeddingModel::NomicEmbedTextV1),
        "nomic-embed-text-v1.5" => Ok(fastembed::EmbeddingModel::NomicEmbedTextV15),
        "multilingual-e5-small" => Ok(fastembed::EmbeddingModel::MultilingualE5Small),
        "multilingual-e5-base" => Ok(fastembed::EmbeddingModel::MultilingualE5Base),
        "multilingual-e5-large" => Ok(fastembed::EmbeddingModel::MultilingualE5Large),
        other => Err(RagError::ModelLoad(format!(
            "unknown local embedding model '{}'",
            other
        ))),
    }
}

#[cfg(feature = "local-embeddings")]
fn load_model(name: &str, cache_dir: Option<PathBuf>) -> Result<Model> {
    let mut options = fastembed::InitOptions::new(config_to_fastembed_model(name)?)
        .with_show_download_progress(false);
    if let Some(dir) = cache_dir {
        options = options.with_cache_dir(dir);
    }
    tracing::info!(model = name, "loading local embedding model");
    fastembed::TextEmbedding::try_new(options).map_err(|e| {
        RagError::ModelLoad(format!(
            "failed to initialize local embedding model '{}': {}",
            name, e
        ))
    })
}

#[async_trait]
impl Embedder for LocalEmbedder {
    fn tag(&self) -> BackendTag {
        BackendTag {
            kind: BackendKind::Local,
            model: self.model_name.clone(),
        }
    }

    #[cfg(feature = "local-embeddings")]
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let slot = self.model.clone();
        let name = self.model_name.clone();
        let cache_dir = self.cache_dir.clone();
        let batch_size = self.batch_size;
        let texts = texts.to_vec();

        tokio::task::spawn_blocking(move || {
            let mut guard = slot
                .lock()
                .map_err(|_| RagError::Internal("local embedding model lock poisoned".to_string()))?;
            if guard.is_none() {
                *guard = Some(load_model(&name, cache_dir)?);
            }
            let model = guard
                .as_mut()
                .ok_or_else(|| RagError::ModelLoad(format!("model '{}' not loaded", name)))?;
            model
                .embed(texts, Some(batch_size))
                .map_err(|e| RagError::EmbeddingBackendUnavailable(format!("local embedding failed: {}", e)))
        })
        .await?
    }

    #[cfg(not(feature = "local-embeddings"))]
    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let _ = (&self.cache_dir, self.batch_size, &self.model);
        Err(RagError::ModelLoad(
            "local embeddings require building with --features local-embeddings".to_string(),
        ))
    }
}
