//! Error taxonomy for the RAG pipeline.
//!
//! Every failure that can cross a component boundary is a [`RagError`]
//! variant. Each variant carries a stable machine-readable [`code`](RagError::code)
//! used by the HTTP layer and by streaming error events, so that callers can
//! tell misconfiguration (missing credential) from transient unavailability
//! (network, timeout) from "ingest first" / "rephrase" conditions.

use std::time::Duration;

/// Errors produced by the ingestion and query pipeline.
#[derive(Debug, thiserror::Error)]
pub enum RagError {
    /// Clone or pull failed. Fatal to the ingestion run.
    #[error("repository acquisition failed: {0}")]
    Acquisition(String),

    /// The working-copy root itself could not be read.
    #[error("failed to load documents from {path}: {reason}")]
    Load { path: String, reason: String },

    /// The repository produced no readable text documents.
    #[error("no readable documents found in repository")]
    EmptyRepository,

    /// Invalid chunk size / overlap combination.
    #[error("invalid chunking configuration: {0}")]
    ChunkingConfig(String),

    #[error("embedding credential missing: set the {env_var} environment variable")]
    EmbeddingCredentialMissing { env_var: String },

    #[error("embedding backend unavailable: {0}")]
    EmbeddingBackendUnavailable(String),

    /// Local embedding weights could not be obtained or loaded.
    #[error("failed to load embedding model: {0}")]
    ModelLoad(String),

    /// Persisted index unreadable, incompatible, or built by another backend.
    #[error("index is corrupt or incompatible: {0}")]
    IndexCorrupt(String),

    #[error("no repository has been indexed yet; ingest a repository first")]
    NoIndexLoaded,

    #[error("no relevant code found for this question; try rephrasing it")]
    NoRelevantContext,

    #[error("generation credential missing: set the {env_var} environment variable")]
    GenerationCredentialMissing { env_var: String },

    #[error("generation failed: {0}")]
    Generation(String),

    #[error("{operation} timed out after {}s", .after.as_secs())]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl RagError {
    /// Stable identifier for this error class.
    pub fn code(&self) -> &'static str {
        match self {
            RagError::Acquisition(_) => "acquisition_failure",
            RagError::Load { .. } => "load_failure",
            RagError::EmptyRepository => "empty_repository",
            RagError::ChunkingConfig(_) => "chunking_config",
            RagError::EmbeddingCredentialMissing { .. } => "embedding_credential_missing",
            RagError::EmbeddingBackendUnavailable(_) => "embedding_backend_unavailable",
            RagError::ModelLoad(_) => "model_load_failure",
            RagError::IndexCorrupt(_) => "index_corrupt",
            RagError::NoIndexLoaded => "no_index_loaded",
            RagError::NoRelevantContext => "no_relevant_context",
            RagError::GenerationCredentialMissing { .. } => "generation_credential_missing",
            RagError::Generation(_) => "generation_failure",
            RagError::Timeout { .. } => "timeout",
            RagError::Config(_) => "config",
            RagError::Internal(_) => "internal",
        }
    }

    /// True for failures that may succeed on retry without a config change.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RagError::EmbeddingBackendUnavailable(_)
                | RagError::Generation(_)
                | RagError::Timeout { .. }
        )
    }
}

impl From<sqlx::Error> for RagError {
    fn from(err: sqlx::Error) -> Self {
        RagError::IndexCorrupt(err.to_string())
    }
}

impl From<tokio::task::JoinError> for RagError {
    fn from(err: tokio::task::JoinError) -> Self {
        RagError::Internal(err.to_string())
    }
}

/// Result alias used throughout the library.
pub type Result<T> = std::result::Result<T, RagError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_distinct_for_query_failures() {
        let codes = [
            RagError::NoIndexLoaded.code(),
            RagError::NoRelevantContext.code(),
            RagError::Generation("down".into()).code(),
        ];
        assert_eq!(codes, ["no_index_loaded", "no_relevant_context", "generation_failure"]);
    }

    #[test]
    fn timeout_message_names_operation() {
        let err = RagError::Timeout {
            operation: "git clone",
            after: Duration::from_secs(30),
        };
        assert_eq!(err.to_string(), "git clone timed out after 30s");
        assert!(err.is_transient());
    }

    #[test]
    fn credential_missing_is_not_transient() {
        let err = RagError::EmbeddingCredentialMissing {
            env_var: "HF_TOKEN".into(),
        };
        assert!(!err.is_transient());
        assert!(err.to_string().contains("HF_TOKEN"));
    }
}
