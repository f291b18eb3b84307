//! TOML configuration.
//!
//! Every section has defaults, so an empty file is a valid configuration.
//! Credentials never live in the file: backends name the environment
//! variable that holds them.
//!
//! ```toml
//! [data]
//! repos_dir = "data/repos"
//! index_path = "data/index.sqlite"
//!
//! [chunking]
//! chunk_size = 1500
//! chunk_overlap = 300
//!
//! [embedding]
//! backend = "local"
//!
//! [generation]
//! provider = "local"
//! base_url = "http://127.0.0.1:1234/v1"
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::chunk::ChunkerConfig;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub data: DataConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub git: GitConfig,
    #[serde(default)]
    pub loader: LoaderConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DataConfig {
    #[serde(default = "default_repos_dir")]
    pub repos_dir: PathBuf,
    #[serde(default = "default_index_path")]
    pub index_path: PathBuf,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            repos_dir: default_repos_dir(),
            index_path: default_index_path(),
        }
    }
}

fn default_repos_dir() -> PathBuf {
    PathBuf::from("data/repos")
}
fn default_index_path() -> PathBuf {
    PathBuf::from("data/index.sqlite")
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
        }
    }
}

fn default_chunk_size() -> usize {
    1500
}
fn default_chunk_overlap() -> usize {
    300
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    /// Number of chunks fetched per query.
    #[serde(default = "default_k")]
    pub k: usize,
    /// Maximum characters of assembled context handed to generation.
    #[serde(default = "default_context_window")]
    pub context_window: usize,
    /// Characters of a full file appended by the deep-read step.
    #[serde(default = "default_deep_read_chars")]
    pub deep_read_chars: usize,
    /// Chunks less similar than this are not used as context. Unset keeps
    /// every retrieved chunk.
    #[serde(default)]
    pub min_score: Option<f32>,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            k: default_k(),
            context_window: default_context_window(),
            deep_read_chars: default_deep_read_chars(),
            min_score: None,
        }
    }
}

fn default_k() -> usize {
    10
}
fn default_context_window() -> usize {
    6000
}
fn default_deep_read_chars() -> usize {
    2000
}

/// Which family of backend serves a capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// In-process (embedding) or a server on this machine (generation).
    #[default]
    Local,
    /// Network inference endpoint that requires a credential.
    Remote,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Local => "local",
            BackendKind::Remote => "remote",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(BackendKind::Local),
            "remote" => Ok(BackendKind::Remote),
            other => Err(format!(
                "unknown backend '{}': must be local or remote",
                other
            )),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// Backend used for ingestion when the caller does not choose one.
    #[serde(default)]
    pub backend: BackendKind,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub local: LocalEmbeddingConfig,
    #[serde(default)]
    pub remote: RemoteEmbeddingConfig,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Local,
            batch_size: default_batch_size(),
            local: LocalEmbeddingConfig::default(),
            remote: RemoteEmbeddingConfig::default(),
        }
    }
}

fn default_batch_size() -> usize {
    32
}

#[derive(Debug, Deserialize, Clone)]
pub struct LocalEmbeddingConfig {
    #[serde(default = "default_local_model")]
    pub model: String,
    /// Where downloaded weights are cached. Defaults to fastembed's cache dir.
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
}

impl Default for LocalEmbeddingConfig {
    fn default() -> Self {
        Self {
            model: default_local_model(),
            cache_dir: None,
        }
    }
}

fn default_local_model() -> String {
    "all-minilm-l6-v2".to_string()
}

/// Wire format spoken by a remote embedding endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RemoteEmbeddingApi {
    /// Hugging Face inference `feature-extraction` pipeline.
    #[default]
    Huggingface,
    /// OpenAI-compatible `/embeddings`.
    Openai,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RemoteEmbeddingConfig {
    #[serde(default)]
    pub api: RemoteEmbeddingApi,
    #[serde(default = "default_remote_embedding_url")]
    pub url: String,
    #[serde(default = "default_remote_embedding_model")]
    pub model: String,
    #[serde(default = "default_hf_token_env")]
    pub api_key_env: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for RemoteEmbeddingConfig {
    fn default() -> Self {
        Self {
            api: RemoteEmbeddingApi::Huggingface,
            url: default_remote_embedding_url(),
            model: default_remote_embedding_model(),
            api_key_env: default_hf_token_env(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_remote_embedding_url() -> String {
    "https://router.huggingface.co/hf-inference/models".to_string()
}
fn default_remote_embedding_model() -> String {
    "sentence-transformers/all-mpnet-base-v2".to_string()
}
fn default_hf_token_env() -> String {
    "HUGGINGFACEHUB_API_TOKEN".to_string()
}
fn default_max_retries() -> u32 {
    3
}
fn default_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    #[serde(default)]
    pub provider: BackendKind,
    /// OpenAI-compatible base URL. Defaults depend on `provider`.
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_generation_model")]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_hf_token_env")]
    pub api_key_env: String,
    #[serde(default = "default_generation_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: BackendKind::Local,
            base_url: None,
            model: default_generation_model(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            api_key_env: default_hf_token_env(),
            timeout_secs: default_generation_timeout_secs(),
        }
    }
}

impl GenerationConfig {
    pub fn resolved_base_url(&self) -> String {
        let url = match (&self.base_url, self.provider) {
            (Some(url), _) => url.clone(),
            (None, BackendKind::Local) => "http://127.0.0.1:1234/v1".to_string(),
            (None, BackendKind::Remote) => "https://router.huggingface.co/v1".to_string(),
        };
        url.trim_end_matches('/').to_string()
    }
}

fn default_generation_model() -> String {
    "local-model".to_string()
}
fn default_temperature() -> f32 {
    0.1
}
fn default_max_tokens() -> u32 {
    2048
}
fn default_generation_timeout_secs() -> u64 {
    300
}

#[derive(Debug, Deserialize, Clone)]
pub struct GitConfig {
    /// Branch to clone and track. `None` follows the remote's default.
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub shallow: bool,
    #[serde(default = "default_git_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            branch: None,
            shallow: false,
            timeout_secs: default_git_timeout_secs(),
        }
    }
}

fn default_git_timeout_secs() -> u64 {
    300
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoaderConfig {
    /// Extra exclusions on top of the built-in VCS/build/dependency patterns.
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            exclude_globs: Vec::new(),
            max_file_bytes: default_max_file_bytes(),
            concurrency: default_concurrency(),
        }
    }
}

fn default_max_file_bytes() -> u64 {
    1_048_576
}
fn default_concurrency() -> usize {
    16
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8000".to_string()
}

impl Config {
    /// The validated chunker settings.
    pub fn chunker(&self) -> crate::error::Result<ChunkerConfig> {
        ChunkerConfig::new(self.chunking.chunk_size, self.chunking.chunk_overlap)
    }
}

/// Parse configuration from TOML text and validate it.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

/// Read, parse, and validate a configuration file.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

fn validate(config: &Config) -> Result<()> {
    // Overlap >= size would never make forward progress; reject it here.
    config.chunker()?;

    if config.retrieval.k == 0 {
        anyhow::bail!("retrieval.k must be >= 1");
    }
    if let Some(min) = config.retrieval.min_score {
        if !(-1.0..=1.0).contains(&min) {
            anyhow::bail!("retrieval.min_score must be in [-1.0, 1.0]");
        }
    }
    if config.retrieval.context_window == 0 {
        anyhow::bail!("retrieval.context_window must be > 0");
    }
    if config.embedding.batch_size == 0 {
        anyhow::bail!("embedding.batch_size must be > 0");
    }
    if config.loader.concurrency == 0 {
        anyhow::bail!("loader.concurrency must be > 0");
    }
    if !(0.0..=2.0).contains(&config.generation.temperature) {
        anyhow::bail!("generation.temperature must be in [0.0, 2.0]");
    }
    if config.generation.max_tokens == 0 {
        anyhow::bail!("generation.max_tokens must be > 0");
    }
    if config.git.timeout_secs == 0
        || config.generation.timeout_secs == 0
        || config.embedding.remote.timeout_secs == 0
    {
        anyhow::bail!("timeouts must be > 0 seconds");
    }

    Ok(())
}
