//! The RAG engine: ingestion and question answering over one index.
//!
//! ```text
//! ingest:  url ─▶ RepoAcquirer ─▶ loader ─▶ chunk ─▶ Embedder ─▶ VectorIndex ─▶ persist ─▶ swap
//! chat:    question ─▶ ActiveIndex (embed + query) ─▶ assemble ─▶ [deep read] ─▶ Generator
//! ```
//!
//! The served index lives in an [`ArcSwapOption`]. Queries take a snapshot
//! and never block; a successful ingestion swaps the new index in at once.
//! Ingestions are serialized so two runs never write the index file or a
//! working copy at the same time. A failed ingestion leaves the served
//! index and the file on disk as they were.

use arc_swap::ArcSwapOption;
use futures::stream::{self, Stream, StreamExt};
use serde::Serialize;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::acquire::{repo_name, GitAcquirer, RepoAcquirer};
use crate::chunk::chunk_document;
use crate::config::{BackendKind, Config};
use crate::embedding::{embed_all, ConfiguredEmbedders, EmbedderFactory};
use crate::error::{RagError, Result};
use crate::generate::{create_generator, BackendHealth, Generator, GeneratorInfo, TokenStream};
use crate::index::{IndexMeta, VectorIndex};
use crate::loader::load_documents;
use crate::models::{ChatAnswer, IngestReport, RetrievedContext, SearchHit};
use crate::progress::{format_number, IngestStage, NoProgress, ProgressEvent, ProgressReporter};
use crate::prompt::{self, Prompt};
use crate::retrieve::ActiveIndex;

/// One event of a streamed chat answer.
///
/// A stream carries exactly one `Sources`, then any number of `Token`s,
/// then exactly one `Done` or `Error`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum ChatEvent {
    Sources(Vec<String>),
    Token(String),
    Done,
    Error { code: String, message: String },
}

impl ChatEvent {
    pub fn error(err: &RagError) -> Self {
        ChatEvent::Error {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ChatEvent::Done | ChatEvent::Error { .. })
    }
}

pub type ChatEventStream = Pin<Box<dyn Stream<Item = ChatEvent> + Send>>;

/// Summary of the served index.
#[derive(Debug, Clone, Serialize, Default)]
pub struct IndexStatus {
    pub loaded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunks: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub documents: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub built_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub version: &'static str,
    pub generation: BackendHealth,
    pub index: IndexStatus,
}

pub struct RagEngine {
    config: Arc<Config>,
    acquirer: Arc<dyn RepoAcquirer>,
    embedders: Arc<dyn EmbedderFactory>,
    generator: Arc<dyn Generator>,
    active: ArcSwapOption<ActiveIndex>,
    ingest_lock: Mutex<()>,
}

impl RagEngine {
    pub fn new(
        config: Config,
        acquirer: Arc<dyn RepoAcquirer>,
        embedders: Arc<dyn EmbedderFactory>,
        generator: Arc<dyn Generator>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            acquirer,
            embedders,
            generator,
            active: ArcSwapOption::empty(),
            ingest_lock: Mutex::new(()),
        }
    }

    /// Engine with the production backends selected by `config`.
    pub fn from_config(config: Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("repochat/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| RagError::Config(format!("failed to build HTTP client: {}", e)))?;

        let acquirer = Arc::new(GitAcquirer::new(config.data.repos_dir.clone(), &config.git));
        let embedders = Arc::new(ConfiguredEmbedders::new(
            config.embedding.clone(),
            client.clone(),
        ));
        let generator = create_generator(&config.generation, client);
        Ok(Self::new(config, acquirer, embedders, generator))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The generation backend answering questions.
    pub fn generator_info(&self) -> GeneratorInfo {
        self.generator.describe()
    }

    pub fn is_loaded(&self) -> bool {
        self.active.load().is_some()
    }

    /// Load the persisted index, if any, and pair it with its embedder.
    ///
    /// A missing, corrupt, or incompatible index is logged and leaves the
    /// engine without an index. Returns whether an index is now served.
    pub async fn restore_index(&self) -> bool {
        let path = &self.config.data.index_path;
        let index = match VectorIndex::load(path).await {
            Ok(Some(index)) => index,
            Ok(None) => {
                tracing::info!(path = %path.display(), "no persisted index");
                return false;
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "ignoring unreadable index");
                return false;
            }
        };

        let active = self
            .embedders
            .restore(&index.meta().tag)
            .and_then(|embedder| ActiveIndex::new(index, embedder));
        match active {
            Ok(active) => {
                self.active.store(Some(Arc::new(active)));
                true
            }
            Err(e) => {
                tracing::warn!(error = %e, "persisted index cannot be used; re-ingest the repository");
                false
            }
        }
    }

    /// Ingest `url` without progress output.
    pub async fn ingest(&self, url: &str, backend: Option<BackendKind>) -> IngestReport {
        self.ingest_with_progress(url, backend, &NoProgress).await
    }

    /// Clone or update, load, chunk, embed, index, persist, and swap in.
    ///
    /// Never fails: problems are reported as `success: false`, and the
    /// reporter always receives exactly one terminal event.
    pub async fn ingest_with_progress(
        &self,
        url: &str,
        backend: Option<BackendKind>,
        reporter: &dyn ProgressReporter,
    ) -> IngestReport {
        let _guard = self.ingest_lock.lock().await;
        reporter.report(ProgressEvent::new(
            IngestStage::Starting,
            0,
            format!("Starting ingestion of {}", url),
        ));

        let report = match self.run_ingest(url, backend, reporter).await {
            Ok(report) => {
                tracing::info!(
                    repository = %report.repository,
                    documents = report.documents,
                    chunks = report.chunks,
                    "ingestion complete"
                );
                report
            }
            Err(e) => {
                tracing::error!(
                    url,
                    code = e.code(),
                    transient = e.is_transient(),
                    error = %e,
                    "ingestion failed"
                );
                IngestReport {
                    code: Some(e.code().to_string()),
                    ..IngestReport::failed(repo_name(url), e.to_string())
                }
            }
        };

        reporter.report(ProgressEvent::finished(report.clone()));
        report
    }

    async fn run_ingest(
        &self,
        url: &str,
        backend: Option<BackendKind>,
        reporter: &dyn ProgressReporter,
    ) -> Result<IngestReport> {
        let chunker = self.config.chunker()?;
        let kind = backend.unwrap_or(self.config.embedding.backend);
        let embedder = self.embedders.create(kind)?;
        let repository = repo_name(url);

        reporter.report(ProgressEvent::new(
            IngestStage::Cloning,
            10,
            format!("Fetching {}", repository),
        ));
        let working_copy = self.acquirer.acquire(url).await?;

        reporter.report(ProgressEvent::new(IngestStage::Loading, 30, "Loading documents"));
        let (documents, load_report) = load_documents(&working_copy, &self.config.loader).await?;
        if documents.is_empty() {
            return Err(RagError::EmptyRepository);
        }

        let chunks: Vec<_> = documents
            .iter()
            .flat_map(|doc| chunk_document(doc, &chunker))
            .collect();
        if chunks.is_empty() {
            return Err(RagError::EmptyRepository);
        }

        reporter.report(ProgressEvent::new(
            IngestStage::Loading,
            50,
            format!(
                "Embedding {} chunks from {} documents ({} skipped)",
                format_number(chunks.len() as u64),
                format_number(documents.len() as u64),
                format_number(load_report.skipped.len() as u64)
            ),
        ));
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let vectors = embed_all(embedder.as_ref(), &texts, self.config.embedding.batch_size).await?;

        reporter.report(ProgressEvent::new(IngestStage::Loading, 85, "Writing index"));
        let meta = IndexMeta::new(embedder.tag(), &repository, &working_copy, documents.len());
        let chunk_count = chunks.len();
        let index = VectorIndex::build(meta, chunks, vectors)?;
        index.persist(&self.config.data.index_path).await?;

        let active = ActiveIndex::new(index, embedder)?;
        self.active.store(Some(Arc::new(active)));

        Ok(IngestReport {
            success: true,
            message: "Repository ingested successfully".to_string(),
            repository,
            documents: documents.len(),
            chunks: chunk_count,
            code: None,
        })
    }

    fn current(&self) -> Result<Arc<ActiveIndex>> {
        self.active.load_full().ok_or(RagError::NoIndexLoaded)
    }

    /// Ranked matches without generation. `k` defaults to `retrieval.k`.
    pub async fn search(&self, query: &str, k: Option<usize>) -> Result<Vec<SearchHit>> {
        let active = self.current()?;
        active.search(query, k.unwrap_or(self.config.retrieval.k)).await
    }

    /// Retrieved and assembled context for `question`, including the
    /// deep-read excerpt when the question asks for a full file.
    pub async fn context_for(&self, question: &str) -> Result<RetrievedContext> {
        let active = self.current()?;
        self.prepare_context(&active, question).await
    }

    async fn prepare_context(&self, active: &ActiveIndex, question: &str) -> Result<RetrievedContext> {
        let retrieval = &self.config.retrieval;
        let mut retrieved = active.retrieve(question, retrieval).await?;

        if retrieved.is_empty() || !prompt::wants_full_file(question) {
            return Ok(retrieved);
        }
        if let Some(top) = retrieved.sources.first().cloned() {
            let root = &active.index().meta().working_copy;
            match prompt::read_excerpt(root, &top, retrieval.deep_read_chars).await {
                Ok(excerpt) => {
                    tracing::debug!(path = %top, chars = excerpt.chars().count(), "deep read");
                    retrieved
                        .context
                        .push_str(&prompt::full_file_block(&top, &excerpt));
                }
                Err(e) => tracing::debug!(path = %top, error = %e, "deep read skipped"),
            }
        }
        Ok(retrieved)
    }

    /// Answer `question` in one response.
    pub async fn chat(&self, question: &str) -> Result<ChatAnswer> {
        let active = self.current()?;
        let retrieved = self.prepare_context(&active, question).await?;
        if retrieved.is_empty() {
            return Err(RagError::NoRelevantContext);
        }

        let prompt = prompt::compose(question, &retrieved.context);
        let answer = self.generator.generate(&prompt).await?;
        Ok(ChatAnswer {
            answer,
            sources: retrieved.sources,
        })
    }

    /// Answer `question` as a stream of [`ChatEvent`]s.
    ///
    /// Fails before producing any event when no index is loaded or
    /// retrieval itself fails.
    pub async fn chat_stream(&self, question: &str) -> Result<ChatEventStream> {
        let active = self.current()?;
        let retrieved = self.prepare_context(&active, question).await?;

        let head = stream::once(futures::future::ready(ChatEvent::Sources(
            retrieved.sources.clone(),
        )));
        if retrieved.is_empty() {
            let tail = stream::once(futures::future::ready(ChatEvent::error(
                &RagError::NoRelevantContext,
            )));
            return Ok(Box::pin(head.chain(tail)));
        }

        let prompt = prompt::compose(question, &retrieved.context);
        let generator = self.generator.clone();
        let tail = stream::unfold(Phase::Start(prompt), move |phase| {
            let generator = generator.clone();
            async move {
                match phase {
                    Phase::Start(prompt) => match generator.generate_stream(&prompt).await {
                        Ok(tokens) => next_event(tokens).await,
                        Err(e) => Some((ChatEvent::error(&e), Phase::Finished)),
                    },
                    Phase::Streaming(tokens) => next_event(tokens).await,
                    Phase::Finished => None,
                }
            }
        });
        Ok(Box::pin(head.chain(tail)))
    }

    pub fn status(&self) -> IndexStatus {
        match self.active.load_full() {
            Some(active) => {
                let index = active.index();
                let meta = index.meta();
                IndexStatus {
                    loaded: true,
                    repository: Some(meta.repository.clone()),
                    chunks: Some(index.len()),
                    documents: Some(meta.document_count),
                    backend: Some(meta.tag.to_string()),
                    built_at: Some(meta.created_at.to_rfc3339()),
                    build_id: Some(meta.build_id.to_string()),
                }
            }
            None => IndexStatus::default(),
        }
    }

    pub async fn health(&self) -> HealthReport {
        let generation = self.generator.health().await;
        HealthReport {
            status: if generation.reachable { "healthy" } else { "degraded" },
            version: env!("CARGO_PKG_VERSION"),
            generation,
            index: self.status(),
        }
    }
}

enum Phase {
    Start(Prompt),
    Streaming(TokenStream),
    Finished,
}

async fn next_event(mut tokens: TokenStream) -> Option<(ChatEvent, Phase)> {
    match tokens.next().await {
        Some(Ok(token)) => Some((ChatEvent::Token(token), Phase::Streaming(tokens))),
        Some(Err(e)) => Some((ChatEvent::error(&e), Phase::Finished)),
        None => Some((ChatEvent::Done, Phase::Finished)),
    }
}
