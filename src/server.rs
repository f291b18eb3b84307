//! HTTP server.
//!
//! Exposes ingestion, retrieval, and chat over a JSON HTTP API. Long
//! running operations can stream their output as server-sent events.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/repos/ingest` | Ingest a repository (`?stream=true` streams progress) |
//! | `GET`  | `/repos/status` | Summary of the served index |
//! | `POST` | `/chat` | Answer a question (`"stream": true` streams events) |
//! | `POST` | `/search` | Ranked chunk matches without generation |
//! | `GET`  | `/health` | Version, index summary, generation backend reachability |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "no_index_loaded", "message": "no repository has been indexed yet; ..." } }
//! ```
//!
//! A failed non-streaming ingestion also carries the report fields
//! (`success`, `message`, `repository`, `documents`, `chunks`, `code`)
//! beside `error`.
//!
//! Codes are the pipeline error codes plus `bad_request`. Status mapping:
//! 400 for request, configuration, and repository problems, 401 for a
//! missing credential, 404 for `no_relevant_context`, 409 for
//! `no_index_loaded`, 502 for generation failures, 503 for an unavailable
//! embedding backend, 504 for timeouts, and 500 otherwise.
//!
//! # Streaming
//!
//! Chat streams carry one JSON [`ChatEvent`] per SSE `data` line:
//!
//! ```text
//! data: {"type":"sources","data":["src/app.py"]}
//! data: {"type":"token","data":"The "}
//! data: {"type":"done"}
//! ```
//!
//! Ingest streams carry one JSON [`ProgressEvent`] per line, ending with a
//! `complete` or `error` event that holds the final report.
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted so browser front ends
//! can call the API directly.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::config::BackendKind;
use crate::engine::{ChatEvent, HealthReport, IndexStatus, RagEngine};
use crate::error::RagError;
use crate::models::{ChatAnswer, IngestReport, SearchHit};
use crate::progress::{ChannelProgress, ProgressEvent};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
struct AppState {
    engine: Arc<RagEngine>,
}

/// Build the router without binding a socket.
pub fn router(engine: Arc<RagEngine>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/repos/ingest", post(handle_ingest))
        .route("/repos/status", get(handle_status))
        .route("/chat", post(handle_chat))
        .route("/search", post(handle_search))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(AppState { engine })
}

/// Serve the API on `[server].bind` until the process is terminated.
pub async fn run_server(engine: Arc<RagEngine>) -> anyhow::Result<()> {
    let bind_addr = engine.config().server.bind.clone();
    let app = router(engine);

    println!("RepoChat server listening on http://{}", bind_addr);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

/// HTTP status for a pipeline error code.
fn status_for_code(code: &str) -> StatusCode {
    match code {
        "config" | "chunking_config" | "empty_repository" | "acquisition_failure" | "load_failure" => {
            StatusCode::BAD_REQUEST
        }
        "embedding_credential_missing" | "generation_credential_missing" => StatusCode::UNAUTHORIZED,
        "no_relevant_context" => StatusCode::NOT_FOUND,
        "no_index_loaded" => StatusCode::CONFLICT,
        "generation_failure" => StatusCode::BAD_GATEWAY,
        "embedding_backend_unavailable" | "model_load_failure" => StatusCode::SERVICE_UNAVAILABLE,
        "timeout" => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<RagError> for AppError {
    fn from(err: RagError) -> Self {
        let code = err.code();
        let status = status_for_code(code);
        if status.is_server_error() {
            tracing::warn!(code, transient = err.is_transient(), error = %err, "request failed");
        }
        AppError {
            status,
            code: code.to_string(),
            message: err.to_string(),
        }
    }
}

/// Serialize `value` as the `data` line of an SSE event.
fn json_event<T: Serialize>(value: &T) -> Event {
    match serde_json::to_string(value) {
        Ok(data) => Event::default().data(data),
        Err(e) => {
            tracing::error!(error = %e, "failed to serialize stream event");
            Event::default().event("error").data(e.to_string())
        }
    }
}

// ============ POST /repos/ingest ============

#[derive(Deserialize)]
struct IngestRequest {
    url: String,
    #[serde(default)]
    backend: Option<BackendKind>,
}

#[derive(Deserialize, Default)]
struct IngestParams {
    #[serde(default)]
    stream: bool,
}

async fn handle_ingest(
    State(state): State<AppState>,
    Query(params): Query<IngestParams>,
    Json(req): Json<IngestRequest>,
) -> Result<Response, AppError> {
    let url = req.url.trim().to_string();
    if url.is_empty() {
        return Err(bad_request("url must not be empty"));
    }

    if params.stream {
        return Ok(Sse::new(ingest_progress_stream(state.engine, url, req.backend))
            .keep_alive(KeepAlive::default())
            .into_response());
    }

    let report = state.engine.ingest(&url, req.backend).await;
    if report.success {
        Ok(Json(report).into_response())
    } else {
        Ok(failed_ingest(report).into_response())
    }
}

/// A failed report keeps its own fields next to the usual `error` object.
#[derive(Serialize)]
struct FailedIngestBody {
    #[serde(flatten)]
    report: IngestReport,
    error: ErrorDetail,
}

fn failed_ingest(report: IngestReport) -> (StatusCode, Json<FailedIngestBody>) {
    let code = report
        .code
        .clone()
        .unwrap_or_else(|| "internal".to_string());
    let body = FailedIngestBody {
        error: ErrorDetail {
            code: code.clone(),
            message: report.message.clone(),
        },
        report,
    };
    (status_for_code(&code), Json(body))
}

/// Run the ingestion on its own task and forward its progress events.
///
/// The task keeps running when the client disconnects; the stream ends
/// once the terminal event has been sent.
fn ingest_progress_stream(
    engine: Arc<RagEngine>,
    url: String,
    backend: Option<BackendKind>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    let (reporter, rx) = ChannelProgress::new();
    tokio::spawn(async move {
        engine.ingest_with_progress(&url, backend, &reporter).await;
    });

    stream::unfold(rx, |mut rx| async move {
        let event: ProgressEvent = rx.recv().await?;
        Some((Ok(json_event(&event)), rx))
    })
}

// ============ GET /repos/status ============

async fn handle_status(State(state): State<AppState>) -> Json<IndexStatus> {
    Json(state.engine.status())
}

// ============ POST /chat ============

#[derive(Deserialize)]
struct ChatRequest {
    question: String,
    #[serde(default)]
    stream: bool,
}

async fn handle_chat(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> Result<Response, AppError> {
    let question = req.question.trim();
    if question.is_empty() {
        return Err(bad_request("question must not be empty"));
    }

    if req.stream {
        let events = state.engine.chat_stream(question).await?;
        let sse = events.map(|event: ChatEvent| Ok::<_, Infallible>(json_event(&event)));
        return Ok(Sse::new(sse).keep_alive(KeepAlive::default()).into_response());
    }

    let answer: ChatAnswer = state.engine.chat(question).await?;
    Ok(Json(answer).into_response())
}

// ============ POST /search ============

#[derive(Deserialize)]
struct SearchRequest {
    query: String,
    #[serde(default)]
    k: Option<usize>,
}

#[derive(Serialize)]
struct SearchResponse {
    results: Vec<SearchHit>,
    count: usize,
}

async fn handle_search(
    State(state): State<AppState>,
    Json(req): Json<SearchRequest>,
) -> Result<Json<SearchResponse>, AppError> {
    if req.query.trim().is_empty() {
        return Err(bad_request("query must not be empty"));
    }
    if req.k == Some(0) {
        return Err(bad_request("k must be >= 1"));
    }

    let results = state.engine.search(&req.query, req.k).await?;
    Ok(Json(SearchResponse {
        count: results.len(),
        results,
    }))
}

// ============ GET /health ============

async fn handle_health(State(state): State<AppState>) -> Json<HealthReport> {
    Json(state.engine.health().await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_failures_map_to_distinct_statuses() {
        let status = |err: RagError| AppError::from(err).status;
        assert_eq!(status(RagError::NoIndexLoaded), StatusCode::CONFLICT);
        assert_eq!(status(RagError::NoRelevantContext), StatusCode::NOT_FOUND);
        assert_eq!(
            status(RagError::Generation("down".into())),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            status(RagError::GenerationCredentialMissing {
                env_var: "HF_TOKEN".into()
            }),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            status(RagError::Internal("boom".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn failed_ingest_uses_report_code() {
        let report = IngestReport {
            code: Some("empty_repository".to_string()),
            ..IngestReport::failed("tiny", "no readable documents found in repository")
        };
        let (status, Json(body)) = failed_ingest(report);
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["repository"], "tiny");
        assert_eq!(json["documents"], 0);
        assert_eq!(json["chunks"], 0);
        assert_eq!(json["message"], "no readable documents found in repository");
        assert_eq!(json["error"]["code"], "empty_repository");
        assert_eq!(
            json["error"]["message"],
            "no readable documents found in repository"
        );
    }

    #[test]
    fn failed_ingest_without_code_is_internal() {
        let (status, Json(body)) = failed_ingest(IngestReport::failed("tiny", "boom"));
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body.error.code, "internal");
    }
}
