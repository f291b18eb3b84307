//! Answer generation over OpenAI-compatible chat-completions endpoints.
//!
//! | Provider | Default base URL | Credential |
//! |----------|------------------|------------|
//! | `local` | `http://127.0.0.1:1234/v1` (LM Studio) | none |
//! | `remote` | `https://router.huggingface.co/v1` | env var named by `generation.api_key_env` |
//!
//! `generation.timeout_secs` bounds a whole non-streaming exchange, but only
//! the wait for the response head of a streaming one.
//!
//! Streaming responses are parsed as server-sent events. `[DONE]` ends the
//! stream normally; any transport or parse failure ends it with a final
//! `Err` item so consumers can tell an aborted answer from a complete one.

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::stream::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{BackendKind, GenerationConfig};
use crate::error::{RagError, Result};
use crate::prompt::Prompt;

/// Incremental answer text. Ends after the last token, or after one `Err`.
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

const HEALTH_TIMEOUT: Duration = Duration::from_secs(10);

/// Which backend answers, for status output.
#[derive(Debug, Clone, Serialize)]
pub struct GeneratorInfo {
    pub provider: BackendKind,
    pub model: String,
    pub base_url: String,
}

/// Reachability of a generation backend.
#[derive(Debug, Clone, Serialize)]
pub struct BackendHealth {
    pub reachable: bool,
    pub provider: BackendKind,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[async_trait]
pub trait Generator: Send + Sync {
    fn describe(&self) -> GeneratorInfo;

    /// Complete answer in one response.
    async fn generate(&self, prompt: &Prompt) -> Result<String>;

    /// Answer as a stream of text deltas.
    async fn generate_stream(&self, prompt: &Prompt) -> Result<TokenStream>;

    /// Reachability check with no side effects.
    async fn health(&self) -> BackendHealth;
}

/// Build the configured generator.
pub fn create_generator(config: &GenerationConfig, client: reqwest::Client) -> Arc<dyn Generator> {
    Arc::new(ChatCompletionsGenerator::new(config, client))
}

pub struct ChatCompletionsGenerator {
    provider: BackendKind,
    base_url: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
    api_key_env: String,
    timeout: Duration,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
    stream: bool,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Option<StreamDelta>,
}

#[derive(Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

impl ChatCompletionsGenerator {
    pub fn new(config: &GenerationConfig, client: reqwest::Client) -> Self {
        Self {
            provider: config.provider,
            base_url: config.resolved_base_url(),
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            api_key_env: config.api_key_env.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
            client,
        }
    }

    /// Credential for remote providers. Local servers get none.
    fn api_key(&self) -> Result<Option<String>> {
        match self.provider {
            BackendKind::Local => Ok(None),
            BackendKind::Remote => match std::env::var(&self.api_key_env) {
                Ok(key) if !key.trim().is_empty() => Ok(Some(key)),
                _ => Err(RagError::GenerationCredentialMissing {
                    env_var: self.api_key_env.clone(),
                }),
            },
        }
    }

    async fn send(&self, prompt: &Prompt, stream: bool) -> Result<reqwest::Response> {
        let api_key = self.api_key()?;
        let url = format!("{}/chat/completions", self.base_url);
        let body = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &prompt.system,
                },
                ChatMessage {
                    role: "user",
                    content: &prompt.user,
                },
            ],
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            stream,
        };

        // A streamed answer may run past the timeout; only waiting for the
        // response head is bounded then.
        let mut request = self.client.post(&url).json(&body);
        if !stream {
            request = request.timeout(self.timeout);
        }
        if let Some(key) = api_key {
            request = request.bearer_auth(key);
        }

        let timed_out = || RagError::Timeout {
            operation: "generation request",
            after: self.timeout,
        };
        let response = match tokio::time::timeout(self.timeout, request.send()).await {
            Ok(result) => result.map_err(|e| {
                if e.is_timeout() {
                    timed_out()
                } else {
                    RagError::Generation(format!("could not reach {}: {}", url, e))
                }
            })?,
            Err(_) => return Err(timed_out()),
        };

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(RagError::Generation(format!(
                "chat completions API returned {}: {}",
                status,
                text.trim()
            )));
        }
        Ok(response)
    }
}

#[async_trait]
impl Generator for ChatCompletionsGenerator {
    fn describe(&self) -> GeneratorInfo {
        GeneratorInfo {
            provider: self.provider,
            model: self.model.clone(),
            base_url: self.base_url.clone(),
        }
    }

    async fn generate(&self, prompt: &Prompt) -> Result<String> {
        let response = self.send(prompt, false).await?;
        let parsed: ChatResponse = response.json().await.map_err(|e| {
            if e.is_timeout() {
                RagError::Timeout {
                    operation: "generation request",
                    after: self.timeout,
                }
            } else {
                RagError::Generation(format!("invalid chat completions response: {}", e))
            }
        })?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| RagError::Generation("response contained no answer".to_string()))
    }

    async fn generate_stream(&self, prompt: &Prompt) -> Result<TokenStream> {
        let response = self.send(prompt, true).await?;
        tracing::debug!(model = %self.model, "streaming answer");
        Ok(sse_to_token_stream(response))
    }

    async fn health(&self) -> BackendHealth {
        let mut health = BackendHealth {
            reachable: false,
            provider: self.provider,
            model: self.model.clone(),
            error: None,
        };

        let api_key = match self.api_key() {
            Ok(key) => key,
            Err(e) => {
                health.error = Some(e.to_string());
                return health;
            }
        };

        let mut request = self
            .client
            .get(format!("{}/models", self.base_url))
            .timeout(HEALTH_TIMEOUT.min(self.timeout));
        if let Some(key) = api_key {
            request = request.bearer_auth(key);
        }

        match request.send().await {
            Ok(resp) if resp.status().is_success() => health.reachable = true,
            Ok(resp) => health.error = Some(format!("models endpoint returned {}", resp.status())),
            Err(e) => health.error = Some(e.to_string()),
        }
        health
    }
}

/// Convert a chat-completions SSE response into a [`TokenStream`].
fn sse_to_token_stream(response: reqwest::Response) -> TokenStream {
    let events = Box::pin(response.bytes_stream().eventsource());

    let stream = futures::stream::unfold(Some(events), |state| async move {
        let mut events = state?;
        loop {
            match events.next().await {
                None => return None,
                Some(Ok(event)) => match parse_stream_data(&event.data) {
                    StreamItem::Done => return None,
                    StreamItem::Skip => continue,
                    StreamItem::Token(token) => return Some((Ok(token), Some(events))),
                    StreamItem::Failed(err) => return Some((Err(err), None)),
                },
                Some(Err(e)) => {
                    let err = RagError::Generation(format!("answer stream interrupted: {}", e));
                    return Some((Err(err), None));
                }
            }
        }
    });
    Box::pin(stream)
}

#[derive(Debug)]
enum StreamItem {
    Token(String),
    Skip,
    Done,
    Failed(RagError),
}

fn parse_stream_data(data: &str) -> StreamItem {
    let data = data.trim();
    if data == "[DONE]" {
        return StreamItem::Done;
    }
    if data.is_empty() {
        return StreamItem::Skip;
    }

    match serde_json::from_str::<StreamChunk>(data) {
        Ok(chunk) => {
            if let Some(error) = chunk.error {
                return StreamItem::Failed(RagError::Generation(format!(
                    "backend reported an error mid-stream: {}",
                    error
                )));
            }
            let content = chunk
                .choices
                .into_iter()
                .next()
                .and_then(|c| c.delta)
                .and_then(|d| d.content)
                .unwrap_or_default();
            if content.is_empty() {
                StreamItem::Skip
            } else {
                StreamItem::Token(content)
            }
        }
        Err(e) => StreamItem::Failed(RagError::Generation(format!(
            "failed to parse stream data: {}",
            e
        ))),
    }
}
