//! Remote embedding endpoint client.
//!
//! Retry strategy:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors and timeouts → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use async_trait::async_trait;
use std::time::Duration;

use super::{BackendTag, Embedder};
use crate::config::{BackendKind, RemoteEmbeddingApi, RemoteEmbeddingConfig};
use crate::error::{RagError, Result};

/// Embedder that calls a network inference endpoint.
///
/// The credential is read from the configured environment variable at call
/// time, so a missing token surfaces as
/// [`RagError::EmbeddingCredentialMissing`] on the operation that needed it.
pub struct RemoteEmbedder {
    config: RemoteEmbeddingConfig,
    client: reqwest::Client,
}

impl RemoteEmbedder {
    pub fn new(config: &RemoteEmbeddingConfig, client: reqwest::Client) -> Self {
        Self {
            config: config.clone(),
            client,
        }
    }

    fn api_key(&self) -> Result<String> {
        match std::env::var(&self.config.api_key_env) {
            Ok(key) if !key.trim().is_empty() => Ok(key),
            _ => Err(RagError::EmbeddingCredentialMissing {
                env_var: self.config.api_key_env.clone(),
            }),
        }
    }

    fn endpoint(&self) -> String {
        let base = self.config.url.trim_end_matches('/');
        match self.config.api {
            RemoteEmbeddingApi::Huggingface => format!(
                "{}/{}/pipeline/feature-extraction",
                base, self.config.model
            ),
            RemoteEmbeddingApi::Openai => format!("{}/embeddings", base),
        }
    }

    fn request_body(&self, texts: &[String]) -> serde_json::Value {
        match self.config.api {
            RemoteEmbeddingApi::Huggingface => serde_json::json!({
                "inputs": texts,
                "options": { "wait_for_model": true },
            }),
            RemoteEmbeddingApi::Openai => serde_json::json!({
                "model": self.config.model,
                "input": texts,
            }),
        }
    }
}

#[async_trait]
impl Embedder for RemoteEmbedder {
    fn tag(&self) -> BackendTag {
        BackendTag {
            kind: BackendKind::Remote,
            model: self.config.model.clone(),
        }
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let api_key = self.api_key()?;
        let url = self.endpoint();
        let body = self.request_body(texts);
        let timeout = Duration::from_secs(self.config.timeout_secs);

        let mut last_err = None;

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                // Exponential backoff: 1s, 2s, 4s, 8s, ...
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .post(&url)
                .timeout(timeout)
                .bearer_auth(&api_key)
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value = response.json().await.map_err(|e| {
                            RagError::EmbeddingBackendUnavailable(format!(
                                "invalid response body: {}",
                                e
                            ))
                        })?;
                        return match self.config.api {
                            RemoteEmbeddingApi::Huggingface => parse_feature_extraction(&json),
                            RemoteEmbeddingApi::Openai => parse_openai_response(&json),
                        };
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    let err = RagError::EmbeddingBackendUnavailable(format!(
                        "embedding API error {}: {}",
                        status,
                        body_text.trim()
                    ));

                    // Rate limited or server error, retry
                    if status.as_u16() == 429 || status.is_server_error() {
                        tracing::warn!(attempt, %status, "embedding request failed, retrying");
                        last_err = Some(err);
                        continue;
                    }
                    return Err(err);
                }
                Err(e) if e.is_timeout() => {
                    tracing::warn!(attempt, "embedding request timed out");
                    last_err = Some(RagError::Timeout {
                        operation: "embedding request",
                        after: timeout,
                    });
                }
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "embedding request failed");
                    last_err = Some(RagError::EmbeddingBackendUnavailable(format!(
                        "could not reach {}: {}",
                        url, e
                    )));
                }
            }
        }

        Err(last_err.unwrap_or_else(|| {
            RagError::EmbeddingBackendUnavailable("embedding failed after retries".to_string())
        }))
    }
}

/// Parse a `feature-extraction` response: one vector per input, or one
/// matrix of token vectors per input (mean-pooled here).
fn parse_feature_extraction(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let rows = json.as_array().ok_or_else(|| malformed("expected a JSON array"))?;

    rows.iter()
        .map(|row| {
            let values = row.as_array().ok_or_else(|| malformed("expected nested arrays"))?;
            if values.first().is_some_and(|v| v.is_array()) {
                let tokens = values
                    .iter()
                    .map(number_array)
                    .collect::<Result<Vec<_>>>()?;
                mean_pool(&tokens)
            } else {
                number_array(row)
            }
        })
        .collect()
}

/// Parse an OpenAI embeddings response, ordering vectors by `index`.
fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| malformed("missing data array"))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (position, item) in data.iter().enumerate() {
        let embedding = item
            .get("embedding")
            .ok_or_else(|| malformed("missing embedding"))?;
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(position);
        indexed.push((index, number_array(embedding)?));
    }

    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

fn number_array(value: &serde_json::Value) -> Result<Vec<f32>> {
    value
        .as_array()
        .ok_or_else(|| malformed("expected an array of numbers"))?
        .iter()
        .map(|v| {
            v.as_f64()
                .map(|f| f as f32)
                .ok_or_else(|| malformed("non-numeric vector component"))
        })
        .collect()
}

fn mean_pool(tokens: &[Vec<f32>]) -> Result<Vec<f32>> {
    let dims = tokens.first().map(|t| t.len()).unwrap_or(0);
    if dims == 0 || tokens.iter().any(|t| t.len() != dims) {
        return Err(malformed("ragged token embeddings"));
    }
    let mut pooled = vec![0.0f32; dims];
    for token in tokens {
        for (acc, v) in pooled.iter_mut().zip(token) {
            *acc += v;
        }
    }
    let n = tokens.len() as f32;
    pooled.iter_mut().for_each(|v| *v /= n);
    Ok(pooled)
}

fn malformed(detail: &str) -> RagError {
    RagError::EmbeddingBackendUnavailable(format!("malformed embedding response: {}", detail))
}
