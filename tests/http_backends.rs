//! Remote embedding and chat-completions clients against mock HTTP servers.

use futures::StreamExt;
use repochat::config::{BackendKind, GenerationConfig, RemoteEmbeddingApi, RemoteEmbeddingConfig};
use repochat::embedding::{Embedder, RemoteEmbedder};
use repochat::error::RagError;
use repochat::generate::{ChatCompletionsGenerator, Generator};
use repochat::prompt;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn texts(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn remote_config(server: &MockServer, api: RemoteEmbeddingApi, env_var: &str) -> RemoteEmbeddingConfig {
    RemoteEmbeddingConfig {
        api,
        url: match api {
            RemoteEmbeddingApi::Huggingface => format!("{}/models", server.uri()),
            RemoteEmbeddingApi::Openai => format!("{}/v1", server.uri()),
        },
        model: "sentence-transformers/test-model".to_string(),
        api_key_env: env_var.to_string(),
        max_retries: 0,
        timeout_secs: 5,
    }
}

fn generation_config(server: &MockServer, provider: BackendKind, env_var: &str) -> GenerationConfig {
    GenerationConfig {
        provider,
        base_url: Some(format!("{}/v1", server.uri())),
        model: "test-model".to_string(),
        api_key_env: env_var.to_string(),
        timeout_secs: 5,
        ..GenerationConfig::default()
    }
}

// ============ Remote embeddings ============

#[tokio::test]
async fn huggingface_feature_extraction() {
    std::env::set_var("REPOCHAT_TEST_HF_TOKEN_A", "hf-secret");
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(
            "/models/sentence-transformers/test-model/pipeline/feature-extraction",
        ))
        .and(header("authorization", "Bearer hf-secret"))
        .and(body_partial_json(serde_json::json!({
            "inputs": ["fn main() {}", "let x = 1;"],
            "options": { "wait_for_model": true }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
            [0.5, 0.25, 1.0],
            [1.0, 0.0, -1.0]
        ])))
        .expect(1)
        .mount(&server)
        .await;

    let config = remote_config(&server, RemoteEmbeddingApi::Huggingface, "REPOCHAT_TEST_HF_TOKEN_A");
    let embedder = RemoteEmbedder::new(&config, reqwest::Client::new());
    let vectors = embedder
        .embed(&texts(&["fn main() {}", "let x = 1;"]))
        .await
        .unwrap();
    assert_eq!(vectors, vec![vec![0.5, 0.25, 1.0], vec![1.0, 0.0, -1.0]]);
    assert_eq!(embedder.tag().kind, BackendKind::Remote);
}

#[tokio::test]
async fn openai_embeddings_keep_input_order() {
    std::env::set_var("REPOCHAT_TEST_OPENAI_TOKEN_B", "sk-test");
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/embeddings"))
        .and(body_partial_json(serde_json::json!({
            "model": "sentence-transformers/test-model"
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "data": [
                { "index": 1, "embedding": [0.0, 1.0] },
                { "index": 0, "embedding": [1.0, 0.0] }
            ]
        })))
        .mount(&server)
        .await;

    let config = remote_config(&server, RemoteEmbeddingApi::Openai, "REPOCHAT_TEST_OPENAI_TOKEN_B");
    let embedder = RemoteEmbedder::new(&config, reqwest::Client::new());
    let vectors = embedder.embed(&texts(&["first", "second"])).await.unwrap();
    assert_eq!(vectors, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
}

#[tokio::test]
async fn client_errors_are_not_retried() {
    std::env::set_var("REPOCHAT_TEST_HF_TOKEN_C", "hf-secret");
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(401).set_body_string("invalid token"))
        .expect(1)
        .mount(&server)
        .await;

    let mut config = remote_config(&server, RemoteEmbeddingApi::Huggingface, "REPOCHAT_TEST_HF_TOKEN_C");
    config.max_retries = 3;
    let embedder = RemoteEmbedder::new(&config, reqwest::Client::new());
    let err = embedder.embed(&texts(&["x"])).await.unwrap_err();
    match err {
        RagError::EmbeddingBackendUnavailable(msg) => assert!(msg.contains("invalid token")),
        other => panic!("unexpected error: {:?}", other),
    }
}

#[tokio::test]
async fn server_errors_are_retried() {
    std::env::set_var("REPOCHAT_TEST_HF_TOKEN_D", "hf-secret");
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503).set_body_string("loading"))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([[1.0, 2.0]])))
        .expect(1)
        .mount(&server)
        .await;

    let mut config = remote_config(&server, RemoteEmbeddingApi::Huggingface, "REPOCHAT_TEST_HF_TOKEN_D");
    config.max_retries = 1;
    let embedder = RemoteEmbedder::new(&config, reqwest::Client::new());
    let vectors = embedder.embed(&texts(&["x"])).await.unwrap();
    assert_eq!(vectors, vec![vec![1.0, 2.0]]);
}

// ============ Chat completions ============

#[tokio::test]
async fn generate_returns_first_choice() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_partial_json(serde_json::json!({
            "model": "test-model",
            "stream": false
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "choices": [{ "index": 0, "message": { "role": "assistant", "content": "It prints hello." } }]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let config = generation_config(&server, BackendKind::Local, "UNUSED");
    let generator = ChatCompletionsGenerator::new(&config, reqwest::Client::new());
    let answer = generator
        .generate(&prompt::compose("What does it print?", "print('hello')"))
        .await
        .unwrap();
    assert_eq!(answer, "It prints hello.");
}

#[tokio::test]
async fn remote_provider_sends_credential() {
    std::env::set_var("REPOCHAT_TEST_GEN_TOKEN_E", "gen-secret");
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("authorization", "Bearer gen-secret"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "choices": [{ "message": { "content": "ok" } }]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let config = generation_config(&server, BackendKind::Remote, "REPOCHAT_TEST_GEN_TOKEN_E");
    let generator = ChatCompletionsGenerator::new(&config, reqwest::Client::new());
    let answer = generator.generate(&prompt::compose("q", "c")).await.unwrap();
    assert_eq!(answer, "ok");
}

#[tokio::test]
async fn backend_error_status_is_generation_failure() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500).set_body_string("model crashed"))
        .mount(&server)
        .await;

    let config = generation_config(&server, BackendKind::Local, "UNUSED");
    let generator = ChatCompletionsGenerator::new(&config, reqwest::Client::new());
    let err = generator.generate(&prompt::compose("q", "c")).await.unwrap_err();
    assert_eq!(err.code(), "generation_failure");
    assert!(err.to_string().contains("model crashed"));
}

#[tokio::test]
async fn stream_yields_tokens_until_done() {
    let body = concat!(
        "data: {\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\"}}]}\n\n",
        "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Hello\"}}]}\n\n",
        "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\", world\"}}]}\n\n",
        "data: [DONE]\n\n",
    );
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_partial_json(serde_json::json!({ "stream": true })))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .mount(&server)
        .await;

    let config = generation_config(&server, BackendKind::Local, "UNUSED");
    let generator = ChatCompletionsGenerator::new(&config, reqwest::Client::new());
    let tokens: Vec<_> = generator
        .generate_stream(&prompt::compose("q", "c"))
        .await
        .unwrap()
        .collect()
        .await;
    let tokens: Vec<String> = tokens.into_iter().map(|t| t.unwrap()).collect();
    assert_eq!(tokens, vec!["Hello", ", world"]);
}

#[tokio::test]
async fn malformed_stream_ends_with_error() {
    let body = concat!(
        "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Partial\"}}]}\n\n",
        "data: {truncated\n\n",
        "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"never\"}}]}\n\n",
    );
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .mount(&server)
        .await;

    let config = generation_config(&server, BackendKind::Local, "UNUSED");
    let generator = ChatCompletionsGenerator::new(&config, reqwest::Client::new());
    let items: Vec<_> = generator
        .generate_stream(&prompt::compose("q", "c"))
        .await
        .unwrap()
        .collect()
        .await;
    assert_eq!(items.len(), 2);
    assert_eq!(items[0].as_ref().unwrap(), "Partial");
    assert!(matches!(items[1], Err(RagError::Generation(_))));
}

#[tokio::test]
async fn health_checks_models_endpoint() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/models"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "data": [] })))
        .mount(&server)
        .await;

    let config = generation_config(&server, BackendKind::Local, "UNUSED");
    let generator = ChatCompletionsGenerator::new(&config, reqwest::Client::new());
    let health = generator.health().await;
    assert!(health.reachable);
    assert!(health.error.is_none());
    assert_eq!(health.model, "test-model");
}

#[tokio::test]
async fn health_reports_unreachable_backend() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let config = generation_config(&server, BackendKind::Local, "UNUSED");
    let generator = ChatCompletionsGenerator::new(&config, reqwest::Client::new());
    let health = generator.health().await;
    assert!(!health.reachable);
    assert!(health.error.unwrap().contains("503"));
}

#[tokio::test]
async fn stream_times_out_waiting_for_response_head() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw("data: [DONE]\n\n", "text/event-stream")
                .set_delay(std::time::Duration::from_secs(3)),
        )
        .mount(&server)
        .await;

    let mut config = generation_config(&server, BackendKind::Local, "UNUSED");
    config.timeout_secs = 1;
    let generator = ChatCompletionsGenerator::new(&config, reqwest::Client::new());
    match generator.generate_stream(&prompt::compose("q", "c")).await {
        Ok(_) => panic!("expected a timeout"),
        Err(e) => assert_eq!(e.code(), "timeout"),
    }
}

/// Serves one SSE response whose body pauses between two writes.
async fn slow_stream_server(first: &'static str, rest: &'static str, pause: std::time::Duration) -> String {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();

        // Read the whole request before answering.
        let mut request = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = socket.read(&mut buf).await.unwrap();
            request.extend_from_slice(&buf[..n]);
            let text = String::from_utf8_lossy(&request).to_string();
            if let Some(head_end) = text.find("\r\n\r\n") {
                let content_length = text[..head_end]
                    .lines()
                    .find_map(|l| {
                        let (name, value) = l.split_once(':')?;
                        name.eq_ignore_ascii_case("content-length")
                            .then(|| value.trim().parse::<usize>().ok())?
                    })
                    .unwrap_or(0);
                if request.len() >= head_end + 4 + content_length {
                    break;
                }
            }
            if n == 0 {
                break;
            }
        }

        let head = "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\nconnection: close\r\n\r\n";
        socket.write_all(head.as_bytes()).await.unwrap();
        socket.write_all(first.as_bytes()).await.unwrap();
        socket.flush().await.unwrap();
        tokio::time::sleep(pause).await;
        socket.write_all(rest.as_bytes()).await.unwrap();
        socket.shutdown().await.unwrap();
    });
    format!("http://{}/v1", addr)
}

#[tokio::test]
async fn stream_may_outlast_the_request_timeout() {
    let base_url = slow_stream_server(
        "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Slow\"}}]}\n\n",
        "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\" answer\"}}]}\n\ndata: [DONE]\n\n",
        std::time::Duration::from_millis(2500),
    )
    .await;

    let config = GenerationConfig {
        provider: BackendKind::Local,
        base_url: Some(base_url),
        model: "test-model".to_string(),
        timeout_secs: 1,
        ..GenerationConfig::default()
    };
    let generator = ChatCompletionsGenerator::new(&config, reqwest::Client::new());
    let items: Vec<_> = generator
        .generate_stream(&prompt::compose("q", "c"))
        .await
        .unwrap()
        .collect()
        .await;
    let tokens: Vec<String> = items.into_iter().map(|t| t.unwrap()).collect();
    assert_eq!(tokens, vec!["Slow", " answer"]);
}
