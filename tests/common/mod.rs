//! Shared test fixtures: a scripted stub upstream and state builders.
#![allow(dead_code)]

use axum::{
    body::Body,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use multiai::config::Config;
use multiai::gateway::stream_client::UpstreamRoutes;
use multiai::gateway::AppState;
use multiai::infra::spending::SpendingLedger;
use multiai::scanner::ScannerConfig;

pub struct StubUpstream {
    pub addr: SocketAddr,
    pub base_url: String,
    /// Completion calls seen for the "flaky" model.
    pub flaky_calls: Arc<AtomicU32>,
}

/// A fake Ollama host: enumerable via /api/tags, with per-model scripted
/// behavior on /v1/chat/completions.
pub async fn spawn_stub_upstream() -> StubUpstream {
    let flaky_calls = Arc::new(AtomicU32::new(0));
    let flaky_for_handler = flaky_calls.clone();

    let app = Router::new()
        .route("/api/tags", get(tags))
        .route(
            "/v1/chat/completions",
            post(move |Json(body): Json<serde_json::Value>| {
                let flaky = flaky_for_handler.clone();
                async move { chat(body, flaky).await }
            }),
        );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    StubUpstream {
        addr,
        base_url: format!("http://{addr}"),
        flaky_calls,
    }
}

async fn tags() -> Json<serde_json::Value> {
    Json(json!({
        "models": [
            {"name": "hello"},
            {"name": "good-a"},
            {"name": "good-c"},
            {"name": "bad-b"},
            {"name": "flaky"},
            {"name": "ratelimit"},
            {"name": "slow"},
            {"name": "nodone"},
        ]
    }))
}

fn chunk(content: &str) -> String {
    format!(
        "data: {}\n\n",
        json!({"choices": [{"delta": {"content": content}}]})
    )
}

fn done() -> String {
    "data: [DONE]\n\n".to_string()
}

fn sse_response(frames: Vec<String>) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .body(Body::from(frames.concat()))
        .unwrap()
}

async fn chat(body: serde_json::Value, flaky_calls: Arc<AtomicU32>) -> Response {
    let model = body["model"].as_str().unwrap_or("");
    match model {
        "hello" => sse_response(vec![chunk("Hel"), chunk("lo"), done()]),
        "good-a" => sse_response(vec![chunk("A"), done()]),
        "nodone" => sse_response(vec![chunk("par"), chunk("tial")]),
        "good-c" => sse_response(vec![chunk("C"), done()]),
        "bad-b" => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": {"message": "upstream exploded"}})),
        )
            .into_response(),
        "flaky" => {
            let n = flaky_calls.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({"error": {"message": "temporarily broken"}})),
                )
                    .into_response()
            } else {
                sse_response(vec![chunk("ok"), done()])
            }
        }
        "ratelimit" => (
            StatusCode::TOO_MANY_REQUESTS,
            [(header::RETRY_AFTER, "1")],
            Json(json!({"error": {"message": "rate limited"}})),
        )
            .into_response(),
        "slow" => {
            // First chunk arrives, then the stream stays open.
            let head = futures::stream::iter(vec![Ok::<String, Infallible>(chunk("Hel"))]);
            let stream = futures::StreamExt::chain(
                head,
                futures::stream::pending::<Result<String, Infallible>>(),
            );
            Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, "text/event-stream")
                .body(Body::from_stream(stream))
                .unwrap()
        }
        _ => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": {"message": format!("unknown model {model}")}})),
        )
            .into_response(),
    }
}

/// Scanner config that only sees the stub's Ollama endpoint.
pub fn stub_scanner_config(stub: &StubUpstream) -> ScannerConfig {
    ScannerConfig {
        ollama_url: stub.base_url.clone(),
        openrouter_models_url: "http://127.0.0.1:1/models".to_string(),
        zen_free_models: Vec::new(),
        ..ScannerConfig::default()
    }
}

/// Gateway config tuned for fast tests (short retry backoff, short
/// circuit reset).
pub fn fast_test_config() -> Config {
    let mut config = Config::default();
    config.retry.base_delay_ms = 10;
    config.retry.max_delay_ms = 50;
    config.circuit.reset_ms = 200;
    config
}

pub fn state_with_stub(stub: &StubUpstream, config: Config) -> AppState {
    let ledger = SpendingLedger::in_memory(config.spending_caps()).unwrap();
    let scanner_config = stub_scanner_config(stub);
    let routes = UpstreamRoutes::with_ollama_base(&stub.base_url);
    AppState::with_parts(config, None, ledger, scanner_config, routes)
}

/// Offline state: the catalog only carries the Zen allow-list, and no
/// upstream is reachable.
pub fn offline_state(config: Config) -> AppState {
    let ledger = SpendingLedger::in_memory(config.spending_caps()).unwrap();
    let scanner_config = ScannerConfig {
        ollama_url: "http://127.0.0.1:1".to_string(),
        openrouter_models_url: "http://127.0.0.1:1/models".to_string(),
        ..ScannerConfig::default()
    };
    let routes = UpstreamRoutes::with_ollama_base("http://127.0.0.1:1");
    AppState::with_parts(config, None, ledger, scanner_config, routes)
}
