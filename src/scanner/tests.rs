//! Tests for free-model discovery and listings.

use super::*;
use std::time::Duration;

fn scanner_with(config: ScannerConfig) -> FreeModelScanner {
    FreeModelScanner::new(reqwest::Client::new(), config)
}

fn offline_config() -> ScannerConfig {
    // Point the network sources at closed ports so fetches fail fast.
    ScannerConfig {
        ttl: Duration::from_secs(300),
        ollama_url: "http://127.0.0.1:1".to_string(),
        openrouter_models_url: "http://127.0.0.1:1/models".to_string(),
        zen_free_models: default_zen_free_models(),
    }
}

#[tokio::test]
async fn fetches_free_models_from_openrouter() {
    let mut server = mockito::Server::new_async().await;

    let body = serde_json::json!({
        "data": [
            {"id": "meta-llama/llama-3:free", "pricing": {"prompt": "0", "completion": "0"}},
            {"id": "openai/gpt-4", "pricing": {"prompt": "0.03", "completion": "0.06"}},
        ]
    });
    let mock = server
        .mock("GET", "/api/v1/models")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(body.to_string())
        .create_async()
        .await;

    let scanner = scanner_with(ScannerConfig {
        openrouter_models_url: format!("{}/api/v1/models", server.url()),
        zen_free_models: Vec::new(),
        ollama_url: "http://127.0.0.1:1".to_string(),
        ..ScannerConfig::default()
    });

    let models = scanner.list(false).await;
    mock.assert_async().await;

    assert_eq!(models.len(), 1);
    assert_eq!(models[0].id, "meta-llama/llama-3:free");
    assert_eq!(models[0].source, Source::OpenRouter);
    assert!(models[0].is_free);
}

#[tokio::test]
async fn failed_fetch_retains_previous_snapshot() {
    let mut server = mockito::Server::new_async().await;

    let ok_body = serde_json::json!({
        "data": [{"id": "good/model:free", "pricing": {"prompt": "0", "completion": "0"}}]
    });
    let ok_mock = server
        .mock("GET", "/api/v1/models")
        .with_status(200)
        .with_body(ok_body.to_string())
        .expect(1)
        .create_async()
        .await;

    let scanner = scanner_with(ScannerConfig {
        openrouter_models_url: format!("{}/api/v1/models", server.url()),
        zen_free_models: Vec::new(),
        ollama_url: "http://127.0.0.1:1".to_string(),
        ..ScannerConfig::default()
    });

    let first = scanner.list(false).await;
    assert_eq!(first.len(), 1);
    ok_mock.assert_async().await;

    // Subsequent fetches fail; force a refresh and expect the old snapshot.
    let _fail_mock = server
        .mock("GET", "/api/v1/models")
        .with_status(500)
        .create_async()
        .await;

    let second = scanner.list(true).await;
    assert_eq!(second, first);
}

#[tokio::test]
async fn listing_is_served_from_cache_within_ttl() {
    let mut server = mockito::Server::new_async().await;
    let body = serde_json::json!({
        "data": [{"id": "cached/model:free", "pricing": {"prompt": "0", "completion": "0"}}]
    });
    let mock = server
        .mock("GET", "/api/v1/models")
        .with_status(200)
        .with_body(body.to_string())
        .expect(1)
        .create_async()
        .await;

    let scanner = scanner_with(ScannerConfig {
        openrouter_models_url: format!("{}/api/v1/models", server.url()),
        zen_free_models: Vec::new(),
        ollama_url: "http://127.0.0.1:1".to_string(),
        ..ScannerConfig::default()
    });

    let first = scanner.list(false).await;
    let second = scanner.list(false).await;
    assert_eq!(first, second);
    mock.assert_async().await;
}

#[tokio::test]
async fn enumerates_ollama_models_as_free() {
    let mut server = mockito::Server::new_async().await;
    let body = serde_json::json!({
        "models": [{"name": "llama3:latest"}, {"name": "qwen2:7b"}]
    });
    let mock = server
        .mock("GET", "/api/tags")
        .with_status(200)
        .with_body(body.to_string())
        .create_async()
        .await;

    let scanner = scanner_with(ScannerConfig {
        ollama_url: server.url(),
        openrouter_models_url: "http://127.0.0.1:1/models".to_string(),
        zen_free_models: Vec::new(),
        ..ScannerConfig::default()
    });

    let models = scanner.list(false).await;
    mock.assert_async().await;
    assert_eq!(models.len(), 2);
    assert!(models.iter().all(|m| m.source == Source::Ollama && m.is_free));
}

#[tokio::test]
async fn zen_allow_list_is_enumerated_without_network() {
    let scanner = scanner_with(offline_config());
    let models = scanner.list(false).await;
    assert_eq!(models.len(), default_zen_free_models().len());
    assert!(models.iter().all(|m| m.source == Source::OpenCodeZen));
}

#[tokio::test]
async fn flat_listing_orders_by_source_priority_then_name() {
    let mut server = mockito::Server::new_async().await;
    let tags = serde_json::json!({ "models": [{"name": "zeta:latest"}] });
    server
        .mock("GET", "/api/tags")
        .with_status(200)
        .with_body(tags.to_string())
        .create_async()
        .await;

    let scanner = scanner_with(ScannerConfig {
        ollama_url: server.url(),
        openrouter_models_url: "http://127.0.0.1:1/models".to_string(),
        zen_free_models: vec!["opencode/alpha-free".to_string()],
        ..ScannerConfig::default()
    });

    let models = scanner.list(false).await;
    // Ollama sorts before Zen regardless of display name.
    assert_eq!(models[0].source, Source::Ollama);
    assert_eq!(models[1].source, Source::OpenCodeZen);
}

#[tokio::test]
async fn grouped_listing_merges_same_display_name_and_sorts_providers() {
    let mut server = mockito::Server::new_async().await;
    let body = serde_json::json!({
        "data": [{"id": "vendor/grok-code:free", "pricing": {"prompt": "0", "completion": "0"}}]
    });
    server
        .mock("GET", "/api/v1/models")
        .with_status(200)
        .with_body(body.to_string())
        .create_async()
        .await;

    let scanner = scanner_with(ScannerConfig {
        ollama_url: "http://127.0.0.1:1".to_string(),
        openrouter_models_url: format!("{}/api/v1/models", server.url()),
        zen_free_models: vec!["opencode/grok-code".to_string()],
        ..ScannerConfig::default()
    });

    let grouped = scanner.list_grouped(false).await;
    let grok = grouped
        .iter()
        .find(|g| g.name == "Grok Code")
        .expect("grouped entry");
    assert_eq!(grok.providers.len(), 2);
    assert_eq!(grok.providers[0].source, Source::OpenCodeZen);
    assert_eq!(grok.providers[1].source, Source::OpenRouter);
    assert_eq!(grok.id, "grok-code");
}

#[test]
fn filters_only_zero_priced_openrouter_models() {
    let models = vec![
        serde_json::json!({"id": "free-model", "pricing": {"prompt": "0", "completion": "0"}}),
        serde_json::json!({"id": "paid-model", "pricing": {"prompt": "0.01", "completion": "0.02"}}),
        serde_json::json!({"id": "half-free", "pricing": {"prompt": "0", "completion": "0.01"}}),
        serde_json::json!({"id": "no-pricing"}),
    ];

    let free = filter_openrouter_free(&models);
    assert_eq!(free.len(), 1);
    assert_eq!(free[0].id, "free-model");
}

#[test]
fn vision_capability_derived_from_modality() {
    let models = vec![serde_json::json!({
        "id": "seer/vision-model:free",
        "pricing": {"prompt": "0", "completion": "0"},
        "architecture": {"modality": "text+image->text"}
    })];
    let free = filter_openrouter_free(&models);
    assert_eq!(free[0].capabilities, vec!["chat", "vision"]);
}

#[test]
fn normalize_handles_version_numbers() {
    assert_eq!(normalize_model_name("glm-4-7-free"), "GLM 4.7");
    assert_eq!(normalize_model_name("minimax-m-2-1"), "Minimax M 2.1");
    assert_eq!(normalize_model_name("model-1-2-3"), "Model 1.2.3");
}

#[test]
fn normalize_strips_prefix_and_free_suffix() {
    assert_eq!(normalize_model_name("opencode/model-free"), "Model");
    assert_eq!(normalize_model_name("meta-llama/llama-3:free"), "Llama 3");
}

#[test]
fn normalize_title_cases_and_keeps_acronyms() {
    assert_eq!(normalize_model_name("grok-code-fast"), "Grok Code Fast");
    assert_eq!(normalize_model_name("gpt-7-0"), "GPT 7.0");
}
