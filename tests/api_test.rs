//! API surface tests over an offline gateway (no reachable upstreams).

mod common;

use axum_test::TestServer;
use serde_json::json;

use common::{fast_test_config, offline_state};
use multiai::config::Config;
use multiai::gateway::create_router;

fn offline_server() -> TestServer {
    TestServer::new(create_router(offline_state(Config::default()))).unwrap()
}

#[tokio::test]
async fn health_check_returns_ok() {
    let server = offline_server();
    let response = server.get("/health").await;

    response.assert_status_ok();
    response.assert_json(&json!({
        "app": "multiai",
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }));
}

#[tokio::test]
async fn list_models_returns_openai_list_shape() {
    let server = offline_server();
    let response = server.get("/v1/models").await;

    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["object"], "list");
    let data = body["data"].as_array().unwrap();
    // The Zen allow-list is enumerable with no upstream reachable.
    assert!(!data.is_empty());
    for model in data {
        assert_eq!(model["object"], "model");
        assert!(model["id"].is_string());
        assert!(model["owned_by"].is_string());
    }
}

#[tokio::test]
async fn grouped_models_have_providers_sorted_zen_first() {
    let server = offline_server();
    let response = server.get("/v1/models/grouped").await;

    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    let models = body["models"].as_array().unwrap();
    assert!(!models.is_empty());
    for model in models {
        assert!(model["name"].is_string());
        assert!(model["id"].is_string());
        let providers = model["providers"].as_array().unwrap();
        assert!(!providers.is_empty());
        for provider in providers {
            assert_eq!(provider["is_free"], true);
        }
        if providers.len() > 1
            && providers.iter().any(|p| p["source"] == "open_code_zen")
        {
            assert_eq!(providers[0]["source"], "open_code_zen");
        }
    }
}

#[tokio::test]
async fn chat_rejects_non_free_model() {
    let server = offline_server();
    let response = server
        .post("/v1/chat/completions")
        .json(&json!({
            "model": "gpt-4",
            "messages": [{"role": "user", "content": "Hello"}],
        }))
        .await;

    assert_eq!(response.status_code().as_u16(), 400);
    let body: serde_json::Value = response.json();
    assert!(body["error"]["message"]
        .as_str()
        .unwrap()
        .contains("not a free model"));
}

#[tokio::test]
async fn chat_rejects_empty_messages_and_bad_roles() {
    let server = offline_server();

    let response = server
        .post("/v1/chat/completions")
        .json(&json!({"model": "auto", "messages": []}))
        .await;
    assert_eq!(response.status_code().as_u16(), 400);

    let response = server
        .post("/v1/chat/completions")
        .json(&json!({
            "model": "auto",
            "messages": [{"role": "wizard", "content": "Hello"}],
        }))
        .await;
    assert_eq!(response.status_code().as_u16(), 400);

    let response = server
        .post("/v1/chat/completions")
        .json(&json!({
            "model": "auto",
            "messages": [{"role": "user", "content": ""}],
        }))
        .await;
    assert_eq!(response.status_code().as_u16(), 400);
}

#[tokio::test]
async fn chat_without_zen_credential_is_a_configuration_error() {
    // The offline catalog only has Zen models, and no key is configured.
    let server = offline_server();
    let response = server
        .post("/v1/chat/completions")
        .json(&json!({
            "model": "auto",
            "messages": [{"role": "user", "content": "Hello"}],
        }))
        .await;

    assert_eq!(response.status_code().as_u16(), 400);
    let body: serde_json::Value = response.json();
    assert_eq!(body["error"]["type"], "configuration_error");
}

#[tokio::test]
async fn settings_round_trip_and_clearing() {
    let server = offline_server();

    let response = server.get("/api/settings").await;
    response.assert_json(&json!({
        "openrouter_configured": false,
        "opencode_zen_configured": false,
    }));

    let response = server
        .put("/api/settings")
        .json(&json!({"openrouter_api_key": "sk-or-xyz"}))
        .await;
    response.assert_status_ok();
    response.assert_json(&json!({
        "openrouter_configured": true,
        "opencode_zen_configured": false,
    }));

    // Empty string clears the key.
    let response = server
        .put("/api/settings")
        .json(&json!({"openrouter_api_key": ""}))
        .await;
    response.assert_json(&json!({
        "openrouter_configured": false,
        "opencode_zen_configured": false,
    }));
}

#[tokio::test]
async fn spending_status_and_cap_updates() {
    let server = offline_server();

    let response = server.get("/api/settings/spending").await;
    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["daily_used"], 0.0);
    assert_eq!(body["daily_cap"], 5.0);
    assert_eq!(body["monthly_cap"], 50.0);
    assert_eq!(body["at_warning"], false);
    assert!(body["daily_resets_at"].is_string());

    let response = server
        .post("/api/settings/spending")
        .json(&json!({"daily_cap": 2.0, "warn_at_percent": 50}))
        .await;
    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["daily_cap"], 2.0);
    assert_eq!(body["monthly_cap"], 50.0);

    let response = server
        .post("/api/settings/spending")
        .json(&json!({"daily_cap": -1.0}))
        .await;
    assert_eq!(response.status_code().as_u16(), 400);
}

#[tokio::test]
async fn inspect_endpoints_list_export_and_clear() {
    let server = offline_server();

    let response = server.get("/v1/inspect").await;
    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["log"]["version"], "1.2");
    assert_eq!(body["log"]["entries"].as_array().unwrap().len(), 0);

    let response = server.get("/v1/inspect?format=json").await;
    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["count"], 0);
    assert!(body["transactions"].is_array());

    let response = server.delete("/v1/inspect").await;
    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["cleared"], true);
}

#[tokio::test]
async fn fast_config_is_honored() {
    // Sanity-check the shared fixture so other tests stay fast.
    let config = fast_test_config();
    assert_eq!(config.retry.base_delay_ms, 10);
    assert_eq!(config.circuit.reset_ms, 200);
}
