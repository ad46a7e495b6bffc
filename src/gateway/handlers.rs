//! Usage: HTTP handlers for the OpenAI-compatible surface.

use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::types::*;
use super::AppState;
use crate::error::ApiError;
use crate::infra::spending::SpendingCaps;

pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        app: "multiai",
        version: env!("CARGO_PKG_VERSION"),
    })
}

pub async fn list_models(State(state): State<Arc<AppState>>) -> Json<ModelsResponse> {
    let free_models = state.scanner.list(false).await;

    let data: Vec<ModelInfo> = free_models
        .into_iter()
        .map(|m| ModelInfo {
            id: m.id,
            object: "model",
            created: Utc::now().timestamp(),
            owned_by: m.source.as_str().to_string(),
        })
        .collect();

    Json(ModelsResponse {
        object: "list",
        data,
    })
}

pub async fn list_models_grouped(
    State(state): State<Arc<AppState>>,
) -> Json<GroupedModelsResponse> {
    let models = state.scanner.list_grouped(false).await;
    Json(GroupedModelsResponse { models })
}

pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ChatRequest>,
) -> Response {
    if request.messages.is_empty() {
        return ApiError::bad_request("messages must not be empty").into_response();
    }
    for message in &request.messages {
        if let Err(err) = message.validate() {
            return err.into_response();
        }
    }

    let cancel = CancellationToken::new();

    if request.stream {
        match state
            .router
            .stream_single(
                &request.model,
                request.messages,
                request.temperature,
                request.max_tokens,
                cancel,
            )
            .await
        {
            Ok(body) => Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, "text/event-stream")
                .header(header::CACHE_CONTROL, "no-cache")
                .header(header::CONNECTION, "keep-alive")
                .body(body)
                .expect("static headers are valid")
                .into_response(),
            Err(err) => err.into_response(),
        }
    } else {
        let selection = vec![request.model.clone()];
        match state
            .router
            .dispatch(
                &selection,
                &request.messages,
                request.temperature,
                request.max_tokens,
                &cancel,
            )
            .await
        {
            Ok(result) => {
                let record = result
                    .completed()
                    .next()
                    .expect("dispatch success implies a completed record");
                Json(ChatCompletionResponse {
                    id: format!("chatcmpl-{}", Uuid::new_v4()),
                    object: "chat.completion",
                    created: Utc::now().timestamp(),
                    model: record.model_id.clone(),
                    choices: vec![CompletionChoice {
                        index: 0,
                        message: CompletionMessage {
                            role: "assistant",
                            content: record.content.clone().unwrap_or_default(),
                        },
                        finish_reason: "stop",
                    }],
                })
                .into_response()
            }
            Err(err) => err.into_response(),
        }
    }
}

pub async fn get_inspect(
    State(state): State<Arc<AppState>>,
    Query(query): Query<InspectQuery>,
) -> Json<serde_json::Value> {
    match query.format.as_deref() {
        // Raw transaction listing for UIs that want the unflattened shape.
        Some("json") => {
            let transactions = state.inspector.get_all();
            let count = transactions.len();
            Json(serde_json::json!({
                "transactions": transactions,
                "count": count,
            }))
        }
        _ => Json(state.inspector.export_har()),
    }
}

pub async fn clear_inspect(State(state): State<Arc<AppState>>) -> Json<ClearResponse> {
    let count = state.inspector.len();
    state.inspector.clear();
    Json(ClearResponse {
        cleared: true,
        count,
    })
}

pub async fn get_settings(State(state): State<Arc<AppState>>) -> Json<SettingsResponse> {
    let keys = state.api_keys.read().expect("api keys lock");
    Json(SettingsResponse {
        openrouter_configured: keys.openrouter.as_deref().is_some_and(|k| !k.is_empty()),
        opencode_zen_configured: keys.opencode_zen.as_deref().is_some_and(|k| !k.is_empty()),
    })
}

pub async fn update_settings(
    State(state): State<Arc<AppState>>,
    Json(request): Json<UpdateSettingsRequest>,
) -> Response {
    {
        let mut keys = state.api_keys.write().expect("api keys lock");
        if let Some(key) = request.openrouter_api_key {
            keys.openrouter = (!key.is_empty()).then_some(key);
        }
        if let Some(key) = request.opencode_zen_api_key {
            keys.opencode_zen = (!key.is_empty()).then_some(key);
        }
    }

    if let Err(err) = persist_config(&state) {
        return ApiError::internal(format!("Failed to save settings: {err}")).into_response();
    }

    get_settings(State(state)).await.into_response()
}

pub async fn get_spending(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let status = state.ledger.status(Utc::now());
    Json(serde_json::to_value(status).expect("status serializes"))
}

pub async fn update_spending(
    State(state): State<Arc<AppState>>,
    Json(request): Json<UpdateSpendingRequest>,
) -> Response {
    let current = state.ledger.caps();
    let caps = SpendingCaps {
        daily_cap: request.daily_cap.unwrap_or(current.daily_cap),
        monthly_cap: request.monthly_cap.unwrap_or(current.monthly_cap),
        warn_at_percent: request.warn_at_percent.unwrap_or(current.warn_at_percent),
    };
    if caps.daily_cap < 0.0 || caps.monthly_cap < 0.0 || caps.warn_at_percent > 100 {
        return ApiError::bad_request("Spending caps must be non-negative and percent <= 100")
            .into_response();
    }
    state.ledger.set_caps(caps);

    if let Err(err) = persist_config(&state) {
        return ApiError::internal(format!("Failed to save settings: {err}")).into_response();
    }

    get_spending(State(state)).await.into_response()
}

/// Write the runtime-mutated settings back through the config file, when
/// the gateway was started from one.
fn persist_config(state: &Arc<AppState>) -> Result<(), crate::config::ConfigError> {
    let Some(path) = &state.config_path else {
        return Ok(());
    };

    let mut config = state.config.write().expect("config lock");
    config.api_keys = state.api_keys.read().expect("api keys lock").clone();
    let caps = state.ledger.caps();
    config.spending.daily_cap = caps.daily_cap;
    config.spending.monthly_cap = caps.monthly_cap;
    config.spending.warn_at_percent = caps.warn_at_percent;
    config.save_to(path.clone())
}
