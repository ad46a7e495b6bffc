//! Usage: Request/response DTOs for the OpenAI-compatible surface.

use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::scanner::GroupedModel;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub app: &'static str,
    pub version: &'static str,
}

#[derive(Serialize)]
pub struct ModelsResponse {
    pub object: &'static str,
    pub data: Vec<ModelInfo>,
}

#[derive(Serialize)]
pub struct ModelInfo {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub owned_by: String,
}

#[derive(Serialize)]
pub struct GroupedModelsResponse {
    pub models: Vec<GroupedModel>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub stream: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn validate(&self) -> Result<(), ApiError> {
        match self.role.as_str() {
            "system" | "user" | "assistant" => {}
            other => {
                return Err(ApiError::bad_request(format!("Invalid role: {other}")));
            }
        }
        if self.content.is_empty() {
            return Err(ApiError::bad_request("Message content must not be empty"));
        }
        Ok(())
    }
}

/// Non-streaming completion response in the OpenAI shape.
#[derive(Serialize)]
pub struct ChatCompletionResponse {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub model: String,
    pub choices: Vec<CompletionChoice>,
}

#[derive(Serialize)]
pub struct CompletionChoice {
    pub index: usize,
    pub message: CompletionMessage,
    pub finish_reason: &'static str,
}

#[derive(Serialize)]
pub struct CompletionMessage {
    pub role: &'static str,
    pub content: String,
}

#[derive(Deserialize)]
pub struct InspectQuery {
    pub format: Option<String>,
}

#[derive(Serialize)]
pub struct ClearResponse {
    pub cleared: bool,
    pub count: usize,
}

#[derive(Serialize)]
pub struct SettingsResponse {
    pub openrouter_configured: bool,
    pub opencode_zen_configured: bool,
}

#[derive(Deserialize)]
pub struct UpdateSettingsRequest {
    pub openrouter_api_key: Option<String>,
    pub opencode_zen_api_key: Option<String>,
}

#[derive(Deserialize)]
pub struct UpdateSpendingRequest {
    pub daily_cap: Option<f64>,
    pub monthly_cap: Option<f64>,
    pub warn_at_percent: Option<u8>,
}
