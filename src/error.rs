//! Usage: Gateway error taxonomy (classification, retryability, HTTP mapping, telemetry JSON).

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::fmt;

use crate::scanner::Source;
use crate::shared::time::now_unix_millis;

/// Variant-specific payload for a [`GatewayError`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ErrorKind {
    /// Transport failure: DNS, connect, TLS, timeout, mid-stream disconnect.
    Network,
    /// Upstream 429 or explicit rate-limit signal.
    RateLimit { retry_after_seconds: Option<u64> },
    /// Non-2xx upstream response.
    Upstream { status: u16 },
    /// Circuit breaker refused the request before dispatch.
    CircuitOpen { reset_at_unix_ms: i64 },
    /// Client-initiated cancellation.
    Abort,
    /// Missing or invalid credential for the selected source.
    Configuration,
    /// Spending ledger rejected the request pre-flight.
    SpendingCap {
        cap_type: &'static str,
        used: f64,
        cap: f64,
    },
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Network => "network_error",
            Self::RateLimit { .. } => "rate_limit_error",
            Self::Upstream { .. } => "upstream_error",
            Self::CircuitOpen { .. } => "circuit_open_error",
            Self::Abort => "abort_error",
            Self::Configuration => "configuration_error",
            Self::SpendingCap { .. } => "spending_cap_error",
        }
    }
}

/// A classified gateway error.
///
/// Classification happens exactly once at the point of origin; callers
/// propagate the value as-is and never re-wrap one kind into another.
#[derive(Debug, Clone)]
pub struct GatewayError {
    pub kind: ErrorKind,
    pub message: String,
    pub model: Option<String>,
    pub source: Option<Source>,
    pub timestamp_unix_ms: i64,
    retryable_override: Option<bool>,
}

impl GatewayError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            model: None,
            source: None,
            timestamp_unix_ms: now_unix_millis(),
            retryable_override: None,
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, message)
    }

    pub fn rate_limit(message: impl Into<String>, retry_after_seconds: Option<u64>) -> Self {
        Self::new(ErrorKind::RateLimit { retry_after_seconds }, message)
    }

    pub fn upstream(status: u16, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Upstream { status }, message)
    }

    pub fn circuit_open(reset_at_unix_ms: i64, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::CircuitOpen { reset_at_unix_ms }, message)
    }

    pub fn abort() -> Self {
        Self::new(ErrorKind::Abort, "request aborted by client")
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Configuration, message)
    }

    pub fn spending_cap(
        cap_type: &'static str,
        used: f64,
        cap: f64,
        message: impl Into<String>,
    ) -> Self {
        Self::new(ErrorKind::SpendingCap { cap_type, used, cap }, message)
    }

    pub fn with_model(mut self, model: impl Into<String>, source: Source) -> Self {
        self.model = Some(model.into());
        self.source = Some(source);
        self
    }

    /// Force the retryability decision for this instance, overriding the
    /// variant default.
    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable_override = Some(retryable);
        self
    }

    pub fn is_retryable(&self) -> bool {
        if let Some(forced) = self.retryable_override {
            return forced;
        }
        match self.kind {
            ErrorKind::Network | ErrorKind::RateLimit { .. } => true,
            ErrorKind::Upstream { status } => status >= 500,
            ErrorKind::CircuitOpen { .. }
            | ErrorKind::Abort
            | ErrorKind::Configuration
            | ErrorKind::SpendingCap { .. } => false,
        }
    }

    /// Whether this failure counts toward the per-model circuit breaker.
    ///
    /// Rate limits, 5xx responses and transport failures count; client
    /// aborts, configuration and spending rejections never do.
    pub fn counts_toward_circuit(&self) -> bool {
        match self.kind {
            ErrorKind::RateLimit { .. } | ErrorKind::Network => true,
            ErrorKind::Upstream { status } => status >= 500,
            _ => false,
        }
    }

    /// Flat JSON object carried in `streaming_error` telemetry events.
    pub fn to_telemetry_json(&self) -> serde_json::Value {
        let mut obj = serde_json::json!({
            "type": self.kind.as_str(),
            "message": self.message,
            "retryable": self.is_retryable(),
            "timestamp": self.timestamp_unix_ms,
        });
        let map = obj.as_object_mut().expect("object literal");
        if let Some(model) = &self.model {
            map.insert("model".into(), serde_json::Value::String(model.clone()));
        }
        if let Some(source) = self.source {
            map.insert(
                "source".into(),
                serde_json::Value::String(source.as_str().to_string()),
            );
        }
        match self.kind {
            ErrorKind::Upstream { status } => {
                map.insert("status".into(), status.into());
            }
            ErrorKind::RateLimit {
                retry_after_seconds: Some(secs),
            } => {
                map.insert("retry_after".into(), secs.into());
            }
            ErrorKind::CircuitOpen { reset_at_unix_ms } => {
                map.insert("reset_at".into(), reset_at_unix_ms.into());
            }
            _ => {}
        }
        obj
    }

    pub fn status_code(&self) -> StatusCode {
        match self.kind {
            ErrorKind::Network => StatusCode::BAD_GATEWAY,
            ErrorKind::RateLimit { .. } => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::Upstream { status } => {
                StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            ErrorKind::CircuitOpen { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Abort => StatusCode::BAD_REQUEST,
            ErrorKind::Configuration => StatusCode::BAD_REQUEST,
            ErrorKind::SpendingCap { .. } => StatusCode::PAYMENT_REQUIRED,
        }
    }
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

impl std::error::Error for GatewayError {}

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    message: String,
    r#type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    cap_type: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    used: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cap: Option<f64>,
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let (cap_type, used, cap) = match self.kind {
            ErrorKind::SpendingCap { cap_type, used, cap } => {
                (Some(cap_type), Some(used), Some(cap))
            }
            _ => (None, None, None),
        };
        let retry_after_seconds = match self.kind {
            ErrorKind::CircuitOpen { reset_at_unix_ms } => {
                let remaining_ms = reset_at_unix_ms.saturating_sub(now_unix_millis());
                (remaining_ms > 0).then(|| (remaining_ms as u64).div_ceil(1000))
            }
            ErrorKind::RateLimit { retry_after_seconds } => retry_after_seconds,
            _ => None,
        };

        let body = ErrorBody {
            error: ErrorDetail {
                message: self.message,
                r#type: self.kind.as_str(),
                cap_type,
                used,
                cap,
            },
        };

        let mut resp = (status, Json(body)).into_response();
        if let Some(seconds) = retry_after_seconds.filter(|v| *v > 0) {
            if let Ok(v) = HeaderValue::from_str(&seconds.to_string()) {
                resp.headers_mut().insert(header::RETRY_AFTER, v);
            }
        }
        resp
    }
}

/// Handler-level request validation errors (bad model selection, unknown
/// chat, malformed input). Distinct from the streaming taxonomy above.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: msg.into(),
        }
    }

    pub fn service_unavailable(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            message: msg.into(),
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: msg.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({
                "error": { "message": self.message, "type": "invalid_request" }
            })),
        )
            .into_response()
    }
}
