//! Usage: One client call fanned out to N parallel upstream streams (validation, spending gate, aggregation).

use axum::body::Body;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use futures_core::Stream;
use serde::Serialize;
use std::collections::HashSet;
use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::sse::{egress_chunk, egress_error, EGRESS_DONE};
use super::stream_client::{ChunkSink, StreamRequest, StreamingClient};
use super::types::ChatMessage;
use crate::error::{ApiError, ErrorKind, GatewayError};
use crate::infra::spending::SpendingLedger;
use crate::infra::telemetry::TelemetryLogger;
use crate::scanner::{FreeModelScanner, ModelDescriptor, Source};

const SSE_RELAY_BUFFER_CAPACITY: usize = 32;

/// Pluggable per-model cost estimate used for the spending gate. Free
/// models estimate to zero unless an operator installs something else.
pub type CostEstimator = Arc<dyn Fn(&ModelDescriptor) -> f64 + Send + Sync>;

pub fn free_model_estimator() -> CostEstimator {
    Arc::new(|_| 0.0)
}

/// Per-model aggregation record for one client call.
#[derive(Debug, Clone, Serialize)]
pub struct ModelRecord {
    pub model_id: String,
    pub loading: bool,
    pub content: Option<String>,
    pub error: Option<String>,
    pub ttft_ms: Option<i64>,
    pub total_ms: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FanoutResult {
    pub records: Vec<ModelRecord>,
}

impl FanoutResult {
    pub fn completed(&self) -> impl Iterator<Item = &ModelRecord> {
        self.records.iter().filter(|r| r.content.is_some())
    }
}

/// Why a client call was not (fully) served.
#[derive(Debug)]
pub enum DispatchError {
    /// Selection failed validation before any dispatch.
    Rejected(ApiError),
    /// Spending or credential gate refused the call pre-flight.
    Gateway(GatewayError),
    /// Every child failed; carries the first error encountered.
    AllFailed(GatewayError),
}

impl IntoResponse for DispatchError {
    fn into_response(self) -> Response {
        match self {
            Self::Rejected(err) => err.into_response(),
            Self::Gateway(err) | Self::AllFailed(err) => err.into_response(),
        }
    }
}

pub struct FanoutRouter {
    scanner: FreeModelScanner,
    streaming: Arc<StreamingClient>,
    ledger: Arc<SpendingLedger>,
    telemetry: TelemetryLogger,
    max_models: usize,
    estimator: CostEstimator,
}

impl FanoutRouter {
    pub fn new(
        scanner: FreeModelScanner,
        streaming: Arc<StreamingClient>,
        ledger: Arc<SpendingLedger>,
        telemetry: TelemetryLogger,
        max_models: usize,
    ) -> Self {
        Self {
            scanner,
            streaming,
            ledger,
            telemetry,
            max_models: max_models.max(1),
            estimator: free_model_estimator(),
        }
    }

    pub fn with_estimator(mut self, estimator: CostEstimator) -> Self {
        self.estimator = estimator;
        self
    }

    pub fn streaming(&self) -> &Arc<StreamingClient> {
        &self.streaming
    }

    /// Validate a selection against the live catalog. `"auto"` (alone)
    /// resolves to the highest-priority free model.
    pub async fn resolve_selection(
        &self,
        selection: &[String],
    ) -> Result<Vec<ModelDescriptor>, DispatchError> {
        if selection.is_empty() {
            return Err(DispatchError::Rejected(ApiError::bad_request(
                "Model selection must not be empty",
            )));
        }
        if selection.len() > self.max_models {
            return Err(DispatchError::Rejected(ApiError::bad_request(format!(
                "At most {} models per request",
                self.max_models
            ))));
        }

        let mut seen = HashSet::new();
        for id in selection {
            if !seen.insert(id.as_str()) {
                return Err(DispatchError::Rejected(ApiError::bad_request(format!(
                    "Duplicate model '{id}' in selection"
                ))));
            }
        }

        let listing = self.scanner.list(false).await;
        if listing.is_empty() {
            return Err(DispatchError::Rejected(ApiError::service_unavailable(
                "No free models available",
            )));
        }

        let mut models = Vec::with_capacity(selection.len());
        for id in selection {
            let model = if id == "auto" {
                if selection.len() > 1 {
                    return Err(DispatchError::Rejected(ApiError::bad_request(
                        "'auto' cannot be combined with explicit models",
                    )));
                }
                listing.first().cloned()
            } else {
                listing.iter().find(|m| m.id == *id).cloned()
            };
            let Some(model) = model else {
                return Err(DispatchError::Rejected(ApiError::bad_request(format!(
                    "'{id}' is not a free model"
                ))));
            };
            if model.source != Source::Ollama && !self.streaming.has_credential(model.source) {
                return Err(DispatchError::Gateway(
                    GatewayError::configuration(format!(
                        "No API key configured for {}",
                        model.source.as_str()
                    ))
                    .with_model(&model.id, model.source),
                ));
            }
            models.push(model);
        }
        Ok(models)
    }

    /// Fan one client call out to N children and aggregate their terminal
    /// records. Succeeds as long as at least one child completed; failed
    /// children surface their error in their own record.
    pub async fn dispatch(
        &self,
        selection: &[String],
        messages: &[ChatMessage],
        temperature: Option<f64>,
        max_tokens: Option<u32>,
        cancel: &CancellationToken,
    ) -> Result<FanoutResult, DispatchError> {
        let models = self.resolve_selection(selection).await?;

        let estimated: f64 = models.iter().map(|m| (self.estimator)(m)).sum();
        self.ledger
            .check(estimated, Utc::now())
            .map_err(DispatchError::Gateway)?;

        let mut records: Vec<ModelRecord> = models
            .iter()
            .map(|m| ModelRecord {
                model_id: m.id.clone(),
                loading: true,
                content: None,
                error: None,
                ttft_ms: None,
                total_ms: None,
            })
            .collect();

        let mut join_set = JoinSet::new();
        for (index, model) in models.iter().enumerate() {
            let streaming = self.streaming.clone();
            let request = StreamRequest {
                request_id: Uuid::new_v4().to_string(),
                model: model.clone(),
                messages: messages.to_vec(),
                temperature,
                max_tokens,
            };
            let child_cancel = cancel.child_token();
            join_set.spawn(async move {
                let mut discard = |_: &str| {};
                let result = streaming
                    .stream(&request, ChunkSink::Callback(&mut discard), &child_cancel)
                    .await;
                (index, result)
            });
        }

        let mut first_error: Option<GatewayError> = None;
        let mut completed_cost = 0.0;
        while let Some(joined) = join_set.join_next().await {
            let Ok((index, result)) = joined else {
                continue;
            };
            let record = &mut records[index];
            record.loading = false;
            match result {
                Ok(success) => {
                    completed_cost += (self.estimator)(&models[index]);
                    record.content = Some(success.content);
                    record.ttft_ms = success.ttft_ms;
                    record.total_ms = Some(success.total_ms);
                }
                Err(err) => {
                    record.error = Some(err.message.clone());
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
            }
        }

        let result = FanoutResult { records };
        if result.completed().next().is_none() {
            let err = first_error
                .unwrap_or_else(|| GatewayError::upstream(502, "All upstream calls failed"));
            return Err(DispatchError::AllFailed(err));
        }

        record_spending(&self.ledger, &self.telemetry, completed_cost);
        Ok(result)
    }

    /// Single-model streaming egress: chunks are re-framed 1:1 onto the
    /// response body as they arrive. Dropping the body cancels the
    /// upstream call.
    pub async fn stream_single(
        &self,
        model_id: &str,
        messages: Vec<ChatMessage>,
        temperature: Option<f64>,
        max_tokens: Option<u32>,
        cancel: CancellationToken,
    ) -> Result<Body, DispatchError> {
        let models = self.resolve_selection(&[model_id.to_string()]).await?;
        let model = models.into_iter().next().expect("single model resolved");

        let cost = (self.estimator)(&model);
        self.ledger
            .check(cost, Utc::now())
            .map_err(DispatchError::Gateway)?;

        let (frame_tx, frame_rx) =
            mpsc::channel::<Result<String, Infallible>>(SSE_RELAY_BUFFER_CAPACITY);
        let (chunk_tx, mut chunk_rx) = mpsc::channel::<String>(SSE_RELAY_BUFFER_CAPACITY);

        let request = StreamRequest {
            request_id: Uuid::new_v4().to_string(),
            model,
            messages,
            temperature,
            max_tokens,
        };
        let streaming = self.streaming.clone();
        let stream_cancel = cancel.clone();
        let stream_task = tokio::spawn(async move {
            streaming
                .stream(&request, ChunkSink::Channel(chunk_tx), &stream_cancel)
                .await
        });

        let ledger = self.ledger.clone();
        let telemetry = self.telemetry.clone();
        tokio::spawn(async move {
            while let Some(content) = chunk_rx.recv().await {
                if frame_tx.send(Ok(egress_chunk(&content))).await.is_err() {
                    // Client hung up; tear the upstream call down.
                    cancel.cancel();
                    break;
                }
            }
            match stream_task.await {
                Ok(Ok(_)) => {
                    let _ = frame_tx.send(Ok(EGRESS_DONE.to_string())).await;
                    record_spending(&ledger, &telemetry, cost);
                }
                Ok(Err(err)) if !matches!(err.kind, ErrorKind::Abort) => {
                    let _ = frame_tx.send(Ok(egress_error(&err.message))).await;
                }
                // Aborted (or panicked): the client is gone, nothing to say.
                _ => {}
            }
        });

        Ok(Body::from_stream(RelayBodyStream { rx: frame_rx }))
    }
}

fn record_spending(ledger: &SpendingLedger, telemetry: &TelemetryLogger, cost: f64) {
    match ledger.record(cost, Utc::now()) {
        Ok(warnings) => {
            for warning in warnings {
                tracing::warn!(
                    cap_type = warning.cap_type,
                    used = warning.used,
                    cap = warning.cap,
                    "spending cap warning threshold crossed"
                );
                telemetry.log(
                    "spending_warning",
                    serde_json::json!({
                        "cap_type": warning.cap_type,
                        "used": warning.used,
                        "cap": warning.cap,
                        "percent": warning.percent,
                    }),
                );
            }
        }
        Err(err) => tracing::warn!(error = %err, "failed to record spending"),
    }
}

struct RelayBodyStream {
    rx: mpsc::Receiver<Result<String, Infallible>>,
}

impl Stream for RelayBodyStream {
    type Item = Result<String, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.as_mut().get_mut();
        Pin::new(&mut this.rx).poll_recv(cx)
    }
}
