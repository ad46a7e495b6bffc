//! Usage: Single upstream streaming attempt loop (circuit gate, SSE ingest, retry, telemetry, abort).

use futures::StreamExt;
use reqwest::header;
use serde_json::Value;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use super::sse::{ChatStreamEvent, SseFramer};
use super::types::ChatMessage;
use crate::config::ApiKeysSection;
use crate::error::{ErrorKind, GatewayError};
use crate::infra::inspector::{
    body_snippet, redact_headers, CapturedRequest, CapturedResponse, CapturedTransaction,
    TrafficInspector,
};
use crate::infra::telemetry::TelemetryLogger;
use crate::scanner::{ModelDescriptor, Source};
use crate::shared::circuit_breaker::{CircuitBreaker, CircuitState};
use crate::shared::retry::RetryPolicy;
use crate::shared::time::now_unix_millis;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

const MAX_ERROR_BODY_BYTES: usize = 512;

/// Full chat-completion URL per source.
#[derive(Debug, Clone)]
pub struct UpstreamRoutes {
    pub ollama: String,
    pub open_code_zen: String,
    pub openrouter: String,
}

impl UpstreamRoutes {
    pub fn with_ollama_base(ollama_base: &str) -> Self {
        Self {
            ollama: format!("{}/v1/chat/completions", ollama_base.trim_end_matches('/')),
            open_code_zen: "https://zen.opencode.ai/v1/chat/completions".to_string(),
            openrouter: "https://openrouter.ai/api/v1/chat/completions".to_string(),
        }
    }

    pub fn chat_url(&self, source: Source) -> &str {
        match source {
            Source::Ollama => &self.ollama,
            Source::OpenCodeZen => &self.open_code_zen,
            Source::OpenRouter => &self.openrouter,
        }
    }
}

impl Default for UpstreamRoutes {
    fn default() -> Self {
        Self::with_ollama_base("http://localhost:11434")
    }
}

/// Rewrite a gateway model id into the id the upstream expects.
pub fn upstream_model_id(source: Source, id: &str) -> &str {
    match source {
        // Zen ids are namespaced on our side only.
        Source::OpenCodeZen => id.strip_prefix("opencode/").unwrap_or(id),
        Source::Ollama | Source::OpenRouter => id,
    }
}

/// One logical upstream call (spanning the attempt loop).
#[derive(Debug, Clone)]
pub struct StreamRequest {
    pub request_id: String,
    pub model: ModelDescriptor,
    pub messages: Vec<ChatMessage>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct StreamSuccess {
    pub content: String,
    /// None when the stream completed without emitting a single chunk.
    pub ttft_ms: Option<i64>,
    pub total_ms: i64,
    pub attempts: u32,
}

/// Where forwarded chunks go. The channel variant applies the caller's
/// bounded backpressure; a closed receiver is treated as a client abort.
pub enum ChunkSink<'a> {
    Callback(&'a mut (dyn FnMut(&str) + Send)),
    Channel(tokio::sync::mpsc::Sender<String>),
}

pub struct StreamingClient {
    http: reqwest::Client,
    routes: UpstreamRoutes,
    api_keys: Arc<RwLock<ApiKeysSection>>,
    circuit: Arc<CircuitBreaker>,
    retry: RetryPolicy,
    telemetry: TelemetryLogger,
    inspector: Arc<TrafficInspector>,
    idle_timeout: Duration,
}

impl StreamingClient {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        http: reqwest::Client,
        routes: UpstreamRoutes,
        api_keys: Arc<RwLock<ApiKeysSection>>,
        circuit: Arc<CircuitBreaker>,
        retry: RetryPolicy,
        telemetry: TelemetryLogger,
        inspector: Arc<TrafficInspector>,
    ) -> Self {
        Self {
            http,
            routes,
            api_keys,
            circuit,
            retry,
            telemetry,
            inspector,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn has_credential(&self, source: Source) -> bool {
        let keys = self.api_keys.read().expect("api keys lock");
        match source {
            Source::Ollama => true,
            Source::OpenCodeZen => keys.opencode_zen.as_deref().is_some_and(|k| !k.is_empty()),
            Source::OpenRouter => keys.openrouter.as_deref().is_some_and(|k| !k.is_empty()),
        }
    }

    pub fn circuit(&self) -> &Arc<CircuitBreaker> {
        &self.circuit
    }

    /// Run one upstream call to terminal state: the chunks flow through
    /// `sink` as they arrive, and the single terminal outcome is the
    /// return value. An abort is reported as `ErrorKind::Abort` and never
    /// counts as a circuit failure.
    pub async fn stream(
        &self,
        request: &StreamRequest,
        mut sink: ChunkSink<'_>,
        cancel: &CancellationToken,
    ) -> Result<StreamSuccess, GatewayError> {
        let model_id = request.model.id.clone();
        let source = request.model.source;

        let now = now_unix_millis();
        if self.circuit.is_open(&model_id, now) {
            let reset_at = self.circuit.reset_at(&model_id, now).unwrap_or(now);
            let err = GatewayError::circuit_open(
                reset_at,
                format!("Circuit open for {model_id}; retry later"),
            )
            .with_model(&model_id, source);
            self.telemetry
                .streaming_error(&model_id, 0, err.to_telemetry_json());
            return Err(err);
        }

        let mut attempt_number = 1u32;
        loop {
            let result = self
                .attempt(request, attempt_number, &mut sink, cancel)
                .await;

            match result {
                Ok(mut success) => {
                    success.attempts = attempt_number;
                    self.circuit.record_success(&model_id);
                    self.telemetry.streaming_success(
                        &model_id,
                        attempt_number,
                        success.ttft_ms.unwrap_or(success.total_ms),
                        success.total_ms,
                    );
                    return Ok(success);
                }
                Err(err) if matches!(err.kind, ErrorKind::Abort) => {
                    return Err(err);
                }
                Err(err) => {
                    self.telemetry.streaming_error(
                        &model_id,
                        attempt_number,
                        err.to_telemetry_json(),
                    );
                    if err.counts_toward_circuit() {
                        let state = self.circuit.record_failure(&model_id, now_unix_millis());
                        if state == CircuitState::Open {
                            tracing::warn!(
                                model = %model_id,
                                state = state.as_str(),
                                "circuit opened after repeated failures"
                            );
                        }
                    }
                    if self.retry.should_retry(&err, attempt_number) {
                        let delay = self.retry.delay(attempt_number);
                        tracing::debug!(
                            model = %model_id,
                            attempt = attempt_number,
                            delay_ms = delay.as_millis() as u64,
                            "retrying after upstream failure"
                        );
                        tokio::select! {
                            _ = cancel.cancelled() => {
                                return Err(GatewayError::abort().with_model(&model_id, source));
                            }
                            _ = tokio::time::sleep(delay) => {}
                        }
                        attempt_number += 1;
                        continue;
                    }
                    return Err(err);
                }
            }
        }
    }

    async fn attempt(
        &self,
        request: &StreamRequest,
        attempt_number: u32,
        sink: &mut ChunkSink<'_>,
        cancel: &CancellationToken,
    ) -> Result<StreamSuccess, GatewayError> {
        let model = &request.model;
        let started = Instant::now();
        let url = self.routes.chat_url(model.source).to_string();
        tracing::debug!(
            request_id = %request.request_id,
            model = %model.id,
            attempt = attempt_number,
            "dispatching upstream attempt"
        );

        let mut body = serde_json::json!({
            "model": upstream_model_id(model.source, &model.id),
            "messages": request.messages,
            "stream": true,
        });
        if let Some(t) = request.temperature {
            body["temperature"] = t.into();
        }
        if let Some(m) = request.max_tokens {
            body["max_tokens"] = m.into();
        }

        let api_key = self.credential_for(model)?;

        let mut transaction = self.inspector.is_enabled().then(|| {
            let mut headers = vec![("Content-Type".to_string(), "application/json".to_string())];
            if api_key.is_some() {
                headers.push(("Authorization".to_string(), "Bearer <key>".to_string()));
            }
            self.inspector.start_transaction(CapturedRequest {
                method: "POST".to_string(),
                url: url.clone(),
                headers: redact_headers(&headers),
                body: Some(body.clone()),
            })
        });

        let mut req = self
            .http
            .post(&url)
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(key) = &api_key {
            req = req.bearer_auth(key);
        }

        let response = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(GatewayError::abort().with_model(&model.id, model.source));
            }
            result = req.json(&body).send() => {
                result.map_err(|e| classify_reqwest_error(&e).with_model(&model.id, model.source))?
            }
        };

        let status = response.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(response.headers());
            let text = tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(GatewayError::abort().with_model(&model.id, model.source));
                }
                text = response.text() => text.unwrap_or_default(),
            };
            let message = extract_upstream_message(&text, status.as_u16());
            self.finish_transaction(&mut transaction, status.as_u16(), &text);

            let err = if status.as_u16() == 429 {
                GatewayError::rate_limit(message, retry_after)
            } else {
                GatewayError::upstream(status.as_u16(), message)
            };
            return Err(err.with_model(&model.id, model.source));
        }

        let (content, ttft_ms) = self
            .consume_stream(response, started, sink, cancel, model, &mut transaction)
            .await?;

        let total_ms = started.elapsed().as_millis() as i64;
        self.finish_transaction(&mut transaction, status.as_u16(), &content);
        Ok(StreamSuccess {
            content,
            ttft_ms,
            total_ms,
            attempts: attempt_number,
        })
    }

    async fn consume_stream(
        &self,
        response: reqwest::Response,
        started: Instant,
        sink: &mut ChunkSink<'_>,
        cancel: &CancellationToken,
        model: &ModelDescriptor,
        transaction: &mut Option<CapturedTransaction>,
    ) -> Result<(String, Option<i64>), GatewayError> {
        let mut framer = SseFramer::new();
        let mut stream = response.bytes_stream();
        let mut content = String::new();
        let mut ttft_ms: Option<i64> = None;

        'read: loop {
            let item = tokio::select! {
                _ = cancel.cancelled() => {
                    // No buffered chunk may be forwarded past this point.
                    return Err(GatewayError::abort().with_model(&model.id, model.source));
                }
                item = tokio::time::timeout(self.idle_timeout, stream.next()) => match item {
                    Ok(item) => item,
                    Err(_) => {
                        return Err(GatewayError::network(format!(
                            "No upstream data for {}s mid-stream",
                            self.idle_timeout.as_secs()
                        ))
                        .with_model(&model.id, model.source));
                    }
                },
            };

            match item {
                // Closed without [DONE]: complete with whatever was buffered.
                None => break 'read,
                Some(Err(err)) => {
                    return Err(classify_reqwest_error(&err).with_model(&model.id, model.source));
                }
                Some(Ok(bytes)) => {
                    for event in framer.feed(&bytes) {
                        match event {
                            ChatStreamEvent::Chunk(text) => {
                                if ttft_ms.is_none() {
                                    ttft_ms = Some(started.elapsed().as_millis() as i64);
                                    if let Some(tx) = transaction.as_mut() {
                                        self.inspector.record_ttfb(tx);
                                    }
                                }
                                self.forward_chunk(sink, &text, cancel, model).await?;
                                content.push_str(&text);
                            }
                            ChatStreamEvent::Done => break 'read,
                            ChatStreamEvent::Error(msg) => {
                                self.finish_transaction(transaction, 200, &msg);
                                // In-band errors carry the response's own
                                // status, so a 200-stream error is terminal.
                                return Err(GatewayError::upstream(200, msg)
                                    .with_model(&model.id, model.source));
                            }
                        }
                    }
                }
            }
        }

        Ok((content, ttft_ms))
    }

    async fn forward_chunk(
        &self,
        sink: &mut ChunkSink<'_>,
        text: &str,
        cancel: &CancellationToken,
        model: &ModelDescriptor,
    ) -> Result<(), GatewayError> {
        match sink {
            ChunkSink::Callback(f) => {
                f(text);
                Ok(())
            }
            ChunkSink::Channel(tx) => {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        Err(GatewayError::abort().with_model(&model.id, model.source))
                    }
                    sent = tx.send(text.to_string()) => {
                        if sent.is_err() {
                            // Receiver gone: the client hung up.
                            Err(GatewayError::abort().with_model(&model.id, model.source))
                        } else {
                            Ok(())
                        }
                    }
                }
            }
        }
    }

    fn credential_for(&self, model: &ModelDescriptor) -> Result<Option<String>, GatewayError> {
        let keys = self.api_keys.read().expect("api keys lock");
        let key = match model.source {
            Source::Ollama => return Ok(None),
            Source::OpenCodeZen => keys.opencode_zen.clone(),
            Source::OpenRouter => keys.openrouter.clone(),
        };
        match key.filter(|k| !k.is_empty()) {
            Some(key) => Ok(Some(key)),
            None => Err(GatewayError::configuration(format!(
                "No API key configured for {}",
                model.source.as_str()
            ))
            .with_model(&model.id, model.source)),
        }
    }

    fn finish_transaction(
        &self,
        transaction: &mut Option<CapturedTransaction>,
        status: u16,
        body: &str,
    ) {
        if let Some(mut tx) = transaction.take() {
            self.inspector.complete_transaction(
                &mut tx,
                CapturedResponse {
                    status,
                    headers: vec![],
                    body_snippet: (!body.is_empty()).then(|| body_snippet(body)),
                },
            );
            self.inspector.store(tx);
        }
    }
}

fn classify_reqwest_error(err: &reqwest::Error) -> GatewayError {
    if err.is_timeout() {
        GatewayError::network(format!("Upstream timed out: {err}"))
    } else if err.is_connect() {
        GatewayError::network(format!("Upstream connect failed: {err}"))
    } else {
        GatewayError::network(format!("Upstream transport error: {err}"))
    }
}

fn parse_retry_after(headers: &header::HeaderMap) -> Option<u64> {
    headers
        .get(header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
}

/// Pull a human-readable message out of an upstream error body.
fn extract_upstream_message(body: &str, status: u16) -> String {
    if let Ok(json) = serde_json::from_str::<Value>(body) {
        if let Some(error) = json.get("error") {
            if let Some(msg) = error.as_str() {
                return msg.to_string();
            }
            if let Some(msg) = error.get("message").and_then(|m| m.as_str()) {
                return msg.to_string();
            }
        }
        if let Some(msg) = json.get("message").and_then(|m| m.as_str()) {
            return msg.to_string();
        }
    }

    let trimmed = body.trim();
    if trimmed.is_empty() {
        format!("HTTP {status}")
    } else {
        let snippet: String = trimmed.chars().take(MAX_ERROR_BODY_BYTES).collect();
        format!("HTTP {status}: {snippet}")
    }
}
