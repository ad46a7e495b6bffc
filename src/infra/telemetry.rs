//! Usage: Fire-and-forget telemetry queue (bounded buffer, batch + timer flush).

use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::shared::time::now_unix_millis;

// Hard bound on queued events; beyond this, new events are dropped rather
// than blocking or growing without limit.
const QUEUE_CAPACITY: usize = 512;

#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Batch sink URL; None disables sending entirely (events are drained
    /// and dropped), which is the local-only deployment mode.
    pub endpoint: Option<String>,
    pub batch_size: usize,
    pub flush_interval: Duration,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            batch_size: 10,
            flush_interval: Duration::from_secs(5),
        }
    }
}

/// Where flushed batches go. The capture variant makes flushes observable
/// from tests without a network.
pub enum TelemetrySink {
    Disabled,
    Http {
        client: reqwest::Client,
        endpoint: String,
    },
    Capture(Arc<Mutex<Vec<Vec<Value>>>>),
}

/// Cheap-clone handle to the shared queue.
#[derive(Clone)]
pub struct TelemetryLogger {
    inner: Arc<TelemetryInner>,
}

struct TelemetryInner {
    sink: TelemetrySink,
    batch_size: usize,
    flush_interval: Duration,
    queue: Mutex<Vec<Value>>,
}

impl TelemetryLogger {
    pub fn new(client: reqwest::Client, config: TelemetryConfig) -> Self {
        let sink = match config.endpoint {
            Some(endpoint) if !endpoint.is_empty() => TelemetrySink::Http { client, endpoint },
            _ => TelemetrySink::Disabled,
        };
        Self::with_sink(sink, config.batch_size, config.flush_interval)
    }

    pub fn with_sink(sink: TelemetrySink, batch_size: usize, flush_interval: Duration) -> Self {
        Self {
            inner: Arc::new(TelemetryInner {
                sink,
                batch_size: batch_size.max(1),
                flush_interval,
                queue: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Enqueue an event; never blocks the caller. Message content is never
    /// part of an event, only identifiers and timings.
    pub fn log(&self, event_type: &str, context: Value) {
        let mut event = serde_json::json!({
            "type": event_type,
            "timestamp": now_unix_millis(),
            "app_version": env!("CARGO_PKG_VERSION"),
            "platform": std::env::consts::OS,
        });
        if let (Some(target), Some(extra)) = (event.as_object_mut(), context.as_object()) {
            for (k, v) in extra {
                target.insert(k.clone(), v.clone());
            }
        }

        let should_flush = {
            let mut queue = self.inner.queue.lock().expect("telemetry queue lock");
            if queue.len() >= QUEUE_CAPACITY {
                return;
            }
            queue.push(event);
            queue.len() >= self.inner.batch_size
        };

        if should_flush {
            let this = self.clone();
            tokio::spawn(async move { this.flush().await });
        }
    }

    pub fn streaming_success(&self, model: &str, attempt_number: u32, ttft_ms: i64, total_ms: i64) {
        self.log(
            "streaming_success",
            serde_json::json!({
                "model": model,
                "attempt_number": attempt_number,
                "ttft_ms": ttft_ms,
                "total_ms": total_ms,
            }),
        );
    }

    pub fn streaming_error(&self, model: &str, attempt_number: u32, error_json: Value) {
        self.log(
            "streaming_error",
            serde_json::json!({
                "model": model,
                "attempt_number": attempt_number,
                "error": error_json,
            }),
        );
    }

    /// Drain the queue and hand the batch to the sink. Copies out under
    /// the lock and sends outside it; network failures are absorbed.
    pub async fn flush(&self) {
        let batch: Vec<Value> = {
            let mut queue = self.inner.queue.lock().expect("telemetry queue lock");
            std::mem::take(&mut *queue)
        };
        if batch.is_empty() {
            return;
        }

        match &self.inner.sink {
            TelemetrySink::Disabled => {}
            TelemetrySink::Http { client, endpoint } => {
                if let Err(err) = client.post(endpoint).json(&batch).send().await {
                    tracing::debug!(error = %err, "telemetry flush failed");
                }
            }
            TelemetrySink::Capture(batches) => {
                batches.lock().expect("telemetry capture lock").push(batch);
            }
        }
    }

    pub fn queued(&self) -> usize {
        self.inner.queue.lock().expect("telemetry queue lock").len()
    }

    pub fn spawn_flush_timer(&self) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(this.inner.flush_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                this.flush().await;
            }
        })
    }
}
