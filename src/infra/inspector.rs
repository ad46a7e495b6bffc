//! Usage: Bounded capture of upstream transactions with timings and HAR export.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use std::time::Instant;
use uuid::Uuid;

const MAX_BODY_SNIPPET_BYTES: usize = 2048;

/// A captured upstream transaction (request + response + timings).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapturedTransaction {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub request: CapturedRequest,
    pub response: Option<CapturedResponse>,
    pub timing: TimingMetrics,
    #[serde(skip)]
    start_instant: Option<Instant>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapturedRequest {
    pub method: String,
    pub url: String,
    /// Credential values are redacted before capture.
    pub headers: Vec<(String, String)>,
    pub body: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapturedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body_snippet: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TimingMetrics {
    pub total_ms: u64,
    /// Time to first byte/token.
    pub ttfb_ms: Option<u64>,
    pub tokens_per_sec: Option<f64>,
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
}

impl TimingMetrics {
    pub fn calculate_tps(&self) -> Option<f64> {
        let completion_tokens = f64::from(self.completion_tokens?);
        let generation_ms = self.total_ms as f64 - self.ttfb_ms.unwrap_or(0) as f64;
        if generation_ms <= 0.0 {
            return None;
        }
        Some(completion_tokens / (generation_ms / 1000.0))
    }
}

/// Replace credential header values before they reach the buffer.
pub fn redact_headers(headers: &[(String, String)]) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(name, value)| {
            let lowered = name.to_ascii_lowercase();
            if lowered == "authorization" || lowered.contains("api-key") {
                (name.clone(), "***".to_string())
            } else {
                (name.clone(), value.clone())
            }
        })
        .collect()
}

/// Truncate a response body to a bounded UTF-8 snippet.
pub fn body_snippet(body: &str) -> String {
    if body.len() <= MAX_BODY_SNIPPET_BYTES {
        return body.to_string();
    }
    let mut end = MAX_BODY_SNIPPET_BYTES;
    while end > 0 && !body.is_char_boundary(end) {
        end -= 1;
    }
    body[..end].to_string()
}

/// Ring buffer of captured transactions. Participation is opt-in per call;
/// the disabled path is a single atomic load.
pub struct TrafficInspector {
    transactions: RwLock<VecDeque<CapturedTransaction>>,
    enabled: AtomicBool,
    max_transactions: usize,
}

impl TrafficInspector {
    pub fn new(max_transactions: usize) -> Self {
        Self {
            transactions: RwLock::new(VecDeque::new()),
            enabled: AtomicBool::new(true),
            max_transactions: max_transactions.max(1),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn start_transaction(&self, request: CapturedRequest) -> CapturedTransaction {
        CapturedTransaction {
            id: Uuid::new_v4().to_string(),
            started_at: Utc::now(),
            ended_at: None,
            request,
            response: None,
            timing: TimingMetrics::default(),
            start_instant: Some(Instant::now()),
        }
    }

    pub fn record_ttfb(&self, transaction: &mut CapturedTransaction) {
        if let Some(start) = transaction.start_instant {
            transaction.timing.ttfb_ms = Some(start.elapsed().as_millis() as u64);
        }
    }

    pub fn record_tokens(
        &self,
        transaction: &mut CapturedTransaction,
        prompt_tokens: u32,
        completion_tokens: u32,
    ) {
        transaction.timing.prompt_tokens = Some(prompt_tokens);
        transaction.timing.completion_tokens = Some(completion_tokens);
        transaction.timing.tokens_per_sec = transaction.timing.calculate_tps();
    }

    pub fn complete_transaction(
        &self,
        transaction: &mut CapturedTransaction,
        response: CapturedResponse,
    ) {
        if let Some(start) = transaction.start_instant {
            transaction.timing.total_ms = start.elapsed().as_millis() as u64;
        }
        transaction.ended_at = Some(Utc::now());
        transaction.response = Some(response);
    }

    /// Append, evicting the oldest entry once the buffer is full.
    pub fn store(&self, transaction: CapturedTransaction) {
        if !self.is_enabled() {
            return;
        }
        let mut transactions = self.transactions.write().expect("inspector lock");
        if transactions.len() >= self.max_transactions {
            transactions.pop_front();
        }
        transactions.push_back(transaction);
    }

    pub fn get_all(&self) -> Vec<CapturedTransaction> {
        self.transactions
            .read()
            .expect("inspector lock")
            .iter()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.transactions.read().expect("inspector lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.transactions.write().expect("inspector lock").clear();
    }

    /// HAR 1.2 document of everything captured.
    pub fn export_har(&self) -> serde_json::Value {
        let transactions = self.get_all();

        let entries: Vec<serde_json::Value> = transactions
            .iter()
            .map(|tx| {
                serde_json::json!({
                    "startedDateTime": tx.started_at.to_rfc3339(),
                    "time": tx.timing.total_ms,
                    "request": {
                        "method": tx.request.method,
                        "url": tx.request.url,
                        "headers": tx.request.headers.iter().map(|(k, v)| {
                            serde_json::json!({"name": k, "value": v})
                        }).collect::<Vec<_>>(),
                        "postData": tx.request.body.as_ref().map(|b| {
                            serde_json::json!({
                                "mimeType": "application/json",
                                "text": b.to_string()
                            })
                        }),
                    },
                    "response": tx.response.as_ref().map(|r| {
                        serde_json::json!({
                            "status": r.status,
                            "headers": r.headers.iter().map(|(k, v)| {
                                serde_json::json!({"name": k, "value": v})
                            }).collect::<Vec<_>>(),
                            "content": r.body_snippet.as_ref().map(|b| {
                                serde_json::json!({
                                    "mimeType": "application/json",
                                    "text": b
                                })
                            }),
                        })
                    }),
                    "timings": {
                        "total": tx.timing.total_ms,
                        "ttfb": tx.timing.ttfb_ms,
                    },
                    "_llmMetrics": {
                        "promptTokens": tx.timing.prompt_tokens,
                        "completionTokens": tx.timing.completion_tokens,
                        "tokensPerSecond": tx.timing.tokens_per_sec,
                    }
                })
            })
            .collect();

        serde_json::json!({
            "log": {
                "version": "1.2",
                "creator": {
                    "name": "multiai",
                    "version": env!("CARGO_PKG_VERSION"),
                },
                "entries": entries,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> CapturedRequest {
        CapturedRequest {
            method: "POST".to_string(),
            url: "https://openrouter.ai/api/v1/chat/completions".to_string(),
            headers: vec![("Content-Type".to_string(), "application/json".to_string())],
            body: Some(serde_json::json!({"model": "test", "messages": []})),
        }
    }

    #[test]
    fn captures_request_and_response_with_timing() {
        let inspector = TrafficInspector::new(1000);
        let mut tx = inspector.start_transaction(request());

        std::thread::sleep(std::time::Duration::from_millis(10));
        inspector.complete_transaction(
            &mut tx,
            CapturedResponse {
                status: 200,
                headers: vec![],
                body_snippet: Some("{\"choices\":[]}".to_string()),
            },
        );

        assert!(tx.response.is_some());
        assert!(tx.ended_at.is_some());
        assert!(tx.timing.total_ms >= 10);
    }

    #[test]
    fn ring_buffer_evicts_oldest() {
        let inspector = TrafficInspector::new(3);
        for i in 0..5 {
            let mut req = request();
            req.url = format!("https://example.com/{i}");
            inspector.store(inspector.start_transaction(req));
        }

        let all = inspector.get_all();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].request.url, "https://example.com/2");
        assert_eq!(all[2].request.url, "https://example.com/4");
    }

    #[test]
    fn disabled_inspector_stores_nothing() {
        let inspector = TrafficInspector::new(1000);
        inspector.set_enabled(false);
        inspector.store(inspector.start_transaction(request()));
        assert!(inspector.is_empty());
    }

    #[test]
    fn redacts_credential_headers() {
        let headers = vec![
            ("Authorization".to_string(), "Bearer sk-secret".to_string()),
            ("X-Api-Key".to_string(), "key123".to_string()),
            ("Content-Type".to_string(), "application/json".to_string()),
        ];
        let redacted = redact_headers(&headers);
        assert_eq!(redacted[0].1, "***");
        assert_eq!(redacted[1].1, "***");
        assert_eq!(redacted[2].1, "application/json");
    }

    #[test]
    fn body_snippet_is_bounded() {
        let long = "x".repeat(10_000);
        assert_eq!(body_snippet(&long).len(), MAX_BODY_SNIPPET_BYTES);
        assert_eq!(body_snippet("short"), "short");
    }

    #[test]
    fn exports_har_with_llm_metrics() {
        let inspector = TrafficInspector::new(1000);
        let mut tx = inspector.start_transaction(request());
        inspector.record_ttfb(&mut tx);
        inspector.record_tokens(&mut tx, 100, 50);
        inspector.complete_transaction(
            &mut tx,
            CapturedResponse {
                status: 200,
                headers: vec![],
                body_snippet: Some("{}".to_string()),
            },
        );
        inspector.store(tx);

        let har = inspector.export_har();
        assert_eq!(har["log"]["version"], "1.2");
        let entries = har["log"]["entries"].as_array().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0]["_llmMetrics"]["promptTokens"], 100);
        assert_eq!(entries[0]["_llmMetrics"]["completionTokens"], 50);
    }

    #[test]
    fn tokens_per_second_excludes_ttfb() {
        let timing = TimingMetrics {
            total_ms: 2000,
            ttfb_ms: Some(200),
            tokens_per_sec: None,
            prompt_tokens: Some(100),
            completion_tokens: Some(50),
        };
        let tps = timing.calculate_tps().unwrap();
        assert!(tps > 20.0 && tps < 35.0);
    }

    #[test]
    fn clear_empties_the_buffer() {
        let inspector = TrafficInspector::new(1000);
        inspector.store(inspector.start_transaction(request()));
        assert_eq!(inspector.len(), 1);
        inspector.clear();
        assert!(inspector.is_empty());
    }
}
