//! Usage: Per-model circuit breaker (closed/open/half-open) guarding upstream dispatch.

use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct CircuitEntry {
    consecutive_failures: u32,
    // Non-null iff consecutive_failures >= threshold.
    opened_at_unix_ms: Option<i64>,
}

#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub reset_ms: i64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_ms: 60_000,
        }
    }
}

/// Keyed failure tracker. All time is passed in by the caller so tests can
/// drive the state machine with a virtual clock.
///
/// Entries are created on first failure and deleted on any success, so a
/// model that has never failed (or has recovered) carries no state at all.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    entries: Mutex<HashMap<String, CircuitEntry>>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn state(&self, model: &str, now_unix_ms: i64) -> CircuitState {
        let entries = self.entries.lock().expect("circuit breaker lock");
        match entries.get(model) {
            Some(entry) => Self::derive(entry, self.config.reset_ms, now_unix_ms),
            None => CircuitState::Closed,
        }
    }

    pub fn is_open(&self, model: &str, now_unix_ms: i64) -> bool {
        self.state(model, now_unix_ms) == CircuitState::Open
    }

    /// `opened_at + reset_ms` while the circuit is open, else None.
    pub fn reset_at(&self, model: &str, now_unix_ms: i64) -> Option<i64> {
        let entries = self.entries.lock().expect("circuit breaker lock");
        let entry = entries.get(model)?;
        if Self::derive(entry, self.config.reset_ms, now_unix_ms) != CircuitState::Open {
            return None;
        }
        entry.opened_at_unix_ms.map(|at| at + self.config.reset_ms)
    }

    /// Returns the state derived after recording the failure.
    pub fn record_failure(&self, model: &str, now_unix_ms: i64) -> CircuitState {
        let mut entries = self.entries.lock().expect("circuit breaker lock");
        let entry = entries.entry(model.to_string()).or_insert(CircuitEntry {
            consecutive_failures: 0,
            opened_at_unix_ms: None,
        });

        let before = Self::derive(entry, self.config.reset_ms, now_unix_ms);
        entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);

        if before == CircuitState::HalfOpen {
            // A probe failed: re-open and restart the reset window.
            entry.opened_at_unix_ms = Some(now_unix_ms);
        } else if entry.opened_at_unix_ms.is_none()
            && entry.consecutive_failures >= self.config.failure_threshold
        {
            entry.opened_at_unix_ms = Some(now_unix_ms);
        }

        Self::derive(entry, self.config.reset_ms, now_unix_ms)
    }

    /// Any success deletes the entry, regardless of prior state.
    pub fn record_success(&self, model: &str) {
        self.entries
            .lock()
            .expect("circuit breaker lock")
            .remove(model);
    }

    pub fn tracked_models(&self) -> usize {
        self.entries.lock().expect("circuit breaker lock").len()
    }

    fn derive(entry: &CircuitEntry, reset_ms: i64, now_unix_ms: i64) -> CircuitState {
        match entry.opened_at_unix_ms {
            None => CircuitState::Closed,
            Some(opened_at) if now_unix_ms - opened_at > reset_ms => CircuitState::HalfOpen,
            Some(_) => CircuitState::Open,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig::default())
    }

    #[test]
    fn stays_closed_below_threshold() {
        let cb = breaker();
        for _ in 0..4 {
            assert_eq!(cb.record_failure("m", 1_000), CircuitState::Closed);
        }
        assert!(!cb.is_open("m", 1_000));
        assert_eq!(cb.reset_at("m", 1_000), None);
    }

    #[test]
    fn opens_at_threshold() {
        let cb = breaker();
        for _ in 0..4 {
            cb.record_failure("m", 1_000);
        }
        assert_eq!(cb.record_failure("m", 1_000), CircuitState::Open);
        assert!(cb.is_open("m", 1_500));
        assert_eq!(cb.reset_at("m", 1_500), Some(61_000));
    }

    #[test]
    fn half_open_after_reset_elapses() {
        let cb = breaker();
        for _ in 0..5 {
            cb.record_failure("m", 1_000);
        }
        assert!(cb.is_open("m", 61_000));
        assert_eq!(cb.state("m", 61_001), CircuitState::HalfOpen);
        assert!(!cb.is_open("m", 61_001));
    }

    #[test]
    fn half_open_failure_reopens_with_fresh_window() {
        let cb = breaker();
        for _ in 0..5 {
            cb.record_failure("m", 1_000);
        }
        assert_eq!(cb.record_failure("m", 62_000), CircuitState::Open);
        assert_eq!(cb.reset_at("m", 62_000), Some(122_000));
        assert!(cb.is_open("m", 121_999));
        assert_eq!(cb.state("m", 122_001), CircuitState::HalfOpen);
    }

    #[test]
    fn success_deletes_state() {
        let cb = breaker();
        for _ in 0..5 {
            cb.record_failure("m", 1_000);
        }
        cb.record_success("m");
        assert_eq!(cb.state("m", 1_000), CircuitState::Closed);
        assert_eq!(cb.tracked_models(), 0);
        // Idempotent: a second success on a clean model is a no-op.
        cb.record_success("m");
        assert_eq!(cb.tracked_models(), 0);
    }

    #[test]
    fn models_are_isolated() {
        let cb = breaker();
        for _ in 0..5 {
            cb.record_failure("a", 1_000);
        }
        assert!(cb.is_open("a", 1_000));
        assert!(!cb.is_open("b", 1_000));
        cb.record_failure("b", 1_000);
        assert!(cb.is_open("a", 1_000));
        assert_eq!(cb.state("b", 1_000), CircuitState::Closed);
    }

    #[test]
    fn open_until_exactly_reset_boundary() {
        let cb = breaker();
        for _ in 0..5 {
            cb.record_failure("m", 0);
        }
        // Strictly greater than reset_ms is required to go half-open.
        assert_eq!(cb.state("m", 60_000), CircuitState::Open);
        assert_eq!(cb.state("m", 60_001), CircuitState::HalfOpen);
    }
}
