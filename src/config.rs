//! Usage: Gateway configuration (TOML file + environment overrides + runtime save-back).
//!
//! Precedence: CLI flags > environment variables > config file > defaults.
//! CLI overrides are applied by the binary after loading.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::infra::spending::SpendingCaps;
use crate::infra::telemetry::TelemetryConfig;
use crate::scanner::{ScannerConfig, DEFAULT_OLLAMA_URL, DEFAULT_OPENROUTER_MODELS_URL};
use crate::shared::circuit_breaker::CircuitBreakerConfig;
use crate::shared::retry::RetryPolicy;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewaySection,
    #[serde(default)]
    pub api_keys: ApiKeysSection,
    #[serde(default)]
    pub scanner: ScannerSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub circuit: CircuitSection,
    #[serde(default)]
    pub spending: SpendingSection,
    #[serde(default)]
    pub telemetry: TelemetrySection,
    #[serde(default)]
    pub inspector: InspectorSection,
    #[serde(default)]
    pub fanout: FanoutSection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GatewaySection {
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ApiKeysSection {
    #[serde(default)]
    pub openrouter: Option<String>,
    #[serde(default)]
    pub opencode_zen: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScannerSection {
    #[serde(default = "default_ttl_seconds")]
    pub ttl_seconds: u64,
    #[serde(default = "default_ollama_url")]
    pub ollama_url: String,
    #[serde(default = "crate::scanner::default_zen_free_models")]
    pub zen_free_models: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrySection {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CircuitSection {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_reset_ms")]
    pub reset_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpendingSection {
    #[serde(default = "default_daily_cap")]
    pub daily_cap: f64,
    #[serde(default = "default_monthly_cap")]
    pub monthly_cap: f64,
    #[serde(default = "default_warn_at_percent")]
    pub warn_at_percent: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct TelemetrySection {
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InspectorSection {
    #[serde(default = "default_max_transactions")]
    pub max_transactions: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FanoutSection {
    #[serde(default = "default_max_models")]
    pub max_models: usize,
}

fn default_port() -> u16 {
    11434
}
fn default_ttl_seconds() -> u64 {
    300
}
fn default_ollama_url() -> String {
    DEFAULT_OLLAMA_URL.to_string()
}
fn default_max_attempts() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    1_000
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_failure_threshold() -> u32 {
    5
}
fn default_reset_ms() -> i64 {
    60_000
}
fn default_daily_cap() -> f64 {
    5.0
}
fn default_monthly_cap() -> f64 {
    50.0
}
fn default_warn_at_percent() -> u8 {
    80
}
fn default_batch_size() -> usize {
    10
}
fn default_flush_interval_ms() -> u64 {
    5_000
}
fn default_max_transactions() -> usize {
    1_000
}
fn default_max_models() -> usize {
    3
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            port: default_port(),
        }
    }
}

impl Default for ScannerSection {
    fn default() -> Self {
        Self {
            ttl_seconds: default_ttl_seconds(),
            ollama_url: default_ollama_url(),
            zen_free_models: crate::scanner::default_zen_free_models(),
        }
    }
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl Default for CircuitSection {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            reset_ms: default_reset_ms(),
        }
    }
}

impl Default for SpendingSection {
    fn default() -> Self {
        Self {
            daily_cap: default_daily_cap(),
            monthly_cap: default_monthly_cap(),
            warn_at_percent: default_warn_at_percent(),
        }
    }
}

impl Default for InspectorSection {
    fn default() -> Self {
        Self {
            max_transactions: default_max_transactions(),
        }
    }
}

impl Default for FanoutSection {
    fn default() -> Self {
        Self {
            max_models: default_max_models(),
        }
    }
}

impl Config {
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("multiai")
            .join("config.toml")
    }

    pub fn default_data_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("multiai")
    }

    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(Self::default_path())
    }

    pub fn load_from(path: PathBuf) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(&path) {
            Ok(content) => toml::from_str(&content).map_err(ConfigError::Parse),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(ConfigError::Io(e)),
        }
    }

    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(key) = std::env::var("OPENROUTER_API_KEY") {
            self.api_keys.openrouter = Some(key);
        }
        if let Ok(key) = std::env::var("OPENCODE_ZEN_API_KEY") {
            self.api_keys.opencode_zen = Some(key);
        }
        if let Some(port) = env_parse::<u16>("MULTIAI_PORT") {
            self.gateway.port = port;
        }
        if let Some(cap) = env_parse::<f64>("MULTIAI_DAILY_CAP") {
            self.spending.daily_cap = cap;
        }
        if let Some(cap) = env_parse::<f64>("MULTIAI_MONTHLY_CAP") {
            self.spending.monthly_cap = cap;
        }
        if let Some(percent) = env_parse::<u8>("MULTIAI_WARN_AT_PERCENT") {
            self.spending.warn_at_percent = percent;
        }
        self
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(Self::default_path())
    }

    pub fn save_to(&self, path: PathBuf) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(ConfigError::Io)?;
        }
        let content = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;
        std::fs::write(&path, content).map_err(ConfigError::Io)
    }

    // Conversions into component configs.

    pub fn scanner_config(&self) -> ScannerConfig {
        ScannerConfig {
            ttl: Duration::from_secs(self.scanner.ttl_seconds),
            ollama_url: self.scanner.ollama_url.clone(),
            openrouter_models_url: DEFAULT_OPENROUTER_MODELS_URL.to_string(),
            zen_free_models: self.scanner.zen_free_models.clone(),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            base_delay_ms: self.retry.base_delay_ms,
            max_delay_ms: self.retry.max_delay_ms,
        }
    }

    pub fn circuit_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.circuit.failure_threshold,
            reset_ms: self.circuit.reset_ms,
        }
    }

    pub fn spending_caps(&self) -> SpendingCaps {
        SpendingCaps {
            daily_cap: self.spending.daily_cap,
            monthly_cap: self.spending.monthly_cap,
            warn_at_percent: self.spending.warn_at_percent,
        }
    }

    pub fn telemetry_config(&self) -> TelemetryConfig {
        TelemetryConfig {
            endpoint: self.telemetry.endpoint.clone(),
            batch_size: self.telemetry.batch_size,
            flush_interval: Duration::from_millis(self.telemetry.flush_interval_ms),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
    Serialize(toml::ser::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Serialize(e) => write!(f, "Serialize error: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}
