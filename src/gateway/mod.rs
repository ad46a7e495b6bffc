//! Usage: OpenAI-compatible HTTP surface (router assembly + shared application state).
//!
//! Endpoints:
//! - GET /health
//! - GET /v1/models, GET /v1/models/grouped
//! - POST /v1/chat/completions (streaming + non-streaming)
//! - GET/DELETE /v1/inspect
//! - GET/PUT /api/settings, GET/POST /api/settings/spending

pub mod fanout;
pub mod handlers;
pub mod sse;
pub mod stream_client;
pub mod types;

use axum::{
    routing::{delete, get, post, put},
    Router,
};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use tower_http::cors::{Any, CorsLayer};

use crate::config::{ApiKeysSection, Config};
use crate::infra::inspector::TrafficInspector;
use crate::infra::spending::SpendingLedger;
use crate::infra::telemetry::TelemetryLogger;
use crate::scanner::FreeModelScanner;
use crate::shared::circuit_breaker::CircuitBreaker;
use fanout::FanoutRouter;
use stream_client::{StreamingClient, UpstreamRoutes, DEFAULT_REQUEST_TIMEOUT};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<RwLock<Config>>,
    pub config_path: Option<PathBuf>,
    pub api_keys: Arc<RwLock<ApiKeysSection>>,
    pub scanner: FreeModelScanner,
    pub inspector: Arc<TrafficInspector>,
    pub ledger: Arc<SpendingLedger>,
    pub telemetry: TelemetryLogger,
    pub router: Arc<FanoutRouter>,
}

impl AppState {
    /// Wire the full component graph from a loaded config and an opened
    /// ledger. `config_path` enables settings save-back when present.
    pub fn with_ledger(
        config: Config,
        config_path: Option<PathBuf>,
        ledger: SpendingLedger,
    ) -> Self {
        let scanner_config = config.scanner_config();
        let routes = UpstreamRoutes::with_ollama_base(&config.scanner.ollama_url);
        Self::with_parts(config, config_path, ledger, scanner_config, routes)
    }

    /// Fully injected variant: tests point the scanner and upstream routes
    /// at stub servers.
    pub fn with_parts(
        config: Config,
        config_path: Option<PathBuf>,
        ledger: SpendingLedger,
        scanner_config: crate::scanner::ScannerConfig,
        routes: UpstreamRoutes,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        let api_keys = Arc::new(RwLock::new(config.api_keys.clone()));
        let scanner = FreeModelScanner::new(http.clone(), scanner_config);
        let telemetry = TelemetryLogger::new(http.clone(), config.telemetry_config());
        let inspector = Arc::new(TrafficInspector::new(config.inspector.max_transactions));
        let circuit = Arc::new(CircuitBreaker::new(config.circuit_config()));
        let streaming = Arc::new(StreamingClient::new(
            http,
            routes,
            api_keys.clone(),
            circuit,
            config.retry_policy(),
            telemetry.clone(),
            inspector.clone(),
        ));
        let ledger = Arc::new(ledger);
        let router = Arc::new(FanoutRouter::new(
            scanner.clone(),
            streaming,
            ledger.clone(),
            telemetry.clone(),
            config.fanout.max_models,
        ));

        Self {
            config: Arc::new(RwLock::new(config)),
            config_path,
            api_keys,
            scanner,
            inspector,
            ledger,
            telemetry,
            router,
        }
    }

    /// In-memory ledger, no save-back; used by tests and ad-hoc embeds.
    pub fn in_memory(config: Config) -> Self {
        let ledger = SpendingLedger::in_memory(config.spending_caps())
            .expect("in-memory ledger always opens");
        Self::with_ledger(config, None, ledger)
    }
}

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/v1/models", get(handlers::list_models))
        .route("/v1/models/grouped", get(handlers::list_models_grouped))
        .route("/v1/chat/completions", post(handlers::chat_completions))
        .route("/v1/inspect", get(handlers::get_inspect))
        .route("/v1/inspect", delete(handlers::clear_inspect))
        .route("/api/settings", get(handlers::get_settings))
        .route("/api/settings", put(handlers::update_settings))
        .route("/api/settings/spending", get(handlers::get_spending))
        .route("/api/settings/spending", post(handlers::update_spending))
        .with_state(Arc::new(state))
        .layer(cors)
}
