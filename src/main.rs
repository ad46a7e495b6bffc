//! MultiAI CLI - local gateway for free-tier LLMs.

use clap::{Parser, Subcommand};
use multiai::config::Config;
use multiai::gateway::{create_router, AppState};
use multiai::infra::spending::SpendingLedger;
use multiai::scanner;
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::signal;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "multiai")]
#[command(about = "OpenAI-compatible gateway aggregating free-tier LLM providers")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway server
    Serve {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Config file path
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// List discovered free models and exit
    Models {
        /// Config file path
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Show current configuration
    Config {
        /// Show config file path only
        #[arg(long)]
        path: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Serve { port, config }) => run_server(port, config).await?,
        Some(Commands::Models { config }) => list_models(config).await?,
        Some(Commands::Config { path }) => show_config(path)?,
        None => run_server(None, None).await?,
    }

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("multiai=info,tower_http=warn")),
        )
        .init();
}

fn load_config(path: Option<PathBuf>) -> anyhow::Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(Config::default_path);
    let config = Config::load_from(path.clone())?.with_env_overrides();
    Ok((config, path))
}

async fn run_server(port_override: Option<u16>, config_path: Option<PathBuf>) -> anyhow::Result<()> {
    init_tracing();

    let (config, config_path) = load_config(config_path)?;
    let port = port_override.unwrap_or(config.gateway.port);
    let addr = SocketAddr::from(([127, 0, 0, 1], port));

    let data_dir = Config::default_data_dir();
    std::fs::create_dir_all(&data_dir)?;
    let ledger = SpendingLedger::open(data_dir.join("spending.db"), config.spending_caps())?;

    let state = AppState::with_ledger(config, Some(config_path), ledger);

    // Background tasks: catalog warmer and telemetry flush timer.
    let refresher = scanner::spawn_refresher(state.scanner.clone());
    let flusher = state.telemetry.spawn_flush_timer();

    let app = create_router(state);

    println!("→ MultiAI starting on http://{addr}");
    println!("→ OpenAI-compatible API: http://{addr}/v1");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Gateway listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    refresher.abort();
    flusher.abort();
    println!("\nGateway stopped.");
    Ok(())
}

async fn list_models(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let (config, _) = load_config(config_path)?;
    let scanner = scanner::FreeModelScanner::new(
        reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?,
        config.scanner_config(),
    );

    let models = scanner.list(true).await;
    if models.is_empty() {
        println!("No free models discovered.");
        return Ok(());
    }
    for model in models {
        println!(
            "{:<14} {:<40} {}",
            model.source.as_str(),
            model.id,
            model.display_name
        );
    }
    Ok(())
}

fn show_config(show_path: bool) -> anyhow::Result<()> {
    if show_path {
        println!("{}", Config::default_path().display());
        return Ok(());
    }

    let config = Config::load()?.with_env_overrides();
    println!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
