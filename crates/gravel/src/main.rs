//! # Gravel - Cluster Node Manager
//!
//! Issues join tokens, tracks cluster membership and keeps one duplex
//! channel open per active node.
//!
//! ## Join handshake
//! ```text
//! node ── POST /nodes/join {address, token} ──▶ manager   (Joining)
//! node ── WS /nodes/ws {"type":"hello"} ──────▶ manager   (Active)
//! node ◀─ welcome / membership updates ─────── manager
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use gravel_common::TokenPolicy;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

mod config;
mod join;
mod manager;
mod membership;
mod registry;
mod routes;
mod session;
mod state;
mod tokens;

use config::AppConfig;
use state::AppState;

/// Gravel - cluster node manager
#[derive(Parser, Debug)]
#[command(name = "gravel")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config/gravel.toml")]
    config: String,

    /// Listen address (overrides config)
    #[arg(short, long, env = "LISTEN_ADDR")]
    listen: Option<String>,

    /// Join token policy: single_use or multi_use (overrides config)
    #[arg(long, env = "TOKEN_POLICY")]
    token_policy: Option<TokenPolicy>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "LOG_LEVEL")]
    log_level: String,

    /// Enable JSON logging output
    #[arg(long, default_value = "false")]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is fine
    dotenvy::dotenv().ok();

    // Parse CLI arguments
    let args = Args::parse();

    // Initialize logging
    init_logging(&args.log_level, args.json_logs)?;

    info!("Starting Gravel node manager v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = AppConfig::load(&args.config, &args)?;
    info!(
        path = %args.config,
        policy = %config.token.policy,
        "Configuration loaded"
    );

    // Create shutdown broadcast channel
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    // Initialize application state
    let state = AppState::new(config.clone(), shutdown_tx.clone());

    // Spawn membership sweeper
    tokio::spawn(state.manager.clone().run_sweeper(shutdown_tx.subscribe()));

    // Spawn token rotation, if configured
    if let Some(period) = config.token.rotate_interval() {
        tokio::spawn(state.manager.clone().run_rotation(period, shutdown_tx.subscribe()));
    }

    if config.token.issue_on_start {
        let token = state.manager.issue_token(None, None).await;
        info!(
            fingerprint = %token.fingerprint(),
            "Initial join token ready, fetch it from GET /nodes/token"
        );
    }

    // Build router
    let app = routes::create_router(state);

    // Start server
    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen_addr))?;
    info!("Gravel listening on {}", config.listen_addr);

    // Handle graceful shutdown
    let shutdown_signal = async move {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
        info!("Shutdown signal received");
        let _ = shutdown_tx.send(());
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("Server error")?;

    info!("Gravel shutdown complete");
    Ok(())
}

/// Initialize structured logging with tracing
fn init_logging(level: &str, json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }

    Ok(())
}
