//! Herald Server - Main entry point.
//!
//! This binary starts the Herald gateway with:
//! - Structured JSON logging
//! - Graceful shutdown handling (SIGTERM/SIGINT)
//! - Background eviction of expired identity cache rows
//!
//! # Configuration
//!
//! See [`herald_server::config`] for environment variable configuration.
//!
//! # Example
//!
//! ```bash
//! GATEWAY_AUTH_SERVER_URL="https://auth.example.com/api/verify" \
//! GATEWAY_APP_ID="herald" \
//! GATEWAY_APP_SECRET="secret" \
//! PORT=8080 \
//! cargo run --release --bin herald-server
//! ```

use std::process::ExitCode;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use herald_server::config::Config;
use herald_server::routes::{create_router, AppState};

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "Failed to load configuration");
            eprintln!("Error: {err}");
            eprintln!();
            eprintln!("Required environment variables:");
            eprintln!("  GATEWAY_AUTH_SERVER_URL        - Identity verification endpoint");
            eprintln!("  GATEWAY_APP_ID                 - Application id for broadcast triggers");
            eprintln!("  GATEWAY_APP_SECRET             - Application secret for broadcast triggers");
            eprintln!();
            eprintln!("Optional environment variables:");
            eprintln!("  PORT                           - HTTP server port (default: 8080)");
            eprintln!("  RUST_LOG                       - Log level filter (default: info)");
            eprintln!("  GATEWAY_ACK_FORWARD_URL        - Base URL for delivery acknowledgements");
            eprintln!("  GATEWAY_IDENTITY_TTL_SECS      - Identity cache lifetime (default: 3600)");
            eprintln!("  GATEWAY_UPSTREAM_TIMEOUT_SECS  - Upstream call timeout (default: 5)");
            eprintln!("  GATEWAY_EVICTION_INTERVAL_SECS - Cache sweep interval (default: 300)");
            return ExitCode::from(1);
        }
    };

    if let Err(err) = run(config).await {
        error!(error = ?err, "Server error");
        return ExitCode::from(1);
    }

    info!("Server shutdown complete");
    ExitCode::SUCCESS
}

async fn run(config: Config) -> Result<()> {
    info!(
        port = config.port,
        ack_forwarding = config.ack_forward_url.is_some(),
        identity_ttl_secs = config.identity_ttl.as_secs(),
        "Herald server starting"
    );

    let eviction_interval = config.eviction_interval;
    let bind_addr = format!("0.0.0.0:{}", config.port);

    let state = AppState::new(config).context("failed to build application state")?;

    let eviction_handle = state.resolver.cache().spawn_eviction_task(eviction_interval);
    info!(
        interval_secs = eviction_interval.as_secs(),
        "Identity eviction task started"
    );

    let app = create_router(state);

    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind to {bind_addr}"))?;
    info!(address = %bind_addr, "Server listening");

    let result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server terminated unexpectedly");

    info!("Server shutting down gracefully");
    eviction_handle.abort();
    info!("Identity eviction task stopped");

    result
}

/// Initialize structured logging with tracing.
///
/// JSON output, filtered by `RUST_LOG` (default `info`).
fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug,axum::rejection=trace"));

    let json_layer = fmt::layer()
        .json()
        .with_target(true)
        .with_level(true)
        .with_file(false)
        .with_line_number(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .init();
}

/// Resolves when SIGTERM or SIGINT is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
