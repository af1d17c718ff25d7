//! Huddle Server - Main entry point.
//!
//! This binary starts the Huddle chat server with:
//! - Structured JSON logging for production
//! - Graceful shutdown handling (SIGTERM/SIGINT)
//! - Hub shutdown that closes every connection and drains every room
//!
//! # Configuration
//!
//! See [`huddle_server::config`] for environment variable configuration.
//!
//! # Example
//!
//! ```bash
//! # Development mode (identity from ?user=)
//! HUDDLE_UNSAFE_NO_AUTH=true cargo run --bin huddle-server
//!
//! # Production mode
//! HUDDLE_TOKEN_KEY="$(openssl rand -base64 32)" \
//! PORT=8080 \
//! cargo run --release --bin huddle-server
//! ```

use std::process::ExitCode;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use huddle_server::config::Config;
use huddle_server::routes::{create_router, AppState};

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "Failed to load configuration");
            eprintln!("Error: {err}");
            eprintln!();
            eprintln!("Optional environment variables:");
            eprintln!("  PORT                        - HTTP server port (default: 8080)");
            eprintln!("  HUDDLE_DEFAULT_ROOM         - Room joined without ?room= (default: default)");
            eprintln!("  HUDDLE_TOKEN_KEY            - Base64 32-byte token signing seed");
            eprintln!("  HUDDLE_TOKEN_TTL_SECS       - Token lifetime (default: 86400)");
            eprintln!("  HUDDLE_MAILBOX_CAPACITY     - Per-connection queue (default: 256)");
            eprintln!("  HUDDLE_ROOM_INBOX_CAPACITY  - Per-room queue (default: 128)");
            eprintln!("  HUDDLE_UPLOAD_DIR           - Avatar upload directory (default: uploads)");
            eprintln!("  HUDDLE_UNSAFE_NO_AUTH       - Identity from ?user= (dev only, 'true')");
            eprintln!("  RUST_LOG                    - Log level filter (default: info)");
            return ExitCode::from(1);
        }
    };

    match run(config).await {
        Ok(()) => {
            info!("Server shutdown complete");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!(error = ?err, "Server error");
            ExitCode::from(1)
        }
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    let auth_mode = if config.unsafe_no_auth {
        "disabled (UNSAFE)"
    } else {
        "token"
    };
    info!(
        port = config.port,
        auth_mode,
        default_room = %config.default_room,
        mailbox_capacity = config.mailbox_capacity,
        room_inbox_capacity = config.room_inbox_capacity,
        upload_dir = %config.upload_dir.display(),
        "Huddle server starting"
    );

    let state = AppState::new(config.clone());
    let hub = state.hub.clone();
    let app = create_router(state);

    let bind_addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind to {bind_addr}"))?;
    info!(address = %bind_addr, "Server listening");

    let shutdown_hub = hub.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            // Open sockets keep axum waiting until their sessions end.
            shutdown_hub.shutdown().await;
        })
        .await
        .context("server terminated unexpectedly")?;

    info!("Server shutting down gracefully");
    hub.shutdown().await;
    Ok(())
}

/// Initialize structured logging with tracing.
///
/// JSON output, filtered by `RUST_LOG` (default `info,tower_http=debug`).
fn init_logging() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));

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

/// Resolves when SIGINT or SIGTERM is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!(error = %err, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
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
