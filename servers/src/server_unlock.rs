//! # Unlock Checker Server
//!
//! Daemon that periodically evaluates every endpoint of a proxy fleet against
//! a region-restricted media service and exposes the results over HTTP.
//!
//! ## Functionality:
//! - **Configuration**: `.env` files, then CLI/environment overrides, then the
//!   YAML file loaded by `lib_unlock` (a template is written when missing).
//! - **Logging**: console plus daily rolling JSON files through `tracing`.
//! - **Scheduling**: the cron loop of the checker starts with the process.
//! - **HTTP API**: `axum` routes for status, scheduler control, manual runs,
//!   results and the subscription document.
//! - **Graceful Shutdown**: `tokio-graceful` waits for Ctrl-C or SIGTERM; the
//!   in-flight endpoint finishes, a partial snapshot is saved and the engine
//!   process is stopped.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio_graceful::Shutdown;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use lib_unlock::{setup_logging, UnlockService};

mod unlock_logic;
use unlock_logic::api::{self, ApiState};
use unlock_logic::config::{load_dotenv, Cli};

/// Grace period for HTTP connections after the shutdown signal.
const HTTP_SHUTDOWN_LIMIT: Duration = Duration::from_secs(10);
/// Grace period for the endpoint being evaluated when the signal arrives.
const RUN_SHUTDOWN_LIMIT: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<()> {
    load_dotenv();
    let cli = Cli::parse();

    let _log_guard = setup_logging(&cli.logging_options()).context("logging setup failed")?;

    let config = Arc::new(cli.load_app_config()?);
    if config.http_server.access_key == "change-me" {
        warn!("http_server.access_key is still the default, change it");
    }
    if config.config_urls.is_empty() {
        warn!("config_urls is empty, every run will fail until fleet documents are configured");
    }

    let cancel = CancellationToken::new();
    let service = Arc::new(UnlockService::build(Arc::clone(&config), cancel.clone())?);
    service.start_scheduler();

    let app = api::router(ApiState::new(
        Arc::clone(&service),
        &config.http_server.access_key,
    ));
    let addr = SocketAddr::from(([0, 0, 0, 0], config.http_server.port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("cannot bind {}", addr))?;
    info!("HTTP API listening on http://{}", addr);

    let shutdown = Shutdown::default();
    shutdown.spawn_task_fn(move |guard| async move {
        let on_signal = async move {
            guard.cancelled().await;
            info!("Signal received: initiate graceful shutdown");
            cancel.cancel();
        };
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(on_signal)
            .await
        {
            error!("HTTP server failed: {}", e);
        }
    });

    match shutdown.shutdown_with_limit(HTTP_SHUTDOWN_LIMIT).await {
        Ok(elapsed) => info!(
            "shutdown: HTTP API closed {}s after shutdown signal received",
            elapsed.as_secs_f64()
        ),
        Err(e) => warn!("shutdown: HTTP API closed forcefully due to timeout: {}", e),
    }

    service.shutdown(RUN_SHUTDOWN_LIMIT).await;
    info!("Bye!");
    Ok(())
}
