//! CertSentry - Certificate Transparency brand-protection monitor
//!
//! Polls an RFC 6962 CT log for newly issued certificates, records the ones
//! whose CN or DNS SANs contain a configured keyword, and serves the match
//! database over a small REST API.

use anyhow::{Context, Result};
use certsentry::api::{self, AppState};
use certsentry::config::Config;
use certsentry::ctlog::HttpLogClient;
use certsentry::monitor::{Monitor, MonitorError};
use certsentry::storage::Storage;
use clap::Parser;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = certsentry::config::Cli::parse();
    let config = Config::load_from_cli(cli)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.core.log_level)),
        )
        .init();

    info!("CertSentry starting up...");

    // =========================================================================
    // 1. Storage
    // =========================================================================
    let storage = Storage::connect(&config.database.url).await?;
    storage.run_migrations().await?;

    // Reset stale worker state from a previous process crash: the flag must
    // read false before the first start is accepted.
    storage
        .set_running(false)
        .await
        .context("failed to reset monitor state")?;

    // =========================================================================
    // 2. Services
    // =========================================================================
    let log_client = Arc::new(HttpLogClient::new(&config.ctlog.base_url)?);
    let monitor = Arc::new(Monitor::new(
        log_client,
        Arc::new(storage.clone()),
        Arc::new(storage.clone()),
        Arc::new(storage.clone()),
        config.ctlog.batch_size,
        config.ctlog.interval(),
        config.ctlog.reprocess_on_idle,
    ));

    // =========================================================================
    // 3. HTTP server
    // =========================================================================
    let cors = if config.server.cors_allow_origin == "*" {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        CorsLayer::new()
            .allow_origin(
                config
                    .server
                    .cors_allow_origin
                    .parse::<axum::http::HeaderValue>()
                    .context("invalid cors_allow_origin")?,
            )
            .allow_methods(Any)
            .allow_headers(Any)
    };

    let app = api::router(AppState {
        storage: storage.clone(),
        monitor: monitor.clone(),
    })
    .layer(TraceLayer::new_for_http())
    .layer(cors);

    let listener = tokio::net::TcpListener::bind(config.server.listen_address)
        .await
        .with_context(|| format!("failed to bind {}", config.server.listen_address))?;
    info!(addr = %config.server.listen_address, "server starting");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for shutdown signal");
            }
        })
        .await?;

    // =========================================================================
    // 4. Graceful shutdown
    // =========================================================================
    info!("shutting down");
    match monitor.stop().await {
        Ok(()) | Err(MonitorError::NotRunning) => {}
        Err(e) => warn!(error = %e, "failed to stop monitor cleanly"),
    }
    storage.close().await;

    Ok(())
}
