mod app;
mod cli;
mod config;
mod files;
mod identity;
mod info;
mod logging;
mod probe;
mod rate_limit;
mod session;
mod synthetic;
mod validate;

use std::net::SocketAddr;

use anyhow::Context;
use clap::Parser;
use system_utils::path::expand_tilde;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::app::{build_router, AppState};
use crate::cli::Args;
use crate::config::Config;
use crate::logging::init_tracing;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let log_dir = args.log_dir.as_deref().map(expand_tilde);
    let _log_guard = init_tracing(log_dir.as_deref(), args.log_to_stderr)?;

    let config_path = expand_tilde(&args.config);
    let config = Config::load_or_create(&config_path)?;
    let listen_addr = args
        .listen_addr
        .clone()
        .unwrap_or_else(|| config.server.bind.clone());

    let shutdown = CancellationToken::new();
    let state = AppState::from_config(&config, shutdown.clone())?;
    info!(
        config = %config_path.display(),
        listen_addr = %listen_addr,
        probe_timeout = ?state.limits.probe_timeout,
        rate_window = ?state.limits.rate_window,
        rate_threshold = state.limits.rate_threshold,
        trust_proxy_headers = state.trust_proxy_headers,
        "looking glass starting"
    );
    let app = build_router(state);

    let listener = TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("failed to bind {listen_addr}"))?;
    info!(addr = %listen_addr, "looking glass listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(wait_for_shutdown(shutdown.clone()))
    .await?;
    info!("looking glass shutting down");
    shutdown.cancel();
    Ok(())
}

async fn wait_for_shutdown(shutdown: CancellationToken) {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
    shutdown.cancel();
}
