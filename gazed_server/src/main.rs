#![cfg_attr(all(not(debug_assertions), not(test)), deny(warnings))]
#![cfg_attr(
    all(not(debug_assertions), not(test)),
    deny(clippy::all, clippy::pedantic, clippy::nursery)
)]
#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]
//! Server entrypoint for the gaze telemetry backend.
//!
//! Responsibilities:
//! - Parse flags, load and validate the TOML config
//! - Initialize tracing and manage log sinks
//! - Build the session registry and serve the HTTP/SSE/WebSocket API
//! - Map failures to stable exit codes: 0 graceful shutdown, 1 config
//!   error, 2 fatal startup failure

use std::fs;
use std::sync::Arc;

use clap::Parser;
use eyre::WrapErr;
use gazed_config::Config;
use gazed_core::SessionRegistry;

use gazed_server::cli::Cli;
use gazed_server::routes;
use gazed_server::state::AppState;
use gazed_server::tracing_setup::init_tracing;

fn main() {
    let _ = color_eyre::install();
    let cli = Cli::parse();

    let cfg = match load_config(&cli) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("configuration error: {e:#}");
            std::process::exit(1);
        }
    };

    init_tracing(&cli.log_level, &cfg.logging);
    tracing::info!(
        host = %cfg.server.host,
        port = cfg.server.port,
        source = ?cfg.source.mode,
        "starting gaze telemetry server"
    );

    let registry = Arc::new(SessionRegistry::new(Arc::new(cfg.clone())));
    let app_state = AppState {
        registry: Arc::clone(&registry),
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!(error = %e, "failed to start async runtime");
            std::process::exit(2);
        }
    };

    let result = runtime.block_on(serve(app_state, &cfg));

    // Drain every live session before exit so exports are written.
    registry.stop_all();

    if let Err(e) = result {
        tracing::error!(error = %e, "fatal server error");
        std::process::exit(2);
    }
    tracing::info!("shutdown complete");
}

fn load_config(cli: &Cli) -> eyre::Result<Config> {
    let mut cfg = if let Some(path) = &cli.config {
        let text =
            fs::read_to_string(path).wrap_err_with(|| format!("read config {path:?}"))?;
        toml::from_str::<Config>(&text).wrap_err_with(|| format!("parse config {path:?}"))?
    } else {
        Config::default()
    };

    // Flags override the file.
    if let Some(host) = &cli.host {
        cfg.server.host = host.clone();
    }
    if let Some(port) = cli.port {
        cfg.server.port = port;
    }

    cfg.validate().wrap_err("invalid configuration")?;
    Ok(cfg)
}

async fn serve(app_state: AppState, cfg: &Config) -> eyre::Result<()> {
    let addr = format!("{}:{}", cfg.server.host, cfg.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .wrap_err_with(|| format!("bind {addr}"))?;
    tracing::info!(%addr, "listening");

    let app = routes::router(app_state);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .wrap_err("server error")
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        tracing::warn!("failed to install signal handler; running until killed");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received, draining sessions");
}
