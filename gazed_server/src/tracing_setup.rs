//! Tracing initialization: pretty console output filtered by the CLI level,
//! plus an optional JSON-lines file sink with configurable rotation.

use gazed_config::Logging;
use std::sync::OnceLock;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Keeps the non-blocking file writer alive for the process lifetime.
static FILE_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();

pub fn init_tracing(cli_level: &str, logging: &Logging) {
    // The config file can set a level; the CLI flag wins when both exist.
    let level = if cli_level == "info" {
        logging.level.as_deref().unwrap_or(cli_level)
    } else {
        cli_level
    };
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));

    let console = fmt::layer().with_target(false);

    if let Some(path) = &logging.file {
        let (dir, file) = split_log_path(path);
        let appender = match logging.rotation.as_deref() {
            Some("daily") => tracing_appender::rolling::daily(dir, file),
            Some("hourly") => tracing_appender::rolling::hourly(dir, file),
            _ => tracing_appender::rolling::never(dir, file),
        };
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let _ = FILE_GUARD.set(guard);
        let file_layer = fmt::layer().json().with_writer(writer).with_ansi(false);
        tracing_subscriber::registry()
            .with(filter)
            .with(console)
            .with(file_layer)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(console)
            .init();
    }
}

fn split_log_path(path: &str) -> (String, String) {
    let p = std::path::Path::new(path);
    let dir = p
        .parent()
        .filter(|d| !d.as_os_str().is_empty())
        .map_or_else(|| ".".to_string(), |d| d.display().to_string());
    let file = p
        .file_name()
        .map_or_else(|| "server.log".to_string(), |f| f.to_string_lossy().into_owned());
    (dir, file)
}
