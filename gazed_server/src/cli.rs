//! CLI argument definitions.

use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "server", version, about = "Real-time gaze telemetry backend")]
pub struct Cli {
    /// Bind address (overrides the config file)
    #[arg(long, value_name = "ADDR")]
    pub host: Option<String>,

    /// Bind port (overrides the config file)
    #[arg(long, value_name = "PORT")]
    pub port: Option<u16>,

    /// Console log level (error|warn|info|debug|trace)
    #[arg(long = "log-level", value_name = "LEVEL", default_value = "info")]
    pub log_level: String,

    /// Path to config TOML; defaults apply when omitted
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,
}
