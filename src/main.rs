//! Edge proxy
//!
//! Fronts one application process with a reverse proxy, a response cache and
//! X-Sendfile offload, and supervises that process.
//!
//! # Architecture Overview
//!
//! ```text
//!     Client ──▶ net listener ──▶ http server (middleware)
//!                                      │
//!                                      ▼
//!                              proxy::sendfile ──▶ X-Sendfile file
//!                                      │
//!                                      ▼
//!                              cache (memory) ──▶ hit / 304
//!                                      │
//!                                      ▼
//!                              proxy::reverse_proxy ──▶ unix | h2c | http(s) ──▶ application
//!                                                                                  ▲
//!     lifecycle ── signals, shutdown ── upstream::Supervisor ── spawn / stop ──────┘
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use edge_proxy::config::loader::{load_config, parse_config};
use edge_proxy::lifecycle;
use edge_proxy::observability::logging;

#[derive(Parser)]
#[command(name = "edge-proxy")]
#[command(about = "Reverse proxy, response cache and process supervisor for one application", long_about = None)]
struct Cli {
    /// Path to the TOML configuration file. Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => load_config(path),
        None => parse_config(""),
    };
    let config = match config {
        Ok(config) => config,
        Err(e) => {
            eprintln!("edge-proxy: {e}");
            return ExitCode::FAILURE;
        }
    };

    logging::init(&config.observability);
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.http.port,
        tls = config.http.tls.is_some(),
        target = %config.resolved_target_url(),
        upstream = config.upstream.enabled,
        "edge-proxy starting"
    );

    match lifecycle::run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "edge-proxy stopped with an error");
            ExitCode::FAILURE
        }
    }
}
