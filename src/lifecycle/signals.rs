//! OS signal handling.
//!
//! # Responsibilities
//! - Register handlers for SIGTERM and SIGINT
//! - Resolve with the name of whichever arrives first
//!
//! # Design Decisions
//! - Uses Tokio's signal handling (async-safe)
//! - A handler that cannot be installed is logged and ignored, never fatal

use std::future::pending;

use tokio::signal::unix::{signal, SignalKind};

/// Wait for SIGTERM or SIGINT and return its name.
pub async fn wait_for_signal() -> &'static str {
    tokio::select! {
        name = wait_for(SignalKind::terminate(), "SIGTERM") => name,
        name = wait_for(SignalKind::interrupt(), "SIGINT") => name,
    }
}

async fn wait_for(kind: SignalKind, name: &'static str) -> &'static str {
    match signal(kind) {
        Ok(mut stream) => {
            stream.recv().await;
            name
        }
        Err(e) => {
            tracing::warn!(signal = name, error = %e, "Failed to install signal handler");
            pending().await
        }
    }
}
