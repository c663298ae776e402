//! Reverse proxy subsystem.
//!
//! # Data Flow
//! ```text
//! Request
//!     → sendfile.rs (advertise X-Sendfile, swap in file bodies)
//!     → cache (optional)
//!     → reverse_proxy.rs
//!         → rewrite.rs (URI, hop-by-hop, X-Forwarded-*)
//!         → transport.rs (unix socket | h2c | http/https)
//!     → Upstream
//! ```
//!
//! # Design Decisions
//! - The transport is chosen once at startup, never per request
//! - Upstream failures become 502 (or 413 for oversized bodies), never a dropped connection
//! - Protocol upgrades are tunnelled as raw bytes after the 101 response

pub mod reverse_proxy;
pub mod rewrite;
pub mod sendfile;
pub mod transport;

use thiserror::Error;

pub use reverse_proxy::{ProxyOptions, ReverseProxy};
pub use rewrite::ListenerScheme;
pub use sendfile::{SendfileLayer, SendfileService};

/// Errors from building or driving the reverse proxy.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("invalid proxy target url {url:?}: {reason}")]
    InvalidTarget { url: String, reason: String },

    #[error("invalid rewritten uri: {0}")]
    InvalidUri(#[from] axum::http::uri::InvalidUri),

    #[error("failed to build upstream request: {0}")]
    Request(#[from] axum::http::Error),

    #[error("upstream request failed: {0}")]
    Upstream(#[from] hyper_util::client::legacy::Error),
}
