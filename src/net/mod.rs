//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Startup
//!     → listener.rs (bind plain and TLS ports, fail fast)
//!     → tls.rs (load PEM certificate and key)
//!     → http::server (serve the bound sockets)
//! ```
//!
//! # Design Decisions
//! - Ports are bound before the upstream process starts
//! - TLS is optional; without it only the plain listener exists

pub mod listener;
pub mod tls;

pub use listener::{Listener, ListenerError};
pub use tls::load_tls_config;
