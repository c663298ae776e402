//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP/TLS connection
//!     → server.rs (Axum setup, listeners, HTTPS redirect)
//!     → middleware (trace, request ID, access log, request start, timeout, body limit, gzip)
//!     → proxy::SendfileService → cache::CacheService → proxy::ReverseProxy
//!     → Send to client
//! ```

pub mod middleware;
pub mod request;
pub mod server;

pub use request::{X_REQUEST_ID, X_REQUEST_START};
pub use server::{Bindings, HttpServer};
