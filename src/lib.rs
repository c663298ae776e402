//! Edge proxy library.
//!
//! A single-binary HTTP front end for one application process: it forwards
//! requests to the application, caches cacheable responses in memory, serves
//! `X-Sendfile` files directly and supervises the application process itself.

// Core subsystems
pub mod cache;
pub mod proxy;
pub mod upstream;

// Serving
pub mod config;
pub mod http;
pub mod net;

// Cross-cutting concerns
pub mod lifecycle;
pub mod observability;

pub use config::schema::ProxyConfig;
pub use http::HttpServer;
pub use lifecycle::Shutdown;
