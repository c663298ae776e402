//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! --config file (TOML), or defaults
//!     → loader.rs (parse & deserialize, derive upstream port)
//!     → validation.rs (semantic checks, all errors at once)
//!     → ProxyConfig
//!     → lifecycle::startup (target URL and socket resolved from proxy + upstream)
//! ```
//!
//! # Design Decisions
//! - Config is read once at startup; changes require a restart
//! - Every section has defaults so a minimal file only names the target
//! - Serde handles syntax, validation.rs handles meaning

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{
    CacheConfig, HttpConfig, ObservabilityConfig, ProxyConfig, ProxySettings, TlsConfig,
    UpstreamConfig,
};
pub use validation::ValidationError;
