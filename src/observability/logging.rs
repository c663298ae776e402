//! Structured logging.
//!
//! # Responsibilities
//! - Initialize the logging subsystem
//! - Select pretty or JSON output
//!
//! # Design Decisions
//! - Uses tracing crate for structured logging
//! - JSON format for production, pretty format for development
//! - `RUST_LOG` overrides the configured level

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::ObservabilityConfig;

/// Install the global subscriber. Calling it twice is harmless.
pub fn init(config: &ObservabilityConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(&config.log_level)));

    let registry = tracing_subscriber::registry().with(filter);
    let result = if config.log_format == "json" {
        registry.with(fmt::layer().json()).try_init()
    } else {
        registry.with(fmt::layer()).try_init()
    };

    if result.is_err() {
        tracing::debug!("Global subscriber already installed");
    }
}

fn default_directives(level: &str) -> String {
    format!("edge_proxy={level},tower_http={level},warn")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directives_scope_level_to_proxy_crates() {
        assert_eq!(
            default_directives("debug"),
            "edge_proxy=debug,tower_http=debug,warn"
        );
    }

    #[test]
    fn init_twice_does_not_panic() {
        let config = ObservabilityConfig::default();
        init(&config);
        init(&config);
    }
}
