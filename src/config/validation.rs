//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate the proxy target and cache limits
//! - Check the supervised upstream has something to run
//! - Detect conflicting listener ports
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ProxyConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use thiserror::Error;
use url::Url;

use crate::config::schema::ProxyConfig;

/// A single semantic problem found in the configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("proxy target url {url:?} is invalid: {reason}")]
    InvalidTargetUrl { url: String, reason: String },

    #[error("proxy enabled but no target url and no upstream configured")]
    MissingTarget,

    #[error("upstream enabled but command not configured")]
    EmptyUpstreamCommand,

    #[error("cache enabled with zero {0}")]
    InvalidCacheLimit(&'static str),

    #[error("https port {0} collides with the http port")]
    PortConflict(u16),

    #[error("unknown log format {0:?} (expected \"pretty\" or \"json\")")]
    UnknownLogFormat(String),
}

/// Check the configuration, collecting every error.
pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.proxy.enabled {
        let target = config.resolved_target_url();
        if target.is_empty() {
            errors.push(ValidationError::MissingTarget);
        } else {
            match Url::parse(&target) {
                Ok(url) if url.scheme() != "http" && url.scheme() != "https" => {
                    errors.push(ValidationError::InvalidTargetUrl {
                        url: target.clone(),
                        reason: format!("unsupported scheme {}", url.scheme()),
                    });
                }
                Ok(url) if url.host_str().is_none() => {
                    errors.push(ValidationError::InvalidTargetUrl {
                        url: target.clone(),
                        reason: "missing host".to_string(),
                    });
                }
                Ok(_) => {}
                Err(e) => errors.push(ValidationError::InvalidTargetUrl {
                    url: target.clone(),
                    reason: e.to_string(),
                }),
            }
        }

        let cache = &config.proxy.cache;
        if cache.enabled {
            if cache.capacity_bytes == 0 {
                errors.push(ValidationError::InvalidCacheLimit("capacity_bytes"));
            }
            if cache.max_item_size_bytes == 0 {
                errors.push(ValidationError::InvalidCacheLimit("max_item_size_bytes"));
            }
        }
    }

    if config.upstream.enabled && config.upstream.command.trim().is_empty() {
        errors.push(ValidationError::EmptyUpstreamCommand);
    }

    if config.http.tls.is_some() && config.http.https_port == config.http.port {
        errors.push(ValidationError::PortConflict(config.http.https_port));
    }

    let format = config.observability.log_format.as_str();
    if format != "pretty" && format != "json" {
        errors.push(ValidationError::UnknownLogFormat(format.to_string()));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
