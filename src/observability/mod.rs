//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! http middleware, cache, proxy, upstream supervisor
//!     → logging.rs (tracing subscriber: pretty or JSON on stdout)
//!     → metrics.rs (requests, cache outcomes and size, upstream process)
//!
//! Consumers:
//!     → Log aggregation (stdout)
//!     → Prometheus scrape of observability.metrics_address
//! ```
//!
//! # Design Decisions
//! - `RUST_LOG` overrides the configured level
//! - Metrics are recorded even when no exporter is installed (no-op recorder)

pub mod logging;
pub mod metrics;
