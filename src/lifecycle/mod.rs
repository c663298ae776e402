//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Config → metrics → cache → handler stack → bind listeners
//!         → spawn upstream supervisor + cache sweeper → serve
//!
//! Shutdown (shutdown.rs):
//!     Signal / server exit / upstream exit → broadcast → stop upstream → drain
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Trigger graceful shutdown
//! ```
//!
//! # Design Decisions
//! - Ordered startup: config first, then core, then listeners
//! - Shutdown has timeout: connections get 5 s to drain, the upstream 10 s to exit

pub mod shutdown;
pub mod signals;
pub mod startup;

pub use shutdown::Shutdown;
pub use startup::{run, StartupError};
