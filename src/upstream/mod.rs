//! Upstream process supervision.
//!
//! # Data Flow
//! ```text
//! UpstreamConfig
//!     → command.rs (split command line, append args)
//!     → supervisor.rs (environment, spawn, wait)
//!     → signal.rs (configured stop signal)
//! ```
//!
//! # Design Decisions
//! - The supervisor never restarts a crashed process; the exit is reported to
//!   the lifecycle, which shuts the proxy down
//! - Waiting for exit happens outside the state lock so `stop` is never blocked

pub mod command;
pub mod signal;
pub mod supervisor;

use std::io;
use std::path::PathBuf;
use std::process::ExitStatus;

use thiserror::Error;

pub use signal::StopSignal;
pub use supervisor::Supervisor;

/// Errors raised while preparing, running or stopping the upstream process.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("upstream command is empty")]
    EmptyCommand,

    #[error("unterminated escape sequence in command")]
    UnterminatedEscape,

    #[error("unterminated quoted string in command")]
    UnterminatedQuote,

    #[error("unsupported signal {0:?}")]
    UnsupportedSignal(String),

    #[error("working directory does not exist: {0}")]
    MissingWorkingDirectory(PathBuf),

    #[error("cannot access working directory {path}: {source}")]
    WorkingDirectory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("upstream process is already running")]
    AlreadyRunning,

    #[error("start upstream command: {0}")]
    Spawn(#[source] io::Error),

    #[error("wait upstream command: {0}")]
    Wait(#[source] io::Error),

    #[error("upstream process exited unexpectedly ({0})")]
    Exited(ExitStatus),

    #[error("signal upstream process: {0}")]
    Signal(#[source] nix::errno::Errno),
}
