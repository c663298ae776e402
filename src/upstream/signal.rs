//! Stop signal names accepted in configuration.

use std::fmt;
use std::str::FromStr;

use nix::sys::signal::Signal;

use crate::upstream::SupervisorError;

/// Signal used to ask the supervised process to exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopSignal {
    #[default]
    Term,
    Int,
    Quit,
    Kill,
}

impl StopSignal {
    /// Parse a configured name, falling back to `SIGTERM` for unknown names.
    pub fn from_config(name: &str) -> Self {
        name.parse().unwrap_or_else(|error| {
            tracing::warn!(signal = name, error = %error, "Invalid stop signal; defaulting to SIGTERM");
            StopSignal::Term
        })
    }

    pub fn as_signal(&self) -> Signal {
        match self {
            StopSignal::Term => Signal::SIGTERM,
            StopSignal::Int => Signal::SIGINT,
            StopSignal::Quit => Signal::SIGQUIT,
            StopSignal::Kill => Signal::SIGKILL,
        }
    }
}

impl FromStr for StopSignal {
    type Err = SupervisorError;

    /// Names are case-insensitive with an optional `SIG` prefix. Empty means `SIGTERM`.
    fn from_str(name: &str) -> Result<Self, Self::Err> {
        let upper = name.trim().to_ascii_uppercase();
        let bare = upper.strip_prefix("SIG").unwrap_or(&upper);

        match bare {
            "" | "TERM" => Ok(StopSignal::Term),
            "INT" => Ok(StopSignal::Int),
            "QUIT" => Ok(StopSignal::Quit),
            "KILL" => Ok(StopSignal::Kill),
            _ => Err(SupervisorError::UnsupportedSignal(name.to_string())),
        }
    }
}

impl fmt::Display for StopSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_signal().as_str())
    }
}
