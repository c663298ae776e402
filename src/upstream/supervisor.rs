//! Spawns the fronted application and stops it on shutdown.

use std::collections::HashMap;
use std::ffi::OsString;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::Command;
use tokio::sync::watch;

use crate::config::UpstreamConfig;
use crate::observability::metrics;
use crate::upstream::command::normalize_command;
use crate::upstream::{StopSignal, SupervisorError};

/// Grace period between the stop signal and `SIGKILL`.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

enum State {
    Idle,
    Running {
        pid: Pid,
        exited: watch::Receiver<bool>,
        stopping: bool,
    },
}

/// Supervisor for one upstream process.
///
/// [`start`](Supervisor::start) runs until the process exits. [`stop`](Supervisor::stop)
/// may be called concurrently from another task.
pub struct Supervisor {
    config: UpstreamConfig,
    stop_timeout: Duration,
    state: Mutex<State>,
}

impl Supervisor {
    pub fn new(config: UpstreamConfig) -> Self {
        Self {
            config,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            state: Mutex::new(State::Idle),
        }
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    /// Process id of the running process, if any.
    pub fn pid(&self) -> Option<u32> {
        match &*self.lock() {
            State::Running { pid, .. } => u32::try_from(pid.as_raw()).ok(),
            State::Idle => None,
        }
    }

    /// Launch the command and wait for it to exit.
    ///
    /// An exit requested through [`stop`](Supervisor::stop) is `Ok` whatever its
    /// status. Any other non-zero or signalled exit is an error.
    pub async fn start(&self) -> Result<(), SupervisorError> {
        let (program, args) = normalize_command(&self.config.command, &self.config.args)?;

        let mut command = Command::new(&program);
        command
            .args(&args)
            .env_clear()
            .envs(build_env(&self.config))
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());

        if !self.config.working_directory.is_empty() {
            let dir = Path::new(&self.config.working_directory);
            check_working_directory(dir)?;
            command.current_dir(dir);
        }

        let (exited_tx, exited_rx) = watch::channel(false);
        let (mut child, pid) = {
            let mut state = self.lock();
            if matches!(*state, State::Running { .. }) {
                return Err(SupervisorError::AlreadyRunning);
            }

            let child = command.spawn().map_err(SupervisorError::Spawn)?;
            let raw_pid = child
                .id()
                .and_then(|id| i32::try_from(id).ok())
                .ok_or_else(|| {
                    SupervisorError::Spawn(std::io::Error::other("process exited before its pid was read"))
                })?;
            let pid = Pid::from_raw(raw_pid);
            *state = State::Running {
                pid,
                exited: exited_rx,
                stopping: false,
            };
            (child, pid)
        };

        tracing::info!(
            command = %program,
            args = ?args,
            pid = pid.as_raw(),
            working_dir = %self.config.working_directory,
            "Upstream process started"
        );
        metrics::record_upstream_start();

        let waited = child.wait().await;

        let stopping = {
            let mut state = self.lock();
            let stopping = matches!(*state, State::Running { stopping: true, .. });
            *state = State::Idle;
            stopping
        };
        let _ = exited_tx.send(true);

        let status = waited.map_err(SupervisorError::Wait)?;
        tracing::info!(pid = pid.as_raw(), status = %status, "Upstream process exited");

        let clean = status.success() || stopping;
        metrics::record_upstream_exit(clean);
        if clean {
            Ok(())
        } else {
            Err(SupervisorError::Exited(status))
        }
    }

    /// Ask the process to exit, forcing it after the grace period.
    ///
    /// A no-op when nothing is running. Safe to call more than once.
    pub async fn stop(&self) -> Result<(), SupervisorError> {
        let (pid, mut exited) = {
            let mut state = self.lock();
            match &mut *state {
                State::Idle => return Ok(()),
                State::Running {
                    pid,
                    exited,
                    stopping,
                } => {
                    *stopping = true;
                    (*pid, exited.clone())
                }
            }
        };

        let signal = StopSignal::from_config(&self.config.stop_signal);
        tracing::info!(pid = pid.as_raw(), signal = %signal, "Sending signal to upstream process");
        send_signal(pid, signal.as_signal())?;

        let finished = tokio::time::timeout(self.stop_timeout, exited.wait_for(|done| *done))
            .await
            .is_ok();
        if !finished {
            tracing::warn!(
                pid = pid.as_raw(),
                timeout = ?self.stop_timeout,
                "Upstream process did not exit within timeout; killing"
            );
            send_signal(pid, Signal::SIGKILL)?;
            let _ = exited.wait_for(|done| *done).await;
        }

        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn send_signal(pid: Pid, signal: Signal) -> Result<(), SupervisorError> {
    match kill(pid, signal) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(errno) => Err(SupervisorError::Signal(errno)),
    }
}

fn check_working_directory(dir: &Path) -> Result<(), SupervisorError> {
    match std::fs::metadata(dir) {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(SupervisorError::MissingWorkingDirectory(dir.to_path_buf()))
        }
        Err(source) => Err(SupervisorError::WorkingDirectory {
            path: dir.to_path_buf(),
            source,
        }),
    }
}

/// The parent environment, then `PORT`, then configured overrides.
///
/// `PORT` is only exported when the process binds a TCP port.
pub fn build_env(config: &UpstreamConfig) -> HashMap<OsString, OsString> {
    let mut env: HashMap<OsString, OsString> = std::env::vars_os().collect();

    if config.target_bind_socket.is_empty() && config.target_port > 0 {
        env.insert("PORT".into(), config.target_port.to_string().into());
    }

    for (key, value) in &config.env {
        env.insert(key.into(), value.into());
    }
    env
}
