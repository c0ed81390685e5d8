//! Bounded wait for an asynchronously created Unix socket
//!
//! A companion process (the software TPM emulator) is spawned detached and
//! announces readiness by creating its control socket. The launcher polls
//! for that path a fixed number of times before giving up.

use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::{Error, Result};

/// Control socket file name inside a TPM state directory.
pub const TPM_SOCKET_NAME: &str = "swtpm-sock";

/// Attempts made by default before a wait is declared timed out.
pub const DEFAULT_ATTEMPTS: u32 = 20;

/// Sleep between two attempts by default.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

/// Path of the control socket for a TPM state directory.
pub fn tpm_socket_path(state_dir: &Path) -> PathBuf {
    state_dir.join(TPM_SOCKET_NAME)
}

/// State of one wait sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitState {
    Waiting { attempts_left: u32 },
    Ready,
    TimedOut,
}

impl WaitState {
    /// Transition after one check. Terminal states are absorbing.
    pub fn advance(self, ready: bool) -> WaitState {
        match self {
            WaitState::Waiting { .. } if ready => WaitState::Ready,
            WaitState::Waiting { attempts_left } if attempts_left <= 1 => WaitState::TimedOut,
            WaitState::Waiting { attempts_left } => WaitState::Waiting {
                attempts_left: attempts_left - 1,
            },
            terminal => terminal,
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, WaitState::Waiting { .. })
    }
}

/// Terminal result of [`ReadinessWaiter::poll`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Path became ready on check number `checks`
    Ready { checks: u32 },
    /// Path never became ready; `checks` equals the attempt budget
    TimedOut { checks: u32 },
}

type Probe = Box<dyn Fn(&Path) -> bool + Send + Sync>;

/// True when `path` exists and is a Unix domain socket.
pub fn is_socket(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|meta| meta.file_type().is_socket())
        .unwrap_or(false)
}

/// Polls a path until it is ready or the attempt budget is spent.
pub struct ReadinessWaiter {
    path: PathBuf,
    max_attempts: u32,
    interval: Duration,
    probe: Probe,
}

impl std::fmt::Debug for ReadinessWaiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadinessWaiter")
            .field("path", &self.path)
            .field("max_attempts", &self.max_attempts)
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

impl ReadinessWaiter {
    /// Wait for a Unix socket at `path`. A zero budget is treated as one attempt.
    pub fn new(path: impl Into<PathBuf>, max_attempts: u32, interval: Duration) -> Self {
        Self {
            path: path.into(),
            max_attempts: max_attempts.max(1),
            interval,
            probe: Box::new(is_socket),
        }
    }

    /// Replace the readiness check.
    pub fn with_probe<F>(mut self, probe: F) -> Self
    where
        F: Fn(&Path) -> bool + Send + Sync + 'static,
    {
        self.probe = Box::new(probe);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn initial_state(&self) -> WaitState {
        WaitState::Waiting {
            attempts_left: self.max_attempts,
        }
    }

    /// Run the wait loop to a terminal state.
    ///
    /// Each failed check logs a retry notice and sleeps `interval`, so a wait
    /// that times out takes about `max_attempts * interval`.
    pub async fn poll(&self) -> WaitOutcome {
        let mut state = self.initial_state();
        let mut checks = 0u32;

        loop {
            match state {
                WaitState::Ready => return WaitOutcome::Ready { checks },
                WaitState::TimedOut => return WaitOutcome::TimedOut { checks },
                WaitState::Waiting { attempts_left } => {
                    checks += 1;
                    let ready = (self.probe)(&self.path);
                    if ready {
                        debug!("{} ready on check {}", self.path.display(), checks);
                    } else {
                        info!(
                            attempt = checks,
                            remaining = attempts_left - 1,
                            "waiting for {} ...",
                            self.path.display()
                        );
                        tokio::time::sleep(self.interval).await;
                    }
                    state = state.advance(ready);
                }
            }
        }
    }

    /// Like [`ReadinessWaiter::poll`], mapping a timeout to [`Error::ReadinessTimeout`].
    pub async fn await_ready(&self) -> Result<()> {
        match self.poll().await {
            WaitOutcome::Ready { .. } => Ok(()),
            WaitOutcome::TimedOut { checks } => {
                warn!("{} did not appear after {} checks", self.path.display(), checks);
                Err(Error::ReadinessTimeout {
                    path: self.path.clone(),
                    attempts: checks,
                    interval: self.interval,
                })
            }
        }
    }
}

/// Wait for a Unix socket at `path` with the given budget.
pub async fn await_ready(path: &Path, max_attempts: u32, interval: Duration) -> Result<()> {
    ReadinessWaiter::new(path, max_attempts, interval)
        .await_ready()
        .await
}
