//! Shell session ownership.
//!
//! One `ShellSession` per executor. It owns the running [`ShellProcess`],
//! the session's current working directory, and the lock that serializes
//! invocations.
//!
//! # Thread Safety
//!
//! All mutable state lives behind a `tokio::sync::Mutex`; holding it is what
//! "one command in flight" means. A `watch` channel publishes a snapshot of
//! the session so status queries never wait behind a running command.
//!
//! # Recovery
//!
//! When the shell exits (a user typed `exit`, it was killed) or a write to
//! its stdin fails, the session is marked broken. The next invocation starts
//! a fresh shell in the last known directory before running.

use std::path::Path;

use tokio::sync::{Mutex, MutexGuard, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::config::ShellConfig;
use super::error::{Result, ShellError};
use super::shell::ShellProcess;
use super::types::{SessionSnapshot, SessionStatus};

/// State guarded by the session lock.
pub(crate) struct SessionState {
    process: Option<ShellProcess>,
    /// Authoritative only after initialization or a completed command
    pub(crate) cwd: String,
    broken: bool,
    closed: bool,
}

impl SessionState {
    pub(crate) fn process_mut(&mut self) -> Result<&mut ShellProcess> {
        self.process.as_mut().ok_or(ShellError::Closed)
    }

    /// Replace the shell before the next invocation.
    pub(crate) fn mark_broken(&mut self) {
        self.broken = true;
    }
}

/// The persistent shell session behind an executor.
pub struct ShellSession {
    config: ShellConfig,
    state: Mutex<SessionState>,
    snapshot_tx: watch::Sender<SessionSnapshot>,
    /// Cancelled by `close`; every invocation scope derives from it
    shutdown: CancellationToken,
}

impl ShellSession {
    /// Spawn and initialize the shell in the configured working directory.
    pub async fn start(config: ShellConfig) -> Result<Self> {
        let (process, cwd) = ShellProcess::start_with_retry(&config, &config.working_dir).await?;

        let (snapshot_tx, _) = watch::channel(SessionSnapshot {
            status: SessionStatus::Ready,
            cwd: cwd.clone(),
            shell: Some(process.info.clone()),
            starts: 1,
        });

        Ok(Self {
            config,
            state: Mutex::new(SessionState {
                process: Some(process),
                cwd,
                broken: false,
                closed: false,
            }),
            snapshot_tx,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &ShellConfig {
        &self.config
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot_tx.subscribe()
    }

    pub fn current_working_directory(&self) -> String {
        self.snapshot_tx.borrow().cwd.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub(crate) fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub(crate) async fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().await
    }

    pub(crate) fn publish_cwd(&self, cwd: &str) {
        self.snapshot_tx.send_modify(|snapshot| {
            if snapshot.cwd != cwd {
                snapshot.cwd = cwd.to_string();
            }
        });
    }

    /// Make sure a live shell is running, restarting it when needed.
    pub(crate) async fn ensure_running(&self, state: &mut SessionState) -> Result<()> {
        if state.closed {
            return Err(ShellError::Closed);
        }

        let alive = match state.process.as_mut() {
            Some(process) => !state.broken && !process.has_exited(),
            None => false,
        };
        if alive {
            return Ok(());
        }

        if let Some(old) = state.process.take() {
            warn!(pid = old.info.pid, cwd = %state.cwd, "shell is gone, starting a new one");
            old.shutdown(self.config.shutdown_grace).await;
        }
        self.snapshot_tx.send_modify(|snapshot| {
            snapshot.status = SessionStatus::Uninitialized;
            snapshot.shell = None;
        });

        let start_dir = if Path::new(&state.cwd).is_dir() {
            state.cwd.clone()
        } else {
            warn!(
                cwd = %state.cwd,
                fallback = %self.config.working_dir,
                "last directory no longer exists"
            );
            self.config.working_dir.clone()
        };

        let (process, cwd) = ShellProcess::start_with_retry(&self.config, &start_dir).await?;
        let info = process.info.clone();
        state.process = Some(process);
        state.cwd = cwd.clone();
        state.broken = false;

        self.snapshot_tx.send_modify(|snapshot| {
            snapshot.status = SessionStatus::Ready;
            snapshot.cwd = cwd;
            snapshot.shell = Some(info);
            snapshot.starts += 1;
        });
        Ok(())
    }

    /// Stop the shell. In-flight invocations are cancelled first.
    ///
    /// Idempotent; failures are logged, never returned.
    pub async fn close(&self) {
        self.shutdown.cancel();

        let mut state = self.state.lock().await;
        if state.closed {
            debug!("shell session already closed");
            return;
        }
        state.closed = true;

        if let Some(process) = state.process.take() {
            process.shutdown(self.config.shutdown_grace).await;
        }
        self.snapshot_tx.send_modify(|snapshot| {
            snapshot.status = SessionStatus::Closed;
            snapshot.shell = None;
        });
        info!(cwd = %state.cwd, "shell session closed");
    }
}
