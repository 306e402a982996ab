//! The interactive shell process behind a session.
//!
//! This module provides the OS-level half of a session: spawning the shell
//! in its own process group, wiring its pipes to the [`Multiplexer`], running
//! the initialization script, and tearing everything down again.
//!
//! # Architecture
//!
//! - `ShellWriter`: owns the shell's stdin; every fragment goes through it.
//! - `ShellProcess`: the child, its writer, both reader tasks and the token
//!   that stops them.

use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use futures::future::join_all;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::config::ShellConfig;
use super::error::{Result, ShellError, is_broken_pipe};
use super::multiplexer::{Completion, Multiplexer, StreamKind};
use super::protocol::{Marker, encode_command, shell_quote};
use super::signal::ProcessGroupCanceller;
use super::types::ShellInfo;

/// Command run through the protocol to learn the initial directory.
const INIT_COMMAND: &str = "echo 'shell initialized'";

/// How long readers get to hit EOF after the shell exits.
const READER_JOIN_TIMEOUT: Duration = Duration::from_secs(1);

const START_RETRY_MIN_DELAY: Duration = Duration::from_millis(200);
const START_RETRY_MAX_DELAY: Duration = Duration::from_secs(5);

/// Write handle for the shell's stdin.
pub struct ShellWriter {
    stdin: ChildStdin,
}

impl ShellWriter {
    pub fn new(stdin: ChildStdin) -> Self {
        Self { stdin }
    }

    /// Write and flush `data`.
    pub async fn write(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.stdin.write_all(data).await?;
        self.stdin.flush().await
    }

    /// Close stdin so the shell sees EOF.
    pub async fn close(&mut self) -> std::io::Result<()> {
        self.stdin.shutdown().await
    }
}

/// A running interactive shell and its reader tasks.
pub struct ShellProcess {
    pub info: ShellInfo,
    child: Child,
    writer: ShellWriter,
    canceller: ProcessGroupCanceller,
    multiplexer: Arc<Multiplexer>,
    /// Stops both readers
    cancel_token: CancellationToken,
    readers: Vec<JoinHandle<()>>,
}

impl ShellProcess {
    fn spawn(config: &ShellConfig, cwd: &str) -> Result<Self> {
        let mut cmd = Command::new(&config.shell);
        // Without --noediting readline echoes every input line to stderr.
        cmd.args(["--noediting", "-i"])
            .current_dir(cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|source| ShellError::Spawn {
            shell: config.shell.clone(),
            source,
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or(ShellError::MissingStream("stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or(ShellError::MissingStream("stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or(ShellError::MissingStream("stderr"))?;
        let pid = child.id().ok_or(ShellError::StartupExited)?;

        let multiplexer = Arc::new(Multiplexer::new(
            &config.sentinel_prefix,
            &config.prompt,
            config.output_buffer_lines,
        ));
        let cancel_token = CancellationToken::new();
        let readers = vec![
            multiplexer.spawn_reader(StreamKind::Stdout, stdout, cancel_token.clone()),
            multiplexer.spawn_reader(StreamKind::Stderr, stderr, cancel_token.clone()),
        ];

        info!(pid, shell = %config.shell, cwd, "spawned shell");

        Ok(Self {
            info: ShellInfo {
                pid,
                shell: config.shell.clone(),
                started_at: chrono::Utc::now().to_rfc3339(),
            },
            child,
            writer: ShellWriter::new(stdin),
            canceller: ProcessGroupCanceller::new(pid),
            multiplexer,
            cancel_token,
            readers,
        })
    }

    /// Spawn the shell in `cwd` and wait for initialization.
    ///
    /// Returns the process together with the directory the shell reported.
    pub async fn start(config: &ShellConfig, cwd: &str) -> Result<(Self, String)> {
        let mut process = Self::spawn(config, cwd)?;
        let marker = Marker::new(&config.sentinel_prefix);
        let completion = process.multiplexer.arm(&marker);
        let script = init_script(config, &marker, cwd);

        if let Err(err) = process.writer.write(script.as_bytes()).await {
            process.shutdown(config.shutdown_grace).await;
            return Err(ShellError::BashIo(err));
        }

        let outcome = tokio::time::timeout(config.startup_timeout, completion).await;
        process.multiplexer.disarm();

        match outcome {
            Ok(Ok(Completion::Finished(sentinel))) => {
                let reported = sentinel.cwd.unwrap_or_else(|| {
                    warn!(cwd, "initialization sentinel carried no directory");
                    cwd.to_string()
                });
                info!(pid = process.info.pid, cwd = %reported, "shell ready");
                Ok((process, reported))
            }
            Ok(Ok(Completion::ShellExited)) | Ok(Err(_)) => {
                process.shutdown(config.shutdown_grace).await;
                Err(ShellError::StartupExited)
            }
            Err(_) => {
                process.shutdown(config.shutdown_grace).await;
                Err(ShellError::StartupTimeout(config.startup_timeout))
            }
        }
    }

    /// [`ShellProcess::start`] with exponential backoff on transient failures.
    pub async fn start_with_retry(config: &ShellConfig, cwd: &str) -> Result<(Self, String)> {
        let attempt_counter = AtomicU32::new(0);

        let backoff = ExponentialBuilder::default()
            .with_min_delay(START_RETRY_MIN_DELAY)
            .with_max_delay(START_RETRY_MAX_DELAY)
            .with_max_times(config.max_start_retries as usize)
            .with_jitter();

        let result = (|| async {
            let attempt = attempt_counter.fetch_add(1, Ordering::SeqCst);
            if attempt > 0 {
                warn!(attempt, shell = %config.shell, "shell start retry attempt");
            }
            Self::start(config, cwd).await
        })
        .retry(backoff)
        .when(|err: &ShellError| {
            let retryable = err.is_retryable();
            if !retryable {
                warn!(%err, "shell start failed with non-retryable error");
            }
            retryable
        })
        .notify(|err, dur| {
            warn!(%err, "shell start failed, retrying in {:?}", dur);
        })
        .await;

        if let Err(err) = &result {
            error!(
                attempts = attempt_counter.load(Ordering::SeqCst),
                %err,
                "could not start shell"
            );
        }
        result
    }

    pub fn multiplexer(&self) -> &Arc<Multiplexer> {
        &self.multiplexer
    }

    pub fn canceller(&self) -> ProcessGroupCanceller {
        self.canceller
    }

    /// Write one encoded fragment to stdin.
    pub async fn write_command(&mut self, fragment: &str) -> Result<()> {
        self.writer.write(fragment.as_bytes()).await.map_err(|err| {
            if is_broken_pipe(&err) {
                warn!(pid = self.info.pid, "shell stdin is closed");
            } else {
                error!(pid = self.info.pid, %err, "failed to write to shell stdin");
            }
            ShellError::BashIo(err)
        })
    }

    /// Whether the shell has exited or closed its pipes.
    pub fn has_exited(&mut self) -> bool {
        self.multiplexer.is_exited() || !matches!(self.child.try_wait(), Ok(None))
    }

    /// Ask the shell to exit, wait up to `grace`, then kill it.
    ///
    /// Failures are logged, never returned.
    pub async fn shutdown(mut self, grace: Duration) {
        let pid = self.info.pid;

        if let Err(err) = self.writer.write(b"exit\n").await {
            debug!(pid, %err, "could not send exit to shell");
        }
        if let Err(err) = self.writer.close().await {
            debug!(pid, %err, "could not close shell stdin");
        }

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => info!(pid, %status, "shell exited"),
            Ok(Err(err)) => warn!(pid, %err, "failed to wait for shell"),
            Err(_) => {
                warn!(pid, ?grace, "shell did not exit in time, killing");
                if let Err(err) = self.child.kill().await {
                    error!(pid, %err, "failed to kill shell");
                }
            }
        }

        let joined = join_all(std::mem::take(&mut self.readers));
        tokio::pin!(joined);
        let results = tokio::select! {
            results = &mut joined => results,
            () = tokio::time::sleep(READER_JOIN_TIMEOUT) => {
                debug!(pid, "pipes still held open, cancelling readers");
                self.cancel_token.cancel();
                joined.await
            }
        };
        for result in results {
            if let Err(err) = result {
                warn!(pid, %err, "reader task failed");
            }
        }
    }
}

impl Drop for ShellProcess {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

/// Script written once after spawn.
///
/// Ends with the protocol-encoded init command, whose sentinel reports the
/// starting directory.
pub(crate) fn init_script(config: &ShellConfig, marker: &Marker, cwd: &str) -> String {
    let mut script = vec!["set +H".to_string()];

    if let Some(identity) = &config.git_identity {
        let name = shell_quote(&identity.name);
        let email = shell_quote(&identity.email);
        script.push(format!(
            "export GIT_AUTHOR_NAME={name} GIT_COMMITTER_NAME={name} \
             GIT_AUTHOR_EMAIL={email} GIT_COMMITTER_EMAIL={email}"
        ));
    }

    script.push("alias git='git --no-pager'".to_string());
    script.push("export PAGER=cat GIT_PAGER=cat".to_string());
    script.push(format!("PS1={}", shell_quote(&config.prompt)));
    script.push("PS2=''".to_string());

    let mut text = script.join("\n");
    text.push('\n');
    text.push_str(&encode_command(marker, cwd, INIT_COMMAND));
    text
}
