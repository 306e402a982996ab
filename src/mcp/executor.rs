//! Per-request entry point into the shell session.
//!
//! Runs one invocation at a time:
//!
//! 1. take the session lock (the wait itself can be cancelled);
//! 2. resolve the target directory and encode the command with a fresh marker;
//! 3. register an output channel and arm the completion signal;
//! 4. write the fragment, then wait for completion, timeout, cancellation
//!    or shell exit while collecting output;
//! 5. persist the new working directory and release everything.
//!
//! A timeout is a result, not an error: exit code `-1`, a notice in the
//! content, and a `SIGINT` to the shell's process group. If the shell does
//! not come back within [`INTERRUPT_GRACE`], the group is killed and the
//! session restarts on the next invocation.

use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{FutureExt, Stream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::config::{ShellConfig, clean_path};
use super::error::{Result, ShellError, panic_message};
use super::multiplexer::{Completion, Multiplexer};
use super::protocol::{Marker, encode_command};
use super::registry::OutputEvent;
use super::session::{SessionState, ShellSession};
use super::signal::{InterruptTarget, ProcessGroupCanceller};
use super::types::{ExecutionResult, Invocation, SessionSnapshot, StreamChunk};

/// How long an interrupted command gets to hand the shell back.
pub const INTERRUPT_GRACE: Duration = Duration::from_secs(2);

/// Runs commands in one persistent shell session.
#[derive(Clone)]
pub struct Executor {
    session: Arc<ShellSession>,
}

impl Executor {
    /// Start the shell. Failure here is fatal to the executor.
    pub async fn start(config: ShellConfig) -> Result<Self> {
        let session = ShellSession::start(config).await?;
        Ok(Self {
            session: Arc::new(session),
        })
    }

    pub fn config(&self) -> &ShellConfig {
        self.session.config()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.session.snapshot()
    }

    pub fn current_working_directory(&self) -> String {
        self.session.current_working_directory()
    }

    pub async fn execute(&self, invocation: Invocation) -> Result<ExecutionResult> {
        self.execute_with_cancel(invocation, CancellationToken::new())
            .await
    }

    /// Like [`Executor::execute`], also stopped when `cancel` fires.
    pub async fn execute_with_cancel(
        &self,
        invocation: Invocation,
        cancel: CancellationToken,
    ) -> Result<ExecutionResult> {
        let mut content = String::new();
        let outcome = run_guarded(&self.session, &invocation, &cancel, &mut content).await?;

        Ok(ExecutionResult {
            content,
            exit_code: outcome.exit_code,
            cwd: outcome.cwd,
            timed_out: outcome.timed_out,
        })
    }

    /// Run `invocation` and stream its output as it arrives.
    ///
    /// The stream ends with exactly one terminal chunk. Dropping it cancels
    /// the invocation.
    pub fn execute_stream(
        &self,
        invocation: Invocation,
    ) -> impl Stream<Item = StreamChunk> + Send + 'static {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Arc::clone(&self.session);
        tokio::spawn(stream_invocation(session, invocation, tx));

        futures::stream::unfold((rx, false), |(mut rx, done)| async move {
            if done {
                return None;
            }
            let chunk = rx.recv().await?;
            let done = chunk.is_terminal();
            Some((chunk, (rx, done)))
        })
    }

    /// Cancel in-flight work and stop the shell.
    pub async fn close(&self) {
        self.session.close().await;
    }
}

/// Receives output as the coordinator collects it.
pub(crate) trait OutputSink: Send {
    fn emit(&mut self, text: &str);
}

impl OutputSink for String {
    fn emit(&mut self, text: &str) {
        self.push_str(text);
    }
}

struct ChunkSink {
    tx: mpsc::UnboundedSender<StreamChunk>,
}

impl OutputSink for ChunkSink {
    fn emit(&mut self, text: &str) {
        let chunk = StreamChunk::Output {
            text: text.to_string(),
        };
        if self.tx.send(chunk).is_err() {
            debug!("stream consumer is gone, dropping output");
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RunOutcome {
    pub exit_code: i32,
    pub cwd: String,
    pub timed_out: bool,
}

impl RunOutcome {
    fn interrupted() -> Self {
        Self {
            exit_code: -1,
            cwd: String::new(),
            timed_out: true,
        }
    }
}

/// Why an invocation stopped before its sentinel arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    TimedOut(Duration),
    Cancelled,
    Closing,
}

impl StopReason {
    fn notice(&self) -> String {
        match self {
            StopReason::TimedOut(timeout) => format!(
                "\n[Command timed out after {} seconds. The command was interrupted.]\n",
                timeout.as_secs()
            ),
            StopReason::Cancelled => "\n[Command was cancelled.]\n".to_string(),
            StopReason::Closing => {
                "\n[Command was cancelled because the shell session is closing.]\n".to_string()
            }
        }
    }
}

enum Ending {
    Completed(Completion),
    Stopped(StopReason),
}

/// Cleans up an invocation however the coordinator leaves it.
///
/// If the invocation never finished (the caller dropped the future), the
/// running command is interrupted so the next invocation gets a free shell.
struct InvocationGuard {
    multiplexer: Arc<Multiplexer>,
    id: String,
    canceller: ProcessGroupCanceller,
    settled: bool,
}

impl InvocationGuard {
    fn new(multiplexer: Arc<Multiplexer>, id: &str, canceller: ProcessGroupCanceller) -> Self {
        Self {
            multiplexer,
            id: id.to_string(),
            canceller,
            settled: false,
        }
    }

    fn settle(&mut self) {
        self.settled = true;
    }

    fn interrupt(&mut self) -> Result<InterruptTarget> {
        self.settled = true;
        self.canceller.interrupt()
    }
}

impl Drop for InvocationGuard {
    fn drop(&mut self) {
        if !self.settled {
            warn!(invocation_id = %self.id, "invocation abandoned while running, interrupting");
            if let Err(err) = self.canceller.interrupt() {
                warn!(invocation_id = %self.id, %err, "could not interrupt abandoned invocation");
            }
        }
        if !self.multiplexer.registry().unregister(&self.id) {
            debug!(invocation_id = %self.id, "output channel already removed");
        }
        self.multiplexer.disarm();
    }
}

/// Directory an invocation runs in: session cwd, or the override resolved
/// against it, lexically cleaned.
pub(crate) fn resolve_target_dir(session_cwd: &str, requested: Option<&str>) -> String {
    let path = match requested.filter(|dir| !dir.is_empty()) {
        Some(dir) => Path::new(session_cwd).join(dir),
        None => Path::new(session_cwd).to_path_buf(),
    };
    clean_path(&path).to_string_lossy().into_owned()
}

fn emit_event<S: OutputSink>(sink: &mut S, event: OutputEvent) {
    match event {
        OutputEvent::Line(line) => sink.emit(&line),
        OutputEvent::ReaderError(message) => {
            sink.emit(&format!("\n[EXECUTOR_IO_ERROR: {message}]\n"));
        }
    }
}

async fn stop_signal(
    cancel: &CancellationToken,
    shutdown: &CancellationToken,
    timeout: Option<Duration>,
) -> StopReason {
    let deadline = async {
        match timeout {
            Some(timeout) => tokio::time::sleep(timeout).await,
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        () = cancel.cancelled() => StopReason::Cancelled,
        () = shutdown.cancelled() => StopReason::Closing,
        () = deadline => StopReason::TimedOut(timeout.unwrap_or_default()),
    }
}

pub(crate) async fn run<S: OutputSink>(
    session: &ShellSession,
    invocation: &Invocation,
    cancel: &CancellationToken,
    sink: &mut S,
) -> Result<RunOutcome> {
    let started = Instant::now();
    let shutdown = session.shutdown_token();

    let mut state = tokio::select! {
        state = session.lock() => state,
        () = cancel.cancelled() => {
            debug!(invocation_id = %invocation.id, "cancelled while waiting for the session");
            sink.emit(&StopReason::Cancelled.notice());
            return Ok(RunOutcome::interrupted());
        }
        () = shutdown.cancelled() => return Err(ShellError::Closed),
    };

    session.ensure_running(&mut state).await?;

    let target_dir = resolve_target_dir(&state.cwd, invocation.cwd.as_deref());
    let marker = Marker::new(&session.config().sentinel_prefix);
    let fragment = encode_command(&marker, &target_dir, &invocation.command);

    let process = state.process_mut()?;
    let multiplexer = Arc::clone(process.multiplexer());
    let mut output_rx = multiplexer.registry().register(&invocation.id);
    let mut completion_rx = multiplexer.arm(&marker);
    let mut guard = InvocationGuard::new(
        Arc::clone(&multiplexer),
        &invocation.id,
        process.canceller(),
    );

    if let Err(err) = process.write_command(&fragment).await {
        guard.settle();
        if err.requires_restart() {
            state.mark_broken();
        }
        return Err(err);
    }
    debug!(
        invocation_id = %invocation.id,
        cwd = %target_dir,
        timeout = ?invocation.hard_timeout,
        listeners = multiplexer.registry().len(),
        "command sent to shell"
    );

    let stop = stop_signal(cancel, shutdown, invocation.hard_timeout);
    tokio::pin!(stop);

    let ending = loop {
        tokio::select! {
            Some(event) = output_rx.recv() => emit_event(sink, event),
            completion = &mut completion_rx => {
                break Ending::Completed(completion.unwrap_or(Completion::ShellExited));
            }
            reason = &mut stop => break Ending::Stopped(reason),
        }
    };

    let outcome = match ending {
        Ending::Completed(Completion::Finished(sentinel)) => {
            guard.settle();
            while let Ok(event) = output_rx.try_recv() {
                emit_event(sink, event);
            }

            match sentinel.cwd {
                Some(cwd) => {
                    state.cwd = cwd;
                    session.publish_cwd(&state.cwd);
                }
                None => warn!(
                    invocation_id = %invocation.id,
                    exit_code = sentinel.exit_code,
                    cwd = %state.cwd,
                    "sentinel carried no directory, keeping previous cwd"
                ),
            }

            RunOutcome {
                exit_code: sentinel.exit_code,
                cwd: state.cwd.clone(),
                timed_out: false,
            }
        }
        Ending::Completed(Completion::ShellExited) => {
            guard.settle();
            while let Ok(event) = output_rx.try_recv() {
                emit_event(sink, event);
            }
            warn!(invocation_id = %invocation.id, "shell exited during invocation");
            sink.emit("\n[Shell session exited. A new session will be started for the next command.]\n");
            state.mark_broken();

            RunOutcome {
                exit_code: -1,
                cwd: String::new(),
                timed_out: false,
            }
        }
        Ending::Stopped(reason) => {
            while let Ok(event) = output_rx.try_recv() {
                emit_event(sink, event);
            }
            warn!(invocation_id = %invocation.id, ?reason, "interrupting command");
            sink.emit(&reason.notice());
            if let Err(err) = guard.interrupt() {
                sink.emit(&format!("\n[Failed to interrupt command: {err}]\n"));
            }
            // Late output must not reach the next invocation's channel.
            drop(guard);
            if reason != StopReason::Closing {
                resync(session, &mut state, &invocation.id).await;
            }

            RunOutcome::interrupted()
        }
    };

    info!(
        invocation_id = %invocation.id,
        exit_code = outcome.exit_code,
        timed_out = outcome.timed_out,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "command finished"
    );
    Ok(outcome)
}

/// [`run`], with a panic in the coordinator turned into an error.
pub(crate) async fn run_guarded<S: OutputSink>(
    session: &ShellSession,
    invocation: &Invocation,
    cancel: &CancellationToken,
    sink: &mut S,
) -> Result<RunOutcome> {
    match AssertUnwindSafe(run(session, invocation, cancel, sink))
        .catch_unwind()
        .await
    {
        Ok(result) => result,
        Err(payload) => {
            let err = ShellError::ListenerPanic {
                listener: "coordinator",
                message: panic_message(payload.as_ref()),
            };
            error!(invocation_id = %invocation.id, %err, "invocation panicked");
            Err(err)
        }
    }
}

/// Wait for the shell to read input again after an interrupt.
///
/// A no-op fragment is sent with a fresh marker. If its sentinel does not
/// arrive within [`INTERRUPT_GRACE`] the interrupted command is still
/// running (it ignored `SIGINT`), so the whole process group is killed and
/// the session is marked for restart.
async fn resync(session: &ShellSession, state: &mut SessionState, invocation_id: &str) {
    let Ok(process) = state.process_mut() else {
        return;
    };
    let multiplexer = Arc::clone(process.multiplexer());
    let canceller = process.canceller();
    let marker = Marker::new(&session.config().sentinel_prefix);
    let completion = multiplexer.arm(&marker);

    if let Err(err) = process
        .write_command(&encode_command(&marker, ".", "true"))
        .await
    {
        warn!(invocation_id, %err, "could not resync shell after interrupt");
        multiplexer.disarm();
        state.mark_broken();
        return;
    }

    match tokio::time::timeout(INTERRUPT_GRACE, completion).await {
        Ok(Ok(Completion::Finished(sentinel))) => {
            debug!(invocation_id, "shell is idle again");
            if let Some(cwd) = sentinel.cwd {
                state.cwd = cwd;
                session.publish_cwd(&state.cwd);
            }
        }
        Ok(_) => state.mark_broken(),
        Err(_) => {
            warn!(
                invocation_id,
                grace = ?INTERRUPT_GRACE,
                "command ignored SIGINT, killing shell process group"
            );
            if let Err(err) = canceller.kill_group() {
                error!(invocation_id, %err, "could not kill shell process group");
            }
            state.mark_broken();
        }
    }
    multiplexer.disarm();
}

async fn stream_invocation(
    session: Arc<ShellSession>,
    invocation: Invocation,
    tx: mpsc::UnboundedSender<StreamChunk>,
) {
    let cancel = CancellationToken::new();
    let watcher = {
        let tx = tx.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tx.closed().await;
            cancel.cancel();
        })
    };

    let mut sink = ChunkSink { tx: tx.clone() };
    let result = run_guarded(&session, &invocation, &cancel, &mut sink).await;
    watcher.abort();

    let last = match result {
        Ok(outcome) => StreamChunk::Completed {
            exit_code: outcome.exit_code,
            cwd: outcome.cwd,
            timed_out: outcome.timed_out,
        },
        Err(err) => StreamChunk::Failed {
            error_type: err.error_type().to_string(),
            message: err.to_string(),
        },
    };

    if tx.send(last).is_err() {
        debug!(invocation_id = %invocation.id, "stream consumer left before completion");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod target_dir {
        use super::*;

        #[test]
        fn test_no_override_uses_session_cwd() {
            assert_eq!(resolve_target_dir("/work", None), "/work");
        }

        #[test]
        fn test_empty_override_uses_session_cwd() {
            assert_eq!(resolve_target_dir("/work", Some("")), "/work");
        }

        #[test]
        fn test_relative_override_joins_session_cwd() {
            assert_eq!(resolve_target_dir("/work", Some("src/lib")), "/work/src/lib");
        }

        #[test]
        fn test_absolute_override_replaces_session_cwd() {
            assert_eq!(resolve_target_dir("/work", Some("/etc")), "/etc");
        }

        #[test]
        fn test_result_is_cleaned() {
            assert_eq!(resolve_target_dir("/work/a", Some("../b/./c/")), "/work/b/c");
        }
    }

    mod notices {
        use super::*;

        #[test]
        fn test_timeout_notice_mentions_seconds() {
            let notice = StopReason::TimedOut(Duration::from_secs(3)).notice();
            assert!(notice.contains("timed out after 3 seconds"));
            assert!(notice.starts_with('\n'));
        }

        #[test]
        fn test_reader_error_is_tagged() {
            let mut content = String::new();
            emit_event(&mut content, OutputEvent::ReaderError("stdout read error: x".into()));
            assert_eq!(content, "\n[EXECUTOR_IO_ERROR: stdout read error: x]\n");
        }

        #[test]
        fn test_lines_are_appended_verbatim() {
            let mut content = String::new();
            emit_event(&mut content, OutputEvent::Line("a\n".into()));
            emit_event(&mut content, OutputEvent::Line("b\n".into()));
            assert_eq!(content, "a\nb\n");
        }
    }

    mod stop_signal {
        use super::*;

        #[tokio::test(start_paused = true)]
        async fn test_deadline_fires() {
            let cancel = CancellationToken::new();
            let shutdown = CancellationToken::new();
            let reason = stop_signal(&cancel, &shutdown, Some(Duration::from_secs(2))).await;
            assert_eq!(reason, StopReason::TimedOut(Duration::from_secs(2)));
        }

        #[tokio::test]
        async fn test_caller_cancel_wins() {
            let cancel = CancellationToken::new();
            let shutdown = CancellationToken::new();
            cancel.cancel();
            let reason = stop_signal(&cancel, &shutdown, None).await;
            assert_eq!(reason, StopReason::Cancelled);
        }

        #[tokio::test]
        async fn test_shutdown_stops_untimed_invocation() {
            let cancel = CancellationToken::new();
            let shutdown = CancellationToken::new();
            shutdown.cancel();
            let reason = stop_signal(&cancel, &shutdown, None).await;
            assert_eq!(reason, StopReason::Closing);
        }
    }

    mod panics {
        use super::*;

        struct ExplodingSink;

        impl OutputSink for ExplodingSink {
            fn emit(&mut self, _text: &str) {
                panic!("sink exploded");
            }
        }

        fn test_config(dir: &str) -> ShellConfig {
            ShellConfig::new(dir)
                .with_git_identity(None)
                .with_startup_timeout(Duration::from_secs(20))
                .with_shutdown_grace(Duration::from_secs(2))
        }

        #[tokio::test]
        async fn test_coordinator_panic_becomes_error() {
            let dir = tempfile::tempdir().unwrap();
            let session = ShellSession::start(test_config(&dir.path().to_string_lossy()))
                .await
                .unwrap();
            let cancel = CancellationToken::new();

            let err = run_guarded(
                &session,
                &Invocation::new("echo boom"),
                &cancel,
                &mut ExplodingSink,
            )
            .await
            .unwrap_err();
            assert_eq!(err.error_type(), "ListenerPanicError");
            assert!(err.to_string().contains("sink exploded"));
            // let the shell settle after the abandoned invocation's SIGINT
            tokio::time::sleep(Duration::from_millis(200)).await;

            let mut content = String::new();
            let outcome = run_guarded(&session, &Invocation::new("echo ok"), &cancel, &mut content)
                .await
                .unwrap();
            assert_eq!(outcome.exit_code, 0);
            assert!(content.contains("ok\n"));

            session.close().await;
        }
    }
}
