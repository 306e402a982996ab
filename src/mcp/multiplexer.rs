//! Stream readers that classify shell output.
//!
//! One reader task per pipe runs for the lifetime of the shell. Each line is
//! one of:
//!
//! - initialization noise (before the first completion), logged at debug;
//! - a completion marker for the invocation in flight;
//! - command output, fanned out through the [`OutputRegistry`].
//!
//! An invocation completes only after its marker was seen on *both* pipes,
//! so stderr written by the command is delivered before the caller returns.

use std::fmt;
use std::io;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::codec::Decoder;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::codec::ShellLineCodec;
use super::error::{ShellError, panic_message};
use super::protocol::{Marker, Sentinel, SentinelDecoder};
use super::registry::{OutputEvent, OutputRegistry};

const READ_BUFFER_BYTES: usize = 8 * 1024;

/// After this many read errors in a row the pipe is treated as closed.
const MAX_CONSECUTIVE_READ_ERRORS: u32 = 16;

const READ_ERROR_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Stdout => "stdout",
            StreamKind::Stderr => "stderr",
        }
    }

    fn reader_name(&self) -> &'static str {
        match self {
            StreamKind::Stdout => "stdout reader",
            StreamKind::Stderr => "stderr reader",
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How an armed invocation ended on the reader side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    Finished(Sentinel),
    /// A pipe reached EOF: the shell is gone
    ShellExited,
}

struct PendingCompletion {
    token: String,
    sentinel: Option<Sentinel>,
    stderr_drained: bool,
    tx: Option<oneshot::Sender<Completion>>,
}

/// Shared state between the two reader tasks and the coordinator.
pub struct Multiplexer {
    decoder: SentinelDecoder,
    prompt: String,
    registry: OutputRegistry,
    pending: Mutex<Option<PendingCompletion>>,
    initialized: AtomicBool,
    exited: AtomicBool,
}

impl Multiplexer {
    pub fn new(prefix: &str, prompt: &str, channel_capacity: usize) -> Self {
        Self {
            decoder: SentinelDecoder::new(prefix),
            prompt: prompt.to_string(),
            registry: OutputRegistry::new(channel_capacity),
            pending: Mutex::new(None),
            initialized: AtomicBool::new(false),
            exited: AtomicBool::new(false),
        }
    }

    pub fn registry(&self) -> &OutputRegistry {
        &self.registry
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Whether either pipe has reached EOF.
    pub fn is_exited(&self) -> bool {
        self.exited.load(Ordering::Acquire)
    }

    /// Wait for `marker`; replaces whatever invocation was armed before.
    pub fn arm(&self, marker: &Marker) -> oneshot::Receiver<Completion> {
        let (tx, rx) = oneshot::channel();
        let mut pending = self.lock_pending();
        if pending.is_some() {
            debug!("replacing an armed completion");
        }
        *pending = Some(PendingCompletion {
            token: marker.token().to_string(),
            sentinel: None,
            stderr_drained: false,
            tx: Some(tx),
        });
        drop(pending);

        // Nothing would ever complete it.
        if self.is_exited() {
            self.fire_exited();
        }
        rx
    }

    pub fn disarm(&self) {
        self.lock_pending().take();
    }

    /// Start a reader task draining `reader` until EOF or `cancel`.
    pub fn spawn_reader<R>(
        self: &Arc<Self>,
        stream: StreamKind,
        reader: R,
        cancel: CancellationToken,
    ) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let mux = Arc::clone(self);
        tokio::spawn(async move { mux.pump(stream, reader, cancel).await })
    }

    async fn pump<R>(self: Arc<Self>, stream: StreamKind, mut reader: R, cancel: CancellationToken)
    where
        R: AsyncRead + Unpin,
    {
        let mut codec = ShellLineCodec::new();
        let mut buf = BytesMut::with_capacity(READ_BUFFER_BYTES);
        let mut consecutive_errors = 0u32;

        loop {
            let read = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    debug!(%stream, "reader cancelled");
                    return;
                }
                read = reader.read_buf(&mut buf) => read,
            };

            match read {
                Ok(0) => {
                    while let Ok(Some(line)) = codec.decode_eof(&mut buf) {
                        self.dispatch(stream, line);
                    }
                    self.handle_eof(stream);
                    return;
                }
                Ok(_) => {
                    consecutive_errors = 0;
                    while let Ok(Some(line)) = codec.decode(&mut buf) {
                        self.dispatch(stream, line);
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    consecutive_errors += 1;
                    self.report(ShellError::StreamRead {
                        stream: stream.as_str(),
                        source: err,
                    });
                    if consecutive_errors >= MAX_CONSECUTIVE_READ_ERRORS {
                        warn!(%stream, consecutive_errors, "giving up on unreadable pipe");
                        self.handle_eof(stream);
                        return;
                    }
                    tokio::time::sleep(READ_ERROR_BACKOFF).await;
                }
            }
        }
    }

    fn dispatch(&self, stream: StreamKind, line: String) {
        let outcome = catch_unwind(AssertUnwindSafe(|| self.handle_line(stream, &line)));
        if let Err(payload) = outcome {
            self.report(ShellError::ListenerPanic {
                listener: stream.reader_name(),
                message: panic_message(payload.as_ref()),
            });
        }
    }

    /// Classify one line read from `stream`.
    pub(crate) fn handle_line(&self, stream: StreamKind, line: &str) {
        let text = match stream {
            StreamKind::Stderr => {
                let stripped = self.strip_prompt(line);
                if stripped.is_empty() && !line.is_empty() {
                    trace!("dropping prompt-only stderr line");
                    return;
                }
                stripped
            }
            StreamKind::Stdout => line,
        };

        if let Some(hit) = self.decoder.find(text) {
            // The drain marker is printed alone; anything after it is not ours.
            let drain_shaped = stream == StreamKind::Stdout || hit.fields.trim().is_empty();
            if drain_shaped && self.is_current(hit.token) {
                if !hit.leading.is_empty() {
                    self.forward(stream, hit.leading);
                }
                self.complete(stream, hit.fields);
                return;
            }
            if hit.is_token_shaped() {
                debug!(%stream, token = hit.token, "discarding stale sentinel");
                if !hit.leading.is_empty() {
                    self.forward(stream, hit.leading);
                }
                return;
            }
        }

        self.forward(stream, text);
    }

    pub(crate) fn handle_eof(&self, stream: StreamKind) {
        if !self.exited.swap(true, Ordering::AcqRel) {
            info!(%stream, "shell pipe closed");
        }
        self.fire_exited();
    }

    fn fire_exited(&self) {
        let tx = self.lock_pending().as_mut().and_then(|p| p.tx.take());
        if let Some(tx) = tx {
            let _ = tx.send(Completion::ShellExited);
        }
    }

    fn report(&self, err: ShellError) {
        match err {
            ShellError::ListenerPanic { .. } => error!(%err, "output listener recovered from panic"),
            _ => warn!(%err, "output listener error"),
        }
        if !self.registry.is_empty() {
            self.registry.broadcast(OutputEvent::ReaderError(err.to_string()));
        }
    }

    fn strip_prompt<'a>(&self, mut line: &'a str) -> &'a str {
        if self.prompt.is_empty() {
            return line;
        }
        while let Some(rest) = line.strip_prefix(self.prompt.as_str()) {
            line = rest;
        }
        line
    }

    fn is_current(&self, token: &str) -> bool {
        self.lock_pending()
            .as_ref()
            .is_some_and(|pending| pending.token == token)
    }

    fn forward(&self, stream: StreamKind, text: &str) {
        if !self.is_initialized() {
            debug!(%stream, line = text, "shell init output");
            return;
        }

        if stream == StreamKind::Stdout {
            let finished = self
                .lock_pending()
                .as_ref()
                .is_some_and(|pending| pending.sentinel.is_some());
            if finished {
                trace!(line = text, "dropping stdout after sentinel");
                return;
            }
        }

        self.registry.broadcast(OutputEvent::Line(format!("{text}\n")));
    }

    fn complete(&self, stream: StreamKind, fields: &str) {
        let mut pending = self.lock_pending();
        let Some(state) = pending.as_mut() else {
            return;
        };

        match stream {
            StreamKind::Stdout => {
                let sentinel = self.decoder.decode(fields).unwrap_or_else(|err| {
                    warn!(%err, "unparsable sentinel, reporting unknown exit code");
                    Sentinel {
                        exit_code: -1,
                        cwd: None,
                    }
                });
                state.sentinel = Some(sentinel);
            }
            StreamKind::Stderr => state.stderr_drained = true,
        }

        if !state.stderr_drained {
            return;
        }
        let Some(sentinel) = state.sentinel.clone() else {
            return;
        };
        let Some(tx) = state.tx.take() else {
            return;
        };

        if !self.initialized.swap(true, Ordering::AcqRel) {
            info!(cwd = ?sentinel.cwd, "shell initialization complete");
        }
        if tx.send(Completion::Finished(sentinel)).is_err() {
            debug!("completion arrived after the invocation stopped waiting");
        }
    }

    fn lock_pending(&self) -> MutexGuard<'_, Option<PendingCompletion>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
