//! Error types for the shell executor.
//!
//! `ShellError` covers every failure the session can surface. Timeouts are
//! deliberately absent: a timed out invocation is a normal result with exit
//! code `-1` and a notice appended to its output.
//!
//! Each variant maps to a stable `error_type()` name that callers of the MCP
//! tools see as the prefix of the error string, e.g. `BashIOError: ...`.
//!
//! # Classification
//!
//! Spawn failures are classified for retry the same way connection errors
//! would be: transient OS conditions (`EAGAIN`, `EINTR`, busy resources) are
//! worth another attempt, while a missing binary or a permission problem
//! will never succeed and fails immediately.

use std::any::Any;
use std::io;
use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ShellError>;

#[derive(Debug, Error)]
pub enum ShellError {
    #[error("failed to start shell `{shell}`: {source}")]
    Spawn {
        shell: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to capture shell {0}")]
    MissingStream(&'static str),

    #[error("shell did not finish initialization within {}s", .0.as_secs())]
    StartupTimeout(Duration),

    #[error("shell exited before finishing initialization")]
    StartupExited,

    #[error("failed to write command to shell stdin: {0}")]
    BashIo(#[source] io::Error),

    #[error("shell session is closed")]
    Closed,

    #[error("malformed sentinel line: {0:?}")]
    MalformedSentinel(String),

    #[error("{stream} read error: {source}")]
    StreamRead {
        stream: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("{listener} panicked: {message}")]
    ListenerPanic {
        listener: &'static str,
        message: String,
    },

    #[error("failed to interrupt shell: {0}")]
    Interrupt(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl ShellError {
    /// Stable error category reported to callers.
    pub fn error_type(&self) -> &'static str {
        match self {
            ShellError::Spawn { .. }
            | ShellError::MissingStream(_)
            | ShellError::StartupTimeout(_)
            | ShellError::StartupExited => "ShellStartError",
            ShellError::BashIo(_) => "BashIOError",
            ShellError::Closed => "SessionClosedError",
            ShellError::MalformedSentinel(_) => "ProtocolError",
            ShellError::StreamRead { .. } => "StreamReadError",
            ShellError::ListenerPanic { .. } => "ListenerPanicError",
            ShellError::Interrupt(_) => "SignalError",
            ShellError::Config(_) => "ConfigError",
        }
    }

    /// Whether starting the shell again may succeed.
    pub(crate) fn is_retryable(&self) -> bool {
        match self {
            ShellError::Spawn { source, .. } => is_retryable_io_error(source),
            ShellError::StartupExited => true,
            _ => false,
        }
    }

    /// Whether the session must be replaced before the next invocation.
    pub(crate) fn requires_restart(&self) -> bool {
        matches!(
            self,
            ShellError::BashIo(_) | ShellError::StartupExited | ShellError::StartupTimeout(_)
        )
    }

    /// Render as `<ErrorType>: <message>` for the tool boundary.
    pub fn to_observation(&self) -> String {
        format!("{}: {}", self.error_type(), self)
    }
}

/// Transient OS conditions worth another spawn attempt.
const RETRYABLE_KINDS: &[io::ErrorKind] = &[
    io::ErrorKind::WouldBlock,
    io::ErrorKind::Interrupted,
    io::ErrorKind::ResourceBusy,
    io::ErrorKind::OutOfMemory,
    io::ErrorKind::TimedOut,
];

/// Determines if an I/O error from spawning is transient.
///
/// `NotFound` and `PermissionDenied` are permanent: the binary will not
/// appear, and its mode will not change, between attempts.
pub(crate) fn is_retryable_io_error(error: &io::Error) -> bool {
    match error.kind() {
        io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied => false,
        kind => RETRYABLE_KINDS.contains(&kind),
    }
}

/// Whether a write failure means the read end of stdin is gone.
pub(crate) fn is_broken_pipe(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset | io::ErrorKind::UnexpectedEof
    )
}

/// Text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
