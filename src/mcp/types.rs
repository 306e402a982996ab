//! Request, result and response types for the shell executor.
//!
//! Types that cross the MCP or HTTP boundary implement `Serialize`,
//! `Deserialize`, and `JsonSchema` for proper MCP protocol compatibility.

use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One command to run in the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    /// Unique id, also the key of the invocation's output channel
    pub id: String,
    pub command: String,
    /// Absolute, or relative to the session's current directory
    pub cwd: Option<String>,
    /// `None` waits for completion indefinitely
    pub hard_timeout: Option<Duration>,
}

impl Invocation {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            command: command.into(),
            cwd: None,
            hard_timeout: None,
        }
    }

    pub fn with_cwd(mut self, cwd: Option<impl Into<String>>) -> Self {
        self.cwd = cwd.map(Into::into);
        self
    }

    pub fn with_hard_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.hard_timeout = timeout;
        self
    }

    /// Seconds as given by callers; `<= 0` means no timeout.
    pub fn with_hard_timeout_secs(self, secs: i64) -> Self {
        let timeout = u64::try_from(secs)
            .ok()
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);
        self.with_hard_timeout(timeout)
    }
}

/// Outcome of one invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ExecutionResult {
    /// Combined stdout and stderr, plus any executor notices
    pub content: String,
    /// Command exit code; `-1` when unknown (timeout, cancellation, shell exit)
    pub exit_code: i32,
    /// Shell directory after the command; empty when no sentinel was observed
    pub cwd: String,
    /// Whether the hard timeout or a caller cancellation ended the command
    #[serde(default)]
    pub timed_out: bool,
}

/// One item of a streamed invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamChunk {
    /// Output text, usually one line
    Output { text: String },
    /// Final item of a successful run
    Completed {
        exit_code: i32,
        cwd: String,
        timed_out: bool,
    },
    /// Final item when the invocation could not run
    Failed { error_type: String, message: String },
}

impl StreamChunk {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamChunk::Output { .. })
    }
}

/// Lifecycle of the executor's session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// No shell has finished initialization yet
    Uninitialized,
    /// A shell is running and accepting commands
    Ready,
    /// `close` was called; no further commands run
    Closed,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Uninitialized => write!(f, "uninitialized"),
            SessionStatus::Ready => write!(f, "ready"),
            SessionStatus::Closed => write!(f, "closed"),
        }
    }
}

/// Metadata of a spawned shell process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ShellInfo {
    #[schemars(schema_with = "crate::mcp::schema::uint")]
    pub pid: u32,
    pub shell: String,
    /// When the process was spawned (RFC3339 format)
    pub started_at: String,
}

/// Point-in-time view of the session, readable without the command lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub status: SessionStatus,
    pub cwd: String,
    pub shell: Option<ShellInfo>,
    /// Times the shell was started, including the first start
    pub starts: u32,
}

/// Response from `execute_bash`
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct ExecuteBashResponse {
    /// Combined stdout and stderr of the command
    pub content: String,
    /// Exit code; -1 when the command timed out or the shell exited
    pub exit_code: i32,
    /// Working directory of the session after the command
    pub cwd: String,
    /// Whether the command hit its hard timeout (partial output is still returned)
    #[serde(default)]
    pub timed_out: bool,
    /// Wall-clock duration of the invocation in milliseconds
    #[schemars(schema_with = "crate::mcp::schema::uint")]
    pub duration_ms: u64,
    /// Human-readable summary of the invocation
    pub message: String,
}

/// Response from `session_info`
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct SessionInfoResponse {
    pub status: SessionStatus,
    /// Current working directory of the session
    pub cwd: String,
    /// Shell binary in use
    pub shell: String,
    /// Process id of the running shell
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "crate::mcp::schema::optional_uint")]
    pub pid: Option<u32>,
    /// When the running shell was spawned (RFC3339 format)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    /// How many times the shell was restarted after exiting
    #[schemars(schema_with = "crate::mcp::schema::uint")]
    pub restarts: u32,
    pub message: String,
}

/// Body of `POST /execute_stream`
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ExecuteStreamRequest {
    pub command: String,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub hard_timeout_secs: Option<i64>,
}
