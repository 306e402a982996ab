//! MCP shell module providing a persistent bash session as tools.
//!
//! This module is organized into the following submodules:
//!
//! - `types`: Invocation, result and MCP response types
//! - `config`: Configuration resolution with environment variable support
//! - `error`: Error types and retry classification
//! - `protocol`: Command encoding and sentinel parsing
//! - `codec`: Line framing for the shell's output pipes
//! - `registry`: Per-invocation output channels
//! - `multiplexer`: Reader tasks and sentinel detection
//! - `signal`: Process group interruption
//! - `shell`: Spawning and stopping the shell process
//! - `session`: Session state, restarts and snapshots
//! - `executor`: Runs invocations against the session
//! - `commands`: MCP tool implementations
//! - `sse`: Streaming HTTP endpoint

pub(crate) mod codec;
pub mod commands;
pub mod config;
pub mod error;
pub mod executor;
pub(crate) mod message;
pub(crate) mod multiplexer;
pub mod protocol;
pub(crate) mod registry;
pub(crate) mod schema;
pub mod session;
pub(crate) mod shell;
pub mod signal;
pub mod sse;
pub mod types;

pub use commands::McpShellCommands;
pub use config::{ShellConfig, resolve_hard_timeout};
pub use error::ShellError;
pub use executor::Executor;
pub use types::{ExecutionResult, Invocation, SessionSnapshot, SessionStatus, StreamChunk};
