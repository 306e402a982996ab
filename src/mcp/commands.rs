//! MCP shell tool implementation.
//!
//! This module provides the MCP tools backed by the persistent shell session:
//!
//! - `execute_bash`: Run a command in the session and wait for its result
//! - `session_info`: Report the session's status and working directory

use std::sync::Arc;
use std::time::Instant;

use poem_mcpserver::{Tools, tool::StructuredContent};
use tracing::{error, info};

use super::config::resolve_hard_timeout;
use super::executor::Executor;
use super::message::{ExecuteMessageBuilder, SessionMessageBuilder};
use super::types::{ExecuteBashResponse, Invocation, SessionInfoResponse};

/// MCP shell tools.
///
/// Every MCP session created by the server gets its own `McpShellCommands`,
/// all sharing one executor and therefore one shell.
#[derive(Clone)]
pub struct McpShellCommands {
    executor: Arc<Executor>,
}

impl McpShellCommands {
    pub fn new(executor: Arc<Executor>) -> Self {
        Self { executor }
    }
}

#[Tools]
impl McpShellCommands {
    /// Execute a bash command in a persistent interactive shell session.
    ///
    /// The session keeps its state between calls: `cd`, exported variables,
    /// aliases and shell functions carry over to the next command. Commands
    /// run one at a time; a call made while another command is running waits
    /// for it to finish.
    ///
    /// Commands cannot read from stdin. Interactive programs (editors, pagers,
    /// password prompts) will see end-of-file immediately.
    ///
    /// When `hard_timeout_secs` elapses the command is interrupted with
    /// SIGINT, `exit_code` is -1, `timed_out` is true, and any output produced
    /// so far is returned. The session itself survives.
    async fn execute_bash(
        &self,
        /// The bash command to run (may span multiple lines)
        command: String,
        /// Directory to run the command in, absolute or relative to the session's current directory (default: session cwd)
        cwd: Option<String>,
        /// Interrupt the command after this many seconds; 0 or negative disables the timeout (default: none, env: SHELL_COMMAND_TIMEOUT)
        hard_timeout_secs: Option<i64>,
    ) -> Result<StructuredContent<ExecuteBashResponse>, String> {
        let hard_timeout = match hard_timeout_secs {
            Some(secs) => resolve_hard_timeout(Some(secs)),
            None => self.executor.config().default_hard_timeout,
        };

        let invocation = Invocation::new(command.clone())
            .with_cwd(cwd)
            .with_hard_timeout(hard_timeout);
        info!(
            invocation_id = %invocation.id,
            cwd = ?invocation.cwd,
            timeout = ?invocation.hard_timeout,
            "execute_bash"
        );

        let started = Instant::now();
        match self.executor.execute(invocation).await {
            Ok(result) => {
                let duration = started.elapsed();
                let message = ExecuteMessageBuilder::new(&command, result.exit_code, &result.cwd)
                    .timed_out(result.timed_out)
                    .with_duration(duration)
                    .build();

                Ok(StructuredContent(ExecuteBashResponse {
                    content: result.content,
                    exit_code: result.exit_code,
                    cwd: result.cwd,
                    timed_out: result.timed_out,
                    duration_ms: duration.as_millis() as u64,
                    message,
                }))
            }
            Err(e) => {
                error!("Command execution failed: {}", e);
                Err(e.to_observation())
            }
        }
    }

    /// Report the state of the shell session.
    ///
    /// Never waits for a running command. Use this to find the current
    /// working directory after a command timed out.
    async fn session_info(&self) -> StructuredContent<SessionInfoResponse> {
        let snapshot = self.executor.snapshot();
        let restarts = snapshot.starts.saturating_sub(1);
        let pid = snapshot.shell.as_ref().map(|shell| shell.pid);

        let message = SessionMessageBuilder::new(snapshot.status.to_string(), &snapshot.cwd)
            .with_pid(pid)
            .with_restarts(restarts)
            .build();

        StructuredContent(SessionInfoResponse {
            status: snapshot.status,
            cwd: snapshot.cwd,
            shell: snapshot
                .shell
                .as_ref()
                .map(|shell| shell.shell.clone())
                .unwrap_or_else(|| self.executor.config().shell.clone()),
            pid,
            started_at: snapshot.shell.map(|shell| shell.started_at),
            restarts,
            message,
        })
    }
}
