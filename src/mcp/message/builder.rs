//! Builder patterns for constructing MCP response messages.
//!
//! These builders follow the fluent API pattern to construct short,
//! human-readable summaries that sit next to the structured tool output.

use std::time::Duration;

/// Builder for `execute_bash` result messages.
///
/// # Example
///
/// ```ignore
/// let message = ExecuteMessageBuilder::new("make test", 2, "/work")
///     .with_duration(Duration::from_millis(830))
///     .build();
/// ```
pub struct ExecuteMessageBuilder {
    command: String,
    exit_code: i32,
    cwd: String,
    timed_out: bool,
    duration: Option<Duration>,
}

impl ExecuteMessageBuilder {
    pub fn new(command: impl Into<String>, exit_code: i32, cwd: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            exit_code,
            cwd: cwd.into(),
            timed_out: false,
            duration: None,
        }
    }

    /// Mark the command as interrupted before it completed.
    pub fn timed_out(mut self, timed_out: bool) -> Self {
        self.timed_out = timed_out;
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    /// Build the message string.
    pub fn build(&self) -> String {
        let header = if self.timed_out {
            "COMMAND INTERRUPTED"
        } else if self.exit_code == 0 {
            "COMMAND SUCCEEDED"
        } else {
            "COMMAND FAILED"
        };

        let mut lines = vec![
            format!("{}:", header),
            format!("• command: '{}'", truncate_command(&self.command, 50)),
        ];
        if self.timed_out {
            lines.push("• exit_code: -1 (no completion marker received)".to_string());
        } else {
            lines.push(format!("• exit_code: {}", self.exit_code));
        }
        if !self.cwd.is_empty() {
            lines.push(format!("• cwd: {}", self.cwd));
        }
        if let Some(duration) = self.duration {
            lines.push(format!("• duration_ms: {}", duration.as_millis()));
        }

        if self.timed_out {
            lines.push(String::new());
            lines.push(
                "The shell session is still alive. Use session_info to check the current directory."
                    .to_string(),
            );
        }

        lines.join("\n")
    }
}

/// Builder for `session_info` messages.
///
/// # Example
///
/// ```ignore
/// let message = SessionMessageBuilder::new("ready", "/work")
///     .with_pid(Some(4242))
///     .with_restarts(1)
///     .build();
/// ```
pub struct SessionMessageBuilder {
    status: String,
    cwd: String,
    pid: Option<u32>,
    restarts: u32,
}

impl SessionMessageBuilder {
    pub fn new(status: impl Into<String>, cwd: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            cwd: cwd.into(),
            pid: None,
            restarts: 0,
        }
    }

    pub fn with_pid(mut self, pid: Option<u32>) -> Self {
        self.pid = pid;
        self
    }

    /// Set how many times the shell was replaced after the first start.
    pub fn with_restarts(mut self, restarts: u32) -> Self {
        self.restarts = restarts;
        self
    }

    /// Build the message string.
    pub fn build(&self) -> String {
        let mut lines = vec![
            "SHELL SESSION:".to_string(),
            format!("• status: {}", self.status),
            format!("• cwd: {}", self.cwd),
        ];
        if let Some(pid) = self.pid {
            lines.push(format!("• pid: {}", pid));
        }
        if self.restarts > 0 {
            lines.push(format!("• restarts: {}", self.restarts));
        }

        lines.push(String::new());
        if self.status == "closed" {
            lines.push("The session is closed; commands will be rejected.".to_string());
        } else {
            lines.push(
                "Use execute_bash to run commands. Directory and environment changes persist."
                    .to_string(),
            );
        }

        lines.join("\n")
    }
}

/// Truncate a command string for display purposes.
fn truncate_command(command: &str, max_len: usize) -> String {
    let first_line = command.lines().next().unwrap_or_default();
    let multiline = first_line.len() != command.trim_end().len();

    if first_line.chars().count() > max_len {
        let kept: String = first_line.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    } else if multiline {
        format!("{}...", first_line)
    } else {
        first_line.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod execute_message_builder {
        use super::*;

        #[test]
        fn test_success_message() {
            let message = ExecuteMessageBuilder::new("ls -la", 0, "/work").build();

            assert!(message.contains("COMMAND SUCCEEDED"));
            assert!(message.contains("command: 'ls -la'"));
            assert!(message.contains("exit_code: 0"));
            assert!(message.contains("cwd: /work"));
        }

        #[test]
        fn test_failure_message() {
            let message = ExecuteMessageBuilder::new("false", 1, "/work").build();

            assert!(message.contains("COMMAND FAILED"));
            assert!(message.contains("exit_code: 1"));
        }

        #[test]
        fn test_timed_out_message() {
            let message = ExecuteMessageBuilder::new("sleep 60", -1, "")
                .timed_out(true)
                .build();

            assert!(message.contains("COMMAND INTERRUPTED"));
            assert!(message.contains("no completion marker"));
            assert!(message.contains("session_info"));
            assert!(!message.contains("cwd:"));
        }

        #[test]
        fn test_with_duration() {
            let message = ExecuteMessageBuilder::new("true", 0, "/work")
                .with_duration(Duration::from_millis(1250))
                .build();

            assert!(message.contains("duration_ms: 1250"));
        }

        #[test]
        fn test_long_command_truncated() {
            let long_cmd = "a".repeat(100);
            let message = ExecuteMessageBuilder::new(long_cmd.as_str(), 0, "/work").build();

            assert!(message.contains("..."));
            assert!(!message.contains(&long_cmd));
        }
    }

    mod session_message_builder {
        use super::*;

        #[test]
        fn test_ready_session() {
            let message = SessionMessageBuilder::new("ready", "/work")
                .with_pid(Some(4242))
                .build();

            assert!(message.contains("status: ready"));
            assert!(message.contains("cwd: /work"));
            assert!(message.contains("pid: 4242"));
            assert!(message.contains("execute_bash"));
            assert!(!message.contains("restarts"));
        }

        #[test]
        fn test_restarts_shown() {
            let message = SessionMessageBuilder::new("ready", "/work")
                .with_restarts(2)
                .build();

            assert!(message.contains("restarts: 2"));
        }

        #[test]
        fn test_closed_session() {
            let message = SessionMessageBuilder::new("closed", "/work").build();

            assert!(message.contains("status: closed"));
            assert!(message.contains("rejected"));
            assert!(!message.contains("pid:"));
        }
    }

    mod truncate_command {
        use super::*;

        #[test]
        fn test_short_command() {
            assert_eq!(truncate_command("ls -la", 50), "ls -la");
        }

        #[test]
        fn test_exact_length() {
            let cmd = "a".repeat(50);
            assert_eq!(truncate_command(&cmd, 50), cmd);
        }

        #[test]
        fn test_long_command() {
            let cmd = "a".repeat(60);
            let result = truncate_command(&cmd, 50);
            assert!(result.ends_with("..."));
            assert!(result.chars().count() <= 50);
        }

        #[test]
        fn test_multibyte_command_does_not_split_chars() {
            let cmd = "é".repeat(60);
            let result = truncate_command(&cmd, 10);
            assert_eq!(result, format!("{}...", "é".repeat(7)));
        }

        #[test]
        fn test_multiline_command_shows_first_line() {
            assert_eq!(truncate_command("cd /tmp\nls", 50), "cd /tmp...");
        }

        #[test]
        fn test_trailing_newline_is_not_multiline() {
            assert_eq!(truncate_command("ls\n", 50), "ls");
        }
    }
}
