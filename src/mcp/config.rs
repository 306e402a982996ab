//! Configuration resolution for the shell executor.
//!
//! This module handles configuration values with a three-tier priority system:
//!
//! 1. **Parameter** - Explicitly provided function parameter (highest priority)
//! 2. **Environment Variable** - Value from environment variable
//! 3. **Default** - Built-in default value (lowest priority)
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `SHELL_WORKING_DIR` | process cwd | Initial working directory of the session |
//! | `SHELL_BINARY` | `bash` | Interactive shell binary |
//! | `SHELL_COMMAND_TIMEOUT` | none | Default hard timeout in seconds (`<= 0` disables) |
//! | `SHELL_STARTUP_TIMEOUT` | 30s | How long to wait for shell initialization |
//! | `SHELL_SHUTDOWN_GRACE` | 5s | How long `close` waits before killing the shell |
//! | `SHELL_SENTINEL_PREFIX` | `__OPENHANDS_COMMAND_DONE__` | Completion marker prefix |
//! | `SHELL_PROMPT` | `OPENHANDS_PROMPT>` | `PS1` installed during initialization |
//! | `SHELL_GIT_USER_NAME` | `openhands` | Commit author/committer name |
//! | `SHELL_GIT_USER_EMAIL` | `openhands@all-hands.dev` | Commit author/committer email |
//! | `SHELL_OUTPUT_BUFFER_LINES` | 1024 | Per-invocation output channel capacity |
//! | `SHELL_MAX_START_RETRIES` | 3 | Spawn retries for transient OS errors |

use std::env;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use super::error::{Result, ShellError};

/// Default interactive shell binary
pub(crate) const DEFAULT_SHELL_BINARY: &str = "bash";

/// Default shell startup timeout in seconds
pub(crate) const DEFAULT_STARTUP_TIMEOUT_SECS: u64 = 30;

/// Default grace period granted to the shell on close, in seconds
pub(crate) const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 5;

/// Default completion marker prefix
pub const DEFAULT_SENTINEL_PREFIX: &str = "__OPENHANDS_COMMAND_DONE__";

/// Default `PS1` used to recognise prompt noise on stderr
pub const DEFAULT_PROMPT: &str = "OPENHANDS_PROMPT>";

pub(crate) const DEFAULT_GIT_USER_NAME: &str = "openhands";
pub(crate) const DEFAULT_GIT_USER_EMAIL: &str = "openhands@all-hands.dev";

/// Default capacity of a per-invocation output channel, in lines
pub(crate) const DEFAULT_OUTPUT_BUFFER_LINES: usize = 1024;

/// Default number of spawn retries on transient failures
pub(crate) const DEFAULT_MAX_START_RETRIES: u32 = 3;

pub(crate) const WORKING_DIR_ENV_VAR: &str = "SHELL_WORKING_DIR";
pub(crate) const SHELL_BINARY_ENV_VAR: &str = "SHELL_BINARY";
pub(crate) const COMMAND_TIMEOUT_ENV_VAR: &str = "SHELL_COMMAND_TIMEOUT";
pub(crate) const STARTUP_TIMEOUT_ENV_VAR: &str = "SHELL_STARTUP_TIMEOUT";
pub(crate) const SHUTDOWN_GRACE_ENV_VAR: &str = "SHELL_SHUTDOWN_GRACE";
pub(crate) const SENTINEL_PREFIX_ENV_VAR: &str = "SHELL_SENTINEL_PREFIX";
pub(crate) const PROMPT_ENV_VAR: &str = "SHELL_PROMPT";
pub(crate) const GIT_USER_NAME_ENV_VAR: &str = "SHELL_GIT_USER_NAME";
pub(crate) const GIT_USER_EMAIL_ENV_VAR: &str = "SHELL_GIT_USER_EMAIL";
pub(crate) const OUTPUT_BUFFER_ENV_VAR: &str = "SHELL_OUTPUT_BUFFER_LINES";
pub(crate) const MAX_START_RETRIES_ENV_VAR: &str = "SHELL_MAX_START_RETRIES";

/// Identity exported to version-control tooling inside the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitIdentity {
    pub name: String,
    pub email: String,
}

/// Everything needed to start and drive one shell session.
#[derive(Debug, Clone)]
pub struct ShellConfig {
    /// Absolute directory the shell starts in
    pub working_dir: String,
    /// Shell binary, launched with `-i`
    pub shell: String,
    pub sentinel_prefix: String,
    pub prompt: String,
    /// `None` leaves the inherited git environment untouched
    pub git_identity: Option<GitIdentity>,
    /// Applied when an invocation carries no timeout of its own
    pub default_hard_timeout: Option<Duration>,
    pub startup_timeout: Duration,
    pub shutdown_grace: Duration,
    pub output_buffer_lines: usize,
    pub max_start_retries: u32,
}

impl ShellConfig {
    /// Built-in defaults rooted at `working_dir`, ignoring the environment.
    pub fn new(working_dir: impl Into<String>) -> Self {
        Self {
            working_dir: working_dir.into(),
            shell: DEFAULT_SHELL_BINARY.to_string(),
            sentinel_prefix: DEFAULT_SENTINEL_PREFIX.to_string(),
            prompt: DEFAULT_PROMPT.to_string(),
            git_identity: Some(GitIdentity {
                name: DEFAULT_GIT_USER_NAME.to_string(),
                email: DEFAULT_GIT_USER_EMAIL.to_string(),
            }),
            default_hard_timeout: None,
            startup_timeout: Duration::from_secs(DEFAULT_STARTUP_TIMEOUT_SECS),
            shutdown_grace: Duration::from_secs(DEFAULT_SHUTDOWN_GRACE_SECS),
            output_buffer_lines: DEFAULT_OUTPUT_BUFFER_LINES,
            max_start_retries: DEFAULT_MAX_START_RETRIES,
        }
    }

    /// Resolve every setting from the environment, falling back to defaults.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            working_dir: resolve_working_dir(None)?,
            shell: resolve_shell_binary(None),
            sentinel_prefix: resolve_sentinel_prefix(None),
            prompt: resolve_prompt(None),
            git_identity: Some(resolve_git_identity(None, None)),
            default_hard_timeout: resolve_hard_timeout(None),
            startup_timeout: resolve_startup_timeout(None),
            shutdown_grace: resolve_shutdown_grace(None),
            output_buffer_lines: resolve_output_buffer_lines(None),
            max_start_retries: resolve_max_start_retries(None),
        })
    }

    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    pub fn with_git_identity(mut self, identity: Option<GitIdentity>) -> Self {
        self.git_identity = identity;
        self
    }

    pub fn with_default_hard_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_hard_timeout = timeout;
        self
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_sentinel_prefix(mut self, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        if is_valid_sentinel_prefix(&prefix) {
            self.sentinel_prefix = prefix;
        }
        self
    }
}

/// Resolve the working directory with priority: parameter -> env var -> process cwd.
///
/// The result is always absolute and lexically cleaned.
pub(crate) fn resolve_working_dir(dir_param: Option<&str>) -> Result<String> {
    let cwd = env::current_dir()
        .map_err(|e| ShellError::Config(format!("cannot determine current directory: {e}")))?;

    let requested = match dir_param {
        Some(dir) => Some(dir.to_string()),
        None => env::var(WORKING_DIR_ENV_VAR)
            .ok()
            .filter(|dir| !dir.trim().is_empty()),
    };

    let resolved = match requested {
        Some(dir) => cwd.join(dir),
        None => cwd,
    };

    Ok(clean_path(&resolved).to_string_lossy().into_owned())
}

/// Resolve the shell binary with priority: parameter -> env var -> default
pub(crate) fn resolve_shell_binary(shell_param: Option<&str>) -> String {
    if let Some(shell) = shell_param {
        return shell.to_string();
    }

    if let Ok(shell) = env::var(SHELL_BINARY_ENV_VAR)
        && !shell.trim().is_empty()
    {
        return shell;
    }

    DEFAULT_SHELL_BINARY.to_string()
}

/// Resolve the hard timeout for one invocation: parameter -> env var -> none.
///
/// Any value `<= 0` means "no timeout", whether it comes from the caller or
/// the environment.
pub fn resolve_hard_timeout(timeout_param: Option<i64>) -> Option<Duration> {
    let secs = match timeout_param {
        Some(secs) => secs,
        None => env::var(COMMAND_TIMEOUT_ENV_VAR)
            .ok()
            .and_then(|value| value.trim().parse::<i64>().ok())?,
    };

    u64::try_from(secs)
        .ok()
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs)
}

/// Resolve the startup timeout with priority: parameter -> env var -> default
pub(crate) fn resolve_startup_timeout(timeout_param: Option<u64>) -> Duration {
    Duration::from_secs(resolve_u64(
        timeout_param,
        STARTUP_TIMEOUT_ENV_VAR,
        DEFAULT_STARTUP_TIMEOUT_SECS,
    ))
}

/// Resolve the shutdown grace period with priority: parameter -> env var -> default
pub(crate) fn resolve_shutdown_grace(grace_param: Option<u64>) -> Duration {
    Duration::from_secs(resolve_u64(
        grace_param,
        SHUTDOWN_GRACE_ENV_VAR,
        DEFAULT_SHUTDOWN_GRACE_SECS,
    ))
}

/// Resolve the sentinel prefix; invalid values fall through to the next tier.
pub(crate) fn resolve_sentinel_prefix(prefix_param: Option<&str>) -> String {
    if let Some(prefix) = prefix_param
        && is_valid_sentinel_prefix(prefix)
    {
        return prefix.to_string();
    }

    if let Ok(prefix) = env::var(SENTINEL_PREFIX_ENV_VAR)
        && is_valid_sentinel_prefix(&prefix)
    {
        return prefix;
    }

    DEFAULT_SENTINEL_PREFIX.to_string()
}

/// Resolve the prompt with priority: parameter -> env var -> default
pub(crate) fn resolve_prompt(prompt_param: Option<&str>) -> String {
    if let Some(prompt) = prompt_param {
        return prompt.to_string();
    }

    if let Ok(prompt) = env::var(PROMPT_ENV_VAR)
        && !prompt.is_empty()
    {
        return prompt;
    }

    DEFAULT_PROMPT.to_string()
}

/// Resolve the git identity; name and email resolve independently.
pub(crate) fn resolve_git_identity(
    name_param: Option<&str>,
    email_param: Option<&str>,
) -> GitIdentity {
    let name = name_param
        .map(str::to_string)
        .or_else(|| env::var(GIT_USER_NAME_ENV_VAR).ok())
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_GIT_USER_NAME.to_string());
    let email = email_param
        .map(str::to_string)
        .or_else(|| env::var(GIT_USER_EMAIL_ENV_VAR).ok())
        .filter(|email| !email.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_GIT_USER_EMAIL.to_string());

    GitIdentity { name, email }
}

/// Resolve the output channel capacity; zero is not a usable capacity.
pub(crate) fn resolve_output_buffer_lines(lines_param: Option<usize>) -> usize {
    if let Some(lines) = lines_param.filter(|lines| *lines > 0) {
        return lines;
    }

    if let Ok(env_lines) = env::var(OUTPUT_BUFFER_ENV_VAR)
        && let Ok(lines) = env_lines.parse::<usize>()
        && lines > 0
    {
        return lines;
    }

    DEFAULT_OUTPUT_BUFFER_LINES
}

/// Resolve the spawn retry budget with priority: parameter -> env var -> default
pub(crate) fn resolve_max_start_retries(retries_param: Option<u32>) -> u32 {
    if let Some(retries) = retries_param {
        return retries;
    }

    if let Ok(env_retries) = env::var(MAX_START_RETRIES_ENV_VAR)
        && let Ok(retries) = env_retries.parse::<u32>()
    {
        return retries;
    }

    DEFAULT_MAX_START_RETRIES
}

fn resolve_u64(param: Option<u64>, env_var: &str, default: u64) -> u64 {
    if let Some(value) = param {
        return value;
    }

    if let Ok(env_value) = env::var(env_var)
        && let Ok(value) = env_value.parse::<u64>()
    {
        return value;
    }

    default
}

/// A prefix must survive single-quoting and whitespace splitting intact.
pub(crate) fn is_valid_sentinel_prefix(prefix: &str) -> bool {
    !prefix.is_empty() && !prefix.chars().any(|c| c.is_whitespace() || c == '\'')
}

/// Lexically normalise a path: drop `.`, fold `..`, never touch the filesystem.
pub(crate) fn clean_path(path: &Path) -> PathBuf {
    let mut cleaned = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !cleaned.pop() && !path.has_root() {
                    cleaned.push("..");
                }
            }
            other => cleaned.push(other.as_os_str()),
        }
    }
    if cleaned.as_os_str().is_empty() {
        cleaned.push(".");
    }
    cleaned
}
