//! Command framing for the persistent shell.
//!
//! Every command is wrapped into a single fragment that changes directory,
//! runs the command, and prints a completion marker so the reader side can
//! tell where the command's output ends:
//!
//! ```text
//! stdout: <prefix><token> <exit_code> <cwd...>
//! stderr: <prefix><token>
//! ```
//!
//! The token is fresh for every invocation. Only a marker carrying the token
//! of the invocation currently in flight completes it; a command that happens
//! to print the bare prefix is treated as ordinary output, and a late marker
//! from an interrupted invocation is recognised as stale.

use uuid::Uuid;

use super::error::{Result, ShellError};

/// Length of a marker token (a simple-format UUID).
const TOKEN_LEN: usize = 32;

/// The completion marker of one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Marker {
    tag: String,
    token: String,
}

impl Marker {
    pub fn new(prefix: &str) -> Self {
        let token = Uuid::new_v4().simple().to_string();
        Self {
            tag: format!("{prefix}{token}"),
            token,
        }
    }

    /// The per-invocation token appended to the prefix.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Prefix and token as printed by the shell.
    pub fn tag(&self) -> &str {
        &self.tag
    }
}

/// Quote a value for the shell: wrap in `'...'`, turning each `'` into `'\''`.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Build the fragment written to the shell's stdin for one invocation.
///
/// The command travels as quoted data and is run with `eval` in the session
/// shell itself, so `cd`, exported variables and aliases survive into later
/// invocations, and a command that does not parse fails with status 2
/// instead of swallowing the sentinel. Its stdin is `/dev/null`; otherwise a
/// command that reads stdin would consume the fragments that follow it.
pub fn encode_command(marker: &Marker, target_dir: &str, command: &str) -> String {
    let command = if command.trim().is_empty() {
        "true"
    } else {
        command
    };
    let tag = shell_quote(marker.tag());

    format!(
        "__oh_cmd={command}; cd {dir}; __oh_cd_rc=$?; \
         if [ $__oh_cd_rc -eq 0 ]; then {{ eval \"$__oh_cmd\"; }} </dev/null; __oh_rc=$?; \
         else __oh_rc=$__oh_cd_rc; fi; \
         printf '%s %s %s\\n' {tag} \"$__oh_rc\" \"$(pwd)\"; \
         printf '%s\\n' {tag} >&2\n",
        command = shell_quote(command),
        dir = shell_quote(target_dir),
    )
}

/// Exit code and working directory reported by a completion marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sentinel {
    pub exit_code: i32,
    /// `None` when the marker carried no directory
    pub cwd: Option<String>,
}

/// A line that contains the sentinel prefix somewhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SentinelMatch<'a> {
    /// Text before the prefix (output that lacked a trailing newline)
    pub leading: &'a str,
    pub token: &'a str,
    /// Everything after the token and its separating space
    pub fields: &'a str,
}

impl SentinelMatch<'_> {
    /// Whether the token looks like one this crate generated.
    pub fn is_token_shaped(&self) -> bool {
        self.token.len() == TOKEN_LEN
            && self
                .token
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
    }
}

/// Finds and parses completion markers in output lines.
#[derive(Debug, Clone)]
pub struct SentinelDecoder {
    prefix: String,
}

impl SentinelDecoder {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Locate the prefix in `line` and split out the token and trailing fields.
    pub fn find<'a>(&self, line: &'a str) -> Option<SentinelMatch<'a>> {
        let start = line.find(&self.prefix)?;
        let after = &line[start + self.prefix.len()..];
        let token_end = after.find(char::is_whitespace).unwrap_or(after.len());
        let rest = &after[token_end..];

        Some(SentinelMatch {
            leading: &line[..start],
            token: &after[..token_end],
            fields: rest.strip_prefix(' ').unwrap_or(rest),
        })
    }

    /// Parse `<exit_code> <cwd...>`. The directory keeps its inner spaces.
    pub fn decode(&self, fields: &str) -> Result<Sentinel> {
        let fields = fields.trim_end_matches(['\r', '\n']);
        let (code, cwd) = match fields.split_once(' ') {
            Some((code, cwd)) => (code, Some(cwd)),
            None => (fields, None),
        };

        let exit_code = code
            .trim()
            .parse::<i32>()
            .map_err(|_| ShellError::MalformedSentinel(fields.to_string()))?;

        Ok(Sentinel {
            exit_code,
            cwd: cwd.filter(|cwd| !cwd.is_empty()).map(str::to_string),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::config::DEFAULT_SENTINEL_PREFIX;

    fn decoder() -> SentinelDecoder {
        SentinelDecoder::new(DEFAULT_SENTINEL_PREFIX)
    }

    mod quoting {
        use super::*;

        #[test]
        fn test_plain_path() {
            assert_eq!(shell_quote("/tmp/work"), "'/tmp/work'");
        }

        #[test]
        fn test_path_with_spaces() {
            assert_eq!(shell_quote("/tmp/my dir"), "'/tmp/my dir'");
        }

        #[test]
        fn test_embedded_single_quote() {
            assert_eq!(shell_quote("/tmp/it's"), r"'/tmp/it'\''s'");
        }

        #[test]
        fn test_dollar_and_backticks_stay_literal() {
            assert_eq!(shell_quote("$HOME/`x`"), "'$HOME/`x`'");
        }
    }

    mod marker {
        use super::*;

        #[test]
        fn test_tag_is_prefix_plus_token() {
            let marker = Marker::new(DEFAULT_SENTINEL_PREFIX);
            assert_eq!(marker.tag(), format!("{DEFAULT_SENTINEL_PREFIX}{}", marker.token()));
            assert_eq!(marker.token().len(), TOKEN_LEN);
        }

        #[test]
        fn test_tokens_are_unique() {
            let a = Marker::new(DEFAULT_SENTINEL_PREFIX);
            let b = Marker::new(DEFAULT_SENTINEL_PREFIX);
            assert_ne!(a.token(), b.token());
        }
    }

    mod encoding {
        use super::*;

        #[test]
        fn test_fragment_changes_directory_before_running() {
            let marker = Marker::new(DEFAULT_SENTINEL_PREFIX);
            let fragment = encode_command(&marker, "/tmp/a b", "ls");
            assert!(fragment.starts_with("__oh_cmd='ls'; cd '/tmp/a b'; "));
        }

        #[test]
        fn test_fragment_evals_command_in_group() {
            let marker = Marker::new(DEFAULT_SENTINEL_PREFIX);
            let fragment = encode_command(&marker, "/tmp", "export FOO=1");
            assert!(fragment.starts_with("__oh_cmd='export FOO=1';"));
            assert!(fragment.contains("then { eval \"$__oh_cmd\"; } </dev/null;"));
        }

        #[test]
        fn test_unparsable_command_stays_quoted() {
            let marker = Marker::new(DEFAULT_SENTINEL_PREFIX);
            let fragment = encode_command(&marker, "/tmp", "echo 'abc");
            assert!(fragment.starts_with(r"__oh_cmd='echo '\''abc'; cd "));

            let fragment = encode_command(&marker, "/tmp", "echo (");
            assert!(fragment.starts_with("__oh_cmd='echo ('; cd "));
        }

        #[test]
        fn test_multiline_command_is_one_quoted_word() {
            let marker = Marker::new(DEFAULT_SENTINEL_PREFIX);
            let fragment = encode_command(&marker, "/tmp", "for i in 1 2; do\n  echo $i\ndone");
            assert!(fragment.starts_with("__oh_cmd='for i in 1 2; do\n  echo $i\ndone'; cd "));
            assert_eq!(fragment.matches('\n').count(), 3);
        }

        #[test]
        fn test_fragment_propagates_cd_failure() {
            let marker = Marker::new(DEFAULT_SENTINEL_PREFIX);
            let fragment = encode_command(&marker, "/tmp", "ls");
            assert!(fragment.contains("else __oh_rc=$__oh_cd_rc; fi;"));
        }

        #[test]
        fn test_fragment_prints_marker_on_both_streams() {
            let marker = Marker::new(DEFAULT_SENTINEL_PREFIX);
            let fragment = encode_command(&marker, "/tmp", "ls");
            let quoted = shell_quote(marker.tag());
            assert!(fragment.contains(&format!(
                "printf '%s %s %s\\n' {quoted} \"$__oh_rc\" \"$(pwd)\";"
            )));
            assert!(fragment.contains(&format!("printf '%s\\n' {quoted} >&2\n")));
        }

        #[test]
        fn test_fragment_ends_with_newline() {
            let marker = Marker::new(DEFAULT_SENTINEL_PREFIX);
            assert!(encode_command(&marker, "/", "ls").ends_with('\n'));
        }

        #[test]
        fn test_empty_command_becomes_true() {
            let marker = Marker::new(DEFAULT_SENTINEL_PREFIX);
            let fragment = encode_command(&marker, "/tmp", "");
            assert!(fragment.starts_with("__oh_cmd='true';"));
        }

        #[test]
        fn test_whitespace_command_becomes_true() {
            let marker = Marker::new(DEFAULT_SENTINEL_PREFIX);
            let fragment = encode_command(&marker, "/tmp", "  \n ");
            assert!(fragment.starts_with("__oh_cmd='true';"));
        }
    }

    mod decoding {
        use super::*;

        #[test]
        fn test_find_full_sentinel() {
            let line = format!("{DEFAULT_SENTINEL_PREFIX}0123456789abcdef0123456789abcdef 0 /tmp");
            let hit = decoder().find(&line).unwrap();
            assert_eq!(hit.leading, "");
            assert_eq!(hit.token, "0123456789abcdef0123456789abcdef");
            assert_eq!(hit.fields, "0 /tmp");
            assert!(hit.is_token_shaped());
        }

        #[test]
        fn test_find_keeps_leading_output() {
            let line = format!("hello{DEFAULT_SENTINEL_PREFIX}abc 0 /");
            let hit = decoder().find(&line).unwrap();
            assert_eq!(hit.leading, "hello");
            assert_eq!(hit.token, "abc");
            assert!(!hit.is_token_shaped());
        }

        #[test]
        fn test_bare_prefix_has_empty_token() {
            let hit = decoder().find(DEFAULT_SENTINEL_PREFIX).unwrap();
            assert_eq!(hit.token, "");
            assert_eq!(hit.fields, "");
            assert!(!hit.is_token_shaped());
        }

        #[test]
        fn test_line_without_prefix() {
            assert!(decoder().find("plain output").is_none());
        }

        #[test]
        fn test_decode_exit_and_cwd() {
            let sentinel = decoder().decode("2 /home/user").unwrap();
            assert_eq!(sentinel.exit_code, 2);
            assert_eq!(sentinel.cwd.as_deref(), Some("/home/user"));
        }

        #[test]
        fn test_decode_cwd_with_spaces() {
            let sentinel = decoder().decode("0 /tmp/my  dir/x y").unwrap();
            assert_eq!(sentinel.cwd.as_deref(), Some("/tmp/my  dir/x y"));
        }

        #[test]
        fn test_decode_negative_exit_code() {
            assert_eq!(decoder().decode("-1 /").unwrap().exit_code, -1);
        }

        #[test]
        fn test_decode_missing_cwd() {
            let sentinel = decoder().decode("127").unwrap();
            assert_eq!(sentinel.exit_code, 127);
            assert!(sentinel.cwd.is_none());
        }

        #[test]
        fn test_decode_strips_carriage_return() {
            let sentinel = decoder().decode("0 /tmp\r").unwrap();
            assert_eq!(sentinel.cwd.as_deref(), Some("/tmp"));
        }

        #[test]
        fn test_decode_rejects_non_numeric_exit() {
            let err = decoder().decode("zero /tmp").unwrap_err();
            assert!(matches!(err, ShellError::MalformedSentinel(_)));
        }

        #[test]
        fn test_decode_rejects_empty_fields() {
            assert!(decoder().decode("").is_err());
        }
    }
}
