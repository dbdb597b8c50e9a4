//! Exec result contract shared by both backends.
//!
//! Exit codes travel as text so callers can tell apart a numeric success,
//! the `-1` sentinel for invocation failures and timeouts, and the
//! `Error: Exit code N` wrapper for nonzero completions.

use regex::Regex;
use std::fmt::Display;
use std::future::Future;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::time::error::Elapsed;

/// Exit status `timeout(1)` reports when it kills the wrapped command
pub const TIMEOUT_EXIT_CODE: i64 = 124;

pub const SENTINEL: &str = "-1";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    pub output: String,
    pub exit_code: String,
}

impl CommandResult {
    pub fn new(output: impl Into<String>, exit_code: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            exit_code: exit_code.into(),
        }
    }

    pub fn timed_out(timeout: Duration) -> Self {
        Self::new(
            format!("Command timed out (>{}s)", timeout.as_secs()),
            SENTINEL,
        )
    }

    pub fn invocation_error(err: impl Display) -> Self {
        Self::new(format!("Error: {}", err), SENTINEL)
    }

    pub fn exit_code_not_found() -> Self {
        Self::new("Exit code not found", SENTINEL)
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == "0"
    }

    pub fn into_tuple(self) -> (String, String) {
        (self.output, self.exit_code)
    }
}

fn ansi_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\x1b\[[0-9;]*m|\r").expect("valid ANSI pattern"))
}

/// Drop ANSI color sequences and carriage returns.
pub fn strip_ansi(output: &str) -> String {
    ansi_pattern().replace_all(output, "").into_owned()
}

/// Map raw exec output and exit code onto the result contract.
pub fn interpret(output: &[u8], exit_code: Option<i64>, timeout: Duration) -> CommandResult {
    let text = String::from_utf8_lossy(output);
    match exit_code {
        None => CommandResult::exit_code_not_found(),
        Some(TIMEOUT_EXIT_CODE) => CommandResult::timed_out(timeout),
        Some(0) => CommandResult::new(strip_ansi(&text), "0"),
        Some(code) => CommandResult::new(text.into_owned(), format!("Error: Exit code {}", code)),
    }
}

/// Wait on `fut` for at most `timeout + grace`. On expiry the future is
/// dropped; the remote side is not signalled.
pub async fn bounded<F: Future>(
    timeout: Duration,
    grace: Duration,
    fut: F,
) -> Result<F::Output, Elapsed> {
    tokio::time::timeout(timeout.saturating_add(grace), fut).await
}
