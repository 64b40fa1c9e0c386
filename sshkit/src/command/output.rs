//! Result type for remote command execution.

use std::time::Duration;

/// Output of one remote command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// The command that was executed.
    pub command: String,

    /// Everything the command wrote to stdout.
    pub stdout: String,

    /// Everything the command wrote to stderr.
    pub stderr: String,

    /// Exit status, if the server reported one.
    pub exit_status: Option<u32>,

    /// Name of the signal that terminated the command, if any.
    pub exit_signal: Option<String>,

    /// Time from start to the end of the read.
    pub elapsed: Duration,
}

impl CommandOutput {
    /// Exit code, or `-1` when the command ended without reporting one.
    pub fn exit_code(&self) -> i32 {
        self.exit_status.map_or(-1, |status| status as i32)
    }

    /// Whether the command exited with status 0.
    pub fn is_success(&self) -> bool {
        self.exit_status == Some(0)
    }

    /// stdout without trailing newlines.
    pub fn stdout_trimmed(&self) -> &str {
        self.stdout.trim_end_matches('\n')
    }

    /// stderr without trailing newlines.
    pub fn stderr_trimmed(&self) -> &str {
        self.stderr.trim_end_matches('\n')
    }

    /// Get the stdout lines as an iterator.
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.stdout.lines()
    }

    /// `(stdout, stderr, exit code)`.
    pub fn into_tuple(self) -> (String, String, i32) {
        let code = self.exit_code();
        (self.stdout, self.stderr, code)
    }
}

impl std::fmt::Display for CommandOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.stdout)
    }
}
