//! Error types for sshkit.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

use crate::command::CommandOutput;

/// Main error type for sshkit operations.
#[derive(Error, Debug)]
pub enum Error {
    /// SSH transport-level errors
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Channel and interactive read errors
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    /// Remote command errors
    #[error("Command error: {0}")]
    Command(#[from] CommandError),

    /// Port forwarding errors
    #[error("Tunnel error: {0}")]
    Tunnel(#[from] TunnelError),

    /// Connection state and configuration errors
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),
}

impl Error {
    /// Whether this error is a pattern read that ran out of time.
    pub fn is_no_match(&self) -> bool {
        matches!(self, Error::Channel(ChannelError::NoMatchFound { .. }))
    }

    /// Whether this error is a remote command that ran out of time.
    pub fn is_command_timeout(&self) -> bool {
        matches!(self, Error::Command(CommandError::Timeout { .. }))
    }
}

/// Transport layer errors (SSH connection, authentication).
#[derive(Error, Debug)]
pub enum TransportError {
    /// Failed to connect to host
    #[error("Connection failed to {host}:{port}: {source}")]
    ConnectionFailed {
        host: String,
        port: u16,
        #[source]
        source: io::Error,
    },

    /// SSH handshake or protocol error
    #[error("SSH error: {0}")]
    Ssh(#[from] russh::Error),

    /// Authentication failed
    #[error("Authentication failed for user '{user}'")]
    AuthenticationFailed { user: String },

    /// SSH key error
    #[error("SSH key error: {0}")]
    Key(String),

    /// Host key not present in known_hosts (strict mode)
    #[error("Host key for {host}:{port} is unknown")]
    HostKeyUnknown { host: String, port: u16 },

    /// Host key differs from the one recorded in known_hosts
    #[error("Host key for {host}:{port} changed (known_hosts line {line})")]
    HostKeyChanged { host: String, port: u16, line: usize },

    /// known_hosts could not be read or written
    #[error("known_hosts error: {0}")]
    KnownHosts(String),

    /// Connection was closed unexpectedly
    #[error("Connection disconnected")]
    Disconnected,

    /// Operation timed out
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Channel layer errors (pattern matching, PTY operations, decoding).
#[derive(Error, Debug)]
pub enum ChannelError {
    /// The server refused to open a channel
    #[error("Failed to open channel: {0}")]
    OpenFailed(String),

    /// A pty, shell or window-change request failed
    #[error("Channel request '{request}' failed")]
    RequestFailed { request: &'static str },

    /// Pattern not found before the deadline
    #[error("No match found for '{expected}' in {timeout:?}\nOutput:\n{output}")]
    NoMatchFound {
        expected: String,
        timeout: Duration,
        output: String,
    },

    /// Genuinely malformed input for the configured encoding
    #[error("Received bytes that are not valid {encoding}")]
    Decode { encoding: &'static str },

    /// Channel closed unexpectedly
    #[error("Channel closed")]
    Closed,

    /// SSH protocol error on the channel
    #[error("Channel SSH error: {0}")]
    Ssh(russh::Error),

    /// Invalid regex pattern
    #[error("Invalid regex pattern: {0}")]
    InvalidPattern(#[from] regex::Error),
}

/// Remote command errors.
#[derive(Error, Debug)]
pub enum CommandError {
    /// Read attempted with an empty started-command stack
    #[error("No started commands to read output from")]
    NoStartedCommand,

    /// The command did not finish within its deadline
    #[error("Command '{command}' timed out in {timeout:?}{}", partial_suffix(.partial))]
    Timeout {
        command: String,
        timeout: Duration,
        /// Output collected before the deadline, when requested.
        partial: Option<Box<CommandOutput>>,
    },

    /// The server rejected the exec or subsystem request
    #[error("Server rejected {request} request for '{command}'")]
    Rejected {
        request: &'static str,
        command: String,
    },
}

fn partial_suffix(partial: &Option<Box<CommandOutput>>) -> String {
    match partial {
        Some(output) => format!("\nstdout:\n{}\nstderr:\n{}", output.stdout, output.stderr),
        None => String::new(),
    }
}

/// Local port forwarding errors.
#[derive(Error, Debug)]
pub enum TunnelError {
    /// A tunnel is already running on this connection
    #[error("A local tunnel is already active on {local_addr}")]
    AlreadyActive { local_addr: SocketAddr },

    /// The local listener could not be bound
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// The transport refused to open a direct-tcpip channel
    #[error("Failed to open channel to {host}:{port}: {reason}")]
    ChannelOpenFailure {
        host: String,
        port: u16,
        reason: String,
    },
}

/// Connection state and configuration errors.
#[derive(Error, Debug)]
pub enum ConnectionError {
    /// No transport available
    #[error("Connection not open - call open() first")]
    NotOpen,

    /// read_until_prompt called without a configured prompt
    #[error("Prompt is not set")]
    PromptNotSet,

    /// Invalid configuration value
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },
}

/// Result type alias using sshkit's Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_match_message_contains_expected() {
        let err: Error = ChannelError::NoMatchFound {
            expected: "$ ".to_string(),
            timeout: Duration::from_secs(3),
            output: "partial".to_string(),
        }
        .into();
        let msg = err.to_string();
        assert!(msg.contains("'$ '"));
        assert!(msg.contains("3s"));
        assert!(msg.contains("partial"));
        assert!(err.is_no_match());
    }

    #[test]
    fn test_timeout_message_with_partial_output() {
        let partial = CommandOutput {
            command: "sleep 5".to_string(),
            stdout: "so far".to_string(),
            stderr: String::new(),
            exit_status: None,
            exit_signal: None,
            elapsed: Duration::from_millis(10),
        };
        let err: Error = CommandError::Timeout {
            command: "sleep 5".to_string(),
            timeout: Duration::from_millis(10),
            partial: Some(Box::new(partial)),
        }
        .into();
        assert!(err.is_command_timeout());
        assert!(err.to_string().contains("so far"));
    }
}
