//! One remote command on its own channel.
//!
//! Every command gets a fresh session channel, so commands never share a
//! working directory or environment with each other or with the shell.

use std::time::Duration;

use log::{debug, info, trace};
use secrecy::{ExposeSecret, SecretString};
use tokio::time::Instant;

use super::output::CommandOutput;
use crate::channel::TextDecoder;
use crate::config::{DecodeErrors, SessionConfig};
use crate::error::{ChannelError, CommandError, Error, Result};
use crate::transport::{ChannelEvent, EXTENDED_DATA_STDERR, SessionChannel, Transport};

/// How the command is run on the remote host.
#[derive(Debug, Clone, Default)]
pub enum ExecMode {
    /// Run through the user's shell.
    #[default]
    Plain,

    /// Wrap in `sudo`, optionally feeding the password on stdin.
    Sudo { password: Option<SecretString> },

    /// Treat the command as a subsystem name (no shell).
    Subsystem,
}

/// Options for [`CommandSession::start`].
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    pub mode: ExecMode,

    /// Request agent forwarding before running the command.
    pub forward_agent: bool,

    /// Fed to the command's stdin once it started, followed by EOF.
    pub input: Option<String>,
}

impl StartOptions {
    pub fn sudo(password: Option<SecretString>) -> Self {
        Self {
            mode: ExecMode::Sudo { password },
            ..Default::default()
        }
    }

    pub fn subsystem() -> Self {
        Self {
            mode: ExecMode::Subsystem,
            ..Default::default()
        }
    }

    pub fn with_forward_agent(mut self, forward_agent: bool) -> Self {
        self.forward_agent = forward_agent;
        self
    }

    pub fn with_input(mut self, input: impl Into<String>) -> Self {
        self.input = Some(input.into());
        self
    }
}

/// Options for [`CommandSession::read_outputs`].
#[derive(Debug, Clone, Default)]
pub struct ReadOptions {
    /// Give up after this long. `None` waits for the command to finish.
    pub timeout: Option<Duration>,

    /// Log output at `info` level as it arrives.
    pub stream_output: bool,

    /// Attach whatever was collected to the timeout error.
    pub output_if_timeout: bool,
}

impl ReadOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..Default::default()
        }
    }
}

/// A started remote command whose output has not been read yet.
pub struct CommandSession<C> {
    command: String,
    channel: C,
    started: Instant,
    encoding: String,
    decode_errors: DecodeErrors,
}

impl<C: SessionChannel> CommandSession<C> {
    /// Open a new channel and start `command` on it.
    pub async fn start<T>(
        transport: &T,
        command: &str,
        options: StartOptions,
        config: &SessionConfig,
    ) -> Result<Self>
    where
        T: Transport<Channel = C>,
    {
        let mut channel = transport.open_session().await?;

        if options.forward_agent {
            debug!("requesting agent forwarding for '{}'", command);
            channel.request_agent_forwarding().await?;
        }

        match &options.mode {
            ExecMode::Plain => {
                info!("Starting command '{}'", command);
                channel
                    .exec(command)
                    .await
                    .map_err(|e| rejected(e, "exec", command))?;
            }
            ExecMode::Sudo { password: None } => {
                info!("Starting command '{}' with sudo", command);
                channel
                    .exec(&format!("sudo {command}"))
                    .await
                    .map_err(|e| rejected(e, "exec", command))?;
            }
            ExecMode::Sudo {
                password: Some(password),
            } => {
                info!("Starting command '{}' with sudo and password", command);
                channel
                    .exec(&format!("sudo --stdin --prompt \"\" {command}"))
                    .await
                    .map_err(|e| rejected(e, "exec", command))?;
                let line = format!("{}\n", password.expose_secret());
                channel.send(line.as_bytes()).await?;
            }
            ExecMode::Subsystem => {
                info!("Invoking subsystem '{}'", command);
                channel
                    .request_subsystem(command)
                    .await
                    .map_err(|e| rejected(e, "subsystem", command))?;
            }
        }

        if let Some(input) = &options.input {
            debug!("sending {} bytes of input to '{}'", input.len(), command);
            channel.send(input.as_bytes()).await?;
            channel.send_eof().await?;
        }

        Ok(Self {
            command: command.to_string(),
            channel,
            started: Instant::now(),
            encoding: config.encoding.clone(),
            decode_errors: config.decode_errors,
        })
    }

    /// The command this session runs.
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Drain stdout and stderr until the command finishes, then close the
    /// channel and return the output.
    ///
    /// Both streams are read from the same event queue in arrival order,
    /// so neither can starve the other. On timeout the channel is left to
    /// the connection's close path.
    pub async fn read_outputs(mut self, options: &ReadOptions) -> Result<CommandOutput> {
        let deadline = options.timeout.map(|timeout| Instant::now() + timeout);
        let mut drain = Drain::default();

        while !drain.finished() {
            let event = match deadline {
                Some(deadline) => {
                    match tokio::time::timeout_at(deadline, self.channel.recv()).await {
                        Ok(event) => event,
                        Err(_) => return Err(self.timed_out(drain, options)),
                    }
                }
                None => self.channel.recv().await,
            };
            drain.apply(event, options.stream_output);
        }

        if let Err(e) = self.channel.close().await {
            debug!("closing channel for '{}': {}", self.command, e);
        }

        let output = CommandOutput {
            stdout: self.decode(&drain.stdout, self.decode_errors)?,
            stderr: self.decode(&drain.stderr, self.decode_errors)?,
            exit_status: drain.exit_status,
            exit_signal: drain.exit_signal,
            elapsed: self.started.elapsed(),
            command: self.command,
        };
        debug!(
            "command '{}' finished with {:?} in {:?}",
            output.command, output.exit_status, output.elapsed
        );
        Ok(output)
    }

    fn decode(&self, bytes: &[u8], errors: DecodeErrors) -> Result<String> {
        let mut decoder = TextDecoder::new(&self.encoding, errors)?;
        let mut text = String::with_capacity(bytes.len());
        decoder.push(bytes, &mut text)?;
        decoder.finish(&mut text)?;
        Ok(text)
    }

    fn timed_out(self, drain: Drain, options: &ReadOptions) -> Error {
        let timeout = options.timeout.unwrap_or_default();
        debug!("command '{}' timed out after {:?}", self.command, timeout);
        let partial = if options.output_if_timeout {
            // Partial output may end mid-character, so never fail on it
            let stdout = self.decode(&drain.stdout, DecodeErrors::Replace);
            let stderr = self.decode(&drain.stderr, DecodeErrors::Replace);
            match (stdout, stderr) {
                (Ok(stdout), Ok(stderr)) => Some(Box::new(CommandOutput {
                    command: self.command.clone(),
                    stdout,
                    stderr,
                    exit_status: drain.exit_status,
                    exit_signal: drain.exit_signal,
                    elapsed: self.started.elapsed(),
                })),
                (Err(e), _) | (_, Err(e)) => return e,
            }
        } else {
            None
        };
        CommandError::Timeout {
            command: self.command,
            timeout,
            partial,
        }
        .into()
    }
}

fn rejected(error: Error, request: &'static str, command: &str) -> Error {
    match error {
        Error::Channel(ChannelError::RequestFailed { .. }) => CommandError::Rejected {
            request,
            command: command.to_string(),
        }
        .into(),
        other => other,
    }
}

/// Accumulated state while draining a command channel.
#[derive(Default)]
struct Drain {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    exit_status: Option<u32>,
    exit_signal: Option<String>,
    eof: bool,
    closed: bool,
}

impl Drain {
    /// Closed, or at EOF with the exit reported.
    fn finished(&self) -> bool {
        self.closed || (self.eof && (self.exit_status.is_some() || self.exit_signal.is_some()))
    }

    fn apply(&mut self, event: Option<ChannelEvent>, stream: bool) {
        match event {
            Some(ChannelEvent::Data(data)) => {
                if stream {
                    info!("{}", String::from_utf8_lossy(&data).trim_end());
                }
                self.stdout.extend_from_slice(&data);
            }
            Some(ChannelEvent::ExtendedData { data, ext }) if ext == EXTENDED_DATA_STDERR => {
                if stream {
                    info!("{}", String::from_utf8_lossy(&data).trim_end());
                }
                self.stderr.extend_from_slice(&data);
            }
            Some(ChannelEvent::ExtendedData { ext, .. }) => {
                trace!("ignoring extended data of type {}", ext);
            }
            Some(ChannelEvent::Eof) => self.eof = true,
            Some(ChannelEvent::ExitStatus(status)) => self.exit_status = Some(status),
            Some(ChannelEvent::ExitSignal { signal, .. }) => self.exit_signal = Some(signal),
            Some(ChannelEvent::Close) | None => self.closed = true,
        }
    }
}
