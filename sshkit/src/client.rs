//! Connection facade tying the shell, command stack and tunnel together.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use log::{debug, info, warn};
use regex::Regex;
use secrecy::SecretString;

use crate::channel::{InteractiveShell, PatternReader};
use crate::command::{CommandOutput, CommandSession, ReadOptions, StartOptions};
use crate::config::{DecodeErrors, Newline, Prompt, SessionConfig, SessionConfigUpdate};
use crate::error::{ChannelError, CommandError, ConnectionError, Result, TunnelError};
use crate::forward::{ForwardTarget, LocalTunnel};
use crate::transport::{AuthMethod, HostKeyVerification, SshConfig, SshTransport, Transport};

/// One connection to a remote host.
///
/// Owns the interactive shell (opened on first use), a LIFO stack of
/// started commands and at most one local tunnel. After [`close`] every
/// operation fails with [`ConnectionError::NotOpen`].
///
/// [`close`]: Connection::close
pub struct Connection<T: Transport> {
    config: SessionConfig,
    transport: Option<T>,
    shell: Option<InteractiveShell<T::Channel>>,
    commands: Vec<CommandSession<T::Channel>>,
    tunnel: Option<LocalTunnel>,
}

impl<T: Transport> Connection<T> {
    /// Wrap an already authenticated transport.
    pub fn new(transport: T, config: SessionConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            transport: Some(transport),
            shell: None,
            commands: Vec::new(),
            tunnel: None,
        })
    }

    /// Whether the connection has not been closed and the transport is alive.
    pub fn is_open(&self) -> bool {
        self.transport.as_ref().is_some_and(|t| t.is_alive())
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Change configuration; an open shell picks up timeout, newline and
    /// decoding changes immediately.
    pub fn update_config(&mut self, update: SessionConfigUpdate) -> Result<()> {
        self.config.update(update)?;
        if let Some(shell) = self.shell.as_mut() {
            shell.reader_mut().apply_config(&self.config)?;
        }
        Ok(())
    }

    /// The banner the server sent before authentication.
    pub fn banner(&self) -> Result<Option<String>> {
        Ok(self.transport()?.banner())
    }

    fn transport(&self) -> Result<&T> {
        Ok(self.transport.as_ref().ok_or(ConnectionError::NotOpen)?)
    }

    /// Open the interactive shell now instead of on first use.
    pub async fn open_shell(&mut self) -> Result<()> {
        self.reader().await.map(|_| ())
    }

    /// Resize the shell's terminal, opening the shell if needed.
    pub async fn resize_shell(&mut self, width: u32, height: u32) -> Result<()> {
        self.open_shell().await?;
        self.config.update(SessionConfigUpdate {
            width: Some(width),
            height: Some(height),
            ..Default::default()
        })?;
        match self.shell.as_mut() {
            Some(shell) => shell.resize(width, height).await,
            None => Err(ConnectionError::NotOpen.into()),
        }
    }

    async fn reader(&mut self) -> Result<&mut PatternReader<T::Channel>> {
        let transport = self.transport.as_ref().ok_or(ConnectionError::NotOpen)?;
        if self.shell.is_none() {
            self.shell = Some(InteractiveShell::open(transport, &self.config).await?);
        }
        let shell = self.shell.as_mut().ok_or(ConnectionError::NotOpen)?;
        Ok(shell.reader_mut())
    }

    /// Write `text` plus the configured newline and consume the echoed line.
    pub async fn write(&mut self, text: &str) -> Result<String> {
        self.reader().await?.write_line(text).await
    }

    /// Write `text` exactly as given.
    pub async fn write_bare(&mut self, text: &str) -> Result<()> {
        self.reader().await?.write(text).await
    }

    /// Read whatever is available, optionally waiting for output to settle.
    pub async fn read(&mut self, delay: Option<Duration>) -> Result<String> {
        self.reader().await?.read(delay).await
    }

    pub async fn read_char(&mut self) -> Result<char> {
        self.reader().await?.read_char().await
    }

    /// Read up to and including `expected`.
    pub async fn read_until(&mut self, expected: &str) -> Result<String> {
        self.reader().await?.read_until_text(expected).await
    }

    /// Read up to and including the first match of `pattern`.
    pub async fn read_until_regexp(&mut self, pattern: &str) -> Result<String> {
        let regex = Regex::new(pattern).map_err(ChannelError::from)?;
        self.reader().await?.read_until_regex(&regex).await
    }

    /// Read up to and including the configured prompt.
    pub async fn read_until_prompt(&mut self) -> Result<String> {
        let prompt = self
            .config
            .prompt
            .clone()
            .ok_or(ConnectionError::PromptNotSet)?;
        let timeout = self.config.timeout;
        self.reader().await?.read_until(&prompt, timeout).await
    }

    /// Read until `pattern` matches `prefix` followed by the output.
    ///
    /// The prefix takes part in matching only and is never returned.
    pub async fn read_until_regexp_with_prefix(
        &mut self,
        pattern: &str,
        prefix: &str,
    ) -> Result<String> {
        let regex = Regex::new(pattern).map_err(ChannelError::from)?;
        self.reader()
            .await?
            .read_until_regex_with_prefix(&regex, prefix)
            .await
    }

    /// Keep writing `text` every `interval` until `expected` appears.
    pub async fn write_until_expected_output(
        &mut self,
        text: &str,
        expected: &str,
        timeout: Duration,
        interval: Duration,
    ) -> Result<String> {
        self.reader()
            .await?
            .write_until_expected(text, expected, timeout, interval)
            .await
    }

    /// Start `command` on a new channel and push it on the command stack.
    pub async fn start_command(&mut self, command: &str, options: StartOptions) -> Result<()> {
        let session = CommandSession::start(self.transport()?, command, options, &self.config).await?;
        self.commands.push(session);
        Ok(())
    }

    /// Read the output of the most recently started command.
    pub async fn read_command_output(&mut self, options: &ReadOptions) -> Result<CommandOutput> {
        self.transport()?;
        let session = self.commands.pop().ok_or(CommandError::NoStartedCommand)?;
        session.read_outputs(options).await
    }

    /// Number of started commands whose output has not been read.
    pub fn pending_commands(&self) -> usize {
        self.commands.len()
    }

    /// Start `command` and wait for its output.
    ///
    /// Does not touch the command stack.
    pub async fn execute_command(
        &mut self,
        command: &str,
        start: StartOptions,
        read: &ReadOptions,
    ) -> Result<CommandOutput> {
        let session = CommandSession::start(self.transport()?, command, start, &self.config).await?;
        session.read_outputs(read).await
    }

    /// Forward `local_port` to `remote_host:remote_port` through this
    /// connection. Returns the bound local address.
    pub async fn create_local_tunnel(
        &mut self,
        local_port: u16,
        remote_host: &str,
        remote_port: u16,
        bind_address: Option<&str>,
    ) -> Result<SocketAddr> {
        let transport = self.transport()?.clone();
        if let Some(tunnel) = &self.tunnel {
            return Err(TunnelError::AlreadyActive {
                local_addr: tunnel.local_addr(),
            }
            .into());
        }

        let tunnel = LocalTunnel::start(
            transport,
            local_port,
            ForwardTarget::new(remote_host, remote_port),
            bind_address,
            self.config.tunnel_chunk_size,
        )
        .await?;
        let local_addr = tunnel.local_addr();
        self.tunnel = Some(tunnel);
        Ok(local_addr)
    }

    pub fn tunnel(&self) -> Option<&LocalTunnel> {
        self.tunnel.as_ref()
    }

    /// Stop the tunnel if one is running.
    pub async fn close_tunnel(&mut self) {
        if let Some(tunnel) = self.tunnel.take() {
            tunnel.close().await;
        }
    }

    /// Close the shell, stop the tunnel, drop unread commands and
    /// disconnect. Closing twice is a no-op.
    pub async fn close(&mut self) -> Result<()> {
        let Some(transport) = self.transport.take() else {
            return Ok(());
        };

        if let Some(shell) = self.shell.take() {
            if let Err(e) = shell.close().await {
                debug!("closing shell: {}", e);
            }
        }
        self.close_tunnel().await;
        if !self.commands.is_empty() {
            warn!("Dropping {} unread command(s)", self.commands.len());
            self.commands.clear();
        }

        transport.disconnect().await?;
        info!("Closed connection to {}:{}", self.config.host, self.config.port);
        Ok(())
    }
}

/// Builder for SSH-backed [`Connection`]s.
///
/// # Example
///
/// ```rust,no_run
/// use sshkit::ConnectionBuilder;
///
/// # async fn example() -> Result<(), sshkit::Error> {
/// let mut conn = ConnectionBuilder::new("192.168.1.1")
///     .username("admin")
///     .password("secret")
///     .open()
///     .await?;
/// let output = conn.write("uname -a").await?;
/// # Ok(())
/// # }
/// ```
pub struct ConnectionBuilder {
    host: String,
    port: u16,
    username: Option<String>,
    auth: AuthMethod,
    connect_timeout: Duration,
    keepalive_interval: Option<Duration>,
    host_key_verification: HostKeyVerification,
    known_hosts_path: Option<PathBuf>,
    session: SessionConfig,
}

impl ConnectionBuilder {
    /// Create a new builder for the specified host.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: 22,
            username: None,
            auth: AuthMethod::None,
            connect_timeout: Duration::from_secs(45),
            keepalive_interval: None,
            host_key_verification: HostKeyVerification::default(),
            known_hosts_path: None,
            session: SessionConfig::default(),
        }
    }

    /// Set the SSH port (default: 22).
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the username for authentication.
    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    /// Set password authentication.
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.auth = AuthMethod::Password(SecretString::from(password.into()));
        self
    }

    /// Set private key authentication.
    pub fn private_key(mut self, key_path: impl Into<PathBuf>) -> Self {
        self.auth = AuthMethod::PrivateKey {
            path: key_path.into(),
            passphrase: None,
        };
        self
    }

    /// Set private key authentication with passphrase.
    pub fn private_key_with_passphrase(
        mut self,
        key_path: impl Into<PathBuf>,
        passphrase: impl Into<String>,
    ) -> Self {
        self.auth = AuthMethod::PrivateKey {
            path: key_path.into(),
            passphrase: Some(SecretString::from(passphrase.into())),
        };
        self
    }

    /// Set the TCP connect and handshake timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = Some(interval);
        self
    }

    /// Set host key verification mode.
    pub fn host_key_verification(mut self, mode: HostKeyVerification) -> Self {
        self.host_key_verification = mode;
        self
    }

    /// Use a custom known_hosts file.
    pub fn known_hosts_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.known_hosts_path = Some(path.into());
        self
    }

    /// Set the default read timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.session.timeout = timeout;
        self
    }

    /// Set the newline sent by `write`.
    pub fn newline(mut self, newline: Newline) -> Self {
        self.session.newline = newline;
        self
    }

    /// Set the prompt used by `read_until_prompt`.
    pub fn prompt(mut self, prompt: Prompt) -> Self {
        self.session.prompt = Some(prompt);
        self
    }

    /// Set the terminal type and dimensions of the shell.
    pub fn terminal(mut self, term_type: impl Into<String>, width: u32, height: u32) -> Self {
        self.session.term_type = term_type.into();
        self.session.width = width;
        self.session.height = height;
        self
    }

    /// Set the remote encoding and decode-error policy.
    pub fn encoding(mut self, label: impl Into<String>, errors: DecodeErrors) -> Self {
        self.session.encoding = label.into();
        self.session.decode_errors = errors;
        self
    }

    /// Replace the session configuration wholesale. Host and port still
    /// come from the builder.
    pub fn session_config(mut self, config: SessionConfig) -> Self {
        self.session = config;
        self
    }

    fn into_configs(self) -> Result<(SshConfig, SessionConfig)> {
        let username = self.username.ok_or_else(|| ConnectionError::InvalidConfig {
            message: "Username is required".to_string(),
        })?;

        let mut session = self.session;
        session.host = self.host.clone();
        session.port = self.port;
        session.validate()?;

        let ssh = SshConfig {
            auth: self.auth,
            connect_timeout: self.connect_timeout,
            keepalive_interval: self.keepalive_interval,
            host_key_verification: self.host_key_verification,
            known_hosts_path: self.known_hosts_path,
            ..SshConfig::new(self.host, self.port, username)
        };
        Ok((ssh, session))
    }

    /// Connect, authenticate and return the connection.
    pub async fn open(self) -> Result<Connection<SshTransport>> {
        let (ssh, session) = self.into_configs()?;
        let transport = SshTransport::connect(&ssh).await?;
        Connection::new(transport, session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use crate::testing::MockTransport;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    fn connection() -> (Connection<MockTransport>, MockTransport) {
        let _ = env_logger::builder().is_test(true).try_init();
        let transport = MockTransport::new();
        let conn = Connection::new(transport.clone(), SessionConfig::new("host", 22)).unwrap();
        (conn, transport)
    }

    #[tokio::test]
    async fn test_commands_read_in_lifo_order() {
        let (mut conn, _) = connection();
        conn.start_command("echo A", StartOptions::default()).await.unwrap();
        conn.start_command("echo B", StartOptions::default()).await.unwrap();
        assert_eq!(conn.pending_commands(), 2);

        let read = ReadOptions::default();
        assert_eq!(conn.read_command_output(&read).await.unwrap().stdout, "B\n");
        assert_eq!(conn.read_command_output(&read).await.unwrap().stdout, "A\n");

        let err = conn.read_command_output(&read).await.unwrap_err();
        assert!(matches!(err, Error::Command(CommandError::NoStartedCommand)));
    }

    #[tokio::test]
    async fn test_execute_command_exit_status() {
        let (mut conn, _) = connection();
        let output = conn
            .execute_command("exit 7", StartOptions::default(), &ReadOptions::default())
            .await
            .unwrap();
        assert_eq!(output.into_tuple(), (String::new(), String::new(), 7));
        assert_eq!(conn.pending_commands(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_command_timeout_is_not_fatal() {
        let (mut conn, _) = connection();
        conn.start_command("sleep 5", StartOptions::default()).await.unwrap();
        let err = conn
            .read_command_output(&ReadOptions::with_timeout(Duration::from_millis(10)))
            .await
            .unwrap_err();
        assert!(err.is_command_timeout());

        let output = conn
            .execute_command("echo ok", StartOptions::default(), &ReadOptions::default())
            .await
            .unwrap();
        assert_eq!(output.stdout_trimmed(), "ok");
    }

    #[tokio::test]
    async fn test_write_consumes_echo_then_read_until() {
        let (mut conn, transport) = connection();
        assert_eq!(conn.write("ls").await.unwrap(), "ls\n");

        let shell = transport.channels()[0].clone();
        assert_eq!(shell.requests(), vec!["pty:vt100:80x24", "shell"]);
        shell.data("file1\nfile2\n$ ");

        assert_eq!(conn.read_until("file1\n").await.unwrap(), "file1\n");
        assert_eq!(conn.read_until("$ ").await.unwrap(), "file2\n$ ");
        assert_eq!(conn.read(None).await.unwrap(), "");
    }

    #[tokio::test]
    async fn test_regexp_reads() {
        let (mut conn, transport) = connection();
        conn.open_shell().await.unwrap();
        let shell = transport.channels()[0].clone();

        shell.data("load 0.42\nuser@box:~$ ");
        assert_eq!(
            conn.read_until_regexp(r"\d+\.\d+").await.unwrap(),
            "load 0.42"
        );
        assert_eq!(
            conn.read_until_regexp_with_prefix(r"0\.42\nuser", "0.42")
                .await
                .unwrap(),
            "\nuser"
        );
        assert_eq!(conn.read(None).await.unwrap(), "@box:~$ ");

        assert!(matches!(
            conn.read_until_regexp("(").await.unwrap_err(),
            Error::Channel(ChannelError::InvalidPattern(_))
        ));
    }

    #[tokio::test]
    async fn test_read_until_prompt_requires_prompt() {
        let (mut conn, transport) = connection();
        let err = conn.read_until_prompt().await.unwrap_err();
        assert!(matches!(err, Error::Connection(ConnectionError::PromptNotSet)));

        conn.update_config(SessionConfigUpdate {
            prompt: Some(Prompt::parse(r"REGEXP:[#$] $").unwrap()),
            ..Default::default()
        })
        .unwrap();

        conn.open_shell().await.unwrap();
        transport.channels()[0].data("motd\nroot@box:~# ");
        assert_eq!(conn.read_until_prompt().await.unwrap(), "motd\nroot@box:~# ");
    }

    #[tokio::test]
    async fn test_resize_shell_updates_config() {
        let (mut conn, transport) = connection();
        conn.resize_shell(132, 43).await.unwrap();
        assert_eq!((conn.config().width, conn.config().height), (132, 43));
        assert!(
            transport.channels()[0]
                .requests()
                .contains(&"resize:132x43".to_string())
        );
    }

    #[tokio::test]
    async fn test_banner() {
        let (conn, _) = connection();
        assert_eq!(conn.banner().unwrap().as_deref(), Some("Authorized use only\n"));
    }

    #[tokio::test]
    async fn test_closed_connection_fails_fast() {
        let (mut conn, transport) = connection();
        conn.open_shell().await.unwrap();
        conn.start_command("echo left", StartOptions::default()).await.unwrap();

        conn.close().await.unwrap();
        assert!(transport.is_disconnected());
        assert!(transport.channels()[0].is_closed());
        assert!(!conn.is_open());
        assert_eq!(conn.pending_commands(), 0);

        for err in [
            conn.write("ls").await.unwrap_err(),
            conn.read(None).await.unwrap_err(),
            conn.start_command("echo", StartOptions::default()).await.unwrap_err(),
            conn.read_command_output(&ReadOptions::default()).await.unwrap_err(),
            conn.banner().unwrap_err(),
        ] {
            assert!(matches!(err, Error::Connection(ConnectionError::NotOpen)));
        }

        // Second close is a no-op
        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_tunnel_lifecycle() {
        let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target_port = target.local_addr().unwrap().port();
        let (mut conn, _) = connection();

        let addr = conn
            .create_local_tunnel(0, "127.0.0.1", target_port, Some("127.0.0.1"))
            .await
            .unwrap();
        assert_eq!(conn.tunnel().map(|t| t.local_addr()), Some(addr));

        let err = conn
            .create_local_tunnel(0, "127.0.0.1", target_port, Some("127.0.0.1"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Tunnel(TunnelError::AlreadyActive { .. })));

        let mut client = TcpStream::connect(addr).await.unwrap();
        let (mut remote, _) = target.accept().await.unwrap();
        client.write_all(&[0, 159, 146, 150, 255]).await.unwrap();
        let mut got = [0u8; 5];
        remote.read_exact(&mut got).await.unwrap();
        assert_eq!(got, [0, 159, 146, 150, 255]);

        // Closing the local side ends the stream on the remote side
        drop(client);
        let mut rest = Vec::new();
        assert_eq!(remote.read_to_end(&mut rest).await.unwrap(), 0);

        conn.close().await.unwrap();
        assert!(conn.tunnel().is_none());
        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[test]
    fn test_builder_requires_username() {
        let err = ConnectionBuilder::new("10.0.0.1").into_configs().err().unwrap();
        assert!(matches!(
            err,
            Error::Connection(ConnectionError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn test_builder_splits_configs() {
        let (ssh, session) = ConnectionBuilder::new("10.0.0.1")
            .port(2222)
            .username("admin")
            .password("secret")
            .terminal("xterm", 200, 50)
            .timeout(Duration::from_secs(10))
            .into_configs()
            .unwrap();
        assert_eq!(ssh.socket_addr(), "10.0.0.1:2222");
        assert!(matches!(ssh.auth, AuthMethod::Password(_)));
        assert_eq!(session.host, "10.0.0.1");
        assert_eq!(session.port, 2222);
        assert_eq!(session.term_type, "xterm");
        assert_eq!(session.timeout, Duration::from_secs(10));
    }
}
