//! SSH transport implementation using russh.

use std::collections::VecDeque;
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use log::{debug, info, warn};
use russh::client::{self, Handle, Msg, Session};
use russh::keys::{PrivateKeyWithHashAlg, PublicKey, load_secret_key};
use russh::{Channel, ChannelMsg, ChannelReadHalf, ChannelStream, ChannelWriteHalf};
use secrecy::ExposeSecret;
use tokio::sync::mpsc::{UnboundedReceiver, unbounded_channel};
use tokio::task::JoinHandle;

use super::config::{AuthMethod, HostKeyVerification, SshConfig};
use super::{ChannelEvent, SessionChannel, Transport};
use crate::error::{ChannelError, Result, TransportError, TunnelError};

/// SSH transport wrapping a russh client session.
///
/// Cloning is cheap; all clones drive the same session.
#[derive(Clone)]
pub struct SshTransport {
    /// The russh session handle.
    session: Arc<Handle<SshHandler>>,

    /// Banner captured during authentication.
    banner: Arc<Mutex<Option<String>>>,
}

impl SshTransport {
    /// Connect to the SSH server and authenticate.
    pub async fn connect(config: &SshConfig) -> Result<Self> {
        let ssh_config = Arc::new(client::Config {
            inactivity_timeout: config.inactivity_timeout,
            keepalive_interval: config.keepalive_interval,
            ..Default::default()
        });

        let host_key_error: Arc<Mutex<Option<TransportError>>> = Arc::new(Mutex::new(None));
        let banner = Arc::new(Mutex::new(None));

        let handler = SshHandler {
            host: config.host.clone(),
            port: config.port,
            host_key_verification: config.host_key_verification.clone(),
            known_hosts_path: config.known_hosts_path.clone(),
            host_key_error: host_key_error.clone(),
            banner: banner.clone(),
        };

        debug!("connecting to {}", config.socket_addr());

        let mut session = tokio::time::timeout(
            config.connect_timeout,
            client::connect(ssh_config, (config.host.as_str(), config.port), handler),
        )
        .await
        .map_err(|_| TransportError::Timeout(config.connect_timeout))?
        .map_err(|e| {
            // Surface the detailed host key error instead of russh's generic one
            match host_key_error.lock().ok().and_then(|mut slot| slot.take()) {
                Some(hk_err) => hk_err,
                None => TransportError::Ssh(e),
            }
        })?;

        Self::authenticate(&mut session, config).await?;

        info!("connected to {} as '{}'", config.socket_addr(), config.username);

        Ok(Self {
            session: Arc::new(session),
            banner,
        })
    }

    /// Authenticate with the server.
    async fn authenticate(session: &mut Handle<SshHandler>, config: &SshConfig) -> Result<()> {
        let success = match &config.auth {
            AuthMethod::None => session
                .authenticate_none(&config.username)
                .await
                .map_err(TransportError::Ssh)?
                .success(),
            AuthMethod::Password(password) => session
                .authenticate_password(&config.username, password.expose_secret())
                .await
                .map_err(TransportError::Ssh)?
                .success(),
            AuthMethod::PrivateKey { path, passphrase } => {
                let key = load_secret_key(path, passphrase.as_ref().map(|p| p.expose_secret()))
                    .map_err(|e| TransportError::Key(e.to_string()))?;

                // Get the best RSA hash algorithm supported by the server
                let hash_alg = session
                    .best_supported_rsa_hash()
                    .await
                    .map_err(TransportError::Ssh)?
                    .flatten();

                session
                    .authenticate_publickey(
                        &config.username,
                        PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg),
                    )
                    .await
                    .map_err(TransportError::Ssh)?
                    .success()
            }
        };

        if !success {
            return Err(TransportError::AuthenticationFailed {
                user: config.username.clone(),
            }
            .into());
        }

        Ok(())
    }
}

impl Transport for SshTransport {
    type Channel = SshChannel;
    type Stream = ChannelStream<Msg>;

    async fn open_session(&self) -> Result<SshChannel> {
        if self.session.is_closed() {
            return Err(TransportError::Disconnected.into());
        }
        let channel = self
            .session
            .channel_open_session()
            .await
            .map_err(|e| ChannelError::OpenFailed(e.to_string()))?;
        Ok(SshChannel::new(channel))
    }

    async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u16,
        origin: SocketAddr,
    ) -> Result<ChannelStream<Msg>> {
        let channel = self
            .session
            .channel_open_direct_tcpip(
                host,
                u32::from(port),
                origin.ip().to_string(),
                u32::from(origin.port()),
            )
            .await
            .map_err(|e| TunnelError::ChannelOpenFailure {
                host: host.to_string(),
                port,
                reason: e.to_string(),
            })?;
        Ok(channel.into_stream())
    }

    fn banner(&self) -> Option<String> {
        self.banner.lock().ok().and_then(|b| b.clone())
    }

    fn is_alive(&self) -> bool {
        !self.session.is_closed()
    }

    async fn disconnect(&self) -> Result<()> {
        self.session
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await
            .map_err(TransportError::Ssh)?;
        Ok(())
    }
}

/// Something that yields messages until it is exhausted.
trait MessageSource: Send + 'static {
    type Message: Send + 'static;

    fn next(&mut self) -> impl Future<Output = Option<Self::Message>> + Send;
}

impl MessageSource for ChannelReadHalf {
    type Message = ChannelMsg;

    async fn next(&mut self) -> Option<ChannelMsg> {
        self.wait().await
    }
}

/// Move every message from `source` into an unbounded queue.
///
/// russh hands channel messages over through a bounded queue per channel
/// and waits while it is full, so one channel nobody reads (an unread
/// command, an idle shell) would stall delivery to every other channel
/// of the connection.
fn spawn_drain<S: MessageSource>(mut source: S) -> (UnboundedReceiver<S::Message>, JoinHandle<()>) {
    let (tx, rx) = unbounded_channel();
    let task = tokio::spawn(async move {
        while let Some(message) = source.next().await {
            if tx.send(message).is_err() {
                break;
            }
        }
    });
    (rx, task)
}

/// A russh session channel adapted to [`SessionChannel`].
pub struct SshChannel {
    writer: ChannelWriteHalf<Msg>,

    /// Messages drained from the read half.
    messages: UnboundedReceiver<ChannelMsg>,
    drain: JoinHandle<()>,

    /// Events that arrived while waiting for a request reply.
    pending: VecDeque<ChannelEvent>,
}

impl SshChannel {
    fn new(inner: Channel<Msg>) -> Self {
        let (reader, writer) = inner.split();
        let (messages, drain) = spawn_drain(reader);
        Self {
            writer,
            messages,
            drain,
            pending: VecDeque::new(),
        }
    }

    /// Wait for the server's reply to a `want_reply` request.
    ///
    /// Data that shows up first is queued for [`SessionChannel::recv`].
    async fn await_reply(&mut self, request: &'static str) -> Result<()> {
        loop {
            match self.messages.recv().await {
                Some(ChannelMsg::Success) => return Ok(()),
                Some(ChannelMsg::Failure) => {
                    return Err(ChannelError::RequestFailed { request }.into());
                }
                Some(msg) => {
                    if let Some(event) = convert(msg) {
                        self.pending.push_back(event);
                    }
                }
                None => return Err(ChannelError::Closed.into()),
            }
        }
    }
}

/// Map a russh channel message to a channel event, dropping bookkeeping.
fn convert(msg: ChannelMsg) -> Option<ChannelEvent> {
    match msg {
        ChannelMsg::Data { data } => Some(ChannelEvent::Data(Bytes::copy_from_slice(&data))),
        ChannelMsg::ExtendedData { data, ext } => Some(ChannelEvent::ExtendedData {
            data: Bytes::copy_from_slice(&data),
            ext,
        }),
        ChannelMsg::Eof => Some(ChannelEvent::Eof),
        ChannelMsg::Close => Some(ChannelEvent::Close),
        ChannelMsg::ExitStatus { exit_status } => Some(ChannelEvent::ExitStatus(exit_status)),
        ChannelMsg::ExitSignal {
            signal_name,
            core_dumped,
            error_message,
            ..
        } => Some(ChannelEvent::ExitSignal {
            signal: format!("{signal_name:?}"),
            core_dumped,
            message: error_message,
        }),
        _ => None,
    }
}

fn ssh_err(e: russh::Error) -> crate::Error {
    ChannelError::Ssh(e).into()
}

impl SessionChannel for SshChannel {
    async fn request_pty(&mut self, term_type: &str, width: u32, height: u32) -> Result<()> {
        self.writer
            .request_pty(true, term_type, width, height, 0, 0, &[])
            .await
            .map_err(ssh_err)?;
        self.await_reply("pty-req").await
    }

    async fn resize_pty(&mut self, width: u32, height: u32) -> Result<()> {
        self.writer
            .window_change(width, height, 0, 0)
            .await
            .map_err(ssh_err)
    }

    async fn request_shell(&mut self) -> Result<()> {
        self.writer.request_shell(true).await.map_err(ssh_err)?;
        self.await_reply("shell").await
    }

    async fn exec(&mut self, command: &str) -> Result<()> {
        self.writer.exec(true, command).await.map_err(ssh_err)?;
        self.await_reply("exec").await
    }

    async fn request_subsystem(&mut self, name: &str) -> Result<()> {
        self.writer
            .request_subsystem(true, name)
            .await
            .map_err(ssh_err)?;
        self.await_reply("subsystem").await
    }

    async fn request_agent_forwarding(&mut self) -> Result<()> {
        self.writer.agent_forward(false).await.map_err(ssh_err)
    }

    async fn send(&mut self, data: &[u8]) -> Result<()> {
        self.writer.data(data).await.map_err(ssh_err)
    }

    async fn send_eof(&mut self) -> Result<()> {
        self.writer.eof().await.map_err(ssh_err)
    }

    async fn recv(&mut self) -> Option<ChannelEvent> {
        if let Some(event) = self.pending.pop_front() {
            return Some(event);
        }
        loop {
            let msg = self.messages.recv().await?;
            if let Some(event) = convert(msg) {
                return Some(event);
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.writer.close().await.map_err(ssh_err)
    }
}

impl Drop for SshChannel {
    fn drop(&mut self) {
        self.drain.abort();
    }
}

/// SSH client handler for russh.
struct SshHandler {
    host: String,
    port: u16,
    host_key_verification: HostKeyVerification,
    known_hosts_path: Option<PathBuf>,
    /// Stores a detailed host-key error so connect() can surface it
    /// instead of the generic russh::Error::UnknownKey.
    host_key_error: Arc<Mutex<Option<TransportError>>>,
    banner: Arc<Mutex<Option<String>>>,
}

impl SshHandler {
    /// Check the host key against known_hosts.
    ///
    /// Returns `Ok(true)` if matched, `Ok(false)` if host not found,
    /// `Err(TransportError::HostKeyChanged)` if key changed.
    fn check_known_hosts(&self, pubkey: &PublicKey) -> std::result::Result<bool, TransportError> {
        let result = if let Some(ref path) = self.known_hosts_path {
            russh::keys::check_known_hosts_path(&self.host, self.port, pubkey, path)
        } else {
            russh::keys::check_known_hosts(&self.host, self.port, pubkey)
        };

        match result {
            Ok(matched) => Ok(matched),
            Err(russh::keys::Error::KeyChanged { line }) => Err(TransportError::HostKeyChanged {
                host: self.host.clone(),
                port: self.port,
                line,
            }),
            Err(e) => Err(TransportError::KnownHosts(e.to_string())),
        }
    }

    /// Save a new host key to known_hosts.
    fn learn_host_key(&self, pubkey: &PublicKey) -> std::result::Result<(), TransportError> {
        let result = if let Some(ref path) = self.known_hosts_path {
            russh::keys::known_hosts::learn_known_hosts_path(&self.host, self.port, pubkey, path)
        } else {
            russh::keys::known_hosts::learn_known_hosts(&self.host, self.port, pubkey)
        };

        result.map_err(|e| TransportError::KnownHosts(e.to_string()))
    }

    fn reject(&self, error: TransportError) -> bool {
        if let Ok(mut slot) = self.host_key_error.lock() {
            *slot = Some(error);
        }
        false
    }
}

impl client::Handler for SshHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        match self.host_key_verification {
            HostKeyVerification::Disabled => Ok(true),

            HostKeyVerification::AcceptNew => match self.check_known_hosts(server_public_key) {
                Ok(true) => Ok(true),
                Ok(false) => {
                    if let Err(e) = self.learn_host_key(server_public_key) {
                        warn!("Failed to save host key: {}", e);
                    }
                    Ok(true)
                }
                Err(e) => Ok(self.reject(e)),
            },

            HostKeyVerification::Strict => match self.check_known_hosts(server_public_key) {
                Ok(true) => Ok(true),
                Ok(false) => Ok(self.reject(TransportError::HostKeyUnknown {
                    host: self.host.clone(),
                    port: self.port,
                })),
                Err(e) => Ok(self.reject(e)),
            },
        }
    }

    async fn auth_banner(
        &mut self,
        banner: &str,
        _session: &mut Session,
    ) -> std::result::Result<(), Self::Error> {
        debug!("server banner: {}", banner.trim_end());
        if let Ok(mut slot) = self.banner.lock() {
            slot.get_or_insert_with(String::new).push_str(banner);
        }
        Ok(())
    }

    async fn server_channel_open_agent_forward(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> std::result::Result<(), Self::Error> {
        tokio::spawn(relay_to_local_agent(channel));
        Ok(())
    }
}

/// Relay a server-opened agent channel to the agent behind `SSH_AUTH_SOCK`.
#[cfg(unix)]
async fn relay_to_local_agent(channel: Channel<Msg>) {
    let Some(socket_path) = std::env::var_os("SSH_AUTH_SOCK") else {
        warn!("agent forwarding requested but SSH_AUTH_SOCK is not set");
        return;
    };
    let mut agent = match tokio::net::UnixStream::connect(&socket_path).await {
        Ok(agent) => agent,
        Err(e) => {
            warn!("failed to connect to local agent: {}", e);
            return;
        }
    };
    let mut stream = channel.into_stream();
    match crate::forward::shuttle(&mut agent, &mut stream, crate::forward::DEFAULT_CHUNK_SIZE)
        .await
    {
        Ok(stats) => debug!("agent relay finished: {stats:?}"),
        Err(e) => debug!("agent relay ended with error: {}", e),
    }
}

#[cfg(not(unix))]
async fn relay_to_local_agent(channel: Channel<Msg>) {
    warn!("agent forwarding is not supported on this platform");
    drop(channel);
}
