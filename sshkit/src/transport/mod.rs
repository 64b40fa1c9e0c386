//! Transport layer: the authenticated connection and its channels.
//!
//! Everything above this module talks to the remote host through the
//! [`Transport`] and [`SessionChannel`] traits. [`SshTransport`] is the
//! russh-backed implementation; tests plug in in-memory ones.

pub mod config;
mod ssh;

use std::future::Future;
use std::net::SocketAddr;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::Result;

pub use config::{AuthMethod, HostKeyVerification, SshConfig};
pub use ssh::{SshChannel, SshTransport};

/// Extended data type code for stderr (RFC 4254 section 5.2).
pub const EXTENDED_DATA_STDERR: u32 = 1;

/// Something that happened on a channel, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// Regular channel data (stdout).
    Data(Bytes),

    /// Extended data; `ext == 1` is stderr.
    ExtendedData { data: Bytes, ext: u32 },

    /// The remote side will send no more data.
    Eof,

    /// The remote command exited with a status code.
    ExitStatus(u32),

    /// The remote command was killed by a signal.
    ExitSignal {
        signal: String,
        core_dumped: bool,
        message: String,
    },

    /// The channel was closed.
    Close,
}

/// A session channel: shell, exec or subsystem.
pub trait SessionChannel: Send + 'static {
    /// Request a pseudo-terminal.
    fn request_pty(
        &mut self,
        term_type: &str,
        width: u32,
        height: u32,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Change the pseudo-terminal size.
    fn resize_pty(&mut self, width: u32, height: u32) -> impl Future<Output = Result<()>> + Send;

    /// Start the user's login shell.
    fn request_shell(&mut self) -> impl Future<Output = Result<()>> + Send;

    /// Execute a command.
    fn exec(&mut self, command: &str) -> impl Future<Output = Result<()>> + Send;

    /// Invoke a named subsystem.
    fn request_subsystem(&mut self, name: &str) -> impl Future<Output = Result<()>> + Send;

    /// Ask the server to forward agent connections back over this session.
    fn request_agent_forwarding(&mut self) -> impl Future<Output = Result<()>> + Send;

    /// Send data to the remote side.
    fn send(&mut self, data: &[u8]) -> impl Future<Output = Result<()>> + Send;

    /// Signal that no more data will be sent.
    fn send_eof(&mut self) -> impl Future<Output = Result<()>> + Send;

    /// Wait for the next event. `None` means the channel is gone.
    ///
    /// Must be cancel-safe: dropping the future loses no events.
    fn recv(&mut self) -> impl Future<Output = Option<ChannelEvent>> + Send;

    /// Close the channel.
    fn close(&mut self) -> impl Future<Output = Result<()>> + Send;
}

/// An authenticated, multiplexing connection to a remote host.
///
/// Clones share the same underlying connection; opening channels must be
/// safe from several tasks at once.
pub trait Transport: Clone + Send + Sync + 'static {
    /// Channel type for shell/exec/subsystem sessions.
    type Channel: SessionChannel;

    /// Byte stream type of a `direct-tcpip` channel.
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Open a new session channel.
    fn open_session(&self) -> impl Future<Output = Result<Self::Channel>> + Send;

    /// Open a `direct-tcpip` channel to `host:port`, reporting `origin`
    /// as the connecting peer.
    fn open_direct_tcpip(
        &self,
        host: &str,
        port: u16,
        origin: SocketAddr,
    ) -> impl Future<Output = Result<Self::Stream>> + Send;

    /// The banner the server sent during authentication, if any.
    fn banner(&self) -> Option<String>;

    /// Whether the connection is still usable.
    fn is_alive(&self) -> bool;

    /// Disconnect from the server.
    fn disconnect(&self) -> impl Future<Output = Result<()>> + Send;
}
