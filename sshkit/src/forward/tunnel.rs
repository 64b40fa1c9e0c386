//! Local listener that forwards connections through `direct-tcpip` channels.

use std::fmt;
use std::net::{Ipv6Addr, SocketAddr};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use super::shuttle::shuttle;
use crate::error::{Result, TunnelError};
use crate::transport::Transport;

/// Where forwarded connections go, as seen from the remote host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardTarget {
    pub host: String,
    pub port: u16,
}

impl ForwardTarget {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Whether the target host is an IPv6 literal.
    pub fn is_ipv6(&self) -> bool {
        self.host.parse::<Ipv6Addr>().is_ok()
    }

    /// Wildcard address matching the target's address family.
    fn default_bind_address(&self) -> &'static str {
        if self.is_ipv6() { "::" } else { "0.0.0.0" }
    }
}

impl fmt::Display for ForwardTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_ipv6() {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// A running local port forward.
///
/// Dropping or closing the tunnel stops the listener. Relays that are
/// already running carry on until one of their ends closes.
#[derive(Debug)]
pub struct LocalTunnel {
    local_addr: SocketAddr,
    target: ForwardTarget,
    task: JoinHandle<()>,
}

impl LocalTunnel {
    /// Bind `local_port` and start forwarding to `target`.
    ///
    /// Without a `bind_address` the listener binds the wildcard address of
    /// the target's family. Port 0 picks a free port; see
    /// [`local_addr`](Self::local_addr).
    pub async fn start<T: Transport>(
        transport: T,
        local_port: u16,
        target: ForwardTarget,
        bind_address: Option<&str>,
        chunk_size: usize,
    ) -> Result<Self> {
        let host = bind_address.unwrap_or_else(|| target.default_bind_address());
        let bind_error = |source| TunnelError::Bind {
            addr: format!("{host}:{local_port}"),
            source,
        };

        let listener = TcpListener::bind((host, local_port))
            .await
            .map_err(bind_error)?;
        let local_addr = listener.local_addr().map_err(bind_error)?;

        info!("Now forwarding port {} to {} ...", local_addr.port(), target);

        let handler = ForwardHandler {
            transport,
            target: target.clone(),
            chunk_size,
        };
        let task = tokio::spawn(accept_loop(listener, handler));

        Ok(Self {
            local_addr,
            target,
            task,
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn target(&self) -> &ForwardTarget {
        &self.target
    }

    /// Whether the listener is still accepting.
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stop accepting new connections.
    pub async fn close(mut self) {
        self.task.abort();
        let _ = (&mut self.task).await;
        info!("Stopped forwarding port {}", self.local_addr.port());
    }
}

impl Drop for LocalTunnel {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn accept_loop<T: Transport>(listener: TcpListener, handler: ForwardHandler<T>) {
    loop {
        match listener.accept().await {
            Ok((socket, peer)) => {
                // Detached: a relay ends on its own EOF, not with the listener
                tokio::spawn(handler.clone().handle(socket, peer));
            }
            Err(e) => {
                warn!("Accepting tunnel connection failed: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

/// Per-connection relay state.
#[derive(Clone)]
struct ForwardHandler<T> {
    transport: T,
    target: ForwardTarget,
    chunk_size: usize,
}

impl<T: Transport> ForwardHandler<T> {
    async fn handle(self, mut socket: TcpStream, peer: SocketAddr) {
        let opened = self
            .transport
            .open_direct_tcpip(&self.target.host, self.target.port, peer)
            .await;
        let mut channel = match opened {
            Ok(channel) => channel,
            Err(e) => {
                info!("Incoming request to {} failed: {}", self.target, e);
                return;
            }
        };

        info!("Connected! Tunnel open {} -> {}", peer, self.target);

        match shuttle(&mut socket, &mut channel, self.chunk_size).await {
            Ok(stats) => info!(
                "Tunnel closed from {} ({} bytes out, {} bytes in)",
                peer, stats.a_to_b, stats.b_to_a
            ),
            Err(e) => debug!("Tunnel from {} ended with error: {}", peer, e),
        }
    }
}
