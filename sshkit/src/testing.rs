//! In-memory transport and channel doubles for unit tests.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use tokio::net::TcpStream;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

use crate::error::{ChannelError, Result, TunnelError};
use crate::transport::{ChannelEvent, EXTENDED_DATA_STDERR, SessionChannel, Transport};

#[derive(Default)]
struct Shared {
    echo: bool,
    sent: Vec<u8>,
    requests: Vec<String>,
    writes: usize,
    respond_after: Option<(usize, String)>,
    closed: bool,
}

/// The "server" side of a [`MockChannel`].
#[derive(Clone)]
pub struct RemoteEnd {
    tx: UnboundedSender<ChannelEvent>,
    shared: Arc<Mutex<Shared>>,
}

impl RemoteEnd {
    fn state(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap()
    }

    pub fn data(&self, text: &str) {
        self.bytes(text.as_bytes());
    }

    pub fn bytes(&self, data: &[u8]) {
        let _ = self.tx.send(ChannelEvent::Data(Bytes::copy_from_slice(data)));
    }

    pub fn eof(&self) {
        let _ = self.tx.send(ChannelEvent::Eof);
    }

    /// Echo everything the client sends, like a pty does.
    pub fn echo(&self, on: bool) {
        self.state().echo = on;
    }

    /// Send `text` once the client has written `writes` times.
    pub fn respond_after_writes(&self, writes: usize, text: &str) {
        self.state().respond_after = Some((writes, text.to_string()));
    }

    /// Everything the client sent so far.
    pub fn sent(&self) -> Vec<u8> {
        self.state().sent.clone()
    }

    /// Requests made on the channel, e.g. `"exec:echo A"`.
    pub fn requests(&self) -> Vec<String> {
        self.state().requests.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }
}

/// Channel double driven by a [`RemoteEnd`].
///
/// A scripted channel also plays a tiny remote shell for `exec` requests:
/// `echo TEXT`, `warn TEXT` (to stderr), `both OUT ERR`, `exit N`,
/// `sleep SECS` and `kill` (terminated by a signal), optionally behind a
/// `sudo` wrapper.
pub struct MockChannel {
    rx: UnboundedReceiver<ChannelEvent>,
    remote: RemoteEnd,
    scripted: bool,
}

impl MockChannel {
    pub fn pair() -> (Self, RemoteEnd) {
        Self::build(false)
    }

    pub fn scripted() -> (Self, RemoteEnd) {
        Self::build(true)
    }

    fn build(scripted: bool) -> (Self, RemoteEnd) {
        let (tx, rx) = unbounded_channel();
        let remote = RemoteEnd {
            tx,
            shared: Arc::new(Mutex::new(Shared::default())),
        };
        (
            Self {
                rx,
                remote: remote.clone(),
                scripted,
            },
            remote,
        )
    }

    fn record(&self, request: String) {
        self.remote.state().requests.push(request);
    }
}

impl SessionChannel for MockChannel {
    async fn request_pty(&mut self, term_type: &str, width: u32, height: u32) -> Result<()> {
        self.record(format!("pty:{term_type}:{width}x{height}"));
        self.remote.echo(true);
        Ok(())
    }

    async fn resize_pty(&mut self, width: u32, height: u32) -> Result<()> {
        self.record(format!("resize:{width}x{height}"));
        Ok(())
    }

    async fn request_shell(&mut self) -> Result<()> {
        self.record("shell".to_string());
        Ok(())
    }

    async fn exec(&mut self, command: &str) -> Result<()> {
        self.record(format!("exec:{command}"));
        if self.scripted {
            tokio::spawn(run_script(command.to_string(), self.remote.tx.clone()));
        }
        Ok(())
    }

    async fn request_subsystem(&mut self, name: &str) -> Result<()> {
        self.record(format!("subsystem:{name}"));
        if name == "missing" {
            return Err(ChannelError::RequestFailed {
                request: "subsystem",
            }
            .into());
        }
        if self.scripted {
            let tx = self.remote.tx.clone();
            let _ = tx.send(ChannelEvent::Data(Bytes::from(format!("{name} ready\n"))));
            finish(&tx, 0);
        }
        Ok(())
    }

    async fn request_agent_forwarding(&mut self) -> Result<()> {
        self.record("agent".to_string());
        Ok(())
    }

    async fn send(&mut self, data: &[u8]) -> Result<()> {
        let mut state = self.remote.state();
        state.sent.extend_from_slice(data);
        state.writes += 1;
        if state.echo {
            let _ = self.remote.tx.send(ChannelEvent::Data(Bytes::copy_from_slice(data)));
        }
        if let Some((writes, text)) = state.respond_after.clone() {
            if state.writes >= writes {
                let _ = self.remote.tx.send(ChannelEvent::Data(Bytes::from(text)));
                state.respond_after = None;
            }
        }
        Ok(())
    }

    async fn send_eof(&mut self) -> Result<()> {
        self.record("eof".to_string());
        Ok(())
    }

    async fn recv(&mut self) -> Option<ChannelEvent> {
        self.rx.recv().await
    }

    async fn close(&mut self) -> Result<()> {
        self.remote.state().closed = true;
        Ok(())
    }
}

fn finish(tx: &UnboundedSender<ChannelEvent>, status: u32) {
    let _ = tx.send(ChannelEvent::ExitStatus(status));
    let _ = tx.send(ChannelEvent::Eof);
    let _ = tx.send(ChannelEvent::Close);
}

async fn run_script(command: String, tx: UnboundedSender<ChannelEvent>) {
    let command = command
        .strip_prefix("sudo --stdin --prompt \"\" ")
        .or_else(|| command.strip_prefix("sudo "))
        .unwrap_or(&command);
    let (program, arg) = command.split_once(' ').unwrap_or((command, ""));
    let out = |text: &str| ChannelEvent::Data(Bytes::from(format!("{text}\n")));
    let err = |text: &str| ChannelEvent::ExtendedData {
        data: Bytes::from(format!("{text}\n")),
        ext: EXTENDED_DATA_STDERR,
    };
    match program {
        "echo" => {
            let _ = tx.send(out(arg));
            finish(&tx, 0);
        }
        "warn" => {
            let _ = tx.send(err(arg));
            finish(&tx, 1);
        }
        "both" => {
            let (o, e) = arg.split_once(' ').unwrap_or((arg, ""));
            for _ in 0..3 {
                let _ = tx.send(out(o));
                let _ = tx.send(err(e));
            }
            finish(&tx, 0);
        }
        "exit" => finish(&tx, arg.parse().unwrap_or(255)),
        "sleep" => {
            let secs: f64 = arg.parse().unwrap_or(1.0);
            let _ = tx.send(out("started"));
            tokio::time::sleep(Duration::from_secs_f64(secs)).await;
            finish(&tx, 0);
        }
        "kill" => {
            let _ = tx.send(ChannelEvent::ExitSignal {
                signal: "TERM".to_string(),
                core_dumped: false,
                message: String::new(),
            });
            let _ = tx.send(ChannelEvent::Eof);
            let _ = tx.send(ChannelEvent::Close);
        }
        _ => {
            let _ = tx.send(err(&format!("{program}: command not found")));
            finish(&tx, 127);
        }
    }
}

#[derive(Default)]
struct TransportState {
    channels: Mutex<Vec<RemoteEnd>>,
    refusals: AtomicUsize,
    origins: Mutex<Vec<SocketAddr>>,
    disconnected: AtomicBool,
}

/// Transport double: scripted session channels, and `direct-tcpip`
/// channels that connect straight to the target over loopback.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<TransportState>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remote ends of every session channel opened so far.
    pub fn channels(&self) -> Vec<RemoteEnd> {
        self.state.channels.lock().unwrap().clone()
    }

    /// Make the next `count` calls to `open_direct_tcpip` fail.
    pub fn refuse_next(&self, count: usize) {
        self.state.refusals.store(count, Ordering::SeqCst);
    }

    /// Origins reported for `direct-tcpip` channels.
    pub fn origins(&self) -> Vec<SocketAddr> {
        self.state.origins.lock().unwrap().clone()
    }

    pub fn is_disconnected(&self) -> bool {
        self.state.disconnected.load(Ordering::SeqCst)
    }
}

impl Transport for MockTransport {
    type Channel = MockChannel;
    type Stream = TcpStream;

    async fn open_session(&self) -> Result<MockChannel> {
        let (channel, remote) = MockChannel::scripted();
        self.state.channels.lock().unwrap().push(remote);
        Ok(channel)
    }

    async fn open_direct_tcpip(&self, host: &str, port: u16, origin: SocketAddr) -> Result<TcpStream> {
        let refused = self
            .state
            .refusals
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        let failure = |reason: String| TunnelError::ChannelOpenFailure {
            host: host.to_string(),
            port,
            reason,
        };
        if refused {
            return Err(failure("administratively prohibited".to_string()).into());
        }
        self.state.origins.lock().unwrap().push(origin);
        let stream = TcpStream::connect((host, port))
            .await
            .map_err(|e| failure(e.to_string()))?;
        Ok(stream)
    }

    fn banner(&self) -> Option<String> {
        Some("Authorized use only\n".to_string())
    }

    fn is_alive(&self) -> bool {
        !self.is_disconnected()
    }

    async fn disconnect(&self) -> Result<()> {
        self.state.disconnected.store(true, Ordering::SeqCst);
        Ok(())
    }
}
