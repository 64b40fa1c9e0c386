//! # sshkit
//!
//! Async SSH building blocks for driving remote hosts from code.
//!
//! sshkit covers the interactive side of remote execution: reading a
//! terminal session until a pattern shows up, running commands on their
//! own channels and collecting their output, and forwarding local ports
//! through the connection.
//!
//! ## Features
//!
//! - Async SSH connections via russh
//! - Pattern-terminated reads (literal, regex, regex with a virtual prefix)
//!   over a decode-safe receive buffer
//! - Commands with sudo, subsystem and agent forwarding support, read in
//!   LIFO order with optional timeouts
//! - Local port forwarding over `direct-tcpip` channels
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use sshkit::{ConnectionBuilder, ReadOptions, StartOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), sshkit::Error> {
//!     let mut conn = ConnectionBuilder::new("192.168.1.1")
//!         .username("admin")
//!         .password("secret")
//!         .open()
//!         .await?;
//!
//!     conn.write("cd /var/log").await?;
//!     println!("{}", conn.read_until("$ ").await?);
//!
//!     let output = conn
//!         .execute_command("uptime", StartOptions::default(), &ReadOptions::default())
//!         .await?;
//!     println!("{}", output.stdout);
//!
//!     conn.create_local_tunnel(8080, "127.0.0.1", 80, None).await?;
//!
//!     conn.close().await?;
//!     Ok(())
//! }
//! ```

pub mod channel;
pub mod client;
pub mod command;
pub mod config;
pub mod error;
pub mod forward;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

// Re-export main types for convenience
pub use client::{Connection, ConnectionBuilder};
pub use command::{CommandOutput, ExecMode, ReadOptions, StartOptions};
pub use config::{DecodeErrors, Newline, Prompt, SessionConfig, SessionConfigUpdate};
pub use error::{Error, Result};
pub use forward::{ForwardTarget, LocalTunnel};
pub use transport::{AuthMethod, HostKeyVerification, SshConfig, SshTransport};
