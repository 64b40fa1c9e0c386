//! Local port forwarding (`ssh -L`).
//!
//! A [`LocalTunnel`] listens on a local port and, for every accepted
//! connection, opens a `direct-tcpip` channel to a fixed remote target and
//! shuttles bytes both ways until either side closes.

mod shuttle;
mod tunnel;

pub use shuttle::{DEFAULT_CHUNK_SIZE, ShuttleStats, shuttle};
pub use tunnel::{ForwardTarget, LocalTunnel};
