//! Remote command execution on dedicated exec/subsystem channels.

mod output;
mod session;

pub use output::CommandOutput;
pub use session::{CommandSession, ExecMode, ReadOptions, StartOptions};
