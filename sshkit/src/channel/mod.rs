//! Channel layer: decoding, buffering and pattern-terminated reads.
//!
//! This module handles the interactive session: the PTY shell, the
//! receive buffer and the matchers that end a read.

mod buffer;
mod decoder;
mod patterns;
mod reader;
mod shell;

pub use buffer::ReceiveBuffer;
pub use decoder::TextDecoder;
pub use patterns::{Literal, Matcher, PrefixedRegex};
pub use reader::PatternReader;
pub use shell::{InteractiveShell, ShellSettings};
