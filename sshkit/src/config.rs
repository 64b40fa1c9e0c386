//! Per-connection session configuration.
//!
//! [`SessionConfig`] is fixed when a connection is created and only changes
//! through [`SessionConfig::update`].

use std::fmt;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{ConnectionError, Result};

/// What to do with bytes that are not valid in the configured encoding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecodeErrors {
    /// Fail the read.
    #[default]
    Strict,
    /// Substitute U+FFFD.
    Replace,
    /// Drop the offending bytes.
    Ignore,
}

/// Newline sequence appended by `write`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Newline(String);

impl Newline {
    /// Parse a newline setting.
    ///
    /// `LF` and `CR` tokens are translated case-insensitively, so `CRLF`
    /// becomes `"\r\n"`. Anything else is taken as literal text.
    pub fn parse(value: &str) -> Self {
        let upper = value.to_ascii_uppercase();
        let is_tokens = !upper.is_empty()
            && upper
                .replace("LF", "")
                .replace("CR", "")
                .is_empty();
        if is_tokens {
            Self(upper.replace("LF", "\n").replace("CR", "\r"))
        } else {
            Self(value.to_string())
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for Newline {
    fn default() -> Self {
        Self("\n".to_string())
    }
}

impl Serialize for Newline {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Newline {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::parse(&raw))
    }
}

/// Marker that turns a prompt setting into a regular expression.
pub const REGEXP_PREFIX: &str = "REGEXP:";

/// The shell prompt, either literal text or a regular expression.
#[derive(Debug, Clone)]
pub enum Prompt {
    Literal(String),
    Regex(Regex),
}

impl Prompt {
    /// Parse a prompt setting; `REGEXP:` selects a regular expression.
    pub fn parse(value: &str) -> Result<Self> {
        match value.strip_prefix(REGEXP_PREFIX) {
            Some(pattern) => {
                let regex = Regex::new(pattern).map_err(|e| ConnectionError::InvalidConfig {
                    message: format!("invalid prompt pattern '{pattern}': {e}"),
                })?;
                Ok(Self::Regex(regex))
            }
            None => Ok(Self::Literal(value.to_string())),
        }
    }
}

impl fmt::Display for Prompt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Prompt::Literal(text) => f.write_str(text),
            Prompt::Regex(regex) => write!(f, "{REGEXP_PREFIX}{}", regex.as_str()),
        }
    }
}

impl PartialEq for Prompt {
    fn eq(&self, other: &Self) -> bool {
        self.to_string() == other.to_string()
    }
}

impl Serialize for Prompt {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Prompt {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Prompt::parse(&raw).map_err(serde::de::Error::custom)
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// Session configuration owned by a connection.
///
/// Durations are (de)serialized as milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Remote host.
    pub host: String,

    /// Remote SSH port.
    pub port: u16,

    /// Default timeout for pattern reads and `read` with a delay.
    #[serde(with = "millis")]
    pub timeout: Duration,

    /// Sequence appended by `write`.
    pub newline: Newline,

    /// Prompt used by `read_until_prompt`.
    pub prompt: Option<Prompt>,

    /// Terminal type requested for the interactive shell.
    pub term_type: String,

    /// Terminal width in columns.
    pub width: u32,

    /// Terminal height in rows.
    pub height: u32,

    /// WHATWG label of the remote text encoding.
    pub encoding: String,

    /// Handling of undecodable bytes.
    pub decode_errors: DecodeErrors,

    /// Remote path separator.
    pub path_separator: String,

    /// Read size used by the tunnel shuttle.
    pub tunnel_chunk_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 22,
            timeout: Duration::from_secs(3),
            newline: Newline::default(),
            prompt: None,
            term_type: "vt100".to_string(),
            width: 80,
            height: 24,
            encoding: "utf-8".to_string(),
            decode_errors: DecodeErrors::Strict,
            path_separator: "/".to_string(),
            tunnel_chunk_size: crate::forward::DEFAULT_CHUNK_SIZE,
        }
    }
}

impl SessionConfig {
    /// Create a configuration for `host:port` with defaults elsewhere.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    /// Check values that cannot be expressed in the types.
    pub fn validate(&self) -> Result<()> {
        if encoding_rs::Encoding::for_label(self.encoding.as_bytes()).is_none() {
            return Err(invalid(format!("unknown encoding '{}'", self.encoding)));
        }
        if self.width == 0 || self.height == 0 {
            return Err(invalid("terminal size must be non-zero".to_string()));
        }
        if self.tunnel_chunk_size == 0 {
            return Err(invalid("tunnel chunk size must be non-zero".to_string()));
        }
        Ok(())
    }

    /// Apply every field set in `update`, then validate.
    ///
    /// On error the configuration is left untouched.
    pub fn update(&mut self, update: SessionConfigUpdate) -> Result<()> {
        let mut next = self.clone();
        if let Some(timeout) = update.timeout {
            next.timeout = timeout;
        }
        if let Some(newline) = update.newline {
            next.newline = newline;
        }
        if let Some(prompt) = update.prompt {
            next.prompt = Some(prompt);
        }
        if let Some(term_type) = update.term_type {
            next.term_type = term_type;
        }
        if let Some(width) = update.width {
            next.width = width;
        }
        if let Some(height) = update.height {
            next.height = height;
        }
        if let Some(encoding) = update.encoding {
            next.encoding = encoding;
        }
        if let Some(decode_errors) = update.decode_errors {
            next.decode_errors = decode_errors;
        }
        if let Some(path_separator) = update.path_separator {
            next.path_separator = path_separator;
        }
        next.validate()?;
        *self = next;
        Ok(())
    }
}

fn invalid(message: String) -> crate::Error {
    ConnectionError::InvalidConfig { message }.into()
}

/// A partial change to a [`SessionConfig`]; `None` fields are left alone.
#[derive(Debug, Clone, Default)]
pub struct SessionConfigUpdate {
    pub timeout: Option<Duration>,
    pub newline: Option<Newline>,
    pub prompt: Option<Prompt>,
    pub term_type: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub encoding: Option<String>,
    pub decode_errors: Option<DecodeErrors>,
    pub path_separator: Option<String>,
}
