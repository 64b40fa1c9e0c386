//! Pattern-terminated reads over a session channel.
//!
//! [`PatternReader`] turns the byte events of a [`SessionChannel`] into a
//! decoded text stream and implements every `read*` operation on top of
//! one engine, [`PatternReader::read_until`]. Waiting is done on channel
//! readiness bounded by a deadline, so every wait (apart from the
//! deliberately unbounded [`PatternReader::read_char`]) is also a timeout
//! point.

use std::time::Duration;

use futures_util::FutureExt;
use log::{debug, trace};
use regex::Regex;
use tokio::time::Instant;

use super::buffer::ReceiveBuffer;
use super::decoder::TextDecoder;
use super::patterns::{Literal, Matcher, PrefixedRegex};
use crate::config::{DecodeErrors, SessionConfig};
use crate::error::{ChannelError, Result};
use crate::transport::{ChannelEvent, SessionChannel};

/// Buffered, decode-safe reader bound to one interactive channel.
pub struct PatternReader<C> {
    channel: C,
    decoder: TextDecoder,
    encoding: String,
    decode_errors: DecodeErrors,
    buffer: ReceiveBuffer,
    newline: String,
    timeout: Duration,
    /// No more data will arrive.
    eof: bool,
}

impl<C: SessionChannel> PatternReader<C> {
    /// Wrap `channel`, taking encoding, newline and timeout from `config`.
    pub fn new(channel: C, config: &SessionConfig) -> Result<Self> {
        Ok(Self {
            channel,
            decoder: TextDecoder::new(&config.encoding, config.decode_errors)?,
            encoding: config.encoding.clone(),
            decode_errors: config.decode_errors,
            buffer: ReceiveBuffer::new(),
            newline: config.newline.as_str().to_string(),
            timeout: config.timeout,
            eof: false,
        })
    }

    /// Pick up a changed configuration.
    ///
    /// A new decoder is only built when the encoding or error policy
    /// changed, so a held-back partial character survives other updates.
    pub fn apply_config(&mut self, config: &SessionConfig) -> Result<()> {
        if config.encoding != self.encoding || config.decode_errors != self.decode_errors {
            self.decoder = TextDecoder::new(&config.encoding, config.decode_errors)?;
            self.encoding = config.encoding.clone();
            self.decode_errors = config.decode_errors;
        }
        self.newline = config.newline.as_str().to_string();
        self.timeout = config.timeout;
        Ok(())
    }

    /// Default timeout for pattern reads.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Decoded output received but not yet consumed.
    pub fn buffered(&self) -> &str {
        self.buffer.as_str()
    }

    /// Whether the remote side has finished sending.
    pub fn is_eof(&self) -> bool {
        self.eof
    }

    /// Get a mutable reference to the channel.
    pub fn channel_mut(&mut self) -> &mut C {
        &mut self.channel
    }

    /// Consume the reader, returning the channel.
    pub fn into_channel(self) -> C {
        self.channel
    }

    /// Send `text` as-is.
    pub async fn write(&mut self, text: &str) -> Result<()> {
        debug!("write: {:?}", text);
        self.channel.send(text.as_bytes()).await
    }

    /// Send `text` followed by the configured newline and consume the echo
    /// up to and including that newline.
    pub async fn write_line(&mut self, text: &str) -> Result<String> {
        let line = format!("{text}{}", self.newline);
        self.write(&line).await?;
        self.read_until_newline().await
    }

    /// Block until one complete character is available and return it.
    ///
    /// Has no timeout. A multi-byte character split across channel reads is
    /// reassembled; only genuinely invalid input is a decode error.
    pub async fn read_char(&mut self) -> Result<char> {
        loop {
            if let Some(c) = self.buffer.pop_char() {
                return Ok(c);
            }
            if self.eof {
                return Err(ChannelError::Closed.into());
            }
            let event = self.channel.recv().await;
            self.ingest(event)?;
        }
    }

    /// Consume everything currently available.
    ///
    /// With a `delay`, keeps sleeping `delay` and draining again while new
    /// output keeps arriving, up to the session timeout.
    pub async fn read(&mut self, delay: Option<Duration>) -> Result<String> {
        self.drain_ready()?;
        if let Some(delay) = delay {
            let deadline = Instant::now() + self.timeout;
            while Instant::now() < deadline {
                tokio::time::sleep(delay).await;
                if !self.drain_ready()? {
                    break;
                }
            }
        }
        let output = self.buffer.take();
        trace!("read {} bytes", output.len());
        Ok(output)
    }

    /// Consume output up to and including the first match of `matcher`.
    ///
    /// Anything after the match stays buffered for the next read. If there
    /// is no match within `timeout` (or the channel ends first), fails with
    /// [`ChannelError::NoMatchFound`]; the buffer is kept intact.
    pub async fn read_until<M>(&mut self, matcher: &M, timeout: Duration) -> Result<String>
    where
        M: Matcher + ?Sized,
    {
        let deadline = Instant::now() + timeout;
        loop {
            self.drain_ready()?;
            if let Some(end) = matcher.find_end(self.buffer.as_str()) {
                let output = self.buffer.split_to(end);
                trace!("matched {:?} after {} bytes", matcher.describe(), output.len());
                return Ok(output);
            }
            if self.eof || Instant::now() >= deadline {
                debug!(
                    "no match for {:?} in {:?} ({} bytes buffered)",
                    matcher.describe(),
                    timeout,
                    self.buffer.len()
                );
                return Err(ChannelError::NoMatchFound {
                    expected: matcher.describe(),
                    timeout,
                    output: self.buffer.as_str().to_string(),
                }
                .into());
            }
            self.wait_until(deadline).await?;
        }
    }

    /// Read until a literal `expected`, using the session timeout.
    pub async fn read_until_text(&mut self, expected: &str) -> Result<String> {
        self.read_until(&Literal::new(expected), self.timeout).await
    }

    /// Read until the configured newline, using the session timeout.
    pub async fn read_until_newline(&mut self) -> Result<String> {
        let newline = Literal::new(self.newline.clone());
        self.read_until(&newline, self.timeout).await
    }

    /// Read until `regex` matches, using the session timeout.
    pub async fn read_until_regex(&mut self, regex: &Regex) -> Result<String> {
        self.read_until(regex, self.timeout).await
    }

    /// Read until `regex` matches `prefix` + buffered output.
    pub async fn read_until_regex_with_prefix(
        &mut self,
        regex: &Regex,
        prefix: &str,
    ) -> Result<String> {
        let matcher = PrefixedRegex::new(regex.clone(), prefix);
        self.read_until(&matcher, self.timeout).await
    }

    /// Write `text` repeatedly until `expected` shows up.
    ///
    /// After each write, waits up to `interval` for `expected`. Returns the
    /// output up to and including `expected`, or fails once `timeout` has
    /// elapsed.
    pub async fn write_until_expected(
        &mut self,
        text: &str,
        expected: &str,
        timeout: Duration,
        interval: Duration,
    ) -> Result<String> {
        let matcher = Literal::new(expected);
        let deadline = Instant::now() + timeout;
        let mut attempt = 0u32;
        while Instant::now() < deadline {
            attempt += 1;
            self.write(text).await?;
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.read_until(&matcher, interval.min(remaining)).await {
                Ok(output) => return Ok(output),
                Err(e) if e.is_no_match() && !self.eof => {
                    trace!("attempt {} did not produce {:?}", attempt, expected);
                }
                Err(e) => return Err(e),
            }
        }
        Err(ChannelError::NoMatchFound {
            expected: expected.to_string(),
            timeout,
            output: self.buffer.as_str().to_string(),
        }
        .into())
    }

    /// Pull in every event that is ready right now without waiting.
    ///
    /// Returns whether any output arrived.
    fn drain_ready(&mut self) -> Result<bool> {
        let mut received = false;
        while !self.eof {
            let Some(event) = self.channel.recv().now_or_never() else {
                break;
            };
            received |= self.ingest(event)?;
        }
        Ok(received)
    }

    /// Wait for the next event or the deadline, whichever comes first.
    async fn wait_until(&mut self, deadline: Instant) -> Result<()> {
        if self.eof {
            return Ok(());
        }
        if let Ok(event) = tokio::time::timeout_at(deadline, self.channel.recv()).await {
            self.ingest(event)?;
        }
        Ok(())
    }

    /// Fold one channel event into the buffer. Returns whether it carried output.
    fn ingest(&mut self, event: Option<ChannelEvent>) -> Result<bool> {
        match event {
            Some(ChannelEvent::Data(data)) | Some(ChannelEvent::ExtendedData { data, .. }) => {
                self.decoder.push(&data, self.buffer.tail_mut())?;
                Ok(true)
            }
            Some(ChannelEvent::Eof) | Some(ChannelEvent::Close) | None => {
                if !self.eof {
                    debug!("interactive channel reached end of stream");
                }
                self.eof = true;
                self.decoder.finish(self.buffer.tail_mut())?;
                Ok(false)
            }
            Some(other) => {
                trace!("ignoring {:?} on interactive channel", other);
                Ok(false)
            }
        }
    }
}
