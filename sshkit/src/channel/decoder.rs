//! Streaming text decoder for channel output.
//!
//! Channel data arrives in arbitrary chunks, so a multi-byte character can
//! be split across two reads. The decoder keeps the incomplete tail of one
//! chunk and finishes it with the next; only genuinely malformed input is
//! subject to the [`DecodeErrors`] policy.

use encoding_rs::{Decoder, DecoderResult, Encoding};

use crate::config::DecodeErrors;
use crate::error::{ChannelError, ConnectionError, Result};

/// Incremental decoder bound to one encoding.
pub struct TextDecoder {
    encoding: &'static Encoding,
    decoder: Decoder,
    errors: DecodeErrors,
}

impl TextDecoder {
    /// Create a decoder for a WHATWG encoding label such as `utf-8` or `latin1`.
    pub fn new(label: &str, errors: DecodeErrors) -> Result<Self> {
        let encoding = Encoding::for_label(label.as_bytes()).ok_or_else(|| {
            ConnectionError::InvalidConfig {
                message: format!("unknown encoding '{label}'"),
            }
        })?;
        Ok(Self {
            encoding,
            decoder: encoding.new_decoder_without_bom_handling(),
            errors,
        })
    }

    /// Name of the encoding in use.
    pub fn encoding_name(&self) -> &'static str {
        self.encoding.name()
    }

    /// Decode `bytes` and append the complete characters to `out`.
    ///
    /// An incomplete trailing sequence is held back until the next call.
    /// Under [`DecodeErrors::Strict`] malformed bytes are dropped, the rest
    /// of the chunk is still decoded into `out`, and then the error is
    /// returned.
    pub fn push(&mut self, bytes: &[u8], out: &mut String) -> Result<()> {
        self.decode(bytes, out, false)
    }

    /// Flush any held-back bytes, treating them as malformed.
    pub fn finish(&mut self, out: &mut String) -> Result<()> {
        let result = self.decode(&[], out, true);
        self.decoder = self.encoding.new_decoder_without_bom_handling();
        result
    }

    fn decode(&mut self, bytes: &[u8], out: &mut String, last: bool) -> Result<()> {
        let mut src = bytes;
        let mut malformed = false;
        loop {
            let needed = self
                .decoder
                .max_utf8_buffer_length_without_replacement(src.len())
                .unwrap_or(src.len() * 3 + 16);
            out.reserve(needed);

            let (result, read) = self
                .decoder
                .decode_to_string_without_replacement(src, out, last);
            src = &src[read..];

            match result {
                DecoderResult::InputEmpty if malformed => {
                    return Err(ChannelError::Decode {
                        encoding: self.encoding.name(),
                    }
                    .into());
                }
                DecoderResult::InputEmpty => return Ok(()),
                DecoderResult::OutputFull => continue,
                DecoderResult::Malformed(_, _) => match self.errors {
                    DecodeErrors::Strict => malformed = true,
                    DecodeErrors::Replace => out.push('\u{FFFD}'),
                    DecodeErrors::Ignore => {}
                },
            }
        }
    }
}

impl std::fmt::Debug for TextDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TextDecoder")
            .field("encoding", &self.encoding.name())
            .field("errors", &self.errors)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_multibyte_sequence() {
        let mut decoder = TextDecoder::new("utf-8", DecodeErrors::Strict).unwrap();
        let euro = "€".as_bytes();
        let mut out = String::new();

        decoder.push(&euro[..1], &mut out).unwrap();
        assert_eq!(out, "");

        decoder.push(&euro[1..], &mut out).unwrap();
        assert_eq!(out, "€");
    }

    #[test]
    fn test_strict_rejects_invalid_bytes() {
        let mut decoder = TextDecoder::new("utf8", DecodeErrors::Strict).unwrap();
        let mut out = String::new();
        assert!(decoder.push(b"ok\xff", &mut out).is_err());
    }

    #[test]
    fn test_strict_keeps_text_after_invalid_bytes() {
        let mut decoder = TextDecoder::new("utf-8", DecodeErrors::Strict).unwrap();
        let mut out = String::new();
        assert!(decoder.push(b"ok\xffafter$ ", &mut out).is_err());
        assert_eq!(out, "okafter$ ");

        decoder.push(b" more", &mut out).unwrap();
        assert_eq!(out, "okafter$  more");
    }

    #[test]
    fn test_replace_and_ignore() {
        let mut out = String::new();
        TextDecoder::new("utf-8", DecodeErrors::Replace)
            .unwrap()
            .push(b"a\xffb", &mut out)
            .unwrap();
        assert_eq!(out, "a\u{FFFD}b");

        let mut out = String::new();
        TextDecoder::new("utf-8", DecodeErrors::Ignore)
            .unwrap()
            .push(b"a\xffb", &mut out)
            .unwrap();
        assert_eq!(out, "ab");
    }

    #[test]
    fn test_latin1() {
        let mut decoder = TextDecoder::new("latin1", DecodeErrors::Strict).unwrap();
        let mut out = String::new();
        decoder.push(b"caf\xe9", &mut out).unwrap();
        assert_eq!(out, "café");
    }

    #[test]
    fn test_finish_flags_truncated_tail() {
        let mut decoder = TextDecoder::new("utf-8", DecodeErrors::Replace).unwrap();
        let mut out = String::new();
        decoder.push(&"€".as_bytes()[..2], &mut out).unwrap();
        decoder.finish(&mut out).unwrap();
        assert_eq!(out, "\u{FFFD}");
    }

    #[test]
    fn test_unknown_label() {
        assert!(TextDecoder::new("no-such-charset", DecodeErrors::Strict).is_err());
    }
}
