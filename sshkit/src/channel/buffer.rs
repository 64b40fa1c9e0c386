//! Receive buffer for decoded channel output.
//!
//! Text is appended in arrival order and only ever removed from the front,
//! so a matched read hands back exactly the prefix it matched and leaves the
//! rest for the next read.

/// FIFO buffer of decoded output waiting to be consumed.
#[derive(Debug, Default)]
pub struct ReceiveBuffer {
    text: String,
}

impl ReceiveBuffer {
    pub fn new() -> Self {
        Self {
            text: String::with_capacity(4096),
        }
    }

    /// Mutable access for appending decoded text.
    pub(crate) fn tail_mut(&mut self) -> &mut String {
        &mut self.text
    }

    /// Append decoded text.
    pub fn extend(&mut self, text: &str) {
        self.text.push_str(text);
    }

    /// Remove and return everything up to byte offset `end`.
    ///
    /// `end` must fall on a character boundary; it is clamped to the length.
    pub fn split_to(&mut self, end: usize) -> String {
        let end = end.min(self.text.len());
        let rest = self.text.split_off(end);
        std::mem::replace(&mut self.text, rest)
    }

    /// Remove and return the first character, if any.
    pub fn pop_char(&mut self) -> Option<char> {
        let c = self.text.chars().next()?;
        self.text.drain(..c.len_utf8());
        Some(c)
    }

    /// Take ownership of the buffer contents and reset.
    pub fn take(&mut self) -> String {
        std::mem::take(&mut self.text)
    }

    /// Get the buffer contents.
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Get the current buffer length in bytes.
    pub fn len(&self) -> usize {
        self.text.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    /// Clear the buffer.
    pub fn clear(&mut self) {
        self.text.clear();
    }
}
