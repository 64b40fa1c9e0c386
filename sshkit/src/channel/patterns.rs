//! Matchers that decide where a pattern-terminated read ends.

use memchr::memmem;
use regex::Regex;

use crate::config::Prompt;

/// Trait for read terminators - literal, regex or anything custom.
pub trait Matcher: Send + Sync {
    /// Returns the byte offset in `text` where the match ends, or None.
    fn find_end(&self, text: &str) -> Option<usize>;

    /// The expected pattern as shown in timeout errors.
    fn describe(&self) -> String;
}

/// Literal substring matcher.
#[derive(Debug, Clone)]
pub struct Literal(String);

impl Literal {
    pub fn new(text: impl Into<String>) -> Self {
        Self(text.into())
    }
}

impl Matcher for Literal {
    fn find_end(&self, text: &str) -> Option<usize> {
        memmem::find(text.as_bytes(), self.0.as_bytes()).map(|start| start + self.0.len())
    }

    fn describe(&self) -> String {
        self.0.clone()
    }
}

/// Regex-based matcher (the match ends where the leftmost match ends).
impl Matcher for Regex {
    fn find_end(&self, text: &str) -> Option<usize> {
        self.find(text).map(|m| m.end())
    }

    fn describe(&self) -> String {
        self.as_str().to_string()
    }
}

/// Regex matched against `prefix + buffer`.
///
/// The prefix is never consumed. A match only counts once it reaches past
/// the prefix into the buffer, and the consumed length is measured from the
/// start of the buffer.
#[derive(Debug, Clone)]
pub struct PrefixedRegex {
    regex: Regex,
    prefix: String,
}

impl PrefixedRegex {
    pub fn new(regex: Regex, prefix: impl Into<String>) -> Self {
        Self {
            regex,
            prefix: prefix.into(),
        }
    }
}

impl Matcher for PrefixedRegex {
    fn find_end(&self, text: &str) -> Option<usize> {
        let joined = format!("{}{}", self.prefix, text);
        self.regex
            .find_iter(&joined)
            .map(|m| m.end())
            .find(|&end| end > self.prefix.len())
            .map(|end| end - self.prefix.len())
    }

    fn describe(&self) -> String {
        self.regex.as_str().to_string()
    }
}

impl Matcher for Prompt {
    fn find_end(&self, text: &str) -> Option<usize> {
        match self {
            Prompt::Literal(literal) => {
                memmem::find(text.as_bytes(), literal.as_bytes()).map(|start| start + literal.len())
            }
            Prompt::Regex(regex) => regex.find_end(text),
        }
    }

    fn describe(&self) -> String {
        match self {
            Prompt::Literal(literal) => literal.clone(),
            Prompt::Regex(regex) => regex.as_str().to_string(),
        }
    }
}
