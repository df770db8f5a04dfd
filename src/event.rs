use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Utc};

/// Level assigned to lines for which the tailer has no better information.
pub const DEFAULT_LINE_LEVEL: u8 = 3;

/// The number of bytes an item contributes to bundle and buffer accounting.
///
/// The reported size must be non-negative and stable for the lifetime of the
/// value: the bundler reads it once at admission and returns the same amount
/// of buffer credit when the containing bundle completes.
pub trait ByteSizeOf {
    fn size_of(&self) -> usize;
}

impl ByteSizeOf for Bytes {
    fn size_of(&self) -> usize {
        self.len()
    }
}

impl ByteSizeOf for Vec<u8> {
    fn size_of(&self) -> usize {
        self.len()
    }
}

impl ByteSizeOf for String {
    fn size_of(&self) -> usize {
        self.len()
    }
}

/// A single log line read from a tailed file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Line {
    timestamp: DateTime<Utc>,
    level: u8,
    text: Bytes,
    file: String,
}

impl Line {
    /// Creates a line stamped with the current time.
    pub fn new(text: impl Into<Bytes>, level: u8) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            text: text.into(),
            file: String::new(),
        }
    }

    /// Records the file the line was read from.
    pub fn with_file(mut self, file: impl Into<String>) -> Self {
        self.file = file.into();
        self
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn level(&self) -> u8 {
        self.level
    }

    pub fn text(&self) -> &Bytes {
        &self.text
    }

    pub fn file(&self) -> &str {
        &self.file
    }
}

/// Only the payload counts; metadata rides for free.
impl ByteSizeOf for Line {
    fn size_of(&self) -> usize {
        self.text.len()
    }
}

impl fmt::Display for Line {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_size_is_payload_only() {
        let line = Line::new("hello", DEFAULT_LINE_LEVEL).with_file("/var/log/app.log");
        assert_eq!(line.size_of(), 5);
        assert_eq!(line.file(), "/var/log/app.log");
    }

    #[test]
    fn line_displays_as_text() {
        let line = Line::new("a message", DEFAULT_LINE_LEVEL);
        assert_eq!(line.to_string(), "a message");
    }
}
