//! Opaque contact-log record value.

use std::fmt;

use serde::{Deserialize, Serialize};

/// One logged contact as an ADIF text blob, header marker included.
///
/// The relay never parses the contents; equality is byte-for-byte.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogRecord {
    payload: String,
}

impl LogRecord {
    /// Wraps `payload` as a record.
    pub fn new(payload: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
        }
    }

    /// Full record text.
    pub fn payload(&self) -> &str {
        &self.payload
    }

    /// Consumes the record and returns its text.
    pub fn into_payload(self) -> String {
        self.payload
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// True for an empty payload.
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

impl From<String> for LogRecord {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<&str> for LogRecord {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl fmt::Display for LogRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.payload)
    }
}
