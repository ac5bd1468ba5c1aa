//! Decoder for the logging software's UDP broadcast frames.
//!
//! Layout of a logged-ADIF frame, all integers big-endian `u32`:
//!
//! ```text
//! magic | schema | type | id_len | id bytes | adif_len | adif bytes
//! ```
//!
//! Every declared length must fit in the datagram; there is no null-string
//! special case, so a length of `0xffff_ffff` is simply truncated.

use std::borrow::Cow;

use thiserror::Error;
use tracing::{trace, warn};

use crate::{
    record::LogRecord,
    types::{FRAME_MAGIC, MSG_LOGGED_ADIF, MSG_TYPE_OFFSET},
};

/// Why a datagram did not yield a record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// First word is not [`FRAME_MAGIC`].
    #[error("unknown magic number: {0:#x}")]
    BadMagic(u32),
    /// Valid frame of a message type other than logged-ADIF.
    #[error("unsupported message type {0}")]
    UnsupportedMessage(u32),
    /// A declared length runs past the end of the datagram.
    #[error("frame truncated at offset {offset}: needed {needed} bytes, {available} available")]
    Truncated {
        /// Read position where the shortfall was found.
        offset: usize,
        /// Bytes the field required.
        needed: usize,
        /// Bytes left in the datagram.
        available: usize,
    },
}

impl FrameError {
    /// True for frames that are simply not ours (other message types).
    pub fn is_irrelevant(&self) -> bool {
        matches!(self, Self::UnsupportedMessage(_))
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], FrameError> {
        let available = self.buf.len() - self.pos;
        if n > available {
            return Err(FrameError::Truncated {
                offset: self.pos,
                needed: n,
                available,
            });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u32(&mut self) -> Result<u32, FrameError> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn string(&mut self) -> Result<&'a [u8], FrameError> {
        let len = self.u32()?;
        self.take(len as usize)
    }
}

/// Decodes one datagram, reporting why it was rejected.
///
/// Never panics and never reads past `buf`.
pub fn try_decode_frame(buf: &[u8]) -> Result<LogRecord, FrameError> {
    let mut r = Reader::new(buf);

    let magic = r.u32()?;
    if magic != FRAME_MAGIC {
        return Err(FrameError::BadMagic(magic));
    }
    r.take(MSG_TYPE_OFFSET - 4)?;

    let msg_type = r.u32()?;
    if msg_type != MSG_LOGGED_ADIF {
        return Err(FrameError::UnsupportedMessage(msg_type));
    }

    // Client identifier, not surfaced.
    r.string()?;

    let adif = match String::from_utf8_lossy(r.string()?) {
        Cow::Borrowed(text) => text.to_string(),
        Cow::Owned(text) => {
            warn!(
                bytes = text.len(),
                "record is not valid UTF-8; invalid bytes replaced:\n{text}"
            );
            text
        }
    };
    Ok(LogRecord::new(adif))
}

/// Decodes one datagram into a record, or `None` when it is not a logged contact.
pub fn decode_frame(buf: &[u8]) -> Option<LogRecord> {
    match try_decode_frame(buf) {
        Ok(record) => Some(record),
        Err(err) if err.is_irrelevant() => {
            trace!(len = buf.len(), error = %err, "ignoring datagram");
            None
        }
        Err(err) => {
            warn!(len = buf.len(), error = %err, "discarding malformed datagram");
            None
        }
    }
}

/// Builds a logged-ADIF frame the way the broadcasting software lays it out.
pub fn encode_logged_adif(schema: u32, id: &str, adif: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(24 + id.len() + adif.len());
    out.extend_from_slice(&FRAME_MAGIC.to_be_bytes());
    out.extend_from_slice(&schema.to_be_bytes());
    out.extend_from_slice(&MSG_LOGGED_ADIF.to_be_bytes());
    out.extend_from_slice(&(id.len() as u32).to_be_bytes());
    out.extend_from_slice(id.as_bytes());
    out.extend_from_slice(&(adif.len() as u32).to_be_bytes());
    out.extend_from_slice(adif.as_bytes());
    out
}
