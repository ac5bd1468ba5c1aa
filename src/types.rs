//! Shared protocol constants and primitive aliases.

/// Magic number that opens every broadcast datagram.
pub const FRAME_MAGIC: u32 = 0xadbc_cbda;

/// Message-type tag of a "logged ADIF" broadcast.
pub const MSG_LOGGED_ADIF: u32 = 12;

/// Offset of the message-type tag; bytes 4..8 carry a schema number we do not inspect.
pub const MSG_TYPE_OFFSET: usize = 8;

/// Largest datagram the listener will read.
pub const MAX_DATAGRAM: usize = 2048;

/// Default UDP port the logging software broadcasts on.
pub const DEFAULT_PORT: u16 = 2237;

/// Default remote logbook endpoint.
pub const DEFAULT_LOGBOOK_URL: &str = "https://logbook.qrz.com/api";

/// Count of backlog rows touched by a mutation.
pub type RowCount = usize;
