//! Runtime event stream payloads.

use crate::{delivery::DeliveryOutcome, record::LogRecord};

/// Counts from one pass over the backlog.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Delivery attempts made.
    pub attempted: usize,
    /// Records confirmed and purged.
    pub purged: usize,
    /// Records left pending.
    pub retained: usize,
}

/// Events emitted as records move through the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    /// Record durably added to the backlog.
    Persisted {
        /// Added record.
        record: LogRecord,
    },
    /// Backlog add failed; the record is at risk.
    PersistFailed {
        /// Record that could not be stored.
        record: LogRecord,
        /// Storage error.
        error: String,
    },
    /// Logbook accepted the record and it was purged.
    Delivered {
        /// Purged record.
        record: LogRecord,
        /// Id assigned by the logbook.
        log_id: String,
    },
    /// Logbook already had the record and it was purged.
    AlreadyLogged {
        /// Purged record.
        record: LogRecord,
    },
    /// Attempt failed; the record stays pending.
    Retained {
        /// Pending record.
        record: LogRecord,
        /// Outcome of the attempt.
        outcome: DeliveryOutcome,
    },
    /// Offline mode; no attempt was made.
    Deferred {
        /// Pending record.
        record: LogRecord,
    },
    /// Delivery confirmed but the backlog entry could not be removed.
    PurgeFailed {
        /// Record that may be uploaded again.
        record: LogRecord,
        /// Storage error.
        error: String,
    },
    /// A pass over the backlog finished.
    DrainComplete {
        /// Pass totals.
        report: DrainReport,
    },
}
