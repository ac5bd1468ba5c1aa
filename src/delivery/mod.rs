//! Remote delivery of records and classification of the logbook's reply.

pub mod qrz;

use std::future::Future;

use crate::record::LogRecord;

/// Reply field that carries the new logbook id on success.
pub const SUCCESS_FIELD: &str = "LOGID";
/// Reply field that explains a failure.
pub const REASON_FIELD: &str = "REASON";
/// Substring of [`REASON_FIELD`] that means the logbook already has the contact.
///
/// This matches free text chosen by the remote service; a wording change
/// there would turn duplicates into rejections.
pub const DUPLICATE_MARKER: &str = "duplicate";

/// Result of one delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Accepted as a new logbook entry.
    Delivered {
        /// Id assigned by the logbook.
        log_id: String,
    },
    /// The logbook already holds this contact.
    AlreadyLogged {
        /// Reason text as returned.
        reason: String,
    },
    /// Declined for a reason other than duplication.
    Rejected {
        /// Reason text as returned, or the whole reply when none was given.
        reason: String,
    },
    /// Transport, status, or parse failure; try again later.
    Transient {
        /// Underlying error.
        error: String,
    },
}

impl DeliveryOutcome {
    /// True when the record may be purged from the backlog.
    pub fn is_confirmed(&self) -> bool {
        matches!(self, Self::Delivered { .. } | Self::AlreadyLogged { .. })
    }

    /// Short name for logs.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Delivered { .. } => "delivered",
            Self::AlreadyLogged { .. } => "already_logged",
            Self::Rejected { .. } => "rejected",
            Self::Transient { .. } => "transient",
        }
    }
}

/// Hands one record to the remote logbook.
///
/// Implementations never fail outright; every failure is folded into
/// [`DeliveryOutcome::Transient`] or [`DeliveryOutcome::Rejected`].
pub trait Uploader: Send + Sync + 'static {
    /// Attempts delivery of `record`.
    fn upload(&self, record: &LogRecord) -> impl Future<Output = DeliveryOutcome> + Send;
}

/// Splits an `&`-joined `key=value` reply. Pieces without `=` are skipped.
pub fn parse_fields(body: &str) -> Vec<(&str, &str)> {
    body.split('&')
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.trim(), v))
        .filter(|(k, _)| !k.is_empty())
        .collect()
}

fn field<'a>(fields: &[(&'a str, &'a str)], name: &str) -> Option<&'a str> {
    fields
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| *v)
}

/// Classifies a logbook reply body.
pub fn classify_response(body: &str) -> DeliveryOutcome {
    let body = body.trim();
    let fields = parse_fields(body);
    if fields.is_empty() {
        return DeliveryOutcome::Transient {
            error: format!("unparseable logbook reply: {body:?}"),
        };
    }

    if let Some(log_id) = field(&fields, SUCCESS_FIELD) {
        return DeliveryOutcome::Delivered {
            log_id: log_id.to_string(),
        };
    }

    match field(&fields, REASON_FIELD) {
        Some(reason) if reason.contains(DUPLICATE_MARKER) => DeliveryOutcome::AlreadyLogged {
            reason: reason.to_string(),
        },
        Some(reason) if !reason.trim().is_empty() => DeliveryOutcome::Rejected {
            reason: reason.to_string(),
        },
        _ => DeliveryOutcome::Rejected {
            reason: body.to_string(),
        },
    }
}
