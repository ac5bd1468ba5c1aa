#![allow(dead_code)]

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use tokio::sync::broadcast;

use qsorelay::{
    backlog::{Backlog, BacklogError, BacklogResult, sqlite::SqliteBacklog},
    delivery::{DeliveryOutcome, Uploader},
    record::LogRecord,
    runtime::events::RelayEvent,
    types::RowCount,
};

type OutcomeFn = Box<dyn Fn(&LogRecord) -> DeliveryOutcome + Send + Sync>;

/// Uploader double that records every call and answers from a closure.
pub struct StubUploader {
    outcome: OutcomeFn,
    calls: Arc<Mutex<Vec<LogRecord>>>,
    delay: Duration,
}

impl StubUploader {
    pub fn always(outcome: DeliveryOutcome) -> Self {
        Self::with(move |_| outcome.clone())
    }

    pub fn with(f: impl Fn(&LogRecord) -> DeliveryOutcome + Send + Sync + 'static) -> Self {
        Self {
            outcome: Box::new(f),
            calls: Arc::new(Mutex::new(Vec::new())),
            delay: Duration::ZERO,
        }
    }

    pub fn slow(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> Arc<Mutex<Vec<LogRecord>>> {
        Arc::clone(&self.calls)
    }
}

impl Uploader for StubUploader {
    async fn upload(&self, record: &LogRecord) -> DeliveryOutcome {
        self.calls.lock().expect("lock").push(record.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        (self.outcome)(record)
    }
}

pub fn delivered(id: &str) -> DeliveryOutcome {
    DeliveryOutcome::Delivered {
        log_id: id.to_string(),
    }
}

pub fn already_logged() -> DeliveryOutcome {
    DeliveryOutcome::AlreadyLogged {
        reason: "Unable to add QSO to database: duplicate".to_string(),
    }
}

pub fn transient() -> DeliveryOutcome {
    DeliveryOutcome::Transient {
        error: "connection refused".to_string(),
    }
}

pub fn rejected() -> DeliveryOutcome {
    DeliveryOutcome::Rejected {
        reason: "invalid station_callsign".to_string(),
    }
}

pub fn rec(payload: &str) -> LogRecord {
    LogRecord::new(payload)
}

/// Receives events until `pred` matches, returning everything seen up to it.
pub async fn wait_for_event(
    sub: &mut broadcast::Receiver<RelayEvent>,
    mut pred: impl FnMut(&RelayEvent) -> bool,
) -> Vec<RelayEvent> {
    let mut seen = Vec::new();
    loop {
        let evt = tokio::time::timeout(Duration::from_secs(2), sub.recv())
            .await
            .expect("event timeout")
            .expect("recv");
        let done = pred(&evt);
        seen.push(evt);
        if done {
            return seen;
        }
    }
}

/// Switches shared with a [`FailingBacklog`] after it is handed to the relay.
#[derive(Clone, Default)]
pub struct FaultSwitches {
    pub fail_add: Arc<AtomicBool>,
    pub fail_remove: Arc<AtomicBool>,
}

impl FaultSwitches {
    pub fn set_add(&self, on: bool) {
        self.fail_add.store(on, Ordering::SeqCst);
    }

    pub fn set_remove(&self, on: bool) {
        self.fail_remove.store(on, Ordering::SeqCst);
    }
}

/// In-memory SQLite backlog whose mutations can be made to fail on demand.
pub struct FailingBacklog {
    inner: SqliteBacklog,
    switches: FaultSwitches,
}

impl FailingBacklog {
    pub fn new() -> (Self, FaultSwitches) {
        let switches = FaultSwitches::default();
        let backlog = Self {
            inner: SqliteBacklog::open_in_memory().expect("open"),
            switches: switches.clone(),
        };
        (backlog, switches)
    }
}

fn disk_error(op: &str) -> BacklogError {
    BacklogError::Io(std::io::Error::other(format!("{op}: no space left on device")))
}

impl Backlog for FailingBacklog {
    fn add(&mut self, record: &LogRecord) -> BacklogResult<()> {
        if self.switches.fail_add.load(Ordering::SeqCst) {
            return Err(disk_error("add"));
        }
        self.inner.add(record)
    }

    fn remove(&mut self, record: &LogRecord) -> BacklogResult<RowCount> {
        if self.switches.fail_remove.load(Ordering::SeqCst) {
            return Err(disk_error("remove"));
        }
        self.inner.remove(record)
    }

    fn list(&self) -> BacklogResult<Vec<LogRecord>> {
        self.inner.list()
    }

    fn close(&mut self) -> BacklogResult<()> {
        self.inner.close()
    }
}
