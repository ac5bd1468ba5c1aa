use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use hashbrown::{HashMap, HashSet};
use thiserror::Error;
use tokio::{
    sync::{broadcast, mpsc, oneshot, watch},
    time::{self, Instant, Interval, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

use crate::{
    backlog::{self, Backlog, BacklogError, SharedBacklog, run_blocking},
    decode::decode_frame,
    delivery::{DeliveryOutcome, Uploader},
    record::LogRecord,
};

use super::events::{DrainReport, RelayEvent};

/// Failure surfaced by the relay runtime.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Backlog operation failed.
    #[error(transparent)]
    Backlog(#[from] BacklogError),
    /// The runtime tasks are gone.
    #[error("relay runtime has stopped")]
    ChannelClosed,
}

/// Tuning for the relay runtime.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Persist records but never attempt delivery.
    pub offline: bool,
    /// Walk the existing backlog before serving live records.
    pub drain_on_start: bool,
    /// Capacity of the listener -> persist queue.
    pub persist_queue_bound: usize,
    /// Upper bound on one delivery attempt.
    pub attempt_timeout: Duration,
    /// Re-walk the backlog this often while running.
    pub retry_interval: Option<Duration>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            offline: false,
            drain_on_start: true,
            persist_queue_bound: 64,
            attempt_timeout: Duration::from_secs(30),
            retry_interval: None,
        }
    }
}

/// Cloneable handle to a running relay.
#[derive(Clone)]
pub struct RelayHandle {
    persist_tx: mpsc::Sender<StageMsg>,
    events_tx: broadcast::Sender<RelayEvent>,
    drained_rx: watch::Receiver<Option<DrainReport>>,
    backlog: SharedBacklog,
}

/// Records accepted by the persist stage that the delivery worker has not
/// picked up yet. Periodic re-drains leave these to the queue.
#[derive(Default)]
struct Queued(Mutex<HashMap<LogRecord, usize>>);

impl Queued {
    fn enter(&self, record: &LogRecord) {
        let mut map = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        *map.entry(record.clone()).or_insert(0) += 1;
    }

    fn leave(&self, record: &LogRecord) {
        let mut map = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(n) = map.get_mut(record) {
            *n -= 1;
            if *n == 0 {
                map.remove(record);
            }
        }
    }

    fn contains(&self, record: &LogRecord) -> bool {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(record)
    }
}

enum StageMsg {
    Record(LogRecord),
    Shutdown {
        resp: oneshot::Sender<Result<(), RuntimeError>>,
    },
}

enum DeliveryMsg {
    Record(LogRecord),
    Shutdown {
        resp: oneshot::Sender<Result<(), RuntimeError>>,
    },
}

/// Starts the persist stage and the delivery worker over `backlog`.
///
/// Entries already in the backlog are snapshotted here and drained by the
/// delivery worker before it serves live records.
pub async fn spawn_relay<U: Uploader>(
    backlog: Box<dyn Backlog>,
    uploader: U,
    config: RuntimeConfig,
) -> Result<RelayHandle, RuntimeError> {
    let backlog = backlog::shared(backlog);
    let pending = run_blocking(&backlog, |b| b.list()).await?;
    if !pending.is_empty() {
        info!(pending = pending.len(), "backlog holds records from an earlier run");
    }

    let (persist_tx, persist_rx) = mpsc::channel::<StageMsg>(config.persist_queue_bound.max(1));
    let (delivery_tx, delivery_rx) = mpsc::unbounded_channel::<DeliveryMsg>();
    let (events_tx, _) = broadcast::channel::<RelayEvent>(1024);
    let (drained_tx, drained_rx) = watch::channel(None);
    let queued = Arc::new(Queued::default());

    tokio::spawn(persist_stage(
        Arc::clone(&backlog),
        Arc::clone(&queued),
        persist_rx,
        delivery_tx,
        events_tx.clone(),
    ));
    tokio::spawn(delivery_worker(
        uploader,
        Arc::clone(&backlog),
        events_tx.clone(),
        config,
        pending,
        queued,
        delivery_rx,
        drained_tx,
    ));

    Ok(RelayHandle {
        persist_tx,
        events_tx,
        drained_rx,
        backlog,
    })
}

/// Attempts every record currently in `backlog`, in listed order.
///
/// Does nothing in offline mode. Identical payloads are attempted once.
pub async fn drain_backlog<U: Uploader>(
    backlog: &SharedBacklog,
    uploader: &U,
    config: &RuntimeConfig,
) -> Result<DrainReport, RuntimeError> {
    if config.offline {
        return Ok(DrainReport::default());
    }
    let pending = run_blocking(backlog, |b| b.list()).await?;
    let (events_tx, _) = broadcast::channel(16);
    let delivery = Delivery {
        uploader,
        backlog,
        events_tx: &events_tx,
        config,
    };
    Ok(delivery.drain(pending).await)
}

impl RelayHandle {
    /// Subscribes to [`RelayEvent`]s emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.events_tx.subscribe()
    }

    /// Queues a decoded record for persistence and delivery.
    pub async fn submit(&self, record: LogRecord) -> Result<(), RuntimeError> {
        self.persist_tx
            .send(StageMsg::Record(record))
            .await
            .map_err(|_| RuntimeError::ChannelClosed)
    }

    /// Decodes `datagram` and queues the record it carries, if any.
    pub async fn submit_frame(&self, datagram: &[u8]) -> Result<bool, RuntimeError> {
        match decode_frame(datagram) {
            Some(record) => self.submit(record).await.map(|()| true),
            None => Ok(false),
        }
    }

    /// Current backlog contents.
    pub async fn pending(&self) -> Result<Vec<LogRecord>, RuntimeError> {
        Ok(run_blocking(&self.backlog, |b| b.list()).await?)
    }

    /// Waits for the startup drain to finish and returns its totals.
    pub async fn startup_drain(&self) -> Result<DrainReport, RuntimeError> {
        let mut rx = self.drained_rx.clone();
        let report = *rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| RuntimeError::ChannelClosed)?;
        Ok(report.unwrap_or_default())
    }

    /// Finishes everything already queued, then closes the backlog.
    pub async fn shutdown(&self) -> Result<(), RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.persist_tx
            .send(StageMsg::Shutdown { resp: tx })
            .await
            .map_err(|_| RuntimeError::ChannelClosed)?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)?
    }
}

async fn persist_stage(
    backlog: SharedBacklog,
    queued: Arc<Queued>,
    mut rx: mpsc::Receiver<StageMsg>,
    delivery_tx: mpsc::UnboundedSender<DeliveryMsg>,
    events_tx: broadcast::Sender<RelayEvent>,
) {
    while let Some(msg) = rx.recv().await {
        match msg {
            StageMsg::Record(record) => {
                queued.enter(&record);
                let target = record.clone();
                match run_blocking(&backlog, move |b| b.add(&target)).await {
                    Ok(()) => {
                        debug!(bytes = record.len(), "record persisted");
                        let _ = events_tx.send(RelayEvent::Persisted {
                            record: record.clone(),
                        });
                    }
                    Err(err) => {
                        error!(
                            error = %err,
                            "Failed to capture record in the backlog. It is printed here so that you can enter it manually:\n{record}"
                        );
                        let _ = events_tx.send(RelayEvent::PersistFailed {
                            record: record.clone(),
                            error: err.to_string(),
                        });
                    }
                }
                if delivery_tx.send(DeliveryMsg::Record(record)).is_err() {
                    error!("delivery worker stopped; persist stage exiting");
                    break;
                }
            }
            StageMsg::Shutdown { resp } => {
                if let Err(mpsc::error::SendError(DeliveryMsg::Shutdown { resp })) =
                    delivery_tx.send(DeliveryMsg::Shutdown { resp })
                {
                    let _ = resp.send(Err(RuntimeError::ChannelClosed));
                }
                break;
            }
        }
    }
}

async fn delivery_worker<U: Uploader>(
    uploader: U,
    backlog: SharedBacklog,
    events_tx: broadcast::Sender<RelayEvent>,
    config: RuntimeConfig,
    startup: Vec<LogRecord>,
    queued: Arc<Queued>,
    mut rx: mpsc::UnboundedReceiver<DeliveryMsg>,
    drained_tx: watch::Sender<Option<DrainReport>>,
) {
    let delivery = Delivery {
        uploader: &uploader,
        backlog: &backlog,
        events_tx: &events_tx,
        config: &config,
    };

    let report = if config.offline {
        if !startup.is_empty() {
            info!(pending = startup.len(), "offline; backlog records stay pending");
        }
        DrainReport::default()
    } else if config.drain_on_start {
        delivery.drain(startup).await
    } else {
        DrainReport::default()
    };
    let _ = drained_tx.send(Some(report));

    let mut retry = config
        .retry_interval
        .filter(|_| !config.offline)
        .map(|period| {
            let mut timer = time::interval_at(Instant::now() + period, period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            timer
        });

    loop {
        tokio::select! {
            msg = rx.recv() => {
                match msg {
                    Some(DeliveryMsg::Record(record)) => {
                        queued.leave(&record);
                        if config.offline {
                            delivery.defer(record);
                        } else {
                            delivery.deliver(&record).await;
                        }
                    }
                    Some(DeliveryMsg::Shutdown { resp }) => {
                        let _ = resp.send(close_backlog(&backlog).await);
                        break;
                    }
                    None => {
                        if let Err(err) = close_backlog(&backlog).await {
                            error!(error = %err, "closing backlog failed");
                        }
                        break;
                    }
                }
            }
            _ = tick(&mut retry) => {
                match run_blocking(&backlog, |b| b.list()).await {
                    Ok(pending) => {
                        let total = pending.len();
                        let due: Vec<LogRecord> =
                            pending.into_iter().filter(|r| !queued.contains(r)).collect();
                        if due.len() < total {
                            debug!(
                                skipped = total - due.len(),
                                "leaving queued records to the live path"
                            );
                        }
                        delivery.drain(due).await;
                    }
                    Err(err) => error!(error = %err, "could not list backlog for retry"),
                }
            }
        }
    }
    info!("delivery worker stopped");
}

async fn tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

async fn close_backlog(backlog: &SharedBacklog) -> Result<(), RuntimeError> {
    run_blocking(backlog, |b| b.close()).await?;
    debug!("backlog closed");
    Ok(())
}

struct Delivery<'a, U> {
    uploader: &'a U,
    backlog: &'a SharedBacklog,
    events_tx: &'a broadcast::Sender<RelayEvent>,
    config: &'a RuntimeConfig,
}

impl<U: Uploader> Delivery<'_, U> {
    async fn drain(&self, pending: Vec<LogRecord>) -> DrainReport {
        let mut report = DrainReport::default();
        if pending.is_empty() {
            return report;
        }

        info!(
            pending = pending.len(),
            "attempting to upload backlog entries to the logbook"
        );
        let mut seen = HashSet::new();
        for record in pending {
            if !seen.insert(record.clone()) {
                continue;
            }
            report.attempted += 1;
            if self.deliver(&record).await.is_confirmed() {
                report.purged += 1;
            } else {
                report.retained += 1;
            }
        }

        info!(
            attempted = report.attempted,
            purged = report.purged,
            retained = report.retained,
            "backlog pass finished"
        );
        let _ = self.events_tx.send(RelayEvent::DrainComplete { report });
        report
    }

    async fn deliver(&self, record: &LogRecord) -> DeliveryOutcome {
        let limit = self.config.attempt_timeout;
        let outcome = match time::timeout(limit, self.uploader.upload(record)).await {
            Ok(outcome) => outcome,
            Err(_) => DeliveryOutcome::Transient {
                error: format!("no reply within {limit:?}"),
            },
        };

        match &outcome {
            DeliveryOutcome::Delivered { log_id } => {
                info!(log_id = %log_id, "Logged:\n{record}");
                if self.purge(record).await {
                    let _ = self.events_tx.send(RelayEvent::Delivered {
                        record: record.clone(),
                        log_id: log_id.clone(),
                    });
                }
            }
            DeliveryOutcome::AlreadyLogged { reason } => {
                info!(reason = %reason, "logbook already holds this record:\n{record}");
                if self.purge(record).await {
                    let _ = self.events_tx.send(RelayEvent::AlreadyLogged {
                        record: record.clone(),
                    });
                }
            }
            DeliveryOutcome::Rejected { reason } => {
                warn!(
                    reason = %reason,
                    "logbook rejected record; it stays in the backlog:\n{record}"
                );
                self.retain(record, &outcome);
            }
            DeliveryOutcome::Transient { error } => {
                warn!(
                    error = %error,
                    "upload failed; record stays in the backlog and will be retried:\n{record}"
                );
                self.retain(record, &outcome);
            }
        }
        outcome
    }

    fn retain(&self, record: &LogRecord, outcome: &DeliveryOutcome) {
        let _ = self.events_tx.send(RelayEvent::Retained {
            record: record.clone(),
            outcome: outcome.clone(),
        });
    }

    fn defer(&self, record: LogRecord) {
        debug!(bytes = record.len(), "offline; record left in backlog");
        let _ = self.events_tx.send(RelayEvent::Deferred { record });
    }

    async fn purge(&self, record: &LogRecord) -> bool {
        let target = record.clone();
        match run_blocking(self.backlog, move |b| b.remove(&target)).await {
            Ok(removed) => {
                debug!(removed, "purged from backlog");
                true
            }
            Err(err) => {
                error!(
                    error = %err,
                    "record could not be deleted from backlog - it may be uploaded more than once as a result:\n{record}"
                );
                let _ = self.events_tx.send(RelayEvent::PurgeFailed {
                    record: record.clone(),
                    error: err.to_string(),
                });
                false
            }
        }
    }
}
