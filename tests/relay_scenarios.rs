mod common;

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use tempfile::TempDir;
use tokio::net::UdpSocket;

use qsorelay::{
    backlog::{self, Backlog, BacklogError, file::FileBacklog, sqlite::SqliteBacklog},
    decode::encode_logged_adif,
    delivery::DeliveryOutcome,
    runtime::{
        events::{DrainReport, RelayEvent},
        handle::{RuntimeConfig, RuntimeError, drain_backlog, spawn_relay},
        listener::{bind, run_listener},
    },
};

use common::{
    FailingBacklog, StubUploader, already_logged, delivered, rec, rejected, transient,
    wait_for_event,
};

fn seeded_sqlite(tmp: &TempDir, payloads: &[&str]) -> std::path::PathBuf {
    let path = tmp.path().join("state").join("backlog.sqlite3");
    let mut b = SqliteBacklog::open(&path).expect("open sqlite");
    for p in payloads {
        b.add(&rec(p)).expect("seed");
    }
    path
}

#[tokio::test]
async fn startup_drain_purges_delivered_record() {
    let tmp = TempDir::new().expect("tmp");
    let path = seeded_sqlite(&tmp, &["R1"]);

    let stub = StubUploader::always(delivered("1001"));
    let calls = stub.calls();
    let backlog = SqliteBacklog::open(&path).expect("reopen");
    let handle = spawn_relay(Box::new(backlog), stub, RuntimeConfig::default())
        .await
        .expect("spawn");

    let report = handle.startup_drain().await.expect("drain");
    assert_eq!(
        report,
        DrainReport {
            attempted: 1,
            purged: 1,
            retained: 0
        }
    );
    assert!(handle.pending().await.expect("pending").is_empty());
    assert_eq!(*calls.lock().expect("lock"), vec![rec("R1")]);

    handle.shutdown().await.expect("shutdown");
    let reopened = SqliteBacklog::open(&path).expect("reopen");
    assert!(reopened.list().expect("list").is_empty());
}

#[tokio::test]
async fn transient_failure_leaves_live_record_pending() {
    let tmp = TempDir::new().expect("tmp");
    let path = tmp.path().join("backlog.adi");

    let stub = StubUploader::always(transient());
    let calls = stub.calls();
    let handle = spawn_relay(
        Box::new(FileBacklog::open(&path).expect("open")),
        stub,
        RuntimeConfig::default(),
    )
    .await
    .expect("spawn");
    let mut sub = handle.subscribe();

    let frame = encode_logged_adif(2, "WSJT-X", "R2");
    assert!(handle.submit_frame(&frame).await.expect("submit"));

    let seen = wait_for_event(&mut sub, |e| matches!(e, RelayEvent::Retained { .. })).await;
    assert_eq!(seen[0], RelayEvent::Persisted { record: rec("R2") });
    assert_eq!(
        seen.last(),
        Some(&RelayEvent::Retained {
            record: rec("R2"),
            outcome: transient()
        })
    );
    assert_eq!(handle.pending().await.expect("pending"), vec![rec("R2")]);
    assert_eq!(calls.lock().expect("lock").len(), 1);

    handle.shutdown().await.expect("shutdown");
    let reopened = FileBacklog::open(&path).expect("reopen");
    assert_eq!(reopened.list().expect("list"), vec![rec("R2")]);
}

#[tokio::test]
async fn duplicate_reply_counts_as_delivered() {
    let tmp = TempDir::new().expect("tmp");
    let path = seeded_sqlite(&tmp, &["R3"]);

    let handle = spawn_relay(
        Box::new(SqliteBacklog::open(&path).expect("open")),
        StubUploader::always(already_logged()),
        RuntimeConfig::default(),
    )
    .await
    .expect("spawn");

    let report = handle.startup_drain().await.expect("drain");
    assert_eq!(report.purged, 1);
    assert!(handle.pending().await.expect("pending").is_empty());
    handle.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn draining_an_empty_backlog_makes_no_calls() {
    let shared = backlog::shared(Box::new(SqliteBacklog::open_in_memory().expect("open")));
    let stub = StubUploader::always(delivered("1"));
    let calls = stub.calls();
    let cfg = RuntimeConfig::default();

    for _ in 0..2 {
        let report = drain_backlog(&shared, &stub, &cfg).await.expect("drain");
        assert_eq!(report, DrainReport::default());
    }
    assert!(calls.lock().expect("lock").is_empty());
}

#[tokio::test]
async fn drain_keeps_going_past_failures_in_order() {
    let shared = backlog::shared(Box::new(SqliteBacklog::open_in_memory().expect("open")));
    {
        let mut b = shared.lock().await;
        for p in ["A", "B", "C", "D"] {
            b.add(&rec(p)).expect("seed");
        }
    }

    let stub = StubUploader::with(|r| match r.payload() {
        "B" => transient(),
        "C" => rejected(),
        _ => delivered("7"),
    });
    let calls = stub.calls();

    let report = drain_backlog(&shared, &stub, &RuntimeConfig::default())
        .await
        .expect("drain");
    assert_eq!(
        report,
        DrainReport {
            attempted: 4,
            purged: 2,
            retained: 2
        }
    );
    assert_eq!(
        *calls.lock().expect("lock"),
        vec![rec("A"), rec("B"), rec("C"), rec("D")]
    );
    assert_eq!(
        shared.lock().await.list().expect("list"),
        vec![rec("B"), rec("C")]
    );
}

#[tokio::test]
async fn identical_entries_are_attempted_once() {
    let shared = backlog::shared(Box::new(SqliteBacklog::open_in_memory().expect("open")));
    {
        let mut b = shared.lock().await;
        b.add(&rec("same")).expect("seed");
        b.add(&rec("same")).expect("seed");
    }
    let stub = StubUploader::always(delivered("9"));
    let calls = stub.calls();

    let report = drain_backlog(&shared, &stub, &RuntimeConfig::default())
        .await
        .expect("drain");
    assert_eq!(report.attempted, 1);
    assert_eq!(calls.lock().expect("lock").len(), 1);
    assert!(shared.lock().await.list().expect("list").is_empty());
}

#[tokio::test]
async fn record_is_on_disk_before_upload_starts() {
    let tmp = TempDir::new().expect("tmp");
    let path = tmp.path().join("backlog.adi");
    let observed = Arc::new(Mutex::new(Vec::new()));

    let probe_path = path.clone();
    let probe = Arc::clone(&observed);
    let stub = StubUploader::with(move |r| {
        let on_disk = FileBacklog::open(&probe_path)
            .and_then(|b| b.list())
            .map(|l| l.contains(r))
            .unwrap_or(false);
        probe.lock().expect("lock").push(on_disk);
        delivered("42")
    });

    let handle = spawn_relay(
        Box::new(FileBacklog::open(&path).expect("open")),
        stub,
        RuntimeConfig::default(),
    )
    .await
    .expect("spawn");
    let mut sub = handle.subscribe();

    handle.submit(rec("<call:5>K1ABC <eor>")).await.expect("submit");
    wait_for_event(&mut sub, |e| matches!(e, RelayEvent::Delivered { .. })).await;

    assert_eq!(*observed.lock().expect("lock"), vec![true]);
    assert!(handle.pending().await.expect("pending").is_empty());
    handle.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn live_records_are_attempted_in_arrival_order() {
    let stub = StubUploader::always(delivered("1"));
    let calls = stub.calls();
    let handle = spawn_relay(
        Box::new(SqliteBacklog::open_in_memory().expect("open")),
        stub,
        RuntimeConfig::default(),
    )
    .await
    .expect("spawn");
    let mut sub = handle.subscribe();

    for i in 0..5 {
        handle.submit(rec(&format!("R{i}"))).await.expect("submit");
    }
    let mut delivered_count = 0;
    wait_for_event(&mut sub, |e| {
        if matches!(e, RelayEvent::Delivered { .. }) {
            delivered_count += 1;
        }
        delivered_count == 5
    })
    .await;

    let expected: Vec<_> = (0..5).map(|i| rec(&format!("R{i}"))).collect();
    assert_eq!(*calls.lock().expect("lock"), expected);
    handle.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn offline_mode_persists_without_attempts() {
    let tmp = TempDir::new().expect("tmp");
    let path = seeded_sqlite(&tmp, &["old"]);

    let stub = StubUploader::always(delivered("1"));
    let calls = stub.calls();
    let cfg = RuntimeConfig {
        offline: true,
        ..RuntimeConfig::default()
    };
    let handle = spawn_relay(Box::new(SqliteBacklog::open(&path).expect("open")), stub, cfg)
        .await
        .expect("spawn");
    let mut sub = handle.subscribe();

    assert_eq!(handle.startup_drain().await.expect("drain"), DrainReport::default());
    handle.submit(rec("new")).await.expect("submit");
    wait_for_event(&mut sub, |e| matches!(e, RelayEvent::Deferred { .. })).await;

    assert!(calls.lock().expect("lock").is_empty());
    assert_eq!(
        handle.pending().await.expect("pending"),
        vec![rec("old"), rec("new")]
    );
    handle.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn hung_upload_times_out_as_transient() {
    let stub = StubUploader::always(delivered("1")).slow(Duration::from_secs(5));
    let cfg = RuntimeConfig {
        attempt_timeout: Duration::from_millis(50),
        ..RuntimeConfig::default()
    };
    let handle = spawn_relay(
        Box::new(SqliteBacklog::open_in_memory().expect("open")),
        stub,
        cfg,
    )
    .await
    .expect("spawn");
    let mut sub = handle.subscribe();

    handle.submit(rec("slow")).await.expect("submit");
    let seen = wait_for_event(&mut sub, |e| matches!(e, RelayEvent::Retained { .. })).await;
    let Some(RelayEvent::Retained { outcome, .. }) = seen.last() else {
        panic!("expected retained event");
    };
    assert!(matches!(outcome, DeliveryOutcome::Transient { .. }));
    assert_eq!(handle.pending().await.expect("pending"), vec![rec("slow")]);
    handle.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn retry_interval_redelivers_pending_records() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&attempts);
    let stub = StubUploader::with(move |_| {
        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
            transient()
        } else {
            delivered("5")
        }
    });
    let cfg = RuntimeConfig {
        retry_interval: Some(Duration::from_millis(50)),
        ..RuntimeConfig::default()
    };
    let handle = spawn_relay(
        Box::new(SqliteBacklog::open_in_memory().expect("open")),
        stub,
        cfg,
    )
    .await
    .expect("spawn");
    let mut sub = handle.subscribe();

    handle.submit(rec("retry-me")).await.expect("submit");
    wait_for_event(&mut sub, |e| matches!(e, RelayEvent::Delivered { .. })).await;

    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert!(handle.pending().await.expect("pending").is_empty());
    handle.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn shutdown_closes_backlog_and_stops_intake() {
    let handle = spawn_relay(
        Box::new(SqliteBacklog::open_in_memory().expect("open")),
        StubUploader::always(delivered("1")),
        RuntimeConfig::default(),
    )
    .await
    .expect("spawn");

    handle.shutdown().await.expect("shutdown");
    assert!(matches!(
        handle.pending().await,
        Err(RuntimeError::Backlog(BacklogError::Closed))
    ));
    assert!(matches!(
        handle.submit(rec("late")).await,
        Err(RuntimeError::ChannelClosed)
    ));
}

#[tokio::test]
async fn malformed_frames_never_reach_the_backlog() {
    let handle = spawn_relay(
        Box::new(SqliteBacklog::open_in_memory().expect("open")),
        StubUploader::always(delivered("1")),
        RuntimeConfig::default(),
    )
    .await
    .expect("spawn");

    let mut frame = encode_logged_adif(2, "WSJT-X", "R9");
    frame.truncate(frame.len() - 1);
    assert!(!handle.submit_frame(&frame).await.expect("submit"));
    assert!(!handle.submit_frame(b"garbage").await.expect("submit"));
    assert!(handle.pending().await.expect("pending").is_empty());
    handle.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn failed_persist_is_reported_and_earlier_entries_survive() {
    let (backlog, faults) = FailingBacklog::new();
    let stub = StubUploader::always(transient());
    let calls = stub.calls();
    let handle = spawn_relay(Box::new(backlog), stub, RuntimeConfig::default())
        .await
        .expect("spawn");
    let mut sub = handle.subscribe();

    handle.submit(rec("first")).await.expect("submit");
    wait_for_event(&mut sub, |e| matches!(e, RelayEvent::Retained { .. })).await;

    faults.set_add(true);
    handle.submit(rec("second")).await.expect("submit");
    let seen = wait_for_event(&mut sub, |e| matches!(e, RelayEvent::Retained { .. })).await;
    assert!(
        matches!(
            &seen[0],
            RelayEvent::PersistFailed { record, error }
                if *record == rec("second") && error.contains("no space left")
        ),
        "{seen:?}"
    );
    assert_eq!(handle.pending().await.expect("pending"), vec![rec("first")]);
    // Delivery is still attempted once for the record that could not be stored.
    assert_eq!(
        *calls.lock().expect("lock"),
        vec![rec("first"), rec("second")]
    );

    faults.set_add(false);
    handle.submit(rec("third")).await.expect("submit");
    let seen = wait_for_event(&mut sub, |e| matches!(e, RelayEvent::Retained { .. })).await;
    assert_eq!(seen[0], RelayEvent::Persisted { record: rec("third") });
    assert_eq!(
        handle.pending().await.expect("pending"),
        vec![rec("first"), rec("third")]
    );

    handle.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn failed_purge_keeps_record_pending_and_relay_running() {
    let (backlog, faults) = FailingBacklog::new();
    faults.set_remove(true);
    let handle = spawn_relay(
        Box::new(backlog),
        StubUploader::always(delivered("9")),
        RuntimeConfig::default(),
    )
    .await
    .expect("spawn");
    let mut sub = handle.subscribe();

    let socket = bind("127.0.0.1:0").await.expect("bind");
    let addr = socket.local_addr().expect("addr");
    let listener = tokio::spawn(run_listener(socket, None, handle.clone()));
    let sender = UdpSocket::bind("127.0.0.1:0").await.expect("sender");

    sender
        .send_to(&encode_logged_adif(2, "WSJT-X", "stuck"), addr)
        .await
        .expect("send");
    let seen = wait_for_event(&mut sub, |e| matches!(e, RelayEvent::PurgeFailed { .. })).await;
    assert_eq!(seen[0], RelayEvent::Persisted { record: rec("stuck") });
    assert!(
        !seen.iter().any(|e| matches!(e, RelayEvent::Delivered { .. })),
        "{seen:?}"
    );
    assert!(matches!(
        seen.last(),
        Some(RelayEvent::PurgeFailed { record, .. }) if *record == rec("stuck")
    ));
    assert_eq!(handle.pending().await.expect("pending"), vec![rec("stuck")]);

    faults.set_remove(false);
    sender
        .send_to(&encode_logged_adif(2, "WSJT-X", "next"), addr)
        .await
        .expect("send");
    let seen = wait_for_event(&mut sub, |e| matches!(e, RelayEvent::Delivered { .. })).await;
    assert!(matches!(
        seen.last(),
        Some(RelayEvent::Delivered { record, log_id }) if *record == rec("next") && log_id == "9"
    ));
    assert_eq!(handle.pending().await.expect("pending"), vec![rec("stuck")]);
    assert!(!listener.is_finished());

    handle.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn periodic_redrain_leaves_queued_records_to_the_live_path() {
    let stub = StubUploader::always(delivered("7")).slow(Duration::from_millis(40));
    let calls = stub.calls();
    let cfg = RuntimeConfig {
        retry_interval: Some(Duration::from_millis(5)),
        ..RuntimeConfig::default()
    };
    let handle = spawn_relay(
        Box::new(SqliteBacklog::open_in_memory().expect("open")),
        stub,
        cfg,
    )
    .await
    .expect("spawn");
    let mut sub = handle.subscribe();

    let records: Vec<_> = (0..6).map(|i| rec(&format!("Q{i}"))).collect();
    for r in &records {
        handle.submit(r.clone()).await.expect("submit");
    }

    let mut confirmed = 0;
    wait_for_event(&mut sub, |e| {
        if matches!(e, RelayEvent::Delivered { .. }) {
            confirmed += 1;
        }
        confirmed == records.len()
    })
    .await;

    assert_eq!(*calls.lock().expect("lock"), records);
    assert!(handle.pending().await.expect("pending").is_empty());
    handle.shutdown().await.expect("shutdown");
}
