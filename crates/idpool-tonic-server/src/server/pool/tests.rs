use crate::server::{
    pool::{manager::WorkerPool, worker::worker_loop},
    service::backend::{Orchestrator, in_memory_orchestrator},
};
use core::time::Duration;
use futures::future::join_all;
use idpool_tonic_core::{
    Error,
    idpool::{
        DispatchRequest, DispatchSettings, Envelope, LockCoordinator, LockOutcome, LockSettings,
        MemoryStore,
    },
};
use std::{collections::HashSet, sync::Arc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

struct Harness {
    pool: Arc<WorkerPool>,
    orchestrator: Arc<Orchestrator>,
    _events: mpsc::Receiver<Envelope>,
}

fn harness(ids: usize, lock: LockSettings, dispatch_timeout: Duration) -> Harness {
    let store = Arc::new(MemoryStore::from_ids(
        (0..ids).map(|i| format!("ID-{i:05}")),
    ));
    let (orchestrator, events) = in_memory_orchestrator(
        store,
        DispatchSettings {
            limit: 1_000,
            db_fetch_limit: ids.max(1),
            ..DispatchSettings::default()
        },
        lock,
        4 * ids.max(1),
        Duration::from_secs(1),
    );
    let orchestrator = Arc::new(orchestrator);

    let mut workers = Vec::new();
    for worker_id in 0..4 {
        let (tx, rx) = mpsc::channel(8);
        workers.push(tx);
        tokio::spawn(worker_loop(
            worker_id,
            rx,
            Arc::clone(&orchestrator),
            dispatch_timeout,
        ));
    }

    Harness {
        pool: Arc::new(WorkerPool::new(
            workers,
            CancellationToken::new(),
            Duration::from_secs(1),
        )),
        orchestrator,
        _events: events,
    }
}

fn no_retry() -> LockSettings {
    LockSettings {
        retry_attempts: 0,
        ..LockSettings::default()
    }
}

#[tokio::test]
async fn dispatch_round_trips_through_a_worker() {
    let h = harness(10, no_retry(), Duration::from_secs(5));

    let response = h
        .pool
        .dispatch(DispatchRequest::new("user-1", "device-1", 3))
        .await
        .unwrap();

    assert_eq!(
        response.id_values().collect::<Vec<_>>(),
        ["ID-00000", "ID-00001", "ID-00002"]
    );
    assert_eq!(response.fetch_limit, 997);
    assert_eq!(h.pool.inflight(), 0);
}

#[tokio::test]
async fn domain_errors_pass_through_unchanged() {
    let h = harness(2, no_retry(), Duration::from_secs(5));

    let err = h
        .pool
        .dispatch(DispatchRequest::new("user-1", "device-1", 5))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        Error::Dispatch(idpool_tonic_core::idpool::Error::NoIdsAvailable { .. })
    ));
    assert_eq!(err.code(), "NO_IDS_AVAILABLE");
}

#[tokio::test]
async fn slow_dispatch_hits_the_deadline() {
    // Three retries starting at 100ms back off for 700ms, far past the
    // 20ms deadline.
    let h = harness(
        4,
        LockSettings {
            lease: Duration::from_secs(30),
            retry_attempts: 3,
            retry_backoff: Duration::from_millis(100),
        },
        Duration::from_millis(20),
    );

    // Hold the first ID so the dispatch keeps retrying.
    let outcome = h
        .orchestrator
        .locks()
        .acquire(&["ID-00000".to_string()])
        .await
        .unwrap();
    assert!(matches!(outcome, LockOutcome::Acquired(_)));

    let err = h
        .pool
        .dispatch(DispatchRequest::new("user-1", "device-1", 1))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::DeadlineExceeded { timeout_ms: 20 }));
    assert_eq!(h.pool.inflight(), 0);
}

#[tokio::test]
async fn ids_stranded_by_the_deadline_come_back_after_the_lease() {
    let lock = LockSettings {
        lease: Duration::from_millis(100),
        retry_attempts: 3,
        retry_backoff: Duration::from_millis(20),
    };
    let h = harness(1, lock, Duration::from_millis(10));

    let keys = ["ID-00000".to_string()];
    let LockOutcome::Acquired(lease) = h.orchestrator.locks().acquire(&keys).await.unwrap() else {
        panic!("lock should be free");
    };
    let err = h
        .pool
        .dispatch(DispatchRequest::new("user-1", "device-1", 1))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::DeadlineExceeded { .. }));
    h.orchestrator.locks().release(&lease).await.unwrap();

    // Still claimed by the cancelled attempt.
    let err = h
        .pool
        .dispatch(DispatchRequest::new("user-2", "device-1", 1))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "NO_IDS_AVAILABLE");

    tokio::time::sleep(Duration::from_millis(150)).await;
    let response = h
        .pool
        .dispatch(DispatchRequest::new("user-2", "device-1", 1))
        .await
        .unwrap();
    assert_eq!(response.id_values().collect::<Vec<_>>(), ["ID-00000"]);
}

#[tokio::test]
async fn concurrent_dispatches_never_share_ids() {
    let h = harness(200, no_retry(), Duration::from_secs(5));

    let results = join_all((0..20).map(|i| {
        let pool = Arc::clone(&h.pool);
        async move {
            // Contention is expected; retry until the request lands.
            loop {
                match pool
                    .dispatch(DispatchRequest::new(format!("user-{i}"), "device", 5))
                    .await
                {
                    Ok(response) => return response,
                    Err(Error::Dispatch(e)) if e.is_retryable() => tokio::task::yield_now().await,
                    Err(e) => panic!("unexpected error: {e}"),
                }
            }
        }
    }))
    .await;

    let mut seen = HashSet::new();
    for response in &results {
        assert_eq!(response.ids.len(), 5);
        for id in response.id_values() {
            assert!(seen.insert(id.to_string()), "{id} dispatched twice");
        }
    }
    assert_eq!(seen.len(), 100);
}

#[tokio::test]
async fn shutdown_refuses_new_work() {
    let h = harness(10, no_retry(), Duration::from_secs(5));

    h.pool.shutdown().await.unwrap();
    assert!(h.pool.is_shutting_down());

    let err = h
        .pool
        .dispatch(DispatchRequest::new("user-1", "device-1", 1))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ServiceShutdown));
}

#[tokio::test]
async fn round_robin_wraps_around() {
    let h = harness(1, no_retry(), Duration::from_secs(5));
    let picks: Vec<_> = (0..6).map(|_| h.pool.next_worker_index()).collect();
    assert_eq!(picks, [0, 1, 2, 3, 0, 1]);
}
