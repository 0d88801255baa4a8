//! Consumer side of the dispatch event channel.
//!
//! Every [`Envelope`] is logged as a JSON line. Pool status updates are also
//! written back to the [`MemoryStore`] and dispatch logs are appended to its
//! per-pair history, standing in for the downstream writers that keep the
//! durable store in step with the cache.

use crate::server::telemetry::increment_status_updates_applied;
use idpool_tonic_core::idpool::{Envelope, EventPayload, MemoryStore};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Drains `events` until the channel closes or `token` is cancelled, then
/// processes whatever is already buffered. Returns the number of envelopes
/// handled.
pub async fn event_sink(
    mut events: mpsc::Receiver<Envelope>,
    store: Arc<MemoryStore>,
    token: CancellationToken,
) -> usize {
    let mut handled = 0;

    loop {
        tokio::select! {
            biased;
            maybe = events.recv() => match maybe {
                Some(envelope) => {
                    apply(&store, &envelope);
                    handled += 1;
                }
                None => break,
            },
            () = token.cancelled() => {
                events.close();
                while let Some(envelope) = events.recv().await {
                    apply(&store, &envelope);
                    handled += 1;
                }
                break;
            }
        }
    }

    #[cfg(feature = "tracing")]
    tracing::info!("Event sink stopped after {handled} events");
    handled
}

/// Applies one envelope and returns how many store records changed.
fn apply(store: &MemoryStore, envelope: &Envelope) -> usize {
    match serde_json::to_string(envelope) {
        Ok(_line) => {
            #[cfg(feature = "tracing")]
            tracing::info!(topic = %envelope.topic, kind = envelope.payload.kind(), "{_line}");
        }
        Err(_e) => {
            #[cfg(feature = "tracing")]
            tracing::error!(topic = %envelope.topic, "Failed to encode event: {_e}");
        }
    }

    match &envelope.payload {
        EventPayload::PoolStatusUpdate(entries) => {
            let changed = store.apply_status(entries);
            increment_status_updates_applied(changed as u64);
            changed
        }
        EventPayload::DispatchLog(records) => store.record_dispatches(records),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use idpool_tonic_core::idpool::{
        AllocationQuery, DispatchedIdRecord, DurableStore, IdStatus, PoolStatusEntry, Topics,
    };

    fn status_update(ids: &[&str]) -> Envelope {
        Envelope {
            topic: Topics::default().pool_status,
            payload: EventPayload::PoolStatusUpdate(
                ids.iter()
                    .map(|id| PoolStatusEntry::new(*id, IdStatus::Dispatched))
                    .collect(),
            ),
        }
    }

    fn audit_log(id: &str) -> Envelope {
        Envelope {
            topic: Topics::default().dispatch_log,
            payload: EventPayload::DispatchLog(vec![DispatchedIdRecord {
                id: id.to_string(),
                requester_id: "user-1".into(),
                device_id: "device-1".into(),
                device_info: serde_json::Value::Null,
                status: IdStatus::Dispatched,
                dispatched_at: 1,
            }]),
        }
    }

    #[tokio::test]
    async fn writes_status_updates_back_to_the_store() {
        let store = Arc::new(MemoryStore::from_ids(["A", "B", "C"]));
        let (tx, rx) = mpsc::channel(8);
        let sink = tokio::spawn(event_sink(rx, Arc::clone(&store), CancellationToken::new()));

        tx.send(status_update(&["A", "B"])).await.unwrap();
        tx.send(audit_log("A")).await.unwrap();
        drop(tx);

        assert_eq!(sink.await.unwrap(), 2);
        assert_eq!(store.count_by_status(IdStatus::Dispatched), 2);
        assert_eq!(store.count_by_status(IdStatus::Unassigned), 1);
    }

    #[tokio::test]
    async fn dispatch_logs_become_the_pair_history() {
        let store = MemoryStore::from_ids(["A", "B"]);
        assert_eq!(apply(&store, &status_update(&["A"])), 1);
        assert_eq!(apply(&store, &audit_log("A")), 1);
        // Replays are absorbed.
        assert_eq!(apply(&store, &audit_log("A")), 0);

        let page = store
            .dispatched_to(&AllocationQuery::new("user-1", "device-1"))
            .await
            .unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.records[0].id, "A");
    }

    #[tokio::test]
    async fn cancellation_drains_buffered_events() {
        let store = Arc::new(MemoryStore::from_ids(["A", "B"]));
        let (tx, rx) = mpsc::channel(8);
        tx.send(status_update(&["A"])).await.unwrap();
        tx.send(status_update(&["B"])).await.unwrap();

        let token = CancellationToken::new();
        token.cancel();

        // The sender is still alive; cancellation alone must end the loop.
        assert_eq!(event_sink(rx, Arc::clone(&store), token).await, 2);
        assert_eq!(store.count_by_status(IdStatus::Dispatched), 2);
        drop(tx);
    }

    #[test]
    fn unknown_ids_are_ignored() {
        let store = MemoryStore::from_ids(["A"]);
        assert_eq!(apply(&store, &status_update(&["Z"])), 0);
        assert_eq!(apply(&store, &status_update(&["A"])), 1);
        // Already dispatched.
        assert_eq!(apply(&store, &status_update(&["A"])), 0);
    }
}
