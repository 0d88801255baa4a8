use crate::{DispatchedIdRecord, IdStatus};
use serde::{Deserialize, Serialize};

/// Status transition for one pooled ID, as consumed by the durable store
/// writer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStatusEntry {
    pub id: String,
    pub status: IdStatus,
}

impl PoolStatusEntry {
    pub fn new(id: impl Into<String>, status: IdStatus) -> Self {
        Self {
            id: id.into(),
            status,
        }
    }
}

/// Body of a published event.
///
/// Serialized as `{"kind": "...", "records": [...]}` so downstream consumers
/// can route on `kind` without knowing the topic layout.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "records", rename_all = "kebab-case")]
pub enum EventPayload {
    /// IDs that moved to a new lifecycle state.
    PoolStatusUpdate(Vec<PoolStatusEntry>),
    /// Append-only audit trail of a dispatch.
    DispatchLog(Vec<DispatchedIdRecord>),
}

impl EventPayload {
    /// Number of records carried.
    pub fn len(&self) -> usize {
        match self {
            Self::PoolStatusUpdate(entries) => entries.len(),
            Self::DispatchLog(records) => records.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub const fn kind(&self) -> &'static str {
        match self {
            Self::PoolStatusUpdate(_) => "pool-status-update",
            Self::DispatchLog(_) => "dispatch-log",
        }
    }
}

/// A payload addressed to a topic.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub topic: String,
    pub payload: EventPayload,
}

/// Topic names the dispatch path publishes to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Topics {
    /// Receives [`EventPayload::PoolStatusUpdate`].
    pub pool_status: String,
    /// Receives [`EventPayload::DispatchLog`].
    pub dispatch_log: String,
}

impl Default for Topics {
    fn default() -> Self {
        Self {
            pool_status: "update-id-pool-status".to_string(),
            dispatch_log: "save-id-dispatch-log".to_string(),
        }
    }
}
