//! Data model shared by the pool cache, the durable store, the event stream
//! and the orchestrator.
//!
//! - [`IdRecord`] / [`IdStatus`] - a pre-minted ID and its lifecycle state.
//! - [`DispatchRequest`] - one caller asking for a batch of IDs.
//! - [`QuotaKey`] - the `(requester, device)` pair a dispatch counter is kept
//!   for.
//! - [`DispatchedIdRecord`] - the immutable audit projection of a dispatch.
//! - [`DispatchResponse`] - what a successful dispatch hands back.
//! - [`SearchQuery`] - filter over the durable store.
//! - [`AllocationQuery`] / [`Allocation`] - reading back what a pair already
//!   holds.
//! - [`StatusUpdate`] - an out-of-band status change for a batch of IDs.

use crate::{Error, PoolStatusEntry};
use core::{fmt, str::FromStr};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle state of a pooled ID.
///
/// IDs are minted `UNASSIGNED` and move to `DISPATCHED` only through the
/// dispatch protocol. `RETIRED` and `EXPIRED` are set by external reclaim
/// processes and are never handed out.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IdStatus {
    Unassigned,
    Dispatched,
    Retired,
    Expired,
}

impl IdStatus {
    /// Wire representation, identical to the serde form.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Unassigned => "UNASSIGNED",
            Self::Dispatched => "DISPATCHED",
            Self::Retired => "RETIRED",
            Self::Expired => "EXPIRED",
        }
    }
}

impl fmt::Display for IdStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IdStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "UNASSIGNED" => Ok(Self::Unassigned),
            "DISPATCHED" => Ok(Self::Dispatched),
            "RETIRED" => Ok(Self::Retired),
            "EXPIRED" => Ok(Self::Expired),
            other => Err(Error::invalid(format!("unknown id status `{other}`"))),
        }
    }
}

/// A single pooled ID and its status.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdRecord {
    pub id: String,
    pub status: IdStatus,
}

impl IdRecord {
    pub fn new(id: impl Into<String>, status: IdStatus) -> Self {
        Self {
            id: id.into(),
            status,
        }
    }

    /// A freshly minted record.
    pub fn unassigned(id: impl Into<String>) -> Self {
        Self::new(id, IdStatus::Unassigned)
    }

    pub const fn is_unassigned(&self) -> bool {
        matches!(self.status, IdStatus::Unassigned)
    }
}

/// Identifies the dispatch counter for one requester on one device.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaKey {
    requester_id: String,
    device_id: String,
}

impl QuotaKey {
    pub fn new(requester_id: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            requester_id: requester_id.into(),
            device_id: device_id.into(),
        }
    }

    pub fn requester_id(&self) -> &str {
        &self.requester_id
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }
}

impl fmt::Display for QuotaKey {
    /// Formats as the cache key the counter lives under.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "user:{}:device:{}:count",
            self.requester_id, self.device_id
        )
    }
}

/// A caller's request for `count` IDs.
///
/// `count` is signed because it arrives from untrusted callers; values `<= 0`
/// are rejected during validation rather than being unrepresentable.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchRequest {
    pub requester_id: String,
    pub device_id: String,
    pub count: i64,
    /// Opaque device metadata, copied verbatim into the audit log.
    #[serde(default)]
    pub device_info: Value,
}

impl DispatchRequest {
    pub fn new(requester_id: impl Into<String>, device_id: impl Into<String>, count: i64) -> Self {
        Self {
            requester_id: requester_id.into(),
            device_id: device_id.into(),
            count,
            device_info: Value::Null,
        }
    }

    #[must_use]
    pub fn with_device_info(mut self, device_info: Value) -> Self {
        self.device_info = device_info;
        self
    }

    pub fn quota_key(&self) -> QuotaKey {
        QuotaKey::new(self.requester_id.clone(), self.device_id.clone())
    }
}

/// Audit projection of one dispatched ID. Written once, never mutated.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchedIdRecord {
    pub id: String,
    pub requester_id: String,
    pub device_id: String,
    pub device_info: Value,
    pub status: IdStatus,
    /// Milliseconds since the UNIX epoch at which the dispatch was recorded.
    pub dispatched_at: u64,
}

/// Result of a successful dispatch.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchResponse {
    pub ids: Vec<DispatchedIdRecord>,
    /// How many more IDs the pair may still request.
    pub fetch_limit: u64,
    /// The configured ceiling for the pair.
    pub total_limit: u64,
}

impl DispatchResponse {
    /// The raw ID values, in dispatch order.
    pub fn id_values(&self) -> impl Iterator<Item = &str> {
        self.ids.iter().map(|record| record.id.as_str())
    }
}

/// Filter applied by [`DurableStore::search`](crate::DurableStore::search).
///
/// Unset fields match everything.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SearchQuery {
    pub ids: Option<Vec<String>>,
    pub status: Option<IdStatus>,
    pub limit: Option<usize>,
}

impl SearchQuery {
    pub fn matches(&self, record: &IdRecord) -> bool {
        let id_ok = self
            .ids
            .as_ref()
            .is_none_or(|ids| ids.iter().any(|id| *id == record.id));
        let status_ok = self.status.is_none_or(|status| status == record.status);
        id_ok && status_ok
    }
}

/// Selects a page of the IDs already dispatched to one pair.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AllocationQuery {
    pub key: QuotaKey,
    pub offset: usize,
    /// `None` returns everything from `offset` on.
    pub limit: Option<usize>,
}

impl AllocationQuery {
    /// Everything dispatched to the pair.
    pub fn new(requester_id: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            key: QuotaKey::new(requester_id, device_id),
            offset: 0,
            limit: None,
        }
    }

    #[must_use]
    pub fn page(mut self, offset: usize, limit: Option<usize>) -> Self {
        self.offset = offset;
        self.limit = limit;
        self
    }
}

/// One page of a pair's dispatch history, oldest first, as the store holds
/// it.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AllocationPage {
    /// Audit records carrying each ID's current status.
    pub records: Vec<DispatchedIdRecord>,
    /// Size of the whole history, not of this page.
    pub total: u64,
}

/// Result of reading back a pair's allocation.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Allocation {
    pub ids: Vec<DispatchedIdRecord>,
    /// How many IDs the store has logged for the pair in total.
    pub total_count: u64,
    /// How many more IDs the pair may still request.
    pub fetch_limit: u64,
    pub total_limit: u64,
}

/// Moves a batch of IDs to new statuses outside the dispatch protocol, for
/// example when a client reports them used up.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusUpdate {
    /// Who asked for the change. Recorded in the audit log.
    pub requester_id: String,
    pub entries: Vec<PoolStatusEntry>,
}

impl StatusUpdate {
    pub fn new(requester_id: impl Into<String>, entries: Vec<PoolStatusEntry>) -> Self {
        Self {
            requester_id: requester_id.into(),
            entries,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            IdStatus::Unassigned,
            IdStatus::Dispatched,
            IdStatus::Retired,
            IdStatus::Expired,
        ] {
            assert_eq!(status.as_str().parse::<IdStatus>().unwrap(), status);
        }
        assert_eq!(" dispatched ".parse::<IdStatus>().unwrap(), IdStatus::Dispatched);
        assert!(matches!(
            "LOST".parse::<IdStatus>(),
            Err(Error::InvalidRequest { .. })
        ));
    }

    #[test]
    fn status_serializes_screaming_case() {
        let json = serde_json::to_string(&IdRecord::unassigned("A1")).unwrap();
        assert_eq!(json, r#"{"id":"A1","status":"UNASSIGNED"}"#);
    }

    #[test]
    fn dispatched_record_uses_camel_case_fields() {
        let record = DispatchedIdRecord {
            id: "A1".into(),
            requester_id: "u".into(),
            device_id: "d".into(),
            device_info: serde_json::json!({ "os": "android" }),
            status: IdStatus::Dispatched,
            dispatched_at: 7,
        };
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["requesterId"], "u");
        assert_eq!(value["deviceId"], "d");
        assert_eq!(value["deviceInfo"]["os"], "android");
        assert_eq!(value["status"], "DISPATCHED");
        assert_eq!(value["dispatchedAt"], 7);
    }

    #[test]
    fn quota_key_display_is_the_counter_key() {
        assert_eq!(
            QuotaKey::new("u1", "d1").to_string(),
            "user:u1:device:d1:count"
        );
    }

    #[test]
    fn search_query_filters_by_ids_and_status() {
        let record = IdRecord::unassigned("A1");
        assert!(SearchQuery::default().matches(&record));
        assert!(
            SearchQuery {
                ids: Some(vec!["A1".into()]),
                ..SearchQuery::default()
            }
            .matches(&record)
        );
        assert!(
            !SearchQuery {
                ids: Some(vec!["B2".into()]),
                ..SearchQuery::default()
            }
            .matches(&record)
        );
        assert!(
            !SearchQuery {
                status: Some(IdStatus::Dispatched),
                ..SearchQuery::default()
            }
            .matches(&record)
        );
    }
}
