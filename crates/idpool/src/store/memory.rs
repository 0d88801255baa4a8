use crate::{
    AllocationPage, AllocationQuery, DispatchedIdRecord, DurableStore, IdRecord, IdStatus,
    PoolStatusEntry, QuotaKey, Result, SearchQuery,
};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

#[derive(Default)]
struct Records {
    records: Vec<IdRecord>,
    /// id -> position in `records`
    index: HashMap<String, usize>,
    /// Dispatch log per pair, oldest first.
    allocations: HashMap<QuotaKey, Vec<DispatchedIdRecord>>,
}

/// In-process [`DurableStore`] seeded from a list of IDs.
///
/// Persists pool status updates and dispatch logs itself via
/// [`MemoryStore::apply_status`] and [`MemoryStore::record_dispatches`]; a
/// real deployment would have a separate consumer persist them.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Records>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store holding every `id` as `UNASSIGNED`.
    pub fn from_ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let store = Self::new();
        store.insert(ids.into_iter().map(IdRecord::unassigned));
        store
    }

    /// Inserts records, skipping IDs already present. Returns how many were
    /// new.
    pub fn insert<I>(&self, records: I) -> usize
    where
        I: IntoIterator<Item = IdRecord>,
    {
        let mut inner = self.inner.write();
        let mut inserted = 0;
        for record in records {
            if inner.index.contains_key(&record.id) {
                continue;
            }
            let position = inner.records.len();
            inner.index.insert(record.id.clone(), position);
            inner.records.push(record);
            inserted += 1;
        }
        inserted
    }

    /// Applies status transitions published by the dispatch path. Unknown
    /// IDs are ignored. Returns how many records changed.
    pub fn apply_status(&self, entries: &[PoolStatusEntry]) -> usize {
        let mut inner = self.inner.write();
        let mut changed = 0;
        for entry in entries {
            let Some(&position) = inner.index.get(&entry.id) else {
                continue;
            };
            let record = &mut inner.records[position];
            if record.status != entry.status {
                record.status = entry.status;
                changed += 1;
            }
        }
        changed
    }

    /// Appends dispatch log records to their pair's history. Only
    /// `DISPATCHED` entries count as an allocation, and an ID already logged
    /// for the pair is not logged twice. Returns how many were appended.
    pub fn record_dispatches(&self, records: &[DispatchedIdRecord]) -> usize {
        let mut inner = self.inner.write();
        let mut appended = 0;
        for record in records.iter().filter(|r| r.status == IdStatus::Dispatched) {
            let key = QuotaKey::new(record.requester_id.clone(), record.device_id.clone());
            let history = inner.allocations.entry(key).or_default();
            if history.iter().any(|logged| logged.id == record.id) {
                continue;
            }
            history.push(record.clone());
            appended += 1;
        }
        appended
    }

    pub fn len(&self) -> usize {
        self.inner.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn count_by_status(&self, status: IdStatus) -> usize {
        self.inner
            .read()
            .records
            .iter()
            .filter(|r| r.status == status)
            .count()
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn fetch_unassigned(&self, limit: usize) -> Result<Vec<IdRecord>> {
        Ok(self
            .inner
            .read()
            .records
            .iter()
            .filter(|r| r.is_unassigned())
            .take(limit)
            .cloned()
            .collect())
    }

    async fn search(&self, query: &SearchQuery) -> Result<Vec<IdRecord>> {
        let inner = self.inner.read();
        let limit = query.limit.unwrap_or(usize::MAX);

        // Id lookups go through the index instead of a full scan.
        let found: Vec<IdRecord> = match &query.ids {
            Some(ids) => {
                let mut positions: Vec<usize> =
                    ids.iter().filter_map(|id| inner.index.get(id).copied()).collect();
                positions.sort_unstable();
                positions.dedup();
                positions
                    .into_iter()
                    .map(|p| &inner.records[p])
                    .filter(|r| query.matches(r))
                    .take(limit)
                    .cloned()
                    .collect()
            }
            None => inner
                .records
                .iter()
                .filter(|r| query.matches(r))
                .take(limit)
                .cloned()
                .collect(),
        };

        Ok(found)
    }

    async fn dispatched_to(&self, query: &AllocationQuery) -> Result<AllocationPage> {
        let inner = self.inner.read();
        let Some(history) = inner.allocations.get(&query.key) else {
            return Ok(AllocationPage::default());
        };

        let records = history
            .iter()
            .skip(query.offset)
            .take(query.limit.unwrap_or(usize::MAX))
            .map(|logged| {
                let mut record = logged.clone();
                if let Some(&position) = inner.index.get(&record.id) {
                    record.status = inner.records[position].status;
                }
                record
            })
            .collect();

        Ok(AllocationPage {
            records,
            total: history.len() as u64,
        })
    }
}
