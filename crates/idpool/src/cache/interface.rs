use crate::{IdRecord, QuotaKey, Result};
use async_trait::async_trait;

/// Outcome of a conditional counter increment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reservation {
    /// The delta fit under the limit and was applied.
    Reserved {
        /// Counter value after the increment.
        total: u64,
    },
    /// Applying the delta would have exceeded the limit; the counter is
    /// unchanged.
    Rejected {
        /// Counter value observed at the time of the attempt.
        current: u64,
    },
}

/// What the cache was tracking at one instant, taken before a refill.
///
/// `tracked` counts every ID the cache knows about: queued, claimed and
/// tombstoned. `epoch` changes whenever that set gains or loses members, so
/// a refill can tell whether anything entered or left it concurrently.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolSnapshot {
    pub tracked: usize,
    pub epoch: u64,
}

/// Fast shared store holding the working set of unassigned IDs and the
/// per-pair dispatch counters.
///
/// Implementations are shared across concurrent callers and across service
/// instances, so every method must be atomic on the backing store: a single
/// round-trip conditional operation, never a client-side read-modify-write.
///
/// An unreachable cache is reported as [`Error::Cache`](crate::Error::Cache)
/// and is fatal for the current dispatch attempt.
#[async_trait]
pub trait PoolCache: Send + Sync {
    /// Pops up to `n` unassigned IDs and claims them for the caller.
    ///
    /// Returns fewer than `n` when the cache is short. An ID returned to one
    /// caller is never returned to another: it stays claimed until it is
    /// either marked dispatched or handed back with
    /// [`return_unassigned`](Self::return_unassigned), or until the claim
    /// outlives the ID lock lease. An expired claim goes back into the pool.
    async fn select_unassigned(&self, n: usize) -> Result<Vec<IdRecord>>;

    /// Merges records into the unassigned working set.
    ///
    /// Idempotent on duplicate IDs. Records that are not `UNASSIGNED`, that
    /// are currently claimed, or that this cache has already marked
    /// dispatched or withdrawn are skipped. Returns how many records were newly added.
    async fn add_unassigned(&self, records: &[IdRecord]) -> Result<usize>;

    /// Releases claimed records back to the front of the unassigned set.
    ///
    /// Used when an attempt fails before mutating anything. Records that are
    /// not claimed are ignored. Returns how many were put back.
    async fn return_unassigned(&self, records: &[IdRecord]) -> Result<usize>;

    /// Flips the cached status of `records` to `DISPATCHED` and drops them
    /// from the unassigned and claimed sets.
    ///
    /// All or nothing: if any record is already dispatched, nothing changes
    /// and [`Error::LockingError`](crate::Error::LockingError) names it.
    /// Callers must hold the ID lock for every record.
    async fn mark_dispatched(&self, records: &[IdRecord]) -> Result<()>;

    /// Takes `ids` out of circulation after an out-of-band status change.
    ///
    /// Queued or claimed IDs are dropped and every ID is remembered so a
    /// lagging store cannot put it back. Idempotent. Returns how many IDs
    /// were newly withdrawn.
    async fn withdraw(&self, ids: &[String]) -> Result<usize>;

    /// Current size and epoch of the tracked set.
    async fn snapshot(&self) -> Result<PoolSnapshot>;

    /// Forgets tombstones the store no longer reports as unassigned.
    ///
    /// `batch` must be what
    /// [`DurableStore::fetch_unassigned`](crate::DurableStore::fetch_unassigned)
    /// returned for `limit` after `since` was taken, with `limit` at least
    /// `since.tracked`. A tombstone missing from such a batch has reached the
    /// store. When the tracked set changed in between and the batch is not
    /// exhaustive, nothing is forgotten. Returns how many tombstones were
    /// dropped.
    async fn settle_dispatched(
        &self,
        since: PoolSnapshot,
        limit: usize,
        batch: &[IdRecord],
    ) -> Result<usize>;

    /// Number of IDs already dispatched to `key`.
    async fn dispatched_count(&self, key: &QuotaKey) -> Result<u64>;

    /// Adds `delta` to the counter for `key` (negative values roll back a
    /// previous increment, saturating at zero). Returns the new value.
    async fn increment_dispatched_count(&self, key: &QuotaKey, delta: i64) -> Result<u64>;

    /// Adds `delta` to the counter for `key` only if the result stays within
    /// `limit`.
    async fn increment_dispatched_count_within(
        &self,
        key: &QuotaKey,
        delta: u64,
        limit: u64,
    ) -> Result<Reservation>;

    /// Raises the counter for `key` to at least `floor`. Returns the value
    /// after the update.
    async fn raise_dispatched_count(&self, key: &QuotaKey, floor: u64) -> Result<u64>;

    /// Size of the unassigned working set.
    async fn unassigned_len(&self) -> Result<usize>;
}
