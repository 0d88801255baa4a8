use crate::{AllocationPage, AllocationQuery, IdRecord, Result, SearchQuery};
use async_trait::async_trait;

/// Authoritative record of every ID ever minted and its status.
///
/// The dispatch path only reads from it, to top up the pool cache. Status
/// changes reach it asynchronously through the event stream, so reads may lag
/// behind the cache; the cache filters anything it has already dispatched.
///
/// An unreachable store is reported as [`Error::Store`](crate::Error::Store).
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Up to `limit` records currently in `UNASSIGNED`, oldest first.
    ///
    /// The order must be stable: a record keeps its place relative to the
    /// others until it leaves `UNASSIGNED`, and it never comes back.
    async fn fetch_unassigned(&self, limit: usize) -> Result<Vec<IdRecord>>;

    /// Records matching `query`, in insertion order.
    async fn search(&self, query: &SearchQuery) -> Result<Vec<IdRecord>>;

    /// The page of `query.key`'s dispatch history selected by `query`, read
    /// from the persisted dispatch log and joined with each ID's current
    /// status.
    async fn dispatched_to(&self, query: &AllocationQuery) -> Result<AllocationPage>;
}
