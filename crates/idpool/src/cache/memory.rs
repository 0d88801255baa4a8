use crate::{
    Error, IdRecord, MonotonicClock, PoolCache, PoolSnapshot, QuotaKey, Reservation, Result,
    TimeSource,
};
use async_trait::async_trait;
use core::time::Duration;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};

#[cfg(feature = "tracing")]
use tracing::{debug, instrument};

/// How long an unfinished claim is honoured. Matches the default ID lock
/// lease.
pub const DEFAULT_CLAIM_TTL: Duration = Duration::from_secs(30);

#[derive(Default)]
struct PoolState {
    /// FIFO of unassigned IDs; refills append, selection pops from the front.
    unassigned: VecDeque<String>,
    /// Mirror of `unassigned` for O(1) duplicate detection.
    members: HashSet<String>,
    /// Popped by an in-flight attempt, with the time of the pop.
    claimed: HashMap<String, u64>,
    /// IDs this cache has marked dispatched. A lagging store may still report
    /// them unassigned; they must never re-enter the pool.
    dispatched: HashSet<String>,
    /// IDs withdrawn without ever passing through the queue.
    withdrawn: HashSet<String>,
    counters: HashMap<QuotaKey, u64>,
    /// Bumped whenever an ID starts or stops being tracked.
    epoch: u64,
}

impl PoolState {
    fn is_known(&self, id: &str) -> bool {
        self.members.contains(id)
            || self.claimed.contains_key(id)
            || self.dispatched.contains(id)
            || self.withdrawn.contains(id)
    }

    fn tracked(&self) -> usize {
        self.members.len() + self.claimed.len() + self.dispatched.len() + self.withdrawn.len()
    }

    /// Puts claims older than `ttl` back at the front of the queue, oldest
    /// first. Returns how many were reclaimed.
    fn expire_claims(&mut self, now: u64, ttl: u64) -> usize {
        let mut stale: Vec<(u64, String)> = self
            .claimed
            .iter()
            .filter(|&(_, &at)| now.saturating_sub(at) >= ttl)
            .map(|(id, &at)| (at, id.clone()))
            .collect();
        if stale.is_empty() {
            return 0;
        }

        stale.sort_unstable();
        for (_, id) in stale.iter().rev() {
            self.claimed.remove(id);
            self.members.insert(id.clone());
            self.unassigned.push_front(id.clone());
        }
        stale.len()
    }
}

/// In-process [`PoolCache`].
///
/// A single [`Mutex`] guards the whole state, so each trait method is one
/// atomic step, the in-memory analogue of a single cache round trip. The
/// guard is never held across an `.await`.
///
/// Claims older than the claim TTL are treated as abandoned (their attempt
/// was cancelled between selection and marking) and are put back into the
/// pool on the next selection or refill. The TTL should match the ID lock
/// lease.
///
/// Suitable for single-instance deployments and tests; multi-instance
/// deployments need a networked implementation of [`PoolCache`].
pub struct MemoryPoolCache<T = MonotonicClock>
where
    T: TimeSource<u64>,
{
    state: Mutex<PoolState>,
    claim_ttl: u64,
    time: T,
}

impl Default for MemoryPoolCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryPoolCache {
    pub fn new() -> Self {
        Self::with_claim_ttl(DEFAULT_CLAIM_TTL)
    }

    pub fn with_claim_ttl(claim_ttl: Duration) -> Self {
        Self::with_time(claim_ttl, MonotonicClock::default())
    }
}

impl<T> MemoryPoolCache<T>
where
    T: TimeSource<u64>,
{
    pub fn with_time(claim_ttl: Duration, time: T) -> Self {
        Self {
            state: Mutex::new(PoolState::default()),
            claim_ttl: u64::try_from(claim_ttl.as_millis()).unwrap_or(u64::MAX),
            time,
        }
    }

    /// Whether `id` has been marked dispatched by this cache.
    pub fn is_dispatched(&self, id: &str) -> bool {
        self.state.lock().dispatched.contains(id)
    }

    /// Whether `id` was withdrawn or dispatched and is still remembered.
    pub fn is_tombstoned(&self, id: &str) -> bool {
        let state = self.state.lock();
        state.dispatched.contains(id) || state.withdrawn.contains(id)
    }

    /// Number of IDs popped by attempts that have not finished yet.
    pub fn claimed_len(&self) -> usize {
        self.state.lock().claimed.len()
    }

    fn expire_claims(&self, state: &mut PoolState) {
        let _reclaimed = state.expire_claims(self.time.current_millis(), self.claim_ttl);
        #[cfg(feature = "tracing")]
        {
            if _reclaimed > 0 {
                debug!(reclaimed = _reclaimed, "expired abandoned claims");
            }
        }
    }
}

#[async_trait]
impl<T> PoolCache for MemoryPoolCache<T>
where
    T: TimeSource<u64> + Send + Sync,
{
    #[cfg_attr(feature = "tracing", instrument(level = "trace", skip(self)))]
    async fn select_unassigned(&self, n: usize) -> Result<Vec<IdRecord>> {
        let mut state = self.state.lock();
        self.expire_claims(&mut state);

        let now = self.time.current_millis();
        let mut selected = Vec::with_capacity(n.min(state.unassigned.len()));
        while selected.len() < n {
            let Some(id) = state.unassigned.pop_front() else {
                break;
            };
            state.members.remove(&id);
            state.claimed.insert(id.clone(), now);
            selected.push(IdRecord::unassigned(id));
        }

        Ok(selected)
    }

    #[cfg_attr(feature = "tracing", instrument(level = "trace", skip_all, fields(records = records.len())))]
    async fn add_unassigned(&self, records: &[IdRecord]) -> Result<usize> {
        let mut state = self.state.lock();
        self.expire_claims(&mut state);
        let mut added = 0;

        for record in records.iter().filter(|r| r.is_unassigned()) {
            if state.is_known(&record.id) {
                continue;
            }
            state.members.insert(record.id.clone());
            state.unassigned.push_back(record.id.clone());
            added += 1;
        }

        if added > 0 {
            state.epoch += 1;
        }
        Ok(added)
    }

    #[cfg_attr(feature = "tracing", instrument(level = "trace", skip_all, fields(records = records.len())))]
    async fn return_unassigned(&self, records: &[IdRecord]) -> Result<usize> {
        let mut state = self.state.lock();
        let mut returned = 0;

        // Reverse so the batch keeps its original order at the front.
        for record in records.iter().rev() {
            if state.claimed.remove(&record.id).is_none() {
                continue;
            }
            state.members.insert(record.id.clone());
            state.unassigned.push_front(record.id.clone());
            returned += 1;
        }

        Ok(returned)
    }

    #[cfg_attr(feature = "tracing", instrument(level = "trace", skip_all, fields(records = records.len())))]
    async fn mark_dispatched(&self, records: &[IdRecord]) -> Result<()> {
        let mut state = self.state.lock();

        // An expired claim can be picked up by a second attempt; whichever
        // marks first wins.
        if let Some(taken) = records.iter().find(|r| {
            state.dispatched.contains(&r.id) || state.withdrawn.contains(&r.id)
        }) {
            return Err(Error::LockingError {
                key: taken.id.clone(),
            });
        }

        let mut still_queued = false;
        for record in records {
            state.claimed.remove(&record.id);
            state.dispatched.insert(record.id.clone());
            still_queued |= state.members.remove(&record.id);
        }

        // Selected IDs have already been popped; only scan the queue when a
        // record was marked without going through `select_unassigned`.
        if still_queued {
            let PoolState {
                unassigned,
                dispatched,
                ..
            } = &mut *state;
            unassigned.retain(|id| !dispatched.contains(id));
        }

        Ok(())
    }

    #[cfg_attr(feature = "tracing", instrument(level = "trace", skip_all, fields(ids = ids.len())))]
    async fn withdraw(&self, ids: &[String]) -> Result<usize> {
        let mut state = self.state.lock();
        let mut withdrawn = 0;
        let mut still_queued = false;
        let mut untracked = false;

        for id in ids {
            if state.dispatched.contains(id) || state.withdrawn.contains(id) {
                continue;
            }
            let queued = state.members.remove(id);
            let claimed = state.claimed.remove(id).is_some();
            still_queued |= queued;
            if queued || claimed {
                // It came through the queue, so it settles like a dispatch.
                state.dispatched.insert(id.clone());
            } else {
                state.withdrawn.insert(id.clone());
                untracked = true;
            }
            withdrawn += 1;
        }

        if still_queued {
            let PoolState {
                unassigned,
                dispatched,
                ..
            } = &mut *state;
            unassigned.retain(|id| !dispatched.contains(id));
        }
        if untracked {
            state.epoch += 1;
        }

        Ok(withdrawn)
    }

    async fn snapshot(&self) -> Result<PoolSnapshot> {
        let state = self.state.lock();
        Ok(PoolSnapshot {
            tracked: state.tracked(),
            epoch: state.epoch,
        })
    }

    #[cfg_attr(feature = "tracing", instrument(level = "trace", skip(self, batch), fields(batch = batch.len())))]
    async fn settle_dispatched(
        &self,
        since: PoolSnapshot,
        limit: usize,
        batch: &[IdRecord],
    ) -> Result<usize> {
        let exhaustive = batch.len() < limit;
        let mut state = self.state.lock();

        // Known IDs sit at the head of the store's unassigned order, so a
        // batch covering `since.tracked` records holds every tombstone the
        // store has not caught up with yet. Withdrawn IDs may sit anywhere
        // and only settle against an exhaustive batch.
        let covers_head = state.epoch == since.epoch && limit >= since.tracked;
        if !exhaustive && !covers_head {
            return Ok(0);
        }

        let pending: HashSet<&str> = batch
            .iter()
            .filter(|r| r.is_unassigned())
            .map(|r| r.id.as_str())
            .collect();

        let before = state.dispatched.len() + state.withdrawn.len();
        state.dispatched.retain(|id| pending.contains(id.as_str()));
        if exhaustive {
            state.withdrawn.retain(|id| pending.contains(id.as_str()));
        }
        let settled = before - (state.dispatched.len() + state.withdrawn.len());

        if settled > 0 {
            state.epoch += 1;
        }
        Ok(settled)
    }

    async fn dispatched_count(&self, key: &QuotaKey) -> Result<u64> {
        Ok(self.state.lock().counters.get(key).copied().unwrap_or(0))
    }

    async fn increment_dispatched_count(&self, key: &QuotaKey, delta: i64) -> Result<u64> {
        let mut state = self.state.lock();
        let counter = state.counters.entry(key.clone()).or_insert(0);
        *counter = counter.saturating_add_signed(delta);
        Ok(*counter)
    }

    async fn increment_dispatched_count_within(
        &self,
        key: &QuotaKey,
        delta: u64,
        limit: u64,
    ) -> Result<Reservation> {
        let mut state = self.state.lock();
        let counter = state.counters.entry(key.clone()).or_insert(0);
        let current = *counter;

        match current.checked_add(delta) {
            Some(total) if total <= limit => {
                *counter = total;
                Ok(Reservation::Reserved { total })
            }
            _ => Ok(Reservation::Rejected { current }),
        }
    }

    async fn raise_dispatched_count(&self, key: &QuotaKey, floor: u64) -> Result<u64> {
        let mut state = self.state.lock();
        let counter = state.counters.entry(key.clone()).or_insert(0);
        *counter = (*counter).max(floor);
        Ok(*counter)
    }

    async fn unassigned_len(&self) -> Result<usize> {
        Ok(self.state.lock().unassigned.len())
    }
}
