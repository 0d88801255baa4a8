use crate::{
    Allocation, AllocationQuery, DispatchPhase, DispatchRequest, DispatchResponse,
    DispatchedIdRecord, DurableStore, Error, EventPayload, EventPublisher, IdRecord, IdStatus,
    LockCoordinator, LockOutcome, MonotonicClock, PoolCache, PoolStatusEntry, QuotaGuard,
    QuotaKey, QuotaMode, Reservation, Result, SearchQuery, StatusUpdate, TimeSource, Topics,
};
use serde_json::Value;
use std::{collections::HashSet, sync::Arc};

#[cfg(feature = "tracing")]
use tracing::{debug, instrument, trace, warn};

/// Tunables for [`DispatchOrchestrator`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DispatchSettings {
    /// Lifetime ceiling per requester/device pair. Also caps a single
    /// request.
    pub limit: u64,
    /// How many records to pull from the durable store when the cache is
    /// short.
    pub db_fetch_limit: usize,
    pub quota_mode: QuotaMode,
    pub topics: Topics,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            limit: 100,
            db_fetch_limit: 500,
            quota_mode: QuotaMode::Hard,
            topics: Topics::default(),
        }
    }
}

/// Runs the dispatch protocol against a set of collaborators.
///
/// The orchestrator itself holds no state between requests: every piece of
/// shared state lives behind the collaborator traits, so any number of
/// orchestrators (in one process or across many) can run against the same
/// backends concurrently.
///
/// A single attempt goes through:
///
/// 1. validate the request shape,
/// 2. check the pair's quota,
/// 3. pop `count` IDs from the cache, refilling from the store once if short,
/// 4. lock the exact set of popped IDs,
/// 5. mark them dispatched and bump the pair's counter,
/// 6. publish a pool status update and a dispatch log,
/// 7. release the locks, whatever happened in 5 and 6.
///
/// A request is atomic: it gets exactly `count` IDs or an error. IDs popped
/// by an attempt that fails before step 5 go back to the cache.
pub struct DispatchOrchestrator<C, S, L, P> {
    cache: Arc<C>,
    store: Arc<S>,
    locks: Arc<L>,
    publisher: Arc<P>,
    quota: QuotaGuard,
    settings: DispatchSettings,
    clock: MonotonicClock,
}

impl<C, S, L, P> DispatchOrchestrator<C, S, L, P>
where
    C: PoolCache,
    S: DurableStore,
    L: LockCoordinator,
    P: EventPublisher,
{
    pub fn new(
        cache: Arc<C>,
        store: Arc<S>,
        locks: Arc<L>,
        publisher: Arc<P>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            cache,
            store,
            locks,
            publisher,
            quota: QuotaGuard::new(settings.limit, settings.quota_mode),
            settings,
            clock: MonotonicClock::default(),
        }
    }

    pub fn cache(&self) -> &Arc<C> {
        &self.cache
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn locks(&self) -> &Arc<L> {
        &self.locks
    }

    pub const fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    /// Hands `request.count` fresh IDs to the requester/device pair.
    #[cfg_attr(
        feature = "tracing",
        instrument(
            level = "debug",
            skip_all,
            fields(
                requester = %request.requester_id,
                device = %request.device_id,
                count = request.count,
            )
        )
    )]
    pub async fn dispatch(&self, request: DispatchRequest) -> Result<DispatchResponse> {
        let mut phase = DispatchPhase::Validating;
        let result = self.run(&request, &mut phase).await;

        match &result {
            Ok(_response) => {
                advance(&mut phase, DispatchPhase::Done);
                #[cfg(feature = "tracing")]
                debug!(
                    ids = _response.ids.len(),
                    fetch_limit = _response.fetch_limit,
                    "dispatch complete"
                );
            }
            Err(_e) => {
                #[cfg(feature = "tracing")]
                {
                    if _e.is_infrastructure() || phase.has_mutated() {
                        warn!(%phase, code = _e.code(), error = %_e, "dispatch failed");
                    } else {
                        debug!(%phase, code = _e.code(), error = %_e, "dispatch rejected");
                    }
                }
                advance(&mut phase, DispatchPhase::Failed);
            }
        }

        result
    }

    /// Read-only lookup against the durable store.
    pub async fn search(&self, query: &SearchQuery) -> Result<Vec<IdRecord>> {
        self.store.search(query).await
    }

    /// Reads back the IDs already handed to `query.key`, from the store's
    /// dispatch log.
    ///
    /// The log and the counter live in different systems. When the log holds
    /// more than the counter, the counter is raised to match; it is never
    /// lowered. `fetch_limit` is computed from the reconciled counter.
    #[cfg_attr(
        feature = "tracing",
        instrument(level = "debug", skip_all, fields(key = %query.key, offset = query.offset))
    )]
    pub async fn fetch_allocated(&self, query: &AllocationQuery) -> Result<Allocation> {
        QuotaGuard::validate_pair(query.key.requester_id(), query.key.device_id())?;

        let page = self.store.dispatched_to(query).await?;
        let counted = self
            .cache
            .raise_dispatched_count(&query.key, page.total)
            .await?;

        #[cfg(feature = "tracing")]
        debug!(
            returned = page.records.len(),
            total = page.total,
            counted,
            "allocation read back"
        );

        Ok(Allocation {
            ids: page.records,
            total_count: page.total,
            fetch_limit: self.settings.limit.saturating_sub(counted),
            total_limit: self.settings.limit,
        })
    }

    /// Moves IDs to new statuses outside the dispatch protocol.
    ///
    /// The batch is all or nothing: every ID must exist in the store, appear
    /// once, and move to a status other than `UNASSIGNED`. The IDs are locked
    /// while they are taken out of the cache, then the change is published on
    /// the pool status topic and audited on the dispatch log topic.
    #[cfg_attr(
        feature = "tracing",
        instrument(
            level = "debug",
            skip_all,
            fields(requester = %update.requester_id, ids = update.entries.len())
        )
    )]
    pub async fn update_status(&self, update: StatusUpdate) -> Result<Vec<IdRecord>> {
        let ids = self.validate_update(&update).await?;

        let lease = match self.locks.acquire(&ids).await? {
            LockOutcome::Acquired(lease) => lease,
            LockOutcome::Contended { key } => return Err(Error::LockingError { key }),
        };

        let outcome = self.withdraw_and_publish(&update, &ids).await;

        if let Err(_e) = self.locks.release(&lease).await {
            #[cfg(feature = "tracing")]
            warn!(token = lease.token(), error = %_e, "lock release failed");
        }
        outcome?;

        Ok(update
            .entries
            .into_iter()
            .map(|entry| IdRecord::new(entry.id, entry.status))
            .collect())
    }

    async fn validate_update(&self, update: &StatusUpdate) -> Result<Vec<String>> {
        if update.requester_id.trim().is_empty() {
            return Err(Error::invalid("requester id is required"));
        }
        if update.entries.is_empty() {
            return Err(Error::invalid("at least one id is required"));
        }

        let mut seen = HashSet::with_capacity(update.entries.len());
        for entry in &update.entries {
            if entry.id.trim().is_empty() {
                return Err(Error::invalid("id must not be empty"));
            }
            if entry.status == IdStatus::Unassigned {
                return Err(Error::invalid(format!(
                    "id `{}` cannot be moved back to {}",
                    entry.id,
                    IdStatus::Unassigned
                )));
            }
            if !seen.insert(entry.id.as_str()) {
                return Err(Error::invalid(format!(
                    "id `{}` appears more than once",
                    entry.id
                )));
            }
        }

        let ids: Vec<String> = update.entries.iter().map(|e| e.id.clone()).collect();
        let found = self
            .store
            .search(&SearchQuery {
                ids: Some(ids.clone()),
                ..SearchQuery::default()
            })
            .await?;
        let found: HashSet<&str> = found.iter().map(|r| r.id.as_str()).collect();
        if let Some(missing) = ids.iter().find(|id| !found.contains(id.as_str())) {
            return Err(Error::invalid(format!("unknown id `{missing}`")));
        }

        Ok(ids)
    }

    /// Must only run while the lease over `ids` is held.
    async fn withdraw_and_publish(&self, update: &StatusUpdate, ids: &[String]) -> Result<()> {
        let _withdrawn = self.cache.withdraw(ids).await?;

        let recorded_at = self.clock.current_millis();
        let audit: Vec<DispatchedIdRecord> = update
            .entries
            .iter()
            .map(|entry| DispatchedIdRecord {
                id: entry.id.clone(),
                requester_id: update.requester_id.clone(),
                device_id: String::new(),
                device_info: Value::Null,
                status: entry.status,
                dispatched_at: recorded_at,
            })
            .collect();

        let topics = &self.settings.topics;
        self.publisher
            .publish(
                &topics.pool_status,
                EventPayload::PoolStatusUpdate(update.entries.clone()),
            )
            .await?;
        self.publisher
            .publish(&topics.dispatch_log, EventPayload::DispatchLog(audit))
            .await?;

        #[cfg(feature = "tracing")]
        debug!(withdrawn = _withdrawn, "status update published");
        Ok(())
    }

    async fn run(
        &self,
        request: &DispatchRequest,
        phase: &mut DispatchPhase,
    ) -> Result<DispatchResponse> {
        let count = self
            .quota
            .validate(&request.requester_id, &request.device_id, request.count)?;
        let key = request.quota_key();

        self.quota.check(&*self.cache, &key, count).await?;
        advance(phase, DispatchPhase::QuotaChecked);

        let selected = self.select_or_refill(count).await?;
        advance(phase, DispatchPhase::IdsSelected);

        let ids: Vec<String> = selected.iter().map(|r| r.id.clone()).collect();
        let lease = match self.locks.acquire(&ids).await {
            Ok(LockOutcome::Acquired(lease)) => lease,
            Ok(LockOutcome::Contended { key }) => {
                self.return_to_pool(&selected).await;
                return Err(Error::LockingError { key });
            }
            Err(e) => {
                self.return_to_pool(&selected).await;
                return Err(e);
            }
        };
        advance(phase, DispatchPhase::Locked);

        let outcome = self
            .mutate_and_publish(request, &key, &selected, phase)
            .await;

        if let Err(_e) = self.locks.release(&lease).await {
            // The lease expires on its own.
            #[cfg(feature = "tracing")]
            warn!(token = lease.token(), error = %_e, "lock release failed");
        }

        let (ids, total) = outcome?;
        Ok(DispatchResponse {
            ids,
            fetch_limit: self.settings.limit.saturating_sub(total),
            total_limit: self.settings.limit,
        })
    }

    /// Pops `count` IDs, topping the cache up from the store at most once.
    async fn select_or_refill(&self, count: usize) -> Result<Vec<IdRecord>> {
        let mut selected = self.cache.select_unassigned(count).await?;
        if selected.len() == count {
            return Ok(selected);
        }

        let shortfall = count - selected.len();
        let topped_up = match self.refill(shortfall).await {
            Ok(_) => self.cache.select_unassigned(shortfall).await,
            Err(e) => Err(e),
        };
        match topped_up {
            Ok(more) => selected.extend(more),
            Err(e) => {
                self.return_to_pool(&selected).await;
                return Err(e);
            }
        }

        if selected.len() < count {
            let available = selected.len();
            self.return_to_pool(&selected).await;
            return Err(Error::NoIdsAvailable {
                requested: count,
                available,
            });
        }

        Ok(selected)
    }

    /// Tops the cache up from the store.
    ///
    /// A lagging store still lists IDs this cache has already handed out, and
    /// lists them first. The fetch reaches past every tracked ID so the batch
    /// always holds at least `max(db_fetch_limit, shortfall)` IDs the cache
    /// has never seen, if the store has them.
    async fn refill(&self, shortfall: usize) -> Result<usize> {
        let since = self.cache.snapshot().await?;
        let limit = self
            .settings
            .db_fetch_limit
            .max(shortfall)
            .saturating_add(since.tracked);

        let fetched = self.store.fetch_unassigned(limit).await?;
        let _settled = self.cache.settle_dispatched(since, limit, &fetched).await?;
        let added = self.cache.add_unassigned(&fetched).await?;

        #[cfg(feature = "tracing")]
        debug!(
            limit,
            tracked = since.tracked,
            fetched = fetched.len(),
            settled = _settled,
            added,
            "refilled pool cache"
        );

        Ok(added)
    }

    /// Steps 5 and 6. Must only run while the lease over `selected` is held.
    async fn mutate_and_publish(
        &self,
        request: &DispatchRequest,
        key: &QuotaKey,
        selected: &[IdRecord],
        phase: &mut DispatchPhase,
    ) -> Result<(Vec<DispatchedIdRecord>, u64)> {
        let requested = selected.len() as u64;

        let total = match self.quota.mode() {
            QuotaMode::Hard => {
                let total = match self
                    .cache
                    .increment_dispatched_count_within(key, requested, self.settings.limit)
                    .await
                {
                    Ok(Reservation::Reserved { total }) => total,
                    Ok(Reservation::Rejected { current }) => {
                        self.return_to_pool(selected).await;
                        return Err(Error::QuotaExceeded {
                            key: key.clone(),
                            dispatched: current,
                            requested,
                            limit: self.settings.limit,
                        });
                    }
                    Err(e) => {
                        self.return_to_pool(selected).await;
                        return Err(e);
                    }
                };

                if let Err(e) = self.cache.mark_dispatched(selected).await {
                    self.rollback_reservation(key, requested).await;
                    self.return_to_pool(selected).await;
                    return Err(e);
                }
                total
            }
            QuotaMode::Soft => {
                if let Err(e) = self.cache.mark_dispatched(selected).await {
                    self.return_to_pool(selected).await;
                    return Err(e);
                }
                let delta = i64::try_from(requested).unwrap_or(i64::MAX);
                self.cache.increment_dispatched_count(key, delta).await?
            }
        };
        advance(phase, DispatchPhase::Mutated);

        let dispatched_at = self.clock.current_millis();
        let records: Vec<DispatchedIdRecord> = selected
            .iter()
            .map(|record| DispatchedIdRecord {
                id: record.id.clone(),
                requester_id: request.requester_id.clone(),
                device_id: request.device_id.clone(),
                device_info: request.device_info.clone(),
                status: IdStatus::Dispatched,
                dispatched_at,
            })
            .collect();

        let topics = &self.settings.topics;
        let status_update = EventPayload::PoolStatusUpdate(
            selected
                .iter()
                .map(|record| PoolStatusEntry::new(record.id.clone(), IdStatus::Dispatched))
                .collect(),
        );
        self.publisher
            .publish(&topics.pool_status, status_update)
            .await?;
        self.publisher
            .publish(&topics.dispatch_log, EventPayload::DispatchLog(records.clone()))
            .await?;
        advance(phase, DispatchPhase::Published);

        Ok((records, total))
    }

    async fn rollback_reservation(&self, key: &QuotaKey, requested: u64) {
        let delta = i64::try_from(requested).map_or(i64::MIN, |d| -d);
        if let Err(_e) = self.cache.increment_dispatched_count(key, delta).await {
            #[cfg(feature = "tracing")]
            warn!(%key, requested, error = %_e, "quota rollback failed");
        }
    }

    /// Best effort. IDs that cannot be returned stay claimed until the claim
    /// expires.
    async fn return_to_pool(&self, records: &[IdRecord]) {
        if records.is_empty() {
            return;
        }
        match self.cache.return_unassigned(records).await {
            Ok(_returned) => {
                #[cfg(feature = "tracing")]
                trace!(returned = _returned, "returned ids to pool");
            }
            Err(_e) => {
                #[cfg(feature = "tracing")]
                warn!(ids = records.len(), error = %_e, "failed to return ids to pool");
            }
        }
    }
}

#[inline]
fn advance(phase: &mut DispatchPhase, next: DispatchPhase) {
    #[cfg(feature = "tracing")]
    trace!(from = %phase, to = %next, "dispatch phase");
    *phase = next;
}
