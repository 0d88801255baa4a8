use crate::{Error, Lease, LockCoordinator, LockOutcome, MonotonicClock, Result, TimeSource};
use async_trait::async_trait;
use core::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};
use parking_lot::Mutex;
use std::collections::HashMap;

#[cfg(feature = "tracing")]
use tracing::{debug, instrument};

/// Timing knobs for [`MemoryLockCoordinator`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LockSettings {
    /// How long an acquired lease stays valid.
    pub lease: Duration,
    /// Additional attempts after the first one fails on contention.
    pub retry_attempts: u32,
    /// Sleep between attempts, doubled after each retry.
    pub retry_backoff: Duration,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            lease: Duration::from_secs(30),
            retry_attempts: 3,
            retry_backoff: Duration::from_millis(25),
        }
    }
}

struct Held {
    token: u64,
    expires_at: u64,
}

/// In-process [`LockCoordinator`] with expiring leases.
///
/// Time is read through a [`TimeSource`] so lease expiry can be driven by a
/// mock clock in tests.
pub struct MemoryLockCoordinator<T = MonotonicClock>
where
    T: TimeSource<u64>,
{
    held: Mutex<HashMap<String, Held>>,
    next_token: AtomicU64,
    settings: LockSettings,
    time: T,
}

impl MemoryLockCoordinator<MonotonicClock> {
    pub fn new(settings: LockSettings) -> Self {
        Self::with_time(settings, MonotonicClock::default())
    }
}

impl Default for MemoryLockCoordinator<MonotonicClock> {
    fn default() -> Self {
        Self::new(LockSettings::default())
    }
}

impl<T> MemoryLockCoordinator<T>
where
    T: TimeSource<u64>,
{
    pub fn with_time(settings: LockSettings, time: T) -> Self {
        Self {
            held: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
            settings,
            time,
        }
    }

    pub const fn settings(&self) -> &LockSettings {
        &self.settings
    }

    /// Number of unexpired locks.
    pub fn held_len(&self) -> usize {
        let now = self.time.current_millis();
        self.held
            .lock()
            .values()
            .filter(|h| h.expires_at > now)
            .count()
    }

    /// Whether `key` is currently held under an unexpired lease.
    pub fn is_held(&self, key: &str) -> bool {
        let now = self.time.current_millis();
        self.held
            .lock()
            .get(key)
            .is_some_and(|h| h.expires_at > now)
    }

    /// One all-or-nothing pass over `keys`, which must be sorted and unique.
    fn try_acquire(&self, keys: &[String]) -> LockOutcome {
        let now = self.time.current_millis();
        let mut held = self.held.lock();

        if let Some(key) = keys
            .iter()
            .find(|key| held.get(*key).is_some_and(|h| h.expires_at > now))
        {
            return LockOutcome::Contended { key: key.clone() };
        }

        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let lease_ms = u64::try_from(self.settings.lease.as_millis()).unwrap_or(u64::MAX);
        let expires_at = now.saturating_add(lease_ms);
        for key in keys {
            held.insert(key.clone(), Held { token, expires_at });
        }

        LockOutcome::Acquired(Lease::new(token, keys.to_vec(), expires_at))
    }
}

#[async_trait]
impl<T> LockCoordinator for MemoryLockCoordinator<T>
where
    T: TimeSource<u64> + Send + Sync,
{
    #[cfg_attr(feature = "tracing", instrument(level = "trace", skip_all, fields(keys = keys.len())))]
    async fn acquire(&self, keys: &[String]) -> Result<LockOutcome> {
        if keys.is_empty() {
            return Err(Error::invalid("cannot lock an empty key set"));
        }

        let mut keys = keys.to_vec();
        keys.sort_unstable();
        keys.dedup();

        let mut backoff = self.settings.retry_backoff;
        let mut attempt = 0;
        loop {
            let outcome = self.try_acquire(&keys);
            match &outcome {
                LockOutcome::Acquired(_) => return Ok(outcome),
                LockOutcome::Contended { key } if attempt >= self.settings.retry_attempts => {
                    #[cfg(feature = "tracing")]
                    debug!(%key, attempt, "lock contention, giving up");
                    #[cfg(not(feature = "tracing"))]
                    let _ = key;
                    return Ok(outcome);
                }
                LockOutcome::Contended { .. } => {}
            }

            attempt += 1;
            tokio::time::sleep(backoff).await;
            backoff = backoff.saturating_mul(2);
        }
    }

    async fn release(&self, lease: &Lease) -> Result<()> {
        let mut held = self.held.lock();
        for key in lease.keys() {
            if held.get(key).is_some_and(|h| h.token == lease.token()) {
                held.remove(key);
            }
        }
        Ok(())
    }
}
