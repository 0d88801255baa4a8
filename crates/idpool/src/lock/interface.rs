use crate::Result;
use async_trait::async_trait;

/// Proof of ownership for a set of ID locks.
///
/// A lease is only valid for the `token` that created it; releasing with a
/// stale token is a no-op, so a holder whose lease expired cannot free locks
/// that another holder has since acquired.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Lease {
    token: u64,
    keys: Vec<String>,
    expires_at: u64,
}

impl Lease {
    pub fn new(token: u64, keys: Vec<String>, expires_at: u64) -> Self {
        Self {
            token,
            keys,
            expires_at,
        }
    }

    pub const fn token(&self) -> u64 {
        self.token
    }

    /// The locked keys, sorted and deduplicated.
    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    /// Milliseconds since the UNIX epoch at which the lease lapses.
    pub const fn expires_at(&self) -> u64 {
        self.expires_at
    }
}

/// Result of an acquisition attempt that reached the lock service.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LockOutcome {
    /// Every requested key is now held under the returned lease.
    Acquired(Lease),
    /// `key` is held by someone else; nothing was acquired.
    Contended { key: String },
}

/// Distributed mutual exclusion keyed by ID.
///
/// Acquisition is all-or-nothing over the requested keys. Leases are bounded
/// so a crashed holder cannot block an ID forever.
#[async_trait]
pub trait LockCoordinator: Send + Sync {
    /// Tries to take every lock in `keys`.
    ///
    /// Returns [`LockOutcome::Contended`] if any key stays held after the
    /// coordinator's retry budget, or an
    /// [`Error::LockService`](crate::Error::LockService) if the service is
    /// unreachable.
    async fn acquire(&self, keys: &[String]) -> Result<LockOutcome>;

    /// Releases the locks held under `lease`. Keys re-acquired by another
    /// holder after expiry are left untouched.
    async fn release(&self, lease: &Lease) -> Result<()>;
}
