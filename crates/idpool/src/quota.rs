use crate::{Error, PoolCache, QuotaKey, Result};
use core::{fmt, str::FromStr};

/// How the per-pair ceiling is enforced.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum QuotaMode {
    /// The counter is reserved atomically under the ID lock, so concurrent
    /// requests for the same pair can never overshoot the limit.
    #[default]
    Hard,
    /// The counter is checked before locking and incremented afterwards.
    /// Concurrent requests for the same pair may overshoot by up to one batch
    /// each.
    Soft,
}

impl fmt::Display for QuotaMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Hard => "hard",
            Self::Soft => "soft",
        })
    }
}

impl FromStr for QuotaMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hard" => Ok(Self::Hard),
            "soft" => Ok(Self::Soft),
            other => Err(Error::invalid(format!(
                "unknown quota mode `{other}`, expected `hard` or `soft`"
            ))),
        }
    }
}

/// Snapshot taken by [`QuotaGuard::check`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QuotaCheck {
    pub dispatched: u64,
    pub requested: u64,
    pub limit: u64,
}

impl QuotaCheck {
    /// What the pair may still request once this batch goes through.
    pub const fn remaining_after(&self) -> u64 {
        self.limit
            .saturating_sub(self.dispatched)
            .saturating_sub(self.requested)
    }
}

/// Validates requests and enforces the per-pair lifetime ceiling.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QuotaGuard {
    limit: u64,
    mode: QuotaMode,
}

impl QuotaGuard {
    pub const fn new(limit: u64, mode: QuotaMode) -> Self {
        Self { limit, mode }
    }

    pub const fn limit(&self) -> u64 {
        self.limit
    }

    pub const fn mode(&self) -> QuotaMode {
        self.mode
    }

    /// Rejects malformed requests before anything touches shared state.
    ///
    /// Returns the accepted count as a batch size.
    pub fn validate(&self, requester_id: &str, device_id: &str, count: i64) -> Result<usize> {
        Self::validate_pair(requester_id, device_id)?;
        if count <= 0 {
            return Err(Error::invalid(format!("count must be positive, got {count}")));
        }
        // count > 0 from here on.
        let requested = count as u64;
        if requested > self.limit {
            return Err(Error::invalid(format!(
                "count {count} exceeds the per-request limit of {}",
                self.limit
            )));
        }
        usize::try_from(requested)
            .map_err(|_| Error::invalid(format!("count {count} is not addressable")))
    }

    /// Both halves of a [`QuotaKey`] must be present.
    pub fn validate_pair(requester_id: &str, device_id: &str) -> Result<()> {
        if requester_id.trim().is_empty() {
            return Err(Error::invalid("requester id is required"));
        }
        if device_id.trim().is_empty() {
            return Err(Error::invalid("device id is required"));
        }
        Ok(())
    }

    /// Reads the pair's counter and fails with [`Error::QuotaExceeded`] if the
    /// batch would push it past the limit.
    ///
    /// Does not reserve anything; under [`QuotaMode::Hard`] the orchestrator
    /// re-checks atomically once the IDs are locked.
    pub async fn check<C>(&self, cache: &C, key: &QuotaKey, count: usize) -> Result<QuotaCheck>
    where
        C: PoolCache + ?Sized,
    {
        let dispatched = cache.dispatched_count(key).await?;
        let requested = count as u64;

        if dispatched.saturating_add(requested) > self.limit {
            return Err(Error::QuotaExceeded {
                key: key.clone(),
                dispatched,
                requested,
                limit: self.limit,
            });
        }

        Ok(QuotaCheck {
            dispatched,
            requested,
            limit: self.limit,
        })
    }
}
