use crate::QuotaKey;

/// Result alias used by every `idpool` API.
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// All failures a dispatch attempt (or one of its collaborators) can surface.
///
/// The first four variants are the business outcomes of the dispatch
/// protocol. The remaining variants are infrastructure failures reported by a
/// collaborator; they are fatal for the attempt but the whole request can be
/// retried because nothing is mutated before the ID lock is held.
///
/// Every variant maps to a distinct, stable code via [`Error::code`].
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Malformed input: missing identifiers or an out-of-range count.
    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },

    /// The requester/device pair would exceed its dispatch ceiling.
    #[error(
        "quota exceeded for {key}: {dispatched} already dispatched, {requested} requested, limit {limit}"
    )]
    QuotaExceeded {
        key: QuotaKey,
        dispatched: u64,
        requested: u64,
        limit: u64,
    },

    /// Neither the pool cache nor the durable store could supply the full
    /// batch. Requests are never partially satisfied.
    #[error("no ids available: requested {requested}, found {available}")]
    NoIdsAvailable { requested: usize, available: usize },

    /// At least one selected ID is locked by another holder.
    #[error("unable to lock id `{key}`")]
    LockingError { key: String },

    /// The pool cache could not be reached or rejected an operation.
    #[error("pool cache unavailable: {0}")]
    Cache(String),

    /// The durable record store could not be reached.
    #[error("durable store unavailable: {0}")]
    Store(String),

    /// The lock service could not be reached.
    #[error("lock service unavailable: {0}")]
    LockService(String),

    /// An event could not be handed to the message sink.
    #[error("event publish failed: {0}")]
    Publish(String),
}

impl Error {
    /// Convenience constructor for [`Error::InvalidRequest`].
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidRequest {
            reason: reason.into(),
        }
    }

    /// Stable, machine-readable error code.
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest { .. } => "INVALID_REQUEST",
            Self::QuotaExceeded { .. } => "QUOTA_EXCEEDED",
            Self::NoIdsAvailable { .. } => "NO_IDS_AVAILABLE",
            Self::LockingError { .. } => "LOCKING_ERROR",
            Self::Cache(_) => "CACHE_UNAVAILABLE",
            Self::Store(_) => "STORE_UNAVAILABLE",
            Self::LockService(_) => "LOCK_SERVICE_UNAVAILABLE",
            Self::Publish(_) => "PUBLISH_FAILED",
        }
    }

    /// Whether the caller may retry the same request unchanged.
    ///
    /// Validation and quota failures are permanent for the request as
    /// submitted. Everything else depends on capacity, contention or
    /// infrastructure health.
    pub const fn is_retryable(&self) -> bool {
        !matches!(self, Self::InvalidRequest { .. } | Self::QuotaExceeded { .. })
    }

    /// Whether the failure came from an unreachable collaborator rather than
    /// from the dispatch protocol itself.
    pub const fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            Self::Cache(_) | Self::Store(_) | Self::LockService(_) | Self::Publish(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_distinct() {
        let errors = [
            Error::invalid("x"),
            Error::QuotaExceeded {
                key: QuotaKey::new("u", "d"),
                dispatched: 1,
                requested: 1,
                limit: 1,
            },
            Error::NoIdsAvailable {
                requested: 1,
                available: 0,
            },
            Error::LockingError { key: "a".into() },
            Error::Cache("down".into()),
            Error::Store("down".into()),
            Error::LockService("down".into()),
            Error::Publish("down".into()),
        ];

        let mut codes: Vec<_> = errors.iter().map(Error::code).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn only_validation_and_quota_are_permanent() {
        assert!(!Error::invalid("bad").is_retryable());
        assert!(
            !Error::QuotaExceeded {
                key: QuotaKey::new("u", "d"),
                dispatched: 5,
                requested: 1,
                limit: 5,
            }
            .is_retryable()
        );
        assert!(
            Error::NoIdsAvailable {
                requested: 1,
                available: 0
            }
            .is_retryable()
        );
        assert!(Error::LockingError { key: "a".into() }.is_retryable());
        assert!(Error::Publish("closed".into()).is_retryable());
        assert!(Error::Publish("closed".into()).is_infrastructure());
        assert!(!Error::LockingError { key: "a".into() }.is_infrastructure());
    }

    #[test]
    fn quota_message_names_the_pair() {
        let err = Error::QuotaExceeded {
            key: QuotaKey::new("user-1", "device-9"),
            dispatched: 3,
            requested: 3,
            limit: 5,
        };
        let msg = err.to_string();
        assert!(msg.contains("user-1"));
        assert!(msg.contains("device-9"));
        assert!(msg.contains("limit 5"));
    }
}
