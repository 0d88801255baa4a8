//! Error types for the dispatch service.
//!
//! [`Error`] wraps every [`idpool::Error`] and adds the failures that only
//! exist once a request crosses the wire: undecodable payloads, deadlines,
//! worker channels and shutdown. `From<Error>` for [`Status`] picks the gRPC
//! code and attaches the stable error code as `x-error-code` metadata so
//! clients can branch without parsing messages.

use tonic::{Code, Status, metadata::MetadataValue};

pub type Result<T> = core::result::Result<T, Error>;

/// Metadata key carrying [`Error::code`] on every failed response.
pub const ERROR_CODE_KEY: &str = "x-error-code";

/// Unified error type for the dispatch service.
#[derive(Clone, thiserror::Error, Debug)]
pub enum Error {
    /// The dispatch protocol rejected or failed the request.
    #[error(transparent)]
    Dispatch(#[from] idpool::Error),

    /// The wire payload could not be turned into a domain request.
    #[error("Invalid request: {reason}")]
    InvalidRequest { reason: String },

    /// The dispatch did not finish within its deadline.
    #[error("Dispatch did not complete within {timeout_ms}ms")]
    DeadlineExceeded { timeout_ms: u64 },

    /// Internal channel send/receive failure (e.g., closed or full channel).
    #[error("Channel error: {context}")]
    ChannelError { context: String },

    /// The service is in the process of shutting down.
    #[error("Service is shutting down")]
    ServiceShutdown,
}

impl Error {
    /// Stable, machine-readable error code.
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Dispatch(e) => e.code(),
            Self::InvalidRequest { .. } => "INVALID_REQUEST",
            Self::DeadlineExceeded { .. } => "DEADLINE_EXCEEDED",
            Self::ChannelError { .. } => "CHANNEL_ERROR",
            Self::ServiceShutdown => "SERVICE_SHUTDOWN",
        }
    }

    fn grpc_code(&self) -> Code {
        match self {
            Self::Dispatch(e) => match e {
                idpool::Error::InvalidRequest { .. } => Code::InvalidArgument,
                idpool::Error::QuotaExceeded { .. } => Code::ResourceExhausted,
                idpool::Error::NoIdsAvailable { .. } => Code::Unavailable,
                idpool::Error::LockingError { .. } => Code::Aborted,
                idpool::Error::Cache(_)
                | idpool::Error::Store(_)
                | idpool::Error::LockService(_) => Code::Unavailable,
                _ => Code::Internal,
            },
            Self::InvalidRequest { .. } => Code::InvalidArgument,
            Self::DeadlineExceeded { .. } => Code::DeadlineExceeded,
            Self::ChannelError { .. } => Code::Internal,
            Self::ServiceShutdown => Code::Unavailable,
        }
    }
}

impl From<Error> for Status {
    fn from(err: Error) -> Self {
        let mut status = Status::new(err.grpc_code(), err.to_string());
        status
            .metadata_mut()
            .insert(ERROR_CODE_KEY, MetadataValue::from_static(err.code()));
        status
    }
}

/// Reads the stable error code back out of a failed response.
pub fn error_code(status: &Status) -> Option<&str> {
    status.metadata().get(ERROR_CODE_KEY)?.to_str().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use idpool::QuotaKey;

    fn status_of(err: impl Into<Error>) -> Status {
        err.into().into()
    }

    #[test]
    fn dispatch_errors_map_to_distinct_grpc_codes() {
        let cases = [
            (
                status_of(idpool::Error::invalid("count must be positive")),
                Code::InvalidArgument,
                "INVALID_REQUEST",
            ),
            (
                status_of(idpool::Error::QuotaExceeded {
                    key: QuotaKey::new("u", "d"),
                    dispatched: 5,
                    requested: 1,
                    limit: 5,
                }),
                Code::ResourceExhausted,
                "QUOTA_EXCEEDED",
            ),
            (
                status_of(idpool::Error::NoIdsAvailable {
                    requested: 2,
                    available: 0,
                }),
                Code::Unavailable,
                "NO_IDS_AVAILABLE",
            ),
            (
                status_of(idpool::Error::LockingError { key: "A".into() }),
                Code::Aborted,
                "LOCKING_ERROR",
            ),
            (
                status_of(idpool::Error::Cache("reset".into())),
                Code::Unavailable,
                "CACHE_UNAVAILABLE",
            ),
            (
                status_of(idpool::Error::Publish("closed".into())),
                Code::Internal,
                "PUBLISH_FAILED",
            ),
        ];

        for (status, code, error_code_value) in cases {
            assert_eq!(status.code(), code);
            assert_eq!(error_code(&status), Some(error_code_value));
        }
    }

    #[test]
    fn transport_errors_map_to_grpc_codes() {
        let status = status_of(Error::DeadlineExceeded { timeout_ms: 5 });
        assert_eq!(status.code(), Code::DeadlineExceeded);
        assert_eq!(error_code(&status), Some("DEADLINE_EXCEEDED"));

        let status = status_of(Error::ServiceShutdown);
        assert_eq!(status.code(), Code::Unavailable);

        let status = status_of(Error::InvalidRequest {
            reason: "missing user_info".into(),
        });
        assert_eq!(status.code(), Code::InvalidArgument);
        assert!(status.message().contains("missing user_info"));
    }
}
