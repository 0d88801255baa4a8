use crate::{EventPayload, Result};
use async_trait::async_trait;

/// Fire-and-forget sink for dispatch events.
///
/// A successful return means the message sink accepted the payload, not that
/// any consumer has processed it. A sink that cannot accept the payload
/// reports [`Error::Publish`](crate::Error::Publish).
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: EventPayload) -> Result<()>;
}
