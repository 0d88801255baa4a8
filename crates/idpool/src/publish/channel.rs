use crate::{Envelope, Error, EventPayload, EventPublisher, Result};
use async_trait::async_trait;
use core::time::Duration;
use tokio::sync::mpsc::{self, error::SendTimeoutError};

#[cfg(feature = "tracing")]
use tracing::{trace, warn};

/// [`EventPublisher`] backed by a bounded tokio channel.
///
/// The receiving half is handed back from [`ChannelPublisher::new`] and
/// drained by whatever forwards events to the message sink. When the buffer
/// is full, `publish` waits up to `send_timeout` before failing, so a stalled
/// consumer applies back-pressure instead of growing memory without bound.
#[derive(Clone, Debug)]
pub struct ChannelPublisher {
    tx: mpsc::Sender<Envelope>,
    send_timeout: Duration,
}

impl ChannelPublisher {
    pub fn new(capacity: usize, send_timeout: Duration) -> (Self, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx, send_timeout }, rx)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[async_trait]
impl EventPublisher for ChannelPublisher {
    async fn publish(&self, topic: &str, payload: EventPayload) -> Result<()> {
        #[cfg(feature = "tracing")]
        trace!(topic, kind = payload.kind(), records = payload.len(), "publishing");

        let envelope = Envelope {
            topic: topic.to_string(),
            payload,
        };

        self.tx
            .send_timeout(envelope, self.send_timeout)
            .await
            .map_err(|e| {
                let reason = match e {
                    SendTimeoutError::Timeout(_) => {
                        format!("topic `{topic}` buffer full after {:?}", self.send_timeout)
                    }
                    SendTimeoutError::Closed(_) => format!("topic `{topic}` sink closed"),
                };
                #[cfg(feature = "tracing")]
                warn!(%reason, "publish failed");
                Error::Publish(reason)
            })
    }
}
