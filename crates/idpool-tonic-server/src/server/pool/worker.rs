use crate::server::{pool::request::WorkRequest, service::backend::Orchestrator};
use core::time::Duration;
use idpool_tonic_core::Error;
use std::sync::Arc;
use tokio::{sync::mpsc, time::timeout};

/// Worker task responsible for processing [`WorkRequest`] messages.
///
/// Every worker shares the same [`Orchestrator`]; all mutable state lives in
/// its collaborators, so workers never coordinate with each other directly.
/// Each dispatch runs under `dispatch_timeout`. When the deadline fires the
/// attempt is dropped mid-flight and any lock it held is left to expire with
/// its lease.
///
/// # Request Types
///
/// - [`WorkRequest::Dispatch`] - runs one dispatch attempt.
/// - [`WorkRequest::Shutdown`] - acknowledges and stops the loop.
pub async fn worker_loop(
    worker_id: usize,
    mut rx: mpsc::Receiver<WorkRequest>,
    orchestrator: Arc<Orchestrator>,
    dispatch_timeout: Duration,
) {
    #[cfg(feature = "tracing")]
    tracing::trace!("Worker {worker_id} started");

    while let Some(work) = rx.recv().await {
        match work {
            WorkRequest::Dispatch { request, response } => {
                let result = match timeout(dispatch_timeout, orchestrator.dispatch(request)).await {
                    Ok(outcome) => outcome.map_err(Error::from),
                    Err(_elapsed) => Err(Error::DeadlineExceeded {
                        timeout_ms: dispatch_timeout.as_millis() as u64,
                    }),
                };

                if response.send(result).is_err() {
                    // The caller went away; the dispatch itself has already
                    // completed or been abandoned.
                    #[cfg(feature = "tracing")]
                    tracing::debug!("Worker {worker_id} dropped a response for a departed caller");
                }
            }
            WorkRequest::Shutdown { response } => {
                #[cfg(feature = "tracing")]
                tracing::debug!("Worker {worker_id} received shutdown signal");

                if response.send(()).is_err() {
                    #[cfg(feature = "tracing")]
                    tracing::error!("Worker {worker_id} failed to acknowledge shutdown");
                }
                break;
            }
        }
    }

    #[cfg(not(feature = "tracing"))]
    let _ = worker_id;
    #[cfg(feature = "tracing")]
    tracing::trace!("Worker {worker_id} stopped");
}
