//! Asynchronous worker pool for dispatch requests.
//!
//! This module defines the [`WorkerPool`] struct, which manages a set of
//! asynchronous workers responsible for processing [`WorkRequest`]s. It
//! distributes work using round-robin scheduling, tracks in-flight dispatches
//! and supports coordinated shutdown via a [`CancellationToken`].

use crate::server::pool::request::WorkRequest;
use core::time::Duration;
use idpool_tonic_core::{
    Error,
    idpool::{DispatchRequest, DispatchResponse},
};
use portable_atomic::{AtomicUsize, Ordering};
use tokio::{
    sync::{mpsc, oneshot},
    time::{sleep, timeout},
};
use tokio_util::sync::CancellationToken;

/// A cooperative pool of asynchronous workers that process [`WorkRequest`]s.
pub struct WorkerPool {
    workers: Vec<mpsc::Sender<WorkRequest>>,
    next_worker: AtomicUsize,
    inflight: AtomicUsize,
    shutdown_token: CancellationToken,
    shutdown_timeout: Duration,
}

/// Counts a dispatch as in flight for as long as it is alive.
pub struct InflightGuard<'a> {
    inflight: &'a AtomicUsize,
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        self.inflight.fetch_sub(1, Ordering::AcqRel);
    }
}

impl WorkerPool {
    pub fn new(
        workers: Vec<mpsc::Sender<WorkRequest>>,
        shutdown_token: CancellationToken,
        shutdown_timeout: Duration,
    ) -> Self {
        Self {
            workers,
            next_worker: AtomicUsize::new(0),
            inflight: AtomicUsize::new(0),
            shutdown_token,
            shutdown_timeout,
        }
    }

    /// Returns the index of the next worker to receive work (round-robin).
    pub fn next_worker_index(&self) -> usize {
        self.next_worker.fetch_add(1, Ordering::Relaxed) % self.workers.len()
    }

    pub fn inflight(&self) -> usize {
        self.inflight.load(Ordering::Acquire)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown_token.is_cancelled()
    }

    /// Runs one dispatch on the next worker and waits for its outcome.
    ///
    /// # Errors
    ///
    /// - [`Error::ServiceShutdown`] once shutdown has started.
    /// - [`Error::ChannelError`] if the worker is gone.
    /// - Whatever the dispatch itself failed with.
    pub async fn dispatch(&self, request: DispatchRequest) -> Result<DispatchResponse, Error> {
        if self.shutdown_token.is_cancelled() {
            return Err(Error::ServiceShutdown);
        }

        self.inflight.fetch_add(1, Ordering::AcqRel);
        let _guard = InflightGuard {
            inflight: &self.inflight,
        };

        let (tx, rx) = oneshot::channel();
        let worker_idx = self.send_to_next_worker(WorkRequest::Dispatch {
            request,
            response: tx,
        })
        .await?;

        rx.await.map_err(|_| Error::ChannelError {
            context: format!("Worker {worker_idx} dropped the response"),
        })?
    }

    /// Sends a [`WorkRequest`] to the next worker in the pool and returns the
    /// worker's index.
    async fn send_to_next_worker(&self, request: WorkRequest) -> Result<usize, Error> {
        let worker_idx = self.next_worker_index();
        let worker = &self.workers[worker_idx];

        match worker.send(request).await {
            Ok(()) => Ok(worker_idx),
            Err(_) => Err(Error::ChannelError {
                context: format!("Worker {worker_idx} channel closed"),
            }),
        }
    }

    /// Gracefully shuts down all workers in the pool.
    ///
    /// - Cancels the [`CancellationToken`] so new dispatches are refused.
    /// - Waits up to `shutdown_timeout` for in-flight dispatches to finish.
    /// - Sends a [`WorkRequest::Shutdown`] to each worker and waits (up to 3
    ///   seconds per worker) for the acknowledgement.
    pub async fn shutdown(&self) -> Result<(), Error> {
        // === Phase 0: Stop accepting new requests ===
        #[cfg(feature = "tracing")]
        tracing::info!("Refusing new dispatches");
        self.shutdown_token.cancel();

        // === Phase 1: Wait for in-flight dispatches to drain ===
        #[cfg(feature = "tracing")]
        tracing::info!("Draining in-flight dispatches ({} active)", self.inflight());
        let drain_result = timeout(self.shutdown_timeout, async {
            while self.inflight() > 0 {
                sleep(Duration::from_millis(50)).await;
            }
        })
        .await;

        match drain_result {
            Ok(()) => {
                #[cfg(feature = "tracing")]
                tracing::debug!("All in-flight dispatches drained");
            }
            Err(_) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(
                    "Graceful drain timed out ({} dispatches still active)",
                    self.inflight()
                );
            }
        }

        // === Phase 2: Notify workers to shut down ===
        #[cfg(feature = "tracing")]
        tracing::debug!("Notifying all workers to shut down");
        let mut shutdown_handles = Vec::with_capacity(self.workers.len());

        for (i, worker) in self.workers.iter().enumerate() {
            let (tx, rx) = oneshot::channel();
            if let Err(_e) = worker.send(WorkRequest::Shutdown { response: tx }).await {
                #[cfg(feature = "tracing")]
                tracing::error!("Failed to send shutdown to worker {i}: {_e}");
            } else {
                shutdown_handles.push((i, rx));
            }
        }

        let timeout_futures = shutdown_handles.into_iter().map(|(_i, rx)| async move {
            match timeout(Duration::from_secs(3), rx).await {
                Ok(Ok(())) => {
                    #[cfg(feature = "tracing")]
                    tracing::trace!("Worker {_i} shutdown acknowledged");
                }
                Ok(Err(_e)) => {
                    #[cfg(feature = "tracing")]
                    tracing::error!("Worker {_i} returned error: {_e}");
                }
                Err(_) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!("Worker {_i} shutdown timed out");
                }
            }
        });

        futures::future::join_all(timeout_futures).await;

        #[cfg(feature = "tracing")]
        tracing::info!("Worker pool shutdown complete");

        Ok(())
    }
}
