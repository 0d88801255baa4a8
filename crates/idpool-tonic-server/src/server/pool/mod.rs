//! Dispatch worker pool.
//!
//! - [`manager`] - [`WorkerPool`](manager::WorkerPool): round-robin routing,
//!   in-flight tracking and graceful shutdown.
//! - [`worker`] - the per-worker receive loop.
//! - [`request`] - messages exchanged with workers.

pub mod manager;
pub mod request;
pub mod worker;

#[cfg(test)]
mod tests;
