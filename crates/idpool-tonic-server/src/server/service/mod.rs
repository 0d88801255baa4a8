//! gRPC service implementation and backend wiring.
//!
//! ## Structure
//!
//! - [`handler`] - gRPC service entry point (`DispatchService`).
//! - [`backend`] - construction of the collaborators behind the orchestrator.

pub mod backend;
pub mod handler;

#[cfg(test)]
mod tests;
