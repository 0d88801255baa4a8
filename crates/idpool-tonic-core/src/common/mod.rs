//! Shared protocol, conversions and errors used by the `idpool` gRPC server
//! and its clients.
//!
//! ## Submodules
//!
//! - [`proto`] - generated messages, client and server for the `IdDispatcher`
//!   service, plus the encoded descriptor set for reflection.
//! - [`error`] - wire-level error type and its mapping onto [`tonic::Status`].
//! - [`types`] - conversions between wire messages and `idpool` domain types.

pub mod error;
pub mod types;
pub use error::*;

pub mod proto {
    tonic::include_proto!("idpool");
    pub const FILE_DESCRIPTOR_SET: &[u8] = tonic::include_file_descriptor_set!("idpool_descriptor");
}
