#![doc = include_str!("../README.md")]

mod cache;
mod dispatch;
mod error;
mod lock;
mod publish;
mod quota;
mod record;
mod store;
mod time;

pub use crate::cache::*;
pub use crate::dispatch::*;
pub use crate::error::*;
pub use crate::lock::*;
pub use crate::publish::*;
pub use crate::quota::*;
pub use crate::record::*;
pub use crate::store::*;
pub use crate::time::*;

/// Re-exported so downstream crates can implement the collaborator traits
/// without a direct dependency on `async-trait`.
pub use async_trait::async_trait;
