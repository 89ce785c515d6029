//! Core types for pmkit
//!
//! This crate defines what every other layer agrees on:
//! - Error: the failure taxonomy and `Result` alias
//! - Types: PoolId, TypeTag, AllocFlags, AllocRequest
//! - PoolService: the contract a mapped pool offers to the core
//! - Registry: address-to-pool resolution for the whole process

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod registry;
pub mod service;
pub mod types;

pub use error::{Error, LockFault, Result};
pub use registry::{pool_by_ptr, pool_handle_for};
pub use service::{AtomicCtor, PoolRef, PoolService};
pub use types::{AllocFlags, AllocRequest, PoolId, TypeTag};
