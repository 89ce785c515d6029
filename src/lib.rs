//! # pmkit
//!
//! Relocatable pointers and transactional allocation for persistent memory
//! pools.
//!
//! A pool is a memory region that may be mapped at a different address every
//! time a process opens it. Data structures inside it link their nodes with
//! self-relative pointers and change shape inside transactions, so a failure
//! part way through leaves the pool as it was.
//!
//! ## Quick Start
//!
//! ```ignore
//! use pmkit::prelude::*;
//!
//! let pool = Pool::create("./nodes.pool", 8 << 20)?;
//! let handle = pool.handle();
//!
//! let node = pmkit::txn::run(&handle, |_tx| make_persistent(&handle, 42u64))?;
//! pool.set_root(node)?;
//! ```
//!
//! ## Layers
//!
//! - [`ptr`] - `RelPtr`, `AtomicRelPtr`, `TaggedPtr` and `AtomicTaggedPtr`
//! - [`pool`] - the mapped pool, its heap and configuration
//! - [`txn`] - transaction stages, undo log and the allocation protocol
//! - [`sync`] - `PMutex`, `PSharedMutex` and `PCondvar` stored in a pool

#![warn(missing_docs)]

mod error;

pub mod prelude;

pub use error::{Error, LockFault, Result};

pub use pmkit_pool as pool;
pub use pmkit_ptr as ptr;
pub use pmkit_sync as sync;
pub use pmkit_txn as txn;

// Re-export main entry points
pub use pmkit_core::{pool_handle_for, AllocFlags, PoolRef, PoolService, TypeTag};
pub use pmkit_pool::{Pool, PoolBuilder, PoolConfig};
