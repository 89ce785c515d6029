//! Reference pool service for pmkit
//!
//! A [`Pool`] is a `memmap2` mapping (anonymous or file-backed) carved into
//! a header and a block heap. It implements
//! [`PoolService`](pmkit_core::PoolService), which is everything the
//! pointer, transaction and lock layers need from a pool:
//! - raw and reserve/construct/publish allocation
//! - ownership queries (`usable_size`, `type_tag`)
//! - persistence barriers
//! - a run id that changes on every open
//!
//! # Example
//!
//! ```ignore
//! use pmkit_pool::Pool;
//!
//! let pool = Pool::create("./data.pool", 16 << 20)?;
//! // ... allocate, set_root ...
//! drop(pool);
//!
//! let pool = Pool::open("./data.pool")?;
//! let root = pool.root::<MyRoot>();
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
mod heap;
pub mod layout;
mod mapping;
pub mod pool;

pub use config::{PoolBuilder, PoolConfig, DEFAULT_POOL_SIZE};
pub use heap::RecoveryStats;
pub use layout::MIN_POOL_SIZE;
pub use pool::{Pool, PoolStats};
