//! Synchronization primitives that live inside a pool
//!
//! - PMutex: exclusive lock
//! - PSharedMutex: reader-writer lock
//! - PCondvar: condition variable waiting on a PMutex
//!
//! Each primitive must be built in place with `init` on storage inside a
//! registered pool. A primitive remembers the pool run it was initialised
//! under, so a lock left held by a process that died is reset on first use
//! after the pool is reopened. `PMutex` and `PSharedMutex` can be handed to a
//! transaction, which then releases them when it ends.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod condvar;
pub mod mutex;
mod runid;
pub mod shared_mutex;

pub use condvar::{Deadline, PCondvar, WaitStatus};
pub use mutex::{PMutex, PMutexGuard};
pub use shared_mutex::PSharedMutex;
