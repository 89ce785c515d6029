//! Transactions for pmkit pools
//!
//! This crate provides:
//! - TxStage: the per-thread stage machine (`NONE`, `WORK`, `ONCOMMIT`,
//!   `ONABORT`, `FINALLY`)
//! - Transaction: an RAII scope with an undo log, stage callbacks and
//!   lock participation
//! - The transactional allocation protocol (`make_persistent*`,
//!   `delete_persistent*`), legal only in `WORK`
//! - The atomic allocation path (`*_atomic`), legal only outside `WORK`
//!
//! # Example
//!
//! ```ignore
//! use pmkit_txn::{make_persistent, run};
//!
//! run(&pool, |tx| {
//!     let node = make_persistent(&pool, Node::new(7))?;
//!     tx.snapshot(&root.head)?;
//!     root.head.set(node.as_ptr());
//!     Ok(())
//! })?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod alloc;
pub mod lock;
mod log;
pub mod scope;
pub mod stage;

pub use alloc::{
    delete_persistent, delete_persistent_array, delete_persistent_atomic, make_persistent,
    make_persistent_array, make_persistent_array_atomic, make_persistent_array_in_place,
    make_persistent_atomic, make_persistent_in_place, make_persistent_with,
};
pub use lock::{LockKind, TxLock};
pub use scope::{register_lock, run, run_locked, Transaction};
pub use stage::{current_stage, TxStage};
