//! Convenient imports for pmkit.
//!
//! ```ignore
//! use pmkit::prelude::*;
//!
//! let pool = Pool::anonymous(1 << 20)?;
//! let handle = pool.handle();
//! let mut tx = Transaction::begin(&handle)?;
//! let value = make_persistent(&handle, 7u32)?;
//! tx.commit()?;
//! ```

// Pool
pub use pmkit_core::{AllocFlags, PoolRef, PoolService};
pub use pmkit_pool::{Pool, PoolBuilder, PoolConfig};

// Error handling
pub use crate::error::{Error, Result};

// Pointers
pub use pmkit_ptr::{AtomicRelPtr, AtomicTaggedPtr, RelPtr, TaggedPtr, Target};

// Transactions
pub use pmkit_txn::{
    current_stage, delete_persistent, delete_persistent_array, delete_persistent_atomic,
    make_persistent, make_persistent_array, make_persistent_atomic, make_persistent_in_place,
    Transaction, TxLock, TxStage,
};

// Synchronization
pub use pmkit_sync::{Deadline, PCondvar, PMutex, PSharedMutex, WaitStatus};
