//! Error types shared by every pmkit crate
//!
//! One enum covers the whole failure taxonomy:
//! - Configuration: a persistent primitive was built outside any pool
//! - Scope: a transactional call was made outside the `WORK` stage
//! - Allocation: split into out-of-memory and generic failure
//! - Free: the allocator rejected a pointer handed back to it
//! - Lock: a synchronization call faulted (never used for "would block")
//!
//! Nothing in pmkit swallows an error; every failure is returned from the
//! call that detected it.

use std::fmt;
use thiserror::Error;

/// Fault reported by a persistent synchronization primitive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockFault {
    /// The primitive's storage is not inside a registered pool
    NotInPool,
    /// Unlock was requested on a lock that is not held
    NotLocked,
    /// The requested operation is not supported by this lock kind
    Unsupported,
}

impl LockFault {
    /// errno-style status code, as a native lock implementation would report
    pub fn code(&self) -> i32 {
        match self {
            LockFault::NotInPool => 1,
            LockFault::NotLocked => 1,
            LockFault::Unsupported => 95,
        }
    }
}

impl fmt::Display for LockFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockFault::NotInPool => write!(f, "not in persistent memory"),
            LockFault::NotLocked => write!(f, "not locked"),
            LockFault::Unsupported => write!(f, "unsupported"),
        }
    }
}

/// All pmkit errors.
#[derive(Debug, Error)]
pub enum Error {
    /// Storage for a persistent primitive does not belong to any pool
    #[error("configuration error: {0}")]
    Config(String),

    /// Transactional operation invoked outside the WORK stage
    #[error("transaction scope error: {0}")]
    Scope(String),

    /// Allocator reported resource exhaustion
    #[error("out of memory: {0}")]
    OutOfMemory(String),

    /// Allocation failed for a reason other than exhaustion
    #[error("allocation failed: {0}")]
    Alloc(String),

    /// Allocator refused to free a pointer
    #[error("free failed: {0}")]
    Free(String),

    /// Native synchronization call faulted
    #[error("lock error ({kind}, code {}): {message}", .kind.code())]
    Lock {
        /// Fault classification
        kind: LockFault,
        /// What the caller was doing
        message: String,
    },

    /// Transaction was rolled back
    #[error("transaction aborted: {0}")]
    Aborted(String),

    /// A user-supplied constructor failed
    #[error("constructor failed: {0}")]
    Construct(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Pool header or geometry is unusable
    #[error("invalid pool: {0}")]
    InvalidPool(String),

    /// I/O error while mapping or flushing a pool
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for pmkit operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Build a lock error
    pub fn lock(kind: LockFault, message: impl Into<String>) -> Self {
        Error::Lock {
            kind,
            message: message.into(),
        }
    }

    /// Wrap any error raised by a constructor
    pub fn construct<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Error::Construct(Box::new(err))
    }

    /// Check if this is a scope error
    pub fn is_scope_error(&self) -> bool {
        matches!(self, Error::Scope(_))
    }

    /// Check if this is either allocation failure kind
    pub fn is_alloc_error(&self) -> bool {
        matches!(self, Error::OutOfMemory(_) | Error::Alloc(_))
    }

    /// Check if this is an out-of-memory error
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, Error::OutOfMemory(_))
    }

    /// Check if the transaction was rolled back
    pub fn is_aborted(&self) -> bool {
        matches!(self, Error::Aborted(_))
    }

    /// Check if this is a lock error
    pub fn is_lock_error(&self) -> bool {
        matches!(self, Error::Lock { .. })
    }

    /// Check if this error is retryable.
    ///
    /// An aborted transaction may be rerun from the start, and exhaustion may
    /// clear once other transactions free memory.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Aborted(_) | Error::OutOfMemory(_))
    }
}
