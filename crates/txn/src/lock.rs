//! Lock participation
//!
//! A persistent lock can be handed to the active transaction, which acquires
//! it and becomes responsible for releasing it. Every registered lock is
//! released exactly once, when the outermost scope leaves `WORK` (or when an
//! abort moves it to `ONABORT`), before any commit or abort callback runs.

use pmkit_core::Result;
use std::fmt;

/// Kind of a lock taking part in a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockKind {
    /// Exclusive mutex
    Mutex,
    /// Reader-writer lock, taken for writing
    SharedMutex,
}

impl fmt::Display for LockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockKind::Mutex => write!(f, "mutex"),
            LockKind::SharedMutex => write!(f, "shared mutex"),
        }
    }
}

/// A lock that a transaction can acquire and release on the owner's behalf
///
/// # Safety
///
/// The transaction keeps the lock's address until it releases it. An
/// implementor must live inside a pool and must not move or be freed while
/// registered; `tx_release` must undo exactly one successful `tx_acquire`.
pub unsafe trait TxLock {
    /// Kind reported to the transaction
    fn lock_kind(&self) -> LockKind;

    /// Acquire exclusively, blocking until available
    fn tx_acquire(&self) -> Result<()>;

    /// Release an acquisition made by `tx_acquire`
    fn tx_release(&self) -> Result<()>;
}

/// A lock held by the active transaction
pub(crate) struct HeldLock {
    lock: *const (dyn TxLock + 'static),
    kind: LockKind,
}

impl HeldLock {
    pub(crate) fn new(lock: &(dyn TxLock + 'static)) -> Self {
        HeldLock {
            kind: lock.lock_kind(),
            lock,
        }
    }

    pub(crate) fn addr(&self) -> usize {
        self.lock as *const u8 as usize
    }

    /// Release, logging instead of failing so that later locks still run
    pub(crate) fn release(self) {
        // SAFETY: TxLock implementors stay in place while registered and the
        // owning pool is kept mapped by the transaction
        let lock = unsafe { &*self.lock };
        if let Err(e) = lock.tx_release() {
            tracing::error!(
                kind = %self.kind,
                addr = self.addr(),
                error = %e,
                "failed to release transaction lock"
            );
        }
    }
}

/// Release every lock, most recently acquired first
pub(crate) fn release_all(locks: Vec<HeldLock>) {
    let count = locks.len();
    for lock in locks.into_iter().rev() {
        lock.release();
    }
    if count > 0 {
        tracing::debug!(count, "transaction locks released");
    }
}
