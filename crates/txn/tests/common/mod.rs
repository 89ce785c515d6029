//! Shared fixtures for transaction tests

#![allow(dead_code)]

use parking_lot::lock_api::RawMutex as _;
use pmkit_core::{AllocFlags, AllocRequest, Error, LockFault, PoolRef, PoolService, Result};
use pmkit_pool::Pool;
use pmkit_txn::{LockKind, TxLock};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

pub const POOL_SIZE: usize = 1 << 20;

pub fn pool() -> (Arc<Pool>, PoolRef) {
    let pool = Pool::anonymous(POOL_SIZE).unwrap();
    let handle = pool.handle();
    (pool, handle)
}

/// Exclusive lock with acquire/release counters
pub struct CountingLock {
    raw: parking_lot::RawMutex,
    pub acquired: AtomicUsize,
    pub released: AtomicUsize,
    pub fail_release: AtomicBool,
}

impl CountingLock {
    pub fn try_lock(&self) -> bool {
        let ok = self.raw.try_lock();
        if ok {
            // SAFETY: just acquired
            unsafe { self.raw.unlock() };
        }
        ok
    }

    pub fn is_locked(&self) -> bool {
        self.raw.is_locked()
    }
}

// SAFETY: instances are only created inside pool blocks that outlive the
// transactions using them
unsafe impl TxLock for CountingLock {
    fn lock_kind(&self) -> LockKind {
        LockKind::Mutex
    }

    fn tx_acquire(&self) -> Result<()> {
        self.raw.lock();
        self.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn tx_release(&self) -> Result<()> {
        self.released.fetch_add(1, Ordering::SeqCst);
        if self.fail_release.load(Ordering::SeqCst) {
            return Err(Error::lock(LockFault::Unsupported, "injected release failure"));
        }
        if !self.raw.is_locked() {
            return Err(Error::lock(LockFault::NotLocked, "release of an unlocked mutex"));
        }
        // SAFETY: held by the transaction
        unsafe { self.raw.unlock() };
        Ok(())
    }
}

/// Place a fresh lock inside `pool`
pub fn lock_in(pool: &Pool) -> &CountingLock {
    let raw = pool
        .alloc(AllocRequest::array::<CountingLock>(1, AllocFlags::NONE).unwrap())
        .unwrap()
        .cast::<CountingLock>();
    // SAFETY: fresh block sized for one lock; it stays allocated while the
    // pool lives
    unsafe {
        raw.as_ptr().write(CountingLock {
            raw: parking_lot::RawMutex::INIT,
            acquired: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
            fail_release: AtomicBool::new(false),
        });
        &*raw.as_ptr()
    }
}

/// Allocate a plain value outside any transaction
pub fn place<T>(pool: &Pool, value: T) -> NonNull<T> {
    let ptr = pool
        .alloc(AllocRequest::array::<T>(1, AllocFlags::NONE).unwrap())
        .unwrap()
        .cast::<T>();
    // SAFETY: fresh block sized for one T
    unsafe { ptr.as_ptr().write(value) };
    ptr
}
