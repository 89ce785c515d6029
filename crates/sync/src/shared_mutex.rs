//! Persistent reader-writer lock

use crate::runid;
use parking_lot::RwLock;
use pmkit_core::{Error, LockFault, Result};
use pmkit_txn::{LockKind, TxLock};
use std::cell::UnsafeCell;
use std::fmt;
use std::mem::{self, MaybeUninit};
use std::sync::atomic::AtomicU64;

/// Reader-writer lock whose storage lives in a pool
///
/// Exclusive holders exclude everyone; shared holders only exclude
/// exclusive ones. No fairness between the two is promised. A transaction
/// always takes it exclusively.
#[repr(C)]
pub struct PSharedMutex {
    run_id: AtomicU64,
    inner: UnsafeCell<RwLock<()>>,
}

// SAFETY: see PMutex; `inner` is only replaced during the run-id reset
unsafe impl Sync for PSharedMutex {}

impl PSharedMutex {
    /// Construct an unlocked lock in `slot`, which must lie inside a pool
    pub fn init(slot: &mut MaybeUninit<Self>) -> Result<&mut Self> {
        let (pool, run) = runid::for_new(slot.as_ptr(), "shared mutex")?;
        let lock = slot.write(PSharedMutex {
            run_id: AtomicU64::new(run),
            inner: UnsafeCell::new(RwLock::new(())),
        });
        pool.persist(lock as *const Self as *const u8, mem::size_of::<Self>());
        Ok(lock)
    }

    fn raw(&self) -> Result<&RwLock<()>> {
        runid::ensure_current(&self.run_id, self, "shared mutex", || {
            // SAFETY: no other thread touches `inner` until the new run id is
            // published
            unsafe { self.inner.get().write(RwLock::new(())) }
        })?;
        // SAFETY: initialised for the current run
        Ok(unsafe { &*self.inner.get() })
    }

    /// Block until held exclusively
    pub fn lock(&self) -> Result<()> {
        mem::forget(self.raw()?.write());
        Ok(())
    }

    /// Exclusive acquisition without blocking
    pub fn try_lock(&self) -> Result<bool> {
        Ok(self.raw()?.try_write().map(mem::forget).is_some())
    }

    /// Release an exclusive hold
    pub fn unlock(&self) -> Result<()> {
        let raw = self.raw()?;
        if !raw.is_locked_exclusive() {
            return Err(Error::lock(
                LockFault::NotLocked,
                "failed to unlock a shared mutex",
            ));
        }
        // SAFETY: held exclusively; the guard was forgotten at acquisition
        unsafe { raw.force_unlock_write() };
        Ok(())
    }

    /// Block until held shared
    pub fn lock_shared(&self) -> Result<()> {
        mem::forget(self.raw()?.read());
        Ok(())
    }

    /// Shared acquisition without blocking
    pub fn try_lock_shared(&self) -> Result<bool> {
        Ok(self.raw()?.try_read().map(mem::forget).is_some())
    }

    /// Release one shared hold
    pub fn unlock_shared(&self) -> Result<()> {
        let raw = self.raw()?;
        if !raw.is_locked() || raw.is_locked_exclusive() {
            return Err(Error::lock(
                LockFault::NotLocked,
                "failed to shared unlock a shared mutex",
            ));
        }
        // SAFETY: at least one shared hold exists and its guard was forgotten
        unsafe { raw.force_unlock_read() };
        Ok(())
    }

    /// Whether any holder, shared or exclusive, exists
    pub fn is_locked(&self) -> bool {
        self.raw().map_or(false, |raw| raw.is_locked())
    }

    /// Whether a writer holds the lock
    pub fn is_locked_exclusive(&self) -> bool {
        self.raw().map_or(false, |raw| raw.is_locked_exclusive())
    }
}

impl fmt::Debug for PSharedMutex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PSharedMutex")
            .field("locked", &self.is_locked())
            .field("exclusive", &self.is_locked_exclusive())
            .finish()
    }
}

// SAFETY: a PSharedMutex can only be built in pool memory by `init`
unsafe impl TxLock for PSharedMutex {
    fn lock_kind(&self) -> LockKind {
        LockKind::SharedMutex
    }

    fn tx_acquire(&self) -> Result<()> {
        self.lock()
    }

    fn tx_release(&self) -> Result<()> {
        self.unlock()
    }
}
