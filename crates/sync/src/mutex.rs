//! Persistent exclusive lock

use crate::runid;
use parking_lot::Mutex;
use pmkit_core::{Error, LockFault, Result};
use pmkit_txn::{LockKind, TxLock};
use std::cell::UnsafeCell;
use std::fmt;
use std::mem::{self, MaybeUninit};
use std::sync::atomic::AtomicU64;

/// Mutex whose storage lives in a pool
///
/// Acquisition is explicit (`lock` / `unlock`) so that a transaction can take
/// over the release. `guard` gives scoped locking for code outside
/// transactions. A mutex found held after the pool is reopened is reset on
/// first use.
#[repr(C)]
pub struct PMutex {
    run_id: AtomicU64,
    inner: UnsafeCell<Mutex<()>>,
}

// SAFETY: `inner` is only replaced by the single thread that wins the run-id
// reset, while every other thread spins in `runid::ensure_current`
unsafe impl Sync for PMutex {}

impl PMutex {
    /// Construct an unlocked mutex in `slot`, which must lie inside a pool
    pub fn init(slot: &mut MaybeUninit<Self>) -> Result<&mut Self> {
        let (pool, run) = runid::for_new(slot.as_ptr(), "mutex")?;
        let mutex = slot.write(PMutex {
            run_id: AtomicU64::new(run),
            inner: UnsafeCell::new(Mutex::new(())),
        });
        pool.persist(mutex as *const Self as *const u8, mem::size_of::<Self>());
        Ok(mutex)
    }

    pub(crate) fn raw(&self) -> Result<&Mutex<()>> {
        runid::ensure_current(&self.run_id, self, "mutex", || {
            // SAFETY: no other thread touches `inner` until the new run id is
            // published
            unsafe { self.inner.get().write(Mutex::new(())) }
        })?;
        // SAFETY: initialised for the current run
        Ok(unsafe { &*self.inner.get() })
    }

    /// Block until the mutex is acquired
    pub fn lock(&self) -> Result<()> {
        mem::forget(self.raw()?.lock());
        Ok(())
    }

    /// Acquire without blocking; `Ok(false)` if another holder has it
    pub fn try_lock(&self) -> Result<bool> {
        Ok(self.raw()?.try_lock().map(mem::forget).is_some())
    }

    /// Release a lock taken with `lock` or `try_lock`
    pub fn unlock(&self) -> Result<()> {
        let raw = self.raw()?;
        if !raw.is_locked() {
            return Err(Error::lock(LockFault::NotLocked, "failed to unlock a mutex"));
        }
        // SAFETY: the lock is held and its guard was forgotten at acquisition
        unsafe { raw.force_unlock() };
        Ok(())
    }

    /// Whether any thread holds the mutex
    pub fn is_locked(&self) -> bool {
        self.raw().map_or(false, |raw| raw.is_locked())
    }

    /// Lock and release again when the guard drops
    pub fn guard(&self) -> Result<PMutexGuard<'_>> {
        self.lock()?;
        Ok(PMutexGuard { mutex: self })
    }
}

impl fmt::Debug for PMutex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PMutex")
            .field("locked", &self.is_locked())
            .finish()
    }
}

// SAFETY: a PMutex can only be built in pool memory by `init`
unsafe impl TxLock for PMutex {
    fn lock_kind(&self) -> LockKind {
        LockKind::Mutex
    }

    fn tx_acquire(&self) -> Result<()> {
        self.lock()
    }

    fn tx_release(&self) -> Result<()> {
        self.unlock()
    }
}

/// Scoped hold on a [`PMutex`]
#[must_use = "the mutex is released as soon as the guard is dropped"]
pub struct PMutexGuard<'a> {
    mutex: &'a PMutex,
}

impl PMutexGuard<'_> {
    /// The mutex this guard holds
    pub fn mutex(&self) -> &PMutex {
        self.mutex
    }
}

impl Drop for PMutexGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.mutex.unlock() {
            tracing::error!(error = %e, "failed to release mutex guard");
        }
    }
}

impl fmt::Debug for PMutexGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PMutexGuard").finish_non_exhaustive()
    }
}
