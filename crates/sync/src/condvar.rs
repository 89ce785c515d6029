//! Persistent condition variable
//!
//! Waits always go through a [`PMutex`] that the caller already holds. The
//! mutex is released while waiting and held again when any wait returns,
//! whether it was notified, timed out or woke spuriously.
//!
//! Deadlines are rebased: the time left until the caller's deadline is
//! measured against its own clock at call time and added to the monotonic
//! clock the condition variable waits on. This lets a `SystemTime` deadline
//! work the same as an `Instant` one.

use crate::mutex::PMutex;
use crate::runid;
use parking_lot::Condvar;
use pmkit_core::{Error, LockFault, Result};
use std::cell::UnsafeCell;
use std::fmt;
use std::mem::{self, MaybeUninit};
use std::sync::atomic::AtomicU64;
use std::time::{Duration, Instant, SystemTime};

/// Outcome of a timed wait
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WaitStatus {
    /// Woken before the deadline
    NoTimeout,
    /// The deadline passed
    Timeout,
}

impl WaitStatus {
    /// True for `Timeout`
    pub fn timed_out(self) -> bool {
        self == WaitStatus::Timeout
    }
}

/// A point in time on some clock
pub trait Deadline {
    /// Time left until the deadline, zero once it has passed
    fn remaining(&self) -> Duration;
}

impl Deadline for Instant {
    fn remaining(&self) -> Duration {
        self.saturating_duration_since(Instant::now())
    }
}

impl Deadline for SystemTime {
    fn remaining(&self) -> Duration {
        self.duration_since(SystemTime::now())
            .unwrap_or(Duration::ZERO)
    }
}

/// Condition variable whose storage lives in a pool
#[repr(C)]
pub struct PCondvar {
    run_id: AtomicU64,
    inner: UnsafeCell<Condvar>,
}

// SAFETY: see PMutex; `inner` is only replaced during the run-id reset
unsafe impl Sync for PCondvar {}

impl PCondvar {
    /// Construct a condition variable in `slot`, which must lie inside a pool
    pub fn init(slot: &mut MaybeUninit<Self>) -> Result<&mut Self> {
        let (pool, run) = runid::for_new(slot.as_ptr(), "condition variable")?;
        let cv = slot.write(PCondvar {
            run_id: AtomicU64::new(run),
            inner: UnsafeCell::new(Condvar::new()),
        });
        pool.persist(cv as *const Self as *const u8, mem::size_of::<Self>());
        Ok(cv)
    }

    fn raw(&self) -> Result<&Condvar> {
        runid::ensure_current(&self.run_id, self, "condition variable", || {
            // SAFETY: no waiter can exist on a condvar from an earlier run
            unsafe { self.inner.get().write(Condvar::new()) }
        })?;
        // SAFETY: initialised for the current run
        Ok(unsafe { &*self.inner.get() })
    }

    /// Wake one waiter, if any
    pub fn notify_one(&self) -> Result<()> {
        self.raw()?.notify_one();
        Ok(())
    }

    /// Wake every waiter
    pub fn notify_all(&self) -> Result<()> {
        self.raw()?.notify_all();
        Ok(())
    }

    /// Block until notified; may wake spuriously
    pub fn wait(&self, mutex: &PMutex) -> Result<()> {
        self.wait_deadline(mutex, None).map(drop)
    }

    /// Block while `condition` returns true
    pub fn wait_while<F>(&self, mutex: &PMutex, mut condition: F) -> Result<()>
    where
        F: FnMut() -> bool,
    {
        while condition() {
            self.wait(mutex)?;
        }
        Ok(())
    }

    /// Block until notified or until `deadline` passes
    pub fn wait_until<D: Deadline>(&self, mutex: &PMutex, deadline: D) -> Result<WaitStatus> {
        let remaining = deadline.remaining();
        if remaining.is_zero() {
            return Ok(WaitStatus::Timeout);
        }
        self.wait_deadline(mutex, Instant::now().checked_add(remaining))
    }

    /// Block while `condition` holds, giving up at `deadline`
    ///
    /// Returns `Timeout` if the condition still held when the deadline passed.
    pub fn wait_while_until<D, F>(
        &self,
        mutex: &PMutex,
        deadline: D,
        mut condition: F,
    ) -> Result<WaitStatus>
    where
        D: Deadline,
        F: FnMut() -> bool,
    {
        while condition() {
            if self.wait_until(mutex, &deadline)?.timed_out() {
                return Ok(if condition() {
                    WaitStatus::Timeout
                } else {
                    WaitStatus::NoTimeout
                });
            }
        }
        Ok(WaitStatus::NoTimeout)
    }

    /// Block until notified or until `timeout` elapses
    pub fn wait_for(&self, mutex: &PMutex, timeout: Duration) -> Result<WaitStatus> {
        if timeout.is_zero() {
            return Ok(WaitStatus::Timeout);
        }
        self.wait_deadline(mutex, Instant::now().checked_add(timeout))
    }

    /// Block while `condition` holds, for at most `timeout`
    pub fn wait_while_for<F>(&self, mutex: &PMutex, timeout: Duration, condition: F) -> Result<WaitStatus>
    where
        F: FnMut() -> bool,
    {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.wait_while_until(mutex, deadline, condition),
            None => self.wait_while(mutex, condition).map(|()| WaitStatus::NoTimeout),
        }
    }

    /// `None` waits without a deadline
    fn wait_deadline(&self, mutex: &PMutex, deadline: Option<Instant>) -> Result<WaitStatus> {
        let cv = self.raw()?;
        let raw = mutex.raw()?;
        if !raw.is_locked() {
            return Err(Error::lock(
                LockFault::NotLocked,
                "condition variable wait requires a held mutex",
            ));
        }

        // SAFETY: the caller holds `mutex`. The guard only lends the lock to
        // the condvar and is forgotten so the caller keeps holding it.
        let mut guard = unsafe { raw.make_guard_unchecked() };
        let status = match deadline {
            Some(deadline) if cv.wait_until(&mut guard, deadline).timed_out() => {
                WaitStatus::Timeout
            }
            Some(_) => WaitStatus::NoTimeout,
            None => {
                cv.wait(&mut guard);
                WaitStatus::NoTimeout
            }
        };
        mem::forget(guard);
        Ok(status)
    }
}

impl<D: Deadline> Deadline for &D {
    fn remaining(&self) -> Duration {
        (**self).remaining()
    }
}

impl fmt::Debug for PCondvar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PCondvar").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{pool, slot};

    #[test]
    fn test_deadline_remaining() {
        assert_eq!(
            (Instant::now() - Duration::from_millis(50)).remaining(),
            Duration::ZERO
        );
        assert_eq!(
            (SystemTime::now() - Duration::from_millis(50)).remaining(),
            Duration::ZERO
        );
        assert!(
            (SystemTime::now() + Duration::from_secs(60)).remaining() > Duration::from_secs(30)
        );
    }

    #[test]
    fn test_wait_requires_held_mutex() {
        let pool = pool();
        let mutex = PMutex::init(slot(&pool)).unwrap();
        let cv = PCondvar::init(slot(&pool)).unwrap();

        let err = cv.wait(mutex).unwrap_err();
        assert!(matches!(
            err,
            Error::Lock {
                kind: LockFault::NotLocked,
                ..
            }
        ));
    }

    #[test]
    fn test_short_wait_times_out_and_keeps_lock() {
        let pool = pool();
        let mutex = PMutex::init(slot(&pool)).unwrap();
        let cv = PCondvar::init(slot(&pool)).unwrap();

        mutex.lock().unwrap();
        let status = cv.wait_for(mutex, Duration::from_millis(10)).unwrap();
        assert_eq!(status, WaitStatus::Timeout);
        assert!(mutex.is_locked());
        mutex.unlock().unwrap();
    }

    #[test]
    fn test_satisfied_condition_does_not_wait() {
        let pool = pool();
        let mutex = PMutex::init(slot(&pool)).unwrap();
        let cv = PCondvar::init(slot(&pool)).unwrap();

        mutex.lock().unwrap();
        let status = cv
            .wait_while_for(mutex, Duration::from_secs(60), || false)
            .unwrap();
        assert_eq!(status, WaitStatus::NoTimeout);
        mutex.unlock().unwrap();
    }

    #[test]
    fn test_notify_without_waiters() {
        let pool = pool();
        let cv = PCondvar::init(slot(&pool)).unwrap();
        cv.notify_one().unwrap();
        cv.notify_all().unwrap();
    }
}
