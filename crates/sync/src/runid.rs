//! Run-id tracking for lock state stored in a pool
//!
//! A primitive records the run id of the pool it was last initialised under.
//! When the pool is reopened its run id changes, and the first operation in
//! the new run resets the volatile part of the primitive. Competing threads
//! spin on a marker derived from the new run id until the winner stores it.
//! A marker left behind by a crashed run never matches a later run.

use pmkit_core::{pool_by_ptr, Error, LockFault, PoolRef, Result};
use std::sync::atomic::{AtomicU64, Ordering};

const INIT_BIT: u64 = 1 << 63;

fn initializing(run: u64) -> u64 {
    run | INIT_BIT
}

/// Resolve the pool that holds `owner`
pub(crate) fn owning_pool<T>(owner: *const T, what: &str) -> Result<PoolRef> {
    pool_by_ptr(owner)
        .ok_or_else(|| Error::lock(LockFault::NotInPool, format!("{what} is not in a pool")))
}

/// Pool and run id for a primitive about to be built at `slot`
pub(crate) fn for_new<T>(slot: *const T, what: &str) -> Result<(PoolRef, u64)> {
    let pool = pool_by_ptr(slot)
        .ok_or_else(|| Error::Config(format!("{what} is not in persistent memory")))?;
    let run = pool.run_id();
    Ok((pool, run))
}

/// Make sure the volatile state behind `run_id` belongs to the current run
///
/// `reset` runs at most once per run, on the thread that wins the race.
pub(crate) fn ensure_current<T, F>(run_id: &AtomicU64, owner: *const T, what: &str, reset: F) -> Result<()>
where
    F: FnOnce(),
{
    let pool = owning_pool(owner, what)?;
    let current = pool.run_id();
    let marker = initializing(current);

    loop {
        let seen = run_id.load(Ordering::Acquire);
        if seen == current {
            return Ok(());
        }
        if seen == marker {
            std::hint::spin_loop();
            continue;
        }
        if run_id
            .compare_exchange(seen, marker, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            reset();
            run_id.store(current, Ordering::Release);
            pool.persist(run_id as *const AtomicU64 as *const u8, std::mem::size_of::<u64>());
            tracing::warn!(what, stale = seen, run_id = current, "re-initialised lock state");
            return Ok(());
        }
    }
}
