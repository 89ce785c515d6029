//! Process-wide pool registry
//!
//! Resolves any interior address to the pool that maps it. Persistent locks
//! use this to find their owning pool, and the transaction layer uses it to
//! refuse snapshots of memory outside the transaction's pool.

use crate::service::{PoolRef, PoolService};
use crate::types::PoolId;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::sync::{Arc, Weak};

struct Entry {
    id: PoolId,
    start: usize,
    end: usize,
    pool: Weak<dyn PoolService>,
}

static REGISTRY: Lazy<RwLock<Vec<Entry>>> = Lazy::new(|| RwLock::new(Vec::new()));

/// Make a pool resolvable by address
///
/// Registering the same pool twice replaces the earlier entry.
pub fn register(pool: &PoolRef) {
    let start = pool.base();
    let entry = Entry {
        id: pool.id(),
        start,
        end: start + pool.len(),
        pool: Arc::downgrade(pool),
    };

    let mut entries = REGISTRY.write();
    entries.retain(|e| !(e.id == entry.id && e.start == entry.start));
    tracing::debug!(pool = %entry.id, start = entry.start, len = pool.len(), "pool registered");
    entries.push(entry);
}

/// Remove a pool mapped at `base`
pub fn unregister(id: PoolId, base: usize) {
    let mut entries = REGISTRY.write();
    entries.retain(|e| !(e.id == id && e.start == base));
    tracing::debug!(pool = %id, start = base, "pool unregistered");
}

/// Resolve which pool a given address belongs to
pub fn pool_handle_for(addr: usize) -> Option<PoolRef> {
    let entries = REGISTRY.read();
    entries
        .iter()
        .filter(|e| addr >= e.start && addr < e.end)
        .find_map(|e| e.pool.upgrade())
}

/// Resolve the pool owning the storage of `value`
pub fn pool_by_ptr<T: ?Sized>(value: *const T) -> Option<PoolRef> {
    pool_handle_for(value as *const u8 as usize)
}
