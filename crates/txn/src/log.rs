//! Volatile undo log of one transaction
//!
//! Records are applied in reverse on abort and finalized on commit:
//!
//! | Record  | Commit                    | Abort                    |
//! |---------|---------------------------|--------------------------|
//! | `Alloc` | persisted, then published | block freed              |
//! | `Free`  | block freed               | dropped                  |
//! | `Range` | bytes persisted           | saved bytes written back |
//!
//! The log lives in process memory, so it gives all-or-nothing rollback
//! within a process but does not replay an interrupted transaction after a
//! crash. Allocations stay reserved until commit, so the pool reclaims
//! those of an interrupted transaction when it is next opened.

use pmkit_core::PoolService;
use std::ptr::NonNull;

#[derive(Debug)]
enum Record {
    Alloc {
        ptr: NonNull<u8>,
        len: usize,
        flush: bool,
    },
    Free(NonNull<u8>),
    Range { addr: NonNull<u8>, saved: Box<[u8]> },
}

#[derive(Debug, Default)]
pub(crate) struct UndoLog {
    records: Vec<Record>,
}

impl UndoLog {
    pub(crate) fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.records.len()
    }

    /// Track a reserved block; `flush` persists its `len` bytes on commit
    pub(crate) fn record_alloc(&mut self, ptr: NonNull<u8>, len: usize, flush: bool) {
        self.records.push(Record::Alloc { ptr, len, flush });
    }

    /// Defer a free to commit; false if `ptr` is already scheduled
    pub(crate) fn record_free(&mut self, ptr: NonNull<u8>) -> bool {
        if self.is_freed(ptr) {
            return false;
        }
        self.records.push(Record::Free(ptr));
        true
    }

    pub(crate) fn is_freed(&self, ptr: NonNull<u8>) -> bool {
        self.records
            .iter()
            .any(|r| matches!(r, Record::Free(p) if *p == ptr))
    }

    /// Save `len` bytes at `addr` so they can be restored on abort
    ///
    /// # Safety
    ///
    /// `addr..addr + len` must be readable.
    pub(crate) unsafe fn record_range(&mut self, addr: NonNull<u8>, len: usize) {
        let saved = std::slice::from_raw_parts(addr.as_ptr(), len).into();
        self.records.push(Record::Range { addr, saved });
    }

    /// Persist every new object not flagged to skip it, then publish all
    /// of them
    pub(crate) fn publish_allocs(&self, pool: &dyn PoolService) -> usize {
        for record in &self.records {
            if let Record::Alloc {
                ptr,
                len,
                flush: true,
            } = record
            {
                pool.persist(ptr.as_ptr(), *len);
            }
        }
        let mut published = 0;
        for record in &self.records {
            if let Record::Alloc { ptr, .. } = record {
                pool.publish(*ptr);
                published += 1;
            }
        }
        published
    }

    /// Make every snapshotted range durable
    pub(crate) fn persist_ranges(&self, pool: &dyn PoolService) {
        for record in &self.records {
            if let Record::Range { addr, saved } = record {
                pool.persist(addr.as_ptr(), saved.len());
            }
        }
    }

    /// Release the blocks whose free was deferred
    pub(crate) fn apply_frees(&self, pool: &dyn PoolService) -> usize {
        let mut freed = 0;
        for record in &self.records {
            if let Record::Free(ptr) = record {
                pool.free(*ptr);
                freed += 1;
            }
        }
        freed
    }

    /// Write every snapshot back, newest first
    pub(crate) fn restore_ranges(&self, pool: &dyn PoolService) {
        for record in self.records.iter().rev() {
            if let Record::Range { addr, saved } = record {
                // SAFETY: the range was readable when recorded and lies in a
                // pool that is kept mapped for the life of the transaction
                unsafe {
                    std::ptr::copy_nonoverlapping(saved.as_ptr(), addr.as_ptr(), saved.len());
                }
                pool.persist(addr.as_ptr(), saved.len());
            }
        }
    }

    /// Free every block allocated by the transaction, newest first
    pub(crate) fn release_allocs(&self, pool: &dyn PoolService) -> usize {
        let mut released = 0;
        for record in self.records.iter().rev() {
            if let Record::Alloc { ptr, .. } = record {
                pool.free(*ptr);
                released += 1;
            }
        }
        released
    }
}
