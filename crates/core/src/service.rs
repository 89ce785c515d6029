//! The pool service contract
//!
//! The pointer, transaction and lock layers never manage media themselves.
//! They consume a pool through [`PoolService`]: raw allocation, raw free,
//! address ownership queries and persistence barriers. Transactional
//! allocation is layered on top of these by the transaction crate.

use crate::error::Result;
use crate::types::{AllocRequest, PoolId, TypeTag};
use std::ptr::NonNull;
use std::sync::Arc;

/// Shared handle to a pool service
pub type PoolRef = Arc<dyn PoolService>;

/// Constructor run by [`PoolService::alloc_atomic`] over fresh storage
pub type AtomicCtor<'a> = dyn FnMut(NonNull<u8>) -> Result<()> + 'a;

/// Capabilities a mapped pool offers to the layers above it
///
/// # Thread Safety
///
/// Implementations are shared between threads behind [`PoolRef`]; every
/// method takes `&self` and must be internally synchronized.
pub trait PoolService: Send + Sync + 'static {
    /// Identity of the pool, stable across reopen
    fn id(&self) -> PoolId;

    /// Address of the first mapped byte
    fn base(&self) -> usize;

    /// Mapped length in bytes
    fn len(&self) -> usize;

    /// Incremented every time the pool is opened by a process
    fn run_id(&self) -> u64;

    /// True if `addr` lies inside the mapping
    fn contains(&self, addr: usize) -> bool {
        addr >= self.base() && addr - self.base() < self.len()
    }

    /// Allocate a block that is immediately live
    ///
    /// Fails with [`Error::OutOfMemory`](crate::Error::OutOfMemory) on
    /// exhaustion and [`Error::Alloc`](crate::Error::Alloc) otherwise.
    fn alloc(&self, request: AllocRequest) -> Result<NonNull<u8>>;

    /// Allocate a block that only becomes live once published
    ///
    /// A reserved block that is never published is reclaimed the next time
    /// the pool is opened. Services without a reserved state hand out a
    /// live block.
    fn reserve(&self, request: AllocRequest) -> Result<NonNull<u8>> {
        self.alloc(request)
    }

    /// Make a reserved block live
    ///
    /// Returns false if `ptr` does not name a reserved block.
    fn publish(&self, _ptr: NonNull<u8>) -> bool {
        false
    }

    /// Allocate and construct as one all-or-nothing step
    ///
    /// The block only becomes live once `ctor` has returned `Ok` and the
    /// object has been persisted. If `ctor` fails the block is released and
    /// the constructor's error is returned.
    fn alloc_atomic(&self, request: AllocRequest, ctor: &mut AtomicCtor<'_>)
        -> Result<NonNull<u8>>;

    /// Release a block; never runs destructors and never fails
    fn free(&self, ptr: NonNull<u8>);

    /// Usable size of a live or reserved block, `None` if `ptr` is neither
    fn usable_size(&self, ptr: NonNull<u8>) -> Option<usize>;

    /// Type tag recorded for a live or reserved block
    fn type_tag(&self, ptr: NonNull<u8>) -> Option<TypeTag>;

    /// Make `len` bytes at `addr` durable
    fn persist(&self, addr: *const u8, len: usize);
}
