//! Allocation protocols
//!
//! ## Transactional
//!
//! `make_persistent*` and `delete_persistent*` are only legal in `WORK`; in
//! any other stage they fail with a scope error before the pool is touched.
//! Their effects are undone in full if the transaction aborts:
//! - new blocks are reserved, recorded in the undo log and freed on abort
//! - frees are deferred to commit
//!
//! On commit every new block is persisted, unless it was allocated with
//! [`AllocFlags::NO_FLUSH`], and then published. A block whose transaction
//! never ended is reclaimed when the pool is next opened.
//!
//! A constructor failure is returned as is. Elements constructed before it
//! are neither dropped nor tracked; the abort that follows discards the
//! whole block.
//!
//! ## Atomic
//!
//! `*_atomic` functions run without a transaction. Allocation is one
//! all-or-nothing step at the pool level, but nothing composes it with the
//! writes that follow. Freeing never runs destructors. Calling either while
//! the thread is in `WORK` fails with a scope error.

use crate::scope;
use crate::stage::{current_stage, TxStage};
use pmkit_core::{AllocFlags, AllocRequest, Error, PoolRef, Result};
use pmkit_ptr::RelPtr;
use std::mem::{self, MaybeUninit};
use std::ptr::{self, NonNull};
use tracing::debug;

fn array_request<T>(count: usize, flags: AllocFlags) -> Result<AllocRequest> {
    if count == 0 {
        return Err(Error::Alloc("cannot allocate an empty array".to_string()));
    }
    if mem::size_of::<T>() == 0 {
        return Err(Error::Alloc(format!(
            "cannot allocate zero-sized type {}",
            std::any::type_name::<T>()
        )));
    }
    AllocRequest::array::<T>(count, flags).ok_or_else(|| {
        Error::OutOfMemory(format!(
            "array of {count} x {} overflows",
            std::any::type_name::<T>()
        ))
    })
}

/// Transactional raw allocation, recorded for rollback
fn tx_alloc<T>(pool: &PoolRef, count: usize, flags: AllocFlags) -> Result<NonNull<T>> {
    scope::require_work(pool, "allocate memory")?;
    let request = array_request::<T>(count, flags)?;

    let raw = pool.reserve(request).map_err(|e| match e {
        Error::OutOfMemory(msg) => Error::OutOfMemory(format!(
            "failed to allocate persistent memory object: {msg}"
        )),
        Error::Alloc(msg) => Error::Alloc(format!(
            "failed to allocate persistent memory object: {msg}"
        )),
        other => other,
    })?;
    scope::record_alloc(raw, request.size, !flags.contains(AllocFlags::NO_FLUSH));
    debug!(size = request.size, tag = %request.type_tag, "tx alloc");
    Ok(raw.cast())
}

/// Allocate and move `value` into the active transaction's pool
pub fn make_persistent<T>(pool: &PoolRef, value: T) -> Result<NonNull<T>> {
    let ptr = tx_alloc::<T>(pool, 1, AllocFlags::NONE)?;
    // SAFETY: fresh block sized and aligned for one T
    unsafe { ptr.as_ptr().write(value) };
    Ok(ptr)
}

/// Allocate, then construct with `ctor`
///
/// If `ctor` fails its error is returned and the block stays recorded for
/// rollback.
pub fn make_persistent_with<T, F>(pool: &PoolRef, flags: AllocFlags, ctor: F) -> Result<NonNull<T>>
where
    F: FnOnce() -> Result<T>,
{
    let ptr = tx_alloc::<T>(pool, 1, flags)?;
    let value = ctor()?;
    // SAFETY: fresh block sized and aligned for one T
    unsafe { ptr.as_ptr().write(value) };
    Ok(ptr)
}

/// Allocate `count` elements, constructing element `i` with `ctor(i)` in
/// index order
pub fn make_persistent_array<T, F>(
    pool: &PoolRef,
    count: usize,
    flags: AllocFlags,
    mut ctor: F,
) -> Result<NonNull<T>>
where
    F: FnMut(usize) -> Result<T>,
{
    let ptr = tx_alloc::<T>(pool, count, flags)?;
    for i in 0..count {
        let value = ctor(i)?;
        // SAFETY: i < count and the block holds count elements
        unsafe { ptr.as_ptr().add(i).write(value) };
    }
    Ok(ptr)
}

/// Allocate one `T` and initialize it at its final address
///
/// For types that must not move after construction, such as persistent
/// locks. `init` must fully initialize the slot when it returns `Ok`.
pub fn make_persistent_in_place<T, F>(
    pool: &PoolRef,
    flags: AllocFlags,
    init: F,
) -> Result<NonNull<T>>
where
    F: FnOnce(&mut MaybeUninit<T>) -> Result<()>,
{
    let ptr = tx_alloc::<T>(pool, 1, flags)?;
    // SAFETY: MaybeUninit<T> has T's layout and the block is exclusively ours
    init(unsafe { &mut *(ptr.as_ptr() as *mut MaybeUninit<T>) })?;
    Ok(ptr)
}

/// Array form of [`make_persistent_in_place`]
pub fn make_persistent_array_in_place<T, F>(
    pool: &PoolRef,
    count: usize,
    flags: AllocFlags,
    mut init: F,
) -> Result<NonNull<T>>
where
    F: FnMut(usize, &mut MaybeUninit<T>) -> Result<()>,
{
    let ptr = tx_alloc::<T>(pool, count, flags)?;
    let slots = ptr.as_ptr() as *mut MaybeUninit<T>;
    for i in 0..count {
        // SAFETY: i < count
        init(i, unsafe { &mut *slots.add(i) })?;
    }
    Ok(ptr)
}

/// Drop and free one object
///
/// See [`delete_persistent_array`].
pub fn delete_persistent<T>(pool: &PoolRef, ptr: *mut T) -> Result<()> {
    delete_persistent_array(pool, ptr, 1)
}

/// Drop `count` elements in reverse index order and free the block
///
/// A null `ptr` is a no-op. The free is deferred to commit, and the
/// elements' bytes are snapshotted first so an abort restores them.
/// The caller must null every reference to `ptr` in the same
/// transaction.
pub fn delete_persistent_array<T>(pool: &PoolRef, ptr: *mut T, count: usize) -> Result<()> {
    scope::require_work(pool, "free memory")?;
    let Some(ptr) = NonNull::new(ptr) else {
        return Ok(());
    };
    let raw = ptr.cast::<u8>();

    if scope::is_freed(raw) {
        return Err(Error::Free(
            "failed to delete persistent memory object: already freed in this transaction"
                .to_string(),
        ));
    }
    let usable = pool.usable_size(raw).ok_or_else(|| {
        Error::Free(format!(
            "failed to delete persistent memory object: {raw:?} is not a live block"
        ))
    })?;
    let bytes = mem::size_of::<T>()
        .checked_mul(count)
        .filter(|b| *b <= usable)
        .ok_or_else(|| {
            Error::Free(format!(
                "failed to delete persistent memory object: {count} elements exceed the {usable} byte block"
            ))
        })?;

    scope::record_range(raw, bytes)?;
    for i in (0..count).rev() {
        // SAFETY: element i was constructed by the allocating call
        unsafe { ptr::drop_in_place(ptr.as_ptr().add(i)) };
    }
    scope::record_free(raw);
    debug!(bytes, "tx free");
    Ok(())
}

fn require_no_work(op: &str) -> Result<()> {
    match current_stage() {
        TxStage::Work => Err(Error::Scope(format!(
            "refusing to {op} atomically inside an active transaction"
        ))),
        _ => Ok(()),
    }
}

/// Allocate and construct one object as a single all-or-nothing step
///
/// The object is live only once `ctor` has succeeded and the value has been
/// persisted.
pub fn make_persistent_atomic<T, F>(
    pool: &PoolRef,
    flags: AllocFlags,
    ctor: F,
) -> Result<NonNull<T>>
where
    F: FnOnce() -> Result<T>,
{
    require_no_work("allocate memory")?;
    let request = array_request::<T>(1, flags)?;
    let mut ctor = Some(ctor);
    let raw = pool.alloc_atomic(request, &mut |p: NonNull<u8>| {
        let ctor = ctor
            .take()
            .ok_or_else(|| Error::Alloc("constructor invoked twice".to_string()))?;
        // SAFETY: p is a fresh block sized and aligned for one T
        unsafe { (p.as_ptr() as *mut T).write(ctor()?) };
        Ok(())
    })?;
    Ok(raw.cast())
}

/// Atomic array allocation, constructing element `i` with `ctor(i)`
///
/// If `ctor` fails partway the block is released, but the elements already
/// constructed are not dropped: resources they own leak.
pub fn make_persistent_array_atomic<T, F>(
    pool: &PoolRef,
    count: usize,
    flags: AllocFlags,
    mut ctor: F,
) -> Result<NonNull<T>>
where
    F: FnMut(usize) -> Result<T>,
{
    require_no_work("allocate memory")?;
    let request = array_request::<T>(count, flags)?;
    let raw = pool.alloc_atomic(request, &mut |p: NonNull<u8>| {
        let data = p.as_ptr() as *mut T;
        for i in 0..count {
            // SAFETY: i < count and the block holds count elements
            unsafe { data.add(i).write(ctor(i)?) };
        }
        Ok(())
    })?;
    Ok(raw.cast())
}

/// Free the object `ptr` refers to without running its destructor, then
/// null `ptr`
///
/// A null `ptr` is a no-op.
pub fn delete_persistent_atomic<T>(pool: &PoolRef, ptr: &mut RelPtr<T>) -> Result<()> {
    require_no_work("free memory")?;
    let Some(raw) = NonNull::new(ptr.get()) else {
        return Ok(());
    };
    pool.free(raw.cast());
    ptr.set_null();
    pool.persist(ptr as *const RelPtr<T> as *const u8, mem::size_of::<RelPtr<T>>());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::{run, Transaction};
    use parking_lot::Mutex;
    use pmkit_core::{AtomicCtor, PoolId, PoolService, TypeTag};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Event {
        Persist(usize, usize),
        Publish(usize),
    }

    /// Counts every allocator call and can fail the next N allocations
    struct SpyPool {
        inner: PoolRef,
        allocs: AtomicUsize,
        frees: AtomicUsize,
        fail_after: AtomicUsize,
        events: Mutex<Vec<Event>>,
        last_flags: Mutex<Option<AllocFlags>>,
    }

    impl SpyPool {
        fn new() -> Arc<Self> {
            let inner: PoolRef = pmkit_pool::Pool::anonymous(1 << 20).unwrap();
            Arc::new(SpyPool {
                inner,
                allocs: AtomicUsize::new(0),
                frees: AtomicUsize::new(0),
                fail_after: AtomicUsize::new(usize::MAX),
                events: Mutex::new(Vec::new()),
                last_flags: Mutex::new(None),
            })
        }

        fn calls(&self) -> usize {
            self.allocs.load(Ordering::SeqCst) + self.frees.load(Ordering::SeqCst)
        }

        fn count_alloc(&self, request: &AllocRequest) -> Result<()> {
            *self.last_flags.lock() = Some(request.flags);
            let n = self.allocs.fetch_add(1, Ordering::SeqCst);
            if n >= self.fail_after.load(Ordering::SeqCst) {
                return Err(Error::OutOfMemory("injected".into()));
            }
            Ok(())
        }

        fn position(&self, event: Event) -> Option<usize> {
            self.events.lock().iter().position(|e| *e == event)
        }
    }

    impl PoolService for SpyPool {
        fn id(&self) -> PoolId {
            self.inner.id()
        }
        fn base(&self) -> usize {
            self.inner.base()
        }
        fn len(&self) -> usize {
            self.inner.len()
        }
        fn run_id(&self) -> u64 {
            self.inner.run_id()
        }
        fn alloc(&self, request: AllocRequest) -> Result<NonNull<u8>> {
            self.count_alloc(&request)?;
            self.inner.alloc(request)
        }
        fn reserve(&self, request: AllocRequest) -> Result<NonNull<u8>> {
            self.count_alloc(&request)?;
            self.inner.reserve(request)
        }
        fn publish(&self, ptr: NonNull<u8>) -> bool {
            self.events.lock().push(Event::Publish(ptr.as_ptr() as usize));
            self.inner.publish(ptr)
        }
        fn alloc_atomic(
            &self,
            request: AllocRequest,
            ctor: &mut AtomicCtor<'_>,
        ) -> Result<NonNull<u8>> {
            self.count_alloc(&request)?;
            self.inner.alloc_atomic(request, ctor)
        }
        fn free(&self, ptr: NonNull<u8>) {
            self.frees.fetch_add(1, Ordering::SeqCst);
            self.inner.free(ptr)
        }
        fn usable_size(&self, ptr: NonNull<u8>) -> Option<usize> {
            self.inner.usable_size(ptr)
        }
        fn type_tag(&self, ptr: NonNull<u8>) -> Option<TypeTag> {
            self.inner.type_tag(ptr)
        }
        fn persist(&self, addr: *const u8, len: usize) {
            self.events.lock().push(Event::Persist(addr as usize, len));
            self.inner.persist(addr, len)
        }
    }

    fn spy() -> (Arc<SpyPool>, PoolRef) {
        let spy = SpyPool::new();
        let pool: PoolRef = spy.clone();
        (spy, pool)
    }

    #[test]
    fn test_outside_transaction_is_scope_error() {
        let (spy, pool) = spy();

        let err = make_persistent(&pool, 5u64).unwrap_err();
        assert!(err.is_scope_error(), "{err}");
        let err = make_persistent_array(&pool, 4, AllocFlags::NONE, |i| Ok(i as u64)).unwrap_err();
        assert!(err.is_scope_error());
        let mut dangling = 0u64;
        let err = delete_persistent(&pool, &mut dangling as *mut u64).unwrap_err();
        assert!(err.is_scope_error());

        assert_eq!(spy.calls(), 0);
    }

    #[test]
    fn test_delete_null_is_noop() {
        let (spy, pool) = spy();
        run(&pool, |_| delete_persistent::<u64>(&pool, ptr::null_mut())).unwrap();
        assert_eq!(spy.calls(), 0);
    }

    #[test]
    fn test_allocation_failure_kinds() {
        let (spy, pool) = spy();
        spy.fail_after.store(0, Ordering::SeqCst);
        let err = run(&pool, |_| make_persistent(&pool, 1u64)).unwrap_err();
        assert!(err.is_out_of_memory());

        let err = run(&pool, |_| {
            make_persistent_array(&pool, 0, AllocFlags::NONE, |_| Ok(0u8))
        })
        .unwrap_err();
        assert!(matches!(err, Error::Alloc(_)));
    }

    #[test]
    fn test_abort_frees_allocations() {
        let (spy, pool) = spy();
        let result: Result<()> = run(&pool, |_| {
            make_persistent(&pool, 1u64)?;
            make_persistent_array(&pool, 8, AllocFlags::ZERO, |i| Ok(i as u32))?;
            Err(Error::Alloc("give up".into()))
        });
        assert!(result.is_err());
        assert_eq!(spy.allocs.load(Ordering::SeqCst), 2);
        assert_eq!(spy.frees.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_commit_persists_new_object_before_publishing() {
        let (spy, pool) = spy();
        let mut tx = Transaction::begin(&pool).unwrap();
        let obj = make_persistent(&pool, [0xABu8; 4]).unwrap();
        let addr = obj.as_ptr() as usize;
        assert_eq!(spy.position(Event::Persist(addr, 4)), None);
        tx.commit().unwrap();

        let persisted = spy.position(Event::Persist(addr, 4)).expect("object persisted");
        let published = spy.position(Event::Publish(addr)).expect("object published");
        assert!(persisted < published);
        // SAFETY: committed block
        assert_eq!(unsafe { *obj.as_ptr() }, [0xAB; 4]);
    }

    #[test]
    fn test_no_flush_object_is_published_unpersisted() {
        let (spy, pool) = spy();
        let arr = run(&pool, |_| {
            make_persistent_array(&pool, 4, AllocFlags::NO_FLUSH, |_| Ok(0xCDu8))
        })
        .unwrap();
        let addr = arr.as_ptr() as usize;

        assert!(spy.position(Event::Publish(addr)).is_some());
        assert!(!spy
            .events
            .lock()
            .iter()
            .any(|e| matches!(e, Event::Persist(a, _) if *a == addr)));
    }

    #[test]
    fn test_aborted_object_never_published() {
        let (spy, pool) = spy();
        let mut tx = Transaction::begin(&pool).unwrap();
        let obj = make_persistent(&pool, 3u64).unwrap();
        tx.abort("discard");
        assert!(tx.commit().unwrap_err().is_aborted());

        assert_eq!(spy.position(Event::Publish(obj.as_ptr() as usize)), None);
        assert_eq!(spy.frees.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_constructor_failure_propagates() {
        let (spy, pool) = spy();
        let err = run(&pool, |_| {
            make_persistent_array(&pool, 5, AllocFlags::NONE, |i| {
                if i == 3 {
                    Err(Error::Alloc(format!("element {i}")))
                } else {
                    Ok(i as u64)
                }
            })
        })
        .unwrap_err();
        assert!(matches!(err, Error::Alloc(ref m) if m == "element 3"));
        // The block was released by the rollback
        assert_eq!(spy.frees.load(Ordering::SeqCst), 1);
    }

    thread_local! {
        static DROPS: std::cell::RefCell<Vec<u32>> = const { std::cell::RefCell::new(Vec::new()) };
    }

    struct Tracked(u32);

    impl Drop for Tracked {
        fn drop(&mut self) {
            DROPS.with(|d| d.borrow_mut().push(self.0));
        }
    }

    #[test]
    fn test_array_destroyed_in_reverse_order() {
        let (spy, pool) = spy();
        let mut built = Vec::new();
        let ptr = run(&pool, |_| {
            make_persistent_array(&pool, 3, AllocFlags::NONE, |i| {
                built.push(i as u32);
                Ok(Tracked(i as u32))
            })
        })
        .unwrap();
        assert_eq!(built, vec![0, 1, 2]);

        DROPS.with(|d| d.borrow_mut().clear());
        run(&pool, |_| delete_persistent_array(&pool, ptr.as_ptr(), 3)).unwrap();
        assert_eq!(DROPS.with(|d| d.borrow().clone()), vec![2, 1, 0]);
        assert_eq!(spy.frees.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_free_is_deferred_until_commit() {
        let (spy, pool) = spy();
        let ptr = run(&pool, |_| make_persistent(&pool, 11u64)).unwrap();

        let tx = Transaction::begin(&pool).unwrap();
        delete_persistent(&pool, ptr.as_ptr()).unwrap();
        assert_eq!(spy.frees.load(Ordering::SeqCst), 0);
        tx.commit().unwrap();
        assert_eq!(spy.frees.load(Ordering::SeqCst), 1);
        assert_eq!(pool.usable_size(ptr.cast()), None);
    }

    #[test]
    fn test_aborted_delete_restores_object() {
        let (spy, pool) = spy();
        let ptr = run(&pool, |_| make_persistent(&pool, 0xFEED_u64)).unwrap();

        let mut tx = Transaction::begin(&pool).unwrap();
        delete_persistent(&pool, ptr.as_ptr()).unwrap();
        tx.abort("changed my mind");
        assert!(tx.commit().unwrap_err().is_aborted());

        assert_eq!(spy.frees.load(Ordering::SeqCst), 0);
        assert_eq!(pool.usable_size(ptr.cast()), Some(16));
        // SAFETY: still a live block
        assert_eq!(unsafe { *ptr.as_ptr() }, 0xFEED);
    }

    #[test]
    fn test_free_errors() {
        let (_spy, pool) = spy();
        let ptr = run(&pool, |_| make_persistent(&pool, 1u64)).unwrap();

        let err = run(&pool, |_| {
            delete_persistent(&pool, ptr.as_ptr())?;
            delete_persistent(&pool, ptr.as_ptr())
        })
        .unwrap_err();
        assert!(matches!(err, Error::Free(_)), "{err}");

        let mut local = 3u64;
        let err = run(&pool, |_| delete_persistent(&pool, &mut local as *mut u64)).unwrap_err();
        assert!(matches!(err, Error::Free(_)));

        let err = run(&pool, |_| delete_persistent_array(&pool, ptr.as_ptr(), 64)).unwrap_err();
        assert!(matches!(err, Error::Free(_)));
    }

    #[test]
    fn test_in_place_construction() {
        let (_spy, pool) = spy();
        let ptr = run(&pool, |_| {
            make_persistent_in_place::<[u64; 4], _>(&pool, AllocFlags::NONE, |slot| {
                slot.write([1, 2, 3, 4]);
                Ok(())
            })
        })
        .unwrap();
        // SAFETY: initialized above
        assert_eq!(unsafe { *ptr.as_ptr() }, [1, 2, 3, 4]);

        let arr = run(&pool, |_| {
            make_persistent_array_in_place::<u32, _>(&pool, 3, AllocFlags::NONE, |i, slot| {
                slot.write(i as u32 * 10);
                Ok(())
            })
        })
        .unwrap();
        // SAFETY: three initialized elements
        let values = unsafe { std::slice::from_raw_parts(arr.as_ptr(), 3) };
        assert_eq!(values, &[0, 10, 20]);
    }

    #[test]
    fn test_atomic_path_rejected_in_work() {
        let (spy, pool) = spy();
        let err = run(&pool, |_| {
            make_persistent_atomic(&pool, AllocFlags::NONE, || Ok(1u64))
        })
        .unwrap_err();
        assert!(err.is_scope_error());

        let mut slot: Box<RelPtr<u64>> = Box::default();
        let err = run(&pool, |_| delete_persistent_atomic(&pool, &mut slot)).unwrap_err();
        assert!(err.is_scope_error());
        assert_eq!(spy.calls(), 0);
    }

    #[test]
    fn test_atomic_round_trip() {
        let (spy, pool) = spy();
        let ptr = make_persistent_atomic(&pool, AllocFlags::NONE, || Ok(77u64)).unwrap();
        assert_eq!(pool.type_tag(ptr.cast()), Some(TypeTag::of::<u64>()));

        let mut slot: Box<RelPtr<u64>> = Box::default();
        slot.set(ptr.as_ptr());
        // SAFETY: live block
        assert_eq!(unsafe { (*slot).as_ref() }, Some(&77));

        delete_persistent_atomic(&pool, &mut slot).unwrap();
        assert!(slot.is_null());
        assert_eq!(pool.usable_size(ptr.cast()), None);
        assert_eq!(spy.frees.load(Ordering::SeqCst), 1);

        // Null is a no-op
        delete_persistent_atomic(&pool, &mut slot).unwrap();
        assert_eq!(spy.frees.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_atomic_allocation_passes_flags() {
        let (spy, pool) = spy();
        let ptr = make_persistent_atomic(&pool, AllocFlags::ZERO, || Ok(4u32)).unwrap();
        assert_eq!(*spy.last_flags.lock(), Some(AllocFlags::ZERO));
        // SAFETY: fully constructed by the atomic path
        assert_eq!(unsafe { *ptr.as_ptr() }, 4);
    }

    #[test]
    fn test_atomic_delete_skips_destructor() {
        let (_spy, pool) = spy();
        let ptr = make_persistent_atomic(&pool, AllocFlags::NONE, || Ok(Tracked(9))).unwrap();
        let mut slot: Box<RelPtr<Tracked>> = Box::default();
        slot.set(ptr.as_ptr());

        DROPS.with(|d| d.borrow_mut().clear());
        delete_persistent_atomic(&pool, &mut slot).unwrap();
        assert!(DROPS.with(|d| d.borrow().is_empty()));
    }

    #[test]
    fn test_atomic_array_ctor_failure_releases_block() {
        let (spy, pool) = spy();
        let err = make_persistent_array_atomic(&pool, 4, AllocFlags::NONE, |i| {
            if i == 2 {
                Err(Error::Alloc("stop".into()))
            } else {
                Ok(i as u64)
            }
        })
        .unwrap_err();
        assert!(matches!(err, Error::Alloc(_)));
        assert_eq!(spy.frees.load(Ordering::SeqCst), 0);

        let ok = make_persistent_array_atomic(&pool, 4, AllocFlags::NONE, |i| Ok(i as u64)).unwrap();
        assert_eq!(pool.usable_size(ok.cast()), Some(32));
    }
}
