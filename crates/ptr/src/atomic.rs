//! Atomic self-relative pointer
//!
//! [`AtomicRelPtr`] keeps the same offset encoding as [`RelPtr`] in an
//! `AtomicIsize`, so lock-free structures can live in a relocatable pool.
//! Every operation converts between absolute targets and offsets relative
//! to the atomic's own address; an atomic is never moved while it is in
//! use, so that address is stable for the duration of each operation.
//!
//! All operations are lock-free on targets with native pointer-sized
//! atomics and never block.
//!
//! [`RelPtr`]: crate::RelPtr

use crate::annotate;
use crate::relative::{offset_between, resolve, NULL_OFFSET};
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicIsize, Ordering};

/// Atomic position-independent pointer
#[repr(transparent)]
pub struct AtomicRelPtr<T> {
    offset: AtomicIsize,
    _marker: PhantomData<*mut T>,
}

// SAFETY: the shared state is a single atomic word
unsafe impl<T: Send + Sync> Send for AtomicRelPtr<T> {}
unsafe impl<T: Send + Sync> Sync for AtomicRelPtr<T> {}

impl<T> AtomicRelPtr<T> {
    /// Null pointer, valid at any address
    pub const fn null() -> Self {
        AtomicRelPtr {
            offset: AtomicIsize::new(NULL_OFFSET),
            _marker: PhantomData,
        }
    }

    /// True when operations map onto native atomic instructions
    pub const fn is_lock_free() -> bool {
        cfg!(target_has_atomic = "ptr")
    }

    #[inline]
    fn this(&self) -> usize {
        self as *const Self as usize
    }

    #[inline]
    fn encode(&self, ptr: *mut T) -> isize {
        offset_between(self.this(), ptr as usize)
    }

    #[inline]
    fn decode(&self, offset: isize) -> *mut T {
        resolve(self.this(), offset) as *mut T
    }

    /// Load the current target
    #[inline]
    pub fn load(&self, order: Ordering) -> *mut T {
        let offset = self.offset.load(order);
        annotate::happens_after(order, self);
        self.decode(offset)
    }

    /// Store a new target
    #[inline]
    pub fn store(&self, ptr: *mut T, order: Ordering) {
        annotate::happens_before(order, self);
        self.offset.store(self.encode(ptr), order);
    }

    /// Store a new target, returning the previous one
    #[inline]
    pub fn swap(&self, ptr: *mut T, order: Ordering) -> *mut T {
        annotate::happens_before(order, self);
        let previous = self.offset.swap(self.encode(ptr), order);
        annotate::happens_after(order, self);
        self.decode(previous)
    }

    /// Replace `current` with `new` if the slot still points at `current`
    ///
    /// Returns the previous target on success and the observed target on
    /// failure, like [`AtomicPtr::compare_exchange`](std::sync::atomic::AtomicPtr::compare_exchange).
    #[inline]
    pub fn compare_exchange(
        &self,
        current: *mut T,
        new: *mut T,
        success: Ordering,
        failure: Ordering,
    ) -> Result<*mut T, *mut T> {
        annotate::happens_before(success, self);
        let result = self.offset.compare_exchange(
            self.encode(current),
            self.encode(new),
            success,
            failure,
        );
        self.finish_exchange(result, success, failure)
    }

    /// Like [`compare_exchange`](Self::compare_exchange) but may fail spuriously
    #[inline]
    pub fn compare_exchange_weak(
        &self,
        current: *mut T,
        new: *mut T,
        success: Ordering,
        failure: Ordering,
    ) -> Result<*mut T, *mut T> {
        annotate::happens_before(success, self);
        let result = self.offset.compare_exchange_weak(
            self.encode(current),
            self.encode(new),
            success,
            failure,
        );
        self.finish_exchange(result, success, failure)
    }

    #[inline]
    fn finish_exchange(
        &self,
        result: Result<isize, isize>,
        success: Ordering,
        failure: Ordering,
    ) -> Result<*mut T, *mut T> {
        match result {
            Ok(previous) => {
                annotate::happens_after(success, self);
                Ok(self.decode(previous))
            }
            Err(observed) => {
                annotate::happens_after(failure, self);
                Err(self.decode(observed))
            }
        }
    }

    /// Advance the target by `count` elements, returning the previous target
    ///
    /// Meaningless on a null pointer.
    #[inline]
    pub fn fetch_add(&self, count: isize, order: Ordering) -> *mut T {
        let delta = count.wrapping_mul(std::mem::size_of::<T>() as isize);
        annotate::happens_before(order, self);
        let previous = self.offset.fetch_add(delta, order);
        annotate::happens_after(order, self);
        self.decode(previous)
    }

    /// Move the target back by `count` elements, returning the previous target
    #[inline]
    pub fn fetch_sub(&self, count: isize, order: Ordering) -> *mut T {
        self.fetch_add(count.wrapping_neg(), order)
    }

    /// Apply `f` to the target until the update sticks
    ///
    /// Mirrors [`AtomicPtr::fetch_update`](std::sync::atomic::AtomicPtr::fetch_update).
    pub fn fetch_update<F>(
        &self,
        set_order: Ordering,
        fetch_order: Ordering,
        mut f: F,
    ) -> Result<*mut T, *mut T>
    where
        F: FnMut(*mut T) -> Option<*mut T>,
    {
        let mut current = self.load(fetch_order);
        while let Some(new) = f(current) {
            match self.compare_exchange_weak(current, new, set_order, fetch_order) {
                Ok(previous) => return Ok(previous),
                Err(observed) => current = observed,
            }
        }
        Err(current)
    }

    /// Non-atomic access through exclusive ownership
    #[inline]
    pub fn get_mut(&mut self) -> *mut T {
        let offset = *self.offset.get_mut();
        self.decode(offset)
    }

    #[inline]
    pub(crate) fn load_addr(&self, order: Ordering) -> usize {
        self.load(order) as usize
    }

    #[inline]
    pub(crate) fn store_addr(&self, addr: usize, order: Ordering) {
        self.store(addr as *mut T, order)
    }
}

impl<T> Default for AtomicRelPtr<T> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T> fmt::Debug for AtomicRelPtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("AtomicRelPtr")
            .field(&self.load(Ordering::Relaxed))
            .finish()
    }
}
