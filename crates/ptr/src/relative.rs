//! Self-relative pointer
//!
//! A [`RelPtr`] stores the signed byte distance from its own storage to its
//! target. A pool can therefore be mapped at a different base address on
//! every run: as long as the pointer and its target move together, the
//! distance between them is unchanged.
//!
//! ## Encoding
//!
//! ```text
//! offset == 0   null (a pointer never targets its own storage)
//! offset != 0   target = address_of(self) + offset
//! ```
//!
//! ## Moving a RelPtr
//!
//! The stored word is only meaningful at the address it was computed for.
//! A bitwise move of a non-null `RelPtr` (`std::mem::swap`, `mem::replace`,
//! returning it by value) silently retargets it. For that reason the only
//! value that can be constructed by value is null, the type is neither
//! `Clone` nor `Copy`, and copies go through [`RelPtr::assign`] and
//! [`RelPtr::swap`], which re-point instead of copying raw words.

use std::cmp::Ordering;
use std::fmt;
use std::marker::PhantomData;

/// Offset that encodes null
pub(crate) const NULL_OFFSET: isize = 0;

/// Distance from `this` to `target`, with null mapped to [`NULL_OFFSET`]
#[inline]
pub(crate) fn offset_between(this: usize, target: usize) -> isize {
    if target == 0 {
        NULL_OFFSET
    } else {
        debug_assert_ne!(target, this, "relative pointer cannot target its own storage");
        target.wrapping_sub(this) as isize
    }
}

/// Address encoded by `offset` when stored at `this`
#[inline]
pub(crate) fn resolve(this: usize, offset: isize) -> usize {
    if offset == NULL_OFFSET {
        0
    } else {
        this.wrapping_add(offset as usize)
    }
}

/// Position-independent pointer to a `T` in the same mapped region
#[repr(transparent)]
pub struct RelPtr<T> {
    offset: isize,
    _marker: PhantomData<*mut T>,
}

// SAFETY: a RelPtr is an integer; access to the target is unsafe anyway and
// follows the same rules as sharing `&T`.
unsafe impl<T: Send + Sync> Send for RelPtr<T> {}
unsafe impl<T: Send + Sync> Sync for RelPtr<T> {}

impl<T> RelPtr<T> {
    /// Null pointer, valid at any address
    pub const fn null() -> Self {
        RelPtr {
            offset: NULL_OFFSET,
            _marker: PhantomData,
        }
    }

    #[inline]
    fn this(&self) -> usize {
        self as *const Self as usize
    }

    /// Check for the null encoding
    #[inline]
    pub fn is_null(&self) -> bool {
        self.offset == NULL_OFFSET
    }

    /// Target address, or null
    #[inline]
    pub fn get(&self) -> *mut T {
        resolve(self.this(), self.offset) as *mut T
    }

    /// Point at `target` from this pointer's current storage
    #[inline]
    pub fn set(&mut self, target: *const T) {
        self.offset = offset_between(self.this(), target as usize);
    }

    /// Reset to null
    #[inline]
    pub fn set_null(&mut self) {
        self.offset = NULL_OFFSET;
    }

    /// Copy the logical target of `other`
    ///
    /// The offset is recomputed for `self`'s address, so the two pointers
    /// may live anywhere relative to each other.
    #[inline]
    pub fn assign(&mut self, other: &RelPtr<T>) {
        let target = other.get();
        self.set(target);
    }

    /// Exchange logical targets with `other`
    pub fn swap(&mut self, other: &mut RelPtr<T>) {
        let mine = self.get();
        let theirs = other.get();
        self.set(theirs);
        other.set(mine);
    }

    /// Move the target by `count` elements of `T`
    ///
    /// Advancing a null pointer produces a meaningless address.
    #[inline]
    pub fn advance(&mut self, count: isize) {
        let target = self.get().wrapping_offset(count);
        self.set(target);
    }

    /// Target as a byte pointer
    #[inline]
    pub fn as_byte_ptr(&self) -> *mut u8 {
        self.get() as *mut u8
    }

    /// Borrow the target
    ///
    /// # Safety
    ///
    /// The target must be a live, initialized `T` for the chosen lifetime,
    /// with no outstanding mutable borrow.
    #[inline]
    pub unsafe fn as_ref<'a>(&self) -> Option<&'a T> {
        self.get().as_ref()
    }

    /// Mutably borrow the target
    ///
    /// # Safety
    ///
    /// The target must be a live, initialized `T` for the chosen lifetime,
    /// with no other borrow of it.
    #[inline]
    pub unsafe fn as_mut<'a>(&self) -> Option<&'a mut T> {
        self.get().as_mut()
    }

    /// Raw stored offset
    ///
    /// Only meaningful at this pointer's current address. Exposed for
    /// diagnostics and for code that persists the word through other means.
    #[inline]
    pub fn raw_offset(&self) -> isize {
        self.offset
    }

    /// Raw target address, tag bits included
    #[inline]
    pub(crate) fn addr(&self) -> usize {
        resolve(self.this(), self.offset)
    }

    #[inline]
    pub(crate) fn set_addr(&mut self, addr: usize) {
        self.offset = offset_between(self.this(), addr);
    }
}

impl<T> Default for RelPtr<T> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T> PartialEq for RelPtr<T> {
    /// Compares resolved targets, not stored offsets
    fn eq(&self, other: &Self) -> bool {
        self.get() == other.get()
    }
}

impl<T> Eq for RelPtr<T> {}

impl<T> PartialEq<*const T> for RelPtr<T> {
    fn eq(&self, other: &*const T) -> bool {
        self.get() as *const T == *other
    }
}

impl<T> PartialEq<*mut T> for RelPtr<T> {
    fn eq(&self, other: &*mut T) -> bool {
        self.get() == *other
    }
}

impl<T> PartialOrd for RelPtr<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for RelPtr<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.get() as usize).cmp(&(other.get() as usize))
    }
}

impl<T> fmt::Debug for RelPtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelPtr")
            .field("offset", &self.offset)
            .field("target", &self.get())
            .finish()
    }
}

impl<T> fmt::Pointer for RelPtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Pointer::fmt(&self.get(), f)
    }
}
