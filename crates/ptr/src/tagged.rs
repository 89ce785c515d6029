//! Two-kind tagged relative pointer
//!
//! A [`TaggedPtr<F, S>`] references either an `F` ("first" kind) or an `S`
//! ("second" kind) in one relative word. The low bit of the target address
//! is the discriminator: set for `F`, clear for `S`. `F` must therefore have
//! an alignment of at least 2 so its addresses never use that bit.
//!
//! The tag is applied to the absolute address before the offset is
//! computed, so it survives relocation exactly like the target does.
//!
//! Null has no kind: storing a null of either kind writes the canonical null
//! word, and both `is_first` and `is_second` report false for it.
//!
//! [`AtomicTaggedPtr`] makes the whole word one atomic unit, which is the
//! building block for lock-free structures with two node kinds (for
//! example leaf and internal nodes).

use crate::atomic::AtomicRelPtr;
use crate::relative::RelPtr;
use std::fmt;
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::atomic::Ordering;

const TAG: usize = 1;

/// Resolved target of a tagged pointer
pub enum Target<F, S> {
    /// Target of the first (tagged) kind
    First(NonNull<F>),
    /// Target of the second (untagged) kind
    Second(NonNull<S>),
}

impl<F, S> Target<F, S> {
    /// Tag a first-kind pointer; `None` for null
    pub fn first(ptr: *const F) -> Option<Self> {
        NonNull::new(ptr as *mut F).map(Target::First)
    }

    /// Wrap a second-kind pointer; `None` for null
    pub fn second(ptr: *const S) -> Option<Self> {
        NonNull::new(ptr as *mut S).map(Target::Second)
    }

    /// True for the first kind
    pub fn is_first(&self) -> bool {
        matches!(self, Target::First(_))
    }

    /// True for the second kind
    pub fn is_second(&self) -> bool {
        matches!(self, Target::Second(_))
    }

    /// Untagged target address
    pub fn addr(&self) -> usize {
        match self {
            Target::First(p) => p.as_ptr() as usize,
            Target::Second(p) => p.as_ptr() as usize,
        }
    }

    fn word(&self) -> usize {
        match self {
            Target::First(p) => {
                let addr = p.as_ptr() as usize;
                debug_assert_eq!(addr & TAG, 0, "first-kind target must be 2-byte aligned");
                addr | TAG
            }
            Target::Second(p) => p.as_ptr() as usize,
        }
    }

    fn from_word(word: usize) -> Option<Self> {
        if word & TAG != 0 {
            NonNull::new((word & !TAG) as *mut F).map(Target::First)
        } else {
            NonNull::new(word as *mut S).map(Target::Second)
        }
    }
}

#[inline]
fn word_of<F, S>(target: Option<Target<F, S>>) -> usize {
    target.map_or(0, |t| t.word())
}

impl<F, S> Clone for Target<F, S> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<F, S> Copy for Target<F, S> {}

impl<F, S> PartialEq for Target<F, S> {
    fn eq(&self, other: &Self) -> bool {
        self.word() == other.word()
    }
}

impl<F, S> Eq for Target<F, S> {}

impl<F, S> fmt::Debug for Target<F, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::First(p) => f.debug_tuple("First").field(p).finish(),
            Target::Second(p) => f.debug_tuple("Second").field(p).finish(),
        }
    }
}

/// Relative pointer to either an `F` or an `S`
#[repr(transparent)]
pub struct TaggedPtr<F, S> {
    ptr: RelPtr<u8>,
    _marker: PhantomData<(*mut F, *mut S)>,
}

// SAFETY: same reasoning as RelPtr
unsafe impl<F: Send + Sync, S: Send + Sync> Send for TaggedPtr<F, S> {}
unsafe impl<F: Send + Sync, S: Send + Sync> Sync for TaggedPtr<F, S> {}

impl<F, S> TaggedPtr<F, S> {
    /// Null pointer, valid at any address
    pub const fn null() -> Self {
        TaggedPtr {
            ptr: RelPtr::null(),
            _marker: PhantomData,
        }
    }

    #[inline]
    fn word(&self) -> usize {
        self.ptr.addr()
    }

    /// Point at `target`, discriminating by its kind
    #[inline]
    pub fn set(&mut self, target: Option<Target<F, S>>) {
        self.ptr.set_addr(word_of(target));
    }

    /// Point at a first-kind target
    #[inline]
    pub fn set_first(&mut self, ptr: *const F) {
        self.set(Target::first(ptr));
    }

    /// Point at a second-kind target
    #[inline]
    pub fn set_second(&mut self, ptr: *const S) {
        self.set(Target::second(ptr));
    }

    /// Reset to null
    #[inline]
    pub fn set_null(&mut self) {
        self.ptr.set_null();
    }

    /// Resolved target with its kind
    #[inline]
    pub fn get(&self) -> Option<Target<F, S>> {
        Target::from_word(self.word())
    }

    /// True if null, whichever kind was last stored
    #[inline]
    pub fn is_null(&self) -> bool {
        self.word() & !TAG == 0
    }

    /// True if the target is of the first kind
    #[inline]
    pub fn is_first(&self) -> bool {
        matches!(self.get(), Some(Target::First(_)))
    }

    /// True if the target is of the second kind
    #[inline]
    pub fn is_second(&self) -> bool {
        matches!(self.get(), Some(Target::Second(_)))
    }

    /// First-kind target
    ///
    /// Calling this on a second-kind pointer is a contract violation: it
    /// asserts in debug builds and returns an unrelated address otherwise.
    #[inline]
    pub fn first(&self) -> *mut F {
        debug_assert!(!self.is_second(), "first() on a second-kind tagged pointer");
        (self.word() & !TAG) as *mut F
    }

    /// Second-kind target
    ///
    /// Calling this on a first-kind pointer is a contract violation.
    #[inline]
    pub fn second(&self) -> *mut S {
        debug_assert!(!self.is_first(), "second() on a first-kind tagged pointer");
        self.word() as *mut S
    }

    /// True if this points at the first-kind object `ptr`
    #[inline]
    pub fn points_to_first(&self, ptr: *const F) -> bool {
        self.is_first() && self.first() as *const F == ptr
    }

    /// True if this points at the second-kind object `ptr`
    #[inline]
    pub fn points_to_second(&self, ptr: *const S) -> bool {
        self.is_second() && self.second() as *const S == ptr
    }

    /// Copy the logical target of `other`
    #[inline]
    pub fn assign(&mut self, other: &TaggedPtr<F, S>) {
        self.ptr.set_addr(other.word());
    }

    /// Exchange logical targets with `other`
    pub fn swap(&mut self, other: &mut TaggedPtr<F, S>) {
        let mine = self.word();
        let theirs = other.word();
        self.ptr.set_addr(theirs);
        other.ptr.set_addr(mine);
    }
}

impl<F, S> Default for TaggedPtr<F, S> {
    fn default() -> Self {
        Self::null()
    }
}

impl<F, S> PartialEq for TaggedPtr<F, S> {
    fn eq(&self, other: &Self) -> bool {
        self.word() == other.word()
    }
}

impl<F, S> Eq for TaggedPtr<F, S> {}

impl<F, S> fmt::Debug for TaggedPtr<F, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TaggedPtr").field(&self.get()).finish()
    }
}

/// Atomic [`TaggedPtr`]: the tagged word is loaded, stored and exchanged as
/// one unit
#[repr(transparent)]
pub struct AtomicTaggedPtr<F, S> {
    ptr: AtomicRelPtr<u8>,
    _marker: PhantomData<(*mut F, *mut S)>,
}

// SAFETY: the shared state is a single atomic word
unsafe impl<F: Send + Sync, S: Send + Sync> Send for AtomicTaggedPtr<F, S> {}
unsafe impl<F: Send + Sync, S: Send + Sync> Sync for AtomicTaggedPtr<F, S> {}

impl<F, S> AtomicTaggedPtr<F, S> {
    /// Null pointer, valid at any address
    pub const fn null() -> Self {
        AtomicTaggedPtr {
            ptr: AtomicRelPtr::null(),
            _marker: PhantomData,
        }
    }

    /// Load the current target
    #[inline]
    pub fn load(&self, order: Ordering) -> Option<Target<F, S>> {
        Target::from_word(self.ptr.load_addr(order))
    }

    /// Store a new target
    #[inline]
    pub fn store(&self, target: Option<Target<F, S>>, order: Ordering) {
        self.ptr.store_addr(word_of(target), order);
    }

    /// Store a new target, returning the previous one
    #[inline]
    pub fn swap(&self, target: Option<Target<F, S>>, order: Ordering) -> Option<Target<F, S>> {
        let previous = self.ptr.swap(word_of(target) as *mut u8, order);
        Target::from_word(previous as usize)
    }

    /// Replace `current` with `new` if the slot still holds `current`
    ///
    /// Both the address and the kind must match.
    #[inline]
    pub fn compare_exchange(
        &self,
        current: Option<Target<F, S>>,
        new: Option<Target<F, S>>,
        success: Ordering,
        failure: Ordering,
    ) -> Result<Option<Target<F, S>>, Option<Target<F, S>>> {
        self.ptr
            .compare_exchange(
                word_of(current) as *mut u8,
                word_of(new) as *mut u8,
                success,
                failure,
            )
            .map(|w| Target::from_word(w as usize))
            .map_err(|w| Target::from_word(w as usize))
    }

    /// Like [`compare_exchange`](Self::compare_exchange) but may fail spuriously
    #[inline]
    pub fn compare_exchange_weak(
        &self,
        current: Option<Target<F, S>>,
        new: Option<Target<F, S>>,
        success: Ordering,
        failure: Ordering,
    ) -> Result<Option<Target<F, S>>, Option<Target<F, S>>> {
        self.ptr
            .compare_exchange_weak(
                word_of(current) as *mut u8,
                word_of(new) as *mut u8,
                success,
                failure,
            )
            .map(|w| Target::from_word(w as usize))
            .map_err(|w| Target::from_word(w as usize))
    }
}

impl<F, S> Default for AtomicTaggedPtr<F, S> {
    fn default() -> Self {
        Self::null()
    }
}

impl<F, S> fmt::Debug for AtomicTaggedPtr<F, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("AtomicTaggedPtr")
            .field(&self.load(Ordering::Relaxed))
            .finish()
    }
}
