//! Race-detector annotations for atomic pointer traffic
//!
//! Relative pointers publish objects through an offset word, which race
//! detectors cannot follow back to the target. Every atomic store is
//! reported as a release and every atomic load as an acquire on the slot's
//! address, filtered by the memory ordering actually used.
//!
//! With the `tsan` feature the calls go to ThreadSanitizer's runtime,
//! otherwise they compile to nothing.

use std::sync::atomic::Ordering;

/// Annotate a store (or the write half of a read-modify-write) on `addr`
#[inline(always)]
pub fn happens_before<T>(order: Ordering, addr: *const T) {
    if matches!(order, Ordering::Release | Ordering::AcqRel | Ordering::SeqCst) {
        imp::release(addr as *const u8);
    }
}

/// Annotate a load (or the read half of a read-modify-write) on `addr`
#[inline(always)]
pub fn happens_after<T>(order: Ordering, addr: *const T) {
    if matches!(order, Ordering::Acquire | Ordering::AcqRel | Ordering::SeqCst) {
        imp::acquire(addr as *const u8);
    }
}

#[cfg(feature = "tsan")]
mod imp {
    use std::ffi::c_void;

    extern "C" {
        fn __tsan_acquire(addr: *mut c_void);
        fn __tsan_release(addr: *mut c_void);
    }

    #[inline(always)]
    pub fn acquire(addr: *const u8) {
        // SAFETY: the tsan runtime only records the address
        unsafe { __tsan_acquire(addr as *mut c_void) }
    }

    #[inline(always)]
    pub fn release(addr: *const u8) {
        // SAFETY: the tsan runtime only records the address
        unsafe { __tsan_release(addr as *mut c_void) }
    }
}

#[cfg(not(feature = "tsan"))]
mod imp {
    #[inline(always)]
    pub fn acquire(_addr: *const u8) {}

    #[inline(always)]
    pub fn release(_addr: *const u8) {}
}
