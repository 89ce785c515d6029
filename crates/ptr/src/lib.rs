//! Position-independent pointers for memory-mapped pools
//!
//! A pool may be mapped at a different base address every time it is
//! opened, so pointers stored inside it cannot hold absolute addresses.
//! Every pointer here stores the signed distance from its own location to
//! its target instead:
//! - RelPtr: plain relative pointer
//! - AtomicRelPtr: the same word behind an atomic, with race annotations
//! - TaggedPtr / AtomicTaggedPtr: one word that points at one of two kinds
//!
//! A relative pointer is only meaningful at the address where it lives.
//! None of these types implement `Clone` or `Copy`; use `assign` and `swap`
//! to move targets between slots.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod annotate;
pub mod atomic;
pub mod relative;
pub mod tagged;

pub use atomic::AtomicRelPtr;
pub use relative::RelPtr;
pub use tagged::{AtomicTaggedPtr, TaggedPtr, Target};
