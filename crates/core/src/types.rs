//! Core types shared by the pool, pointer and transaction layers
//!
//! - [`PoolId`]: Unique identifier of a pool
//! - [`TypeTag`]: Stable type identity stored with every allocation
//! - [`AllocFlags`]: Allocator behaviour switches
//! - [`AllocRequest`]: Size, alignment and tag for one raw allocation

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use uuid::Uuid;

/// Unique identifier for a pool
///
/// Written into the pool header on creation and preserved across reopen,
/// so the same pool keeps its identity while its base address changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PoolId(Uuid);

impl PoolId {
    /// Create a new random PoolId using UUID v4
    pub fn new() -> Self {
        PoolId(Uuid::new_v4())
    }

    /// Create PoolId from raw bytes
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        PoolId(Uuid::from_bytes(bytes))
    }

    /// Get raw bytes representation
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for PoolId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Type identity attached to an allocation
///
/// Derived from the type's name with xxh3, so it is stable across process
/// restarts for the same build (unlike `TypeId`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TypeTag(u64);

impl TypeTag {
    /// Tag for untyped allocations
    pub const NONE: TypeTag = TypeTag(0);

    /// Tag for `T`
    pub fn of<T: ?Sized>() -> Self {
        TypeTag(xxhash_rust::xxh3::xxh3_64(
            std::any::type_name::<T>().as_bytes(),
        ))
    }

    /// Tag from a raw value read back from media
    pub const fn from_raw(raw: u64) -> Self {
        TypeTag(raw)
    }

    /// Raw value as stored on media
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

/// Allocator behaviour switches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct AllocFlags(u32);

impl AllocFlags {
    /// Default behaviour
    pub const NONE: AllocFlags = AllocFlags(0);
    /// Zero the allocation before handing it out
    pub const ZERO: AllocFlags = AllocFlags(1 << 0);
    /// Skip flushing the new object on commit
    pub const NO_FLUSH: AllocFlags = AllocFlags(1 << 1);

    /// Raw bit representation
    pub const fn bits(&self) -> u32 {
        self.0
    }

    /// True if every flag in `other` is set
    pub const fn contains(&self, other: AllocFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for AllocFlags {
    type Output = AllocFlags;

    fn bitor(self, rhs: AllocFlags) -> AllocFlags {
        AllocFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for AllocFlags {
    fn bitor_assign(&mut self, rhs: AllocFlags) {
        self.0 |= rhs.0;
    }
}

/// One raw allocation request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocRequest {
    /// Size in bytes
    pub size: usize,
    /// Required alignment in bytes (power of two)
    pub align: usize,
    /// Type identity recorded with the block
    pub type_tag: TypeTag,
    /// Allocator flags
    pub flags: AllocFlags,
}

impl AllocRequest {
    /// Request room for `count` values of `T`
    ///
    /// Returns `None` when the byte size overflows.
    pub fn array<T>(count: usize, flags: AllocFlags) -> Option<Self> {
        let size = std::mem::size_of::<T>().checked_mul(count)?;
        Some(AllocRequest {
            size,
            align: std::mem::align_of::<T>(),
            type_tag: TypeTag::of::<T>(),
            flags,
        })
    }
}
