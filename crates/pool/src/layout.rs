//! On-media layout of a pool
//!
//! ```text
//! +------------------+ 0
//! |   PoolHeader     |  (HEADER_SIZE) magic, identity, heap cursor, root
//! +------------------+ HEAP_START
//! | BlockHeader      |  32 bytes
//! | payload ...      |  multiple of BLOCK_ALIGN
//! +------------------+
//! | BlockHeader      |
//! | payload ...      |
//! +------------------+ heap_end (cursor)
//! |   unused         |
//! +------------------+ size
//! ```
//!
//! Every offset stored on media is relative to the start of the mapping, so
//! the pool can be mapped at any base address.

use std::mem::size_of;

/// Identifies a pmkit pool ("PMKITPL1")
pub const POOL_MAGIC: u64 = 0x504D_4B49_5450_4C31;

/// Layout version
pub const POOL_VERSION: u32 = 1;

/// Bytes reserved for the pool header
pub const HEADER_SIZE: usize = 256;

/// Offset of the first block header
pub const HEAP_START: usize = HEADER_SIZE;

/// Payload alignment of every block
pub const BLOCK_ALIGN: usize = 16;

/// Smallest pool that can be created
pub const MIN_POOL_SIZE: usize = 64 * 1024;

/// Allocation state of a block
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    /// Available for reuse
    Free = 0,
    /// Handed to a constructor but not yet published
    Reserved = 1,
    /// Live
    Allocated = 2,
}

impl BlockState {
    /// Decode a stored state; unknown values are `None`
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(BlockState::Free),
            1 => Some(BlockState::Reserved),
            2 => Some(BlockState::Allocated),
            _ => None,
        }
    }
}

/// Pool header stored at offset 0
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct PoolHeader {
    /// Must equal [`POOL_MAGIC`]
    pub magic: u64,
    /// Layout version
    pub version: u32,
    /// CRC32 of the immutable fields (magic through `heap_start`)
    pub checksum: u32,
    /// Pool UUID
    pub uuid: [u8; 16],
    /// Total mapped size
    pub size: u64,
    /// Offset of the first block
    pub heap_start: u64,
    /// End of the carved heap; blocks never extend past it
    pub heap_end: u64,
    /// Offset of the root object, 0 when unset
    pub root_offset: u64,
    /// Type tag of the root object
    pub root_tag: u64,
    /// Incremented on every open
    pub run_id: u64,
}

const _: () = assert!(size_of::<PoolHeader>() <= HEADER_SIZE);

impl PoolHeader {
    /// Header for a freshly created pool
    pub fn new(uuid: [u8; 16], size: usize) -> Self {
        let mut header = PoolHeader {
            magic: POOL_MAGIC,
            version: POOL_VERSION,
            checksum: 0,
            uuid,
            size: size as u64,
            heap_start: HEAP_START as u64,
            heap_end: HEAP_START as u64,
            root_offset: 0,
            root_tag: 0,
            run_id: 1,
        };
        header.checksum = header.calculate_checksum();
        header
    }

    /// Checksum over the fields that never change after creation
    pub fn calculate_checksum(&self) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&self.magic.to_le_bytes());
        hasher.update(&self.version.to_le_bytes());
        hasher.update(&self.uuid);
        hasher.update(&self.size.to_le_bytes());
        hasher.update(&self.heap_start.to_le_bytes());
        hasher.finalize()
    }

    /// True if the stored checksum matches
    pub fn verify_checksum(&self) -> bool {
        self.checksum == self.calculate_checksum()
    }
}

/// Header in front of every block payload
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    /// Payload size in bytes, a multiple of [`BLOCK_ALIGN`]
    pub size: u64,
    /// Type tag recorded by the allocating call
    pub type_tag: u64,
    /// Raw [`BlockState`]
    pub state: u32,
    /// Reserved
    pub flags: u32,
    /// Reserved
    pub _reserved: u64,
}

impl BlockHeader {
    /// Size of the header on media
    pub const SIZE: usize = size_of::<BlockHeader>();

    /// Offset of `state` inside the header
    pub const STATE_OFFSET: usize = 16;

    /// Header for a block in `state`
    pub fn new(size: usize, type_tag: u64, state: BlockState) -> Self {
        BlockHeader {
            size: size as u64,
            type_tag,
            state: state as u32,
            flags: 0,
            _reserved: 0,
        }
    }

    /// Decoded state
    pub fn state(&self) -> Option<BlockState> {
        BlockState::from_raw(self.state)
    }

    /// Bytes occupied by header and payload
    pub fn total_size(&self) -> usize {
        Self::SIZE + self.size as usize
    }
}

const _: () = assert!(BlockHeader::SIZE == 32);
const _: () = assert!(BlockHeader::SIZE % BLOCK_ALIGN == 0);

/// Round `n` up to a multiple of `align` (a power of two)
pub fn align_up(n: usize, align: usize) -> Option<usize> {
    debug_assert!(align.is_power_of_two());
    Some(n.checked_add(align - 1)? & !(align - 1))
}

/// Payload size actually reserved for a request of `size` bytes
pub fn block_size_for(size: usize) -> Option<usize> {
    align_up(size.max(1), BLOCK_ALIGN)
}
