//! Block heap
//!
//! Blocks are carved from the heap region with a bump cursor and recycled
//! through a first-fit free list. The list and the live-block index are
//! volatile; on open they are rebuilt by scanning block headers, which are
//! the only allocator state kept on media.
//!
//! Adjacent free blocks are merged when they meet on the free list.

use crate::layout::{BlockHeader, BlockState, BLOCK_ALIGN};
use crate::mapping::Mapping;
use pmkit_core::{Error, Result};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FreeBlock {
    /// Offset of the block header
    offset: usize,
    /// Payload size
    size: usize,
}

impl FreeBlock {
    fn end(&self) -> usize {
        self.offset + BlockHeader::SIZE + self.size
    }
}

/// A block that is not free
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct LiveBlock {
    pub size: usize,
    pub type_tag: u64,
    pub state: BlockState,
}

/// Outcome of a recovery scan
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryStats {
    /// Allocated blocks found
    pub live_blocks: usize,
    /// Free blocks found
    pub free_blocks: usize,
    /// Reserved blocks left by an interrupted allocation, now free
    pub reclaimed: usize,
}

/// Result of carving a block
#[derive(Debug, Clone, Copy)]
pub(crate) struct Carved {
    /// Offset of the payload
    pub payload: usize,
    /// Payload size actually reserved
    pub size: usize,
    /// True if the bump cursor moved
    pub grew: bool,
}

pub(crate) struct Heap {
    start: usize,
    end: usize,
    limit: usize,
    free: Vec<FreeBlock>,
    live: BTreeMap<usize, LiveBlock>,
}

impl Heap {
    /// Empty heap over `start..limit`
    pub(crate) fn new(start: usize, limit: usize) -> Self {
        Heap {
            start,
            end: start,
            limit,
            free: Vec::new(),
            live: BTreeMap::new(),
        }
    }

    /// Rebuild the volatile state from the headers in `start..end`
    pub(crate) fn recover(map: &Mapping, start: usize, end: usize) -> Result<(Self, RecoveryStats)> {
        let mut heap = Heap::new(start, map.len());
        heap.end = end;
        let mut stats = RecoveryStats::default();

        let mut offset = start;
        while offset < end {
            if offset + BlockHeader::SIZE > end {
                return Err(Error::InvalidPool(format!(
                    "truncated block header at offset {offset}"
                )));
            }
            // SAFETY: offset + SIZE <= end <= mapping length, offset is aligned
            let header: BlockHeader = unsafe { map.read(offset) };
            let size = header.size as usize;
            let state = header.state();
            if size == 0 || size % BLOCK_ALIGN != 0 || offset + header.total_size() > end {
                return Err(Error::InvalidPool(format!(
                    "corrupt block header at offset {offset} (size {size})"
                )));
            }

            match state {
                Some(BlockState::Allocated) => {
                    heap.live.insert(
                        offset,
                        LiveBlock {
                            size,
                            type_tag: header.type_tag,
                            state: BlockState::Allocated,
                        },
                    );
                    stats.live_blocks += 1;
                }
                Some(BlockState::Reserved) => {
                    heap.release(map, FreeBlock { offset, size });
                    stats.reclaimed += 1;
                }
                Some(BlockState::Free) => {
                    heap.release(map, FreeBlock { offset, size });
                    stats.free_blocks += 1;
                }
                None => {
                    return Err(Error::InvalidPool(format!(
                        "unknown block state {} at offset {offset}",
                        header.state
                    )));
                }
            }
            offset += header.total_size();
        }

        Ok((heap, stats))
    }

    /// End of the carved region
    pub(crate) fn end(&self) -> usize {
        self.end
    }

    pub(crate) fn live_count(&self) -> usize {
        self.live
            .values()
            .filter(|b| b.state == BlockState::Allocated)
            .count()
    }

    pub(crate) fn free_count(&self) -> usize {
        self.free.len()
    }

    pub(crate) fn free_bytes(&self) -> usize {
        self.free.iter().map(|b| b.size).sum::<usize>() + (self.limit - self.end)
    }

    /// Look up a block by its payload offset
    pub(crate) fn block(&self, payload: usize) -> Option<LiveBlock> {
        let offset = payload.checked_sub(BlockHeader::SIZE)?;
        self.live.get(&offset).copied()
    }

    /// Carve a block with at least `size` payload bytes
    pub(crate) fn carve(
        &mut self,
        map: &Mapping,
        size: usize,
        type_tag: u64,
        state: BlockState,
    ) -> Result<Carved> {
        debug_assert!(size > 0 && size % BLOCK_ALIGN == 0);

        let (offset, size, grew) = match self.free.iter().position(|b| b.size >= size) {
            Some(i) => {
                let block = self.free[i];
                let rest = block.size - size;
                if rest >= BlockHeader::SIZE + BLOCK_ALIGN {
                    let tail = FreeBlock {
                        offset: block.offset + BlockHeader::SIZE + size,
                        size: rest - BlockHeader::SIZE,
                    };
                    self.write_header(map, tail.offset, tail.size, 0, BlockState::Free);
                    self.free[i] = tail;
                    (block.offset, size, false)
                } else {
                    self.free.remove(i);
                    (block.offset, block.size, false)
                }
            }
            None => {
                let total = BlockHeader::SIZE + size;
                if self.limit - self.end < total {
                    return Err(Error::OutOfMemory(format!(
                        "{size} bytes requested, {} left in heap",
                        self.free_bytes()
                    )));
                }
                let offset = self.end;
                self.end += total;
                (offset, size, true)
            }
        };

        self.write_header(map, offset, size, type_tag, state);
        self.live.insert(offset, LiveBlock { size, type_tag, state });

        Ok(Carved {
            payload: offset + BlockHeader::SIZE,
            size,
            grew,
        })
    }

    /// Flip a reserved block to allocated
    pub(crate) fn publish(&mut self, map: &Mapping, payload: usize) -> bool {
        let offset = payload - BlockHeader::SIZE;
        match self.live.get_mut(&offset) {
            Some(block) if block.state == BlockState::Reserved => {
                block.state = BlockState::Allocated;
                let state_at = offset + BlockHeader::STATE_OFFSET;
                // SAFETY: the header of a live block lies inside the heap
                unsafe { map.write(state_at, BlockState::Allocated as u32) };
                map.persist(state_at, std::mem::size_of::<u32>());
                true
            }
            _ => false,
        }
    }

    /// Return a live or reserved block to the free list
    ///
    /// Returns false if `payload` does not name such a block.
    pub(crate) fn free(&mut self, map: &Mapping, payload: usize) -> bool {
        let Some(offset) = payload.checked_sub(BlockHeader::SIZE) else {
            return false;
        };
        match self.live.remove(&offset) {
            Some(block) => {
                self.release(map, FreeBlock {
                    offset,
                    size: block.size,
                });
                true
            }
            None => false,
        }
    }

    /// Insert into the offset-ordered free list, merging with neighbours
    fn release(&mut self, map: &Mapping, block: FreeBlock) {
        let idx = match self.free.binary_search_by_key(&block.offset, |b| b.offset) {
            Ok(idx) | Err(idx) => idx,
        };
        let mut merged = block;
        let mut at = idx;

        if at < self.free.len() && self.free[at].offset == merged.end() {
            merged.size += BlockHeader::SIZE + self.free[at].size;
            self.free.remove(at);
        }
        if at > 0 && self.free[at - 1].end() == merged.offset {
            at -= 1;
            let prev = self.free.remove(at);
            merged = FreeBlock {
                offset: prev.offset,
                size: prev.size + BlockHeader::SIZE + merged.size,
            };
        }

        self.write_header(map, merged.offset, merged.size, 0, BlockState::Free);
        self.free.insert(at, merged);
    }

    fn write_header(&self, map: &Mapping, offset: usize, size: usize, tag: u64, state: BlockState) {
        debug_assert!(offset >= self.start && offset + BlockHeader::SIZE <= self.limit);
        // SAFETY: offset is a block header slot inside the heap region
        unsafe { map.write(offset, BlockHeader::new(size, tag, state)) };
        map.persist(offset, BlockHeader::SIZE);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::HEAP_START;

    fn setup(len: usize) -> (Mapping, Heap) {
        let map = Mapping::anonymous(len).unwrap();
        let heap = Heap::new(HEAP_START, map.len());
        (map, heap)
    }

    #[test]
    fn test_bump_then_reuse() {
        let (map, mut heap) = setup(4096);
        let a = heap.carve(&map, 64, 1, BlockState::Allocated).unwrap();
        let b = heap.carve(&map, 64, 1, BlockState::Allocated).unwrap();
        assert!(a.grew && b.grew);
        assert_eq!(b.payload, a.payload + 64 + BlockHeader::SIZE);

        assert!(heap.free(&map, a.payload));
        let c = heap.carve(&map, 48, 2, BlockState::Allocated).unwrap();
        assert!(!c.grew);
        assert_eq!(c.payload, a.payload);
        // 16 bytes left over is too small to split off
        assert_eq!(c.size, 64);
    }

    #[test]
    fn test_split_large_free_block() {
        let (map, mut heap) = setup(4096);
        let a = heap.carve(&map, 256, 1, BlockState::Allocated).unwrap();
        let _guard = heap.carve(&map, 16, 1, BlockState::Allocated).unwrap();
        heap.free(&map, a.payload);

        let b = heap.carve(&map, 64, 1, BlockState::Allocated).unwrap();
        assert_eq!(b.payload, a.payload);
        assert_eq!(b.size, 64);
        assert_eq!(heap.free_count(), 1);
    }

    #[test]
    fn test_double_free_rejected() {
        let (map, mut heap) = setup(4096);
        let a = heap.carve(&map, 32, 1, BlockState::Allocated).unwrap();
        assert!(heap.free(&map, a.payload));
        assert!(!heap.free(&map, a.payload));
        assert!(!heap.free(&map, a.payload + 16));
        assert!(!heap.free(&map, 0));
    }

    #[test]
    fn test_neighbours_merge() {
        let (map, mut heap) = setup(4096);
        let a = heap.carve(&map, 32, 1, BlockState::Allocated).unwrap();
        let b = heap.carve(&map, 32, 1, BlockState::Allocated).unwrap();
        let c = heap.carve(&map, 32, 1, BlockState::Allocated).unwrap();
        let _d = heap.carve(&map, 32, 1, BlockState::Allocated).unwrap();

        heap.free(&map, a.payload);
        heap.free(&map, c.payload);
        assert_eq!(heap.free_count(), 2);
        heap.free(&map, b.payload);
        assert_eq!(heap.free_count(), 1);

        let big = heap.carve(&map, 32 * 3 + BlockHeader::SIZE * 2, 1, BlockState::Allocated);
        assert_eq!(big.unwrap().payload, a.payload);
    }

    #[test]
    fn test_out_of_memory() {
        let (map, mut heap) = setup(1024);
        let err = heap.carve(&map, 4096, 1, BlockState::Allocated).unwrap_err();
        assert!(err.is_out_of_memory());
    }

    #[test]
    fn test_publish_reserved() {
        let (map, mut heap) = setup(4096);
        let a = heap.carve(&map, 32, 9, BlockState::Reserved).unwrap();
        assert_eq!(heap.live_count(), 0);
        assert!(heap.publish(&map, a.payload));
        assert!(!heap.publish(&map, a.payload));
        assert_eq!(heap.live_count(), 1);
        assert_eq!(heap.block(a.payload).unwrap().type_tag, 9);
    }

    #[test]
    fn test_recover_rebuilds_state() {
        let (map, mut heap) = setup(4096);
        let a = heap.carve(&map, 32, 1, BlockState::Allocated).unwrap();
        let b = heap.carve(&map, 64, 2, BlockState::Allocated).unwrap();
        let c = heap.carve(&map, 32, 3, BlockState::Reserved).unwrap();
        let _d = heap.carve(&map, 32, 4, BlockState::Allocated).unwrap();
        heap.free(&map, a.payload);

        let (recovered, stats) = Heap::recover(&map, HEAP_START, heap.end()).unwrap();
        assert_eq!(stats.live_blocks, 2);
        assert_eq!(stats.free_blocks, 1);
        assert_eq!(stats.reclaimed, 1);
        assert_eq!(recovered.block(b.payload).unwrap().type_tag, 2);
        assert!(recovered.block(c.payload).is_none());
        assert_eq!(recovered.end(), heap.end());
    }

    #[test]
    fn test_recover_rejects_garbage() {
        let (map, _heap) = setup(4096);
        // SAFETY: inside the mapping
        unsafe { map.write(HEAP_START, BlockHeader::new(48, 0, BlockState::Allocated)) };
        unsafe { map.write(HEAP_START + BlockHeader::STATE_OFFSET, 77u32) };
        let err = Heap::recover(&map, HEAP_START, HEAP_START + 80).err().unwrap();
        assert!(matches!(err, Error::InvalidPool(_)));
    }

    proptest::proptest! {
        #[test]
        fn prop_live_blocks_never_overlap(ops in proptest::collection::vec((0usize..2, 1usize..12), 1..64)) {
            let (map, mut heap) = setup(16 * 1024);
            let mut live: Vec<Carved> = Vec::new();

            for (op, n) in ops {
                if op == 0 || live.is_empty() {
                    if let Ok(block) = heap.carve(&map, n * BLOCK_ALIGN, 1, BlockState::Allocated) {
                        live.push(block);
                    }
                } else {
                    let block = live.swap_remove(n % live.len());
                    proptest::prop_assert!(heap.free(&map, block.payload));
                }

                let mut spans: Vec<(usize, usize)> = live
                    .iter()
                    .map(|b| (b.payload - BlockHeader::SIZE, b.payload + b.size))
                    .collect();
                spans.sort_unstable();
                for pair in spans.windows(2) {
                    proptest::prop_assert!(pair[0].1 <= pair[1].0);
                }
                if let Some(last) = spans.last() {
                    proptest::prop_assert!(last.1 <= heap.end());
                }
                proptest::prop_assert_eq!(heap.live_count(), live.len());
            }
        }
    }
}
