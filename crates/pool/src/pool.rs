//! The pool: a mapped region with a header, a heap and a root object
//!
//! ## Crash consistency
//!
//! A block header is written and persisted before the cursor that covers it,
//! so a scan never walks into an unwritten header. Atomic allocation
//! follows the reserve/construct/publish protocol:
//!
//! 1. Carve the block with state `Reserved`
//! 2. Run the constructor over the payload
//! 3. Persist the payload
//! 4. Flip the state to `Allocated` and persist it (the commit point)
//!
//! A crash before step 4 leaves a `Reserved` block, which the next open
//! reclaims. Transactional allocations use the same states: they are
//! reserved when made and published when the transaction commits.

use crate::config::{PoolBuilder, PoolConfig};
use crate::heap::{Heap, RecoveryStats};
use crate::layout::{
    block_size_for, BlockState, PoolHeader, BLOCK_ALIGN, HEAP_START, MIN_POOL_SIZE, POOL_MAGIC,
    POOL_VERSION,
};
use crate::mapping::Mapping;
use parking_lot::Mutex;
use pmkit_core::registry;
use pmkit_core::{
    AllocFlags, AllocRequest, AtomicCtor, Error, PoolId, PoolRef, PoolService, Result, TypeTag,
};
use std::mem::{offset_of, size_of};
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Point-in-time heap statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    /// Mapped size in bytes
    pub capacity: usize,
    /// Allocated blocks
    pub live_blocks: usize,
    /// Blocks on the free list
    pub free_blocks: usize,
    /// Bytes still available (free list plus uncarved tail)
    pub free_bytes: usize,
}

/// A memory-mapped persistent pool
///
/// Pools are always handled through `Arc<Pool>`: creation registers the pool
/// in the process-wide registry so interior addresses can be resolved back
/// to it, and dropping the last handle unregisters it.
pub struct Pool {
    id: PoolId,
    run_id: u64,
    map: Mapping,
    heap: Mutex<Heap>,
    path: Option<PathBuf>,
}

impl Pool {
    /// Builder for pool configuration
    pub fn builder() -> PoolBuilder {
        PoolBuilder::new()
    }

    /// Anonymous pool of `size` bytes; contents vanish on drop
    pub fn anonymous(size: usize) -> Result<Arc<Self>> {
        Self::builder().size(size).create()
    }

    /// Create a file-backed pool, truncating `path`
    pub fn create(path: impl AsRef<Path>, size: usize) -> Result<Arc<Self>> {
        Self::builder().path(path).size(size).create()
    }

    /// Open an existing pool file
    pub fn open(path: impl AsRef<Path>) -> Result<Arc<Self>> {
        Self::builder().path(path).open()
    }

    pub(crate) fn with_config(config: PoolConfig) -> Result<Arc<Self>> {
        config.validate()?;

        let map = match &config.path {
            Some(path) => Mapping::create(path, config.size, config.flush_on_persist)?,
            None => Mapping::anonymous(config.size)?,
        };

        let id = PoolId::new();
        let header = PoolHeader::new(*id.as_bytes(), map.len());
        // SAFETY: the mapping is at least MIN_POOL_SIZE bytes
        unsafe { map.write(0, header) };
        map.persist(0, size_of::<PoolHeader>());

        info!(
            pool = %id,
            size = map.len(),
            path = ?config.path,
            "pool created"
        );

        let heap = Heap::new(HEAP_START, map.len());
        Ok(Self::register(Pool {
            id,
            run_id: header.run_id,
            map,
            heap: Mutex::new(heap),
            path: config.path,
        }))
    }

    pub(crate) fn open_with(path: &Path, flush_on_persist: bool) -> Result<Arc<Self>> {
        let map = Mapping::open(path, flush_on_persist)?;
        if map.len() < MIN_POOL_SIZE {
            return Err(Error::InvalidPool(format!(
                "file is {} bytes, smaller than any pool",
                map.len()
            )));
        }

        // SAFETY: length checked above
        let mut header: PoolHeader = unsafe { map.read(0) };
        Self::validate_header(&header, map.len())?;

        header.run_id += 1;
        // SAFETY: run_id is a field of the header at offset 0
        unsafe { map.write(offset_of!(PoolHeader, run_id), header.run_id) };
        map.persist(offset_of!(PoolHeader, run_id), size_of::<u64>());

        let (heap, stats) = Heap::recover(&map, header.heap_start as usize, header.heap_end as usize)?;
        let id = PoolId::from_bytes(header.uuid);
        Self::log_recovery(id, header.run_id, &stats);

        Ok(Self::register(Pool {
            id,
            run_id: header.run_id,
            map,
            heap: Mutex::new(heap),
            path: Some(path.to_path_buf()),
        }))
    }

    fn validate_header(header: &PoolHeader, len: usize) -> Result<()> {
        if header.magic != POOL_MAGIC {
            return Err(Error::InvalidPool("bad magic number".to_string()));
        }
        if header.version != POOL_VERSION {
            return Err(Error::InvalidPool(format!(
                "layout version mismatch: expected {POOL_VERSION}, got {}",
                header.version
            )));
        }
        if !header.verify_checksum() {
            return Err(Error::InvalidPool("header checksum mismatch".to_string()));
        }
        if header.size as usize != len {
            return Err(Error::InvalidPool(format!(
                "header says {} bytes, file has {len}",
                header.size
            )));
        }
        let (start, end) = (header.heap_start as usize, header.heap_end as usize);
        if start != HEAP_START || end < start || end > len {
            return Err(Error::InvalidPool(format!(
                "heap bounds {start}..{end} out of range"
            )));
        }
        Ok(())
    }

    fn log_recovery(id: PoolId, run_id: u64, stats: &RecoveryStats) {
        if stats.reclaimed > 0 {
            warn!(
                pool = %id,
                run_id,
                live = stats.live_blocks,
                reclaimed = stats.reclaimed,
                "pool opened, reclaimed interrupted allocations"
            );
        } else {
            info!(
                pool = %id,
                run_id,
                live = stats.live_blocks,
                free = stats.free_blocks,
                "pool opened"
            );
        }
    }

    fn register(pool: Pool) -> Arc<Self> {
        let pool = Arc::new(pool);
        let handle: PoolRef = pool.clone();
        registry::register(&handle);
        pool
    }

    /// This pool as a trait-object handle
    pub fn handle(self: &Arc<Self>) -> PoolRef {
        self.clone()
    }

    /// Backing file, if any
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Synchronously flush the whole mapping
    pub fn flush(&self) -> Result<()> {
        self.map.flush()
    }

    /// Heap statistics
    pub fn stats(&self) -> PoolStats {
        let heap = self.heap.lock();
        PoolStats {
            capacity: self.map.len(),
            live_blocks: heap.live_count(),
            free_blocks: heap.free_count(),
            free_bytes: heap.free_bytes(),
        }
    }

    /// Record `ptr` as the root object
    ///
    /// `ptr` must be a live allocation of this pool. The root is how data
    /// is found again after the pool is reopened at a different address.
    pub fn set_root<T>(&self, ptr: NonNull<T>) -> Result<()> {
        let payload = self.payload_offset(ptr.cast())
            .ok_or_else(|| Error::Config("root object is not inside this pool".to_string()))?;

        let heap = self.heap.lock();
        match heap.block(payload) {
            Some(block) if block.state == BlockState::Allocated => {}
            _ => {
                return Err(Error::Config(
                    "root object is not a live allocation".to_string(),
                ))
            }
        }
        self.write_root(payload as u64, TypeTag::of::<T>().as_u64());
        debug!(pool = %self.id, offset = payload, "root set");
        Ok(())
    }

    /// Forget the root object
    pub fn clear_root(&self) {
        let _heap = self.heap.lock();
        self.write_root(0, 0);
    }

    /// The root object, if one of type `T` is set
    pub fn root<T>(&self) -> Option<NonNull<T>> {
        let _heap = self.heap.lock();
        let header = self.header();
        if header.root_offset == 0 || header.root_tag != TypeTag::of::<T>().as_u64() {
            return None;
        }
        NonNull::new(self.map.ptr_at(header.root_offset as usize) as *mut T)
    }

    fn write_root(&self, offset: u64, tag: u64) {
        // SAFETY: both fields live inside the header at offset 0
        unsafe {
            self.map.write(offset_of!(PoolHeader, root_tag), tag);
            self.map.write(offset_of!(PoolHeader, root_offset), offset);
        }
        self.map.persist(offset_of!(PoolHeader, root_offset), 2 * size_of::<u64>());
    }

    fn header(&self) -> PoolHeader {
        // SAFETY: the header occupies the start of every pool
        unsafe { self.map.read(0) }
    }

    fn payload_offset(&self, ptr: NonNull<u8>) -> Option<usize> {
        self.map
            .offset_of(ptr.as_ptr() as usize)
            .filter(|off| *off >= HEAP_START && off % BLOCK_ALIGN == 0)
    }

    fn carve(&self, request: &AllocRequest, state: BlockState) -> Result<(NonNull<u8>, usize)> {
        if !request.align.is_power_of_two() || request.align > BLOCK_ALIGN {
            return Err(Error::Alloc(format!(
                "alignment {} not supported (max {BLOCK_ALIGN})",
                request.align
            )));
        }
        let size = block_size_for(request.size).ok_or_else(|| {
            Error::OutOfMemory(format!("request of {} bytes overflows", request.size))
        })?;

        let carved = {
            let mut heap = self.heap.lock();
            let carved = heap.carve(&self.map, size, request.type_tag.as_u64(), state)?;
            if carved.grew {
                let end = heap.end() as u64;
                // SAFETY: heap_end is a header field
                unsafe { self.map.write(offset_of!(PoolHeader, heap_end), end) };
                self.map.persist(offset_of!(PoolHeader, heap_end), size_of::<u64>());
            }
            carved
        };

        if request.flags.contains(AllocFlags::ZERO) {
            // SAFETY: the payload belongs to the block just carved
            unsafe { std::ptr::write_bytes(self.map.ptr_at(carved.payload), 0, carved.size) };
            if !request.flags.contains(AllocFlags::NO_FLUSH) {
                self.map.persist(carved.payload, carved.size);
            }
        }

        let ptr = NonNull::new(self.map.ptr_at(carved.payload))
            .ok_or_else(|| Error::Alloc("mapping at null address".to_string()))?;
        Ok((ptr, carved.size))
    }
}

impl PoolService for Pool {
    fn id(&self) -> PoolId {
        self.id
    }

    fn base(&self) -> usize {
        self.map.base()
    }

    fn len(&self) -> usize {
        self.map.len()
    }

    fn run_id(&self) -> u64 {
        self.run_id
    }

    fn alloc(&self, request: AllocRequest) -> Result<NonNull<u8>> {
        let (ptr, size) = self.carve(&request, BlockState::Allocated)?;
        debug!(pool = %self.id, size, tag = %request.type_tag, "alloc");
        Ok(ptr)
    }

    fn reserve(&self, request: AllocRequest) -> Result<NonNull<u8>> {
        let (ptr, size) = self.carve(&request, BlockState::Reserved)?;
        debug!(pool = %self.id, size, tag = %request.type_tag, "reserve");
        Ok(ptr)
    }

    fn publish(&self, ptr: NonNull<u8>) -> bool {
        let published = match self.payload_offset(ptr) {
            Some(payload) => self.heap.lock().publish(&self.map, payload),
            None => false,
        };
        if !published {
            warn!(pool = %self.id, ptr = ?ptr, "publish of a pointer that is not a reserved block");
        }
        published
    }

    fn alloc_atomic(
        &self,
        request: AllocRequest,
        ctor: &mut AtomicCtor<'_>,
    ) -> Result<NonNull<u8>> {
        let (ptr, _) = self.carve(&request, BlockState::Reserved)?;
        let payload = ptr.as_ptr() as usize - self.map.base();

        if let Err(e) = ctor(ptr) {
            self.heap.lock().free(&self.map, payload);
            debug!(pool = %self.id, error = %e, "atomic constructor failed, block released");
            return Err(e);
        }

        self.map.persist(payload, request.size);
        self.heap.lock().publish(&self.map, payload);
        Ok(ptr)
    }

    fn free(&self, ptr: NonNull<u8>) {
        let released = match self.payload_offset(ptr) {
            Some(payload) => self.heap.lock().free(&self.map, payload),
            None => false,
        };
        if !released {
            warn!(pool = %self.id, ptr = ?ptr, "free of a pointer that is not a live block");
        }
    }

    fn usable_size(&self, ptr: NonNull<u8>) -> Option<usize> {
        let payload = self.payload_offset(ptr)?;
        self.heap
            .lock()
            .block(payload)
            .filter(|b| b.state != BlockState::Free)
            .map(|b| b.size)
    }

    fn type_tag(&self, ptr: NonNull<u8>) -> Option<TypeTag> {
        let payload = self.payload_offset(ptr)?;
        self.heap
            .lock()
            .block(payload)
            .filter(|b| b.state != BlockState::Free)
            .map(|b| TypeTag::from_raw(b.type_tag))
    }

    fn persist(&self, addr: *const u8, len: usize) {
        match self.map.offset_of(addr as usize) {
            Some(offset) => self.map.persist(offset, len.min(self.map.len() - offset)),
            None => warn!(pool = %self.id, addr = ?addr, "persist of an address outside the pool"),
        }
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        registry::unregister(self.id, self.map.base());
        if let Err(e) = self.map.flush() {
            warn!(pool = %self.id, error = %e, "final flush failed");
        }
        info!(pool = %self.id, "pool closed");
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("id", &self.id)
            .field("run_id", &self.run_id)
            .field("base", &format_args!("{:#x}", self.map.base()))
            .field("len", &self.map.len())
            .field("path", &self.path)
            .finish()
    }
}
