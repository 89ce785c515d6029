//! Memory mapping backing a pool
//!
//! Wraps a `memmap2` mapping (anonymous or file) and exposes offset-based
//! reads, writes and persistence barriers. The base address is captured
//! once; the mapping is never remapped while the pool is open.

use memmap2::{MmapMut, MmapOptions};
use pmkit_core::Result;
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::atomic::{fence, Ordering};

pub(crate) struct Mapping {
    map: MmapMut,
    base: usize,
    len: usize,
    _file: Option<File>,
    flush_on_persist: bool,
}

impl Mapping {
    pub(crate) fn anonymous(len: usize) -> Result<Self> {
        let map = MmapOptions::new().len(len).map_anon()?;
        Ok(Self::from_map(map, None, false))
    }

    /// Create (or truncate) `path` to `len` bytes and map it
    pub(crate) fn create(path: &Path, len: usize, flush_on_persist: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(len as u64)?;

        // SAFETY: the file was just created by us; external truncation while
        // mapped is outside the supported usage
        let map = unsafe { MmapOptions::new().map_mut(&file)? };
        Ok(Self::from_map(map, Some(file), flush_on_persist))
    }

    /// Map an existing file at its current length
    pub(crate) fn open(path: &Path, flush_on_persist: bool) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;

        // SAFETY: see `create`
        let map = unsafe { MmapOptions::new().map_mut(&file)? };
        Ok(Self::from_map(map, Some(file), flush_on_persist))
    }

    fn from_map(mut map: MmapMut, file: Option<File>, flush_on_persist: bool) -> Self {
        let base = map.as_mut_ptr() as usize;
        let len = map.len();
        Mapping {
            map,
            base,
            len,
            _file: file,
            flush_on_persist,
        }
    }

    #[inline]
    pub(crate) fn base(&self) -> usize {
        self.base
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn is_file_backed(&self) -> bool {
        self._file.is_some()
    }

    /// Offset of `addr` inside the mapping
    #[inline]
    pub(crate) fn offset_of(&self, addr: usize) -> Option<usize> {
        addr.checked_sub(self.base).filter(|off| *off < self.len)
    }

    #[inline]
    pub(crate) fn ptr_at(&self, offset: usize) -> *mut u8 {
        debug_assert!(offset <= self.len);
        (self.base + offset) as *mut u8
    }

    /// # Safety
    ///
    /// `offset..offset + size_of::<T>()` must lie inside the mapping and be
    /// suitably aligned for `T`.
    #[inline]
    pub(crate) unsafe fn read<T: Copy>(&self, offset: usize) -> T {
        std::ptr::read(self.ptr_at(offset) as *const T)
    }

    /// # Safety
    ///
    /// Same contract as [`read`](Self::read); callers also serialize writes
    /// to the same bytes.
    #[inline]
    pub(crate) unsafe fn write<T: Copy>(&self, offset: usize, value: T) {
        std::ptr::write(self.ptr_at(offset) as *mut T, value)
    }

    /// Make `len` bytes at `offset` durable
    pub(crate) fn persist(&self, offset: usize, len: usize) {
        fence(Ordering::SeqCst);
        if self.flush_on_persist && self.is_file_backed() && len > 0 {
            if let Err(e) = self.map.flush_range(offset, len) {
                tracing::warn!(offset, len, error = %e, "flush_range failed");
            }
        }
    }

    /// Synchronously flush the whole mapping
    pub(crate) fn flush(&self) -> Result<()> {
        if self.is_file_backed() {
            self.map.flush()?;
        }
        Ok(())
    }
}
