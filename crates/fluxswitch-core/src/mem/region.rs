use std::fs::File;
use std::ptr::NonNull;
use std::sync::Arc;

use memmap2::{MmapMut, MmapOptions};

use super::GuestMemory;
use crate::error::MemoryError;

/// One contiguous piece of peer memory mapped into this process.
pub struct Region {
    guest_addr: u64,
    size: u64,
    base: NonNull<u8>,
    _mmap: MmapMut,
}

// The mapping is owned by the region and only reached through `base`.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    fn validate(guest_addr: u64, size: u64) -> Result<usize, MemoryError> {
        if size == 0 || guest_addr.checked_add(size).is_none() {
            return Err(MemoryError::InvalidRegion { addr: guest_addr, size });
        }
        usize::try_from(size).map_err(|_| MemoryError::InvalidRegion { addr: guest_addr, size })
    }

    fn from_mmap(guest_addr: u64, size: u64, mut mmap: MmapMut) -> Self {
        let base = NonNull::new(mmap.as_mut_ptr()).unwrap_or(NonNull::dangling());
        Self { guest_addr, size, base, _mmap: mmap }
    }

    /// Zero-filled private memory, used for switch-owned buffers and tests.
    pub fn anonymous(guest_addr: u64, size: u64) -> Result<Self, MemoryError> {
        let len = Self::validate(guest_addr, size)?;
        let mmap = MmapOptions::new().len(len).map_anon()?;
        Ok(Self::from_mmap(guest_addr, size, mmap))
    }

    /// Map `size` bytes of `file` starting at `offset` as a shared mapping.
    ///
    /// # Safety
    /// The peer owning `file` may write to the memory at any time; every
    /// access through this region must tolerate concurrent modification.
    pub unsafe fn from_file(
        file: &File,
        guest_addr: u64,
        size: u64,
        offset: u64,
    ) -> Result<Self, MemoryError> {
        let len = Self::validate(guest_addr, size)?;
        let mmap = MmapOptions::new().offset(offset).len(len).map_mut(file)?;
        Ok(Self::from_mmap(guest_addr, size, mmap))
    }

    pub fn guest_addr(&self) -> u64 {
        self.guest_addr
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// One past the last guest address covered.
    pub fn end(&self) -> u64 {
        self.guest_addr + self.size
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    fn translate(&self, addr: u64, len: u64) -> Option<NonNull<u8>> {
        let offset = addr.checked_sub(self.guest_addr)?;
        if offset >= self.size || offset.checked_add(len)? > self.size {
            return None;
        }
        NonNull::new(unsafe { self.base.as_ptr().add(offset as usize) })
    }
}

/// Sorted, non-overlapping set of regions. Cloning shares the mappings.
#[derive(Clone, Default)]
pub struct RegionList {
    regions: Vec<Arc<Region>>,
}

impl RegionList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, region: Region) -> Result<(), MemoryError> {
        let pos = self.regions.partition_point(|r| r.guest_addr < region.guest_addr);
        let overlaps_prev = pos > 0 && self.regions[pos - 1].end() > region.guest_addr;
        let overlaps_next = self
            .regions
            .get(pos)
            .is_some_and(|next| next.guest_addr < region.end());
        if overlaps_prev || overlaps_next {
            return Err(MemoryError::Overlap { addr: region.guest_addr, size: region.size });
        }
        self.regions.insert(pos, Arc::new(region));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Region> {
        self.regions.iter().map(|r| r.as_ref())
    }
}

impl GuestMemory for RegionList {
    fn translate(&self, addr: u64, len: u64) -> Option<NonNull<u8>> {
        let idx = self.regions.partition_point(|r| r.guest_addr <= addr);
        self.regions.get(idx.checked_sub(1)?)?.translate(addr, len)
    }
}

impl GuestMemory for Region {
    fn translate(&self, addr: u64, len: u64) -> Option<NonNull<u8>> {
        Region::translate(self, addr, len)
    }
}
