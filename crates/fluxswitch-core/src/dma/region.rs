use std::io;
use std::ptr::NonNull;

use memmap2::{MmapMut, MmapOptions};

use super::layout::BufferLayout;

/// Anonymous mapping carved into equally sized frames.
///
/// Devices are given frame addresses as plain process addresses, the same
/// identity mapping used when registering the region for DMA.
pub struct BufferRegion {
    base: NonNull<u8>,
    layout: BufferLayout,
    _mmap: MmapMut,
}

unsafe impl Send for BufferRegion {}
unsafe impl Sync for BufferRegion {}

impl BufferRegion {
    pub fn new(layout: BufferLayout) -> io::Result<Self> {
        let mut mmap = MmapOptions::new().len(layout.size()).map_anon()?;
        let base = NonNull::new(mmap.as_mut_ptr())
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "mmap returned null"))?;
        Ok(Self { base, layout, _mmap: mmap })
    }

    pub fn layout(&self) -> BufferLayout {
        self.layout
    }

    pub fn frame_size(&self) -> usize {
        self.layout.frame_size as usize
    }

    pub fn frame_count(&self) -> u32 {
        self.layout.frame_count
    }

    /// Start of frame `idx`, or `None` if out of range.
    pub fn frame_ptr(&self, idx: u32) -> Option<NonNull<u8>> {
        let offset = self.layout.idx_to_offset(idx)?;
        NonNull::new(unsafe { self.base.as_ptr().add(offset as usize) })
    }

    /// Device-visible address of frame `idx`.
    pub fn frame_addr(&self, idx: u32) -> Option<u64> {
        self.frame_ptr(idx).map(|p| p.as_ptr() as u64)
    }

    /// Frame index owning a device-visible address.
    pub fn addr_to_idx(&self, addr: u64) -> Option<u32> {
        let offset = addr.checked_sub(self.base.as_ptr() as u64)?;
        self.layout.offset_to_idx(offset)
    }
}
