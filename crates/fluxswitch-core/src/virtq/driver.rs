//! Driver (guest) side of a split queue, for exercising the device side
//! without a virtual machine.

use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};

use super::layout::*;
use crate::mem::GuestMemory;

pub struct GuestDriver {
    num: u16,
    desc: NonNull<VringDesc>,
    avail: NonNull<u8>,
    used: NonNull<u8>,
    avail_idx: u16,
    last_used: u16,
}

unsafe impl Send for GuestDriver {}

impl GuestDriver {
    pub fn new<M: GuestMemory + ?Sized>(mem: &M, layout: VirtqLayout) -> Option<Self> {
        let num = layout.num;
        Some(Self {
            num,
            desc: mem.translate(layout.desc, VirtqLayout::desc_size(num))?.cast(),
            avail: mem.translate(layout.avail, VirtqLayout::avail_size(num))?,
            used: mem.translate(layout.used, VirtqLayout::used_size(num))?,
            avail_idx: 0,
            last_used: 0,
        })
    }

    fn avail_u16(&self, slot: usize) -> &AtomicU16 {
        unsafe { &*(self.avail.as_ptr().add(2 * slot) as *const AtomicU16) }
    }

    fn used_u16(&self, slot: usize) -> &AtomicU16 {
        unsafe { &*(self.used.as_ptr().add(2 * slot) as *const AtomicU16) }
    }

    pub fn write_desc(&mut self, index: u16, desc: VringDesc) {
        assert!(index < self.num);
        unsafe { ptr::write_volatile(self.desc.as_ptr().add(index as usize), desc) };
    }

    /// Put `head` on the available ring and bump `avail.idx`.
    pub fn publish(&mut self, head: u16) {
        let slot = (self.avail_idx & (self.num - 1)) as usize;
        self.avail_u16(2 + slot).store(head, Ordering::Relaxed);
        self.avail_idx = self.avail_idx.wrapping_add(1);
        self.avail_u16(1).store(self.avail_idx, Ordering::Release);
    }

    /// Write an arbitrary `avail.idx`, bypassing the ring.
    pub fn set_avail_idx(&mut self, idx: u16) {
        self.avail_idx = idx;
        self.avail_u16(1).store(idx, Ordering::Release);
    }

    pub fn set_avail_flags(&mut self, flags: u16) {
        self.avail_u16(0).store(flags, Ordering::Release);
    }

    pub fn used_flags(&self) -> u16 {
        self.used_u16(0).load(Ordering::Acquire)
    }

    /// Write `bufs` as consecutive descriptors starting at `first` and
    /// publish the chain. Each entry is `(guest address, length, device-writable)`.
    pub fn add_chain(&mut self, first: u16, bufs: &[(u64, u32, bool)]) -> u16 {
        for (i, (addr, len, writable)) in bufs.iter().enumerate() {
            let index = first + i as u16;
            let mut flags = if *writable { VRING_DESC_F_WRITE } else { 0 };
            if i + 1 < bufs.len() {
                flags |= VRING_DESC_F_NEXT;
            }
            self.write_desc(index, VringDesc { addr: *addr, len: *len, flags, next: index + 1 });
        }
        self.publish(first);
        first
    }

    /// Next `(id, len)` completion, if the device published one.
    pub fn pop_used(&mut self) -> Option<(u32, u32)> {
        let used_idx = self.used_u16(1).load(Ordering::Acquire);
        if used_idx == self.last_used {
            return None;
        }
        let index = (self.last_used & (self.num - 1)) as usize;
        let elem = unsafe { self.used.as_ptr().add(4 + 8 * index) };
        let id = unsafe { (*(elem as *const AtomicU32)).load(Ordering::Relaxed) };
        let len = unsafe { (*(elem.add(4) as *const AtomicU32)).load(Ordering::Relaxed) };
        self.last_used = self.last_used.wrapping_add(1);
        Some((id, len))
    }
}
