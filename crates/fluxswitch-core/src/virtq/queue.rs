use std::ptr::{self, NonNull};
use std::sync::atomic::{fence, AtomicU16, AtomicU32, Ordering};

use super::layout::*;
use crate::error::RingError;
use crate::mem::GuestMemory;

/// Device side of one split virtqueue.
///
/// Every index read from guest memory is checked against `num` before it
/// selects a slot, and every buffer address goes through the guest memory
/// map. A guest can make the queue return errors but never make it touch
/// memory outside the rings and the translated buffers.
pub struct SplitQueue {
    num: u16,
    desc: NonNull<VringDesc>,
    avail: NonNull<u8>,
    used: NonNull<u8>,
    last_avail_idx: u16,
    used_idx: u16,
    pending_irq: bool,
}

// The ring pointers refer to guest memory that outlives the queue.
unsafe impl Send for SplitQueue {}

impl SplitQueue {
    pub fn new<M: GuestMemory + ?Sized>(mem: &M, layout: VirtqLayout) -> Result<Self, RingError> {
        let num = layout.num;
        if num == 0 || !num.is_power_of_two() || num > VIRTQUEUE_MAX_SIZE {
            return Err(RingError::InvalidSize(num as u32));
        }

        let map = |addr: u64, len: u64, align: usize| {
            let ptr = mem
                .translate(addr, len)
                .ok_or(RingError::BadAddress { addr, len })?;
            if ptr.as_ptr() as usize % align != 0 {
                return Err(RingError::Misaligned);
            }
            Ok(ptr)
        };

        let desc = map(layout.desc, VirtqLayout::desc_size(num), 16)?.cast();
        let avail = map(layout.avail, VirtqLayout::avail_size(num), 2)?;
        let used = map(layout.used, VirtqLayout::used_size(num), 4)?;

        Ok(Self {
            num,
            desc,
            avail,
            used,
            last_avail_idx: 0,
            used_idx: 0,
            pending_irq: false,
        })
    }

    pub fn num(&self) -> u16 {
        self.num
    }

    pub fn last_avail_idx(&self) -> u16 {
        self.last_avail_idx
    }

    #[inline]
    fn avail_u16(&self, slot: usize) -> &AtomicU16 {
        unsafe { &*(self.avail.as_ptr().add(2 * slot) as *const AtomicU16) }
    }

    #[inline]
    fn used_u16(&self, slot: usize) -> &AtomicU16 {
        unsafe { &*(self.used.as_ptr().add(2 * slot) as *const AtomicU16) }
    }

    #[inline]
    fn used_elem(&self, index: u16) -> (&AtomicU32, &AtomicU32) {
        let elem = unsafe { self.used.as_ptr().add(4 + 8 * index as usize) };
        unsafe { (&*(elem as *const AtomicU32), &*(elem.add(4) as *const AtomicU32)) }
    }

    #[inline]
    fn avail_flags(&self) -> u16 {
        self.avail_u16(0).load(Ordering::Relaxed)
    }

    #[inline]
    fn read_desc(&self, index: u16) -> VringDesc {
        debug_assert!(index < self.num);
        // A single copy: the guest may rewrite the slot while we look at it.
        unsafe { ptr::read_volatile(self.desc.as_ptr().add(index as usize)) }
    }

    /// Chains published by the guest and not yet popped.
    pub fn available(&self) -> Result<u16, RingError> {
        let avail_idx = self.avail_u16(1).load(Ordering::Acquire);
        let published = avail_idx.wrapping_sub(self.last_avail_idx);
        if published > self.num {
            return Err(RingError::TooManyHeads { published, size: self.num });
        }
        Ok(published)
    }

    /// Pop the next chain, feeding each translated buffer to `sink`.
    ///
    /// `writable` selects the direction the caller expects: device-writable
    /// buffers on a receive queue, device-readable ones on a transmit queue.
    /// Returns the chain head, to be handed back through [`SplitQueue::push`].
    pub fn pop<M, F>(&mut self, mem: &M, writable: bool, mut sink: F) -> Result<Option<u16>, RingError>
    where
        M: GuestMemory + ?Sized,
        F: FnMut(NonNull<u8>, u32) -> Result<(), RingError>,
    {
        if self.available()? == 0 {
            return Ok(None);
        }

        let slot = (self.last_avail_idx & (self.num - 1)) as usize;
        let head = self.avail_u16(2 + slot).load(Ordering::Acquire);
        if head >= self.num {
            return Err(RingError::IndexOutOfRange { index: head, size: self.num });
        }

        let mut index = head;
        let mut links = 0u16;
        loop {
            links += 1;
            if links > self.num {
                return Err(RingError::ChainTooLong);
            }

            let desc = self.read_desc(index);
            if desc.flags & VRING_DESC_F_INDIRECT != 0 {
                return Err(RingError::IndirectDescriptor);
            }
            if (desc.flags & VRING_DESC_F_WRITE != 0) != writable {
                return Err(RingError::DirectionMismatch);
            }

            let len = desc.len as u64;
            let ptr = mem
                .translate(desc.addr, len)
                .ok_or(RingError::BadAddress { addr: desc.addr, len })?;
            sink(ptr, desc.len)?;

            if desc.flags & VRING_DESC_F_NEXT == 0 {
                break;
            }
            if desc.next >= self.num {
                return Err(RingError::IndexOutOfRange { index: desc.next, size: self.num });
            }
            index = desc.next;
        }

        self.last_avail_idx = self.last_avail_idx.wrapping_add(1);
        Ok(Some(head))
    }

    /// Give back the last `count` popped chains that were not completed.
    pub fn discard(&mut self, count: u16) {
        self.last_avail_idx = self.last_avail_idx.wrapping_sub(count);
    }

    /// Stage a completion `offset` entries past the current used index.
    /// Nothing is visible to the guest until [`SplitQueue::flush`].
    pub fn fill(&mut self, offset: u16, head: u16, len: u32) {
        let index = self.used_idx.wrapping_add(offset) & (self.num - 1);
        let (id, written) = self.used_elem(index);
        id.store(head as u32, Ordering::Relaxed);
        written.store(len, Ordering::Relaxed);
    }

    /// Publish `count` staged completions.
    pub fn flush(&mut self, count: u16) {
        self.used_idx = self.used_idx.wrapping_add(count);
        self.used_u16(1).store(self.used_idx, Ordering::Release);

        // Order the index store against reading the guest's interrupt opt-out.
        fence(Ordering::SeqCst);
        if self.avail_flags() & VRING_AVAIL_F_NO_INTERRUPT == 0 {
            self.pending_irq = true;
        }
    }

    pub fn push(&mut self, head: u16, len: u32) {
        self.fill(0, head, len);
        self.flush(1);
    }

    /// Ask the guest to kick (`true`) or to stay quiet (`false`). Enabling is
    /// followed by a full fence so a subsequent [`SplitQueue::available`]
    /// cannot miss a buffer the guest published without kicking.
    pub fn set_notification(&mut self, enable: bool) {
        let flags = if enable { 0 } else { VRING_USED_F_NO_NOTIFY };
        self.used_u16(0).store(flags, Ordering::Relaxed);
        if enable {
            fence(Ordering::SeqCst);
        }
    }

    pub fn take_pending_irq(&mut self) -> bool {
        std::mem::take(&mut self.pending_irq)
    }
}
