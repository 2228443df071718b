pub const VRING_DESC_F_NEXT: u16 = 1;
pub const VRING_DESC_F_WRITE: u16 = 2;
pub const VRING_DESC_F_INDIRECT: u16 = 4;

/// Set by the device in `used.flags`: the driver need not kick.
pub const VRING_USED_F_NO_NOTIFY: u16 = 1;
/// Set by the driver in `avail.flags`: the device need not interrupt.
pub const VRING_AVAIL_F_NO_INTERRUPT: u16 = 1;

/// Largest ring a device accepts.
pub const VIRTQUEUE_MAX_SIZE: u16 = 1024;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VringDesc {
    pub addr: u64,
    pub len: u32,
    pub flags: u16,
    pub next: u16,
}

const _: () = assert!(std::mem::size_of::<VringDesc>() == 16);

/// Guest addresses of the three parts of a split queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtqLayout {
    pub num: u16,
    pub desc: u64,
    pub avail: u64,
    pub used: u64,
}

impl VirtqLayout {
    pub fn desc_size(num: u16) -> u64 {
        16 * num as u64
    }

    /// flags, idx, ring[num], used_event
    pub fn avail_size(num: u16) -> u64 {
        6 + 2 * num as u64
    }

    /// flags, idx, ring[num] of (id, len), avail_event
    pub fn used_size(num: u16) -> u64 {
        6 + 8 * num as u64
    }

    /// Legacy contiguous layout: descriptors and available ring back to
    /// back, used ring on the next `align` boundary.
    pub fn legacy(base: u64, num: u16, align: u64) -> Self {
        let avail = base + Self::desc_size(num);
        let used = (avail + Self::avail_size(num) + align - 1) & !(align - 1);
        Self { num, desc: base, avail, used }
    }

    pub fn legacy_size(num: u16, align: u64) -> u64 {
        let layout = Self::legacy(0, num, align);
        layout.used + Self::used_size(num)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legacy_layout() {
        let layout = VirtqLayout::legacy(0x10000, 256, 4096);
        assert_eq!(layout.desc, 0x10000);
        assert_eq!(layout.avail, 0x11000);
        assert_eq!(layout.used, 0x12000);
        assert_eq!(VirtqLayout::legacy_size(256, 4096), 0x2000 + 6 + 8 * 256);
    }
}
