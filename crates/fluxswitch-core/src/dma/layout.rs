#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferLayout {
    pub frame_size: u32,
    pub frame_count: u32,
}

impl BufferLayout {
    /// `None` unless `frame_size` is a power of two of at least 2048 bytes
    /// and there is at least one frame.
    pub fn new(frame_size: u32, frame_count: u32) -> Option<Self> {
        if !frame_size.is_power_of_two() || frame_size < 2048 || frame_count == 0 {
            return None;
        }
        Some(Self { frame_size, frame_count })
    }

    pub fn size(&self) -> usize {
        (self.frame_size as usize) * (self.frame_count as usize)
    }

    #[inline]
    pub fn offset_to_idx(&self, offset: u64) -> Option<u32> {
        if offset >= (self.size() as u64) {
            return None;
        }
        Some((offset / self.frame_size as u64) as u32)
    }

    #[inline]
    pub fn idx_to_offset(&self, idx: u32) -> Option<u64> {
        if idx >= self.frame_count {
            return None;
        }
        Some((idx as u64) * (self.frame_size as u64))
    }
}
