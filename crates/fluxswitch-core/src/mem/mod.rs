pub mod region;

pub use region::{Region, RegionList};

use std::ptr::NonNull;

/// Maps peer-visible addresses (guest-physical or client-virtual) into
/// this process.
pub trait GuestMemory {
    /// Host pointer for `[addr, addr + len)`, or `None` unless the whole
    /// range lies inside a single mapped region.
    fn translate(&self, addr: u64, len: u64) -> Option<NonNull<u8>>;
}
