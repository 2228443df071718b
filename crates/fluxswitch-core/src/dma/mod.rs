//! Switch-owned packet buffers handed to devices by address.

pub mod layout;
pub mod region;

pub use layout::BufferLayout;
pub use region::BufferRegion;
