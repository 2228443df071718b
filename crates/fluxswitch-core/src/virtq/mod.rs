//! Split virtqueue: descriptor table, available ring and used ring living
//! in guest memory.

pub mod layout;
pub mod queue;

#[cfg(any(test, feature = "simulator"))]
pub mod driver;

pub use layout::{
    VirtqLayout, VringDesc, VIRTQUEUE_MAX_SIZE, VRING_AVAIL_F_NO_INTERRUPT, VRING_DESC_F_INDIRECT,
    VRING_DESC_F_NEXT, VRING_DESC_F_WRITE, VRING_USED_F_NO_NOTIFY,
};
pub use queue::SplitQueue;
