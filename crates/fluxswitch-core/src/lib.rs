pub mod dma;
pub mod error;
pub mod mem;
pub mod nic;
pub mod ring;
pub mod sys;
pub mod virtq;

pub use error::{MemoryError, RingError};
