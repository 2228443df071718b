pub mod eventfd;
pub mod socket;
pub mod tap;

pub use eventfd::EventFd;
