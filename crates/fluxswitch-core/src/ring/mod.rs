pub mod desc;
pub mod pair;
pub mod queue;

pub use desc::{ClientDesc, DESC_INVALID, DESC_RX_DONE, DESC_TX_CONTINUE, DESC_TX_DONE, DESC_TX_FINAL};
pub use pair::{ClientQueue, QueuePair, CLIENT_QUEUE_LEN, MAX_JOB_LEN};
pub use queue::Queue;
