use std::sync::atomic::{AtomicU8, Ordering};

use super::desc::ClientDesc;
use super::queue::Queue;

pub const CLIENT_QUEUE_LEN: usize = 4096;

/// Upper bound on descriptors making up one transmitted packet.
pub const MAX_JOB_LEN: usize = 16;

pub type ClientQueue = Queue<ClientDesc, CLIENT_QUEUE_LEN>;

/// Shared-memory block a native client hands to the switch.
///
/// * `tx`: client produces `TX_CONTINUE`/`TX_FINAL` programs, switch consumes.
/// * `rx`: client produces empty receive buffers, switch consumes.
/// * `done`: switch produces `RX_DONE`/`TX_DONE`, client consumes.
///
/// `client_blocked` is set by a client about to sleep on its event fd and
/// cleared by whoever wakes it. `switch_blocked` is the mirror image for
/// the switch's wakeup fd: after adding to `tx` or `rx`, or draining `done`,
/// a client that finds it set clears it and writes the wakeup fd.
#[repr(C)]
pub struct QueuePair {
    pub client_blocked: AtomicU8,
    pub switch_blocked: AtomicU8,
    _reserved: [u8; 62],
    pub tx: ClientQueue,
    pub rx: ClientQueue,
    pub done: ClientQueue,
}

impl QueuePair {
    /// Empty all three queues and clear both flags.
    pub fn reset(&self) {
        self.client_blocked.store(0, Ordering::Relaxed);
        self.switch_blocked.store(0, Ordering::Relaxed);
        self.tx.reset();
        self.rx.reset();
        self.done.reset();
    }

    /// Clear `client_blocked`, returning whether the client was asleep
    /// and needs its event fd written.
    #[inline]
    pub fn take_client_blocked(&self) -> bool {
        self.client_blocked.swap(0, Ordering::AcqRel) != 0
    }

    /// Clear `switch_blocked`, returning whether the switch wants a wakeup.
    #[inline]
    pub fn take_switch_blocked(&self) -> bool {
        self.switch_blocked.swap(0, Ordering::AcqRel) != 0
    }
}

const _: () = assert!(std::mem::align_of::<QueuePair>() == 8);
const _: () = assert!(std::mem::size_of::<ClientQueue>() == CLIENT_QUEUE_LEN * 16 + 8);
