use std::collections::VecDeque;
use std::mem;
use std::ptr::NonNull;
use std::slice;
use std::sync::atomic::{fence, AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use fluxswitch_core::mem::{GuestMemory, RegionList};
use fluxswitch_core::ring::{
    ClientDesc, QueuePair, DESC_RX_DONE, DESC_TX_CONTINUE, DESC_TX_DONE, DESC_TX_FINAL, MAX_JOB_LEN,
};
use fluxswitch_core::sys::EventFd;
use fluxswitch_core::RingError;
use tracing::{debug, trace};

use crate::error::{PortBroken, SwitchError};
use crate::packet::{Completion, Packet};
use crate::port::Port;

/// A native client sharing a [`QueuePair`] in its own memory.
pub struct QueuePairPort {
    name: String,
    regions: RegionList,
    qp: NonNull<QueuePair>,
    /// The session's event fd, written when the client sleeps on it.
    client_events: Arc<OnceLock<EventFd>>,
    /// Written by the client when it finds `switch_blocked` set.
    wakeup: Arc<EventFd>,
    /// `TX_DONE` descriptors waiting for room in `done`.
    deferred: Mutex<VecDeque<ClientDesc>>,
    client_pending: AtomicBool,
}

// `qp` points into a mapping kept alive by `regions`. The queues are
// only accessed through atomics.
unsafe impl Send for QueuePairPort {}
unsafe impl Sync for QueuePairPort {}

impl QueuePairPort {
    /// Locate the queue pair at client address `qp_addr`. `regions` is a
    /// snapshot of the session's memory; later mappings are not visible to
    /// this port.
    pub fn new(
        name: impl Into<String>,
        regions: RegionList,
        qp_addr: u64,
        client_events: Arc<OnceLock<EventFd>>,
        wakeup: Arc<EventFd>,
    ) -> Result<Self, SwitchError> {
        let name = name.into();
        let ptr = regions
            .translate(qp_addr, mem::size_of::<QueuePair>() as u64)
            .ok_or_else(|| SwitchError::PortSetup(format!("queue pair at {qp_addr:#x} is not mapped")))?;
        if ptr.as_ptr() as usize % mem::align_of::<QueuePair>() != 0 {
            return Err(SwitchError::PortSetup(format!("queue pair at {qp_addr:#x} is misaligned")));
        }
        debug!(port = %name, qp = qp_addr, "queue pair port created");
        Ok(Self {
            name,
            regions,
            qp: ptr.cast(),
            client_events,
            wakeup,
            deferred: Mutex::new(VecDeque::new()),
            client_pending: AtomicBool::new(false),
        })
    }

    fn qp(&self) -> &QueuePair {
        unsafe { self.qp.as_ref() }
    }

    /// The fd handed to the client for waking the switch.
    pub fn wakeup(&self) -> &Arc<EventFd> {
        &self.wakeup
    }

    fn lock_deferred(&self) -> Result<MutexGuard<'_, VecDeque<ClientDesc>>, PortBroken> {
        self.deferred.lock().map_err(|_| PortBroken::new("port state poisoned"))
    }

    /// Move deferred completions to `done` while there is room.
    fn flush_deferred(&self, deferred: &mut VecDeque<ClientDesc>) {
        while let Some(desc) = deferred.front() {
            if !self.qp().done.enqueue(*desc) {
                break;
            }
            deferred.pop_front();
            self.client_pending.store(true, Ordering::Relaxed);
        }
    }

    fn translate(&self, desc: &ClientDesc) -> Result<NonNull<u8>, RingError> {
        self.regions
            .translate(desc.buf_ptr, u64::from(desc.len))
            .ok_or(RingError::BadAddress { addr: desc.buf_ptr, len: u64::from(desc.len) })
    }

    /// Wake the client if it went to sleep waiting for `done`.
    fn notify_client(&self) -> Result<(), PortBroken> {
        if let Some(events) = self.client_events.get() {
            if self.qp().take_client_blocked() {
                events.notify()?;
            }
        }
        Ok(())
    }
}

impl Port for QueuePairPort {
    fn name(&self) -> &str {
        &self.name
    }

    fn poll(&self, packet: &mut Packet, enable_notifications: bool) -> Result<bool, PortBroken> {
        // Armed before looking at either queue: a client that drains `done`
        // or adds to `tx` after this point sees the flag and writes the
        // wakeup fd.
        let qp = self.qp();
        if enable_notifications {
            qp.switch_blocked.store(1, Ordering::SeqCst);
            fence(Ordering::SeqCst);
        }

        {
            let mut deferred = self.lock_deferred()?;
            self.flush_deferred(&mut deferred);
            if !deferred.is_empty() {
                // No new packets until the client drains `done`.
                return Ok(false);
            }
        }

        let mut count = 0;
        let mut head = None;
        loop {
            if count == MAX_JOB_LEN {
                return Err(PortBroken::new(format!(
                    "transmit program longer than {MAX_JOB_LEN} descriptors"
                )));
            }
            let Some(desc) = qp.tx.peek(count) else {
                // Nothing, or a program the client is still writing.
                packet.clear();
                return Ok(false);
            };
            count += 1;
            if desc.kind != DESC_TX_CONTINUE && desc.kind != DESC_TX_FINAL {
                return Err(PortBroken::new(format!("descriptor kind {} on transmit queue", desc.kind)));
            }
            let ptr = self.translate(&desc)?;
            unsafe { packet.push_fragment(ptr, desc.len)? };
            head.get_or_insert(desc.buf_ptr);
            if desc.kind == DESC_TX_FINAL {
                break;
            }
        }
        qp.tx.release(count);

        let buf_ptr = head.unwrap_or_default();
        packet.set_completion(Completion::QueuePair { buf_ptr, len: packet.len() as u32 });
        Ok(true)
    }

    fn receive(&self, packet: &Packet) -> Result<(), PortBroken> {
        let qp = self.qp();
        if qp.done.room() == 0 || !self.lock_deferred()?.is_empty() {
            trace!(port = %self.name, "done queue full, packet dropped");
            return Ok(());
        }
        let Some(desc) = qp.rx.dequeue() else {
            trace!(port = %self.name, "no receive buffer, packet dropped");
            return Ok(());
        };

        let dst = self.translate(&desc)?;
        let buf = unsafe { slice::from_raw_parts_mut(dst.as_ptr(), desc.len as usize) };
        let copied = packet.copy_to(buf);
        if !qp.done.enqueue(ClientDesc::new(desc.buf_ptr, copied as u32, DESC_RX_DONE)) {
            return Err(PortBroken::new("done queue overrun"));
        }
        self.client_pending.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn mark_done(&self, packet: &Packet) -> Result<(), PortBroken> {
        let Completion::QueuePair { buf_ptr, len } = packet.completion() else {
            return Err(PortBroken::new("completion from another port kind"));
        };
        let desc = ClientDesc::new(buf_ptr, len, DESC_TX_DONE);
        let mut deferred = self.lock_deferred()?;
        if deferred.is_empty() && self.qp().done.enqueue(desc) {
            self.client_pending.store(true, Ordering::Relaxed);
        } else {
            deferred.push_back(desc);
        }
        Ok(())
    }

    fn poll_irq(&self) -> Result<(), PortBroken> {
        if self.client_pending.swap(false, Ordering::Relaxed) {
            self.notify_client()?;
        }
        Ok(())
    }
}
