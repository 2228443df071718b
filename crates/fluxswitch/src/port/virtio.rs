use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use fluxswitch_core::mem::RegionList;
use fluxswitch_core::sys::EventFd;
use fluxswitch_core::virtq::{SplitQueue, VirtqLayout};
use fluxswitch_proto::virtio_net::{
    feature, features_to_string, VirtioNetHdr, VIRTIO_CONFIG_S_DRIVER_OK, VIRTIO_NET_F_MRG_RXBUF,
    VIRTIO_NET_HDR_MRG_LEN,
};
use tracing::{debug, trace};

use crate::error::{PortBroken, SwitchError};
use crate::packet::{Completion, Packet};
use crate::port::Port;

pub const RX_QUEUE: usize = 0;
pub const TX_QUEUE: usize = 1;

/// Features the backend offers. Checksum and segmentation offload are not
/// negotiated, so headers on the receive path are always neutral.
pub const OFFERED_FEATURES: u32 = feature(VIRTIO_NET_F_MRG_RXBUF);

struct Queues {
    rx: SplitQueue,
    tx: SplitQueue,
    /// Receive chains gathered for the packet being delivered.
    scratch: Packet,
    staged: Vec<(u16, u32)>,
}

// The raw pointers in here point into guest memory held alive by the
// port's `RegionList`.
unsafe impl Send for Queues {}

/// Device side of a virtio-net device whose rings and buffers live in a
/// guest's memory.
pub struct VirtioPort {
    name: String,
    mem: RegionList,
    wakeup: Arc<EventFd>,
    features: u32,
    header_len: usize,
    status: AtomicU8,
    queues: Mutex<Queues>,
    calls: [OnceLock<EventFd>; 2],
}

impl VirtioPort {
    /// Set up both queues from the layouts the driver programmed.
    /// `guest_features` is masked with [`OFFERED_FEATURES`].
    pub fn new(
        name: impl Into<String>,
        mem: RegionList,
        rx: VirtqLayout,
        tx: VirtqLayout,
        guest_features: u32,
        wakeup: Arc<EventFd>,
    ) -> Result<Self, SwitchError> {
        let name = name.into();
        let setup = |which: &str, layout| {
            SplitQueue::new(&mem, layout).map_err(|e| SwitchError::PortSetup(format!("{which} queue: {e}")))
        };
        let rx = setup("receive", rx)?;
        let tx = setup("transmit", tx)?;

        let features = guest_features & OFFERED_FEATURES;
        let header_len = VirtioNetHdr::len_for(features & feature(VIRTIO_NET_F_MRG_RXBUF) != 0);
        debug!(
            port = %name,
            features = %features_to_string(features),
            ignored = %features_to_string(guest_features & !OFFERED_FEATURES),
            "virtio port created"
        );

        Ok(Self {
            name,
            mem,
            wakeup,
            features,
            header_len,
            status: AtomicU8::new(0),
            queues: Mutex::new(Queues { rx, tx, scratch: Packet::new(), staged: Vec::new() }),
            calls: [OnceLock::new(), OnceLock::new()],
        })
    }

    pub fn features(&self) -> u32 {
        self.features
    }

    pub fn merged_rx_buffers(&self) -> bool {
        self.features & feature(VIRTIO_NET_F_MRG_RXBUF) != 0
    }

    pub fn header_len(&self) -> usize {
        self.header_len
    }

    pub fn status(&self) -> u8 {
        self.status.load(Ordering::Acquire)
    }

    pub fn set_status(&self, status: u8) {
        self.status.store(status, Ordering::Release);
        // DRIVER_OK may have made queued work visible.
        if status & VIRTIO_CONFIG_S_DRIVER_OK != 0 {
            self.schedule();
        }
    }

    fn driver_ok(&self) -> bool {
        self.status() & VIRTIO_CONFIG_S_DRIVER_OK != 0
    }

    /// Interrupt eventfd signalled when `queue` has new used entries.
    pub fn set_call(&self, queue: usize, call: EventFd) -> Result<(), SwitchError> {
        self.calls
            .get(queue)
            .ok_or_else(|| SwitchError::PortSetup(format!("no queue {queue}")))?
            .set(call)
            .map_err(|_| SwitchError::PortSetup(format!("call eventfd for queue {queue} already set")))
    }

    /// Guest notification on `queue`. The next poll turns further kicks off
    /// again until the loop runs out of work.
    pub fn kick(&self, queue: usize) {
        trace!(port = %self.name, queue, "kick");
        self.schedule();
    }

    fn schedule(&self) {
        if let Err(e) = self.wakeup.notify() {
            debug!(port = %self.name, error = %e, "wakeup failed");
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Queues>, PortBroken> {
        self.queues.lock().map_err(|_| PortBroken::new("port state poisoned"))
    }

    fn signal(&self, queue: usize) -> Result<(), PortBroken> {
        if let Some(call) = self.calls[queue].get() {
            call.notify()?;
        }
        Ok(())
    }
}

/// Write `header` and then `frame` into `dst`'s buffers, in order.
/// Returns `(header bytes, frame bytes)` written.
fn write_chain(dst: &mut Packet, header: &[u8], frame: &Packet) -> (usize, usize) {
    let mut header_written = 0;
    let mut frame_written = 0;
    for buf in dst.fragments_mut() {
        let mut at = 0;
        if header_written < header.len() {
            let n = (header.len() - header_written).min(buf.len());
            buf[..n].copy_from_slice(&header[header_written..header_written + n]);
            header_written += n;
            at = n;
        }
        if at < buf.len() {
            let n = frame.copy_range(frame_written, &mut buf[at..]);
            frame_written += n;
            if n < buf.len() - at {
                break;
            }
        }
    }
    (header_written, frame_written)
}

impl Port for VirtioPort {
    fn name(&self) -> &str {
        &self.name
    }

    fn poll(&self, packet: &mut Packet, enable_notifications: bool) -> Result<bool, PortBroken> {
        let mut queues = self.lock()?;
        queues.tx.set_notification(enable_notifications);
        if !self.driver_ok() {
            return Ok(false);
        }

        let header_len = self.header_len;
        let mut header_seen = None;
        let head = queues.tx.pop(&self.mem, false, |ptr, len| {
            if header_seen.is_none() {
                header_seen = Some(len);
                return Ok(());
            }
            unsafe { packet.push_fragment(ptr, len) }
        })?;
        let Some(head) = head else {
            return Ok(false);
        };
        if header_seen != Some(header_len as u32) {
            return Err(PortBroken::new(format!(
                "transmit header fragment of {} bytes, expected {header_len}",
                header_seen.unwrap_or_default()
            )));
        }

        packet.set_completion(Completion::Virtio { head });
        Ok(true)
    }

    fn receive(&self, packet: &Packet) -> Result<(), PortBroken> {
        if !self.driver_ok() {
            return Ok(());
        }
        let mut guard = self.lock()?;
        let Queues { rx, scratch, staged, .. } = &mut *guard;

        let header_len = self.header_len;
        let needed = header_len + packet.len();
        let max_chains = if self.merged_rx_buffers() { usize::from(rx.num()) } else { 1 };

        scratch.clear();
        staged.clear();
        let mut capacity = 0usize;
        while capacity < needed && staged.len() < max_chains {
            let mut chain_len = 0u32;
            let head = rx.pop(&self.mem, true, |ptr, len| {
                chain_len = chain_len.saturating_add(len);
                unsafe { scratch.push_fragment(ptr, len) }
            })?;
            let Some(head) = head else {
                break;
            };
            if staged.is_empty() && (chain_len as usize) < header_len {
                return Err(PortBroken::new("receive buffer smaller than the virtio-net header"));
            }
            staged.push((head, chain_len));
            capacity += chain_len as usize;
        }

        let short = capacity < needed && staged.len() < max_chains;
        if staged.is_empty() || (short && self.merged_rx_buffers()) {
            // Out of buffers. Hand back what we took and drop the packet.
            rx.discard(staged.len() as u16);
            trace!(port = %self.name, len = packet.len(), "receive queue empty, packet dropped");
            return Ok(());
        }

        let header = VirtioNetHdr { num_buffers: staged.len() as u16, ..VirtioNetHdr::default() };
        let mut header_bytes = [0u8; VIRTIO_NET_HDR_MRG_LEN];
        let header_bytes = &mut header_bytes[..header_len];
        header.encode(header_bytes);

        let (_, copied) = write_chain(scratch, header_bytes, packet);
        if copied < packet.len() {
            trace!(port = %self.name, len = packet.len(), copied, "packet cropped");
        }

        let mut remaining = header_len + copied;
        for (offset, &(head, chain_len)) in staged.iter().enumerate() {
            let used = remaining.min(chain_len as usize);
            rx.fill(offset as u16, head, used as u32);
            remaining -= used;
        }
        rx.flush(staged.len() as u16);
        Ok(())
    }

    fn mark_done(&self, packet: &Packet) -> Result<(), PortBroken> {
        let Completion::Virtio { head } = packet.completion() else {
            return Err(PortBroken::new("completion from another port kind"));
        };
        self.lock()?.tx.push(head, 0);
        Ok(())
    }

    fn poll_irq(&self) -> Result<(), PortBroken> {
        let (rx_irq, tx_irq) = {
            let mut queues = self.lock()?;
            (queues.rx.take_pending_irq(), queues.tx.take_pending_irq())
        };
        if rx_irq {
            self.signal(RX_QUEUE)?;
        }
        if tx_irq {
            self.signal(TX_QUEUE)?;
        }
        Ok(())
    }
}
