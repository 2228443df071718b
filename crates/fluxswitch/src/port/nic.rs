//! A DMA network controller driven from userspace.
//!
//! The port owns one receive and one transmit descriptor ring plus the
//! buffer frames behind them. Receive slot `i` always carries frame `i`:
//! since packets are completed in the order they were polled, the slot
//! being re-posted at the tail is always one whose packet is done.

use std::io;
use std::ptr::NonNull;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard};

use fluxswitch_core::dma::{BufferLayout, BufferRegion};
use fluxswitch_core::nic::{rx_len, tx_command, NicRings, STATUS_DD, STATUS_EOP};
use fluxswitch_core::sys::EventFd;
use tracing::{debug, trace};

use crate::error::{PortBroken, SwitchError};
use crate::packet::{Completion, Packet};
use crate::port::Port;

/// Register access to the controller. Implementations map BARs or talk to
/// a simulator; the port only moves ring indices through it.
pub trait NicDevice: Send + Sync {
    /// Program the ring base addresses. The device writes `wakeup` when a
    /// receive interrupt fires while unmasked.
    fn attach_rings(&self, rings: Arc<NicRings>, wakeup: Arc<EventFd>) -> io::Result<()>;

    fn set_rx_tail(&self, tail: u16);

    fn set_tx_tail(&self, tail: u16);

    /// Unmask the queue interrupt. The device masks it again when it fires.
    fn unmask_rxtx_irq(&self);
}

struct Indices {
    /// Next receive slot to inspect.
    rx_head: u16,
    /// First receive slot not owned by the device.
    rx_tail: u16,
    tx_tail: u16,
    /// Transmit tail moved since the last doorbell.
    tx_dirty: bool,
}

pub struct NicPort<D: NicDevice> {
    name: String,
    device: Arc<D>,
    rings: Arc<NicRings>,
    rx_bufs: BufferRegion,
    tx_bufs: BufferRegion,
    indices: Mutex<Indices>,
}

impl<D: NicDevice> NicPort<D> {
    /// Allocate rings of `rx_len` and `tx_len` slots with `frame_size`
    /// byte buffers, fill the receive ring and hand it to the device.
    pub fn new(
        name: impl Into<String>,
        device: Arc<D>,
        rx_len: u16,
        tx_len: u16,
        frame_size: u32,
        wakeup: Arc<EventFd>,
    ) -> Result<Self, SwitchError> {
        let name = name.into();
        let rings = NicRings::new(rx_len, tx_len).ok_or_else(|| {
            SwitchError::InvalidConfiguration(format!("ring sizes must be powers of two, got {rx_len}/{tx_len}"))
        })?;
        let layout = |count: u16| {
            BufferLayout::new(frame_size, u32::from(count)).ok_or_else(|| {
                SwitchError::InvalidConfiguration(format!("invalid frame size {frame_size}"))
            })
        };
        let rx_bufs = BufferRegion::new(layout(rx_len)?)?;
        let tx_bufs = BufferRegion::new(layout(tx_len)?)?;

        // One slot stays unposted so that head == tail means empty.
        let posted = rx_len - 1;
        for slot in 0..posted {
            let addr = frame_addr(&rx_bufs, slot).map_err(|e| SwitchError::PortSetup(e.reason().to_string()))?;
            rings.rx.get(slot).post(addr, 0);
        }

        let rings = Arc::new(rings);
        device.attach_rings(rings.clone(), wakeup)?;
        device.set_rx_tail(posted);
        debug!(port = %name, rx_len, tx_len, frame_size, "nic port ready");

        Ok(Self {
            name,
            device,
            rings,
            rx_bufs,
            tx_bufs,
            indices: Mutex::new(Indices { rx_head: 0, rx_tail: posted, tx_tail: 0, tx_dirty: false }),
        })
    }

    pub fn device(&self) -> &Arc<D> {
        &self.device
    }

    fn lock(&self) -> Result<MutexGuard<'_, Indices>, PortBroken> {
        self.indices.lock().map_err(|_| PortBroken::new("port state poisoned"))
    }

    /// Transmit slots the device has not yet consumed.
    fn tx_in_flight(&self, tail: u16) -> u16 {
        let head = self.rings.tx.wrap(self.rings.tx_head.load(Ordering::Acquire) as u16);
        self.rings.tx.wrap(tail.wrapping_sub(head))
    }
}

fn frame_addr(region: &BufferRegion, slot: u16) -> Result<u64, PortBroken> {
    region
        .frame_addr(u32::from(slot))
        .ok_or_else(|| PortBroken::new(format!("no buffer for slot {slot}")))
}

fn frame_ptr(region: &BufferRegion, slot: u16) -> Result<NonNull<u8>, PortBroken> {
    region
        .frame_ptr(u32::from(slot))
        .ok_or_else(|| PortBroken::new(format!("no buffer for slot {slot}")))
}

impl<D: NicDevice> Port for NicPort<D> {
    fn name(&self) -> &str {
        &self.name
    }

    fn poll(&self, packet: &mut Packet, enable_notifications: bool) -> Result<bool, PortBroken> {
        if enable_notifications {
            self.device.unmask_rxtx_irq();
        }
        let mut indices = self.lock()?;
        let ring = &self.rings.rx;

        let first = indices.rx_head;
        let mut slot = first;
        let mut slots = 0u16;
        loop {
            if slot == indices.rx_tail {
                return Ok(false);
            }
            let status = ring.get(slot).status();
            if status & STATUS_DD == 0 {
                // Nothing written back yet, or the rest of a frame is still
                // in flight. Either way it is picked up on a later poll.
                return Ok(false);
            }
            slots += 1;
            if status & STATUS_EOP != 0 {
                break;
            }
            slot = ring.wrap(slot.wrapping_add(1));
        }

        for k in 0..slots {
            let slot = ring.wrap(first.wrapping_add(k));
            let len = rx_len(ring.get(slot).status());
            if usize::from(len) > self.rx_bufs.frame_size() {
                return Err(PortBroken::new(format!("device reported {len} bytes in slot {slot}")));
            }
            let ptr = frame_ptr(&self.rx_bufs, slot)?;
            unsafe { packet.push_fragment(ptr, u32::from(len))? };
        }
        indices.rx_head = ring.wrap(slot.wrapping_add(1));
        packet.set_completion(Completion::Nic { first_slot: first, slots });
        Ok(true)
    }

    fn receive(&self, packet: &Packet) -> Result<(), PortBroken> {
        let mut indices = self.lock()?;
        let ring = &self.rings.tx;
        if self.tx_in_flight(indices.tx_tail) >= ring.len() - 1 {
            trace!(port = %self.name, "transmit ring full, packet dropped");
            return Ok(());
        }

        let slot = indices.tx_tail;
        let ptr = frame_ptr(&self.tx_bufs, slot)?;
        let room = self.tx_bufs.frame_size().min(usize::from(u16::MAX));
        let frame = unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), room) };
        let len = packet.copy_to(frame);
        if len < packet.len() {
            trace!(port = %self.name, len = packet.len(), "oversized frame cropped");
        }

        ring.get(slot).post(frame_addr(&self.tx_bufs, slot)?, tx_command(len as u16));
        indices.tx_tail = ring.wrap(slot.wrapping_add(1));
        indices.tx_dirty = true;
        Ok(())
    }

    fn mark_done(&self, packet: &Packet) -> Result<(), PortBroken> {
        let Completion::Nic { first_slot, slots } = packet.completion() else {
            return Err(PortBroken::new("completion from another port kind"));
        };
        let mut indices = self.lock()?;
        let ring = &self.rings.rx;
        for k in 0..slots {
            if ring.wrap(first_slot.wrapping_add(k)) == indices.rx_head {
                return Err(PortBroken::new("completed more slots than were polled"));
            }
            let tail = indices.rx_tail;
            ring.get(tail).post(frame_addr(&self.rx_bufs, tail)?, 0);
            indices.rx_tail = ring.wrap(tail.wrapping_add(1));
        }
        self.device.set_rx_tail(indices.rx_tail);
        Ok(())
    }

    fn poll_irq(&self) -> Result<(), PortBroken> {
        let mut indices = self.lock()?;
        if indices.tx_dirty {
            indices.tx_dirty = false;
            self.device.set_tx_tail(indices.tx_tail);
        }
        Ok(())
    }
}
