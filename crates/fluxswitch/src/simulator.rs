//! Software stand-in for a DMA network controller.
//!
//! The simulated device reads and writes the same descriptor rings and
//! buffers a real controller would, so [`NicPort`](crate::port::NicPort)
//! runs unmodified against it.

use std::io;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard};

use fluxswitch_core::nic::{rx_status, NicRings, STATUS_DD, TX_LEN_MASK};
use fluxswitch_core::sys::EventFd;

use crate::port::NicDevice;

#[derive(Default)]
struct Wire {
    rings: Option<Arc<NicRings>>,
    wakeup: Option<Arc<EventFd>>,
    rx_next: u16,
    rx_tail: u16,
    tx_next: u16,
    tx_tail: u16,
    irq_unmasked: bool,
}

#[derive(Default)]
pub struct SimulatedNic {
    wire: Mutex<Wire>,
}

impl SimulatedNic {
    pub fn new() -> Self {
        Self::default()
    }

    fn wire(&self) -> MutexGuard<'_, Wire> {
        self.wire.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Last receive tail written by the driver.
    pub fn rx_tail(&self) -> u16 {
        self.wire().rx_tail
    }

    /// A frame arrives from the wire, split over descriptors of at most
    /// `chunk` bytes. Returns `false`, dropping it, when the driver has not
    /// posted enough buffers.
    pub fn inject(&self, frame: &[u8], chunk: usize) -> bool {
        let chunks: Vec<&[u8]> = if frame.is_empty() { vec![frame] } else { frame.chunks(chunk.max(1)).collect() };
        self.write_back(&chunks, true)
    }

    /// Write back one descriptor without end-of-packet, as a device does in
    /// the middle of a frame.
    pub fn inject_partial(&self, data: &[u8]) -> bool {
        self.write_back(&[data], false)
    }

    fn write_back(&self, chunks: &[&[u8]], eop: bool) -> bool {
        let mut wire = self.wire();
        let Some(rings) = wire.rings.clone() else {
            return false;
        };
        let ring = &rings.rx;
        let posted = ring.wrap(wire.rx_tail.wrapping_sub(wire.rx_next));
        if chunks.len() > usize::from(posted) {
            return false;
        }

        for (i, chunk) in chunks.iter().enumerate() {
            let desc = ring.get(wire.rx_next);
            let addr = desc.addr.load(Ordering::Relaxed);
            unsafe { std::ptr::copy_nonoverlapping(chunk.as_ptr(), addr as *mut u8, chunk.len()) };
            desc.status.store(rx_status(chunk.len() as u16, eop && i + 1 == chunks.len()), Ordering::Release);
            wire.rx_next = ring.wrap(wire.rx_next.wrapping_add(1));
        }

        if eop && wire.irq_unmasked {
            wire.irq_unmasked = false;
            if let Some(wakeup) = &wire.wakeup {
                let _ = wakeup.notify();
            }
        }
        true
    }

    /// Send everything the driver queued up to its last doorbell and return
    /// the frames in order.
    pub fn transmit(&self) -> Vec<Vec<u8>> {
        let mut wire = self.wire();
        let Some(rings) = wire.rings.clone() else {
            return Vec::new();
        };
        let ring = &rings.tx;
        let mut sent = Vec::new();
        while wire.tx_next != wire.tx_tail {
            let desc = ring.get(wire.tx_next);
            let addr = desc.addr.load(Ordering::Relaxed);
            let command = desc.status();
            let len = (command & TX_LEN_MASK) as usize;
            let frame = unsafe { std::slice::from_raw_parts(addr as *const u8, len) };
            sent.push(frame.to_vec());
            desc.status.store(command | STATUS_DD, Ordering::Release);
            wire.tx_next = ring.wrap(wire.tx_next.wrapping_add(1));
        }
        rings.tx_head.store(u32::from(wire.tx_next), Ordering::Release);
        sent
    }
}

impl NicDevice for SimulatedNic {
    fn attach_rings(&self, rings: Arc<NicRings>, wakeup: Arc<EventFd>) -> io::Result<()> {
        let mut wire = self.wire();
        if wire.rings.is_some() {
            return Err(io::Error::new(io::ErrorKind::AlreadyExists, "rings already attached"));
        }
        *wire = Wire { rings: Some(rings), wakeup: Some(wakeup), ..Wire::default() };
        Ok(())
    }

    fn set_rx_tail(&self, tail: u16) {
        self.wire().rx_tail = tail;
    }

    fn set_tx_tail(&self, tail: u16) {
        self.wire().tx_tail = tail;
    }

    fn unmask_rxtx_irq(&self) {
        self.wire().irq_unmasked = true;
    }
}
