//! Descriptor rings shared with a DMA-capable network controller.
//!
//! A descriptor is an `(addr, status)` pair of 64-bit words. Software posts
//! a buffer address with a cleared status; the device writes the status back
//! with `DD` set once the slot is complete.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Descriptor done: the device has finished with this slot.
pub const STATUS_DD: u64 = 1 << 0;
/// End of packet: last descriptor of a frame.
pub const STATUS_EOP: u64 = 1 << 1;
/// Receive length lives in bits 32..48 of a written-back status.
pub const RX_LEN_SHIFT: u32 = 32;

/// Transmit command bits, with the buffer length in the low 16 bits.
pub const TX_CMD_EOP: u64 = 1 << 24;
pub const TX_CMD_IFCS: u64 = 1 << 25;
pub const TX_CMD_RS: u64 = 1 << 27;
pub const TX_LEN_MASK: u64 = 0xffff;

#[repr(C)]
#[derive(Debug, Default)]
pub struct NicDesc {
    pub addr: AtomicU64,
    pub status: AtomicU64,
}

impl NicDesc {
    /// Hand the slot to the device with a fresh buffer.
    #[inline]
    pub fn post(&self, addr: u64, status: u64) {
        self.addr.store(addr, Ordering::Relaxed);
        self.status.store(status, Ordering::Release);
    }

    #[inline]
    pub fn status(&self) -> u64 {
        self.status.load(Ordering::Acquire)
    }
}

#[inline]
pub fn rx_len(status: u64) -> u16 {
    (status >> RX_LEN_SHIFT) as u16
}

#[inline]
pub fn rx_status(len: u16, eop: bool) -> u64 {
    let eop = if eop { STATUS_EOP } else { 0 };
    STATUS_DD | eop | ((len as u64) << RX_LEN_SHIFT)
}

#[inline]
pub fn tx_command(len: u16) -> u64 {
    TX_CMD_EOP | TX_CMD_IFCS | TX_CMD_RS | (len as u64 & TX_LEN_MASK)
}

pub struct DescRing {
    descs: Box<[NicDesc]>,
    mask: u16,
}

impl DescRing {
    pub fn new(len: u16) -> Option<Self> {
        if len < 2 || !len.is_power_of_two() {
            return None;
        }
        let descs = (0..len).map(|_| NicDesc::default()).collect();
        Some(Self { descs, mask: len - 1 })
    }

    pub fn len(&self) -> u16 {
        self.mask + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    #[inline]
    pub fn get(&self, idx: u16) -> &NicDesc {
        &self.descs[(idx & self.mask) as usize]
    }

    #[inline]
    pub fn wrap(&self, idx: u16) -> u16 {
        idx & self.mask
    }

    /// Base address programmed into the device.
    pub fn dma_addr(&self) -> u64 {
        self.descs.as_ptr() as u64
    }
}

/// Receive and transmit rings of one queue plus the transmit head
/// write-back word.
pub struct NicRings {
    pub rx: DescRing,
    pub tx: DescRing,
    pub tx_head: AtomicU32,
}

impl NicRings {
    pub fn new(rx_len: u16, tx_len: u16) -> Option<Self> {
        Some(Self {
            rx: DescRing::new(rx_len)?,
            tx: DescRing::new(tx_len)?,
            tx_head: AtomicU32::new(0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_encoding() {
        let status = rx_status(1514, true);
        assert_ne!(status & STATUS_DD, 0);
        assert_ne!(status & STATUS_EOP, 0);
        assert_eq!(rx_len(status), 1514);
        assert_eq!(rx_status(60, false) & STATUS_EOP, 0);
        assert_eq!(tx_command(60) & TX_LEN_MASK, 60);
    }

    #[test]
    fn test_ring_wraps() {
        assert!(DescRing::new(6).is_none());
        let ring = DescRing::new(8).unwrap();
        ring.get(9).post(0x1000, 0);
        assert_eq!(ring.get(1).addr.load(Ordering::Relaxed), 0x1000);
        assert_eq!(ring.wrap(17), 1);
    }
}
