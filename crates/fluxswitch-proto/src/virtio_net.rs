//! virtio-net wire definitions: feature bits, device status and the
//! per-packet header that precedes every frame on a virtio-net queue.

pub const VIRTIO_NET_F_CSUM: u32 = 0;
pub const VIRTIO_NET_F_GUEST_CSUM: u32 = 1;
pub const VIRTIO_NET_F_MAC: u32 = 5;
pub const VIRTIO_NET_F_GSO: u32 = 6;
pub const VIRTIO_NET_F_GUEST_TSO4: u32 = 7;
pub const VIRTIO_NET_F_GUEST_TSO6: u32 = 8;
pub const VIRTIO_NET_F_GUEST_ECN: u32 = 9;
pub const VIRTIO_NET_F_GUEST_UFO: u32 = 10;
pub const VIRTIO_NET_F_HOST_TSO4: u32 = 11;
pub const VIRTIO_NET_F_HOST_TSO6: u32 = 12;
pub const VIRTIO_NET_F_HOST_ECN: u32 = 13;
pub const VIRTIO_NET_F_HOST_UFO: u32 = 14;
pub const VIRTIO_NET_F_MRG_RXBUF: u32 = 15;
pub const VIRTIO_NET_F_STATUS: u32 = 16;
pub const VIRTIO_NET_F_CTRL_VQ: u32 = 17;
pub const VIRTIO_NET_F_CTRL_RX: u32 = 18;
pub const VIRTIO_NET_F_CTRL_VLAN: u32 = 19;
pub const VIRTIO_NET_F_CTRL_RX_EXTRA: u32 = 20;
pub const VIRTIO_NET_F_MQ: u32 = 22;
pub const VIRTIO_NET_F_CTRL_MAC_ADDR: u32 = 23;

const FEATURE_NAMES: &[(u32, &str)] = &[
    (VIRTIO_NET_F_CSUM, "CSUM"),
    (VIRTIO_NET_F_GUEST_CSUM, "GUEST_CSUM"),
    (VIRTIO_NET_F_MAC, "MAC"),
    (VIRTIO_NET_F_GSO, "GSO"),
    (VIRTIO_NET_F_GUEST_TSO4, "GUEST_TSO4"),
    (VIRTIO_NET_F_GUEST_TSO6, "GUEST_TSO6"),
    (VIRTIO_NET_F_GUEST_ECN, "GUEST_ECN"),
    (VIRTIO_NET_F_GUEST_UFO, "GUEST_UFO"),
    (VIRTIO_NET_F_HOST_TSO4, "HOST_TSO4"),
    (VIRTIO_NET_F_HOST_TSO6, "HOST_TSO6"),
    (VIRTIO_NET_F_HOST_ECN, "HOST_ECN"),
    (VIRTIO_NET_F_HOST_UFO, "HOST_UFO"),
    (VIRTIO_NET_F_MRG_RXBUF, "MRG_RXBUF"),
    (VIRTIO_NET_F_STATUS, "STATUS"),
    (VIRTIO_NET_F_CTRL_VQ, "CTRL_VQ"),
    (VIRTIO_NET_F_CTRL_RX, "CTRL_RX"),
    (VIRTIO_NET_F_CTRL_VLAN, "CTRL_VLAN"),
    (VIRTIO_NET_F_CTRL_RX_EXTRA, "CTRL_RX_EXTRA"),
    (VIRTIO_NET_F_MQ, "MQ"),
    (VIRTIO_NET_F_CTRL_MAC_ADDR, "CTRL_MAC_ADDR"),
];

/// Space separated feature names for logging. Unknown bits are printed
/// as their bit number.
pub fn features_to_string(features: u32) -> String {
    let mut out = String::new();
    for bit in 0..32 {
        if features & (1 << bit) == 0 {
            continue;
        }
        if !out.is_empty() {
            out.push(' ');
        }
        match FEATURE_NAMES.iter().find(|(b, _)| *b == bit) {
            Some((_, name)) => out.push_str(name),
            None => out.push_str(&bit.to_string()),
        }
    }
    out
}

#[inline]
pub const fn feature(bit: u32) -> u32 {
    1 << bit
}

// Device status register bits.
pub const VIRTIO_CONFIG_S_ACKNOWLEDGE: u8 = 1;
pub const VIRTIO_CONFIG_S_DRIVER: u8 = 2;
pub const VIRTIO_CONFIG_S_DRIVER_OK: u8 = 4;
pub const VIRTIO_CONFIG_S_FEATURES_OK: u8 = 8;
pub const VIRTIO_CONFIG_S_FAILED: u8 = 0x80;

pub const VIRTIO_NET_HDR_F_NEEDS_CSUM: u8 = 1;
pub const VIRTIO_NET_HDR_F_DATA_VALID: u8 = 2;
pub const VIRTIO_NET_HDR_GSO_NONE: u8 = 0;

/// Header length without `VIRTIO_NET_F_MRG_RXBUF`.
pub const VIRTIO_NET_HDR_LEN: usize = 10;
/// Header length with `VIRTIO_NET_F_MRG_RXBUF` (adds `num_buffers`).
pub const VIRTIO_NET_HDR_MRG_LEN: usize = 12;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VirtioNetHdr {
    pub flags: u8,
    pub gso_type: u8,
    pub hdr_len: u16,
    pub gso_size: u16,
    pub csum_start: u16,
    pub csum_offset: u16,
    pub num_buffers: u16,
}

impl VirtioNetHdr {
    /// Header size negotiated for a queue pair.
    pub fn len_for(merged_rx_buffers: bool) -> usize {
        if merged_rx_buffers {
            VIRTIO_NET_HDR_MRG_LEN
        } else {
            VIRTIO_NET_HDR_LEN
        }
    }

    /// Decode a header. `num_buffers` is only read when `data` is long
    /// enough to carry it.
    pub fn decode(data: &[u8]) -> Option<Self> {
        if data.len() < VIRTIO_NET_HDR_LEN {
            return None;
        }
        let le16 = |at: usize| u16::from_le_bytes([data[at], data[at + 1]]);
        Some(Self {
            flags: data[0],
            gso_type: data[1],
            hdr_len: le16(2),
            gso_size: le16(4),
            csum_start: le16(6),
            csum_offset: le16(8),
            num_buffers: if data.len() >= VIRTIO_NET_HDR_MRG_LEN { le16(10) } else { 0 },
        })
    }

    /// Encode into `out`, writing `num_buffers` only if `out` has room for it.
    /// Returns the number of bytes written.
    pub fn encode(&self, out: &mut [u8]) -> usize {
        if out.len() < VIRTIO_NET_HDR_LEN {
            return 0;
        }
        out[0] = self.flags;
        out[1] = self.gso_type;
        out[2..4].copy_from_slice(&self.hdr_len.to_le_bytes());
        out[4..6].copy_from_slice(&self.gso_size.to_le_bytes());
        out[6..8].copy_from_slice(&self.csum_start.to_le_bytes());
        out[8..10].copy_from_slice(&self.csum_offset.to_le_bytes());
        if out.len() >= VIRTIO_NET_HDR_MRG_LEN {
            out[10..12].copy_from_slice(&self.num_buffers.to_le_bytes());
            VIRTIO_NET_HDR_MRG_LEN
        } else {
            VIRTIO_NET_HDR_LEN
        }
    }
}
