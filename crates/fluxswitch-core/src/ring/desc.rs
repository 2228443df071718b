/// Descriptor exchanged with native clients over the queue pair.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientDesc {
    /// Client virtual address of the buffer.
    pub buf_ptr: u64,
    pub len: u32,
    pub kind: u16,
    pub _reserved: u16,
}

/// Unused slot.
pub const DESC_INVALID: u16 = 0;
/// Switch filled a client receive buffer.
pub const DESC_RX_DONE: u16 = 1;
/// Switch finished with a transmitted packet.
pub const DESC_TX_DONE: u16 = 2;
/// Transmit fragment, more follow.
pub const DESC_TX_CONTINUE: u16 = 3;
/// Last transmit fragment of a packet.
pub const DESC_TX_FINAL: u16 = 4;

impl ClientDesc {
    pub const fn new(buf_ptr: u64, len: u32, kind: u16) -> Self {
        Self { buf_ptr, len, kind, _reserved: 0 }
    }

    #[inline]
    pub fn is_tx(&self) -> bool {
        self.kind == DESC_TX_CONTINUE || self.kind == DESC_TX_FINAL
    }
}

const _: () = assert!(std::mem::size_of::<ClientDesc>() == 16);
