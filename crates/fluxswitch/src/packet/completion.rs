/// What the originating port needs to retire a packet in `mark_done`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Completion {
    #[default]
    None,
    /// Data was read into a port-owned buffer; nothing to return.
    Tap,
    /// First client buffer of the transmit program and the packet length.
    QueuePair { buf_ptr: u64, len: u32 },
    /// Head of the transmit chain to hand back on the used ring.
    Virtio { head: u16 },
    /// Receive ring slots holding the packet.
    Nic { first_slot: u16, slots: u16 },
    /// Opaque value for ports implemented outside this crate, which keep
    /// their own table of in-flight packets keyed by it. The switch only
    /// carries it from `poll` to `mark_done`.
    Token(u64),
}
