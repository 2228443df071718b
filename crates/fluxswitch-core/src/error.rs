use thiserror::Error;

/// Protocol violations detected while walking a ring that lives in peer
/// memory. Always fatal to the port that owns the ring.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RingError {
    #[error("peer published {published} new buffers on a ring of {size}")]
    TooManyHeads { published: u16, size: u16 },

    #[error("descriptor index {index} out of range for ring of {size}")]
    IndexOutOfRange { index: u16, size: u16 },

    #[error("descriptor chain loops or exceeds ring size")]
    ChainTooLong,

    #[error("packet exceeds {0} fragments")]
    TooManyFragments(usize),

    #[error("untranslatable buffer {addr:#x}+{len}")]
    BadAddress { addr: u64, len: u64 },

    #[error("descriptor direction does not match queue direction")]
    DirectionMismatch,

    #[error("indirect descriptors were not negotiated")]
    IndirectDescriptor,

    #[error("ring memory is misaligned")]
    Misaligned,

    #[error("invalid ring size {0}")]
    InvalidSize(u32),

    #[error("incomplete packet program")]
    IncompleteProgram,
}

/// Errors while building or querying a guest memory map.
#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("region {addr:#x}+{size:#x} is empty or wraps the address space")]
    InvalidRegion { addr: u64, size: u64 },

    #[error("region {addr:#x}+{size:#x} overlaps an existing region")]
    Overlap { addr: u64, size: u64 },

    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
}
