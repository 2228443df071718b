//! A packet as a list of scattered fragments plus completion metadata.

mod completion;

pub use completion::Completion;

use std::ptr::NonNull;
use std::slice;

use fluxswitch_core::RingError;
use fluxswitch_proto::{EthHeader, ETH_HEADER_LEN};

pub const MAX_FRAGMENTS: usize = 128;

#[derive(Clone, Copy)]
struct Fragment {
    ptr: NonNull<u8>,
    len: u32,
}

/// Borrowed view of one packet for the duration of a switch iteration.
///
/// The packet never owns the memory behind its fragments: the port that
/// produced it keeps ownership until `mark_done`. Destination ports use a
/// packet of their own buffers as a scatter list to copy into.
pub struct Packet {
    fragments: [Fragment; MAX_FRAGMENTS],
    count: usize,
    len: usize,
    completion: Completion,
}

impl Packet {
    pub fn new() -> Self {
        Self {
            fragments: [Fragment { ptr: NonNull::dangling(), len: 0 }; MAX_FRAGMENTS],
            count: 0,
            len: 0,
            completion: Completion::None,
        }
    }

    pub fn clear(&mut self) {
        self.count = 0;
        self.len = 0;
        self.completion = Completion::None;
    }

    /// Append a fragment.
    ///
    /// # Safety
    /// `ptr` must be valid for reads (and for writes, if the packet is used
    /// as a destination) of `len` bytes until the packet is cleared, and no
    /// other reference may write to that memory while the packet reads it.
    pub unsafe fn push_fragment(&mut self, ptr: NonNull<u8>, len: u32) -> Result<(), RingError> {
        if self.count == MAX_FRAGMENTS {
            return Err(RingError::TooManyFragments(MAX_FRAGMENTS));
        }
        self.fragments[self.count] = Fragment { ptr, len };
        self.count += 1;
        self.len += len as usize;
        Ok(())
    }

    /// Total bytes over all fragments.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn fragment_count(&self) -> usize {
        self.count
    }

    pub fn fragments(&self) -> impl Iterator<Item = &[u8]> + '_ {
        self.fragments[..self.count]
            .iter()
            .map(|f| unsafe { slice::from_raw_parts(f.ptr.as_ptr(), f.len as usize) })
    }

    pub fn fragments_mut(&mut self) -> impl Iterator<Item = &mut [u8]> + '_ {
        self.fragments[..self.count]
            .iter()
            .map(|f| unsafe { slice::from_raw_parts_mut(f.ptr.as_ptr(), f.len as usize) })
    }

    pub fn completion(&self) -> Completion {
        self.completion
    }

    pub fn set_completion(&mut self, completion: Completion) {
        self.completion = completion;
    }

    /// Copy bytes starting at packet offset `start` into `out`. Returns how
    /// many bytes were copied; fewer than `out.len()` at the end of the packet.
    pub fn copy_range(&self, start: usize, out: &mut [u8]) -> usize {
        let mut skip = start;
        let mut copied = 0;
        for frag in self.fragments() {
            if copied == out.len() {
                break;
            }
            if skip >= frag.len() {
                skip -= frag.len();
                continue;
            }
            let src = &frag[skip..];
            skip = 0;
            let n = src.len().min(out.len() - copied);
            out[copied..copied + n].copy_from_slice(&src[..n]);
            copied += n;
        }
        copied
    }

    /// Linearise the packet into `out`, cropping if `out` is too small.
    pub fn copy_to(&self, out: &mut [u8]) -> usize {
        self.copy_range(0, out)
    }

    /// Fill this packet's buffers with the contents of `src`, cropping if
    /// they are too small. Returns bytes copied.
    pub fn scatter_from(&mut self, src: &Packet) -> usize {
        let mut copied = 0;
        for frag in self.fragments_mut() {
            let n = src.copy_range(copied, frag);
            copied += n;
            if n < frag.len() {
                break;
            }
        }
        copied
    }

    /// Ethernet header, gathered across fragment boundaries if needed.
    /// `None` for runt frames.
    pub fn ethernet_header(&self) -> Option<EthHeader> {
        if let Some(first) = self.fragments().next() {
            if let Some(bytes) = first.get(..ETH_HEADER_LEN) {
                let bytes: &[u8; ETH_HEADER_LEN] = bytes.try_into().ok()?;
                return Some(EthHeader::from_bytes(bytes));
            }
        }
        let mut bytes = [0u8; ETH_HEADER_LEN];
        if self.copy_to(&mut bytes) < ETH_HEADER_LEN {
            return None;
        }
        Some(EthHeader::from_bytes(&bytes))
    }
}

impl Default for Packet {
    fn default() -> Self {
        Self::new()
    }
}
