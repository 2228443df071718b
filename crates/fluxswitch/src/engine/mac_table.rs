use std::sync::atomic::{AtomicU64, Ordering};

use fluxswitch_proto::MacAddr;

/// Position of a port in a generation's port list.
pub type PortIndex = u16;

/// Largest port list a table can address.
pub const MAX_PORTS: usize = PortIndex::MAX as usize;

const KEY_SHIFT: u32 = 16;
const PORT_MASK: u64 = 0xffff;

/// Outcome of [`MacTable::insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Learned {
    New,
    Refreshed,
    Moved { from: PortIndex },
}

/// Bucketed hash of MAC address to port index.
///
/// Each slot packs `(mac << 16) | (port + 1)` into one word so readers on
/// other threads never see a torn entry. Zero marks an empty slot. When a
/// bucket is full the whole bucket is discarded and the new entry takes its
/// first slot. Entries never age out otherwise; the table is rebuilt empty
/// whenever the port set changes.
pub struct MacTable<const BUCKETS: usize = 1024, const WAYS: usize = 1> {
    slots: Box<[AtomicU64]>,
}

impl<const BUCKETS: usize, const WAYS: usize> MacTable<BUCKETS, WAYS> {
    pub fn new() -> Self {
        assert!(BUCKETS > 0 && WAYS > 0);
        Self { slots: (0..BUCKETS * WAYS).map(|_| AtomicU64::new(0)).collect() }
    }

    /// CRC32 of the address taken as a 4-byte word followed by a 2-byte word.
    pub fn hash(addr: &MacAddr) -> u32 {
        let octets = addr.octets();
        let mut hasher = crc32fast::Hasher::new_with_initial(crc32fast::hash(&octets[..4]));
        hasher.update(&octets[4..]);
        hasher.finalize()
    }

    pub fn bucket_of(addr: &MacAddr) -> usize {
        Self::hash(addr) as usize % BUCKETS
    }

    fn bucket(&self, addr: &MacAddr) -> &[AtomicU64] {
        let start = Self::bucket_of(addr) * WAYS;
        &self.slots[start..start + WAYS]
    }

    #[inline]
    fn entry(addr: &MacAddr, port: PortIndex) -> u64 {
        (addr.to_u64() << KEY_SHIFT) | (u64::from(port) + 1)
    }

    /// Port last seen sending from `addr`.
    pub fn lookup(&self, addr: &MacAddr) -> Option<PortIndex> {
        let key = addr.to_u64();
        self.bucket(addr).iter().find_map(|slot| {
            let value = slot.load(Ordering::Relaxed);
            (value != 0 && value >> KEY_SHIFT == key).then(|| (value & PORT_MASK) as PortIndex - 1)
        })
    }

    /// Record that `addr` was seen on `port`. Only the poll thread inserts.
    pub fn insert(&self, addr: &MacAddr, port: PortIndex) -> Learned {
        debug_assert!((port as usize) < MAX_PORTS);
        let key = addr.to_u64();
        let entry = Self::entry(addr, port);
        let bucket = self.bucket(addr);

        for slot in bucket {
            let value = slot.load(Ordering::Relaxed);
            if value == 0 {
                slot.store(entry, Ordering::Relaxed);
                return Learned::New;
            }
            if value >> KEY_SHIFT == key {
                let from = (value & PORT_MASK) as PortIndex - 1;
                if from == port {
                    return Learned::Refreshed;
                }
                slot.store(entry, Ordering::Relaxed);
                return Learned::Moved { from };
            }
        }

        for slot in &bucket[1..] {
            slot.store(0, Ordering::Relaxed);
        }
        bucket[0].store(entry, Ordering::Relaxed);
        Learned::New
    }

    /// Number of occupied slots.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.load(Ordering::Relaxed) != 0).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub const fn capacity() -> usize {
        BUCKETS * WAYS
    }
}

impl<const BUCKETS: usize, const WAYS: usize> Default for MacTable<BUCKETS, WAYS> {
    fn default() -> Self {
        Self::new()
    }
}
