use std::cell::UnsafeCell;
use std::ptr;
use std::sync::atomic::{AtomicU16, Ordering};

/// Single-producer/single-consumer descriptor queue with `N` slots, one
/// of which always stays empty.
///
/// The layout is shared with a peer process, so the queue is usually
/// reached through a pointer into shared memory rather than built with
/// [`Queue::new`]. Cursors are stored masked; values read back from shared
/// memory are masked again before use, so a corrupted cursor can only ever
/// select a slot inside the array.
#[repr(C)]
pub struct Queue<T, const N: usize> {
    desc: [UnsafeCell<T>; N],
    head: AtomicU16,
    tail: AtomicU16,
    _reserved: u32,
}

unsafe impl<T: Send, const N: usize> Sync for Queue<T, N> {}

impl<T: Copy, const N: usize> Queue<T, N> {
    const MASK: u16 = {
        assert!(
            N.is_power_of_two() && N >= 2 && N <= 1 << 15,
            "queue length must be a power of two between 2 and 32768"
        );
        (N - 1) as u16
    };

    pub fn new() -> Self
    where
        T: Default,
    {
        Self {
            desc: std::array::from_fn(|_| UnsafeCell::new(T::default())),
            head: AtomicU16::new(0),
            tail: AtomicU16::new(0),
            _reserved: 0,
        }
    }

    /// Usable slots.
    pub const fn capacity() -> usize {
        N - 1
    }

    /// Reset both cursors. Neither side may use the queue concurrently.
    pub fn reset(&self) {
        self.head.store(0, Ordering::Relaxed);
        self.tail.store(0, Ordering::Release);
    }

    #[inline]
    fn slot(&self, idx: u16) -> *mut T {
        self.desc[(idx & Self::MASK) as usize].get()
    }

    #[inline]
    fn occupied(head: u16, tail: u16) -> u16 {
        (tail & Self::MASK).wrapping_sub(head & Self::MASK) & Self::MASK
    }

    pub fn len(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        Self::occupied(head, tail) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.room() == 0
    }

    /// Free slots as seen by the producer. The consumer cursor is read
    /// without ordering; it can only be stale in the "less room" direction.
    #[inline]
    pub fn room(&self) -> usize {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Relaxed);
        N - 1 - Self::occupied(head, tail) as usize
    }

    /// Producer side. Returns `false` without touching the queue if it is full.
    pub fn enqueue(&self, desc: T) -> bool {
        let tail = self.tail.load(Ordering::Relaxed) & Self::MASK;
        let head = self.head.load(Ordering::Acquire) & Self::MASK;
        let next = tail.wrapping_add(1) & Self::MASK;
        if next == head {
            return false;
        }
        unsafe { ptr::write_volatile(self.slot(tail), desc) };
        self.tail.store(next, Ordering::Release);
        true
    }

    /// Publish all of `descs` with a single cursor update, or none of them.
    pub fn enqueue_multi(&self, descs: &[T]) -> bool {
        let tail = self.tail.load(Ordering::Relaxed) & Self::MASK;
        let head = self.head.load(Ordering::Acquire) & Self::MASK;
        let room = N - 1 - Self::occupied(head, tail) as usize;
        if descs.len() > room {
            return false;
        }
        let mut idx = tail;
        for desc in descs {
            unsafe { ptr::write_volatile(self.slot(idx), *desc) };
            idx = idx.wrapping_add(1);
        }
        self.tail.store(idx & Self::MASK, Ordering::Release);
        true
    }

    /// Consumer side. Returns `None` without touching the queue if it is empty.
    pub fn dequeue(&self) -> Option<T> {
        let head = self.head.load(Ordering::Relaxed) & Self::MASK;
        let tail = self.tail.load(Ordering::Acquire) & Self::MASK;
        if head == tail {
            return None;
        }
        let desc = unsafe { ptr::read_volatile(self.slot(head)) };
        self.head.store(head.wrapping_add(1) & Self::MASK, Ordering::Release);
        Some(desc)
    }

    /// Read the descriptor `offset` places behind the consumer cursor
    /// without consuming anything.
    pub fn peek(&self, offset: usize) -> Option<T> {
        let head = self.head.load(Ordering::Relaxed) & Self::MASK;
        let tail = self.tail.load(Ordering::Acquire) & Self::MASK;
        if offset >= Self::occupied(head, tail) as usize {
            return None;
        }
        Some(unsafe { ptr::read_volatile(self.slot(head.wrapping_add(offset as u16))) })
    }

    /// Consume `count` descriptors previously inspected with [`Queue::peek`].
    pub fn release(&self, count: usize) {
        let head = self.head.load(Ordering::Relaxed) & Self::MASK;
        let tail = self.tail.load(Ordering::Acquire) & Self::MASK;
        let count = count.min(Self::occupied(head, tail) as usize) as u16;
        self.head.store(head.wrapping_add(count) & Self::MASK, Ordering::Release);
    }
}

impl<T: Copy + Default, const N: usize> Default for Queue<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::desc::{ClientDesc, DESC_TX_FINAL};
    use std::sync::Arc;
    use std::thread;

    fn desc(n: u64) -> ClientDesc {
        ClientDesc::new(0x1000 * n, n as u32, DESC_TX_FINAL)
    }

    #[test]
    fn test_fifo_order() {
        let q: Queue<ClientDesc, 8> = Queue::new();
        assert!(q.is_empty());
        for n in 0..5 {
            assert!(q.enqueue(desc(n)));
        }
        assert_eq!(q.len(), 5);
        for n in 0..5 {
            assert_eq!(q.dequeue(), Some(desc(n)));
        }
        assert_eq!(q.dequeue(), None);
    }

    #[test]
    fn test_full_and_empty_leave_state_unchanged() {
        let q: Queue<ClientDesc, 8> = Queue::new();
        assert_eq!(Queue::<ClientDesc, 8>::capacity(), 7);

        // 1. Fill to capacity - 1 slots
        for n in 0..7 {
            assert!(q.enqueue(desc(n)));
        }
        assert!(q.is_full());
        assert_eq!(q.room(), 0);

        // 2. One more must fail and not disturb the contents
        assert!(!q.enqueue(desc(99)));
        assert_eq!(q.len(), 7);
        for n in 0..7 {
            assert_eq!(q.dequeue(), Some(desc(n)));
        }

        // 3. Empty dequeue fails repeatedly without moving the cursors
        assert_eq!(q.dequeue(), None);
        assert_eq!(q.dequeue(), None);
        assert_eq!(q.room(), 7);
        assert!(q.enqueue(desc(7)));
        assert_eq!(q.dequeue(), Some(desc(7)));
    }

    #[test]
    fn test_wraparound() {
        let q: Queue<ClientDesc, 4> = Queue::new();
        for n in 0..1000 {
            assert!(q.enqueue(desc(n)));
            assert!(q.enqueue(desc(n + 1)));
            assert_eq!(q.dequeue(), Some(desc(n)));
            assert_eq!(q.dequeue(), Some(desc(n + 1)));
        }
        assert!(q.is_empty());
    }

    #[test]
    fn test_enqueue_multi_is_all_or_nothing() {
        let q: Queue<ClientDesc, 8> = Queue::new();
        let batch: Vec<_> = (0..5).map(desc).collect();
        assert!(q.enqueue_multi(&batch));
        assert!(!q.enqueue_multi(&batch));
        assert_eq!(q.len(), 5);
        assert!(q.enqueue_multi(&batch[..2]));
        assert!(q.is_full());
        for n in 0..5 {
            assert_eq!(q.dequeue(), Some(desc(n)));
        }
        assert_eq!(q.dequeue(), Some(desc(0)));
        assert_eq!(q.dequeue(), Some(desc(1)));
    }

    #[test]
    fn test_peek_and_release() {
        let q: Queue<ClientDesc, 8> = Queue::new();
        for n in 0..3 {
            q.enqueue(desc(n));
        }
        assert_eq!(q.peek(2), Some(desc(2)));
        assert_eq!(q.peek(3), None);
        assert_eq!(q.len(), 3);
        q.release(2);
        assert_eq!(q.dequeue(), Some(desc(2)));
        q.release(5);
        assert!(q.is_empty());
    }

    #[test]
    fn test_corrupted_cursor_is_masked() {
        let q: Queue<ClientDesc, 8> = Queue::new();
        q.tail.store(0xfff3, Ordering::Relaxed);
        assert_eq!(q.len(), 3);
        assert!(q.dequeue().is_some());
    }

    #[test]
    fn test_spsc_threads() {
        const COUNT: u64 = 100_000;
        let q: Arc<Queue<u64, 64>> = Arc::new(Queue::new());

        let producer = {
            let q = q.clone();
            thread::spawn(move || {
                let mut n = 0;
                while n < COUNT {
                    if q.enqueue(n) {
                        n += 1;
                    } else {
                        thread::yield_now();
                    }
                }
            })
        };

        let mut expected = 0;
        while expected < COUNT {
            match q.dequeue() {
                Some(v) => {
                    assert_eq!(v, expected);
                    expected += 1;
                }
                None => thread::yield_now(),
            }
        }
        producer.join().expect("producer panicked");
    }
}
