//! Quiescent-state based publication of an immutable value to a single
//! polling reader.
//!
//! Writers build a new value, swap it in and queue the old one. The reader
//! announces quiescent points (moments where it holds no reference into any
//! published value) and frees queued values there. Because the reader's
//! references borrow its [`RcuReader`] and announcing quiescence needs
//! `&mut`, a reference cannot survive a quiescent point.
//!
//! [`Rcu::synchronize`] returns once every value retired before the call has
//! been dropped, so whatever those values owned is released before the
//! writer carries on. While the reader is offline the writer frees them
//! itself.

use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError, TryLockError};
use std::thread;
use std::time::Duration;

use crossbeam_queue::SegQueue;

const SYNCHRONIZE_BACKOFF: Duration = Duration::from_micros(20);

struct Retired<T> {
    ptr: NonNull<T>,
    seq: u64,
}

unsafe impl<T: Send> Send for Retired<T> {}

pub struct Rcu<T> {
    current: AtomicPtr<T>,
    online: AtomicBool,
    registered: AtomicBool,
    retired: SegQueue<Retired<T>>,
    /// Sequence number of the last value queued for freeing.
    retired_seq: AtomicU64,
    /// Sequence number of the last value actually freed.
    reclaimed_seq: AtomicU64,
    /// Held by whoever is freeing queued values.
    reclaim: Mutex<()>,
    writer: Mutex<()>,
    _owns: PhantomData<Box<T>>,
}

impl<T> Rcu<T> {
    pub fn new(value: T) -> Self {
        Self {
            current: AtomicPtr::new(Box::into_raw(Box::new(value))),
            online: AtomicBool::new(false),
            registered: AtomicBool::new(false),
            retired: SegQueue::new(),
            retired_seq: AtomicU64::new(0),
            reclaimed_seq: AtomicU64::new(0),
            reclaim: Mutex::new(()),
            writer: Mutex::new(()),
            _owns: PhantomData,
        }
    }

    /// Register the reader. Only one may exist at a time.
    pub fn reader(&self) -> Option<RcuReader<'_, T>> {
        self.registered
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        let mut reader = RcuReader { rcu: self, _not_send: PhantomData };
        reader.online();
        Some(reader)
    }

    fn lock_writer(&self) -> MutexGuard<'_, ()> {
        self.writer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publish `f(current)` if it returns `Some`. Returns whether a new value
    /// was published.
    pub fn update<F>(&self, f: F) -> bool
    where
        F: FnOnce(&T) -> Option<T>,
    {
        let guard = self.lock_writer();
        self.publish(guard, f)
    }

    /// Like [`Rcu::update`] but gives up instead of waiting for another writer.
    /// Returns `None` if the writer lock was busy.
    pub fn try_update<F>(&self, f: F) -> Option<bool>
    where
        F: FnOnce(&T) -> Option<T>,
    {
        let guard = match self.writer.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return None,
        };
        Some(self.publish(guard, f))
    }

    fn publish<F>(&self, _guard: MutexGuard<'_, ()>, f: F) -> bool
    where
        F: FnOnce(&T) -> Option<T>,
    {
        // Writers are serialised, so the current value cannot be retired
        // (let alone freed) while we look at it.
        let old = self.current.load(Ordering::Acquire);
        let Some(new) = f(unsafe { &*old }) else {
            return false;
        };
        let new = Box::into_raw(Box::new(new));
        self.current.store(new, Ordering::SeqCst);
        if let Some(ptr) = NonNull::new(old) {
            let seq = self.retired_seq.load(Ordering::Relaxed) + 1;
            self.retired.push(Retired { ptr, seq });
            self.retired_seq.store(seq, Ordering::SeqCst);
        }
        true
    }

    /// Run `f` on the current value from a thread other than the reader.
    pub fn with_current<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        let _guard = self.lock_writer();
        f(unsafe { &*self.current.load(Ordering::Acquire) })
    }

    /// Wait until every value retired before this call has been dropped.
    /// An online reader frees them at its next quiescent point; an offline
    /// or unregistered one holds no references, so they are freed here.
    /// Must not be called by the reader.
    pub fn synchronize(&self) {
        let target = self.retired_seq.load(Ordering::SeqCst);
        while self.reclaimed_seq.load(Ordering::SeqCst) < target {
            if !self.online.load(Ordering::SeqCst) {
                // No value can be retired while we hold the writer lock, and
                // a reader coming online now only sees the current one.
                let _writer = self.lock_writer();
                if !self.online.load(Ordering::SeqCst) {
                    self.drain(self.reclaim.lock().unwrap_or_else(PoisonError::into_inner));
                    continue;
                }
            }
            thread::sleep(SYNCHRONIZE_BACKOFF);
        }
    }

    fn drain(&self, _reclaim: MutexGuard<'_, ()>) {
        while let Some(Retired { ptr, seq }) = self.retired.pop() {
            drop(unsafe { Box::from_raw(ptr.as_ptr()) });
            self.reclaimed_seq.store(seq, Ordering::SeqCst);
        }
    }

    /// Values waiting to be freed.
    pub fn retired_len(&self) -> usize {
        self.retired.len()
    }
}

impl<T> Drop for Rcu<T> {
    fn drop(&mut self) {
        while let Some(Retired { ptr, .. }) = self.retired.pop() {
            drop(unsafe { Box::from_raw(ptr.as_ptr()) });
        }
        let current = *self.current.get_mut();
        if !current.is_null() {
            drop(unsafe { Box::from_raw(current) });
        }
    }
}

/// The one thread allowed to dereference published values without a lock.
pub struct RcuReader<'a, T> {
    rcu: &'a Rcu<T>,
    _not_send: PhantomData<*const ()>,
}

impl<'a, T> RcuReader<'a, T> {
    /// Current value. The reference lives until the next quiescent point.
    #[inline]
    pub fn read(&self) -> &T {
        unsafe { &*self.rcu.current.load(Ordering::SeqCst) }
    }

    /// Announce that no reference obtained from [`RcuReader::read`] is held,
    /// and free everything retired so far. Skips freeing if a writer is
    /// already at it; the reader never blocks on a lock.
    #[inline]
    pub fn quiescent(&mut self) {
        let guard = match self.rcu.reclaim.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return,
        };
        self.rcu.drain(guard);
    }

    /// Stop participating, e.g. before blocking. Writers free retired
    /// values themselves while the reader is offline.
    pub fn offline(&mut self) {
        self.rcu.online.store(false, Ordering::SeqCst);
    }

    pub fn online(&mut self) {
        self.rcu.online.store(true, Ordering::SeqCst);
        self.quiescent();
    }
}

impl<T> Drop for RcuReader<'_, T> {
    fn drop(&mut self) {
        self.offline();
        self.rcu.registered.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    struct Tracked {
        value: u64,
        drops: Arc<AtomicUsize>,
    }

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_single_reader() {
        let rcu = Rcu::new(1u32);
        let reader = rcu.reader().expect("first reader");
        assert!(rcu.reader().is_none());
        drop(reader);
        assert!(rcu.reader().is_some());
    }

    #[test]
    fn test_update_retires_until_quiescent() {
        let drops = Arc::new(AtomicUsize::new(0));
        let rcu = Rcu::new(Tracked { value: 1, drops: drops.clone() });
        let mut reader = rcu.reader().unwrap();
        assert_eq!(reader.read().value, 1);

        // 1. Publish a new value: old one is only queued
        assert!(rcu.update(|old| Some(Tracked { value: old.value + 1, drops: old.drops.clone() })));
        assert_eq!(drops.load(Ordering::SeqCst), 0);
        assert_eq!(rcu.retired_len(), 1);

        // 2. Quiescent point frees it
        reader.quiescent();
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        assert_eq!(reader.read().value, 2);

        // 3. A declined update publishes nothing
        assert!(!rcu.update(|_| None));
        assert_eq!(rcu.retired_len(), 0);
    }

    #[test]
    fn test_drop_frees_everything() {
        let drops = Arc::new(AtomicUsize::new(0));
        {
            let rcu = Rcu::new(Tracked { value: 0, drops: drops.clone() });
            for value in 1..4 {
                rcu.update(|old| Some(Tracked { value, drops: old.drops.clone() }));
            }
            assert_eq!(rcu.retired_len(), 3);
        }
        assert_eq!(drops.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_synchronize_without_reader_returns() {
        let rcu = Rcu::new(0u32);
        rcu.update(|v| Some(v + 1));
        rcu.synchronize();
        assert_eq!(rcu.with_current(|v| *v), 1);
        assert_eq!(rcu.retired_len(), 0);
    }

    #[test]
    fn test_synchronize_frees_for_offline_reader() {
        let drops = Arc::new(AtomicUsize::new(0));
        let rcu = Rcu::new(Tracked { value: 0, drops: drops.clone() });
        let mut reader = rcu.reader().unwrap();

        // 1. Offline reader: the writer frees the old value itself
        reader.offline();
        rcu.update(|old| Some(Tracked { value: 1, drops: old.drops.clone() }));
        rcu.synchronize();
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        assert_eq!(rcu.retired_len(), 0);

        // 2. Back online it sees the new value and has nothing left to free
        reader.online();
        assert_eq!(reader.read().value, 1);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_synchronize_returns_after_old_value_dropped() {
        let drops = Arc::new(AtomicUsize::new(0));
        let rcu = Arc::new(Rcu::new(Tracked { value: 0, drops: drops.clone() }));
        let stop = Arc::new(AtomicBool::new(false));

        let reader_thread = {
            let rcu = rcu.clone();
            let stop = stop.clone();
            thread::spawn(move || {
                let mut reader = rcu.reader().unwrap();
                while !stop.load(Ordering::SeqCst) {
                    reader.quiescent();
                    // Hold a reference for a while between quiescent points
                    let value = reader.read().value;
                    thread::sleep(Duration::from_micros(value % 7 * 10));
                }
            })
        };

        for value in 1..=50u64 {
            rcu.update(|old| Some(Tracked { value, drops: old.drops.clone() }));
            rcu.synchronize();
            assert_eq!(drops.load(Ordering::SeqCst), value as usize);
        }

        stop.store(true, Ordering::SeqCst);
        reader_thread.join().unwrap();
    }

    #[test]
    fn test_synchronize_waits_for_quiescent_point() {
        let rcu = Arc::new(Rcu::new(0u64));
        let stop = Arc::new(AtomicBool::new(false));
        let seen = Arc::new(AtomicU64::new(0));

        let reader_thread = {
            let rcu = rcu.clone();
            let stop = stop.clone();
            let seen = seen.clone();
            thread::spawn(move || {
                let mut reader = rcu.reader().unwrap();
                while !stop.load(Ordering::SeqCst) {
                    reader.quiescent();
                    seen.store(*reader.read(), Ordering::SeqCst);
                }
            })
        };

        for value in 1..=50u64 {
            rcu.update(|_| Some(value));
            rcu.synchronize();
            // After a grace period the reader can only see the new value
            thread::sleep(Duration::from_micros(50));
            assert!(seen.load(Ordering::SeqCst) >= value - 1);
        }

        stop.store(true, Ordering::SeqCst);
        reader_thread.join().unwrap();
        assert_eq!(rcu.retired_len(), 0);
    }

    #[test]
    fn test_try_update_busy_writer() {
        let rcu = Rcu::new(0u32);
        let guard = rcu.lock_writer();
        assert_eq!(rcu.try_update(|v| Some(v + 1)), None);
        drop(guard);
        assert_eq!(rcu.try_update(|v| Some(v + 1)), Some(true));
        assert_eq!(rcu.with_current(|v| *v), 1);
    }
}
