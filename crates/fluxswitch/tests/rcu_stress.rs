mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};

use common::{frame, mac, wait_for, TestPort, BROADCAST};
use fluxswitch::engine::Rcu;
use fluxswitch::port;
use fluxswitch::{Packet, Poller, Port, PortBroken, SwitchBuilder};

const GENERATIONS: usize = 2000;

struct Tracked {
    id: usize,
    freed: Arc<Vec<AtomicBool>>,
}

impl Drop for Tracked {
    fn drop(&mut self) {
        assert!(!self.freed[self.id].swap(true, Ordering::SeqCst), "freed twice");
    }
}

#[test]
fn test_reader_never_sees_freed_value() {
    let freed: Arc<Vec<AtomicBool>> = Arc::new((0..=GENERATIONS).map(|_| AtomicBool::new(false)).collect());
    let rcu = Arc::new(Rcu::new(Tracked { id: 0, freed: freed.clone() }));
    let stop = Arc::new(AtomicBool::new(false));

    let reader = {
        let (rcu, stop, freed) = (rcu.clone(), stop.clone(), freed.clone());
        thread::spawn(move || {
            let mut reader = rcu.reader().expect("single reader");
            let mut reads = 0u64;
            while !stop.load(Ordering::SeqCst) {
                let value = reader.read();
                let id = value.id;
                thread::yield_now();
                assert!(!freed[id].load(Ordering::SeqCst), "generation {id} freed while in use");
                assert_eq!(value.id, id);
                reader.quiescent();
                reads += 1;
            }
            reads
        })
    };

    // 1. Publish many generations, waiting for grace periods now and then
    for id in 1..=GENERATIONS {
        rcu.update(|_| Some(Tracked { id, freed: freed.clone() }));
        if id % 64 == 0 {
            rcu.synchronize();
        }
    }
    stop.store(true, Ordering::SeqCst);
    assert!(reader.join().unwrap() > 0);

    // 2. The current value is still alive, everything is freed with the container
    assert!(!freed[GENERATIONS].load(Ordering::SeqCst));
    drop(rcu);
    assert!(freed.iter().all(|f| f.load(Ordering::SeqCst)));
}

#[test]
fn test_port_churn_under_traffic() {
    let switch = SwitchBuilder::new().poller(Poller::Busy).build().unwrap();
    let src = port::enable(&switch, TestPort::new("src")).unwrap();
    let sink = port::enable(&switch, TestPort::new("sink")).unwrap();

    let runner = {
        let switch = switch.clone();
        thread::spawn(move || switch.run())
    };
    let churn = {
        let switch = switch.clone();
        thread::spawn(move || {
            for _ in 0..200 {
                let port = port::enable(&switch, TestPort::new("churn")).unwrap();
                thread::yield_now();
                port.disable();
            }
        })
    };

    const PACKETS: usize = 2000;
    for i in 0..PACKETS {
        src.inject(frame(BROADCAST, mac(1), &(i as u32).to_be_bytes()));
    }

    // 1. Every packet is delivered to the stable port and completed once
    assert!(wait_for(|| src.completed() == PACKETS));
    assert!(wait_for(|| sink.received_count() == PACKETS));
    churn.join().unwrap();
    assert_eq!(switch.ports().len(), 2);

    // 2. Delivery order from one source survives generation changes
    let order: Vec<u32> = sink
        .received()
        .iter()
        .map(|f| u32::from_be_bytes([f[14], f[15], f[16], f[17]]))
        .collect();
    assert!(order.windows(2).all(|w| w[0] < w[1]));

    switch.shutdown();
    runner.join().unwrap().unwrap();
    assert_eq!(src.in_flight(), 0);
}

/// Records calls that arrive after its owner disabled it, and the thread
/// it was dropped on.
struct WatchedPort {
    disabled: AtomicBool,
    late_calls: Arc<AtomicUsize>,
    dropped_on: Arc<Mutex<Vec<ThreadId>>>,
}

impl WatchedPort {
    fn check(&self) {
        if self.disabled.load(Ordering::SeqCst) {
            self.late_calls.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl Port for WatchedPort {
    fn name(&self) -> &str {
        "watched"
    }

    fn poll(&self, _packet: &mut Packet, _enable_notifications: bool) -> Result<bool, PortBroken> {
        self.check();
        Ok(false)
    }

    fn receive(&self, _packet: &Packet) -> Result<(), PortBroken> {
        self.check();
        Ok(())
    }

    fn mark_done(&self, _packet: &Packet) -> Result<(), PortBroken> {
        Err(PortBroken::new("never polls"))
    }
}

impl Drop for WatchedPort {
    fn drop(&mut self) {
        self.dropped_on.lock().unwrap().push(thread::current().id());
    }
}

#[test]
fn test_disabled_port_untouched_and_dropped_by_owner() {
    const ROUNDS: usize = 500;
    let switch = SwitchBuilder::new().poller(Poller::Busy).build().unwrap();
    let src = port::enable(&switch, TestPort::new("src")).unwrap();
    let late_calls = Arc::new(AtomicUsize::new(0));
    let dropped_on = Arc::new(Mutex::new(Vec::new()));

    let runner = {
        let switch = switch.clone();
        thread::spawn(move || switch.run())
    };
    let loop_thread = runner.thread().id();

    for round in 0..ROUNDS {
        // 1. Keep floods going so the port is both polled and delivered to
        src.inject(frame(BROADCAST, mac(1), &(round as u32).to_be_bytes()));
        let watched = Arc::new(WatchedPort {
            disabled: AtomicBool::new(false),
            late_calls: late_calls.clone(),
            dropped_on: dropped_on.clone(),
        });
        let enabled = port::enable(&switch, watched.clone()).unwrap();
        thread::yield_now();

        // 2. Once disable returns the loop is done with it and holds no reference
        enabled.disable();
        watched.disabled.store(true, Ordering::SeqCst);
        assert_eq!(Arc::strong_count(&watched), 1);
        drop(watched);
    }

    assert!(wait_for(|| src.completed() == ROUNDS));
    switch.shutdown();
    runner.join().unwrap().unwrap();

    assert_eq!(late_calls.load(Ordering::SeqCst), 0);
    let dropped_on = dropped_on.lock().unwrap();
    assert_eq!(dropped_on.len(), ROUNDS);
    assert!(dropped_on.iter().all(|id| *id != loop_thread));
}
