#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use fluxswitch::{Completion, Packet, Port, PortBroken};
use fluxswitch_proto::MacAddr;

pub const BROADCAST: [u8; 6] = [0xff; 6];

pub fn mac(n: u8) -> [u8; 6] {
    [0x02, 0, 0, 0, 0, n]
}

pub fn mac_addr(n: u8) -> MacAddr {
    MacAddr::new(mac(n))
}

/// Ethernet frame padded to the 60 byte minimum.
pub fn frame(dst: [u8; 6], src: [u8; 6], payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(60.max(14 + payload.len()));
    frame.extend_from_slice(&dst);
    frame.extend_from_slice(&src);
    frame.extend_from_slice(&0x0800u16.to_be_bytes());
    frame.extend_from_slice(payload);
    if frame.len() < 60 {
        frame.resize(60, 0);
    }
    frame
}

/// Poll `cond` until it holds or a few seconds pass.
pub fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    cond()
}

/// In-memory port: frames are injected by the test and received frames
/// are captured.
pub struct TestPort {
    name: String,
    pending: Mutex<VecDeque<Vec<u8>>>,
    in_flight: Mutex<HashMap<u64, Box<[u8]>>>,
    next_token: AtomicU64,
    received: Mutex<Vec<Vec<u8>>>,
    completed: AtomicUsize,
    fail_receive: AtomicBool,
    fail_done: AtomicBool,
}

impl TestPort {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            pending: Mutex::new(VecDeque::new()),
            in_flight: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
            received: Mutex::new(Vec::new()),
            completed: AtomicUsize::new(0),
            fail_receive: AtomicBool::new(false),
            fail_done: AtomicBool::new(false),
        })
    }

    pub fn inject(&self, frame: Vec<u8>) {
        self.pending.lock().unwrap().push_back(frame);
    }

    pub fn received(&self) -> Vec<Vec<u8>> {
        self.received.lock().unwrap().clone()
    }

    pub fn received_count(&self) -> usize {
        self.received.lock().unwrap().len()
    }

    pub fn take_received(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut *self.received.lock().unwrap())
    }

    /// Packets retired through `mark_done`.
    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    /// Packets polled but not yet retired.
    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().unwrap().len()
    }

    pub fn fail_on_receive(&self) {
        self.fail_receive.store(true, Ordering::SeqCst);
    }

    /// Retire packets but report failure, as if the peer had gone away.
    pub fn fail_on_mark_done(&self) {
        self.fail_done.store(true, Ordering::SeqCst);
    }
}

impl Port for TestPort {
    fn name(&self) -> &str {
        &self.name
    }

    fn poll(&self, packet: &mut Packet, _enable_notifications: bool) -> Result<bool, PortBroken> {
        let Some(frame) = self.pending.lock().unwrap().pop_front() else {
            return Ok(false);
        };
        let mut frame = frame.into_boxed_slice();
        let token = self.next_token.fetch_add(1, Ordering::SeqCst);
        let ptr = NonNull::new(frame.as_mut_ptr()).ok_or_else(|| PortBroken::new("empty frame"))?;
        unsafe { packet.push_fragment(ptr, frame.len() as u32)? };
        packet.set_completion(Completion::Token(token));
        self.in_flight.lock().unwrap().insert(token, frame);
        Ok(true)
    }

    fn receive(&self, packet: &Packet) -> Result<(), PortBroken> {
        if self.fail_receive.load(Ordering::SeqCst) {
            return Err(PortBroken::new("receive refused"));
        }
        let mut copy = vec![0u8; packet.len()];
        packet.copy_to(&mut copy);
        self.received.lock().unwrap().push(copy);
        Ok(())
    }

    fn mark_done(&self, packet: &Packet) -> Result<(), PortBroken> {
        let Completion::Token(token) = packet.completion() else {
            return Err(PortBroken::new("foreign completion"));
        };
        if self.in_flight.lock().unwrap().remove(&token).is_none() {
            return Err(PortBroken::new("packet completed twice"));
        }
        if self.fail_done.load(Ordering::SeqCst) {
            return Err(PortBroken::new("completion refused"));
        }
        self.completed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
