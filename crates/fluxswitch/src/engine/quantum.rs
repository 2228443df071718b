use std::ptr;
use std::sync::{Arc, Weak};

use tracing::{debug, trace, warn};

use crate::engine::mac_table::{Learned, PortIndex};
use crate::engine::runner::Generation;
use crate::error::PortBroken;
use crate::packet::Packet;
use crate::port::{same_port, Port};

/// A port that failed during a quantum and has to be detached.
pub struct BrokenPort {
    pub port: Arc<dyn Port>,
    pub cause: PortBroken,
}

impl std::fmt::Debug for BrokenPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokenPort").field("port", &self.port.name()).field("cause", &self.cause).finish()
    }
}

impl BrokenPort {
    fn new(port: &Arc<dyn Port>, cause: PortBroken) -> Self {
        Self { port: port.clone(), cause }
    }
}

/// Hands the packet back to its source port when switching is over, even
/// if forwarding unwinds.
struct CompletionGuard<'a> {
    port: &'a Arc<dyn Port>,
    packet: &'a Packet,
    armed: bool,
}

impl<'a> CompletionGuard<'a> {
    fn new(port: &'a Arc<dyn Port>, packet: &'a Packet) -> Self {
        Self { port, packet, armed: true }
    }

    fn finish(mut self) -> Result<(), BrokenPort> {
        self.armed = false;
        self.port.mark_done(self.packet).map_err(|cause| BrokenPort::new(self.port, cause))
    }
}

impl Drop for CompletionGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = self.port.mark_done(self.packet) {
                warn!(port = %self.port.name(), reason = %e, "completing packet failed");
            }
        }
    }
}

/// Per-loop scratch state: the packet buffer and the ports waiting to be
/// detached.
///
/// Quarantined ports are held weakly: whoever owns a port drops it, never
/// the loop.
pub struct QuantumContext {
    packet: Packet,
    batch_size: usize,
    quarantine: Vec<Weak<dyn Port>>,
}

impl QuantumContext {
    pub fn new(batch_size: usize) -> Self {
        Self { packet: Packet::new(), batch_size, quarantine: Vec::new() }
    }

    /// Skip `port` from now on until it is detached.
    pub fn quarantine(&mut self, port: &Arc<dyn Port>) {
        if !self.is_quarantined(port) {
            self.quarantine.push(Arc::downgrade(port));
        }
    }

    pub fn has_quarantine(&self) -> bool {
        !self.quarantine.is_empty()
    }

    pub fn release_quarantine(&mut self) {
        self.quarantine.clear();
    }

    #[inline]
    pub fn is_quarantined(&self, port: &Arc<dyn Port>) -> bool {
        !self.quarantine.is_empty()
            && self.quarantine.iter().any(|p| ptr::addr_eq(p.as_ptr(), Arc::as_ptr(port)))
    }

    /// Poll every port for up to `batch_size` packets and switch each one,
    /// then flush deferred interrupts. Returns whether any packet was seen.
    /// On error the quantum stops and every port that failed is returned.
    pub fn work_quantum(&mut self, generation: &Generation, enable_notifications: bool) -> Result<bool, Vec<BrokenPort>> {
        let mut work_done = false;

        for (index, port) in generation.ports.iter().enumerate() {
            if self.is_quarantined(port) {
                continue;
            }
            for _ in 0..self.batch_size {
                self.packet.clear();
                let polled = port
                    .poll(&mut self.packet, enable_notifications)
                    .map_err(|cause| vec![BrokenPort::new(port, cause)])?;
                if !polled {
                    break;
                }
                work_done = true;
                self.switch_packet(generation, index)?;
            }
        }

        for port in &generation.ports {
            if self.is_quarantined(port) {
                continue;
            }
            port.poll_irq().map_err(|cause| vec![BrokenPort::new(port, cause)])?;
        }

        Ok(work_done)
    }

    /// Learn, look up and forward the packet polled from port `src`, then
    /// hand it back to `src`. Both a failed delivery and a failed hand-back
    /// are reported.
    fn switch_packet(&self, generation: &Generation, src: usize) -> Result<(), Vec<BrokenPort>> {
        let source = &generation.ports[src];
        let done = CompletionGuard::new(source, &self.packet);
        let delivered = self.forward(generation, src);
        match (delivered, done.finish()) {
            (Ok(()), Ok(())) => Ok(()),
            (Err(broken), Ok(())) | (Ok(()), Err(broken)) => Err(vec![broken]),
            (Err(dst), Err(source)) => Err(vec![dst, source]),
        }
    }

    fn forward(&self, generation: &Generation, src: usize) -> Result<(), BrokenPort> {
        let packet = &self.packet;
        let source = &generation.ports[src];

        let Some(eth) = packet.ethernet_header() else {
            trace!(port = %source.name(), len = packet.len(), "dropping runt frame");
            return Ok(());
        };

        if !eth.src.is_multicast() {
            match generation.mac_table.insert(&eth.src, src as PortIndex) {
                Learned::New => debug!(mac = %eth.src, port = %source.name(), "learned address"),
                Learned::Moved { from } => {
                    let from = generation.ports.get(from as usize).map(|p| p.name()).unwrap_or("?");
                    debug!(mac = %eth.src, from = %from, to = %source.name(), "address moved");
                }
                Learned::Refreshed => {}
            }
        }

        // A hit on the source itself or on a port about to be detached
        // floods like a miss.
        let target = if eth.dst.is_multicast() {
            None
        } else {
            generation
                .mac_table
                .lookup(&eth.dst)
                .map(usize::from)
                .filter(|&dst| dst != src)
                .and_then(|dst| generation.ports.get(dst))
                .filter(|port| !self.is_quarantined(port))
        };

        if let Some(port) = target {
            return port.receive(packet).map_err(|cause| BrokenPort::new(port, cause));
        }

        for (index, port) in generation.ports.iter().enumerate() {
            if index == src || self.is_quarantined(port) {
                continue;
            }
            port.receive(packet).map_err(|cause| BrokenPort::new(port, cause))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::io::{self, Write};
    use std::ptr::NonNull;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    use crate::packet::Completion;

    const BROADCAST: [u8; 6] = [0xff; 6];

    fn mac(n: u8) -> [u8; 6] {
        [0x02, 0, 0, 0, 0, n]
    }

    fn frame(dst: [u8; 6], src: [u8; 6]) -> Vec<u8> {
        let mut frame = vec![0u8; 60];
        frame[..6].copy_from_slice(&dst);
        frame[6..12].copy_from_slice(&src);
        frame
    }

    /// One packet in flight at a time, completed through an opaque token.
    #[derive(Default)]
    struct Wire {
        name: &'static str,
        pending: Mutex<VecDeque<Vec<u8>>>,
        in_flight: Mutex<Option<Box<[u8]>>>,
        received: AtomicUsize,
        refuse_receive: AtomicBool,
        refuse_done: AtomicBool,
    }

    impl Wire {
        fn new(name: &'static str) -> Arc<Self> {
            Arc::new(Self { name, ..Default::default() })
        }

        fn inject(&self, frame: Vec<u8>) {
            self.pending.lock().unwrap().push_back(frame);
        }

        fn received(&self) -> usize {
            self.received.load(Ordering::SeqCst)
        }
    }

    impl Port for Wire {
        fn name(&self) -> &str {
            self.name
        }

        fn poll(&self, packet: &mut Packet, _enable_notifications: bool) -> Result<bool, PortBroken> {
            let Some(frame) = self.pending.lock().unwrap().pop_front() else {
                return Ok(false);
            };
            let mut frame = frame.into_boxed_slice();
            let ptr = NonNull::new(frame.as_mut_ptr()).ok_or_else(|| PortBroken::new("empty"))?;
            unsafe { packet.push_fragment(ptr, frame.len() as u32)? };
            packet.set_completion(Completion::Token(7));
            *self.in_flight.lock().unwrap() = Some(frame);
            Ok(true)
        }

        fn receive(&self, _packet: &Packet) -> Result<(), PortBroken> {
            if self.refuse_receive.load(Ordering::SeqCst) {
                return Err(PortBroken::new("receive refused"));
            }
            self.received.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn mark_done(&self, packet: &Packet) -> Result<(), PortBroken> {
            assert_eq!(packet.completion(), Completion::Token(7));
            self.in_flight.lock().unwrap().take();
            if self.refuse_done.load(Ordering::SeqCst) {
                return Err(PortBroken::new("completion refused"));
            }
            Ok(())
        }
    }

    fn generation(ports: &[&Arc<Wire>]) -> Generation {
        Generation::with_ports(ports.iter().map(|p| (*p).clone() as Arc<dyn Port>).collect())
    }

    fn broken_names(broken: &[BrokenPort]) -> Vec<&str> {
        broken.iter().map(|b| b.port.name()).collect()
    }

    #[test]
    fn test_unicast_to_quarantined_port_floods() {
        let (a, b, c) = (Wire::new("a"), Wire::new("b"), Wire::new("c"));
        let generation = generation(&[&a, &b, &c]);
        let mut ctx = QuantumContext::new(32);

        // 1. b is learned, then quarantined
        b.inject(frame(BROADCAST, mac(2)));
        assert!(ctx.work_quantum(&generation, false).unwrap());
        assert_eq!((a.received(), c.received()), (1, 1));
        ctx.quarantine(&generation.ports[1]);

        // 2. Unicast to b now reaches everyone else instead
        a.inject(frame(mac(2), mac(1)));
        assert!(ctx.work_quantum(&generation, false).unwrap());
        assert_eq!(b.received(), 0);
        assert_eq!(c.received(), 2);
    }

    #[test]
    fn test_failed_delivery_and_completion_both_reported() {
        let (a, b) = (Wire::new("a"), Wire::new("b"));
        let generation = generation(&[&a, &b]);
        let mut ctx = QuantumContext::new(32);

        a.refuse_done.store(true, Ordering::SeqCst);
        b.refuse_receive.store(true, Ordering::SeqCst);
        a.inject(frame(BROADCAST, mac(1)));

        let broken = ctx.work_quantum(&generation, false).err().unwrap();
        assert_eq!(broken_names(&broken), vec!["b", "a"]);
        assert!(a.in_flight.lock().unwrap().is_none());
    }

    #[test]
    fn test_failed_completion_alone_reported() {
        let (a, b) = (Wire::new("a"), Wire::new("b"));
        let generation = generation(&[&a, &b]);
        let mut ctx = QuantumContext::new(32);

        a.refuse_done.store(true, Ordering::SeqCst);
        a.inject(frame(BROADCAST, mac(1)));

        let broken = ctx.work_quantum(&generation, false).err().unwrap();
        assert_eq!(broken_names(&broken), vec!["a"]);
        assert_eq!(b.received(), 1);
    }

    #[test]
    fn test_quarantine_does_not_keep_port_alive() {
        let a = Wire::new("a");
        let port: Arc<dyn Port> = a.clone();
        let mut ctx = QuantumContext::new(1);
        ctx.quarantine(&port);
        ctx.quarantine(&port);
        assert!(ctx.is_quarantined(&port));
        drop(port);
        assert_eq!(Arc::strong_count(&a), 1);
    }

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_flapping_address_stays_below_info() {
        let (a, b) = (Wire::new("a"), Wire::new("b"));
        let generation = generation(&[&a, &b]);
        let mut ctx = QuantumContext::new(32);

        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .with_writer(move || writer.clone())
            .finish();

        // The same source keeps hopping between the two ports
        tracing::subscriber::with_default(subscriber, || {
            for _ in 0..100 {
                a.inject(frame(BROADCAST, mac(9)));
                b.inject(frame(BROADCAST, mac(9)));
                ctx.work_quantum(&generation, false).unwrap();
            }
        });

        assert_eq!(generation.mac_table.lookup(&fluxswitch_proto::MacAddr::new(mac(9))), Some(1));
        assert!(captured.0.lock().unwrap().is_empty());
    }
}
