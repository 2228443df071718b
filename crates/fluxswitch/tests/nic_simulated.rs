mod common;

#[cfg(feature = "simulator")]
mod nic_simulated {
    use std::sync::Arc;
    use std::thread;

    use crate::common::{frame, mac, wait_for, TestPort, BROADCAST};
    use fluxswitch::port::{self, EnabledPort, NicPort};
    use fluxswitch::simulator::SimulatedNic;
    use fluxswitch::{Poller, Switch, SwitchBuilder};

    const FRAME_SIZE: u32 = 2048;

    fn nic_port(switch: &Arc<Switch>) -> (EnabledPort<NicPort<SimulatedNic>>, Arc<SimulatedNic>) {
        let nic = Arc::new(SimulatedNic::new());
        let port = NicPort::new("nic0", nic.clone(), 8, 8, FRAME_SIZE, switch.notifier()).unwrap();
        (port::enable(switch, Arc::new(port)).unwrap(), nic)
    }

    #[test]
    fn test_frames_cross_between_nic_and_port() {
        let switch = SwitchBuilder::new().build().unwrap();
        let (_nic_port, nic) = nic_port(&switch);
        let wire = port::enable(&switch, TestPort::new("wire")).unwrap();

        // 1. A frame from the wire is switched and its slot handed back
        let inbound = frame(BROADCAST, mac(1), b"from the nic");
        assert!(nic.inject(&inbound, FRAME_SIZE as usize));
        assert!(switch.process_quantum(false).unwrap());
        assert_eq!(wire.received(), vec![inbound]);
        assert_eq!(nic.rx_tail(), 0);

        // 2. A frame spread over two descriptors arrives whole
        let mut jumbo = frame(BROADCAST, mac(1), &[]);
        jumbo.resize(3000, 0xab);
        assert!(nic.inject(&jumbo, FRAME_SIZE as usize));
        switch.process_quantum(false).unwrap();
        assert_eq!(wire.take_received().pop(), Some(jumbo));
        assert_eq!(nic.rx_tail(), 2);

        // 3. Unicast to the learned address goes out on the next doorbell
        let outbound = frame(mac(1), mac(2), b"to the nic");
        wire.inject(outbound.clone());
        assert!(nic.transmit().is_empty());
        switch.process_quantum(false).unwrap();
        assert_eq!(nic.transmit(), vec![outbound]);
        assert_eq!(wire.completed(), 1);
    }

    #[test]
    fn test_nic_wakes_sleeping_switch() {
        let switch = SwitchBuilder::new().poller(Poller::Wait).build().unwrap();
        let (_nic_port, nic) = nic_port(&switch);
        let wire = port::enable(&switch, TestPort::new("wire")).unwrap();

        let runner = {
            let switch = switch.clone();
            thread::spawn(move || switch.run())
        };

        // Ring size 8 means the loop has to keep re-posting slots
        for round in 0..20u8 {
            let data = frame(BROADCAST, mac(1), &[round]);
            assert!(wait_for(|| nic.inject(&data, FRAME_SIZE as usize)));
            assert!(wait_for(|| wire.received_count() == usize::from(round) + 1));
        }

        switch.shutdown();
        runner.join().unwrap().unwrap();
        let rounds: Vec<u8> = wire.received().iter().map(|f| f[14]).collect();
        assert_eq!(rounds, (0..20).collect::<Vec<u8>>());
    }
}
