mod common;

use std::sync::Arc;
use std::thread;

use common::{frame, mac, mac_addr, wait_for, TestPort, BROADCAST};
use fluxswitch::port::{self, EnabledPort};
use fluxswitch::{Poller, Switch, SwitchBuilder};

fn switch_with(names: &[&str]) -> (Arc<Switch>, Vec<EnabledPort<TestPort>>) {
    let switch = SwitchBuilder::new().build().expect("switch");
    let ports = names.iter().map(|n| port::enable(&switch, TestPort::new(n)).expect("attach")).collect();
    (switch, ports)
}

#[test]
fn test_flood_then_learned_unicast() {
    let (switch, ports) = switch_with(&["a", "b", "c"]);
    let (a, b, c) = (&ports[0], &ports[1], &ports[2]);

    // 1. Unknown destination: flooded to everyone but the source
    let first = frame(mac(2), mac(1), b"hello");
    a.inject(first.clone());
    assert!(switch.process_quantum(false).unwrap());
    assert_eq!(b.received(), vec![first.clone()]);
    assert_eq!(c.received(), vec![first]);
    assert_eq!(a.received_count(), 0);
    assert_eq!(a.completed(), 1);

    // 2. The reply goes only to the learned port
    let reply = frame(mac(1), mac(2), b"world");
    b.inject(reply.clone());
    assert!(switch.process_quantum(false).unwrap());
    assert_eq!(a.received(), vec![reply]);
    assert_eq!(c.received_count(), 1);
    assert_eq!(b.completed(), 1);

    assert_eq!(switch.lookup(&mac_addr(1)).map(|p| p.name().to_string()), Some("a".to_string()));
    assert_eq!(switch.lookup(&mac_addr(2)).map(|p| p.name().to_string()), Some("b".to_string()));

    // 3. Nothing left to do
    assert!(!switch.process_quantum(false).unwrap());
}

#[test]
fn test_multicast_destinations_always_flood() {
    let (switch, ports) = switch_with(&["a", "b", "c"]);

    // 1. Both ends are learned
    ports[1].inject(frame(mac(1), mac(9), b""));
    switch.process_quantum(false).unwrap();

    // 2. Broadcast still reaches every other port
    ports[0].inject(frame(BROADCAST, mac(1), b"arp"));
    switch.process_quantum(false).unwrap();
    assert_eq!(ports[1].received_count(), 1);
    assert_eq!(ports[2].received_count(), 2);
    assert_eq!(ports[0].received_count(), 1);
}

#[test]
fn test_multicast_source_is_not_learned() {
    let (switch, ports) = switch_with(&["a", "b"]);
    let group = [0x01, 0x00, 0x5e, 0, 0, 1];
    ports[0].inject(frame(BROADCAST, group, b""));
    switch.process_quantum(false).unwrap();
    assert!(switch.lookup(&fluxswitch_proto::MacAddr::new(group)).is_none());
}

#[test]
fn test_runt_frame_is_completed_not_forwarded() {
    let (switch, ports) = switch_with(&["a", "b"]);
    ports[0].inject(vec![0xff; 10]);
    assert!(switch.process_quantum(false).unwrap());
    assert_eq!(ports[1].received_count(), 0);
    assert_eq!(ports[0].completed(), 1);
    assert_eq!(ports[0].in_flight(), 0);
}

#[test]
fn test_broken_destination_is_detached_and_source_completed() {
    let (switch, ports) = switch_with(&["a", "b", "c"]);
    ports[2].fail_on_receive();

    // 1. Flooding hits the broken port
    ports[0].inject(frame(BROADCAST, mac(1), b""));
    assert!(switch.process_quantum(false).unwrap());
    assert_eq!(ports[0].completed(), 1);
    assert_eq!(ports[0].in_flight(), 0);

    // 2. It is gone, the others keep working
    let names: Vec<String> = switch.ports().iter().map(|p| p.name().to_string()).collect();
    assert_eq!(names.len(), 2);
    assert!(!names.contains(&"c".to_string()));

    ports[1].inject(frame(BROADCAST, mac(2), b""));
    switch.process_quantum(false).unwrap();
    assert_eq!(ports[0].received_count(), 1);
    assert_eq!(ports[1].completed(), 1);
}

#[test]
fn test_source_failing_completion_is_detached_with_broken_destination() {
    let (switch, ports) = switch_with(&["a", "b", "c"]);
    ports[0].fail_on_mark_done();
    ports[2].fail_on_receive();

    // 1. Delivery to c fails and handing the packet back to a fails too
    ports[0].inject(frame(BROADCAST, mac(1), b""));
    assert!(switch.process_quantum(false).unwrap());
    assert_eq!(ports[0].in_flight(), 0);

    // 2. Both are detached in one go
    let names: Vec<String> = switch.ports().iter().map(|p| p.name().to_string()).collect();
    assert_eq!(names, vec!["b".to_string()]);
}

#[test]
fn test_source_failing_completion_is_detached() {
    let (switch, ports) = switch_with(&["a", "b"]);
    ports[0].fail_on_mark_done();

    ports[0].inject(frame(BROADCAST, mac(1), b""));
    switch.process_quantum(false).unwrap();
    assert_eq!(ports[1].received_count(), 1);
    let names: Vec<String> = switch.ports().iter().map(|p| p.name().to_string()).collect();
    assert_eq!(names, vec!["b".to_string()]);
}

#[test]
fn test_attach_starts_with_empty_table() {
    let (switch, mut ports) = switch_with(&["a", "b"]);
    ports[0].inject(frame(BROADCAST, mac(1), b""));
    switch.process_quantum(false).unwrap();
    assert!(switch.lookup(&mac_addr(1)).is_some());

    ports.push(port::enable(&switch, TestPort::new("c")).unwrap());
    assert!(switch.lookup(&mac_addr(1)).is_none());
    assert_eq!(switch.ports()[0].name(), "c");
}

#[test]
fn test_attach_twice_is_noop() {
    let switch = SwitchBuilder::new().build().unwrap();
    let port = TestPort::new("a");
    let _first = port::enable(&switch, port.clone()).unwrap();
    switch.attach_port(port.clone()).unwrap();
    assert_eq!(switch.ports().len(), 1);
}

#[test]
fn test_batch_size_limits_packets_per_quantum() {
    let switch = SwitchBuilder::new().batch_size(2).build().unwrap();
    let a = port::enable(&switch, TestPort::new("a")).unwrap();
    let b = port::enable(&switch, TestPort::new("b")).unwrap();
    for i in 0..5 {
        a.inject(frame(BROADCAST, mac(1), &[i]));
    }

    switch.process_quantum(false).unwrap();
    assert_eq!(b.received_count(), 2);
    switch.process_quantum(false).unwrap();
    assert_eq!(b.received_count(), 4);

    // Order from one source is preserved
    switch.process_quantum(false).unwrap();
    let payloads: Vec<u8> = b.received().iter().map(|f| f[14]).collect();
    assert_eq!(payloads, vec![0, 1, 2, 3, 4]);
}

#[test]
fn test_disabled_port_no_longer_receives() {
    let (switch, mut ports) = switch_with(&["a", "b", "c"]);
    let c = ports.pop().unwrap();
    let c_port = c.port().clone();
    c.disable();

    ports[0].inject(frame(BROADCAST, mac(1), b""));
    switch.process_quantum(false).unwrap();
    assert_eq!(ports[1].received_count(), 1);
    assert_eq!(c_port.received_count(), 0);
    assert_eq!(switch.ports().len(), 2);
}

#[test]
fn test_run_loop_sleeps_and_wakes() {
    let switch = SwitchBuilder::new().poller(Poller::Wait).build().unwrap();
    let a = port::enable(&switch, TestPort::new("a")).unwrap();
    let b = port::enable(&switch, TestPort::new("b")).unwrap();

    let runner = {
        let switch = switch.clone();
        thread::spawn(move || switch.run())
    };

    // 1. Work arriving while the loop sleeps is picked up after a wakeup
    for round in 0..3u8 {
        a.inject(frame(BROADCAST, mac(1), &[round]));
        switch.schedule_poll();
        assert!(wait_for(|| b.received_count() == usize::from(round) + 1));
    }

    // 2. Shutdown ends the loop
    switch.shutdown();
    runner.join().unwrap().unwrap();
    assert_eq!(a.completed(), 3);
}
