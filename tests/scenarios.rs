//! End-to-end behaviour of the probe on single-threaded event sequences.

use portmon::probe::ManualClock;
use portmon::{
    ConnectionAccounting, MonitoredPorts, PortMonitor, PortStats, Probe, ProbeOptions, SockCommon,
};
use std::net::SocketAddrV4;
use std::sync::Arc;

fn sock(local: &str, remote: &str) -> SockCommon {
    let local: SocketAddrV4 = local.parse().unwrap();
    let remote: SocketAddrV4 = remote.parse().unwrap();
    SockCommon::from_endpoints(local, remote)
}

fn probe_on(ports: &[u16], options: ProbeOptions) -> Probe<Arc<ManualClock>> {
    let _ = env_logger::builder().is_test(true).try_init();
    let monitored = Arc::new(MonitoredPorts::from_ports(ports.iter().copied()).unwrap());
    Probe::with_clock(monitored, options, Arc::new(ManualClock::new(0))).unwrap()
}

#[test]
fn test_sums_match_event_sequence() {
    let probe = probe_on(&[8080, 443], ProbeOptions::default());
    let sockets = [
        sock("10.0.0.1:8080", "10.0.0.2:40000"),
        sock("10.0.0.1:8080", "10.0.0.3:40001"),
        sock("10.0.0.1:443", "10.0.0.4:40002"),
    ];

    let mut expected = std::collections::BTreeMap::<u16, PortStats>::new();
    for i in 0..300u64 {
        let s = &sockets[(i % 3) as usize];
        let port = s.skc_num;
        let entry = expected.entry(port).or_insert_with(|| PortStats::empty(port));
        if i % 2 == 0 {
            probe.on_send(Some(s), i + 1);
            entry.tx_bytes += i + 1;
            entry.tx_packets += 1;
        } else {
            probe.on_receive(Some(s), (i + 1) as i64);
            entry.rx_bytes += i + 1;
            entry.rx_packets += 1;
        }
    }
    expected.get_mut(&8080).unwrap().connections = 2;
    expected.get_mut(&443).unwrap().connections = 1;

    assert_eq!(probe.port_stats(), expected.into_values().collect::<Vec<_>>());

    let conn_total: u64 = probe
        .connections()
        .iter()
        .map(|c| c.rx_bytes + c.tx_bytes)
        .sum();
    assert_eq!(conn_total, (1..=300).sum::<u64>());
}

#[test]
fn test_unmonitored_traffic_leaves_no_trace() {
    let probe = probe_on(&[8080], ProbeOptions::default());
    for i in 0..1_000u16 {
        let s = sock("10.0.0.1:9000", &format!("10.0.0.2:{}", 20_000 + i));
        probe.on_send(Some(&s), 1_000);
        probe.on_receive(Some(&s), 1_000);
    }
    assert!(probe.port_stats().is_empty());
    assert!(probe.connections().is_empty());
    assert_eq!(probe.occupancy(), (0, 0));
}

#[test]
fn test_discard_path_is_idempotent() {
    let probe = probe_on(&[8080], ProbeOptions::default());
    let s = sock("10.0.0.1:8080", "10.0.0.2:40000");
    probe.on_send(Some(&s), 10);
    let before = probe.snapshot();

    for _ in 0..100 {
        probe.on_send(Some(&s), 0);
        probe.on_receive(Some(&s), 0);
        probe.on_receive(Some(&s), -1);
        probe.on_send(Some(&sock("10.0.0.1:1", "10.0.0.2:2")), 5);
    }

    let after = probe.snapshot();
    assert_eq!(before.ports, after.ports);
    assert_eq!(before.connections, after.connections);
}

#[test]
fn test_port_capacity_boundary() {
    let ports: Vec<u16> = (1..=64).map(|p| 10_000 + p).collect();
    let mut all = ports.clone();
    all.truncate(63);
    let monitored = Arc::new(MonitoredPorts::from_ports(all).unwrap());
    let probe = Probe::attach(Arc::clone(&monitored), ProbeOptions::default()).unwrap();

    // 64 monitored ports fill the port table exactly
    monitored.insert(ports[63]).unwrap();
    for port in &ports {
        probe.on_send(Some(&sock(&format!("10.0.0.1:{}", port), "10.0.0.2:40000")), 1);
    }
    assert_eq!(probe.port_stats().len(), 64);

    // A 65th port cannot be monitored, and the port table has no room either
    assert!(monitored.insert(20_000).is_err());
    let options = ProbeOptions {
        port_capacity: 64,
        ..Default::default()
    };
    let wide = Arc::new(MonitoredPorts::with_capacity(128));
    for port in 1..=65u16 {
        wide.insert(port).unwrap();
    }
    let probe = Probe::attach(wide, options).unwrap();
    for port in 1..=65u16 {
        probe.on_send(Some(&sock(&format!("10.0.0.1:{}", port), "10.0.0.2:40000")), 1);
    }
    assert_eq!(probe.port_stats().len(), 64);
    assert!(probe.port(65).is_none());
    assert_eq!(probe.metrics().port_table_full.value(), 1);
    assert_eq!(probe.connections().len(), 65);
}

#[test]
fn test_connection_capacity_boundary() {
    let probe = probe_on(&[8080], ProbeOptions::default());
    for i in 0..10_241u32 {
        let remote = format!("10.{}.{}.{}:40000", (i >> 16) & 0xff, (i >> 8) & 0xff, i & 0xff);
        probe.on_send(Some(&sock("10.0.0.1:8080", &remote)), 1);
    }

    assert_eq!(probe.connections().len(), 10_240);
    let stats = probe.port(8080).unwrap();
    assert_eq!(stats.tx_bytes, 10_241);
    assert_eq!(stats.connections, 10_240);
    assert_eq!(probe.metrics().connection_table_full.value(), 1);
}

#[test]
fn test_server_send_then_receive() {
    let probe = probe_on(&[8080], ProbeOptions::default());
    let s = sock("10.0.0.1:8080", "10.0.0.2:40000");

    probe.on_send(Some(&s), 100);
    probe.on_receive(Some(&s), 50);

    assert_eq!(
        probe.port_stats(),
        vec![PortStats {
            port: 8080,
            rx_bytes: 50,
            tx_bytes: 100,
            rx_packets: 1,
            tx_packets: 1,
            connections: 1,
        }]
    );
    let conn = probe.connection(&s.key()).unwrap();
    assert_eq!((conn.tx_bytes, conn.rx_bytes), (100, 50));
    assert!(conn.start_ns <= conn.last_update_ns);
}

#[test]
fn test_both_ends_of_loopback_connection() {
    let probe = probe_on(&[8080], ProbeOptions::default());
    let server = sock("127.0.0.1:8080", "127.0.0.1:40000");
    let client = sock("127.0.0.1:40000", "127.0.0.1:8080");

    probe.on_send(Some(&client), 10);
    probe.on_receive(Some(&server), 10);
    probe.on_send(Some(&server), 20);
    probe.on_receive(Some(&client), 20);

    let stats = probe.port(8080).unwrap();
    assert_eq!(stats.connections, 2);
    assert_eq!(stats.tx_bytes, 30);
    assert_eq!(stats.rx_bytes, 30);
    assert_eq!(probe.connections().len(), 2);
}

#[test]
fn test_accounting_modes_agree_without_races() {
    for accounting in [ConnectionAccounting::Exact, ConnectionAccounting::CheckThenStore] {
        let options = ProbeOptions {
            accounting,
            ..Default::default()
        };
        let probe = probe_on(&[8080], options);
        for i in 0..50u16 {
            let s = sock("10.0.0.1:8080", &format!("10.0.0.2:{}", 30_000 + i % 5));
            probe.on_send(Some(&s), 1);
        }
        assert_eq!(probe.port(8080).unwrap().connections, 5);
        assert_eq!(probe.metrics().connection_overwrites.value(), 0);
    }
}

#[test]
fn test_monitor_lifecycle() {
    let mut monitor = PortMonitor::with_ports([8080], ProbeOptions::default()).unwrap();
    let probe = monitor.attach().unwrap();
    probe.on_send(Some(&sock("10.0.0.1:8080", "10.0.0.2:40000")), 100);
    drop(probe);

    let snapshot = monitor.detach().unwrap();
    assert_eq!(snapshot.ports.len(), 1);
    assert_eq!(snapshot.connections.len(), 1);
}

#[tokio::test]
async fn test_collector_reports_rates() {
    let mut monitor = PortMonitor::with_ports([8080], ProbeOptions::default()).unwrap();
    let probe = monitor.attach().unwrap();
    let collector = portmon::Collector::new(Arc::clone(&probe));

    collector.collect().await;
    probe.on_send(Some(&sock("10.0.0.1:8080", "10.0.0.2:40000")), 4096);
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    collector.collect().await;

    let rates = collector.stats(8080).await;
    assert_eq!(rates.stats.tx_bytes, 4096);
    assert!(rates.tx_rate > 0.0);
    assert_eq!(rates.active_connections, 1);
}
