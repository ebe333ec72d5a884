//! The probe: owns the statistics stores and handles send/receive events.
//!
//! `on_send` and `on_receive` may be called from any number of threads at
//! once. They never block, never allocate and never report failure; every
//! condition they cannot account for is skipped.

use log::{info, warn};
use portmon_common::metrics::ProbeMetrics;
use portmon_common::types::{
    ConnectionAccounting, ConnectionKey, ConnectionStats, Direction, PortStats, ProbeSnapshot,
    SockCommon, MAX_CONNECTION_ENTRIES, MAX_PORT_ENTRIES,
};
use portmon_common::{Error, Result};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::clock::{Clock, MonotonicClock};
use crate::connections::{ConnectionStore, Observation};
use crate::membership::MonitoredPorts;
use crate::ports::PortAggregateStore;

/// Sizing and behaviour of a probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeOptions {
    /// Maximum number of per-port records
    pub port_capacity: usize,
    /// Maximum number of per-connection records
    pub connection_capacity: usize,
    /// How first observations of a connection are recorded
    pub accounting: ConnectionAccounting,
}

impl Default for ProbeOptions {
    fn default() -> Self {
        Self {
            port_capacity: MAX_PORT_ENTRIES,
            connection_capacity: MAX_CONNECTION_ENTRIES,
            accounting: ConnectionAccounting::Exact,
        }
    }
}

impl ProbeOptions {
    pub fn validate(&self) -> Result<()> {
        if self.port_capacity == 0 {
            return Err(Error::Config("port_capacity must be at least 1".into()));
        }
        if self.connection_capacity == 0 {
            return Err(Error::Config("connection_capacity must be at least 1".into()));
        }
        Ok(())
    }
}

/// Statistics engine fed by an external event source.
pub struct Probe<C: Clock = MonotonicClock> {
    monitored: Arc<MonitoredPorts>,
    ports: PortAggregateStore,
    connections: ConnectionStore,
    clock: C,
    metrics: ProbeMetrics,
    port_table_warned: AtomicBool,
    connection_table_warned: AtomicBool,
}

impl Probe<MonotonicClock> {
    /// Create the stores and start timestamps at zero.
    pub fn attach(monitored: Arc<MonitoredPorts>, options: ProbeOptions) -> Result<Self> {
        Self::with_clock(monitored, options, MonotonicClock::new())
    }
}

impl<C: Clock> Probe<C> {
    pub fn with_clock(monitored: Arc<MonitoredPorts>, options: ProbeOptions, clock: C) -> Result<Self> {
        options.validate()?;

        info!(
            "Attaching probe: {} port records, {} connection records, {} accounting",
            options.port_capacity, options.connection_capacity, options.accounting
        );

        Ok(Self {
            monitored,
            ports: PortAggregateStore::with_capacity(options.port_capacity),
            connections: ConnectionStore::with_capacity(
                options.connection_capacity,
                options.accounting,
            ),
            clock,
            metrics: ProbeMetrics::new(),
            port_table_warned: AtomicBool::new(false),
            connection_table_warned: AtomicBool::new(false),
        })
    }

    /// Data handed to the stack for sending on `sock`.
    #[inline]
    pub fn on_send(&self, sock: Option<&SockCommon>, size: u64) {
        if size == 0 {
            return;
        }
        self.account(sock, size, Direction::Tx);
    }

    /// Data copied to the application from `sock`'s receive queue.
    #[inline]
    pub fn on_receive(&self, sock: Option<&SockCommon>, copied: i64) {
        if copied <= 0 {
            return;
        }
        self.account(sock, copied as u64, Direction::Rx);
    }

    /// Pick the monitored port an event belongs to, local side first.
    #[inline]
    fn target_port(&self, key: &ConnectionKey) -> Option<u16> {
        if self.monitored.contains(key.local_port) {
            Some(key.local_port)
        } else if self.monitored.contains(key.remote_port) {
            Some(key.remote_port)
        } else {
            None
        }
    }

    fn account(&self, sock: Option<&SockCommon>, amount: u64, direction: Direction) {
        let Some(sock) = sock else {
            self.metrics.malformed_events.increment();
            return;
        };

        let key = sock.key();
        let Some(target) = self.target_port(&key) else {
            return;
        };

        let port = self.ports.get_or_create(target);
        match port {
            Some(counters) => counters.add_bytes(amount, direction),
            None => self.port_table_full(target),
        }

        let now = self.clock.now_ns();
        let observation = self.connections.observe(&key, amount, direction, now);
        match observation {
            Observation::Replaced => self.metrics.connection_overwrites.increment(),
            Observation::Dropped => self.connection_table_full(&key),
            Observation::Created | Observation::Updated => {}
        }

        if observation.is_new() {
            if let Some(counters) = port {
                counters.increment_connections();
            }
        }
    }

    #[cold]
    fn port_table_full(&self, port: u16) {
        self.metrics.port_table_full.increment();
        if !self.port_table_warned.swap(true, Ordering::Relaxed) {
            warn!(
                "Port table full ({} entries), traffic on port {} is not aggregated",
                self.ports.capacity(),
                port
            );
        }
    }

    #[cold]
    fn connection_table_full(&self, key: &ConnectionKey) {
        self.metrics.connection_table_full.increment();
        if !self.connection_table_warned.swap(true, Ordering::Relaxed) {
            warn!(
                "Connection table full ({} entries), dropping new connection {}",
                self.connections.capacity(),
                key
            );
        }
    }

    /// Aggregates of every observed port, ascending.
    pub fn port_stats(&self) -> Vec<PortStats> {
        self.ports.snapshot()
    }

    /// Aggregates of one port, if it has been observed.
    pub fn port(&self, port: u16) -> Option<PortStats> {
        self.ports.get(port).map(|counters| counters.snapshot(port))
    }

    /// Every tracked connection.
    pub fn connections(&self) -> Vec<ConnectionStats> {
        self.connections.snapshot()
    }

    /// One tracked connection.
    pub fn connection(&self, key: &ConnectionKey) -> Option<ConnectionStats> {
        self.connections.get(key)
    }

    /// Tracked connection records per currently monitored port. A record
    /// counts for each of its two ports that is monitored.
    pub fn active_connections(&self) -> BTreeMap<u16, u64> {
        let mut counts = BTreeMap::new();
        for key in self.connections.keys() {
            if self.monitored.contains(key.local_port) {
                *counts.entry(key.local_port).or_insert(0) += 1;
            }
            if self.monitored.contains(key.remote_port) {
                *counts.entry(key.remote_port).or_insert(0) += 1;
            }
        }
        counts
    }

    /// Zero the aggregates of `port`. Returns whether the port had a record.
    pub fn clear_port(&self, port: u16) -> bool {
        let cleared = self.ports.clear_port(port);
        if cleared {
            info!("Cleared statistics of port {}", port);
        }
        cleared
    }

    pub fn metrics(&self) -> &ProbeMetrics {
        &self.metrics
    }

    pub fn monitored(&self) -> &Arc<MonitoredPorts> {
        &self.monitored
    }

    pub fn accounting(&self) -> ConnectionAccounting {
        self.connections.accounting()
    }

    /// Number of port records and connection records in use.
    pub fn occupancy(&self) -> (usize, usize) {
        (self.ports.len(), self.connections.len())
    }

    pub fn snapshot(&self) -> ProbeSnapshot {
        ProbeSnapshot {
            ports: self.port_stats(),
            connections: self.connections(),
            metrics: self.metrics.snapshot(),
        }
    }

    /// Forget every record. Requires exclusive access, so no event can be
    /// in flight.
    pub fn reset(&mut self) {
        self.ports.clear();
        self.connections.clear();
        self.metrics.reset();
        *self.port_table_warned.get_mut() = false;
        *self.connection_table_warned.get_mut() = false;
        info!("Probe statistics reset");
    }

    /// Tear the probe down, returning what it had collected.
    pub fn detach(self) -> ProbeSnapshot {
        let snapshot = self.snapshot();
        info!(
            "Detaching probe: {} ports, {} connections",
            snapshot.ports.len(),
            snapshot.connections.len()
        );
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::net::SocketAddrV4;

    fn sock(local: &str, remote: &str) -> SockCommon {
        let local: SocketAddrV4 = local.parse().unwrap();
        let remote: SocketAddrV4 = remote.parse().unwrap();
        SockCommon::from_endpoints(local, remote)
    }

    fn probe(ports: &[u16]) -> Probe<Arc<ManualClock>> {
        let monitored = Arc::new(MonitoredPorts::from_ports(ports.iter().copied()).unwrap());
        let clock = Arc::new(ManualClock::new(1_000));
        Probe::with_clock(monitored, ProbeOptions::default(), clock).unwrap()
    }

    #[test]
    fn test_send_then_receive_on_monitored_port() {
        let probe = probe(&[8080]);
        let a = sock("10.0.0.1:8080", "10.0.0.2:40000");

        probe.on_send(Some(&a), 100);
        probe.on_receive(Some(&a), 50);

        assert_eq!(
            probe.port(8080).unwrap(),
            PortStats {
                port: 8080,
                rx_bytes: 50,
                tx_bytes: 100,
                rx_packets: 1,
                tx_packets: 1,
                connections: 1,
            }
        );
        let conns = probe.connections();
        assert_eq!(conns.len(), 1);
        assert_eq!((conns[0].tx_bytes, conns[0].rx_bytes), (100, 50));
        assert!(conns[0].start_ns <= conns[0].last_update_ns);
    }

    #[test]
    fn test_remote_port_is_checked_second() {
        let probe = probe(&[5432, 40000]);
        // Client socket talking to a monitored server port
        let client = sock("10.0.0.2:40001", "10.0.0.1:5432");
        probe.on_send(Some(&client), 10);
        assert_eq!(probe.port(5432).unwrap().tx_bytes, 10);

        // Both ports monitored: the local one wins
        let both = sock("10.0.0.2:40000", "10.0.0.1:5432");
        probe.on_send(Some(&both), 7);
        assert_eq!(probe.port(40000).unwrap().tx_bytes, 7);
        assert_eq!(probe.port(5432).unwrap().tx_bytes, 10);
    }

    #[test]
    fn test_unmonitored_and_malformed_events_are_discarded() {
        let probe = probe(&[8080]);
        let other = sock("10.0.0.1:9090", "10.0.0.2:40000");
        for _ in 0..10 {
            probe.on_send(Some(&other), 100);
            probe.on_receive(Some(&other), 100);
        }
        probe.on_send(None, 100);
        probe.on_receive(None, 100);

        assert!(probe.port_stats().is_empty());
        assert!(probe.connections().is_empty());
        assert_eq!(probe.metrics().malformed_events.value(), 2);
    }

    #[test]
    fn test_empty_events_are_dropped() {
        let probe = probe(&[8080]);
        let a = sock("10.0.0.1:8080", "10.0.0.2:40000");
        probe.on_send(Some(&a), 0);
        probe.on_receive(Some(&a), 0);
        probe.on_receive(Some(&a), -11);
        // Size checks come before the socket is looked at
        probe.on_send(None, 0);

        assert!(probe.port_stats().is_empty());
        assert_eq!(probe.metrics().malformed_events.value(), 0);
    }

    #[test]
    fn test_timestamps_follow_clock() {
        let monitored = Arc::new(MonitoredPorts::from_ports([80]).unwrap());
        let clock = Arc::new(ManualClock::new(100));
        let probe = Probe::with_clock(monitored, ProbeOptions::default(), Arc::clone(&clock)).unwrap();
        let a = sock("10.0.0.1:80", "10.0.0.9:50000");

        probe.on_receive(Some(&a), 1);
        clock.advance(250);
        probe.on_send(Some(&a), 1);

        let stats = probe.connection(&a.key()).unwrap();
        assert_eq!(stats.start_ns, 100);
        assert_eq!(stats.last_update_ns, 350);
    }

    #[test]
    fn test_port_table_full_still_tracks_connections() {
        let monitored = Arc::new(MonitoredPorts::from_ports([80, 443]).unwrap());
        let options = ProbeOptions {
            port_capacity: 1,
            ..Default::default()
        };
        let probe = Probe::attach(monitored, options).unwrap();

        probe.on_send(Some(&sock("10.0.0.1:80", "10.0.0.2:1000")), 5);
        probe.on_send(Some(&sock("10.0.0.1:443", "10.0.0.2:1001")), 5);

        assert_eq!(probe.port_stats().len(), 1);
        assert!(probe.port(443).is_none());
        assert_eq!(probe.connections().len(), 2);
        assert_eq!(probe.metrics().port_table_full.value(), 1);
    }

    #[test]
    fn test_connection_table_full_does_not_count_connection() {
        let monitored = Arc::new(MonitoredPorts::from_ports([80]).unwrap());
        let options = ProbeOptions {
            connection_capacity: 1,
            ..Default::default()
        };
        let probe = Probe::attach(monitored, options).unwrap();

        probe.on_send(Some(&sock("10.0.0.1:80", "10.0.0.2:1000")), 5);
        probe.on_send(Some(&sock("10.0.0.1:80", "10.0.0.3:1000")), 5);

        let stats = probe.port(80).unwrap();
        assert_eq!(stats.tx_bytes, 10);
        assert_eq!(stats.connections, 1);
        assert_eq!(probe.metrics().connection_table_full.value(), 1);
    }

    #[test]
    fn test_active_connections_and_clear_port() {
        let probe = probe(&[8080]);
        probe.on_send(Some(&sock("10.0.0.1:8080", "10.0.0.2:40000")), 1);
        probe.on_send(Some(&sock("10.0.0.2:40000", "10.0.0.1:8080")), 1);
        probe.on_send(Some(&sock("10.0.0.1:8080", "10.0.0.3:40000")), 1);

        assert_eq!(probe.active_connections().get(&8080), Some(&3));

        assert!(probe.clear_port(8080));
        assert_eq!(probe.port(8080).unwrap(), PortStats::empty(8080));
        assert_eq!(probe.connections().len(), 3);

        probe.monitored().remove(8080);
        assert!(probe.active_connections().is_empty());
    }

    #[test]
    fn test_reset_and_detach() {
        let mut probe = probe(&[8080]);
        probe.on_send(Some(&sock("10.0.0.1:8080", "10.0.0.2:40000")), 1);
        assert_eq!(probe.occupancy(), (1, 1));

        probe.reset();
        assert_eq!(probe.occupancy(), (0, 0));

        probe.on_receive(Some(&sock("10.0.0.1:8080", "10.0.0.2:40000")), 3);
        let snapshot = probe.detach();
        assert_eq!(snapshot.ports[0].rx_bytes, 3);
        assert_eq!(snapshot.ports[0].connections, 1);
        assert_eq!(snapshot.connections.len(), 1);
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let monitored = Arc::new(MonitoredPorts::new());
        let options = ProbeOptions {
            connection_capacity: 0,
            ..Default::default()
        };
        assert!(Probe::attach(monitored, options).is_err());
    }
}
