//! Per-port aggregate counters.

use portmon_common::types::{Direction, PortStats, MAX_PORT_ENTRIES};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::table::FixedTable;

/// Aggregate counters of one monitored port.
///
/// Each field is updated with its own fetch-and-add; a reader may see the
/// fields of one record at slightly different points in time.
#[derive(Debug, Default)]
pub struct PortCounters {
    rx_bytes: AtomicU64,
    tx_bytes: AtomicU64,
    rx_packets: AtomicU64,
    tx_packets: AtomicU64,
    connections: AtomicU64,
}

impl PortCounters {
    /// Account `amount` bytes and one packet in `direction`.
    #[inline]
    pub fn add_bytes(&self, amount: u64, direction: Direction) {
        let (bytes, packets) = match direction {
            Direction::Rx => (&self.rx_bytes, &self.rx_packets),
            Direction::Tx => (&self.tx_bytes, &self.tx_packets),
        };
        bytes.fetch_add(amount, Ordering::Relaxed);
        packets.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn increment_connections(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, port: u16) -> PortStats {
        PortStats {
            port,
            rx_bytes: self.rx_bytes.load(Ordering::Relaxed),
            tx_bytes: self.tx_bytes.load(Ordering::Relaxed),
            rx_packets: self.rx_packets.load(Ordering::Relaxed),
            tx_packets: self.tx_packets.load(Ordering::Relaxed),
            connections: self.connections.load(Ordering::Relaxed),
        }
    }

    fn zero(&self) {
        self.rx_bytes.store(0, Ordering::Relaxed);
        self.tx_bytes.store(0, Ordering::Relaxed);
        self.rx_packets.store(0, Ordering::Relaxed);
        self.tx_packets.store(0, Ordering::Relaxed);
        self.connections.store(0, Ordering::Relaxed);
    }
}

/// Bounded map from port number to [`PortCounters`].
pub struct PortAggregateStore {
    table: FixedTable<u16, PortCounters>,
}

impl PortAggregateStore {
    pub fn new() -> Self {
        Self::with_capacity(MAX_PORT_ENTRIES)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            table: FixedTable::with_capacity(capacity),
        }
    }

    /// Counters of `port`, creating a zeroed record on first use.
    ///
    /// Concurrent callers for a new port all get the one record that won the
    /// insert. `None` means the store is full and the event goes uncounted.
    #[inline]
    pub fn get_or_create(&self, port: u16) -> Option<&PortCounters> {
        if let Some(counters) = self.table.get(&port) {
            return Some(counters);
        }
        self.table.insert_with(&port, |_| {}).entry()
    }

    pub fn get(&self, port: u16) -> Option<&PortCounters> {
        self.table.get(&port)
    }

    /// Every port record, in table order.
    pub fn iter(&self) -> impl Iterator<Item = (u16, &PortCounters)> + '_ {
        self.table.iter()
    }

    /// Snapshots of every port, in ascending port order.
    pub fn snapshot(&self) -> Vec<PortStats> {
        let mut stats: Vec<PortStats> = self
            .iter()
            .map(|(port, counters)| counters.snapshot(port))
            .collect();
        stats.sort_unstable_by_key(|s| s.port);
        stats
    }

    /// Zero the counters of `port` without giving up its slot.
    pub fn clear_port(&self, port: u16) -> bool {
        match self.table.get(&port) {
            Some(counters) => {
                counters.zero();
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.table.capacity()
    }

    pub(crate) fn clear(&mut self) {
        self.table.clear();
    }
}

impl Default for PortAggregateStore {
    fn default() -> Self {
        Self::new()
    }
}
