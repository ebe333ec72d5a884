//! Per-connection records.

use portmon_common::types::{
    ConnectionAccounting, ConnectionKey, ConnectionStats, Direction, MAX_CONNECTION_ENTRIES,
};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::table::{FixedTable, Insert};

/// Counters and timestamps of one socket.
#[derive(Debug, Default)]
pub struct ConnectionCounters {
    rx_bytes: AtomicU64,
    tx_bytes: AtomicU64,
    start_ns: AtomicU64,
    last_update_ns: AtomicU64,
}

impl ConnectionCounters {
    #[inline]
    fn bytes(&self, direction: Direction) -> &AtomicU64 {
        match direction {
            Direction::Rx => &self.rx_bytes,
            Direction::Tx => &self.tx_bytes,
        }
    }

    /// Write a fresh record: `amount` in `direction`, nothing in the other.
    fn seed(&self, amount: u64, direction: Direction, now: u64) {
        self.rx_bytes.store(0, Ordering::Relaxed);
        self.tx_bytes.store(0, Ordering::Relaxed);
        self.bytes(direction).store(amount, Ordering::Relaxed);
        self.start_ns.store(now, Ordering::Relaxed);
        self.last_update_ns.store(now, Ordering::Relaxed);
    }

    pub fn snapshot(&self, key: ConnectionKey) -> ConnectionStats {
        ConnectionStats {
            key,
            rx_bytes: self.rx_bytes.load(Ordering::Relaxed),
            tx_bytes: self.tx_bytes.load(Ordering::Relaxed),
            start_ns: self.start_ns.load(Ordering::Relaxed),
            last_update_ns: self.last_update_ns.load(Ordering::Relaxed),
        }
    }
}

/// What [`ConnectionStore::observe`] did with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// A new record was created.
    Created,
    /// A record created by a racing event was overwritten with a fresh one.
    /// Only happens with [`ConnectionAccounting::CheckThenStore`].
    Replaced,
    /// An existing record was updated.
    Updated,
    /// The key was absent and the store is full.
    Dropped,
}

impl Observation {
    /// Whether the event counts as a newly seen connection.
    pub fn is_new(self) -> bool {
        matches!(self, Observation::Created | Observation::Replaced)
    }
}

/// Bounded map from [`ConnectionKey`] to [`ConnectionCounters`].
pub struct ConnectionStore {
    table: FixedTable<ConnectionKey, ConnectionCounters>,
    accounting: ConnectionAccounting,
}

impl ConnectionStore {
    pub fn new(accounting: ConnectionAccounting) -> Self {
        Self::with_capacity(MAX_CONNECTION_ENTRIES, accounting)
    }

    pub fn with_capacity(capacity: usize, accounting: ConnectionAccounting) -> Self {
        Self {
            table: FixedTable::with_capacity(capacity),
            accounting,
        }
    }

    pub fn accounting(&self) -> ConnectionAccounting {
        self.accounting
    }

    /// Record `amount` bytes for `key`; returns whether a record was created.
    #[inline]
    pub fn upsert(&self, key: &ConnectionKey, amount: u64, direction: Direction, now: u64) -> bool {
        self.observe(key, amount, direction, now).is_new()
    }

    /// Like [`upsert`](Self::upsert), reporting exactly what happened.
    pub fn observe(
        &self,
        key: &ConnectionKey,
        amount: u64,
        direction: Direction,
        now: u64,
    ) -> Observation {
        match self.accounting {
            ConnectionAccounting::Exact => self.observe_exact(key, amount, direction, now),
            ConnectionAccounting::CheckThenStore => {
                self.observe_check_then_store(key, amount, direction, now)
            }
        }
    }

    fn observe_exact(
        &self,
        key: &ConnectionKey,
        amount: u64,
        direction: Direction,
        now: u64,
    ) -> Observation {
        if let Some(conn) = self.table.get(key) {
            conn.bytes(direction).fetch_add(amount, Ordering::Relaxed);
            conn.last_update_ns.fetch_max(now, Ordering::Relaxed);
            return Observation::Updated;
        }
        match self.table.insert_with(key, |conn| conn.seed(amount, direction, now)) {
            Insert::Inserted(_) => Observation::Created,
            Insert::Present(conn) => {
                conn.bytes(direction).fetch_add(amount, Ordering::Relaxed);
                conn.last_update_ns.fetch_max(now, Ordering::Relaxed);
                Observation::Updated
            }
            Insert::Full => Observation::Dropped,
        }
    }

    fn observe_check_then_store(
        &self,
        key: &ConnectionKey,
        amount: u64,
        direction: Direction,
        now: u64,
    ) -> Observation {
        if let Some(conn) = self.table.get(key) {
            conn.bytes(direction).fetch_add(amount, Ordering::Relaxed);
            conn.last_update_ns.store(now, Ordering::Relaxed);
            return Observation::Updated;
        }
        // Absent at lookup time: store unconditionally, even over a record a
        // racing event created in the meantime.
        match self.table.insert_with(key, |conn| conn.seed(amount, direction, now)) {
            Insert::Inserted(_) => Observation::Created,
            Insert::Present(conn) => {
                conn.seed(amount, direction, now);
                Observation::Replaced
            }
            Insert::Full => Observation::Dropped,
        }
    }

    pub fn get(&self, key: &ConnectionKey) -> Option<ConnectionStats> {
        self.table.get(key).map(|conn| conn.snapshot(*key))
    }

    /// Snapshot of each tracked connection, in table order.
    pub fn iter(&self) -> impl Iterator<Item = ConnectionStats> + '_ {
        self.table.iter().map(|(key, conn)| conn.snapshot(key))
    }

    /// Snapshots of every tracked connection, sorted by key.
    pub fn snapshot(&self) -> Vec<ConnectionStats> {
        let mut stats: Vec<ConnectionStats> = self.iter().collect();
        stats.sort_unstable_by_key(|s| s.key);
        stats
    }

    /// Keys of every tracked connection, in table order.
    pub fn keys(&self) -> impl Iterator<Item = ConnectionKey> + '_ {
        self.table.iter().map(|(key, _)| key)
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
