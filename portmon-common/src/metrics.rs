//! Metrics primitives for portmon.
//!
//! Everything here is updated with relaxed atomics so it can sit next to the
//! probe's event path without adding ordering constraints.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/* ---------------------------------------------------------------- *
 * Simple Counter
 * ---------------------------------------------------------------- */

#[derive(Debug)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub const fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn increment(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, value: u64) {
        self.value.fetch_add(value, Ordering::Relaxed);
    }

    pub fn value(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.value.store(0, Ordering::Relaxed);
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

/* ---------------------------------------------------------------- *
 * Histogram
 * ---------------------------------------------------------------- */

#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<AtomicU64>,
    boundaries: Vec<u64>,
    overflow: AtomicU64,
    sum: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    /// Buckets are upper-inclusive and `boundaries` must be sorted.
    pub fn new(boundaries: Vec<u64>) -> Self {
        let buckets = (0..boundaries.len())
            .map(|_| AtomicU64::new(0))
            .collect();

        Self {
            buckets,
            boundaries,
            overflow: AtomicU64::new(0),
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn exponential(min: u64, max: u64, buckets: usize) -> Self {
        assert!(min > 0 && min < max && buckets > 1);
        let factor = (max as f64 / min as f64).powf(1.0 / (buckets as f64 - 1.0));
        let mut boundaries = Vec::with_capacity(buckets);
        let mut value = min;
        for _ in 0..buckets {
            boundaries.push(value);
            value = ((value as f64 * factor).ceil() as u64).max(value + 1);
        }
        Self::new(boundaries)
    }

    pub fn observe(&self, value: u64) {
        self.sum.fetch_add(value, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);

        match self.boundaries.iter().position(|&b| value <= b) {
            Some(idx) => {
                self.buckets[idx].fetch_add(1, Ordering::Relaxed);
            }
            None => {
                self.overflow.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn average(&self) -> f64 {
        let c = self.count.load(Ordering::Relaxed);
        if c == 0 {
            0.0
        } else {
            self.sum.load(Ordering::Relaxed) as f64 / c as f64
        }
    }

    /// Smallest bucket boundary below which at least `q` of the samples fall.
    ///
    /// Returns `None` when empty or when the quantile lands in the overflow bucket.
    pub fn quantile(&self, q: f64) -> Option<u64> {
        let total = self.count();
        if total == 0 {
            return None;
        }
        let target = ((total as f64) * q.clamp(0.0, 1.0)).ceil().max(1.0) as u64;
        let mut seen = 0;
        for (&bound, bucket) in self.boundaries.iter().zip(self.buckets.iter()) {
            seen += bucket.load(Ordering::Relaxed);
            if seen >= target {
                return Some(bound);
            }
        }
        None
    }

    pub fn counts(&self) -> Vec<(u64, u64)> {
        self.boundaries
            .iter()
            .zip(self.buckets.iter())
            .map(|(&b, bucket)| (b, bucket.load(Ordering::Relaxed)))
            .collect()
    }

    pub fn overflow(&self) -> u64 {
        self.overflow.load(Ordering::Relaxed)
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn sum(&self) -> u64 {
        self.sum.load(Ordering::Relaxed)
    }
}

/* ---------------------------------------------------------------- *
 * Drop counters of the probe
 * ---------------------------------------------------------------- */

#[derive(Debug, Default)]
pub struct ProbeMetrics {
    /// Events with no socket behind them
    pub malformed_events: Counter,
    /// Events on a monitored port that found the port table full
    pub port_table_full: Counter,
    /// New connections that found the connection table full
    pub connection_table_full: Counter,
    /// First-packet races where a record was replaced instead of merged
    pub connection_overwrites: Counter,
}

impl ProbeMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> ProbeMetricsSnapshot {
        ProbeMetricsSnapshot {
            malformed_events: self.malformed_events.value(),
            port_table_full: self.port_table_full.value(),
            connection_table_full: self.connection_table_full.value(),
            connection_overwrites: self.connection_overwrites.value(),
        }
    }

    pub fn reset(&self) {
        self.malformed_events.reset();
        self.port_table_full.reset();
        self.connection_table_full.reset();
        self.connection_overwrites.reset();
    }
}

/// Plain copy of [`ProbeMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProbeMetricsSnapshot {
    pub malformed_events: u64,
    pub port_table_full: u64,
    pub connection_table_full: u64,
    pub connection_overwrites: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter() {
        let c = Counter::new();
        c.increment();
        c.add(41);
        assert_eq!(c.value(), 42);
        c.reset();
        assert_eq!(c.value(), 0);
    }

    #[test]
    fn test_histogram_buckets() {
        let h = Histogram::new(vec![10, 100, 1_000]);
        h.observe(5);
        h.observe(10);
        h.observe(50);
        h.observe(5_000);

        assert_eq!(h.counts(), vec![(10, 2), (100, 1), (1_000, 0)]);
        assert_eq!(h.overflow(), 1);
        assert_eq!(h.count(), 4);
        assert_eq!(h.sum(), 5_065);
        assert_eq!(h.quantile(0.5), Some(10));
        assert_eq!(h.quantile(0.75), Some(100));
        assert_eq!(h.quantile(1.0), None);
    }

    #[test]
    fn test_histogram_exponential_is_increasing() {
        let h = Histogram::exponential(1, 1_000_000, 8);
        let bounds: Vec<u64> = h.counts().into_iter().map(|(b, _)| b).collect();
        assert_eq!(bounds.len(), 8);
        assert!(bounds.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(h.quantile(0.5), None);
    }

    #[test]
    fn test_probe_metrics_snapshot() {
        let m = ProbeMetrics::new();
        m.port_table_full.increment();
        m.connection_overwrites.add(2);
        let snap = m.snapshot();
        assert_eq!(snap.port_table_full, 1);
        assert_eq!(snap.connection_overwrites, 2);
        m.reset();
        assert_eq!(m.snapshot(), ProbeMetricsSnapshot::default());
    }
}
