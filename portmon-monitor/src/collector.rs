//! Periodic collection of per-port rates.

use log::{debug, info};
use portmon_common::types::PortStats;
use portmon_probe::{Clock, MonotonicClock, Probe};
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio::time::{interval, MissedTickBehavior};

/// Default time between two polls of the probe
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Counters of a port together with the rates derived from them.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PortRates {
    #[serde(flatten)]
    pub stats: PortStats,
    /// Received bytes per second over the last poll interval
    pub rx_rate: f64,
    /// Sent bytes per second over the last poll interval
    pub tx_rate: f64,
    /// Tracked connections touching this port
    pub active_connections: u64,
}

impl PortRates {
    pub fn empty(port: u16) -> Self {
        Self {
            stats: PortStats::empty(port),
            rx_rate: 0.0,
            tx_rate: 0.0,
            active_connections: 0,
        }
    }
}

#[derive(Default)]
struct CollectorState {
    last_poll: Option<Instant>,
    rates: BTreeMap<u16, PortRates>,
}

/// Polls a probe and keeps the latest rates of every port.
pub struct Collector<C: Clock = MonotonicClock> {
    probe: Arc<Probe<C>>,
    interval: Duration,
    state: RwLock<CollectorState>,
}

fn rate(current: u64, previous: u64, elapsed: f64) -> f64 {
    if elapsed <= 0.0 {
        return 0.0;
    }
    // Counters may have been cleared since the previous poll
    current.saturating_sub(previous) as f64 / elapsed
}

impl<C: Clock> Collector<C> {
    pub fn new(probe: Arc<Probe<C>>) -> Self {
        Self::with_interval(probe, DEFAULT_POLL_INTERVAL)
    }

    pub fn with_interval(probe: Arc<Probe<C>>, interval: Duration) -> Self {
        Self {
            probe,
            interval,
            state: RwLock::new(CollectorState::default()),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Poll the probe once.
    pub async fn collect(&self) {
        self.collect_at(Instant::now()).await;
    }

    pub(crate) async fn collect_at(&self, now: Instant) {
        let stats = self.probe.port_stats();
        let active = self.probe.active_connections();

        let mut state = self.state.write().await;
        let elapsed = state
            .last_poll
            .map(|last| now.saturating_duration_since(last).as_secs_f64())
            .unwrap_or(0.0);

        let mut rates = BTreeMap::new();
        for port in self.probe.monitored().ports() {
            rates.insert(port, PortRates::empty(port));
        }
        for current in stats {
            let previous = state.rates.get(&current.port).map(|r| r.stats);
            let (rx_rate, tx_rate) = match previous {
                Some(prev) => (
                    rate(current.rx_bytes, prev.rx_bytes, elapsed),
                    rate(current.tx_bytes, prev.tx_bytes, elapsed),
                ),
                None => (0.0, 0.0),
            };
            rates.insert(
                current.port,
                PortRates {
                    stats: current,
                    rx_rate,
                    tx_rate,
                    active_connections: 0,
                },
            );
        }
        for (port, count) in active {
            rates.entry(port).or_insert_with(|| PortRates::empty(port)).active_connections = count;
        }

        debug!("Collected {} ports after {:.3}s", rates.len(), elapsed);

        state.rates = rates;
        state.last_poll = Some(now);
    }

    /// Poll every interval until `shutdown` completes.
    pub async fn run<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        info!("Collector started, polling every {:?}", self.interval);

        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => self.collect().await,
            }
        }

        info!("Collector stopped");
    }

    /// Latest rates of `port`, zeroed if it has not been seen.
    pub async fn stats(&self, port: u16) -> PortRates {
        self.state
            .read()
            .await
            .rates
            .get(&port)
            .copied()
            .unwrap_or_else(|| PortRates::empty(port))
    }

    /// Latest rates of every observed or monitored port, ascending.
    pub async fn all_stats(&self) -> Vec<PortRates> {
        self.state.read().await.rates.values().copied().collect()
    }
}
