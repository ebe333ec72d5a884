//! Userspace side of portmon
//!
//! This crate owns the probe's lifecycle: it keeps the set of monitored
//! ports, attaches and detaches the probe, and turns the probe's raw
//! counters into rates.

use anyhow::{bail, Context, Result};
use log::{info, warn};
use portmon_common::types::ProbeSnapshot;
use portmon_probe::{MonitoredPorts, Probe, ProbeOptions};
use std::sync::Arc;

mod collector;

pub use collector::{Collector, PortRates, DEFAULT_POLL_INTERVAL};

/// Control plane for the probe
pub struct PortMonitor {
    /// Ports the probe reports on, shared with the probe
    monitored: Arc<MonitoredPorts>,

    /// Sizing used at the next attach
    options: ProbeOptions,

    /// The attached probe, if any
    probe: Option<Arc<Probe>>,
}

impl PortMonitor {
    pub fn new(options: ProbeOptions) -> Result<Self> {
        options.validate().context("Invalid probe options")?;
        Ok(Self {
            monitored: Arc::new(MonitoredPorts::new()),
            options,
            probe: None,
        })
    }

    /// Create a monitor already watching `ports`.
    pub fn with_ports<I>(ports: I, options: ProbeOptions) -> Result<Self>
    where
        I: IntoIterator<Item = u16>,
    {
        let monitor = Self::new(options)?;
        for port in ports {
            monitor.add_port(port)?;
        }
        Ok(monitor)
    }

    /// Start monitoring `port`. Takes effect for the next event, attached or not.
    pub fn add_port(&self, port: u16) -> Result<bool> {
        self.monitored
            .insert(port)
            .with_context(|| format!("Failed to monitor port {}", port))
    }

    /// Stop monitoring `port`. Existing records are kept.
    pub fn remove_port(&self, port: u16) -> bool {
        self.monitored.remove(port)
    }

    pub fn ports(&self) -> Vec<u16> {
        self.monitored.ports()
    }

    pub fn options(&self) -> &ProbeOptions {
        &self.options
    }

    /// Attach a fresh probe and hand it out to the event source.
    pub fn attach(&mut self) -> Result<Arc<Probe>> {
        if self.probe.is_some() {
            bail!("Probe is already attached");
        }

        let probe = Probe::attach(Arc::clone(&self.monitored), self.options)
            .context("Failed to attach probe")?;
        let probe = Arc::new(probe);
        self.probe = Some(Arc::clone(&probe));

        info!("Monitoring ports {:?}", self.monitored.ports());

        Ok(probe)
    }

    /// Detach the probe and return the statistics it collected.
    pub fn detach(&mut self) -> Result<ProbeSnapshot> {
        let Some(probe) = self.probe.take() else {
            bail!("Probe is not attached");
        };

        match Arc::try_unwrap(probe) {
            Ok(probe) => Ok(probe.detach()),
            Err(shared) => {
                warn!(
                    "Probe still referenced by {} holder(s), detaching with a final snapshot",
                    Arc::strong_count(&shared) - 1
                );
                Ok(shared.snapshot())
            }
        }
    }

    pub fn is_attached(&self) -> bool {
        self.probe.is_some()
    }

    /// The attached probe
    pub fn probe(&self) -> Option<Arc<Probe>> {
        self.probe.as_ref().map(Arc::clone)
    }

    /// Zero the aggregates of `port` on the attached probe.
    pub fn clear_port(&self, port: u16) -> Result<bool> {
        match &self.probe {
            Some(probe) => Ok(probe.clear_port(port)),
            None => bail!("Probe is not attached"),
        }
    }
}

impl Drop for PortMonitor {
    fn drop(&mut self) {
        if self.is_attached() {
            if let Err(e) = self.detach() {
                warn!("Failed to detach probe: {}", e);
            }
        }
    }
}
