//! portmon: passive per-port and per-connection TCP traffic statistics.
//!
//! This crate re-exports the workspace members:
//!
//! - [`common`]: shared types, capacities, errors and metrics primitives
//! - [`probe`]: the in-path probe and its lock-free stores
//! - [`monitor`]: control plane and rate collector

pub use portmon_common as common;
pub use portmon_monitor as monitor;
pub use portmon_probe as probe;

pub use portmon_common::types::{
    ConnectionAccounting, ConnectionKey, ConnectionStats, Direction, PortStats, ProbeSnapshot,
    SockCommon,
};
pub use portmon_monitor::{Collector, PortMonitor, PortRates};
pub use portmon_probe::{MonitoredPorts, Probe, ProbeOptions};
