//! In-path statistics probe for portmon.
//!
//! The probe is what an event source (kernel instrumentation, packet
//! capture, socket interposition) calls for every TCP send and receive on
//! the host. It keeps per-port aggregates and per-socket records in
//! fixed-size, lock-free tables, for the ports the control plane marks as
//! monitored.

pub mod clock;
pub mod connections;
pub mod membership;
pub mod ports;
pub mod probe;
pub mod table;

pub use clock::{Clock, ManualClock, MonotonicClock};
pub use connections::{ConnectionStore, Observation};
pub use membership::MonitoredPorts;
pub use ports::{PortAggregateStore, PortCounters};
pub use probe::{Probe, ProbeOptions};
