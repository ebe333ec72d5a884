//! Error types for portmon.
//!
//! Only the control plane and the userspace layers return these. The event
//! path of the probe has no error channel at all.

use thiserror::Error;

/// All possible errors that can occur outside the probe's event path.
#[derive(Error, Debug)]
pub enum Error {
    /// The monitored-port set already holds its maximum number of ports.
    #[error("monitored port set is full (capacity {capacity})")]
    MembershipFull { capacity: usize },

    /// Port 0 cannot be monitored.
    #[error("invalid port: {0}")]
    InvalidPort(u16),

    /// Unknown connection accounting mode.
    #[error("unknown connection accounting mode: {0}")]
    InvalidAccounting(String),

    /// Invalid configuration value.
    #[error("configuration error: {0}")]
    Config(String),
}
