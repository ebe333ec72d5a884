//! Common types shared between the probe and its userspace readers.
//!
//! The socket identity mirrors the fields the kernel keeps in `sock_common`,
//! including their byte order, so an event source can hand them over
//! without converting anything on the hot path.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::str::FromStr;

use crate::metrics::ProbeMetricsSnapshot;
use crate::Error;

/// Maximum number of ports the control plane may mark as monitored.
pub const MAX_MONITORED_PORTS: usize = 64;

/// Maximum number of per-port aggregate records.
pub const MAX_PORT_ENTRIES: usize = 64;

/// Maximum number of per-connection records.
pub const MAX_CONNECTION_ENTRIES: usize = 10_240;

/// Direction of the observed data, from the local socket's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Data received by the local socket.
    Rx,
    /// Data sent by the local socket.
    Tx,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Rx => f.write_str("rx"),
            Direction::Tx => f.write_str("tx"),
        }
    }
}

/// Raw identity of a TCP socket as found in the kernel's `sock_common`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct SockCommon {
    /// Local port, host byte order
    pub skc_num: u16,
    /// Remote port, network byte order
    pub skc_dport: u16,
    /// Local IPv4 address, network byte order
    pub skc_rcv_saddr: u32,
    /// Remote IPv4 address, network byte order
    pub skc_daddr: u32,
}

impl SockCommon {
    /// Build the raw identity of a socket bound to `local` and connected to `remote`.
    pub fn from_endpoints(local: SocketAddrV4, remote: SocketAddrV4) -> Self {
        Self {
            skc_num: local.port(),
            skc_dport: remote.port().to_be(),
            skc_rcv_saddr: u32::from_ne_bytes(local.ip().octets()),
            skc_daddr: u32::from_ne_bytes(remote.ip().octets()),
        }
    }

    /// The connection key of this socket, with every field in host order.
    pub fn key(&self) -> ConnectionKey {
        ConnectionKey {
            local_addr: Ipv4Addr::from(self.skc_rcv_saddr.to_ne_bytes()),
            remote_addr: Ipv4Addr::from(self.skc_daddr.to_ne_bytes()),
            local_port: self.skc_num,
            remote_port: u16::from_be(self.skc_dport),
        }
    }
}

/// Identity of one end of a TCP connection.
///
/// Both handlers derive the same key for the same socket. The peer socket of
/// the same connection has its own, mirrored key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionKey {
    pub local_addr: Ipv4Addr,
    pub remote_addr: Ipv4Addr,
    pub local_port: u16,
    pub remote_port: u16,
}

impl ConnectionKey {
    pub fn local(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.local_addr, self.local_port)
    }

    pub fn remote(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.remote_addr, self.remote_port)
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.local(), self.remote())
    }
}

/// How a first observation of a connection is recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionAccounting {
    /// Single atomic insert-if-absent. Only the winning insert counts the
    /// connection against its port.
    #[default]
    Exact,
    /// Lookup followed by an unconditional store. Two first-packet racers
    /// may both count the connection and the later store replaces the
    /// earlier record.
    CheckThenStore,
}

impl fmt::Display for ConnectionAccounting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionAccounting::Exact => f.write_str("exact"),
            ConnectionAccounting::CheckThenStore => f.write_str("check-then-store"),
        }
    }
}

impl FromStr for ConnectionAccounting {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "exact" => Ok(ConnectionAccounting::Exact),
            "check-then-store" | "check_then_store" => Ok(ConnectionAccounting::CheckThenStore),
            other => Err(Error::InvalidAccounting(other.to_string())),
        }
    }
}

/// Point-in-time copy of one port's aggregate counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PortStats {
    pub port: u16,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_packets: u64,
    pub tx_packets: u64,
    pub connections: u64,
}

impl PortStats {
    /// Zeroed stats for a port that has not been observed.
    pub fn empty(port: u16) -> Self {
        Self {
            port,
            ..Default::default()
        }
    }

    pub fn total_bytes(&self) -> u64 {
        self.rx_bytes.saturating_add(self.tx_bytes)
    }
}

/// Point-in-time copy of one connection record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStats {
    pub key: ConnectionKey,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    /// Clock reading at the first observation.
    pub start_ns: u64,
    /// Clock reading at the latest observation.
    pub last_update_ns: u64,
}

/// Everything a probe holds, copied out entry by entry.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProbeSnapshot {
    pub ports: Vec<PortStats>,
    pub connections: Vec<ConnectionStats>,
    pub metrics: ProbeMetricsSnapshot,
}
