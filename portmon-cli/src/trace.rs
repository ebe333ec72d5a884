//! Recorded send/receive events.
//!
//! A trace is a JSON-lines file, one event per line:
//!
//! ```text
//! {"op":"send","local":"10.0.0.1:8080","remote":"10.0.0.2:40000","bytes":100}
//! ```
//!
//! An event missing either endpoint stands for an event without a socket.

use anyhow::{Context, Result};
use portmon_common::types::SockCommon;
use portmon_probe::{Clock, Probe};
use serde::Deserialize;
use std::io::BufRead;
use std::net::SocketAddrV4;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Op {
    Send,
    Receive,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TraceEvent {
    pub op: Op,
    #[serde(default)]
    pub local: Option<SocketAddrV4>,
    #[serde(default)]
    pub remote: Option<SocketAddrV4>,
    pub bytes: i64,
}

impl TraceEvent {
    pub fn sock(&self) -> Option<SockCommon> {
        match (self.local, self.remote) {
            (Some(local), Some(remote)) => Some(SockCommon::from_endpoints(local, remote)),
            _ => None,
        }
    }

    /// Deliver this event to `probe`.
    pub fn apply<C: Clock>(&self, probe: &Probe<C>) {
        let sock = self.sock();
        match self.op {
            // A negative size cannot be handed to the send path
            Op::Send => probe.on_send(sock.as_ref(), u64::try_from(self.bytes).unwrap_or(0)),
            Op::Receive => probe.on_receive(sock.as_ref(), self.bytes),
        }
    }
}

/// Parse a trace; blank lines and lines starting with `#` are skipped.
pub fn parse<R: BufRead>(reader: R) -> Result<Vec<TraceEvent>> {
    let mut events = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line.context("Failed to read trace")?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let event = serde_json::from_str(line)
            .with_context(|| format!("Invalid trace event on line {}", idx + 1))?;
        events.push(event);
    }
    Ok(events)
}

pub fn load(path: &Path) -> Result<Vec<TraceEvent>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open trace {}", path.display()))?;
    parse(std::io::BufReader::new(file))
}
