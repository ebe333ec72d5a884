//! Runtime settings of the CLI.
//!
//! Sources are layered: built-in defaults, then an optional file, then
//! `PORTMON_*` environment variables. Command-line flags are applied last
//! by the commands themselves.

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use portmon_common::types::{ConnectionAccounting, MAX_CONNECTION_ENTRIES, MAX_PORT_ENTRIES};
use portmon_probe::ProbeOptions;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Effective settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Ports to monitor
    pub ports: Vec<u16>,
    /// Default log filter when `--verbose` is not given
    pub log_level: String,
    /// Collector poll interval in milliseconds
    pub poll_interval_ms: u64,
    /// How first observations of a connection are recorded
    pub accounting: ConnectionAccounting,
    /// Maximum number of port records
    pub port_capacity: usize,
    /// Maximum number of connection records
    pub connection_capacity: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            ports: Vec::new(),
            log_level: "info".to_string(),
            poll_interval_ms: 100,
            accounting: ConnectionAccounting::Exact,
            port_capacity: MAX_PORT_ENTRIES,
            connection_capacity: MAX_CONNECTION_ENTRIES,
        }
    }
}

impl Settings {
    /// Load settings from `path` (if any) and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix("PORTMON")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("ports"),
        );

        let settings: Settings = builder
            .build()
            .context("Failed to read configuration")?
            .try_deserialize()
            .context("Invalid configuration")?;

        settings.probe_options().validate()?;
        Ok(settings)
    }

    /// Replace the configured ports when `ports` is non-empty.
    pub fn override_ports(&mut self, ports: &[u16]) {
        if !ports.is_empty() {
            self.ports = ports.to_vec();
        }
    }

    pub fn probe_options(&self) -> ProbeOptions {
        ProbeOptions {
            port_capacity: self.port_capacity,
            connection_capacity: self.connection_capacity,
            accounting: self.accounting,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}
