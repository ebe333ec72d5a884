//! Trace replay command implementation for portmon CLI

use anyhow::{Context, Result};
use log::{info, warn};
use portmon_monitor::PortMonitor;
use portmon_probe::Probe;
use std::path::PathBuf;

use crate::settings::Settings;
use crate::trace;
use crate::utils::{print_snapshot, Timer};
use crate::OutputFormat;

/// Replay the trace at `path` and print what the probe collected
pub fn run_replay(
    settings: &Settings,
    path: PathBuf,
    workers: usize,
    format: OutputFormat,
    connections: bool,
) -> Result<()> {
    let events = trace::load(&path)?;
    info!("Loaded {} events from {}", events.len(), path.display());

    if settings.ports.is_empty() {
        warn!("No ports configured, every event will be discarded");
    }

    let mut monitor = PortMonitor::with_ports(settings.ports.iter().copied(), settings.probe_options())?;
    let shared = monitor.attach()?;

    {
        let probe: &Probe = &shared;
        let _timer = Timer::new("replay");
        let workers = workers.max(1);
        let chunk = events.len().div_ceil(workers).max(1);

        std::thread::scope(|s| {
            for batch in events.chunks(chunk) {
                s.spawn(move || {
                    for event in batch {
                        event.apply(probe);
                    }
                });
            }
        });
    }

    drop(shared);
    let snapshot = monitor.detach().context("Failed to detach probe")?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&snapshot)?),
        OutputFormat::Table => print_snapshot(&snapshot, connections),
    }

    Ok(())
}
