//! Live rate display command implementation for portmon CLI

use anyhow::{Context, Result};
use log::{info, warn};
use portmon_monitor::{Collector, PortMonitor, PortRates};
use portmon_probe::Probe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, sleep};

use crate::commands::stress::sockets_for;
use crate::settings::Settings;
use crate::utils::{format_bytes, format_rate, print_header};

/// Ports used when none are configured
const DEFAULT_PORTS: [u16; 1] = [8080];

/// Emit small events on `probe` until `stop` is set.
fn background_load(probe: Arc<Probe>, ports: Vec<u16>, stop: Arc<AtomicBool>) {
    let sockets = sockets_for(0, 16, &ports);
    let mut i = 0usize;
    while !stop.load(Ordering::Relaxed) {
        let sock = &sockets[i % sockets.len()];
        let size = ((i * 37) % 1460) as u64 + 1;
        if i % 3 == 0 {
            probe.on_receive(Some(sock), size as i64);
        } else {
            probe.on_send(Some(sock), size);
        }
        i = i.wrapping_add(1);
        if i % 64 == 0 {
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}

fn print_rates(rates: &[PortRates]) {
    print_header("Port rates");
    println!(
        "{:>6}  {:>14}  {:>14}  {:>12}  {:>12}  {:>6}",
        "PORT", "RX RATE", "TX RATE", "RX TOTAL", "TX TOTAL", "CONNS"
    );
    for r in rates {
        println!(
            "{:>6}  {:>14}  {:>14}  {:>12}  {:>12}  {:>6}",
            r.stats.port,
            format_rate(r.rx_rate),
            format_rate(r.tx_rate),
            format_bytes(r.stats.rx_bytes),
            format_bytes(r.stats.tx_bytes),
            r.active_connections
        );
    }
}

/// Run the probe under synthetic load and print rates every `interval_ms`
pub async fn run_watch(settings: &Settings, interval_ms: u64, duration_secs: Option<u64>) -> Result<()> {
    let ports: Vec<u16> = if settings.ports.is_empty() {
        DEFAULT_PORTS.to_vec()
    } else {
        settings.ports.clone()
    };

    let mut monitor = PortMonitor::with_ports(ports.iter().copied(), settings.probe_options())?;
    let probe = monitor.attach()?;

    let stop = Arc::new(AtomicBool::new(false));
    let load = {
        let probe = Arc::clone(&probe);
        let stop = Arc::clone(&stop);
        let ports = ports.clone();
        std::thread::spawn(move || background_load(probe, ports, stop))
    };

    let collector = Arc::new(Collector::with_interval(Arc::clone(&probe), settings.poll_interval()));
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let collector_task = {
        let collector = Arc::clone(&collector);
        tokio::spawn(async move {
            collector
                .run(async move {
                    let _ = shutdown_rx.changed().await;
                })
                .await;
        })
    };

    let deadline = async {
        match duration_secs {
            Some(secs) => sleep(Duration::from_secs(secs)).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    info!("Watching ports {:?}, press Ctrl-C to stop", ports);
    let mut ticker = interval(Duration::from_millis(interval_ms.max(1)));
    // The first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            _ = &mut deadline => break,
            _ = ticker.tick() => print_rates(&collector.all_stats().await),
        }
    }

    let _ = shutdown_tx.send(true);
    collector_task.await.context("Collector task failed")?;

    stop.store(true, Ordering::Relaxed);
    if load.join().is_err() {
        warn!("Load generator panicked");
    }

    // Final poll so the last rates include everything emitted
    collector.collect().await;
    print_rates(&collector.all_stats().await);

    drop(collector);
    drop(probe);
    monitor.detach()?;
    Ok(())
}
