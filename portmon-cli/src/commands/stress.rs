//! Synthetic load command implementation for portmon CLI

use anyhow::{anyhow, bail, Result};
use log::info;
use portmon_common::metrics::Histogram;
use portmon_common::types::SockCommon;
use portmon_monitor::PortMonitor;
use portmon_probe::Probe;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::thread::ScopedJoinHandle;
use std::time::Instant;

use crate::settings::Settings;
use crate::utils::{format_bytes, format_duration, print_header, print_port_table, Timer};

/// Events timed together for the latency report
const BATCH: usize = 1024;

/// Ports used when none are configured
const DEFAULT_PORTS: [u16; 2] = [8080, 5432];

/// Sockets emitted by thread `thread`, spread over `ports`.
pub fn sockets_for(thread: usize, count: usize, ports: &[u16]) -> Vec<SockCommon> {
    (0..count.max(1))
        .map(|i| {
            let local = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), ports[i % ports.len()]);
            let remote = SocketAddrV4::new(
                Ipv4Addr::new(10, 1, (thread % 256) as u8, (i % 250) as u8 + 1),
                40_000 + (i / 250) as u16,
            );
            SockCommon::from_endpoints(local, remote)
        })
        .collect()
}

/// Emit `events` events over `sockets`; returns the bytes emitted.
fn emit(probe: &Probe, sockets: &[SockCommon], events: usize, latency: &Histogram) -> u64 {
    let mut emitted = 0u64;
    let mut batch_start = Instant::now();

    for i in 0..events {
        let sock = &sockets[i % sockets.len()];
        let size = (i % 1460) as u64 + 1;
        if i % 2 == 0 {
            probe.on_send(Some(sock), size);
        } else {
            probe.on_receive(Some(sock), size as i64);
        }
        emitted += size;

        if (i + 1) % BATCH == 0 {
            latency.observe(batch_start.elapsed().as_nanos() as u64);
            batch_start = Instant::now();
        }
    }
    emitted
}

/// Run the stress test with the specified parameters
pub fn run_stress(settings: &Settings, threads: usize, events: usize, sockets: usize) -> Result<()> {
    let ports: Vec<u16> = if settings.ports.is_empty() {
        DEFAULT_PORTS.to_vec()
    } else {
        settings.ports.clone()
    };
    let threads = threads.max(1);

    info!(
        "Running stress test: threads={}, events={}, sockets={}, ports={:?}",
        threads, events, sockets, ports
    );

    println!("Starting portmon stress test");
    println!("============================");
    println!("Parameters:");
    println!("  Threads: {}", threads);
    println!("  Events per thread: {}", events);
    println!("  Sockets per thread: {}", sockets);
    println!("  Ports: {:?}", ports);
    println!("  Accounting: {}", settings.accounting);

    let mut monitor = PortMonitor::with_ports(ports.iter().copied(), settings.probe_options())?;
    let shared = monitor.attach()?;
    let probe: &Probe = &shared;
    let latency = Histogram::exponential(1_000, 100_000_000, 24);

    let timer = Timer::new("stress");
    let emitted: u64 = std::thread::scope(|s| {
        let handles: Vec<_> = (0..threads)
            .map(|t| {
                let socks = sockets_for(t, sockets, &ports);
                let latency = &latency;
                s.spawn(move || emit(probe, &socks, events, latency))
            })
            .collect();
        join_workers(handles)
    })?;
    let elapsed = timer.elapsed();
    drop(timer);

    let port_stats = probe.port_stats();
    let metrics = probe.metrics().snapshot();
    let (_, tracked) = probe.occupancy();
    let counted: u64 = port_stats.iter().map(|p| p.total_bytes()).sum();
    let total_events = (threads * events) as u64;

    print_header("Results");
    println!("  Duration: {}", format_duration(elapsed));
    println!(
        "  Throughput: {:.0} events/s",
        total_events as f64 / elapsed.as_secs_f64().max(f64::EPSILON)
    );
    println!("  Emitted: {}", format_bytes(emitted));
    println!("  Counted: {}", format_bytes(counted));
    println!("  Tracked connections: {}", tracked);
    println!("  Connection table full: {}", metrics.connection_table_full);
    println!("  Connection overwrites: {}", metrics.connection_overwrites);
    println!("  Port table full: {}", metrics.port_table_full);
    if latency.count() > 0 {
        println!(
            "  Batch latency ({} events): avg {:.0} ns, p50 <= {} ns, p99 <= {} ns",
            BATCH,
            latency.average(),
            latency.quantile(0.5).map_or("overflow".into(), |v| v.to_string()),
            latency.quantile(0.99).map_or("overflow".into(), |v| v.to_string()),
        );
    }

    print_header("Ports");
    print_port_table(&port_stats);

    drop(shared);
    monitor.detach()?;

    if metrics.port_table_full == 0 && counted != emitted {
        bail!("Counted {} bytes but emitted {}", counted, emitted);
    }
    println!("\nTotals verified.");

    Ok(())
}

/// Wait for every worker and add up the bytes they emitted.
fn join_workers(handles: Vec<ScopedJoinHandle<'_, u64>>) -> Result<u64> {
    handles
        .into_iter()
        .enumerate()
        .map(|(t, h)| h.join().map_err(|_| anyhow!("Stress worker {} panicked", t)))
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_sockets_are_distinct_and_monitored() {
        let socks = sockets_for(3, 600, &[80, 443]);
        let keys: HashSet<_> = socks.iter().map(|s| s.key()).collect();
        assert_eq!(keys.len(), 600);
        assert!(socks.iter().all(|s| s.skc_num == 80 || s.skc_num == 443));
    }

    #[test]
    fn test_emit_counts_every_byte() {
        let monitor = PortMonitor::with_ports([80], Default::default());
        let mut monitor = monitor.unwrap();
        let probe = monitor.attach().unwrap();
        let latency = Histogram::exponential(1_000, 1_000_000, 8);

        let emitted = emit(&probe, &sockets_for(0, 4, &[80]), 3_000, &latency);
        let stats = probe.port(80).unwrap();
        assert_eq!(stats.total_bytes(), emitted);
        assert_eq!(stats.connections, 4);
        assert_eq!(latency.count(), 2);
    }

    #[test]
    fn test_worker_panic_is_reported() {
        let result = std::thread::scope(|s| {
            let handles = vec![
                s.spawn(|| 10u64),
                s.spawn(|| -> u64 { panic!("worker failed") }),
                s.spawn(|| 5u64),
            ];
            join_workers(handles)
        });
        let err = result.unwrap_err();
        assert!(err.to_string().contains("worker 1 panicked"));

        let total = std::thread::scope(|s| join_workers(vec![s.spawn(|| 7u64), s.spawn(|| 8u64)]));
        assert_eq!(total.unwrap(), 15);
    }
}
