//! Utility functions for the portmon CLI

use log::info;
use portmon_common::types::{ConnectionStats, PortStats, ProbeSnapshot};
use std::time::{Duration, Instant};

/// Format a duration as a human-readable string
pub fn format_duration(duration: Duration) -> String {
    let total_secs = duration.as_secs();

    if total_secs < 60 {
        format!("{}.{:03}s", total_secs, duration.subsec_millis())
    } else if total_secs < 3600 {
        let mins = total_secs / 60;
        let secs = total_secs % 60;
        format!("{}m {}s", mins, secs)
    } else {
        let hours = total_secs / 3600;
        let mins = (total_secs % 3600) / 60;
        let secs = total_secs % 60;
        format!("{}h {}m {}s", hours, mins, secs)
    }
}

/// Format a byte count as a human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes < KB {
        format!("{} B", bytes)
    } else if bytes < MB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else if bytes < GB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    }
}

/// Format a rate in bytes per second
pub fn format_rate(bytes_per_sec: f64) -> String {
    format!("{}/s", format_bytes(bytes_per_sec.max(0.0).round() as u64))
}

/// Simple timer for measuring operations
pub struct Timer {
    start: Instant,
    operation: String,
}

impl Timer {
    pub fn new(operation: &str) -> Self {
        info!("Starting operation: {}", operation);
        Self {
            start: Instant::now(),
            operation: operation.to_string(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        info!(
            "Operation '{}' completed in {}",
            self.operation,
            format_duration(self.elapsed())
        );
    }
}

/// Print a section header in the CLI output
pub fn print_header(title: &str) {
    let separator = "=".repeat(title.len());
    println!("\n{}", title);
    println!("{}", separator);
}

pub fn print_port_table(ports: &[PortStats]) {
    println!(
        "{:>6}  {:>12}  {:>12}  {:>10}  {:>10}  {:>11}",
        "PORT", "RX", "TX", "RX PKTS", "TX PKTS", "CONNECTIONS"
    );
    for stats in ports {
        println!(
            "{:>6}  {:>12}  {:>12}  {:>10}  {:>10}  {:>11}",
            stats.port,
            format_bytes(stats.rx_bytes),
            format_bytes(stats.tx_bytes),
            stats.rx_packets,
            stats.tx_packets,
            stats.connections
        );
    }
}

pub fn print_connection_table(connections: &[ConnectionStats]) {
    println!(
        "{:<45}  {:>12}  {:>12}  {:>10}",
        "CONNECTION", "RX", "TX", "DURATION"
    );
    for conn in connections {
        let duration = Duration::from_nanos(conn.last_update_ns.saturating_sub(conn.start_ns));
        println!(
            "{:<45}  {:>12}  {:>12}  {:>10}",
            conn.key.to_string(),
            format_bytes(conn.rx_bytes),
            format_bytes(conn.tx_bytes),
            format_duration(duration)
        );
    }
}

/// Print a probe snapshot as tables
pub fn print_snapshot(snapshot: &ProbeSnapshot, with_connections: bool) {
    print_header("Ports");
    print_port_table(&snapshot.ports);

    if with_connections {
        print_header("Connections");
        print_connection_table(&snapshot.connections);
    }

    let metrics = &snapshot.metrics;
    print_header("Drops");
    println!("  Malformed events:      {}", metrics.malformed_events);
    println!("  Port table full:       {}", metrics.port_table_full);
    println!("  Connection table full: {}", metrics.connection_table_full);
    println!("  Connection overwrites: {}", metrics.connection_overwrites);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.00 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.00 MB");
        assert_eq!(format_rate(1536.0), "1.50 KB/s");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_millis(1500)), "1.500s");
        assert_eq!(format_duration(Duration::from_secs(125)), "2m 5s");
        assert_eq!(format_duration(Duration::from_secs(3725)), "1h 2m 5s");
    }
}
