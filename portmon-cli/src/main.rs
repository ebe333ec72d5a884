use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

mod commands;
mod settings;
mod trace;
mod utils;

use settings::Settings;

/// portmon: per-port and per-connection TCP traffic statistics
#[derive(Parser)]
#[clap(author, version, about)]
struct Cli {
    /// Sets the level of verbosity
    #[clap(short, long, global = true)]
    verbose: bool,

    /// Configuration file (TOML, YAML or JSON)
    #[clap(short, long, global = true)]
    config: Option<PathBuf>,

    /// Subcommand to execute
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Feed a recorded trace of send/receive events through the probe
    Replay {
        /// JSON-lines trace file
        trace: PathBuf,

        /// Ports to monitor, overriding the configuration
        #[clap(short, long, value_delimiter = ',', value_parser = clap::value_parser!(u16).range(1..))]
        ports: Vec<u16>,

        /// Number of threads replaying the trace
        #[clap(short, long, default_value = "1")]
        workers: usize,

        /// Output format
        #[clap(short, long, value_enum, default_value = "table")]
        format: OutputFormat,

        /// Also print per-connection records
        #[clap(long)]
        connections: bool,
    },

    /// Generate synthetic parallel load and verify the totals
    Stress {
        /// Ports to monitor, overriding the configuration
        #[clap(short, long, value_delimiter = ',', value_parser = clap::value_parser!(u16).range(1..))]
        ports: Vec<u16>,

        /// Number of event-emitting threads
        #[clap(short, long, default_value = "4")]
        threads: usize,

        /// Events per thread
        #[clap(short, long, default_value = "100000")]
        events: usize,

        /// Distinct sockets per thread
        #[clap(short, long, default_value = "64")]
        sockets: usize,
    },

    /// Generate background load and print per-port rates
    Watch {
        /// Ports to monitor, overriding the configuration
        #[clap(short, long, value_delimiter = ',', value_parser = clap::value_parser!(u16).range(1..))]
        ports: Vec<u16>,

        /// Print interval in milliseconds
        #[clap(short, long, default_value = "1000")]
        interval_ms: u64,

        /// Stop after this many seconds (runs until Ctrl-C when absent)
        #[clap(short, long)]
        duration_secs: Option<u64>,
    },

    /// Print the effective configuration
    Config,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Table,
    Json,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let cli = Cli::parse();

    let mut settings = Settings::load(cli.config.as_deref())
        .context("Failed to load settings")?;

    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(
        if cli.verbose { "debug" } else { settings.log_level.as_str() }
    )).init();

    // Execute the specified command
    match cli.command {
        Commands::Replay { trace, ports, workers, format, connections } => {
            settings.override_ports(&ports);
            commands::replay::run_replay(&settings, trace, workers, format, connections)?;
        },
        Commands::Stress { ports, threads, events, sockets } => {
            settings.override_ports(&ports);
            commands::stress::run_stress(&settings, threads, events, sockets)?;
        },
        Commands::Watch { ports, interval_ms, duration_secs } => {
            settings.override_ports(&ports);
            commands::watch::run_watch(&settings, interval_ms, duration_secs).await?;
        },
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&settings)?);
        },
    }

    Ok(())
}
