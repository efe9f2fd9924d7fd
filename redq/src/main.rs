use std::{path::PathBuf, process::exit, time::Duration};

use anyhow::Result;
use clap::{Args, CommandFactory, Parser, Subcommand};
use redq::{
    ledger::{DEFAULT_FLUSH_INTERVAL_SECS, DEFAULT_IDLE_TIMEOUT_SECS},
    node::{self, KeyKind},
};
use redq_common::MAX_MAP_ENTRIES;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "redq")]
#[command(about = "Per-host bandwidth accounting and MAC blocklisting", long_about = None)]
struct Cli {
    /// Log filter used when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture on an interface, account usage and drop blocklisted sources
    Node(NodeCommand),
}

#[derive(Args)]
struct NodeCommand {
    /// Network interface to capture on via AF_PACKET
    #[arg(long, value_name = "IFACE")]
    iface: String,
    /// Number of workers pulling frames from the fanout group
    #[arg(long, default_value_t = 1)]
    workers: usize,
    /// Optional PACKET_FANOUT group id
    #[arg(long, value_name = "GROUP")]
    fanout_group: Option<u16>,
    /// Identity usage is accounted under
    #[arg(long, value_enum, default_value_t = KeyKind::Mac)]
    key: KeyKind,
    /// File with one blocked MAC address per line
    #[arg(long, value_name = "FILE")]
    blocklist: Option<PathBuf>,
    /// Entries per direction before the least recently used one is evicted
    #[arg(long, default_value_t = MAX_MAP_ENTRIES)]
    capacity: usize,
    /// Bytes copied out of each frame
    #[arg(long, value_name = "BYTES", default_value_t = node::DEFAULT_SNAPLEN)]
    snaplen: usize,
    /// Seconds between table drains
    #[arg(long, default_value_t = node::DEFAULT_REPORT_INTERVAL_SECS)]
    report_interval_secs: u64,
    /// Seconds without traffic before a host's usage window is emitted
    #[arg(long, default_value_t = DEFAULT_IDLE_TIMEOUT_SECS)]
    idle_timeout_secs: u64,
    /// Longest a usage window stays open while traffic continues
    #[arg(long, default_value_t = DEFAULT_FLUSH_INTERVAL_SECS)]
    flush_interval_secs: u64,
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("redq error: {err:?}");
        exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Some(Commands::Node(cmd)) => {
            let opts = node::NodeOptions {
                iface: cmd.iface,
                workers: cmd.workers,
                fanout_group: cmd.fanout_group,
                key: cmd.key,
                capacity: cmd.capacity,
                blocklist: cmd.blocklist,
                snaplen: cmd.snaplen,
                report_interval: Duration::from_secs(cmd.report_interval_secs),
                idle_timeout: Duration::from_secs(cmd.idle_timeout_secs),
                flush_interval: Duration::from_secs(cmd.flush_interval_secs),
            };
            node::run_packet_pipeline(opts).await?;
        }
        None => {
            Cli::command().print_help().ok();
            println!();
        }
    }

    Ok(())
}
