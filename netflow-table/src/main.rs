use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Args, CommandFactory, Parser, Subcommand, ValueEnum};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use netflow_table::capture::{self, CaptureOptions, RingConfig};
use netflow_table::{FlowTable, MatchMode, TableConfig};

#[derive(Parser)]
#[command(name = "netflow-table")]
#[command(about = "Per-flow traffic accounting over a lock-striped flow table", long_about = None)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace); RUST_LOG wins if set
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture from an interface and aggregate packets into flow records
    Capture(CaptureCommand),
}

#[derive(Args)]
struct CaptureCommand {
    /// Network interface to join via AF_PACKET
    #[arg(long, value_name = "IFACE")]
    iface: String,
    /// Number of worker threads pulling frames from the fanout group
    #[arg(long, default_value_t = 1)]
    workers: usize,
    /// Optional PACKET_FANOUT group id
    #[arg(long, value_name = "GROUP")]
    fanout_group: Option<u16>,
    /// Seconds between flow table reports
    #[arg(long, default_value_t = 5)]
    report_interval_secs: u64,
    /// Flow table slot count (power of two, clamped to the table maximum)
    #[arg(long, value_name = "COUNT", default_value_t = netflow_table::DEFAULT_ENTRIES)]
    entries: u32,
    /// Seed stored alongside the table's hash function
    #[arg(long, default_value_t = 0)]
    hash_seed: u32,
    /// Match flows on source/destination address only, ignoring ports and protocol
    #[arg(long = "legacy-address-match", action = ArgAction::SetTrue)]
    legacy_address_match: bool,
    /// NUMA node the table is meant to live on
    #[arg(long, value_name = "NODE")]
    numa_node: Option<u32>,
    /// CSV file rewritten atomically on every report
    #[arg(long, value_name = "PATH")]
    export_path: Option<PathBuf>,
    /// Size of each tpacket block (bytes)
    #[arg(long, value_name = "BYTES", default_value_t = capture::DEFAULT_BLOCK_SIZE)]
    block_size: u32,
    /// Number of blocks provisioned for the RX ring
    #[arg(long, value_name = "COUNT", default_value_t = capture::DEFAULT_BLOCK_COUNT)]
    block_count: u32,
    /// Size of each frame within a block (bytes)
    #[arg(long, value_name = "BYTES", default_value_t = capture::DEFAULT_FRAME_SIZE)]
    frame_size: u32,
    /// Milliseconds before an idle block is recycled
    #[arg(long, value_name = "MILLIS", default_value_t = capture::DEFAULT_BLOCK_TIMEOUT_MS)]
    block_timeout_ms: u32,
}

fn init_logging(verbose: u8, format: LogFormat) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry
            .with(fmt::layer().json().flatten_event(true).with_ansi(false))
            .init(),
        LogFormat::Text => registry.with(fmt::layer().with_target(true)).init(),
    }
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("netflow-table error: {err:?}");
        exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_format);

    match cli.command {
        Some(Commands::Capture(cmd)) => {
            let config = TableConfig {
                entries: cmd.entries,
                seed: cmd.hash_seed,
                match_mode: if cmd.legacy_address_match {
                    MatchMode::AddressPair
                } else {
                    MatchMode::FiveTuple
                },
                ..TableConfig::default()
            };
            let record_size = std::mem::size_of::<netflow_table::FlowRecord>() as u32;
            let table = FlowTable::create(config, cmd.numa_node, record_size)
                .context("failed to create flow table")?;
            let table = Arc::new(table);

            let opts = CaptureOptions {
                iface: cmd.iface,
                workers: cmd.workers,
                fanout_group: cmd.fanout_group,
                report_interval: Duration::from_secs(cmd.report_interval_secs.max(1)),
                ring: RingConfig {
                    block_size: cmd.block_size,
                    block_count: cmd.block_count,
                    frame_size: cmd.frame_size,
                    block_timeout_ms: cmd.block_timeout_ms,
                },
                export_path: cmd.export_path,
            };
            capture::run_capture(opts, table.clone()).await?;

            if let Ok(table) = Arc::try_unwrap(table) {
                FlowTable::destroy(Some(table)).context("failed to release flow table")?;
            }
        }
        None => {
            Cli::command().print_help().ok();
            println!();
        }
    }

    Ok(())
}
