use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::atomic::Ordering;

use chainscry::config::Config;
use chainscry::error::ScanError;
use chainscry::index::{ImageIndex, ImageRecord, Query};
use chainscry::logging::{LogFormat, init_logging};
use chainscry::rpc::CoreRpc;
use chainscry::scanner::{PassSummary, Scanner};
use chainscry::stats::Stats;
use chainscry::types::{ExtractionMethod, ImageFormat};

#[derive(Parser)]
#[command(name = "chainscry")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Find images embedded in ledger blocks and the mempool")]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[arg(long, global = true, env = "BITCOIN_RPC_URL")]
    rpc_url: Option<String>,

    #[arg(long, global = true, env = "BITCOIN_RPC_USER")]
    rpc_user: Option<String>,

    #[arg(long, global = true, env = "BITCOIN_RPC_PASSWORD", hide_env_values = true)]
    rpc_password: Option<String>,

    #[arg(long, global = true)]
    log_level: Option<String>,

    #[arg(long, global = true)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Catch up to the tip, then keep polling the mempool
    Scan {
        #[arg(long)]
        start_height: Option<u64>,
    },

    /// Catch up to the current tip once and exit
    Pass {
        #[arg(long)]
        start_height: Option<u64>,
    },

    /// Scan a historical range without moving the cursor
    Batch {
        start: u64,
        end: u64,
        #[arg(long, default_value_t = 1)]
        step: u64,
    },

    /// Query the index
    Search {
        #[arg(short, long)]
        format: Option<ImageFormat>,

        #[arg(short, long)]
        method: Option<ExtractionMethod>,

        /// Inclusive height range, MIN-MAX
        #[arg(short, long, value_parser = parse_block_range)]
        blocks: Option<(u64, u64)>,

        #[arg(short, long)]
        limit: Option<usize>,

        #[arg(long)]
        json: bool,
    },

    /// Show images found in a transaction
    Lookup {
        txid: String,

        /// Fetch and scan the transaction first
        #[arg(long)]
        scan: bool,
    },

    /// Summarise the index
    Stats {
        #[arg(long)]
        json: bool,
    },
}

fn parse_block_range(s: &str) -> Result<(u64, u64), String> {
    let (min, max) = s
        .split_once('-')
        .ok_or_else(|| format!("expected MIN-MAX, got {s}"))?;
    let min: u64 = min.trim().parse().map_err(|e| format!("bad MIN: {e}"))?;
    let max: u64 = max.trim().parse().map_err(|e| format!("bad MAX: {e}"))?;
    if min > max {
        return Err(format!("MIN {min} is above MAX {max}"));
    }
    Ok((min, max))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    init_logging(config.logging.format, &config.logging.level)
        .map_err(anyhow::Error::msg)
        .context("Failed to initialise logging")?;

    match cli.command {
        Commands::Scan { start_height } => {
            let mut scanner = connect(&config, start_height)?;
            let summary = scanner.run().context("Scan stopped")?;
            print_summary(&summary);
        }
        Commands::Pass { start_height } => {
            let mut scanner = connect(&config, start_height)?;
            match scanner.run_pass() {
                Ok(summary) => print_summary(&summary),
                Err(ScanError::StopRequested) => print_summary(scanner.summary()),
                Err(err) => return Err(err).context("Pass failed"),
            }
        }
        Commands::Batch { start, end, step } => {
            if start > end {
                bail!("start {start} is above end {end}");
            }
            let mut scanner = connect(&config, None)?;
            let summary = scanner
                .scan_range(start, end, step)
                .context("Range scan failed")?;
            print_summary(&summary);
        }
        Commands::Search {
            format,
            method,
            blocks,
            limit,
            json,
        } => {
            let index = open_index(&config)?;
            let mut query = Query::new();
            if let Some(format) = format {
                query = query.format(format);
            }
            if let Some(method) = method {
                query = query.method(method);
            }
            if let Some((min, max)) = blocks {
                query = query.blocks(min..=max);
            }
            if let Some(limit) = limit {
                query = query.limit(limit);
            }
            let records = index.query(&query);
            if json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else {
                print_records(&records);
            }
        }
        Commands::Lookup { txid, scan } => {
            let records = if scan {
                let mut scanner = connect(&config, None)?;
                scanner
                    .scan_transaction(&txid)
                    .with_context(|| format!("Failed to scan {txid}"))?
            } else {
                open_index(&config)?.by_txid(&txid)
            };
            if records.is_empty() {
                println!("no images found for {txid}");
            } else {
                print_records(&records);
            }
        }
        Commands::Stats { json } => {
            let index = open_index(&config)?;
            let stats = Stats::from_records(&index.records());
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                print!("{}", stats.render_text());
            }
        }
    }
    Ok(())
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(dir) = &cli.data_dir {
        config.data_dir = dir.clone();
    }
    if let Some(url) = &cli.rpc_url {
        config.rpc.url = url.clone();
    }
    if let Some(user) = &cli.rpc_user {
        config.rpc.user = Some(user.clone());
    }
    if let Some(password) = &cli.rpc_password {
        config.rpc.password = Some(password.clone());
    }
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    if let Some(format) = cli.log_format {
        config.logging.format = format;
    }
    config.check().context("Invalid configuration")?;
    Ok(config)
}

fn open_index(config: &Config) -> Result<ImageIndex> {
    ImageIndex::open(&config.data_dir)
        .with_context(|| format!("Failed to open index in {}", config.data_dir.display()))
}

fn connect(config: &Config, start_height: Option<u64>) -> Result<Scanner<CoreRpc>> {
    let mut config = config.clone();
    if let Some(height) = start_height {
        config = config.with_start_height(height);
    }

    let rpc = CoreRpc::connect(&config.rpc.url, config.rpc_auth())
        .with_context(|| format!("Failed to connect to {}", config.rpc.url))?;
    let scanner = Scanner::from_config(rpc, &config).context("Failed to open scanner state")?;

    let stop = scanner.stop_handle();
    ctrlc::set_handler(move || {
        stop.store(true, Ordering::SeqCst);
    })
    .context("Failed to set Ctrl+C handler")?;

    Ok(scanner)
}

fn print_summary(summary: &PassSummary) {
    println!(
        "blocks: {}  transactions: {}  mempool: {}  candidates: {}  new: {}  repaired: {}  repair failures: {}",
        summary.blocks,
        summary.transactions,
        summary.mempool_transactions,
        summary.images.candidates,
        summary.images.accepted,
        summary.images.repaired,
        summary.images.repair_failures,
    );
}

fn print_records(records: &[ImageRecord]) {
    for record in records {
        println!(
            "{}  {:<5} {:>8} B  {:<26} {}",
            record.hash,
            record.format_name(),
            record.size,
            record.validity.name(),
            record.path.display()
        );
        for p in &record.provenance {
            println!("    {:<17} {} @ {}", p.method.name(), p.txid, p.block);
        }
    }
}
