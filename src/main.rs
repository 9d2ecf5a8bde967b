//! cdr-ingest - split and ingest call-detail-record uploads
//!
//! # Usage
//!
//! ```bash
//! # Split only, leaving chunks in the output directory
//! cdr-ingest split calls.csv --rows 1000000 --out /var/tmp/cdr
//!
//! # Split and ingest
//! cdr-ingest --config cdr.toml upload calls.csv
//!
//! # Query what was ingested
//! cdr-ingest --config cdr.toml query --caller 441215598896 --take 10
//! ```

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cdr_ingest::ingest::{MemoryStore, RestIngestClient};
use cdr_ingest::pipeline::{prefix_for, splitter_for};
use cdr_ingest::query::{query_call_details, CallDetailFilter};
use cdr_ingest::streaming::{split_file, BoundPolicy};
use cdr_ingest::{upload, PipelineConfig, PipelineError};

/// Split and ingest call-detail-record CSV files
#[derive(Parser, Debug)]
#[command(name = "cdr-ingest")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Path to a TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log filter used when RUST_LOG is unset (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Split a CSV file into chunks without ingesting
    Split(SplitArgs),

    /// Split a CSV file and ingest every chunk
    Upload(UploadArgs),

    /// Query ingested call details
    Query(QueryArgs),
}

#[derive(Args, Debug)]
struct BoundArgs {
    /// Maximum data rows per chunk
    #[arg(long, conflicts_with = "bytes")]
    rows: Option<u64>,

    /// Maximum bytes per chunk, header included
    #[arg(long)]
    bytes: Option<u64>,

    /// Directory for chunk files
    #[arg(short, long)]
    out: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct SplitArgs {
    /// Input CSV file
    input: PathBuf,

    #[command(flatten)]
    bound: BoundArgs,
}

#[derive(Args, Debug)]
struct UploadArgs {
    /// Input CSV file
    input: PathBuf,

    #[command(flatten)]
    bound: BoundArgs,

    /// Ingest into an in-memory store instead of the destination
    #[arg(long)]
    dry_run: bool,
}

#[derive(Args, Debug)]
struct QueryArgs {
    /// Only calls made by this caller
    #[arg(long)]
    caller: Option<i64>,

    /// Maximum number of records
    #[arg(long)]
    take: Option<usize>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = init_logging(&cli.log_level) {
        eprintln!("{}", e);
        return ExitCode::FAILURE;
    }

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), PipelineError> {
    let mut config = match &cli.config {
        Some(path) => PipelineConfig::load(path)?,
        None => PipelineConfig::default(),
    };

    let cancel = CancellationToken::new();
    spawn_ctrl_c(cancel.clone());

    match cli.command {
        Command::Split(args) => {
            apply_bound_args(&mut config, &args.bound)?;
            let (splitter, transform) = splitter_for(&config, &cancel);
            let prefix = prefix_for(&file_name(&args.input));
            let chunks = split_file(
                &args.input,
                config.split.encoding()?,
                splitter,
                Some(prefix),
                config.split.bound,
                transform,
            )
            .await?;
            for chunk in &chunks {
                println!("{}\t{}", chunk.path.display(), chunk.row_count);
            }
            Ok(())
        }
        Command::Upload(args) => {
            apply_bound_args(&mut config, &args.bound)?;
            let file = std::fs::File::open(&args.input).map_err(|e| {
                PipelineError::io(format!("opening {}", args.input.display()), e)
            })?;
            let name = file_name(&args.input);

            let report = if args.dry_run {
                upload(file, &name, &config, MemoryStore::new(), cancel).await?
            } else {
                let client = RestIngestClient::from_config(&config)?;
                upload(file, &name, &config, client, cancel).await?
            };

            let deduplicated = report.outcomes.iter().filter(|o| o.deduplicated).count();
            info!(
                "Uploaded {} rows in {} chunk(s) ({} already present)",
                report.total_rows,
                report.chunks.len(),
                deduplicated
            );
            Ok(())
        }
        Command::Query(args) => {
            let client = RestIngestClient::from_config(&config)?;
            let filter = CallDetailFilter {
                caller: args.caller,
                take: args.take,
            };
            let records = query_call_details(&client, &filter).await?;
            let json = serde_json::to_string_pretty(&records)
                .map_err(|e| PipelineError::Internal(format!("Failed to render records: {}", e)))?;
            println!("{}", json);
            Ok(())
        }
    }
}

/// Command-line bounds override the config file.
fn apply_bound_args(config: &mut PipelineConfig, args: &BoundArgs) -> Result<(), PipelineError> {
    if let Some(rows) = args.rows {
        config.split.bound = BoundPolicy::Rows(rows);
    }
    if let Some(bytes) = args.bytes {
        config.split.bound = BoundPolicy::Bytes(bytes);
    }
    if let Some(out) = &args.out {
        config.split.output_dir = Some(out.clone());
    }
    config.validate()
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn spawn_ctrl_c(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, cancelling");
            cancel.cancel();
        }
    });
}

/// Initialize the tracing subscriber for logging
fn init_logging(level: &str) -> Result<(), PipelineError> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .map_err(|e| PipelineError::Config(format!("invalid log level: {}", e)))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .init();

    Ok(())
}
