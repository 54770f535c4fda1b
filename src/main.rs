use anyhow::Result;
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use std::io::IsTerminal;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use pgarchive::commands::{handle_archive, handle_restore};
use pgarchive::compress::Compression;
use pgarchive::config::{
    ArchiveConfig, RestoreConfig, RestoreMode, RetryConfig, S3Config, SchemaSource,
};
use pgarchive::format::OutputFormat;
use pgarchive::log_format::CompactFormat;
use pgarchive::pathgen::OutputDuration;

/// Window allowed for a graceful stop after the first Ctrl-C.
const SHUTDOWN_GRACE_SECONDS: u64 = 2;

#[derive(Parser)]
#[command(
    name = "pgarchive",
    version,
    about = "Archive date-partitioned PostgreSQL tables to S3-compatible storage"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Archive partitions of a table into the object store
    Archive(ArchiveArgs),
    /// Restore archived files back into the database
    Restore(RestoreArgs),
}

#[derive(Args)]
struct CommonArgs {
    /// PostgreSQL connection string
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,
    /// Target bucket
    #[arg(long, env = "PGARCHIVE_BUCKET")]
    bucket: String,
    /// Region override for the object store
    #[arg(long, env = "AWS_REGION")]
    region: Option<String>,
    /// Custom S3-compatible endpoint (MinIO, Ceph, ...)
    #[arg(long, env = "AWS_ENDPOINT_URL")]
    endpoint: Option<String>,
    /// Base name of the partitioned parent table
    #[arg(long)]
    table: String,
    /// Inclusive start of the calendar window (YYYY-MM-DD)
    #[arg(long)]
    start_date: Option<NaiveDate>,
    /// Inclusive end of the calendar window (YYYY-MM-DD)
    #[arg(long)]
    end_date: Option<NaiveDate>,
    /// Timestamp column for range slicing and hourly restore routing
    #[arg(long)]
    date_column: Option<String>,
    /// Object key prefix template ({table}, {YYYY}, {MM}, {DD}, {HH})
    #[arg(long, default_value = "{table}/{YYYY}/{MM}")]
    path_template: String,
    /// Attempts for transient database and object store failures
    #[arg(long, default_value_t = 5)]
    max_retries: u32,
    /// Delay between retry attempts in seconds
    #[arg(long, default_value_t = 5)]
    retry_delay_seconds: u64,
    /// Log what would happen without uploading or mutating anything
    #[arg(long)]
    dry_run: bool,
}

#[derive(Args)]
struct ArchiveArgs {
    #[command(flatten)]
    common: CommonArgs,
    /// Period of each output file: hourly, daily, weekly, monthly, yearly
    #[arg(long, default_value = "daily")]
    output_duration: String,
    /// Output format: jsonl, csv, parquet
    #[arg(long, default_value = "jsonl")]
    output_format: String,
    /// Compression: zstd, lz4, gzip, none
    #[arg(long, default_value = "zstd")]
    compression: String,
    /// Compression level; defaults to the codec's own default
    #[arg(long)]
    compression_level: Option<i32>,
    /// Compression worker threads
    #[arg(long, default_value_t = 1)]
    workers: u32,
    /// Discover partitions without issuing COUNT queries
    #[arg(long)]
    skip_count: bool,
    /// Metadata cache directory override
    #[arg(long)]
    cache_dir: Option<PathBuf>,
}

#[derive(Args)]
struct RestoreArgs {
    #[command(flatten)]
    common: CommonArgs,
    /// schema-only, data-only, or schema-and-data
    #[arg(long, default_value = "schema-and-data")]
    restore_mode: String,
    /// Where column types come from: db, dump, inferred, auto
    #[arg(long, default_value = "auto")]
    schema_source: String,
    /// Schema SQL file for schema-source=dump
    #[arg(long)]
    schema_path: Option<PathBuf>,
    /// Create one partition per period: hourly, daily, weekly, monthly, yearly
    #[arg(long)]
    table_partition_range: Option<String>,
    /// Partition naming template overriding the built-in pattern
    #[arg(long)]
    table_partition_template: Option<String>,
    /// Format override when filenames are not self-describing
    #[arg(long)]
    output_format: Option<String>,
    /// Compression override when filenames are not self-describing
    #[arg(long)]
    compression: Option<String>,
}

impl CommonArgs {
    fn s3(&self) -> S3Config {
        S3Config {
            bucket: self.bucket.clone(),
            region: self.region.clone(),
            endpoint: self.endpoint.clone(),
            path_style: true,
        }
    }

    fn retry(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.max_retries.max(1),
            retry_delay_seconds: self.retry_delay_seconds,
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .event_format(CompactFormat {
            ansi: std::io::stderr().is_terminal(),
        })
        .with_writer(std::io::stderr)
        .init();
}

/// First Ctrl-C requests a graceful stop; a short grace window later the
/// process exits hard.
fn install_shutdown_handler() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        warn!("Interrupt received, stopping at the next safe point...");
        token.cancel();
        tokio::time::sleep(std::time::Duration::from_secs(SHUTDOWN_GRACE_SECONDS)).await;
        warn!("Grace period elapsed, exiting");
        std::process::exit(130);
    });
    cancel
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Archive(args) => {
            let cfg = ArchiveConfig {
                table: args.common.table.clone(),
                start_date: args.common.start_date,
                end_date: args.common.end_date,
                date_column: args.common.date_column.clone(),
                path_template: args.common.path_template.clone(),
                output_duration: OutputDuration::parse(&args.output_duration)?,
                output_format: OutputFormat::parse(&args.output_format)?,
                compression: Compression::parse(&args.compression)?,
                compression_level: args.compression_level,
                workers: args.workers.max(1),
                skip_count: args.skip_count,
                dry_run: args.common.dry_run,
                cache_dir: args.cache_dir.clone(),
                retry: args.common.retry(),
            };
            let cancel = install_shutdown_handler();
            let summary =
                handle_archive(&args.common.database_url, args.common.s3(), cfg, cancel).await?;
            if summary.cancelled {
                warn!("Run was cancelled before completing the queue");
            }
            if summary.failed > 0 {
                anyhow::bail!("{} partitions failed", summary.failed);
            }
        }
        Command::Restore(args) => {
            let cfg = RestoreConfig {
                table: args.common.table.clone(),
                start_date: args.common.start_date,
                end_date: args.common.end_date,
                date_column: args.common.date_column.clone(),
                path_template: args.common.path_template.clone(),
                output_format: args
                    .output_format
                    .as_deref()
                    .map(OutputFormat::parse)
                    .transpose()?,
                compression: args
                    .compression
                    .as_deref()
                    .map(Compression::parse)
                    .transpose()?,
                restore_mode: RestoreMode::parse(&args.restore_mode)?,
                schema_source: SchemaSource::parse(&args.schema_source)?,
                schema_path: args.schema_path.clone(),
                table_partition_range: args
                    .table_partition_range
                    .as_deref()
                    .map(OutputDuration::parse)
                    .transpose()?,
                table_partition_template: args.table_partition_template.clone(),
                dry_run: args.common.dry_run,
                retry: args.common.retry(),
            };
            let cancel = install_shutdown_handler();
            let summary =
                handle_restore(&args.common.database_url, args.common.s3(), cfg, cancel).await?;
            if summary.cancelled {
                warn!("Restore was cancelled before completing");
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => info!("Done"),
        Err(e) => {
            error!("{e:#}");
            std::process::exit(1);
        }
    }
}
