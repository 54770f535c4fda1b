//! Run configuration threaded through the engines.
//!
//! Surface parsing (CLI flags, env) lives in `main.rs`; these structs are
//! what the library actually consumes, so tests can build them directly.

use chrono::NaiveDate;
use std::path::PathBuf;

use crate::compress::Compression;
use crate::format::OutputFormat;
use crate::pathgen::OutputDuration;

/// Connection settings for the S3-compatible object store.
#[derive(Debug, Clone)]
pub struct S3Config {
    /// Target bucket.
    pub bucket: String,
    /// Region override; falls back to the SDK's default chain.
    pub region: Option<String>,
    /// Custom endpoint for S3-compatible stores (MinIO, Ceph, ...).
    pub endpoint: Option<String>,
    /// Use path-style addressing; required by most custom endpoints.
    pub path_style: bool,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            region: None,
            endpoint: None,
            path_style: true,
        }
    }
}

/// Bounded-retry settings shared by the source reader and the object store
/// client.
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    /// Attempts before giving up on a transient failure.
    pub max_retries: u32,
    /// Delay between attempts in seconds.
    pub retry_delay_seconds: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            retry_delay_seconds: 5,
        }
    }
}

/// Configuration for one archive run.
#[derive(Debug, Clone)]
pub struct ArchiveConfig {
    /// Base name of the partitioned parent table.
    pub table: String,
    /// Inclusive calendar window; open ends archive everything parseable.
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    /// Timestamp column used for range-sliced extraction.
    pub date_column: Option<String>,
    /// Object key prefix template with {table}/{YYYY}/{MM}/{DD}/{HH}.
    pub path_template: String,
    /// Period of each output file.
    pub output_duration: OutputDuration,
    pub output_format: OutputFormat,
    pub compression: Compression,
    /// Level override; None uses the codec default.
    pub compression_level: Option<i32>,
    /// Compression parallelism hint.
    pub workers: u32,
    /// Discover partitions without issuing COUNT queries.
    pub skip_count: bool,
    /// Run every stage up to hashing but never PUT or mutate the cache.
    pub dry_run: bool,
    /// Cache directory override, mainly for tests.
    pub cache_dir: Option<PathBuf>,
    pub retry: RetryConfig,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            table: String::new(),
            start_date: None,
            end_date: None,
            date_column: None,
            path_template: "{table}/{YYYY}/{MM}".to_string(),
            output_duration: OutputDuration::Daily,
            output_format: OutputFormat::Jsonl,
            compression: Compression::Zstd,
            compression_level: None,
            workers: 1,
            skip_count: false,
            dry_run: false,
            cache_dir: None,
            retry: RetryConfig::default(),
        }
    }
}

impl ArchiveConfig {
    /// Destination identity for cache scoping: bucket plus template.
    pub fn destination(&self, bucket: &str) -> String {
        format!("s3://{bucket}/{}", self.path_template)
    }
}

/// What the restore run writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreMode {
    SchemaOnly,
    DataOnly,
    SchemaAndData,
}

impl RestoreMode {
    pub fn parse(s: &str) -> anyhow::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "schema-only" | "schema" => Ok(Self::SchemaOnly),
            "data-only" | "data" => Ok(Self::DataOnly),
            "schema-and-data" | "full" => Ok(Self::SchemaAndData),
            other => anyhow::bail!("unknown restore mode '{other}'"),
        }
    }

    pub fn creates_schema(&self) -> bool {
        matches!(self, Self::SchemaOnly | Self::SchemaAndData)
    }

    pub fn inserts_data(&self) -> bool {
        matches!(self, Self::DataOnly | Self::SchemaAndData)
    }
}

/// Where the restore engine learns column types from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaSource {
    /// Query the live catalog.
    Db,
    /// Apply a previously dumped schema file, then read the catalog.
    Dump,
    /// Sample the first archive file and infer.
    Inferred,
    /// Dump when a schema file is available, inference otherwise.
    Auto,
}

impl SchemaSource {
    pub fn parse(s: &str) -> anyhow::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "db" => Ok(Self::Db),
            "dump" => Ok(Self::Dump),
            "inferred" | "infer" => Ok(Self::Inferred),
            "auto" => Ok(Self::Auto),
            other => anyhow::bail!("unknown schema source '{other}'"),
        }
    }
}

/// Configuration for one restore run.
#[derive(Debug, Clone)]
pub struct RestoreConfig {
    pub table: String,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    /// Timestamp column used to route rows into hourly partitions.
    pub date_column: Option<String>,
    pub path_template: String,
    /// Format override; None detects from the filename.
    pub output_format: Option<OutputFormat>,
    /// Compression override; None detects from the filename.
    pub compression: Option<Compression>,
    pub restore_mode: RestoreMode,
    pub schema_source: SchemaSource,
    /// Schema SQL file for the dump source.
    pub schema_path: Option<PathBuf>,
    /// Create one partition per period of this duration.
    pub table_partition_range: Option<OutputDuration>,
    /// Partition naming template; None uses the built-in pattern per range.
    pub table_partition_template: Option<String>,
    pub dry_run: bool,
    pub retry: RetryConfig,
}

impl Default for RestoreConfig {
    fn default() -> Self {
        Self {
            table: String::new(),
            start_date: None,
            end_date: None,
            date_column: None,
            path_template: "{table}/{YYYY}/{MM}".to_string(),
            output_format: None,
            compression: None,
            restore_mode: RestoreMode::SchemaAndData,
            schema_source: SchemaSource::Auto,
            schema_path: None,
            table_partition_range: None,
            table_partition_template: None,
            dry_run: false,
            retry: RetryConfig::default(),
        }
    }
}
