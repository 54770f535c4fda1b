//! Per-partition archive pipeline.
//!
//! Each partition moves through cache probe, extract, format, compress,
//! hash, remote probe, upload and record, in that order, with the first
//! error short-circuiting to a failed outcome. The probes are what make
//! re-runs cheap: when the cached metadata agrees with the object store the
//! whole extract-to-upload section is skipped for the cost of one HEAD.

use anyhow::{Result, anyhow};
use chrono::{DateTime, NaiveDate, Utc};
use std::fmt;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::cache::{FileMetadata, MetadataCache};
use crate::config::ArchiveConfig;
use crate::etag::{self, PART_SIZE};
use crate::format::OutputFormat;
use crate::pathgen::{self, PartitionGranularity};
use crate::scheduler::EventSender;
use crate::source::SourceReader;
use crate::storage::{HeadResult, ObjectStore};

/// One partition table (or one slice of it) queued for archival.
#[derive(Debug, Clone)]
pub struct Partition {
    /// Child table name, e.g. `flights_20240315`.
    pub table: String,
    /// Calendar day encoded in the name (first of month for monthly).
    pub date: NaiveDate,
    pub granularity: PartitionGranularity,
    /// Row count filled in by discovery; -1 when unknown.
    pub row_count: i64,
    /// Custom half-open timestamp range for range-sliced extraction.
    pub range: Option<(DateTime<Utc>, DateTime<Utc>)>,
}

impl Partition {
    /// Timestamp the object key and filename are derived from.
    pub fn effective_timestamp(&self) -> DateTime<Utc> {
        self.range
            .map(|(start, _)| start)
            .unwrap_or_else(|| pathgen::date_start(self.date))
    }

    /// Cache key. Slices of one partition are tracked independently.
    pub fn cache_key(&self, duration: crate::pathgen::OutputDuration) -> String {
        match self.range {
            Some((start, _)) => format!(
                "{}:{}",
                self.table,
                pathgen::period_suffix(start, duration)
            ),
            None => self.table.clone(),
        }
    }
}

/// What the cache probe decided after comparing cached metadata with a
/// HEAD of the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeDecision {
    /// Cache and store agree; nothing to do.
    Skip,
    /// Remote is multipart but the cache predates tag tracking: re-extract
    /// and recompute to verify instead of trusting the size alone.
    Reverify,
    /// Extract and upload.
    Extract,
}

/// Exact skip decision against the cached entry. Sizes must match, and the
/// remote ETag must equal the cached content hash (single-part) or the
/// cached multipart tag (multipart).
pub fn cache_probe_decision(cached: &FileMetadata, head: &HeadResult) -> ProbeDecision {
    if !head.exists || head.size != cached.size {
        return ProbeDecision::Extract;
    }
    if etag::is_multipart(&head.etag) {
        if cached.multipart_etag.is_empty() {
            return ProbeDecision::Reverify;
        }
        if head.etag == cached.multipart_etag {
            return ProbeDecision::Skip;
        }
        return ProbeDecision::Extract;
    }
    if head.etag == cached.md5 {
        ProbeDecision::Skip
    } else {
        ProbeDecision::Extract
    }
}

/// Skip decision against freshly computed bytes, used after extraction.
/// True means the remote object already holds exactly these bytes.
pub fn remote_matches(head: &HeadResult, size: u64, md5: &str, multipart_tag: &str) -> bool {
    if !head.exists || head.size != size {
        return false;
    }
    if etag::is_multipart(&head.etag) {
        head.etag == multipart_tag
    } else {
        head.etag == md5
    }
}

/// Pipeline stage, used for progress events and error labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    CacheProbe,
    Extract,
    Format,
    Compress,
    Hash,
    RemoteProbe,
    Upload,
    Record,
}

impl Stage {
    pub fn label(&self) -> &'static str {
        match self {
            Self::CacheProbe => "cache-probe",
            Self::Extract => "extract",
            Self::Format => "format",
            Self::Compress => "compress",
            Self::Hash => "hash",
            Self::RemoteProbe => "remote-probe",
            Self::Upload => "upload",
            Self::Record => "record",
        }
    }
}

/// Broad classification used by the scheduler's abort policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    ConfigInvalid,
    PermissionDenied,
    NotFound,
    Transient,
    Malformed,
    Corrupted,
    Cancelled,
    Fatal,
}

impl FailureKind {
    /// Failures that indicate the whole run cannot succeed.
    pub fn is_systemic(&self) -> bool {
        matches!(self, Self::ConfigInvalid | Self::PermissionDenied)
    }
}

/// Classify an error by its message chain. Coarse on purpose: the policy
/// only distinguishes systemic failures, cancellation, and the rest.
pub fn classify(err: &anyhow::Error) -> FailureKind {
    let text = format!("{err:#}").to_ascii_lowercase();
    if text.contains("cancelled") {
        FailureKind::Cancelled
    } else if text.contains("permission denied") {
        FailureKind::PermissionDenied
    } else if text.contains("does not exist") || text.contains("not found") {
        FailureKind::NotFound
    } else if text.contains("connection") || text.contains("timed out") || text.contains("reset") {
        FailureKind::Transient
    } else {
        FailureKind::Fatal
    }
}

/// Structured failure carrying the partition identifier and the stage that
/// produced it.
#[derive(Debug)]
pub struct ProcessError {
    pub partition: String,
    pub stage: Stage,
    pub kind: FailureKind,
    pub source: anyhow::Error,
}

impl fmt::Display for ProcessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} failed at {}: {:#}",
            self.partition,
            self.stage.label(),
            self.source
        )
    }
}

impl std::error::Error for ProcessError {}

/// Result of pushing one partition through the pipeline.
#[derive(Debug, Clone)]
pub struct ProcessOutcome {
    pub partition: String,
    pub date: NaiveDate,
    pub object_key: String,
    pub compressed: bool,
    pub uploaded: bool,
    pub skipped: bool,
    pub skip_reason: String,
    pub rows: u64,
    /// Compressed size of the file that exists (or would exist) remotely.
    pub bytes_written: u64,
    pub duration: std::time::Duration,
    pub failed_stage: Option<Stage>,
    pub failure_kind: Option<FailureKind>,
    pub error: Option<String>,
}

impl ProcessOutcome {
    fn new(partition: &Partition, key: String) -> Self {
        Self {
            partition: partition.table.clone(),
            date: partition.date,
            object_key: key,
            compressed: false,
            uploaded: false,
            skipped: false,
            skip_reason: String::new(),
            rows: 0,
            bytes_written: 0,
            duration: std::time::Duration::ZERO,
            failed_stage: None,
            failure_kind: None,
            error: None,
        }
    }
}

pub struct PartitionProcessor<'a> {
    pub cfg: &'a ArchiveConfig,
    pub cache: &'a mut MetadataCache,
    pub store: &'a ObjectStore,
    pub source: &'a SourceReader,
    pub events: &'a EventSender,
    pub cancel: &'a CancellationToken,
    /// Wall-clock start of the whole run, recorded into cache entries.
    pub process_start: DateTime<Utc>,
}

impl PartitionProcessor<'_> {
    /// Run the state machine for one partition. Failures are recorded in
    /// the cache and folded into the outcome; the queue decides whether to
    /// continue.
    pub async fn process(&mut self, partition: &Partition) -> ProcessOutcome {
        let started = Instant::now();
        let cache_key = partition.cache_key(self.cfg.output_duration);
        let mut outcome = match self.run(partition, &cache_key).await {
            Ok(outcome) => outcome,
            Err(err) => {
                let message = format!("{:#}", err.source);
                self.cache.set_error(&cache_key, &message, Utc::now());
                let mut outcome = ProcessOutcome::new(partition, String::new());
                outcome.failed_stage = Some(err.stage);
                outcome.failure_kind = Some(err.kind);
                outcome.error = Some(err.to_string());
                outcome
            }
        };
        outcome.duration = started.elapsed();
        outcome
    }

    async fn run(
        &mut self,
        partition: &Partition,
        cache_key: &str,
    ) -> Result<ProcessOutcome, ProcessError> {
        let fail = |stage: Stage, source: anyhow::Error| ProcessError {
            partition: partition.table.clone(),
            stage,
            kind: classify(&source),
            source,
        };

        let ts = partition.effective_timestamp();
        let key = pathgen::object_key(
            &self.cfg.path_template,
            &self.cfg.table,
            ts,
            self.cfg.output_duration,
            self.cfg.output_format.extension(),
            self.cfg.compression.extension(),
        );
        let mut outcome = ProcessOutcome::new(partition, key.clone());

        // --- CacheProbe ------------------------------------------------
        self.events.stage(&partition.table, Stage::CacheProbe);
        let now = Utc::now();
        if let Some(cached) =
            self.cache
                .get_file_metadata(cache_key, &key, partition.date, now)
        {
            let head = self.store.head(&key).await;
            match cache_probe_decision(&cached, &head) {
                ProbeDecision::Skip => {
                    debug!("Skipping {}: cached metadata matches S3", partition.table);
                    outcome.skipped = true;
                    outcome.skip_reason = "Cached metadata matches S3".to_string();
                    outcome.bytes_written = cached.size;
                    outcome.rows = partition.row_count.max(0) as u64;
                    return Ok(outcome);
                }
                ProbeDecision::Reverify => {
                    info!(
                        "{}: remote is multipart but no cached tag, re-extracting to verify",
                        partition.table
                    );
                }
                ProbeDecision::Extract => {}
            }
        }

        // --- Extract / Format -----------------------------------------
        self.events.stage(&partition.table, Stage::Extract);
        let schema = if self.cfg.output_format == OutputFormat::Parquet {
            Some(
                self.source
                    .table_schema(&partition.table)
                    .await
                    .map_err(|e| fail(Stage::Extract, e))?,
            )
        } else {
            None
        };
        let mut encoder = self
            .cfg
            .output_format
            .encoder(schema)
            .map_err(|e| fail(Stage::Format, e))?;

        let events = self.events;
        let table = partition.table.clone();
        let rows = self
            .source
            .read_rows(
                &partition.table,
                partition.range,
                self.cfg.date_column.as_deref(),
                partition.row_count,
                self.cancel,
                |row| encoder.write_row(&row),
                |count| events.row_progress(&table, count),
            )
            .await
            .map_err(|e| fail(Stage::Extract, e))?;
        outcome.rows = rows;

        if rows == 0 {
            outcome.skipped = true;
            outcome.skip_reason = if partition.range.is_some() {
                "No data in time range".to_string()
            } else {
                "No rows in partition".to_string()
            };
            debug!("Skipping {}: {}", partition.table, outcome.skip_reason);
            return Ok(outcome);
        }

        self.events.stage(&partition.table, Stage::Format);
        let encoded = encoder.finish().map_err(|e| fail(Stage::Format, e))?;
        let uncompressed_size = encoded.len() as u64;

        // --- Compress --------------------------------------------------
        self.events.stage(&partition.table, Stage::Compress);
        self.check_cancelled(partition, Stage::Compress)?;
        let compressed = self
            .cfg
            .compression
            .compress(&encoded, self.cfg.compression_level, self.cfg.workers)
            .map_err(|e| fail(Stage::Compress, e))?;
        drop(encoded);
        outcome.compressed = true;
        outcome.bytes_written = compressed.len() as u64;

        // --- Hash ------------------------------------------------------
        self.events.stage(&partition.table, Stage::Hash);
        let content_hash = etag::content_md5(&compressed);
        // The multipart tag is cheap to compute and lets the skip decision
        // match objects uploaded in parts by any client.
        let multipart_tag = if compressed.len() > PART_SIZE {
            etag::multipart_etag(&compressed)
        } else {
            String::new()
        };

        // --- RemoteProbe ----------------------------------------------
        self.events.stage(&partition.table, Stage::RemoteProbe);
        self.check_cancelled(partition, Stage::RemoteProbe)?;
        let head = self.store.head(&key).await;
        if remote_matches(&head, compressed.len() as u64, &content_hash, &multipart_tag) {
            debug!("Skipping {}: remote object matches local bytes", partition.table);
            outcome.skipped = true;
            outcome.skip_reason = "Remote object matches local content".to_string();
            self.record(
                cache_key,
                &key,
                &outcome,
                uncompressed_size,
                &content_hash,
                &multipart_tag,
                true,
            )
            .map_err(|e| fail(Stage::Record, e))?;
            return Ok(outcome);
        }

        // --- Upload ----------------------------------------------------
        if self.cfg.dry_run {
            info!(
                "[dry-run] Would upload {} ({} bytes) to {key}",
                partition.table,
                compressed.len()
            );
            outcome.skip_reason = "Would upload (dry run)".to_string();
            return Ok(outcome);
        }

        self.events.stage(&partition.table, Stage::Upload);
        let content_type = self
            .cfg
            .compression
            .content_type()
            .unwrap_or_else(|| self.cfg.output_format.content_type());
        self.store
            .put(&key, compressed, content_type)
            .await
            .map_err(|e| fail(Stage::Upload, e))?;
        outcome.uploaded = true;
        info!(
            "Uploaded {} rows from {} to {key} ({} bytes)",
            rows, partition.table, outcome.bytes_written
        );

        // --- Record ----------------------------------------------------
        self.events.stage(&partition.table, Stage::Record);
        self.record(
            cache_key,
            &key,
            &outcome,
            uncompressed_size,
            &content_hash,
            &multipart_tag,
            true,
        )
        .map_err(|e| fail(Stage::Record, e))?;

        Ok(outcome)
    }

    #[allow(clippy::too_many_arguments)]
    fn record(
        &mut self,
        cache_key: &str,
        key: &str,
        outcome: &ProcessOutcome,
        uncompressed_size: u64,
        content_hash: &str,
        multipart_tag: &str,
        uploaded: bool,
    ) -> Result<()> {
        if self.cfg.dry_run {
            return Ok(());
        }
        self.cache.set_file_metadata(
            cache_key,
            key,
            outcome.bytes_written,
            uncompressed_size,
            content_hash,
            multipart_tag,
            uploaded,
            self.process_start,
            Utc::now(),
        );
        Ok(())
    }

    fn check_cancelled(&self, partition: &Partition, stage: Stage) -> Result<(), ProcessError> {
        if self.cancel.is_cancelled() {
            let source = anyhow!("cancelled");
            return Err(ProcessError {
                partition: partition.table.clone(),
                stage,
                kind: FailureKind::Cancelled,
                source,
            });
        }
        Ok(())
    }
}
