//! Restore engine: the inverse of the archive pipeline.
//!
//! Lists the archive, detects format and compression per file, obtains or
//! infers a schema, creates targets, and re-inserts rows idempotently.
//! A failure on one file skips that file and continues; only setup errors
//! (listing, schema) abort the run.

pub mod insert;
pub mod listing;
pub mod schema;
pub mod target;

use anyhow::{Context, Result, bail};
use chrono::Duration;
use std::collections::HashSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{RestoreConfig, RestoreMode};
use crate::pathgen::{self, OutputDuration};
use crate::rowset::{Row, Schema};
use crate::source::SourceReader;
use crate::storage::ObjectStore;

use listing::ArchiveObject;

/// Terminal summary of one restore run.
#[derive(Debug, Clone, Default)]
pub struct RestoreSummary {
    pub files_restored: usize,
    pub files_skipped: usize,
    pub rows_inserted: u64,
    pub partitions_created: usize,
    pub cancelled: bool,
}

impl RestoreSummary {
    pub fn log(&self) {
        info!(
            "Restore complete: {} files restored, {} skipped, {} rows inserted, {} partitions created",
            self.files_restored, self.files_skipped, self.rows_inserted, self.partitions_created
        );
    }
}

/// Download one archive object and decode it into rows, honouring the
/// configured format and compression overrides.
pub(crate) async fn fetch_object_rows(
    cfg: &RestoreConfig,
    store: &ObjectStore,
    object: &ArchiveObject,
) -> Result<Vec<Row>> {
    let (detected_format, detected_compression) = crate::format::detect(&object.filename);
    let format = cfg
        .output_format
        .or(detected_format)
        .with_context(|| format!("cannot determine the format of {}", object.filename))?;
    let compression = cfg.compression.unwrap_or(detected_compression);

    let body = store.get(&object.key).await?;
    let decompressed = compression
        .decompress(&body)
        .with_context(|| format!("decompressing {}", object.filename))?;
    drop(body);
    format
        .decode(&decompressed)
        .with_context(|| format!("decoding {}", object.filename))
}

pub struct RestoreEngine {
    pub cfg: RestoreConfig,
    pub source: SourceReader,
    pub store: ObjectStore,
    pub cancel: CancellationToken,
}

impl RestoreEngine {
    pub async fn run(self) -> Result<RestoreSummary> {
        crate::source::validate_identifier(&self.cfg.table)
            .context("invalid target table name")?;
        if let (Some(start), Some(end)) = (self.cfg.start_date, self.cfg.end_date)
            && start > end
        {
            bail!("start-date {start} is after end-date {end}");
        }

        let objects = listing::list_archives(
            &self.store,
            &self.cfg.path_template,
            &self.cfg.table,
            self.cfg.start_date,
            self.cfg.end_date,
        )
        .await?;
        if objects.is_empty() {
            bail!("no archive objects found for {}", self.cfg.table);
        }

        let schema = schema::resolve_schema(&self.cfg, &self.source, &self.store, &objects)
            .await
            .context("resolving the target schema")?;

        let mut summary = RestoreSummary::default();
        let mut ensured: HashSet<String> = HashSet::new();

        if self.cfg.restore_mode.creates_schema() {
            target::ensure_base_table(
                self.source.pool(),
                &self.cfg.table,
                &schema,
                self.cfg.dry_run,
            )
            .await?;
        }

        if self.cfg.restore_mode == RestoreMode::SchemaOnly {
            self.create_partitions_for_window(&objects, &mut ensured, &mut summary)
                .await?;
            summary.log();
            return Ok(summary);
        }

        for object in &objects {
            if self.cancel.is_cancelled() {
                summary.cancelled = true;
                break;
            }
            match self
                .restore_file(object, &schema, &mut ensured, &mut summary)
                .await
            {
                Ok(rows) => {
                    summary.files_restored += 1;
                    summary.rows_inserted += rows;
                }
                Err(e) => {
                    warn!("Skipping {}: {e:#}", object.filename);
                    summary.files_skipped += 1;
                }
            }
        }

        summary.log();
        Ok(summary)
    }

    /// Restore one file: decode, route rows to their targets, insert.
    async fn restore_file(
        &self,
        object: &ArchiveObject,
        schema: &Schema,
        ensured: &mut HashSet<String>,
        summary: &mut RestoreSummary,
    ) -> Result<u64> {
        info!("Restoring {} ({} bytes)", object.filename, object.size);
        let rows = fetch_object_rows(&self.cfg, &self.store, object).await?;
        if rows.is_empty() {
            info!("{} holds no rows", object.filename);
            return Ok(0);
        }

        // Hourly routing: group rows in memory by the hour of the date
        // column and land each group in its own partition.
        if self.cfg.table_partition_range == Some(OutputDuration::Hourly)
            && let Some(date_column) = self.cfg.date_column.as_deref()
        {
            let (groups, dropped) = insert::group_rows_by_hour(rows, date_column)?;
            if dropped > 0 {
                warn!("{}: {dropped} rows had no usable date and were dropped", object.filename);
            }
            let mut inserted = 0u64;
            for (hour, group) in groups {
                let partition = target::partition_name(
                    &self.cfg.table,
                    OutputDuration::Hourly,
                    hour,
                    self.cfg.table_partition_template.as_deref(),
                );
                self.ensure_target(&partition, ensured, summary).await?;
                inserted += insert::insert_rows(
                    self.source.pool(),
                    &partition,
                    schema,
                    &group,
                    self.cfg.dry_run,
                )
                .await?;
            }
            return Ok(inserted);
        }

        // One target per file: a partition for the file's period when a
        // range is configured, the base table otherwise.
        let table = match (self.cfg.table_partition_range, object.date) {
            (Some(range), Some(date)) => {
                let partition = target::partition_name(
                    &self.cfg.table,
                    range,
                    pathgen::date_start(date),
                    self.cfg.table_partition_template.as_deref(),
                );
                self.ensure_target(&partition, ensured, summary).await?;
                partition
            }
            _ => self.cfg.table.clone(),
        };
        insert::insert_rows(self.source.pool(), &table, schema, &rows, self.cfg.dry_run).await
    }

    /// Create or assert one partition, once per run.
    async fn ensure_target(
        &self,
        partition: &str,
        ensured: &mut HashSet<String>,
        summary: &mut RestoreSummary,
    ) -> Result<()> {
        if !ensured.insert(partition.to_string()) {
            return Ok(());
        }
        if self.cfg.restore_mode.creates_schema() {
            target::ensure_partition(
                self.source.pool(),
                &self.cfg.table,
                partition,
                self.cfg.dry_run,
            )
            .await?;
            summary.partitions_created += 1;
        } else {
            target::assert_table_exists(&self.source, partition).await?;
        }
        Ok(())
    }

    /// Schema-only mode: create every partition the window (or the listed
    /// files) spans without touching data.
    async fn create_partitions_for_window(
        &self,
        objects: &[ArchiveObject],
        ensured: &mut HashSet<String>,
        summary: &mut RestoreSummary,
    ) -> Result<()> {
        let Some(range) = self.cfg.table_partition_range else {
            return Ok(());
        };
        let start = self
            .cfg
            .start_date
            .or_else(|| objects.iter().filter_map(|o| o.date).min())
            .context("schema-only needs a start date or dated archive files")?;
        let end = self
            .cfg
            .end_date
            .or_else(|| objects.iter().filter_map(|o| o.date).max())
            .context("schema-only needs an end date or dated archive files")?;

        let window_start = pathgen::date_start(start);
        let window_end = pathgen::date_start(end) + Duration::days(1);
        for (slice_start, _) in pathgen::split_range(window_start, window_end, range) {
            let partition = target::partition_name(
                &self.cfg.table,
                range,
                slice_start,
                self.cfg.table_partition_template.as_deref(),
            );
            self.ensure_target(&partition, ensured, summary).await?;
        }
        Ok(())
    }
}

pub use listing::list_archives;
