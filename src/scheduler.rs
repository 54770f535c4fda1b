//! Archive run driver.
//!
//! Discovers partition tables, walks them through the processor in
//! ascending date order, persists the cache after every partition, and
//! reports progress over a bounded channel. Progress is best-effort: sends
//! never block, and a slow observer only loses intermediate updates, never
//! the terminal summary returned from [`Scheduler::run`].

use anyhow::{Context, Result, bail};
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::MetadataCache;
use crate::config::ArchiveConfig;
use crate::pathgen::{self, OutputDuration};
use crate::processor::{
    FailureKind, Partition, PartitionProcessor, ProcessOutcome, Stage,
};
use crate::source::{SourceReader, validate_identifier};
use crate::storage::ObjectStore;

/// Bounded event buffer. Overflow drops the newest update rather than
/// blocking the run.
pub const EVENT_CAPACITY: usize = 256;

/// Progress notifications surfaced to the observer.
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    /// A new phase of the run started ("discovery", "archive").
    Phase(String),
    /// A partition entered a pipeline stage.
    Stage { partition: String, stage: &'static str },
    /// Row-count collection progress during discovery.
    CountProgress { done: usize, total: usize },
    /// Rows streamed so far for the current partition.
    RowProgress { partition: String, rows: u64 },
    /// A partition finished (uploaded, skipped, or failed).
    PartitionDone(ProcessOutcome),
    /// The run is complete; no further events follow.
    Finished(RunSummary),
}

/// Non-blocking sender side of the observer channel.
#[derive(Clone)]
pub struct EventSender {
    tx: Option<flume::Sender<ProgressEvent>>,
}

impl EventSender {
    /// A sender that discards everything, for callers without an observer.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    fn send(&self, event: ProgressEvent) {
        if let Some(tx) = &self.tx {
            // Never block the pipeline on an unresponsive observer.
            let _ = tx.try_send(event);
        }
    }

    pub fn phase(&self, label: &str) {
        self.send(ProgressEvent::Phase(label.to_string()));
    }

    pub fn stage(&self, partition: &str, stage: Stage) {
        self.send(ProgressEvent::Stage {
            partition: partition.to_string(),
            stage: stage.label(),
        });
    }

    pub fn count_progress(&self, done: usize, total: usize) {
        self.send(ProgressEvent::CountProgress { done, total });
    }

    pub fn row_progress(&self, partition: &str, rows: u64) {
        self.send(ProgressEvent::RowProgress {
            partition: partition.to_string(),
            rows,
        });
    }

    pub fn partition_done(&self, outcome: &ProcessOutcome) {
        self.send(ProgressEvent::PartitionDone(outcome.clone()));
    }

    pub fn finished(&self, summary: &RunSummary) {
        self.send(ProgressEvent::Finished(summary.clone()));
    }
}

/// Create the bounded observer channel.
pub fn event_channel() -> (EventSender, flume::Receiver<ProgressEvent>) {
    let (tx, rx) = flume::bounded(EVENT_CAPACITY);
    (EventSender { tx: Some(tx) }, rx)
}

/// Terminal summary of one archive run.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub uploaded: usize,
    pub skipped: usize,
    pub failed: usize,
    pub total_rows: u64,
    pub total_bytes: u64,
    pub outcomes: Vec<ProcessOutcome>,
    pub cancelled: bool,
}

impl RunSummary {
    fn absorb(&mut self, outcome: ProcessOutcome) {
        if outcome.error.is_some() {
            self.failed += 1;
        } else if outcome.skipped {
            self.skipped += 1;
        } else if outcome.uploaded || outcome.compressed {
            // dry-run outcomes count as uploads for reporting purposes
            self.uploaded += 1;
        }
        self.total_rows += outcome.rows;
        self.total_bytes += outcome.bytes_written;
        self.outcomes.push(outcome);
    }

    pub fn log(&self) {
        info!(
            "Run complete: {} uploaded, {} skipped, {} failed, {} rows, {} bytes",
            self.uploaded, self.skipped, self.failed, self.total_rows, self.total_bytes
        );
        for outcome in &self.outcomes {
            match &outcome.error {
                Some(error) => warn!("  {}: FAILED: {error}", outcome.partition),
                None if outcome.skipped => {
                    info!("  {}: skipped ({})", outcome.partition, outcome.skip_reason)
                }
                None if outcome.uploaded => info!(
                    "  {}: uploaded {} rows, {} bytes -> {}",
                    outcome.partition, outcome.rows, outcome.bytes_written, outcome.object_key
                ),
                None => info!(
                    "  {}: {} ({} rows, {} bytes)",
                    outcome.partition,
                    if outcome.skip_reason.is_empty() {
                        "processed"
                    } else {
                        &outcome.skip_reason
                    },
                    outcome.rows,
                    outcome.bytes_written
                ),
            }
        }
    }
}

pub struct Scheduler {
    pub cfg: ArchiveConfig,
    pub cache: MetadataCache,
    pub store: ObjectStore,
    pub source: SourceReader,
    pub events: EventSender,
    pub cancel: CancellationToken,
}

impl Scheduler {
    /// Find partition tables of the configured base inside the date window,
    /// in ascending date order (ties broken by table name), with row counts
    /// filled in unless counting is disabled.
    pub async fn discover(&mut self) -> Result<Vec<Partition>> {
        validate_identifier(&self.cfg.table).context("invalid base table name")?;
        if let (Some(start), Some(end)) = (self.cfg.start_date, self.cfg.end_date)
            && start > end
        {
            bail!("start-date {start} is after end-date {end}");
        }

        self.events.phase("discovery");
        let names = self.source.list_partition_tables(&self.cfg.table).await?;

        let mut partitions = Vec::new();
        for name in names {
            let Some((date, granularity)) = pathgen::parse_partition(&self.cfg.table, &name)
            else {
                debug!("Ignoring {name}: suffix is not a recognised partition date");
                continue;
            };
            if let Some(start) = self.cfg.start_date
                && date < start
            {
                continue;
            }
            if let Some(end) = self.cfg.end_date
                && date > end
            {
                continue;
            }
            partitions.push(Partition {
                table: name,
                date,
                granularity,
                row_count: -1,
                range: None,
            });
        }
        partitions.sort_by(|a, b| a.date.cmp(&b.date).then_with(|| a.table.cmp(&b.table)));
        info!(
            "Discovered {} partitions of {} in window",
            partitions.len(),
            self.cfg.table
        );

        if !self.cfg.skip_count {
            let total = partitions.len();
            for (done, partition) in partitions.iter_mut().enumerate() {
                if self.cancel.is_cancelled() {
                    bail!("cancelled during discovery");
                }
                let now = Utc::now();
                let cached = self
                    .cache
                    .get_row_count(&partition.table, partition.date, now);
                partition.row_count = match cached {
                    Some(count) => count,
                    None => {
                        let count = self
                            .source
                            .count_rows(&partition.table, None, None)
                            .await?;
                        self.cache.set_row_count(&partition.table, count, now);
                        count
                    }
                };
                self.events.count_progress(done + 1, total);
            }
        }

        Ok(partitions)
    }

    /// Drive the queue to completion. Per-partition failures are recorded
    /// and reported but only systemic failures (auth, config) abort the
    /// remaining queue.
    pub async fn run(mut self) -> Result<RunSummary> {
        let process_start = Utc::now();
        let partitions = self.discover().await?;
        self.events.phase("archive");

        let mut summary = RunSummary::default();
        'queue: for partition in partitions {
            if self.cancel.is_cancelled() {
                summary.cancelled = true;
                break;
            }

            let outcomes = self.process_partition(&partition, process_start).await?;
            for outcome in outcomes {
                let kind = outcome.failure_kind;
                summary.absorb(outcome.clone());
                self.events.partition_done(&outcome);
                match kind {
                    Some(FailureKind::Cancelled) => {
                        summary.cancelled = true;
                        break 'queue;
                    }
                    Some(kind) if kind.is_systemic() => {
                        warn!(
                            "Aborting run after systemic failure on {}: {:?}",
                            outcome.partition, kind
                        );
                        break 'queue;
                    }
                    _ => {}
                }
            }

            if let Err(e) = self.cache.save() {
                warn!("Failed to persist cache: {e:#}");
            }
        }

        self.cache.clean_expired(Utc::now());
        if let Err(e) = self.cache.save() {
            warn!("Failed to persist cache: {e:#}");
        }

        summary.log();
        self.events.finished(&summary);
        Ok(summary)
    }

    /// Process one discovered partition, expanding it into slices when the
    /// output duration is finer than the partition's own granularity.
    async fn process_partition(
        &mut self,
        partition: &Partition,
        process_start: chrono::DateTime<Utc>,
    ) -> Result<Vec<ProcessOutcome>> {
        if !partition.granularity.requires_split(self.cfg.output_duration) {
            let mut processor = PartitionProcessor {
                cfg: &self.cfg,
                cache: &mut self.cache,
                store: &self.store,
                source: &self.source,
                events: &self.events,
                cancel: &self.cancel,
                process_start,
            };
            return Ok(vec![processor.process(partition).await]);
        }

        if self.cfg.date_column.is_none() {
            bail!(
                "output duration {} is finer than partition {} and needs --date-column",
                self.cfg.output_duration.as_str(),
                partition.table
            );
        }

        let partition_duration = match partition.granularity {
            pathgen::PartitionGranularity::Daily => OutputDuration::Daily,
            pathgen::PartitionGranularity::Monthly => OutputDuration::Monthly,
        };
        let (start, end) = pathgen::period_range(
            pathgen::date_start(partition.date),
            partition_duration,
        );
        let ranges = pathgen::split_range(start, end, self.cfg.output_duration);
        info!(
            "Splitting {} into {} {} slices",
            partition.table,
            ranges.len(),
            self.cfg.output_duration.as_str()
        );

        let mut outcomes = Vec::with_capacity(ranges.len());
        for range in ranges {
            if self.cancel.is_cancelled() {
                break;
            }
            let slice = Partition {
                table: partition.table.clone(),
                date: range.0.date_naive(),
                granularity: partition.granularity,
                row_count: -1,
                range: Some(range),
            };
            let mut processor = PartitionProcessor {
                cfg: &self.cfg,
                cache: &mut self.cache,
                store: &self.store,
                source: &self.source,
                events: &self.events,
                cancel: &self.cancel,
                process_start,
            };
            outcomes.push(processor.process(&slice).await);
        }

        let all_empty = !outcomes.is_empty()
            && outcomes
                .iter()
                .all(|o| o.skipped && o.skip_reason == "No data in time range");
        if all_empty {
            let mut aggregate = outcomes.swap_remove(0);
            aggregate.skip_reason = "All slices skipped (no data in time ranges)".to_string();
            return Ok(vec![aggregate]);
        }
        Ok(outcomes)
    }
}
