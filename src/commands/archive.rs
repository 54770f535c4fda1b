//! Archive command wiring: connect everything, drain progress events, run
//! the scheduler.

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::cache::{CacheScope, MetadataCache, default_cache_dir};
use crate::config::{ArchiveConfig, S3Config};
use crate::scheduler::{ProgressEvent, RunSummary, Scheduler, event_channel};
use crate::source::{SourceReader, connect_pool};
use crate::storage::ObjectStore;

pub async fn handle_archive(
    database_url: &str,
    s3: S3Config,
    cfg: ArchiveConfig,
    cancel: CancellationToken,
) -> Result<RunSummary> {
    let pool = connect_pool(database_url, cfg.retry).await?;
    let store = ObjectStore::connect(&s3, cfg.retry)
        .await
        .context("connecting to the object store")?;

    let scope = CacheScope::new("archive", &cfg.table, cfg.destination(&s3.bucket));
    let cache_dir = cfg.cache_dir.clone().unwrap_or_else(default_cache_dir);
    let mut cache = MetadataCache::load(&scope, &cache_dir);
    cache.clean_expired(chrono::Utc::now());

    let (events, receiver) = event_channel();
    // Passive observer: the scheduler never blocks on it, and it exits when
    // the channel closes with the run.
    let drain = tokio::spawn(async move {
        while let Ok(event) = receiver.recv_async().await {
            match event {
                ProgressEvent::Phase(label) => debug!("Phase: {label}"),
                ProgressEvent::Stage { partition, stage } => {
                    debug!("{partition}: {stage}")
                }
                ProgressEvent::CountProgress { done, total } => {
                    debug!("Counted {done}/{total} partitions")
                }
                ProgressEvent::RowProgress { partition, rows } => {
                    debug!("{partition}: {rows} rows")
                }
                ProgressEvent::PartitionDone(_) | ProgressEvent::Finished(_) => {}
            }
        }
    });

    let scheduler = Scheduler {
        cfg,
        cache,
        store,
        source: SourceReader::new(pool),
        events,
        cancel,
    };
    let summary = scheduler.run().await;
    let _ = drain.await;
    summary
}
