//! Restore command wiring.

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use crate::config::{RestoreConfig, S3Config};
use crate::restore::{RestoreEngine, RestoreSummary};
use crate::source::{SourceReader, connect_pool};
use crate::storage::ObjectStore;

pub async fn handle_restore(
    database_url: &str,
    s3: S3Config,
    cfg: RestoreConfig,
    cancel: CancellationToken,
) -> Result<RestoreSummary> {
    let pool = connect_pool(database_url, cfg.retry).await?;
    let store = ObjectStore::connect(&s3, cfg.retry)
        .await
        .context("connecting to the object store")?;

    let engine = RestoreEngine {
        cfg,
        source: SourceReader::new(pool),
        store,
        cancel,
    };
    engine.run().await
}
