//! Schema resolution for restore: catalog, dumped schema file, or
//! inference from a sample of the first archive file.

use anyhow::{Context, Result, bail};
use tracing::{info, warn};

use crate::config::{RestoreConfig, SchemaSource};
use crate::rowset::Schema;
use crate::source::SourceReader;
use crate::storage::ObjectStore;

use super::listing::ArchiveObject;

/// Rows sampled from the first file when inferring.
const INFERENCE_SAMPLE_ROWS: usize = 1000;

pub async fn resolve_schema(
    cfg: &RestoreConfig,
    source: &SourceReader,
    store: &ObjectStore,
    objects: &[ArchiveObject],
) -> Result<Schema> {
    match cfg.schema_source {
        SchemaSource::Db => source
            .table_schema(&cfg.table)
            .await
            .context("reading schema from the source catalog"),
        SchemaSource::Dump => {
            apply_schema_dump(cfg, source).await?;
            match source.table_schema(&cfg.table).await {
                Ok(schema) => Ok(schema),
                Err(e) => {
                    // The dump may not have created the base table (dry run,
                    // or a partial dump); inference keeps the restore going.
                    warn!("Catalog unavailable after applying dump ({e:#}), inferring instead");
                    infer_from_first_file(cfg, store, objects).await
                }
            }
        }
        SchemaSource::Inferred => infer_from_first_file(cfg, store, objects).await,
        SchemaSource::Auto => {
            let have_dump = cfg
                .schema_path
                .as_ref()
                .map(|p| p.exists())
                .unwrap_or(false);
            if have_dump {
                apply_schema_dump(cfg, source).await?;
                if let Ok(schema) = source.table_schema(&cfg.table).await {
                    return Ok(schema);
                }
                warn!("Dump applied but table not in catalog, falling back to inference");
            }
            infer_from_first_file(cfg, store, objects).await
        }
    }
}

/// Execute a previously dumped schema SQL file against the target database.
async fn apply_schema_dump(cfg: &RestoreConfig, source: &SourceReader) -> Result<()> {
    let path = cfg
        .schema_path
        .as_ref()
        .context("schema-source=dump requires schema-path")?;
    let sql = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading schema file {}", path.display()))?;
    if cfg.dry_run {
        info!("[dry-run] Would apply schema file {} ({} bytes)", path.display(), sql.len());
        return Ok(());
    }
    info!("Applying schema file {}", path.display());
    sqlx::raw_sql(&sql)
        .execute(source.pool())
        .await
        .with_context(|| format!("applying schema file {}", path.display()))?;
    Ok(())
}

/// Download the first listed file and infer column types from a sample.
async fn infer_from_first_file(
    cfg: &RestoreConfig,
    store: &ObjectStore,
    objects: &[ArchiveObject],
) -> Result<Schema> {
    let Some(first) = objects.first() else {
        bail!("no archive files to infer a schema from");
    };
    info!("Inferring schema from {}", first.filename);
    let rows = super::fetch_object_rows(cfg, store, first).await?;
    let sample = &rows[..rows.len().min(INFERENCE_SAMPLE_ROWS)];
    let schema = Schema::infer(sample)
        .with_context(|| format!("inferring schema from {}", first.filename))?;
    info!(
        "Inferred {} columns: {}",
        schema.columns.len(),
        schema
            .columns
            .iter()
            .map(|(n, t)| format!("{n} {}", t.sql_name()))
            .collect::<Vec<_>>()
            .join(", ")
    );
    Ok(schema)
}
