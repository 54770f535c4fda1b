//! PostgreSQL source reader.
//!
//! Reads one partition table at a time as a stream of dynamically typed
//! rows. Table names are validated and quoted before they are ever spliced
//! into SQL, connections are retried a bounded number of times, and row
//! iteration is paced by the consumer so large partitions never have to fit
//! in memory.

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use once_cell::sync::Lazy;
use regex::Regex;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Column, Row as SqlxRow, TypeInfo};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::RetryConfig;
use crate::rowset::{ColumnType, Row, RowValue, Schema};

static IDENTIFIER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap());

/// Reject anything that is not a plain lowercase-safe SQL identifier.
pub fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 63 {
        bail!("identifier '{name}' has invalid length");
    }
    if !IDENTIFIER_RE.is_match(name) {
        bail!("identifier '{name}' contains characters outside [A-Za-z0-9_]");
    }
    Ok(())
}

/// Quote an already-validated identifier for interpolation into SQL.
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Progress cadence: every `max(1000, total/100)` rows when the total is
/// known, every 10,000 rows otherwise.
pub fn progress_interval(row_count: i64) -> u64 {
    if row_count >= 0 {
        (row_count / 100).max(1000) as u64
    } else {
        10_000
    }
}

/// Connect with bounded retry, in case the database is still coming up.
pub async fn connect_pool(database_url: &str, retry: RetryConfig) -> Result<PgPool> {
    let mut attempt = 0u32;
    loop {
        match PgPoolOptions::new()
            .max_connections(4)
            .connect(database_url)
            .await
        {
            Ok(pool) => return Ok(pool),
            Err(e) if attempt + 1 < retry.max_retries => {
                attempt += 1;
                warn!(
                    "Database connection failed ({e}), retrying in {}s (attempt {}/{})",
                    retry.retry_delay_seconds, attempt, retry.max_retries
                );
                tokio::time::sleep(std::time::Duration::from_secs(retry.retry_delay_seconds))
                    .await;
            }
            Err(e) => return Err(e).context("connecting to PostgreSQL"),
        }
    }
}

pub struct SourceReader {
    pool: PgPool,
}

impl SourceReader {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Candidate partition tables: everything named `{base}_...` in the
    /// public schema, sorted by name. The caller parses and filters.
    pub async fn list_partition_tables(&self, base: &str) -> Result<Vec<String>> {
        validate_identifier(base)?;
        let pattern = format!("{base}\\_%");
        let names: Vec<(String,)> = sqlx::query_as(
            "SELECT tablename FROM pg_catalog.pg_tables \
             WHERE schemaname = 'public' AND tablename LIKE $1 \
             ORDER BY tablename",
        )
        .bind(&pattern)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("listing partitions of {base}"))?;
        Ok(names.into_iter().map(|(n,)| n).collect())
    }

    /// COUNT the rows of one partition, optionally restricted to a
    /// timestamp range on `date_column`.
    pub async fn count_rows(
        &self,
        table: &str,
        range: Option<(DateTime<Utc>, DateTime<Utc>)>,
        date_column: Option<&str>,
    ) -> Result<i64> {
        validate_identifier(table)?;
        let quoted = quote_identifier(table);
        let count: i64 = match (range, date_column) {
            (Some((start, end)), Some(column)) => {
                validate_identifier(column)?;
                let sql = format!(
                    "SELECT COUNT(*) FROM {quoted} WHERE {col} >= $1 AND {col} < $2",
                    col = quote_identifier(column)
                );
                sqlx::query_scalar(&sql)
                    .bind(start)
                    .bind(end)
                    .fetch_one(&self.pool)
                    .await
            }
            _ => {
                let sql = format!("SELECT COUNT(*) FROM {quoted}");
                sqlx::query_scalar(&sql).fetch_one(&self.pool).await
            }
        }
        .with_context(|| format!("counting rows in {table}"))?;
        Ok(count)
    }

    /// Stream every row of a partition (or of a custom range within it)
    /// through `on_row`, reporting progress at the interval derived from
    /// `expected_rows`. Returns the number of rows emitted.
    ///
    /// The stream is one-shot; backpressure comes from the consumer pacing
    /// the iteration. Cancellation is observed between rows.
    pub async fn read_rows<F, P>(
        &self,
        table: &str,
        range: Option<(DateTime<Utc>, DateTime<Utc>)>,
        date_column: Option<&str>,
        expected_rows: i64,
        cancel: &CancellationToken,
        mut on_row: F,
        mut on_progress: P,
    ) -> Result<u64>
    where
        F: FnMut(Row) -> Result<()>,
        P: FnMut(u64),
    {
        validate_identifier(table)?;
        let quoted = quote_identifier(table);

        let sql = match (range, date_column) {
            (Some(_), Some(column)) => {
                validate_identifier(column)?;
                let col = quote_identifier(column);
                format!("SELECT * FROM {quoted} WHERE {col} >= $1 AND {col} < $2 ORDER BY {col}")
            }
            (None, Some(column)) => {
                validate_identifier(column)?;
                format!(
                    "SELECT * FROM {quoted} ORDER BY {}",
                    quote_identifier(column)
                )
            }
            _ => format!("SELECT * FROM {quoted}"),
        };

        let interval = progress_interval(expected_rows);
        let mut count = 0u64;

        let mut query = sqlx::query(&sql);
        if let Some((start, end)) = range {
            query = query.bind(start).bind(end);
        }
        let mut stream = query.fetch(&self.pool);
        while let Some(pg_row) = stream
            .try_next()
            .await
            .with_context(|| format!("reading rows from {table}"))?
        {
            if cancel.is_cancelled() {
                bail!("cancelled while reading {table}");
            }
            on_row(decode_row(&pg_row)?)
                .with_context(|| format!("processing row from {table}"))?;
            count += 1;
            if count % interval == 0 {
                info!("Streamed {count} rows from {table}...");
                on_progress(count);
            }
        }
        on_progress(count);
        Ok(count)
    }

    /// Column names and SQL types from the catalog, in ordinal order.
    pub async fn table_schema(&self, table: &str) -> Result<Schema> {
        validate_identifier(table)?;
        let columns: Vec<(String, String)> = sqlx::query_as(
            "SELECT column_name, data_type FROM information_schema.columns \
             WHERE table_schema = 'public' AND table_name = $1 \
             ORDER BY ordinal_position",
        )
        .bind(table)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("reading catalog schema for {table}"))?;
        if columns.is_empty() {
            bail!("table {table} not found in catalog");
        }
        Ok(Schema {
            columns: columns
                .into_iter()
                .map(|(name, ty)| (name, ColumnType::from_catalog(&ty)))
                .collect(),
        })
    }

    pub async fn table_exists(&self, table: &str) -> Result<bool> {
        validate_identifier(table)?;
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM pg_catalog.pg_tables \
             WHERE schemaname = 'public' AND tablename = $1)",
        )
        .bind(table)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("checking for table {table}"))?;
        Ok(exists)
    }
}

/// Decode one database row into the tagged-value model using the reported
/// column types. Unrecognised types fall back to their text rendering.
fn decode_row(pg_row: &PgRow) -> Result<Row> {
    let mut row = Row::new();
    for (ordinal, column) in pg_row.columns().iter().enumerate() {
        let name = column.name();
        let type_name = column.type_info().name();
        let value = match type_name {
            "BOOL" => pg_row
                .try_get::<Option<bool>, _>(ordinal)?
                .map_or(RowValue::Null, RowValue::Bool),
            "INT2" => pg_row
                .try_get::<Option<i16>, _>(ordinal)?
                .map_or(RowValue::Null, |v| RowValue::Int(v as i64)),
            "INT4" => pg_row
                .try_get::<Option<i32>, _>(ordinal)?
                .map_or(RowValue::Null, |v| RowValue::Int(v as i64)),
            "INT8" => pg_row
                .try_get::<Option<i64>, _>(ordinal)?
                .map_or(RowValue::Null, RowValue::Int),
            "FLOAT4" => pg_row
                .try_get::<Option<f32>, _>(ordinal)?
                .map_or(RowValue::Null, |v| RowValue::Float(v as f64)),
            "FLOAT8" => pg_row
                .try_get::<Option<f64>, _>(ordinal)?
                .map_or(RowValue::Null, RowValue::Float),
            "NUMERIC" => pg_row
                .try_get::<Option<sqlx::types::BigDecimal>, _>(ordinal)?
                .map_or(RowValue::Null, |v| RowValue::Text(v.to_string())),
            "TEXT" | "VARCHAR" | "CHAR" | "BPCHAR" | "NAME" => pg_row
                .try_get::<Option<String>, _>(ordinal)?
                .map_or(RowValue::Null, RowValue::Text),
            "BYTEA" => pg_row
                .try_get::<Option<Vec<u8>>, _>(ordinal)?
                .map_or(RowValue::Null, RowValue::Bytes),
            "TIMESTAMPTZ" => pg_row
                .try_get::<Option<DateTime<Utc>>, _>(ordinal)?
                .map_or(RowValue::Null, RowValue::Timestamp),
            "TIMESTAMP" => pg_row
                .try_get::<Option<chrono::NaiveDateTime>, _>(ordinal)?
                .map_or(RowValue::Null, |v| RowValue::Timestamp(v.and_utc())),
            "DATE" => pg_row
                .try_get::<Option<chrono::NaiveDate>, _>(ordinal)?
                .map_or(RowValue::Null, |v| RowValue::Text(v.to_string())),
            "UUID" => pg_row
                .try_get::<Option<sqlx::types::Uuid>, _>(ordinal)?
                .map_or(RowValue::Null, |v| RowValue::Text(v.to_string())),
            "JSON" | "JSONB" => pg_row
                .try_get::<Option<serde_json::Value>, _>(ordinal)?
                .map_or(RowValue::Null, |v| RowValue::Text(v.to_string())),
            other => {
                // Last resort: many exotic types decode as text.
                match pg_row.try_get::<Option<String>, _>(ordinal) {
                    Ok(v) => v.map_or(RowValue::Null, RowValue::Text),
                    Err(_) => {
                        debug!("Column {name} has undecodable type {other}, emitting null");
                        RowValue::Null
                    }
                }
            }
        };
        row.push(name, value);
    }
    Ok(row)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifier_validation() {
        assert!(validate_identifier("flights").is_ok());
        assert!(validate_identifier("flights_20240315").is_ok());
        assert!(validate_identifier("_private").is_ok());
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("flights; DROP TABLE x").is_err());
        assert!(validate_identifier("flights\"").is_err());
        assert!(validate_identifier("1flights").is_err());
        assert!(validate_identifier(&"x".repeat(64)).is_err());
    }

    #[test]
    fn quoting_wraps_in_double_quotes() {
        assert_eq!(quote_identifier("flights"), "\"flights\"");
    }

    #[test]
    fn progress_interval_rules() {
        assert_eq!(progress_interval(-1), 10_000);
        assert_eq!(progress_interval(0), 1000);
        assert_eq!(progress_interval(50_000), 1000);
        assert_eq!(progress_interval(1_000_000), 10_000);
        assert_eq!(progress_interval(123_456), 1234);
    }
}
