//! Batched, conflict-ignoring row insertion and hourly routing.

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Timelike, Utc};
use sqlx::Postgres;
use sqlx::postgres::{PgArguments, PgPool};
use sqlx::query::Query;
use std::collections::BTreeMap;
use tracing::{info, warn};

use crate::rowset::{ColumnType, Row, RowValue, Schema, value_as_instant};
use crate::source::{quote_identifier, validate_identifier};

/// Rows per transaction.
pub const INSERT_BATCH_SIZE: usize = 1000;

/// Insert `rows` into `table` with `ON CONFLICT DO NOTHING`, in batches of
/// [`INSERT_BATCH_SIZE`] rows per transaction. Returns the number of rows
/// the database actually accepted, which is lower than the input count when
/// rows already existed.
pub async fn insert_rows(
    pool: &PgPool,
    table: &str,
    schema: &Schema,
    rows: &[Row],
    dry_run: bool,
) -> Result<u64> {
    validate_identifier(table)?;
    if rows.is_empty() {
        return Ok(0);
    }

    let column_list = schema
        .columns
        .iter()
        .map(|(name, _)| quote_identifier(name))
        .collect::<Vec<_>>()
        .join(", ");
    let placeholders = (1..=schema.columns.len())
        .map(|i| format!("${i}"))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "INSERT INTO {} ({column_list}) VALUES ({placeholders}) ON CONFLICT DO NOTHING",
        quote_identifier(table)
    );

    if dry_run {
        info!(
            "[dry-run] Would insert {} rows into {table} using: {sql}",
            rows.len()
        );
        return Ok(0);
    }

    let mut inserted = 0u64;
    for batch in rows.chunks(INSERT_BATCH_SIZE) {
        let mut tx = pool.begin().await.context("starting insert transaction")?;
        for row in batch {
            let mut query = sqlx::query(&sql);
            for (name, ty) in &schema.columns {
                query = bind_value(query, name, row.get(name), *ty)?;
            }
            inserted += query
                .execute(&mut *tx)
                .await
                .with_context(|| format!("inserting into {table}"))?
                .rows_affected();
        }
        tx.commit().await.context("committing insert batch")?;
        info!("Inserted {inserted} rows into {table}...");
    }
    Ok(inserted)
}

/// Bind one cell, coercing the decoded value to the target column type.
fn bind_value<'q>(
    query: Query<'q, Postgres, PgArguments>,
    column: &str,
    value: Option<&RowValue>,
    ty: ColumnType,
) -> Result<Query<'q, Postgres, PgArguments>> {
    let value = value.unwrap_or(&RowValue::Null);
    let mismatch = || {
        anyhow::anyhow!(
            "column '{column}' expects {} but the file holds {value:?}",
            ty.sql_name()
        )
    };

    let query = match ty {
        ColumnType::Bool => query.bind(match value {
            RowValue::Null => None,
            RowValue::Bool(b) => Some(*b),
            RowValue::Int(i) => Some(*i != 0),
            RowValue::Text(s) => Some(parse_bool(s).ok_or_else(mismatch)?),
            _ => return Err(mismatch()),
        }),
        ColumnType::Int4 => query.bind(match value {
            RowValue::Null => None,
            RowValue::Int(i) => Some(i32::try_from(*i).map_err(|_| mismatch())?),
            RowValue::Text(s) => Some(s.parse::<i32>().map_err(|_| mismatch())?),
            _ => return Err(mismatch()),
        }),
        ColumnType::Int8 => query.bind(match value {
            RowValue::Null => None,
            RowValue::Int(i) => Some(*i),
            RowValue::Text(s) => Some(s.parse::<i64>().map_err(|_| mismatch())?),
            _ => return Err(mismatch()),
        }),
        ColumnType::Float4 => query.bind(match value {
            RowValue::Null => None,
            RowValue::Float(f) => Some(*f as f32),
            RowValue::Int(i) => Some(*i as f32),
            RowValue::Text(s) => Some(s.parse::<f32>().map_err(|_| mismatch())?),
            _ => return Err(mismatch()),
        }),
        ColumnType::Float8 => query.bind(match value {
            RowValue::Null => None,
            RowValue::Float(f) => Some(*f),
            RowValue::Int(i) => Some(*i as f64),
            RowValue::Text(s) => Some(s.parse::<f64>().map_err(|_| mismatch())?),
            _ => return Err(mismatch()),
        }),
        ColumnType::Text => query.bind(match value {
            RowValue::Null => None,
            other => Some(other.to_field()),
        }),
        ColumnType::Bytea => query.bind(match value {
            RowValue::Null => None,
            RowValue::Bytes(b) => Some(b.clone()),
            // archived bytes are hex strings in the row formats
            RowValue::Text(s) => Some(hex::decode(s).unwrap_or_else(|_| s.clone().into_bytes())),
            _ => return Err(mismatch()),
        }),
        ColumnType::TimestampTz => query.bind(match value {
            RowValue::Null => None,
            other => Some(value_as_instant(other).ok_or_else(mismatch)?),
        }),
    };
    Ok(query)
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.to_ascii_lowercase().as_str() {
        "t" | "true" | "1" | "yes" => Some(true),
        "f" | "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

/// Group rows by the hour of their date column for hourly partition
/// routing. Rows whose date column cannot be read as an instant are
/// dropped with a warning; the caller reports the count.
pub fn group_rows_by_hour(
    rows: Vec<Row>,
    date_column: &str,
) -> Result<(BTreeMap<DateTime<Utc>, Vec<Row>>, usize)> {
    let mut groups: BTreeMap<DateTime<Utc>, Vec<Row>> = BTreeMap::new();
    let mut dropped = 0usize;
    for row in rows {
        let instant = row.get(date_column).and_then(value_as_instant);
        match instant {
            Some(ts) => {
                let hour = ts
                    .with_minute(0)
                    .and_then(|t| t.with_second(0))
                    .and_then(|t| t.with_nanosecond(0))
                    .unwrap_or(ts);
                groups.entry(hour).or_default().push(row);
            }
            None => {
                dropped += 1;
                if dropped <= 3 {
                    warn!("Row has no usable '{date_column}' value, dropping from hourly routing");
                }
            }
        }
    }
    if groups.is_empty() && dropped > 0 {
        bail!("no row carried a usable '{date_column}' value");
    }
    Ok((groups, dropped))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn groups_rows_by_hour_of_date_column() {
        let mut rows = Vec::new();
        for hour in 0..24 {
            let mut row = Row::new();
            row.push("id", RowValue::Int(hour));
            row.push(
                "ts",
                RowValue::Text(format!("2024-03-15T{hour:02}:30:00+00:00")),
            );
            rows.push(row);
        }
        let (groups, dropped) = group_rows_by_hour(rows, "ts").unwrap();
        assert_eq!(groups.len(), 24);
        assert_eq!(dropped, 0);
        for (hour_ts, group) in &groups {
            assert_eq!(hour_ts.minute(), 0);
            assert_eq!(group.len(), 1);
        }
    }

    #[test]
    fn grouping_accepts_epoch_integers() {
        let mut a = Row::new();
        a.push("ts", RowValue::Int(1_710_500_400)); // seconds
        let mut b = Row::new();
        b.push("ts", RowValue::Int(1_710_500_400_000_000)); // microseconds
        let (groups, dropped) = group_rows_by_hour(vec![a, b], "ts").unwrap();
        assert_eq!(dropped, 0);
        // same hour for both encodings
        assert_eq!(groups.len(), 1);
        assert_eq!(groups.values().next().unwrap().len(), 2);
    }

    #[test]
    fn rows_without_dates_are_dropped() {
        let mut good = Row::new();
        good.push("ts", RowValue::Text("2024-03-15T10:00:00+00:00".into()));
        let mut bad = Row::new();
        bad.push("ts", RowValue::Text("not a date".into()));
        let (groups, dropped) = group_rows_by_hour(vec![good, bad], "ts").unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(dropped, 1);
    }

    #[test]
    fn all_bad_dates_is_an_error() {
        let mut bad = Row::new();
        bad.push("ts", RowValue::Null);
        assert!(group_rows_by_hour(vec![bad], "ts").is_err());
    }
}
