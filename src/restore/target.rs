//! Target table and partition creation.

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Datelike, Timelike, Utc};
use sqlx::postgres::PgPool;
use tracing::{debug, info};

use crate::pathgen::OutputDuration;
use crate::rowset::Schema;
use crate::source::{quote_identifier, validate_identifier};

/// Partition table name for a period, from the configured template or the
/// built-in pattern for the range. Built-in names match what the archiver's
/// discovery parses, so restored partitions can be re-archived.
pub fn partition_name(
    table: &str,
    range: OutputDuration,
    ts: DateTime<Utc>,
    template: Option<&str>,
) -> String {
    if let Some(template) = template {
        let quarter = (ts.month() - 1) / 3 + 1;
        return template
            .replace("{table}", table)
            .replace("{YYYY}", &format!("{:04}", ts.year()))
            .replace("{MM}", &format!("{:02}", ts.month()))
            .replace("{DD}", &format!("{:02}", ts.day()))
            .replace("{HH}", &format!("{:02}", ts.hour()))
            .replace("{Q}", &quarter.to_string());
    }
    match range {
        OutputDuration::Hourly => format!("{table}_{}", ts.format("%Y%m%d_%H")),
        OutputDuration::Daily => format!("{table}_{}", ts.format("%Y%m%d")),
        OutputDuration::Weekly => format!("{table}_{}", ts.format("%Gw%V")),
        OutputDuration::Monthly => format!("{table}_{}", ts.format("%Y_%m")),
        OutputDuration::Yearly => format!("{table}_{}", ts.format("%Y")),
    }
}

/// Create the base table from the resolved schema when it does not exist.
pub async fn ensure_base_table(
    pool: &PgPool,
    table: &str,
    schema: &Schema,
    dry_run: bool,
) -> Result<()> {
    validate_identifier(table)?;
    let columns: Vec<String> = schema
        .columns
        .iter()
        .map(|(name, ty)| format!("{} {}", quote_identifier(name), ty.sql_name()))
        .collect();
    let ddl = format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        quote_identifier(table),
        columns.join(", ")
    );
    if dry_run {
        info!("[dry-run] {ddl}");
        return Ok(());
    }
    sqlx::query(&ddl)
        .execute(pool)
        .await
        .with_context(|| format!("creating base table {table}"))?;
    debug!("Ensured base table {table}");
    Ok(())
}

/// Create a partition as a structural copy of the base when absent.
pub async fn ensure_partition(
    pool: &PgPool,
    base: &str,
    partition: &str,
    dry_run: bool,
) -> Result<()> {
    validate_identifier(base)?;
    validate_identifier(partition)?;
    let ddl = format!(
        "CREATE TABLE IF NOT EXISTS {} (LIKE {} INCLUDING ALL)",
        quote_identifier(partition),
        quote_identifier(base)
    );
    if dry_run {
        info!("[dry-run] {ddl}");
        return Ok(());
    }
    sqlx::query(&ddl)
        .execute(pool)
        .await
        .with_context(|| format!("creating partition {partition}"))?;
    debug!("Ensured partition {partition}");
    Ok(())
}

/// Data-only mode never creates tables; it fails fast when one is missing.
pub async fn assert_table_exists(
    source: &crate::source::SourceReader,
    table: &str,
) -> Result<()> {
    if !source.table_exists(table).await? {
        bail!("table {table} does not exist and restore-mode=data-only never creates it");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 15, 7, 0, 0).unwrap()
    }

    #[test]
    fn builtin_partition_names() {
        assert_eq!(
            partition_name("flights", OutputDuration::Hourly, ts(), None),
            "flights_20240315_07"
        );
        assert_eq!(
            partition_name("flights", OutputDuration::Daily, ts(), None),
            "flights_20240315"
        );
        assert_eq!(
            partition_name("flights", OutputDuration::Monthly, ts(), None),
            "flights_2024_03"
        );
        assert_eq!(
            partition_name("flights", OutputDuration::Yearly, ts(), None),
            "flights_2024"
        );
    }

    #[test]
    fn template_partition_names() {
        assert_eq!(
            partition_name(
                "flights",
                OutputDuration::Daily,
                ts(),
                Some("{table}_{YYYY}{MM}{DD}")
            ),
            "flights_20240315"
        );
        assert_eq!(
            partition_name("flights", OutputDuration::Monthly, ts(), Some("{table}_q{Q}")),
            "flights_q1"
        );
    }

    #[test]
    fn daily_builtin_round_trips_through_discovery() {
        let name = partition_name("flights", OutputDuration::Daily, ts(), None);
        let (date, _) = crate::pathgen::parse_partition("flights", &name).unwrap();
        assert_eq!(date, ts().date_naive());

        let monthly = partition_name("flights", OutputDuration::Monthly, ts(), None);
        let (date, _) = crate::pathgen::parse_partition("flights", &monthly).unwrap();
        assert_eq!(date, chrono::NaiveDate::from_ymd_opt(2024, 3, 1).unwrap());
    }
}
