//! Dynamic row and schema model.
//!
//! Source tables are only known at runtime, so rows are carried as ordered
//! lists of (column, tagged value) pairs and schemas as (column, SQL type)
//! lists. Formatters and the restore engine both operate on this model.

use anyhow::{Result, bail};
use chrono::{DateTime, SecondsFormat, Utc};

/// A single cell value. Null is distinct from the empty string.
#[derive(Debug, Clone, PartialEq)]
pub enum RowValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    Timestamp(DateTime<Utc>),
}

impl RowValue {
    pub fn is_null(&self) -> bool {
        matches!(self, RowValue::Null)
    }

    /// Render for delimited output. Timestamps are RFC 3339 with offset so
    /// they survive a round trip; bytes are hex.
    pub fn to_field(&self) -> String {
        match self {
            RowValue::Null => String::new(),
            RowValue::Bool(b) => b.to_string(),
            RowValue::Int(i) => i.to_string(),
            RowValue::Float(f) => f.to_string(),
            RowValue::Text(s) => s.clone(),
            RowValue::Bytes(b) => hex::encode(b),
            RowValue::Timestamp(ts) => ts.to_rfc3339_opts(SecondsFormat::Micros, true),
        }
    }
}

/// One row: column names paired with values, in query order.
#[derive(Debug, Clone, Default)]
pub struct Row {
    pub cells: Vec<(String, RowValue)>,
}

impl Row {
    pub fn new() -> Self {
        Self { cells: Vec::new() }
    }

    pub fn push(&mut self, name: impl Into<String>, value: RowValue) {
        self.cells.push((name.into(), value));
    }

    pub fn get(&self, name: &str) -> Option<&RowValue> {
        self.cells.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn column_names(&self) -> Vec<String> {
        self.cells.iter().map(|(n, _)| n.clone()).collect()
    }
}

/// SQL column types the archiver understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Bool,
    Int4,
    Int8,
    Float4,
    Float8,
    Text,
    Bytea,
    TimestampTz,
}

impl ColumnType {
    pub fn sql_name(&self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::Int4 => "int4",
            Self::Int8 => "int8",
            Self::Float4 => "float4",
            Self::Float8 => "float8",
            Self::Text => "text",
            Self::Bytea => "bytea",
            Self::TimestampTz => "timestamptz",
        }
    }

    /// Map a catalog `data_type` string to a column type. Unknown types
    /// degrade to text, which always round-trips.
    pub fn from_catalog(data_type: &str) -> Self {
        match data_type.to_ascii_lowercase().as_str() {
            "boolean" | "bool" => Self::Bool,
            "smallint" | "int2" | "integer" | "int4" => Self::Int4,
            "bigint" | "int8" => Self::Int8,
            "real" | "float4" => Self::Float4,
            "double precision" | "float8" => Self::Float8,
            "bytea" => Self::Bytea,
            s if s.starts_with("timestamp") => Self::TimestampTz,
            _ => Self::Text,
        }
    }
}

/// Ordered column list with SQL types.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    pub columns: Vec<(String, ColumnType)>,
}

impl Schema {
    pub fn column_type(&self, name: &str) -> Option<ColumnType> {
        self.columns
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, t)| *t)
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|(n, _)| n.clone()).collect()
    }

    /// Infer a schema from a sample of decoded rows.
    ///
    /// Booleans map to bool, integers to int4 when they fit 32 bits and int8
    /// otherwise, floats to float8, strings that parse as RFC 3339 instants
    /// to timestamptz, other strings to text, byte arrays to bytea, and
    /// native timestamps to timestamptz. Columns are ordered alphabetically
    /// so the result is stable across samples.
    pub fn infer(rows: &[Row]) -> Result<Self> {
        use std::collections::BTreeMap;

        let mut types: BTreeMap<String, ColumnType> = BTreeMap::new();
        for row in rows {
            for (name, value) in &row.cells {
                let observed = match value {
                    RowValue::Null => continue,
                    RowValue::Bool(_) => ColumnType::Bool,
                    RowValue::Int(i) => {
                        if i32::try_from(*i).is_ok() {
                            ColumnType::Int4
                        } else {
                            ColumnType::Int8
                        }
                    }
                    RowValue::Float(_) => ColumnType::Float8,
                    RowValue::Text(s) => {
                        if DateTime::parse_from_rfc3339(s).is_ok() {
                            ColumnType::TimestampTz
                        } else {
                            ColumnType::Text
                        }
                    }
                    RowValue::Bytes(_) => ColumnType::Bytea,
                    RowValue::Timestamp(_) => ColumnType::TimestampTz,
                };
                let slot = types.entry(name.clone()).or_insert(observed);
                *slot = widen(*slot, observed);
            }
        }
        // Columns that were null in every sampled row still need a type.
        for row in rows {
            for (name, _) in &row.cells {
                types.entry(name.clone()).or_insert(ColumnType::Text);
            }
        }
        if types.is_empty() {
            bail!("cannot infer a schema from an empty sample");
        }
        Ok(Self {
            columns: types.into_iter().collect(),
        })
    }
}

/// Reconcile two observations of the same column across rows.
fn widen(a: ColumnType, b: ColumnType) -> ColumnType {
    use ColumnType::*;
    if a == b {
        return a;
    }
    match (a, b) {
        (Int4, Int8) | (Int8, Int4) => Int8,
        (Float4, Float8) | (Float8, Float4) => Float8,
        (Int4, Float8) | (Float8, Int4) | (Int8, Float8) | (Float8, Int8) => Float8,
        (TimestampTz, Text) | (Text, TimestampTz) => Text,
        _ => Text,
    }
}

/// Interpret a value from a date column as an instant.
///
/// Accepts native timestamps, RFC 3339 strings, and integers interpreted by
/// magnitude: day counts below 1e5, epoch seconds below 1e11, epoch
/// microseconds otherwise.
pub fn value_as_instant(value: &RowValue) -> Option<DateTime<Utc>> {
    match value {
        RowValue::Timestamp(ts) => Some(*ts),
        RowValue::Text(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        RowValue::Int(i) => {
            let n = *i;
            if n.abs() < 100_000 {
                // days since the Unix epoch
                DateTime::from_timestamp(n * 86_400, 0)
            } else if n.abs() < 100_000_000_000 {
                DateTime::from_timestamp(n, 0)
            } else {
                DateTime::from_timestamp_micros(n)
            }
        }
        RowValue::Float(f) => DateTime::from_timestamp(*f as i64, 0),
        _ => None,
    }
}
