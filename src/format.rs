//! Row formatters: JSON-lines, delimited CSV with header, and parquet.
//!
//! Encoders consume rows one at a time so extraction can stream; the
//! parquet encoder is the only one that needs a schema up front. Decoders
//! are the inverse used by the restore engine.

use anyhow::{Context, Result, anyhow, bail};
use chrono::SecondsFormat;
use std::io::BufRead;
use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, BinaryArray, BinaryBuilder, BooleanArray, BooleanBuilder, Float32Array,
    Float32Builder, Float64Array, Float64Builder, Int32Array, Int32Builder, Int64Array,
    Int64Builder, StringArray, StringBuilder, TimestampMicrosecondArray,
    TimestampMicrosecondBuilder, TimestampNanosecondArray,
};
use arrow::datatypes::{DataType, Field, Schema as ArrowSchema, TimeUnit};
use arrow::record_batch::RecordBatch;
use parquet::arrow::ArrowWriter;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;

use crate::compress::Compression;
use crate::rowset::{ColumnType, Row, RowValue, Schema};

/// CSV marker distinguishing SQL NULL from the empty string.
const CSV_NULL: &str = "\\N";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Jsonl,
    Csv,
    Parquet,
}

impl OutputFormat {
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "jsonl" | "json" => Ok(Self::Jsonl),
            "csv" => Ok(Self::Csv),
            "parquet" => Ok(Self::Parquet),
            other => bail!("unknown output format '{other}'"),
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext {
            "jsonl" | "json" => Some(Self::Jsonl),
            "csv" => Some(Self::Csv),
            "parquet" => Some(Self::Parquet),
            _ => None,
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Jsonl => ".jsonl",
            Self::Csv => ".csv",
            Self::Parquet => ".parquet",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Jsonl => "application/x-ndjson",
            Self::Csv => "text/csv",
            Self::Parquet => "application/vnd.apache.parquet",
        }
    }

    /// Build a streaming encoder. Parquet requires a schema; the row
    /// formats ignore it.
    pub fn encoder(&self, schema: Option<Schema>) -> Result<Box<dyn RowEncoder + Send>> {
        match self {
            Self::Jsonl => Ok(Box::new(JsonlEncoder::new())),
            Self::Csv => Ok(Box::new(CsvEncoder::new())),
            Self::Parquet => {
                let schema =
                    schema.ok_or_else(|| anyhow!("parquet output requires a schema"))?;
                Ok(Box::new(ParquetEncoder::new(schema)))
            }
        }
    }

    /// Decode a whole payload back into rows.
    pub fn decode(&self, data: &[u8]) -> Result<Vec<Row>> {
        match self {
            Self::Jsonl => decode_jsonl(data),
            Self::Csv => decode_csv(data),
            Self::Parquet => decode_parquet(data),
        }
    }
}

/// Streaming row sink producing the encoded file body.
pub trait RowEncoder {
    fn write_row(&mut self, row: &Row) -> Result<()>;
    fn finish(self: Box<Self>) -> Result<Vec<u8>>;
    fn rows_written(&self) -> u64;
}

// ---------------------------------------------------------------------------
// JSON lines
// ---------------------------------------------------------------------------

struct JsonlEncoder {
    buf: Vec<u8>,
    rows: u64,
}

impl JsonlEncoder {
    fn new() -> Self {
        Self {
            buf: Vec::new(),
            rows: 0,
        }
    }
}

fn value_to_json(value: &RowValue) -> serde_json::Value {
    match value {
        RowValue::Null => serde_json::Value::Null,
        RowValue::Bool(b) => serde_json::Value::Bool(*b),
        RowValue::Int(i) => serde_json::Value::from(*i),
        RowValue::Float(f) => {
            serde_json::Number::from_f64(*f).map_or(serde_json::Value::Null, serde_json::Value::Number)
        }
        RowValue::Text(s) => serde_json::Value::String(s.clone()),
        RowValue::Bytes(b) => serde_json::Value::String(hex::encode(b)),
        RowValue::Timestamp(ts) => {
            serde_json::Value::String(ts.to_rfc3339_opts(SecondsFormat::Micros, true))
        }
    }
}

impl RowEncoder for JsonlEncoder {
    fn write_row(&mut self, row: &Row) -> Result<()> {
        let mut object = serde_json::Map::new();
        for (name, value) in &row.cells {
            object.insert(name.clone(), value_to_json(value));
        }
        serde_json::to_writer(&mut self.buf, &serde_json::Value::Object(object))
            .context("serializing row to json")?;
        self.buf.push(b'\n');
        self.rows += 1;
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<Vec<u8>> {
        Ok(self.buf)
    }

    fn rows_written(&self) -> u64 {
        self.rows
    }
}

fn decode_jsonl(data: &[u8]) -> Result<Vec<Row>> {
    let mut rows = Vec::new();
    for (lineno, line) in data.split(|b| *b == b'\n').enumerate() {
        if line.is_empty() {
            continue;
        }
        let value: serde_json::Value = serde_json::from_slice(line)
            .with_context(|| format!("parsing json line {}", lineno + 1))?;
        let object = value
            .as_object()
            .ok_or_else(|| anyhow!("json line {} is not an object", lineno + 1))?;
        let mut row = Row::new();
        for (name, v) in object {
            row.push(name.clone(), json_to_value(v));
        }
        rows.push(row);
    }
    Ok(rows)
}

fn json_to_value(v: &serde_json::Value) -> RowValue {
    match v {
        serde_json::Value::Null => RowValue::Null,
        serde_json::Value::Bool(b) => RowValue::Bool(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                RowValue::Int(i)
            } else {
                RowValue::Float(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        serde_json::Value::String(s) => RowValue::Text(s.clone()),
        other => RowValue::Text(other.to_string()),
    }
}

// ---------------------------------------------------------------------------
// CSV
// ---------------------------------------------------------------------------

struct CsvEncoder {
    writer: csv::Writer<Vec<u8>>,
    wrote_header: bool,
    rows: u64,
}

impl CsvEncoder {
    fn new() -> Self {
        Self {
            writer: csv::Writer::from_writer(Vec::new()),
            wrote_header: false,
            rows: 0,
        }
    }
}

impl RowEncoder for CsvEncoder {
    fn write_row(&mut self, row: &Row) -> Result<()> {
        if !self.wrote_header {
            self.writer
                .write_record(row.column_names())
                .context("writing csv header")?;
            self.wrote_header = true;
        }
        let fields: Vec<String> = row
            .cells
            .iter()
            .map(|(_, v)| {
                if v.is_null() {
                    CSV_NULL.to_string()
                } else {
                    v.to_field()
                }
            })
            .collect();
        self.writer.write_record(&fields).context("writing csv row")?;
        self.rows += 1;
        Ok(())
    }

    fn finish(mut self: Box<Self>) -> Result<Vec<u8>> {
        self.writer.flush().context("flushing csv writer")?;
        self.writer
            .into_inner()
            .map_err(|e| anyhow!("recovering csv buffer: {e}"))
    }

    fn rows_written(&self) -> u64 {
        self.rows
    }
}

fn decode_csv(data: &[u8]) -> Result<Vec<Row>> {
    let mut reader = csv::Reader::from_reader(data);
    let headers = reader.headers().context("reading csv header")?.clone();
    let mut rows = Vec::new();
    for (lineno, record) in reader.records().enumerate() {
        let record = record.with_context(|| format!("reading csv record {}", lineno + 1))?;
        let mut row = Row::new();
        for (name, field) in headers.iter().zip(record.iter()) {
            let value = if field == CSV_NULL {
                RowValue::Null
            } else {
                RowValue::Text(field.to_string())
            };
            row.push(name, value);
        }
        rows.push(row);
    }
    Ok(rows)
}

// ---------------------------------------------------------------------------
// Parquet
// ---------------------------------------------------------------------------

const PARQUET_BATCH_ROWS: usize = 4096;

fn arrow_field(name: &str, ty: ColumnType) -> Field {
    let data_type = match ty {
        ColumnType::Bool => DataType::Boolean,
        ColumnType::Int4 => DataType::Int32,
        ColumnType::Int8 => DataType::Int64,
        ColumnType::Float4 => DataType::Float32,
        ColumnType::Float8 => DataType::Float64,
        ColumnType::Text => DataType::Utf8,
        ColumnType::Bytea => DataType::Binary,
        ColumnType::TimestampTz => DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
    };
    Field::new(name, data_type, true)
}

struct ParquetEncoder {
    schema: Schema,
    arrow_schema: Arc<ArrowSchema>,
    pending: Vec<Row>,
    writer: Option<ArrowWriter<Vec<u8>>>,
    rows: u64,
}

impl ParquetEncoder {
    fn new(schema: Schema) -> Self {
        let fields: Vec<Field> = schema
            .columns
            .iter()
            .map(|(name, ty)| arrow_field(name, *ty))
            .collect();
        Self {
            arrow_schema: Arc::new(ArrowSchema::new(fields)),
            schema,
            pending: Vec::new(),
            writer: None,
            rows: 0,
        }
    }

    fn flush_batch(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let batch = build_record_batch(&self.schema, self.arrow_schema.clone(), &self.pending)?;
        if self.writer.is_none() {
            self.writer = Some(
                ArrowWriter::try_new(Vec::new(), self.arrow_schema.clone(), None)
                    .context("creating parquet writer")?,
            );
        }
        self.writer
            .as_mut()
            .unwrap()
            .write(&batch)
            .context("writing parquet batch")?;
        self.pending.clear();
        Ok(())
    }
}

impl RowEncoder for ParquetEncoder {
    fn write_row(&mut self, row: &Row) -> Result<()> {
        self.pending.push(row.clone());
        self.rows += 1;
        if self.pending.len() >= PARQUET_BATCH_ROWS {
            self.flush_batch()?;
        }
        Ok(())
    }

    fn finish(mut self: Box<Self>) -> Result<Vec<u8>> {
        self.flush_batch()?;
        let writer = match self.writer.take() {
            Some(w) => w,
            // No rows at all: still emit a valid empty file with the schema.
            None => ArrowWriter::try_new(Vec::new(), self.arrow_schema.clone(), None)
                .context("creating parquet writer")?,
        };
        writer.into_inner().context("finalizing parquet file")
    }

    fn rows_written(&self) -> u64 {
        self.rows
    }
}

fn build_record_batch(
    schema: &Schema,
    arrow_schema: Arc<ArrowSchema>,
    rows: &[Row],
) -> Result<RecordBatch> {
    let mut arrays: Vec<ArrayRef> = Vec::with_capacity(schema.columns.len());
    for (name, ty) in &schema.columns {
        arrays.push(build_column(name, *ty, rows)?);
    }
    RecordBatch::try_new(arrow_schema, arrays).context("assembling record batch")
}

fn build_column(name: &str, ty: ColumnType, rows: &[Row]) -> Result<ArrayRef> {
    macro_rules! fill {
        ($builder:expr, $getter:expr) => {{
            let mut builder = $builder;
            for row in rows {
                match row.get(name) {
                    None | Some(RowValue::Null) => builder.append_null(),
                    Some(v) => match $getter(v) {
                        Some(x) => builder.append_value(x),
                        None => bail!("column '{name}' has a value incompatible with {ty:?}"),
                    },
                }
            }
            Ok(Arc::new(builder.finish()) as ArrayRef)
        }};
    }

    match ty {
        ColumnType::Bool => fill!(BooleanBuilder::new(), |v: &RowValue| match v {
            RowValue::Bool(b) => Some(*b),
            _ => None,
        }),
        ColumnType::Int4 => fill!(Int32Builder::new(), |v: &RowValue| match v {
            RowValue::Int(i) => i32::try_from(*i).ok(),
            _ => None,
        }),
        ColumnType::Int8 => fill!(Int64Builder::new(), |v: &RowValue| match v {
            RowValue::Int(i) => Some(*i),
            _ => None,
        }),
        ColumnType::Float4 => fill!(Float32Builder::new(), |v: &RowValue| match v {
            RowValue::Float(f) => Some(*f as f32),
            RowValue::Int(i) => Some(*i as f32),
            _ => None,
        }),
        ColumnType::Float8 => fill!(Float64Builder::new(), |v: &RowValue| match v {
            RowValue::Float(f) => Some(*f),
            RowValue::Int(i) => Some(*i as f64),
            _ => None,
        }),
        ColumnType::Text => fill!(StringBuilder::new(), |v: &RowValue| Some(v.to_field())),
        ColumnType::Bytea => fill!(BinaryBuilder::new(), |v: &RowValue| match v {
            RowValue::Bytes(b) => Some(b.clone()),
            _ => None,
        }),
        ColumnType::TimestampTz => fill!(
            TimestampMicrosecondBuilder::new().with_timezone("UTC"),
            |v: &RowValue| crate::rowset::value_as_instant(v).map(|ts| ts.timestamp_micros())
        ),
    }
}

fn decode_parquet(data: &[u8]) -> Result<Vec<Row>> {
    let reader = ParquetRecordBatchReaderBuilder::try_new(bytes::Bytes::from(data.to_vec()))
        .context("opening parquet payload")?
        .build()
        .context("building parquet reader")?;

    let mut rows = Vec::new();
    for batch in reader {
        let batch = batch.context("reading parquet batch")?;
        let schema = batch.schema();
        for i in 0..batch.num_rows() {
            let mut row = Row::new();
            for (col, field) in batch.columns().iter().zip(schema.fields()) {
                row.push(field.name().clone(), arrow_cell(col, i)?);
            }
            rows.push(row);
        }
    }
    Ok(rows)
}

fn arrow_cell(array: &ArrayRef, i: usize) -> Result<RowValue> {
    if array.is_null(i) {
        return Ok(RowValue::Null);
    }
    let any = array.as_any();
    let value = match array.data_type() {
        DataType::Boolean => RowValue::Bool(any.downcast_ref::<BooleanArray>().unwrap().value(i)),
        DataType::Int32 => {
            RowValue::Int(any.downcast_ref::<Int32Array>().unwrap().value(i) as i64)
        }
        DataType::Int64 => RowValue::Int(any.downcast_ref::<Int64Array>().unwrap().value(i)),
        DataType::Float32 => {
            RowValue::Float(any.downcast_ref::<Float32Array>().unwrap().value(i) as f64)
        }
        DataType::Float64 => RowValue::Float(any.downcast_ref::<Float64Array>().unwrap().value(i)),
        DataType::Utf8 => {
            RowValue::Text(any.downcast_ref::<StringArray>().unwrap().value(i).to_string())
        }
        DataType::Binary => {
            RowValue::Bytes(any.downcast_ref::<BinaryArray>().unwrap().value(i).to_vec())
        }
        DataType::Timestamp(TimeUnit::Microsecond, _) => {
            let micros = any
                .downcast_ref::<TimestampMicrosecondArray>()
                .unwrap()
                .value(i);
            chrono::DateTime::from_timestamp_micros(micros)
                .map(RowValue::Timestamp)
                .unwrap_or(RowValue::Null)
        }
        DataType::Timestamp(TimeUnit::Nanosecond, _) => {
            let nanos = any
                .downcast_ref::<TimestampNanosecondArray>()
                .unwrap()
                .value(i);
            RowValue::Timestamp(chrono::DateTime::from_timestamp_nanos(nanos))
        }
        other => bail!("unsupported parquet column type {other}"),
    };
    Ok(value)
}

/// Split a filename into (format, compression) by its extensions. A known
/// compression suffix is stripped first; what remains decides the format.
pub fn detect(filename: &str) -> (Option<OutputFormat>, Compression) {
    let mut stem = filename;
    let mut compression = Compression::None;
    if let Some((rest, ext)) = stem.rsplit_once('.')
        && let Some(c) = Compression::from_extension(ext)
    {
        compression = c;
        stem = rest;
    }
    let format = stem
        .rsplit_once('.')
        .and_then(|(_, ext)| OutputFormat::from_extension(ext));
    (format, compression)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn sample_rows() -> Vec<Row> {
        let ts = Utc.with_ymd_and_hms(2024, 3, 15, 10, 0, 0).unwrap();
        let mut a = Row::new();
        a.push("id", RowValue::Int(1));
        a.push("name", RowValue::Text("alpha".into()));
        a.push("seen_at", RowValue::Timestamp(ts));
        a.push("note", RowValue::Null);
        let mut b = Row::new();
        b.push("id", RowValue::Int(2));
        b.push("name", RowValue::Text(String::new()));
        b.push("seen_at", RowValue::Timestamp(ts + chrono::Duration::hours(1)));
        b.push("note", RowValue::Text("x".into()));
        vec![a, b]
    }

    fn encode_all(format: OutputFormat, schema: Option<Schema>, rows: &[Row]) -> Vec<u8> {
        let mut encoder = format.encoder(schema).unwrap();
        for row in rows {
            encoder.write_row(row).unwrap();
        }
        encoder.finish().unwrap()
    }

    #[test]
    fn jsonl_preserves_null_vs_empty_string() {
        let rows = sample_rows();
        let data = encode_all(OutputFormat::Jsonl, None, &rows);
        let decoded = OutputFormat::Jsonl.decode(&data).unwrap();
        assert_eq!(decoded.len(), 2);
        assert!(decoded[0].get("note").unwrap().is_null());
        assert_eq!(
            decoded[1].get("name").unwrap(),
            &RowValue::Text(String::new())
        );
        // timestamps carry their offset
        match decoded[0].get("seen_at").unwrap() {
            RowValue::Text(s) => assert!(s.contains('T') && s.ends_with('Z')),
            v => panic!("expected textual timestamp, got {v:?}"),
        }
    }

    #[test]
    fn csv_header_and_null_marker() {
        let rows = sample_rows();
        let data = encode_all(OutputFormat::Csv, None, &rows);
        let text = String::from_utf8(data.clone()).unwrap();
        assert!(text.starts_with("id,name,seen_at,note\n"));

        let decoded = OutputFormat::Csv.decode(&data).unwrap();
        assert!(decoded[0].get("note").unwrap().is_null());
        assert_eq!(
            decoded[1].get("name").unwrap(),
            &RowValue::Text(String::new())
        );
    }

    #[test]
    fn parquet_round_trip_with_schema() {
        let rows = sample_rows();
        let schema = Schema {
            columns: vec![
                ("id".into(), ColumnType::Int8),
                ("name".into(), ColumnType::Text),
                ("seen_at".into(), ColumnType::TimestampTz),
                ("note".into(), ColumnType::Text),
            ],
        };
        let data = encode_all(OutputFormat::Parquet, Some(schema), &rows);
        let decoded = OutputFormat::Parquet.decode(&data).unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].get("id").unwrap(), &RowValue::Int(1));
        assert!(decoded[0].get("note").unwrap().is_null());
        match decoded[1].get("seen_at").unwrap() {
            RowValue::Timestamp(ts) => {
                assert_eq!(ts.to_rfc3339(), "2024-03-15T11:00:00+00:00")
            }
            v => panic!("expected timestamp, got {v:?}"),
        }
    }

    #[test]
    fn parquet_requires_schema() {
        assert!(OutputFormat::Parquet.encoder(None).is_err());
    }

    #[test]
    fn detect_extensions() {
        let (f, c) = detect("flights-2024-03-15.jsonl.zst");
        assert_eq!(f, Some(OutputFormat::Jsonl));
        assert_eq!(c, Compression::Zstd);

        let (f, c) = detect("flights-2024-03-15.csv");
        assert_eq!(f, Some(OutputFormat::Csv));
        assert_eq!(c, Compression::None);

        let (f, c) = detect("flights.parquet.gz");
        assert_eq!(f, Some(OutputFormat::Parquet));
        assert_eq!(c, Compression::Gzip);

        let (f, c) = detect("README");
        assert_eq!(f, None);
        assert_eq!(c, Compression::None);
    }
}
