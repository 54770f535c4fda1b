//! Object key and filename generation, period arithmetic, and partition
//! table name parsing.
//!
//! Everything in this module is pure: the same inputs always produce the
//! same outputs and nothing here touches the database or the object store.

use anyhow::{Result, bail};
use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Timelike, Utc};

/// Granularity of an archive output file.
///
/// When the requested duration is finer than the granularity of the source
/// partition, the partition is cut into one slice per period.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputDuration {
    Hourly,
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

impl OutputDuration {
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "hourly" => Ok(Self::Hourly),
            "daily" => Ok(Self::Daily),
            "weekly" => Ok(Self::Weekly),
            "monthly" => Ok(Self::Monthly),
            "yearly" => Ok(Self::Yearly),
            other => bail!("unknown output duration '{other}'"),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hourly => "hourly",
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
            Self::Yearly => "yearly",
        }
    }
}

/// Calendar granularity encoded in a partition table's name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionGranularity {
    Daily,
    Monthly,
}

impl PartitionGranularity {
    /// True when `duration` cuts finer than this partition's natural period,
    /// which forces range-sliced extraction.
    pub fn requires_split(&self, duration: OutputDuration) -> bool {
        match self {
            Self::Daily => matches!(duration, OutputDuration::Hourly),
            Self::Monthly => matches!(
                duration,
                OutputDuration::Hourly | OutputDuration::Daily | OutputDuration::Weekly
            ),
        }
    }
}

/// Expand `{table}`, `{YYYY}`, `{MM}`, `{DD}` and `{HH}` in a path template.
///
/// Placeholders not in that set are left untouched.
pub fn generate_prefix(template: &str, table: &str, ts: DateTime<Utc>) -> String {
    template
        .replace("{table}", table)
        .replace("{YYYY}", &format!("{:04}", ts.year()))
        .replace("{MM}", &format!("{:02}", ts.month()))
        .replace("{DD}", &format!("{:02}", ts.day()))
        .replace("{HH}", &format!("{:02}", ts.hour()))
}

/// Calendar-period suffix for a filename: `2024-03-15-07` for hourly,
/// `2024-03-15` daily, `2024-W11` weekly (ISO week, Monday start),
/// `2024-03` monthly, `2024` yearly.
pub fn period_suffix(ts: DateTime<Utc>, duration: OutputDuration) -> String {
    match duration {
        OutputDuration::Hourly => ts.format("%Y-%m-%d-%H").to_string(),
        OutputDuration::Daily => ts.format("%Y-%m-%d").to_string(),
        OutputDuration::Weekly => ts.format("%G-W%V").to_string(),
        OutputDuration::Monthly => ts.format("%Y-%m").to_string(),
        OutputDuration::Yearly => ts.format("%Y").to_string(),
    }
}

/// Archive filename for one output file:
/// `{table}-{period}{format_ext}{compression_ext}`.
pub fn archive_filename(
    table: &str,
    ts: DateTime<Utc>,
    duration: OutputDuration,
    format_ext: &str,
    compression_ext: &str,
) -> String {
    format!(
        "{table}-{}{format_ext}{compression_ext}",
        period_suffix(ts, duration)
    )
}

/// Full object key: expanded prefix joined with the archive filename.
pub fn object_key(
    template: &str,
    table: &str,
    ts: DateTime<Utc>,
    duration: OutputDuration,
    format_ext: &str,
    compression_ext: &str,
) -> String {
    let prefix = generate_prefix(template, table, ts);
    let name = archive_filename(table, ts, duration, format_ext, compression_ext);
    if prefix.is_empty() {
        name
    } else {
        format!("{}/{name}", prefix.trim_end_matches('/'))
    }
}

fn first_of_month(year: i32, month: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0).unwrap()
}

fn add_months(year: i32, month: u32, n: u32) -> (i32, u32) {
    let total = year * 12 + (month as i32 - 1) + n as i32;
    (total.div_euclid(12), total.rem_euclid(12) as u32 + 1)
}

/// Half-open period `[start, end)` containing `ts`, aligned to the start of
/// the period. Weekly periods start on Monday.
pub fn period_range(ts: DateTime<Utc>, duration: OutputDuration) -> (DateTime<Utc>, DateTime<Utc>) {
    match duration {
        OutputDuration::Hourly => {
            let start = Utc
                .with_ymd_and_hms(ts.year(), ts.month(), ts.day(), ts.hour(), 0, 0)
                .unwrap();
            (start, start + Duration::hours(1))
        }
        OutputDuration::Daily => {
            let start = Utc
                .with_ymd_and_hms(ts.year(), ts.month(), ts.day(), 0, 0, 0)
                .unwrap();
            (start, start + Duration::days(1))
        }
        OutputDuration::Weekly => {
            let days_from_monday = ts.weekday().num_days_from_monday() as i64;
            let monday = ts.date_naive() - Duration::days(days_from_monday);
            let start = Utc
                .with_ymd_and_hms(monday.year(), monday.month(), monday.day(), 0, 0, 0)
                .unwrap();
            (start, start + Duration::weeks(1))
        }
        OutputDuration::Monthly => {
            let start = first_of_month(ts.year(), ts.month());
            let (ny, nm) = add_months(ts.year(), ts.month(), 1);
            (start, first_of_month(ny, nm))
        }
        OutputDuration::Yearly => (
            first_of_month(ts.year(), 1),
            first_of_month(ts.year() + 1, 1),
        ),
    }
}

/// Cut `[start, end)` into consecutive sub-ranges of `duration`.
///
/// Partial leading and trailing periods are included; every sub-range is
/// clamped to the window, so the union covers exactly `[start, end)` and the
/// pieces are pairwise disjoint.
pub fn split_range(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    duration: OutputDuration,
) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
    let mut slices = Vec::new();
    let mut cursor = start;
    while cursor < end {
        let (_, period_end) = period_range(cursor, duration);
        let slice_end = period_end.min(end);
        slices.push((cursor, slice_end));
        cursor = slice_end;
    }
    slices
}

/// Parse a partition table name against its base name.
///
/// Exactly three suffix conventions are recognised after `{base}_`:
/// `YYYYMMDD`, `pYYYYMMDD`, and `YYYY_MM` (first day of that month). Any
/// other form yields `None`.
pub fn parse_partition(base: &str, name: &str) -> Option<(NaiveDate, PartitionGranularity)> {
    let suffix = name.strip_prefix(base)?.strip_prefix('_')?;

    // pYYYYMMDD
    if let Some(digits) = suffix.strip_prefix('p') {
        return parse_yyyymmdd(digits).map(|d| (d, PartitionGranularity::Daily));
    }
    // YYYYMMDD
    if suffix.len() == 8 && suffix.bytes().all(|b| b.is_ascii_digit()) {
        return parse_yyyymmdd(suffix).map(|d| (d, PartitionGranularity::Daily));
    }
    // YYYY_MM
    if suffix.len() == 7 && suffix.as_bytes()[4] == b'_' {
        let (y, m) = (&suffix[..4], &suffix[5..]);
        if y.bytes().all(|b| b.is_ascii_digit()) && m.bytes().all(|b| b.is_ascii_digit()) {
            let year: i32 = y.parse().ok()?;
            let month: u32 = m.parse().ok()?;
            return NaiveDate::from_ymd_opt(year, month, 1)
                .map(|d| (d, PartitionGranularity::Monthly));
        }
    }
    None
}

fn parse_yyyymmdd(s: &str) -> Option<NaiveDate> {
    if s.len() != 8 || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let year: i32 = s[..4].parse().ok()?;
    let month: u32 = s[4..6].parse().ok()?;
    let day: u32 = s[6..8].parse().ok()?;
    NaiveDate::from_ymd_opt(year, month, day)
}

/// Midnight UTC at the start of `date`.
pub fn date_start(date: NaiveDate) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(date.year(), date.month(), date.day(), 0, 0, 0)
        .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn prefix_expands_only_known_placeholders() {
        let out = generate_prefix(
            "export/{table}/{YYYY}/{MM}",
            "flights",
            ts("2024-03-15T10:30:00Z"),
        );
        assert_eq!(out, "export/flights/2024/03");

        let untouched = generate_prefix("{nope}/{table}", "t", ts("2024-03-15T00:00:00Z"));
        assert_eq!(untouched, "{nope}/t");
    }

    #[test]
    fn filename_per_duration() {
        let t = ts("2024-03-15T07:45:00Z");
        assert_eq!(
            archive_filename("flights", t, OutputDuration::Daily, ".jsonl", ".zst"),
            "flights-2024-03-15.jsonl.zst"
        );
        assert_eq!(
            archive_filename("flights", t, OutputDuration::Hourly, ".csv", ".gz"),
            "flights-2024-03-15-07.csv.gz"
        );
        // 2024-03-15 is a Friday in ISO week 11
        assert_eq!(
            archive_filename("flights", t, OutputDuration::Weekly, ".jsonl", ""),
            "flights-2024-W11.jsonl"
        );
        assert_eq!(
            archive_filename("flights", t, OutputDuration::Monthly, ".parquet", ".lz4"),
            "flights-2024-03.parquet.lz4"
        );
    }

    #[test]
    fn weekly_range_aligns_to_monday() {
        // Sunday 2024-03-17 belongs to the week starting Monday 2024-03-11
        let (start, end) = period_range(ts("2024-03-17T23:00:00Z"), OutputDuration::Weekly);
        assert_eq!(start, ts("2024-03-11T00:00:00Z"));
        assert_eq!(end, ts("2024-03-18T00:00:00Z"));
    }

    #[test]
    fn monthly_range_handles_year_rollover() {
        let (start, end) = period_range(ts("2023-12-15T12:00:00Z"), OutputDuration::Monthly);
        assert_eq!(start, ts("2023-12-01T00:00:00Z"));
        assert_eq!(end, ts("2024-01-01T00:00:00Z"));
    }

    #[test]
    fn split_covers_window_exactly() {
        let start = ts("2024-03-01T00:00:00Z");
        let end = ts("2024-04-01T00:00:00Z");
        let slices = split_range(start, end, OutputDuration::Daily);
        assert_eq!(slices.len(), 31);
        assert_eq!(slices[0].0, start);
        assert_eq!(slices[30].1, end);
        for pair in slices.windows(2) {
            assert_eq!(pair[0].1, pair[1].0, "slices must be contiguous");
        }
    }

    #[test]
    fn split_clamps_partial_edges() {
        let start = ts("2024-03-15T10:30:00Z");
        let end = ts("2024-03-15T13:10:00Z");
        let slices = split_range(start, end, OutputDuration::Hourly);
        assert_eq!(slices.len(), 4);
        assert_eq!(slices[0], (start, ts("2024-03-15T11:00:00Z")));
        assert_eq!(slices[3], (ts("2024-03-15T13:00:00Z"), end));
    }

    #[test]
    fn partition_name_round_trip() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 15).unwrap();
        let name = format!("flights_{}", date.format("%Y%m%d"));
        let (parsed, gran) = parse_partition("flights", &name).unwrap();
        assert_eq!(parsed, date);
        assert_eq!(gran, PartitionGranularity::Daily);

        let (parsed, _) = parse_partition("flights", "flights_p20240315").unwrap();
        assert_eq!(parsed, date);

        let (parsed, gran) = parse_partition("flights", "flights_2024_03").unwrap();
        assert_eq!(parsed, NaiveDate::from_ymd_opt(2024, 3, 1).unwrap());
        assert_eq!(gran, PartitionGranularity::Monthly);
    }

    #[test]
    fn partition_name_rejects_other_forms() {
        assert!(parse_partition("flights", "flights_2024").is_none());
        assert!(parse_partition("flights", "flights_20241301").is_none());
        assert!(parse_partition("flights", "flights_default").is_none());
        assert!(parse_partition("flights", "other_20240315").is_none());
        assert!(parse_partition("flights", "flights20240315").is_none());
        assert!(parse_partition("flights", "flights_2024_3").is_none());
    }

    #[test]
    fn requires_split_matrix() {
        use OutputDuration::*;
        assert!(PartitionGranularity::Daily.requires_split(Hourly));
        assert!(!PartitionGranularity::Daily.requires_split(Daily));
        assert!(!PartitionGranularity::Daily.requires_split(Monthly));
        assert!(PartitionGranularity::Monthly.requires_split(Daily));
        assert!(PartitionGranularity::Monthly.requires_split(Weekly));
        assert!(!PartitionGranularity::Monthly.requires_split(Monthly));
        assert!(!PartitionGranularity::Monthly.requires_split(Yearly));
    }
}
