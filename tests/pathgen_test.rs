use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};

use pgarchive::pathgen::{
    OutputDuration, PartitionGranularity, archive_filename, object_key, parse_partition,
    period_range, split_range,
};

fn ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
}

/// A small daily archive of `flights` with the default template must land
/// at the documented key, byte for byte.
#[test]
fn test_daily_object_key_layout() {
    let key = object_key(
        "export/{table}/{YYYY}/{MM}",
        "flights",
        ts("2024-03-15T00:00:00Z"),
        OutputDuration::Daily,
        ".jsonl",
        ".zst",
    );
    assert_eq!(key, "export/flights/2024/03/flights-2024-03-15.jsonl.zst");
}

/// Every partition name the tool generates must parse back to its own
/// date: day precision for the daily conventions, first-of-month for the
/// monthly one.
#[test]
fn test_partition_name_round_trip_over_a_year() {
    let mut date = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
    let end = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap();
    while date < end {
        let plain = format!("events_{}", date.format("%Y%m%d"));
        let (parsed, gran) = parse_partition("events", &plain)
            .unwrap_or_else(|| panic!("failed to parse {plain}"));
        assert_eq!(parsed, date);
        assert_eq!(gran, PartitionGranularity::Daily);

        let prefixed = format!("events_p{}", date.format("%Y%m%d"));
        let (parsed, _) = parse_partition("events", &prefixed).unwrap();
        assert_eq!(parsed, date);

        let monthly = format!("events_{}", date.format("%Y_%m"));
        let (parsed, gran) = parse_partition("events", &monthly).unwrap();
        assert_eq!(parsed, date.with_day(1).unwrap());
        assert_eq!(gran, PartitionGranularity::Monthly);

        date += Duration::days(1);
    }
}

/// Splitting any window must cover it exactly with pairwise-disjoint,
/// contiguous sub-ranges regardless of duration.
#[test]
fn test_split_union_covers_window_exactly() {
    let cases = [
        ("2024-03-01T00:00:00Z", "2024-04-01T00:00:00Z", OutputDuration::Daily, 31),
        ("2024-03-15T00:00:00Z", "2024-03-16T00:00:00Z", OutputDuration::Hourly, 24),
        ("2024-02-01T00:00:00Z", "2024-03-01T00:00:00Z", OutputDuration::Daily, 29),
        ("2024-01-01T00:00:00Z", "2025-01-01T00:00:00Z", OutputDuration::Monthly, 12),
        ("2023-11-07T13:30:00Z", "2023-12-25T01:15:00Z", OutputDuration::Weekly, 8),
    ];
    for (start, end, duration, expected) in cases {
        let start = ts(start);
        let end = ts(end);
        let slices = split_range(start, end, duration);
        assert_eq!(slices.len(), expected, "{duration:?} slice count");
        assert_eq!(slices.first().unwrap().0, start);
        assert_eq!(slices.last().unwrap().1, end);
        for pair in slices.windows(2) {
            assert_eq!(pair[0].1, pair[1].0, "gap or overlap between slices");
            assert!(pair[0].0 < pair[0].1, "empty slice");
        }
    }
}

/// A monthly partition cut daily must produce one filename per calendar
/// day of that month.
#[test]
fn test_monthly_partition_daily_slice_filenames() {
    let (start, end) = period_range(ts("2024-03-01T00:00:00Z"), OutputDuration::Monthly);
    let slices = split_range(start, end, OutputDuration::Daily);
    assert_eq!(slices.len(), 31);

    let names: Vec<String> = slices
        .iter()
        .map(|(s, _)| archive_filename("flights", *s, OutputDuration::Daily, ".jsonl", ".zst"))
        .collect();
    assert_eq!(names[0], "flights-2024-03-01.jsonl.zst");
    assert_eq!(names[30], "flights-2024-03-31.jsonl.zst");
    // no duplicates
    let mut unique = names.clone();
    unique.dedup();
    assert_eq!(unique.len(), names.len());
}

/// Hourly keys thread the hour through both the prefix and the filename.
#[test]
fn test_hourly_key_includes_hour() {
    let key = object_key(
        "{table}/{YYYY}/{MM}/{DD}/{HH}",
        "metrics",
        ts("2024-03-15T07:00:00Z"),
        OutputDuration::Hourly,
        ".csv",
        ".gz",
    );
    assert_eq!(key, "metrics/2024/03/15/07/metrics-2024-03-15-07.csv.gz");
}
