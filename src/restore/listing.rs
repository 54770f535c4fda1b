//! Archive listing and filename date extraction.

use anyhow::Result;
use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, info};

use crate::storage::ObjectStore;

/// `YYYY-MM-DD` with an optional `-HH`, as produced by hourly and daily
/// archive filenames.
static DATE_DASHED_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d{4})-(\d{2})-(\d{2})(?:-(\d{2}))?").unwrap());

/// Compact `YYYYMMDD`.
static DATE_COMPACT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d{8})").unwrap());

/// Month-only `YYYY-MM`, used by monthly archive filenames.
static DATE_MONTH_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d{4})-(\d{2})").unwrap());

/// One archive file selected for restore.
#[derive(Debug, Clone)]
pub struct ArchiveObject {
    pub key: String,
    pub filename: String,
    pub date: Option<NaiveDate>,
    pub size: u64,
}

/// Expanded prefix up to the first date placeholder, used to bound the
/// bucket listing.
pub fn non_date_prefix(template: &str, table: &str) -> String {
    let expanded = template.replace("{table}", table);
    let cut = ["{YYYY}", "{MM}", "{DD}", "{HH}"]
        .iter()
        .filter_map(|p| expanded.find(p))
        .min()
        .unwrap_or(expanded.len());
    expanded[..cut].to_string()
}

/// Extract a calendar date from an archive filename.
pub fn date_from_filename(name: &str) -> Option<NaiveDate> {
    if let Some(caps) = DATE_DASHED_RE.captures(name) {
        let date = NaiveDate::from_ymd_opt(
            caps[1].parse().ok()?,
            caps[2].parse().ok()?,
            caps[3].parse().ok()?,
        );
        if date.is_some() {
            return date;
        }
    }
    if let Some(caps) = DATE_COMPACT_RE.captures(name) {
        let digits = &caps[1];
        let date = NaiveDate::from_ymd_opt(
            digits[..4].parse().ok()?,
            digits[4..6].parse().ok()?,
            digits[6..8].parse().ok()?,
        );
        if date.is_some() {
            return date;
        }
    }
    if let Some(caps) = DATE_MONTH_RE.captures(name) {
        return NaiveDate::from_ymd_opt(caps[1].parse().ok()?, caps[2].parse().ok()?, 1);
    }
    None
}

/// List the archive for `table`, pairing every object with the date parsed
/// from its filename (falling back to its last-modified time) and filtering
/// by the inclusive window when one is given.
pub async fn list_archives(
    store: &ObjectStore,
    template: &str,
    table: &str,
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
) -> Result<Vec<ArchiveObject>> {
    let prefix = non_date_prefix(template, table);
    info!("Listing archive objects under s3://{}/{prefix}", store.bucket());

    let mut archives = Vec::new();
    for object in store.list(&prefix).await? {
        let filename = object
            .key
            .rsplit_once('/')
            .map(|(_, name)| name.to_string())
            .unwrap_or_else(|| object.key.clone());
        let date = date_from_filename(&filename)
            .or_else(|| object.last_modified.map(|t| t.date_naive()));
        if let (Some(d), Some(s)) = (date, start)
            && d < s
        {
            debug!("Skipping {filename}: before window start");
            continue;
        }
        if let (Some(d), Some(e)) = (date, end)
            && d > e
        {
            debug!("Skipping {filename}: after window end");
            continue;
        }
        archives.push(ArchiveObject {
            key: object.key,
            filename,
            date,
            size: object.size,
        });
    }
    archives.sort_by(|a, b| a.date.cmp(&b.date).then_with(|| a.key.cmp(&b.key)));
    info!("Selected {} archive objects", archives.len());
    Ok(archives)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_stops_at_first_date_placeholder() {
        assert_eq!(
            non_date_prefix("export/{table}/{YYYY}/{MM}", "flights"),
            "export/flights/"
        );
        assert_eq!(non_date_prefix("flat/{table}", "flights"), "flat/flights");
        assert_eq!(non_date_prefix("{YYYY}/{table}", "flights"), "");
    }

    #[test]
    fn filename_date_patterns() {
        let d = |y, m, dd| NaiveDate::from_ymd_opt(y, m, dd).unwrap();
        assert_eq!(
            date_from_filename("flights-2024-03-15.jsonl.zst"),
            Some(d(2024, 3, 15))
        );
        assert_eq!(
            date_from_filename("flights-2024-03-15-07.csv.gz"),
            Some(d(2024, 3, 15))
        );
        assert_eq!(
            date_from_filename("20240315-fixes.csv.zst"),
            Some(d(2024, 3, 15))
        );
        assert_eq!(
            date_from_filename("flights-2024-03.parquet"),
            Some(d(2024, 3, 1))
        );
        assert_eq!(date_from_filename("flights-latest.jsonl"), None);
    }
}
