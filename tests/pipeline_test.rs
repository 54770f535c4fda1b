use chrono::{TimeZone, Utc};

use pgarchive::compress::Compression;
use pgarchive::etag::{PART_SIZE, content_md5, is_multipart, multipart_etag};
use pgarchive::format::{OutputFormat, detect};
use pgarchive::pathgen::{OutputDuration, archive_filename};
use pgarchive::rowset::{Row, RowValue};

fn sample_rows(n: i64) -> Vec<Row> {
    let base = Utc.with_ymd_and_hms(2024, 3, 15, 0, 0, 0).unwrap();
    (0..n)
        .map(|i| {
            let mut row = Row::new();
            row.push("id", RowValue::Int(i));
            row.push("name", RowValue::Text(format!("row-{i}")));
            row.push(
                "created_at",
                RowValue::Timestamp(base + chrono::Duration::seconds(i)),
            );
            row.push(
                "note",
                if i % 3 == 0 {
                    RowValue::Null
                } else {
                    RowValue::Text(String::new())
                },
            );
            row
        })
        .collect()
}

fn encode(format: OutputFormat, rows: &[Row]) -> Vec<u8> {
    let mut encoder = format.encoder(None).unwrap();
    for row in rows {
        encoder.write_row(row).unwrap();
    }
    encoder.finish().unwrap()
}

/// The full encode -> compress -> decompress -> decode stack must
/// preserve row count and the null/empty-string distinction for every
/// codec the archiver ships.
#[test]
fn test_row_payload_survives_compression_stack() {
    let rows = sample_rows(500);
    for format in [OutputFormat::Jsonl, OutputFormat::Csv] {
        let encoded = encode(format, &rows);
        for codec in [
            Compression::Zstd,
            Compression::Lz4,
            Compression::Gzip,
            Compression::None,
        ] {
            let compressed = codec.compress(&encoded, None, 1).unwrap();
            let restored = codec.decompress(&compressed).unwrap();
            assert_eq!(restored, encoded, "{format:?}/{codec:?} corrupted bytes");

            let decoded = format.decode(&restored).unwrap();
            assert_eq!(decoded.len(), rows.len());
            assert!(decoded[0].get("note").unwrap().is_null());
            assert_eq!(
                decoded[1].get("note").unwrap(),
                &RowValue::Text(String::new()),
                "{format:?} lost the null/empty distinction"
            );
        }
    }
}

/// Filenames generated by the archiver must be self-describing: detection
/// recovers exactly the format and compression that produced them.
#[test]
fn test_generated_filenames_detect_back() {
    let ts = Utc.with_ymd_and_hms(2024, 3, 15, 0, 0, 0).unwrap();
    for format in [OutputFormat::Jsonl, OutputFormat::Csv, OutputFormat::Parquet] {
        for codec in [
            Compression::Zstd,
            Compression::Lz4,
            Compression::Gzip,
            Compression::None,
        ] {
            let name = archive_filename(
                "flights",
                ts,
                OutputDuration::Daily,
                format.extension(),
                codec.extension(),
            );
            let (detected_format, detected_codec) = detect(&name);
            assert_eq!(detected_format, Some(format), "from {name}");
            assert_eq!(detected_codec, codec, "from {name}");
        }
    }
}

/// Payloads of at most one part carry the plain content hash with no part
/// suffix.
#[test]
fn test_single_part_tag_equals_content_hash() {
    for size in [0usize, 1, 4096, PART_SIZE] {
        let data = vec![0xabu8; size];
        let tag = multipart_etag(&data);
        assert_eq!(tag, content_md5(&data), "size {size}");
        assert!(!is_multipart(&tag));
    }
}

/// Above one part the tag's trailing integer is the 5 MiB ceiling
/// division of the length; a 12 MiB payload therefore tags as `-3`.
#[test]
fn test_multipart_tag_part_counts() {
    let cases = [
        (PART_SIZE + 1, 2),
        (2 * PART_SIZE, 2),
        (12 * 1024 * 1024, 3),
        (5 * PART_SIZE + 17, 6),
    ];
    for (size, parts) in cases {
        let data = vec![0x5au8; size];
        let tag = multipart_etag(&data);
        let (digest, count) = tag.split_once('-').expect("tag must carry a part count");
        assert_eq!(count.parse::<usize>().unwrap(), parts, "size {size}");
        assert_eq!(count.parse::<usize>().unwrap(), size.div_ceil(PART_SIZE));
        assert_eq!(digest.len(), 32, "digest must be a hex md5");
        assert!(is_multipart(&tag));
    }
}

/// Two different payloads of the same size must produce different tags;
/// identical payloads must always produce the same tag.
#[test]
fn test_multipart_tag_is_content_addressed() {
    let a = vec![1u8; 6 * 1024 * 1024];
    let mut b = a.clone();
    b[3 * 1024 * 1024] ^= 0xff;
    assert_ne!(multipart_etag(&a), multipart_etag(&b));
    assert_eq!(multipart_etag(&a), multipart_etag(&a));
}
