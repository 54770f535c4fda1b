//! Content hashing compatible with S3 ETags.
//!
//! Single-part uploads carry the plain MD5 of the body as their ETag.
//! Multipart uploads carry `md5(concat(md5(part_i)))-{parts}` with 5 MiB
//! parts, which this module reproduces so a local buffer can be compared
//! byte-for-byte against what the object store reports.

/// Part size used for multipart uploads and tag reproduction.
pub const PART_SIZE: usize = 5 * 1024 * 1024;

/// Bodies above this size are uploaded in parts.
pub const MULTIPART_THRESHOLD: usize = 100 * 1024 * 1024;

/// Hex MD5 over the whole buffer.
pub fn content_md5(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}

/// Reproduce the ETag the object store would assign to `data`.
///
/// At most one part: the plain content hash, no suffix. Otherwise each
/// 5 MiB part is hashed, the digests are concatenated and hashed again, and
/// the part count is appended after a hyphen.
pub fn multipart_etag(data: &[u8]) -> String {
    if data.len() <= PART_SIZE {
        return content_md5(data);
    }
    let mut digests = Vec::with_capacity(data.len().div_ceil(PART_SIZE) * 16);
    let mut parts = 0usize;
    for chunk in data.chunks(PART_SIZE) {
        digests.extend_from_slice(&md5::compute(chunk).0);
        parts += 1;
    }
    format!("{:x}-{parts}", md5::compute(&digests))
}

/// True when an ETag reported by the store came from a multipart upload.
pub fn is_multipart(etag: &str) -> bool {
    etag.contains('-')
}

/// Strip the surrounding quotes S3 puts on ETag header values.
pub fn normalize(etag: &str) -> String {
    etag.trim_matches('"').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_payload_tag_equals_content_hash() {
        let data = vec![7u8; 1024];
        assert_eq!(multipart_etag(&data), content_md5(&data));
        assert!(!is_multipart(&multipart_etag(&data)));
    }

    #[test]
    fn exactly_one_part_has_no_suffix() {
        let data = vec![0u8; PART_SIZE];
        assert_eq!(multipart_etag(&data), content_md5(&data));
    }

    #[test]
    fn part_count_matches_ceiling_division() {
        // 12 MiB compresses to three 5 MiB parts (5 + 5 + 2)
        let data = vec![3u8; 12 * 1024 * 1024];
        let tag = multipart_etag(&data);
        assert!(tag.ends_with("-3"), "unexpected tag {tag}");
        assert!(is_multipart(&tag));

        let exact = vec![0u8; 2 * PART_SIZE];
        assert!(multipart_etag(&exact).ends_with("-2"));
    }

    #[test]
    fn tag_is_deterministic() {
        let data = vec![9u8; 6 * 1024 * 1024];
        assert_eq!(multipart_etag(&data), multipart_etag(&data));
    }

    #[test]
    fn normalize_strips_quotes() {
        assert_eq!(normalize("\"abc123\""), "abc123");
        assert_eq!(normalize("abc123-2"), "abc123-2");
    }
}
