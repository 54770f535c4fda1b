//! Compression codecs for archive payloads.
//!
//! Each codec compresses an in-memory buffer for upload and exposes a
//! streaming reader for restore. Levels are clamped to the algorithm's own
//! range; the identity codec ignores them entirely.

use anyhow::{Context, Result, bail};
use std::io::{Read, Write};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Zstd,
    Lz4,
    Gzip,
    None,
}

impl Compression {
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "zstd" => Ok(Self::Zstd),
            "lz4" => Ok(Self::Lz4),
            "gzip" | "gz" => Ok(Self::Gzip),
            "none" => Ok(Self::None),
            other => bail!("unknown compression '{other}'"),
        }
    }

    /// Codec for a filename extension, e.g. `zst` -> zstd.
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext {
            "zst" => Some(Self::Zstd),
            "lz4" => Some(Self::Lz4),
            "gz" => Some(Self::Gzip),
            _ => None,
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Zstd => ".zst",
            Self::Lz4 => ".lz4",
            Self::Gzip => ".gz",
            Self::None => "",
        }
    }

    pub fn content_type(&self) -> Option<&'static str> {
        match self {
            Self::Zstd => Some("application/zstd"),
            Self::Lz4 => Some("application/x-lz4"),
            Self::Gzip => Some("application/gzip"),
            Self::None => None,
        }
    }

    pub fn default_level(&self) -> i32 {
        match self {
            Self::Zstd => 3,
            Self::Lz4 => 1,
            Self::Gzip => 6,
            Self::None => 0,
        }
    }

    fn clamp_level(&self, level: i32) -> i32 {
        match self {
            Self::Zstd => level.clamp(1, 22),
            Self::Lz4 | Self::Gzip => level.clamp(1, 9),
            Self::None => 0,
        }
    }

    /// Compress `data` at `level`. `workers` is a parallelism hint honoured
    /// by zstd and ignored by the other codecs.
    pub fn compress(&self, data: &[u8], level: Option<i32>, workers: u32) -> Result<Vec<u8>> {
        let level = self.clamp_level(level.unwrap_or_else(|| self.default_level()));
        match self {
            Self::Zstd => {
                let mut encoder = zstd::stream::write::Encoder::new(Vec::new(), level)
                    .context("creating zstd encoder")?;
                if workers > 1 {
                    encoder
                        .multithread(workers)
                        .context("enabling zstd worker threads")?;
                }
                encoder.write_all(data).context("writing to zstd encoder")?;
                encoder.finish().context("finishing zstd stream")
            }
            Self::Lz4 => {
                let mut compressed = Vec::new();
                let mut encoder = lz4::EncoderBuilder::new()
                    .level(level as u32)
                    .build(&mut compressed)
                    .context("allocating lz4 encoder")?;
                encoder.write_all(data).context("writing to lz4 encoder")?;
                let (_writer, res) = encoder.finish();
                res.context("closing lz4 encoder")?;
                Ok(compressed)
            }
            Self::Gzip => {
                let mut encoder = flate2::write::GzEncoder::new(
                    Vec::new(),
                    flate2::Compression::new(level as u32),
                );
                encoder.write_all(data).context("writing to gzip encoder")?;
                encoder.finish().context("finishing gzip stream")
            }
            Self::None => Ok(data.to_vec()),
        }
    }

    /// Wrap a compressed stream in a decompressing reader.
    pub fn reader<'a>(&self, input: Box<dyn Read + 'a>) -> Result<Box<dyn Read + 'a>> {
        match self {
            Self::Zstd => Ok(Box::new(
                zstd::stream::read::Decoder::new(input).context("creating zstd decoder")?,
            )),
            Self::Lz4 => Ok(Box::new(
                lz4::Decoder::new(input).context("allocating lz4 decoder")?,
            )),
            Self::Gzip => Ok(Box::new(flate2::read::GzDecoder::new(input))),
            Self::None => Ok(input),
        }
    }

    /// Decompress a whole buffer.
    pub fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut reader = self.reader(Box::new(data))?;
        let mut out = Vec::new();
        reader
            .read_to_end(&mut out)
            .context("reading decompressed stream")?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CODECS: [Compression; 4] = [
        Compression::Zstd,
        Compression::Lz4,
        Compression::Gzip,
        Compression::None,
    ];

    #[test]
    fn round_trip_all_codecs() {
        let payload: Vec<u8> = (0..200_000u32).flat_map(|i| i.to_le_bytes()).collect();
        for codec in CODECS {
            let compressed = codec.compress(&payload, None, 1).unwrap();
            let restored = codec.decompress(&compressed).unwrap();
            assert_eq!(restored, payload, "{codec:?} did not round trip");
        }
    }

    #[test]
    fn round_trip_empty_input() {
        for codec in CODECS {
            let compressed = codec.compress(&[], None, 1).unwrap();
            let restored = codec.decompress(&compressed).unwrap();
            assert!(restored.is_empty(), "{codec:?} broke on empty input");
        }
    }

    #[test]
    fn identity_returns_input_unchanged() {
        let data = b"plain bytes".to_vec();
        let out = Compression::None.compress(&data, Some(9), 4).unwrap();
        assert_eq!(out, data);
        assert_eq!(Compression::None.extension(), "");
    }

    #[test]
    fn levels_are_clamped() {
        let data = vec![1u8; 4096];
        // Out-of-range levels must not error, only clamp.
        Compression::Zstd.compress(&data, Some(99), 1).unwrap();
        Compression::Gzip.compress(&data, Some(0), 1).unwrap();
        Compression::Lz4.compress(&data, Some(-3), 1).unwrap();
    }

    #[test]
    fn extension_lookup() {
        assert_eq!(Compression::from_extension("zst"), Some(Compression::Zstd));
        assert_eq!(Compression::from_extension("gz"), Some(Compression::Gzip));
        assert_eq!(Compression::from_extension("lz4"), Some(Compression::Lz4));
        assert_eq!(Compression::from_extension("csv"), None);
    }
}
