//! Compression tag dispatch.
//!
//! Tag byte values are frozen by the wire format (spec §6): 0 none,
//! 1 zlib, 2 bzip2, 3 lzma, 4 zstd, 5 brotli, 254 custom. Unlike the
//! teacher's UUID-keyed codec registry (built for a format that declares
//! codecs up front and refuses to open without every UUID available),
//! pages here carry their tag inline per-page, so dispatch is a plain
//! match — no registry, no "unavailable codec" open-time failure.

use crate::error::{CookfsError, Result};
use std::io::{Read, Write};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionType {
    None,
    Zlib,
    Bz2,
    Lzma,
    Zstd,
    Brotli,
    Custom,
}

impl CompressionType {
    pub fn tag(self) -> u8 {
        match self {
            CompressionType::None => 0,
            CompressionType::Zlib => 1,
            CompressionType::Bz2 => 2,
            CompressionType::Lzma => 3,
            CompressionType::Zstd => 4,
            CompressionType::Brotli => 5,
            CompressionType::Custom => 254,
        }
    }

    pub fn from_tag(tag: u8) -> Result<Self> {
        Ok(match tag {
            0 => CompressionType::None,
            1 => CompressionType::Zlib,
            2 => CompressionType::Bz2,
            3 => CompressionType::Lzma,
            4 => CompressionType::Zstd,
            5 => CompressionType::Brotli,
            254 => CompressionType::Custom,
            other => {
                return Err(CookfsError::CorruptArchive(format!(
                    "unknown compression tag {other}"
                )))
            }
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            CompressionType::None => "none",
            CompressionType::Zlib => "zlib",
            CompressionType::Bz2 => "bzip2",
            CompressionType::Lzma => "lzma",
            CompressionType::Zstd => "zstd",
            CompressionType::Brotli => "brotli",
            CompressionType::Custom => "custom",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "none" => Some(CompressionType::None),
            "zlib" => Some(CompressionType::Zlib),
            "bzip2" | "bz2" => Some(CompressionType::Bz2),
            "lzma" => Some(CompressionType::Lzma),
            "zstd" => Some(CompressionType::Zstd),
            "brotli" => Some(CompressionType::Brotli),
            "custom" => Some(CompressionType::Custom),
            _ => None,
        }
    }
}

/// The "custom user-provided compression callback" collaborator from
/// spec.md §1 — specified here only as the interface the page store
/// consumes; no concrete implementation ships with this crate.
pub trait CustomCodec: Send + Sync {
    fn compress(&self, data: &[u8], level: u8) -> Result<Vec<u8>>;
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>>;
}

pub fn compress(
    kind: CompressionType,
    data: &[u8],
    level: u8,
    custom: Option<&Arc<dyn CustomCodec>>,
) -> Result<Vec<u8>> {
    match kind {
        CompressionType::None => Ok(data.to_vec()),
        CompressionType::Zlib => {
            use flate2::write::ZlibEncoder;
            use flate2::Compression;
            let mut enc = ZlibEncoder::new(Vec::new(), Compression::new(level as u32));
            enc.write_all(data).map_err(|e| CookfsError::CompressionError(e.to_string()))?;
            enc.finish().map_err(|e| CookfsError::CompressionError(e.to_string()))
        }
        CompressionType::Bz2 => {
            use bzip2::write::BzEncoder;
            use bzip2::Compression;
            let mut enc = BzEncoder::new(Vec::new(), Compression::new(level as u32));
            enc.write_all(data).map_err(|e| CookfsError::CompressionError(e.to_string()))?;
            enc.finish().map_err(|e| CookfsError::CompressionError(e.to_string()))
        }
        CompressionType::Lzma => {
            let mut out = Vec::new();
            lzma_rs::lzma_compress(&mut std::io::Cursor::new(data), &mut out)
                .map_err(|e| CookfsError::CompressionError(e.to_string()))?;
            Ok(out)
        }
        CompressionType::Zstd => zstd::encode_all(data, level as i32)
            .map_err(|e| CookfsError::CompressionError(e.to_string())),
        CompressionType::Brotli => {
            let quality = (level as u32).clamp(0, 11);
            let mut out = Vec::new();
            {
                let mut w = brotli::CompressorWriter::new(&mut out, 4096, quality, 22);
                w.write_all(data).map_err(|e| CookfsError::CompressionError(e.to_string()))?;
            }
            Ok(out)
        }
        CompressionType::Custom => {
            let codec = custom.ok_or_else(|| {
                CookfsError::CompressionError("no custom codec registered".into())
            })?;
            codec.compress(data, level)
        }
    }
}

pub fn decompress(
    kind: CompressionType,
    data: &[u8],
    custom: Option<&Arc<dyn CustomCodec>>,
) -> Result<Vec<u8>> {
    match kind {
        CompressionType::None => Ok(data.to_vec()),
        CompressionType::Zlib => {
            use flate2::read::ZlibDecoder;
            let mut out = Vec::new();
            ZlibDecoder::new(data)
                .read_to_end(&mut out)
                .map_err(|e| CookfsError::CompressionError(e.to_string()))?;
            Ok(out)
        }
        CompressionType::Bz2 => {
            use bzip2::read::BzDecoder;
            let mut out = Vec::new();
            BzDecoder::new(data)
                .read_to_end(&mut out)
                .map_err(|e| CookfsError::CompressionError(e.to_string()))?;
            Ok(out)
        }
        CompressionType::Lzma => {
            let mut out = Vec::new();
            lzma_rs::lzma_decompress(&mut std::io::Cursor::new(data), &mut out)
                .map_err(|e| CookfsError::CompressionError(e.to_string()))?;
            Ok(out)
        }
        CompressionType::Zstd => {
            zstd::decode_all(data).map_err(|e| CookfsError::CompressionError(e.to_string()))
        }
        CompressionType::Brotli => {
            let mut out = Vec::new();
            brotli::Decompressor::new(data, 4096)
                .read_to_end(&mut out)
                .map_err(|e| CookfsError::CompressionError(e.to_string()))?;
            Ok(out)
        }
        CompressionType::Custom => {
            let codec = custom.ok_or_else(|| {
                CookfsError::CompressionError("no custom codec registered".into())
            })?;
            codec.decompress(data)
        }
    }
}

/// Compress several independent chunks at once. With the `parallel`
/// feature enabled, dispatches through Rayon's global pool; otherwise
/// falls back to sequential compression. Each chunk is independent (no
/// solid-block sharing), so throughput scales with available cores —
/// callers that need compressed bytes in the original index order still
/// get that, since the result vector preserves input order regardless of
/// completion order.
#[cfg(feature = "parallel")]
pub fn compress_many(
    items: &[&[u8]],
    kind: CompressionType,
    level: u8,
    custom: Option<&Arc<dyn CustomCodec>>,
) -> Result<Vec<Vec<u8>>> {
    use rayon::prelude::*;
    items.par_iter().map(|data| compress(kind, data, level, custom)).collect()
}

#[cfg(not(feature = "parallel"))]
pub fn compress_many(
    items: &[&[u8]],
    kind: CompressionType,
    level: u8,
    custom: Option<&Arc<dyn CustomCodec>>,
) -> Result<Vec<Vec<u8>>> {
    items.iter().map(|data| compress(kind, data, level, custom)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_all_builtin_codecs() {
        let data = b"the quick brown fox jumps over the lazy dog".repeat(20);
        for kind in [
            CompressionType::None,
            CompressionType::Zlib,
            CompressionType::Bz2,
            CompressionType::Lzma,
            CompressionType::Zstd,
            CompressionType::Brotli,
        ] {
            let compressed = compress(kind, &data, 3, None).unwrap();
            let decompressed = decompress(kind, &compressed, None).unwrap();
            assert_eq!(decompressed, data, "codec {:?} roundtrip failed", kind);
        }
    }

    #[test]
    fn tag_roundtrip() {
        for kind in [
            CompressionType::None,
            CompressionType::Zlib,
            CompressionType::Bz2,
            CompressionType::Lzma,
            CompressionType::Zstd,
            CompressionType::Brotli,
            CompressionType::Custom,
        ] {
            assert_eq!(CompressionType::from_tag(kind.tag()).unwrap(), kind);
        }
    }

    #[test]
    fn unknown_tag_errors() {
        assert!(CompressionType::from_tag(200).is_err());
    }

    #[test]
    fn compress_many_preserves_order() {
        let a = b"aaaaaaaaaaaaaaaaaaaa".to_vec();
        let b = b"bbbbbbbbbbbbbbbbbbbbbbbbbbbb".to_vec();
        let c = b"cccccccccccccccccccccc".to_vec();
        let items: Vec<&[u8]> = vec![&a, &b, &c];
        let compressed = compress_many(&items, CompressionType::Zstd, 3, None).unwrap();
        assert_eq!(compressed.len(), 3);
        for (input, output) in items.iter().zip(&compressed) {
            assert_eq!(&decompress(CompressionType::Zstd, output, None).unwrap(), input);
        }
    }
}
