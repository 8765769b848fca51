//! Page index: the table mapping page number to on-disk location, codec,
//! and content fingerprint.
//!
//! Wire format (big-endian, deliberately divergent from the teacher's
//! little-endian `.6cy` layout — this crate's own structures are frozen
//! big-endian): `u32 page_count` followed by column-major arrays — all
//! compression tags, then all levels, then all encryption flags, then
//! all compressed sizes (`u32` each), then all uncompressed sizes (`u32`
//! each), then all MD5s (`[u8; 16]` each) — exactly `4 + page_count * 27`
//! bytes. Column-major groups like-valued bytes together, which
//! compresses better than interleaving them per entry.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::collections::HashMap;
use std::io::{Cursor, Read, Write};

use crate::codec::CompressionType;
use crate::error::{CookfsError, Result};

pub const ENTRY_LEN: usize = 27;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PgIndexEntry {
    pub compression: CompressionType,
    pub level: u8,
    pub encrypted: bool,
    pub size_compressed: u32,
    pub size_uncompressed: u32,
    pub md5: [u8; 16],
}

/// Dedup key: content is identical only if both uncompressed size and MD5
/// match. Disabled whenever any page in the store is encrypted, since
/// ciphertext for identical plaintext differs per random IV.
pub type DedupKey = (u32, [u8; 16]);

#[derive(Debug, Clone, Default)]
pub struct PgIndex {
    entries: Vec<PgIndexEntry>,
    /// md5+size -> first page index carrying that content, for dedup lookup.
    by_content: HashMap<DedupKey, u32>,
}

impl PgIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> u32 {
        self.entries.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: u32) -> Option<&PgIndexEntry> {
        self.entries.get(index as usize)
    }

    /// Append a new entry, returning its assigned page index. Registers the
    /// entry in the dedup map unless `allow_dedup` is false (the store has
    /// any encrypted page).
    pub fn add(&mut self, entry: PgIndexEntry, allow_dedup: bool) -> u32 {
        let idx = self.entries.len() as u32;
        if allow_dedup {
            self.by_content
                .entry((entry.size_uncompressed, entry.md5))
                .or_insert(idx);
        }
        self.entries.push(entry);
        idx
    }

    /// Find an existing page carrying the given uncompressed content,
    /// for write-time dedup.
    pub fn search_by_md5(&self, size_uncompressed: u32, md5: &[u8; 16]) -> Option<u32> {
        self.by_content.get(&(size_uncompressed, *md5)).copied()
    }

    /// Byte offset within the page store's data region where page `index`'s
    /// compressed bytes begin — the sum of every preceding entry's
    /// compressed size.
    pub fn start_offset(&self, index: u32) -> u64 {
        self.entries[..index as usize]
            .iter()
            .map(|e| e.size_compressed as u64)
            .sum()
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.entries.len() * ENTRY_LEN);
        out.write_u32::<BigEndian>(self.entries.len() as u32).unwrap();
        for e in &self.entries {
            out.write_u8(e.compression.tag()).unwrap();
        }
        for e in &self.entries {
            out.write_u8(e.level).unwrap();
        }
        for e in &self.entries {
            out.write_u8(e.encrypted as u8).unwrap();
        }
        for e in &self.entries {
            out.write_u32::<BigEndian>(e.size_compressed).unwrap();
        }
        for e in &self.entries {
            out.write_u32::<BigEndian>(e.size_uncompressed).unwrap();
        }
        for e in &self.entries {
            out.write_all(&e.md5).unwrap();
        }
        out
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        let err = || CookfsError::CorruptArchive("pgindex: truncated entry".into());
        let mut cur = Cursor::new(data);
        let count = cur
            .read_u32::<BigEndian>()
            .map_err(|_| CookfsError::CorruptArchive("pgindex: truncated header".into()))?;
        let count = count as usize;

        let expected = 4usize + count * ENTRY_LEN;
        if data.len() < expected {
            return Err(CookfsError::CorruptArchive(format!(
                "pgindex: expected {expected} bytes, got {}",
                data.len()
            )));
        }

        let mut compressions = Vec::with_capacity(count);
        for _ in 0..count {
            compressions.push(CompressionType::from_tag(cur.read_u8().map_err(|_| err())?)?);
        }
        let mut levels = Vec::with_capacity(count);
        for _ in 0..count {
            levels.push(cur.read_u8().map_err(|_| err())?);
        }
        let mut encrypted_flags = Vec::with_capacity(count);
        for _ in 0..count {
            encrypted_flags.push(cur.read_u8().map_err(|_| err())? != 0);
        }
        let mut sizes_compressed = Vec::with_capacity(count);
        for _ in 0..count {
            sizes_compressed.push(cur.read_u32::<BigEndian>().map_err(|_| err())?);
        }
        let mut sizes_uncompressed = Vec::with_capacity(count);
        for _ in 0..count {
            sizes_uncompressed.push(cur.read_u32::<BigEndian>().map_err(|_| err())?);
        }
        let mut md5s = Vec::with_capacity(count);
        for _ in 0..count {
            let mut md5 = [0u8; 16];
            cur.read_exact(&mut md5).map_err(|_| err())?;
            md5s.push(md5);
        }

        let any_encrypted = encrypted_flags.iter().any(|&e| e);
        let allow_dedup = !any_encrypted;
        let mut index = PgIndex::new();
        for i in 0..count {
            index.add(
                PgIndexEntry {
                    compression: compressions[i],
                    level: levels[i],
                    encrypted: encrypted_flags[i],
                    size_compressed: sizes_compressed[i],
                    size_uncompressed: sizes_uncompressed[i],
                    md5: md5s[i],
                },
                allow_dedup,
            );
        }
        Ok(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(size: u32, md5: [u8; 16]) -> PgIndexEntry {
        PgIndexEntry {
            compression: CompressionType::Zstd,
            level: 3,
            encrypted: false,
            size_compressed: size / 2 + 1,
            size_uncompressed: size,
            md5,
        }
    }

    #[test]
    fn serialize_roundtrip() {
        let mut idx = PgIndex::new();
        idx.add(entry(100, [1u8; 16]), true);
        idx.add(entry(200, [2u8; 16]), true);

        let bytes = idx.serialize();
        assert_eq!(bytes.len(), 4 + 2 * ENTRY_LEN);

        let back = PgIndex::deserialize(&bytes).unwrap();
        assert_eq!(back.len(), 2);
        assert_eq!(back.get(0).unwrap().size_uncompressed, 100);
        assert_eq!(back.get(1).unwrap().size_uncompressed, 200);
    }

    #[test]
    fn dedup_lookup_finds_matching_content() {
        let mut idx = PgIndex::new();
        let md5 = [9u8; 16];
        idx.add(entry(50, md5), true);
        assert_eq!(idx.search_by_md5(50, &md5), Some(0));
        assert_eq!(idx.search_by_md5(51, &md5), None);
    }

    #[test]
    fn dedup_disabled_when_any_page_encrypted() {
        let mut idx = PgIndex::new();
        let md5 = [3u8; 16];
        let mut e = entry(10, md5);
        e.encrypted = true;
        idx.add(e, false);
        assert_eq!(idx.search_by_md5(10, &md5), None);
    }

    #[test]
    fn start_offset_accumulates_compressed_sizes() {
        let mut idx = PgIndex::new();
        idx.add(entry(100, [1u8; 16]), true); // size_compressed = 51
        idx.add(entry(200, [2u8; 16]), true); // size_compressed = 101
        assert_eq!(idx.start_offset(0), 0);
        assert_eq!(idx.start_offset(1), 51);
        assert_eq!(idx.start_offset(2), 152);
    }

    #[test]
    fn serialize_is_column_major() {
        let mut idx = PgIndex::new();
        idx.add(entry(100, [1u8; 16]), true);
        idx.add(entry(200, [2u8; 16]), true);

        let bytes = idx.serialize();
        // compression tags for both entries sit back-to-back right after
        // the u32 count, not interleaved with each entry's other fields.
        assert_eq!(bytes[4], CompressionType::Zstd.tag());
        assert_eq!(bytes[5], CompressionType::Zstd.tag());
        // levels follow as their own contiguous column.
        assert_eq!(bytes[6], 3);
        assert_eq!(bytes[7], 3);
    }

    #[test]
    fn truncated_data_errors() {
        let mut idx = PgIndex::new();
        idx.add(entry(10, [0u8; 16]), true);
        let mut bytes = idx.serialize();
        bytes.truncate(bytes.len() - 1);
        assert!(PgIndex::deserialize(&bytes).is_err());
    }
}
