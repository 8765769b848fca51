//! Page store: content-addressed, compressed, optionally encrypted block
//! store backing an archive file, with a weighted LRU cache, aside
//! chaining, and pluggable synchronous/asynchronous compression.
//!
//! ```text
//! [ stamp? ][ header-reserved region ]          <- data_initial_offset
//! [ page 0 bytes ][ page 1 bytes ] ...          <- contiguous pages
//! [ pgindex blob ]
//! [ fsindex-len:4 ][ fsindex blob ]
//! [ pgindexLen:4 | pageCount:4 | compressionTag:1 | signature:7 ]  <- trailer
//! ```
//!
//! The trailer's `pgindexLen` locates the pgindex blob by backward seek.
//! The fsindex blob carries its own 4-byte big-endian length prefix
//! immediately before it (distinct from its internal `CFS2.200` marker)
//! so its boundary can likewise be found by backward seek without a
//! second trailer field — the fsindex blob itself, per §4.3, fully
//! determines its own internal extent once its outer length is known.

use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::codec::{self, CompressionType, CustomCodec};
use crate::crypto;
use crate::error::{CookfsError, Result};
use crate::hash;
use crate::page_obj::PageBuf;
use crate::pgindex::{PgIndex, PgIndexEntry};
use std::sync::Arc;

pub const ASIDE_BIT: u32 = 1 << 28;
pub const INDEX_MASK: u32 = 0x0FFF_FFFF;

const SIGNATURE_PLAIN: &[u8; 7] = b"CFS0002";
const SIGNATURE_ENCRYPTED: &[u8; 7] = b"CFS0004";
const TRAILER_LEN: u64 = 16;
const CANARY: &[u8] = b"cookvfs-canary-ok";

/// The data key used to encrypt/decrypt pages. Both key modes end up
/// here: password-only derives this directly, encrypt-key unwraps a
/// stored, password-wrapped random key into this same 32 bytes.
#[derive(Clone, Copy)]
pub struct DataKey(pub [u8; crypto::KEY_LEN]);

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum KeyMode {
    PasswordOnly,
    EncryptKey,
}

#[derive(Clone)]
pub struct PagesOptions {
    pub page_size: usize,
    pub compression: CompressionType,
    pub level: u8,
    pub always_compress: bool,
    pub verify_md5: bool,
    pub cache_size: usize,
    pub cache_max_age: u64,
    pub key_mode: KeyMode,
    pub pbkdf2_iterations: u32,
}

impl Default for PagesOptions {
    fn default() -> Self {
        Self {
            page_size: 64 * 1024,
            compression: CompressionType::Zstd,
            level: 3,
            always_compress: false,
            verify_md5: true,
            cache_size: 8,
            cache_max_age: 4,
            key_mode: KeyMode::PasswordOnly,
            pbkdf2_iterations: 100_000,
        }
    }
}

/// Score penalty applied once a slot's age exceeds `cache_max_age`; large
/// enough to guarantee an aged-out slot never outscores a fresh one.
const AGE_PENALTY: i64 = 1_000_000;

struct CacheSlot {
    buf: PageBuf,
    weight: i64,
    age: u64,
}

#[derive(Default)]
struct Cache {
    slots: HashMap<u32, CacheSlot>,
    capacity: usize,
    max_age: u64,
}

impl Cache {
    fn new(capacity: usize, max_age: u64) -> Self {
        Self { slots: HashMap::new(), capacity, max_age }
    }

    fn touch(&mut self, except: u32) {
        for (idx, slot) in self.slots.iter_mut() {
            if *idx == except {
                slot.age = 0;
            } else {
                slot.age += 1;
            }
        }
    }

    fn get(&mut self, index: u32) -> Option<PageBuf> {
        if let Some(slot) = self.slots.get(&index) {
            let buf = slot.buf.clone();
            self.touch(index);
            Some(buf)
        } else {
            None
        }
    }

    fn score(slot: &CacheSlot, max_age: u64) -> i64 {
        slot.weight - if slot.age > max_age { AGE_PENALTY } else { 0 }
    }

    fn evict_one(&mut self) {
        let max_age = self.max_age;
        let victim = self
            .slots
            .iter()
            .map(|(idx, slot)| (Self::score(slot, max_age), slot.age, *idx))
            .min_by(|a, b| {
                a.0.cmp(&b.0)
                    .then(b.1.cmp(&a.1)) // higher age wins the tie
                    .then(b.2.cmp(&a.2)) // lower index wins the tie
            })
            .map(|(_, _, idx)| idx);
        if let Some(idx) = victim {
            self.slots.remove(&idx);
        }
    }

    fn insert(&mut self, index: u32, buf: PageBuf, weight: i64) {
        if self.capacity == 0 {
            return;
        }
        if !self.slots.contains_key(&index) && self.slots.len() >= self.capacity {
            self.evict_one();
        }
        self.touch(index);
        self.slots.insert(index, CacheSlot { buf, weight, age: 0 });
    }

    fn len(&self) -> usize {
        self.slots.len()
    }
}

/// Caller-driven async compression callback trio (§9 design notes). The
/// store calls `submit` once per payload and `poll` to collect results;
/// without one attached, compression runs inline through `codec::compress`.
pub trait CompressionPipeline: Send {
    fn submit(&mut self, index: u32, bytes: Vec<u8>);
    fn poll(&mut self, block: bool) -> Option<(u32, Vec<u8>)>;
    fn drain(&mut self) -> Vec<(u32, Vec<u8>)>;
}

pub struct Pages<F: Read + Write + Seek> {
    file: F,
    options: PagesOptions,
    pgindex: PgIndex,
    cache: Cache,
    data_initial_offset: u64,
    data_end: u64,
    key: Option<DataKey>,
    custom_codec: Option<Arc<dyn CustomCodec>>,
    pipeline: Option<Box<dyn CompressionPipeline>>,
    fatal: bool,
    aside: Option<Box<Pages<F>>>,
    /// Set from the trailer signature on `open()` when the archive was
    /// closed with an active key, before `unlock_encryption` has run.
    /// `is_encrypted()` consults this since `key` itself is `None` right
    /// after `open()` returns.
    requires_unlock: bool,
}

impl<F: Read + Write + Seek> Pages<F> {
    /// Create a brand-new, empty archive backed by `file`. `stamp`, if
    /// given, is written verbatim before the header-reserved region
    /// (e.g. to let the archive trail a host executable).
    pub fn create(mut file: F, options: PagesOptions, stamp: Option<&[u8]>) -> Result<Self> {
        let mut offset = 0u64;
        if let Some(s) = stamp {
            file.write_all(s)?;
            offset += s.len() as u64;
        }
        file.flush()?;
        let cache = Cache::new(options.cache_size, options.cache_max_age);
        Ok(Self {
            file,
            options,
            pgindex: PgIndex::new(),
            cache,
            data_initial_offset: offset,
            data_end: offset,
            key: None,
            custom_codec: None,
            pipeline: None,
            fatal: false,
            aside: None,
            requires_unlock: false,
        })
    }

    /// Turn on encryption for a freshly created (empty) store. In
    /// `PasswordOnly` mode the password-derived key encrypts pages
    /// directly. In `EncryptKey` mode a fresh random data key is
    /// generated and wrapped by the password-derived key; the returned
    /// bytes (an encrypted blob, `iv || ciphertext`) must be persisted
    /// by the caller (fsindex metadata) so `unlock` can recover the data
    /// key on reopen without re-encrypting every page.
    pub fn init_encryption(&mut self, password: &str, salt: &[u8]) -> Result<Vec<u8>> {
        let password_key = crypto::derive_page_key(password, salt, self.options.pbkdf2_iterations);
        match self.options.key_mode {
            KeyMode::PasswordOnly => {
                self.key = Some(DataKey(password_key));
                Ok(Vec::new())
            }
            KeyMode::EncryptKey => {
                let mut data_key = [0u8; crypto::KEY_LEN];
                crypto::secure_random(&mut data_key)?;
                let wrapped = crypto::encrypt_page(&password_key, &data_key)?;
                self.key = Some(DataKey(data_key));
                Ok(wrapped)
            }
        }
    }

    /// Recover the data key on reopen. `wrapped_data_key` is the blob
    /// `init_encryption` returned, required only in `EncryptKey` mode.
    pub fn unlock_encryption(
        &mut self,
        password: &str,
        salt: &[u8],
        wrapped_data_key: Option<&[u8]>,
    ) -> Result<()> {
        let password_key = crypto::derive_page_key(password, salt, self.options.pbkdf2_iterations);
        match (self.options.key_mode, wrapped_data_key) {
            (KeyMode::PasswordOnly, _) => {
                self.key = Some(DataKey(password_key));
            }
            (KeyMode::EncryptKey, Some(wrapped)) => {
                let unwrapped = crypto::decrypt_page(&password_key, wrapped)?;
                if unwrapped.len() != crypto::KEY_LEN {
                    return Err(CookfsError::EncryptionError("unwrapped data key has the wrong length".into()));
                }
                let mut data_key = [0u8; crypto::KEY_LEN];
                data_key.copy_from_slice(&unwrapped);
                self.key = Some(DataKey(data_key));
            }
            (KeyMode::EncryptKey, None) => {
                return Err(CookfsError::EncryptionError("encrypt-key mode requires a wrapped data key".into()));
            }
        }
        self.requires_unlock = false;
        Ok(())
    }

    /// Re-key in `EncryptKey` mode: wrap the already-active data key
    /// under a new password without touching any page on disk.
    pub fn rewrap_key(&mut self, new_password: &str, salt: &[u8]) -> Result<Vec<u8>> {
        let DataKey(data_key) = self.key.ok_or(CookfsError::EncryptionError("no active key".into()))?;
        let new_password_key = crypto::derive_page_key(new_password, salt, self.options.pbkdf2_iterations);
        crypto::encrypt_page(&new_password_key, &data_key)
    }

    /// Encrypt a fixed canary value under the active key, for the caller
    /// to persist and later check with [`Self::verify_canary`] so a
    /// wrong password fails at open time rather than on first page read.
    pub fn encrypt_canary(&self) -> Result<Vec<u8>> {
        let DataKey(key) = self.key.ok_or(CookfsError::EncryptionError("no active key".into()))?;
        crypto::encrypt_page(&key, CANARY)
    }

    pub fn verify_canary(&self, blob: &[u8]) -> Result<()> {
        let DataKey(key) = self.key.ok_or(CookfsError::EncryptionError("no active key".into()))?;
        let plain = crypto::decrypt_page(&key, blob)?;
        if plain != CANARY {
            return Err(CookfsError::EncryptionError("wrong password".into()));
        }
        Ok(())
    }

    pub fn set_custom_codec(&mut self, codec: Arc<dyn CustomCodec>) {
        self.custom_codec = Some(codec);
    }

    /// Attach a caller-driven compression pipeline. Once set, every page
    /// write (`add_page`, `add_pages_batch`) routes its compression
    /// through `submit`/`poll` instead of calling `codec::compress`
    /// inline.
    pub fn set_pipeline(&mut self, pipeline: Box<dyn CompressionPipeline>) {
        self.pipeline = Some(pipeline);
    }

    pub fn is_fatal(&self) -> bool {
        self.fatal
    }

    pub fn is_encrypted(&self) -> bool {
        self.key.is_some() || self.requires_unlock
    }

    pub fn page_count(&self) -> u32 {
        self.pgindex.len()
    }

    pub fn page_size(&self) -> usize {
        self.options.page_size
    }

    /// Open an existing archive. `end_offset` locates the trailer for a
    /// host-file-embedded archive (e.g. appended to a self-extracting
    /// binary); `None` means "use the file's current length". `stamp_len`
    /// must equal whatever `Some(s)` length was passed to [`Self::create`]
    /// when the archive was written — it isn't recoverable from the
    /// trailer alone, so a caller that created the archive with a stamp
    /// must remember and resupply its length here, or every absolute page
    /// offset this store computes will be off by that many bytes.
    pub fn open(
        mut file: F,
        options: PagesOptions,
        end_offset: Option<u64>,
        stamp_len: Option<u64>,
    ) -> Result<(Self, Vec<u8>)> {
        let file_len = match end_offset {
            Some(e) => e,
            None => file.seek(SeekFrom::End(0))?,
        };
        if file_len < TRAILER_LEN {
            return Err(CookfsError::CorruptArchive("file too small for trailer".into()));
        }

        file.seek(SeekFrom::Start(file_len - TRAILER_LEN))?;
        let mut trailer = [0u8; TRAILER_LEN as usize];
        file.read_exact(&mut trailer)?;

        let pgindex_len = (&trailer[0..4]).read_u32::<BigEndian>().unwrap() as u64;
        let page_count = (&trailer[4..8]).read_u32::<BigEndian>().unwrap();
        let compression_tag = trailer[8];
        let signature: [u8; 7] = trailer[9..16].try_into().unwrap();

        let encrypted = match &signature {
            s if s == SIGNATURE_PLAIN => false,
            s if s == SIGNATURE_ENCRYPTED => true,
            _ => return Err(CookfsError::CorruptArchive("bad signature".into())),
        };
        let _ = compression_tag;

        let trailer_start = file_len - TRAILER_LEN;

        file.seek(SeekFrom::Start(trailer_start - 4))?;
        let mut len_buf = [0u8; 4];
        file.read_exact(&mut len_buf)?;
        let fsindex_len = (&len_buf[..]).read_u32::<BigEndian>().unwrap() as u64;
        let fsindex_start = trailer_start - 4 - fsindex_len;

        if fsindex_start < pgindex_len {
            return Err(CookfsError::CorruptArchive("fsindex/pgindex length mismatch".into()));
        }
        let pgindex_start = fsindex_start - pgindex_len;

        file.seek(SeekFrom::Start(pgindex_start))?;
        let mut pgindex_blob = vec![0u8; pgindex_len as usize];
        file.read_exact(&mut pgindex_blob)?;
        let pgindex = PgIndex::deserialize(&pgindex_blob)?;
        if pgindex.len() != page_count {
            return Err(CookfsError::CorruptArchive("pgindex page count mismatch".into()));
        }

        file.seek(SeekFrom::Start(fsindex_start))?;
        let mut fsindex_blob = vec![0u8; fsindex_len as usize];
        file.read_exact(&mut fsindex_blob)?;

        let mut pages = Self {
            file,
            options,
            pgindex,
            cache: Cache::new(0, 0),
            data_initial_offset: stamp_len.unwrap_or(0),
            data_end: pgindex_start,
            key: None,
            custom_codec: None,
            pipeline: None,
            fatal: false,
            aside: None,
            requires_unlock: encrypted,
        };
        pages.cache = Cache::new(pages.options.cache_size, pages.options.cache_max_age);
        Ok((pages, fsindex_blob))
    }

    pub fn attach_aside(&mut self, aside: Pages<F>) {
        self.aside = Some(Box::new(aside));
    }

    pub fn detach_aside(&mut self) -> Option<Pages<F>> {
        self.aside.take().map(|b| *b)
    }

    pub fn has_aside(&self) -> bool {
        self.aside.is_some()
    }

    pub fn aside_fsindex_is_empty(&self, fsindex_blob_len: usize) -> bool {
        self.aside.is_some() && fsindex_blob_len == 0
    }

    /// Page write pipeline (§4.1). Dedup first, then compress, then
    /// encrypt, then append.
    pub fn add_page(&mut self, data: &[u8], weight: i64) -> Result<u32> {
        if let Some(aside) = self.aside.as_mut() {
            let idx = aside.add_page(data, weight)?;
            return Ok(idx | ASIDE_BIT);
        }
        if self.fatal {
            return Err(CookfsError::FatalState);
        }

        let md5 = hash::md5(data);
        let allow_dedup = self.key.is_none();
        if allow_dedup {
            if let Some(existing) = self.pgindex.search_by_md5(data.len() as u32, &md5) {
                return Ok(existing);
            }
        }

        let result = self.compress_and_store(data, md5, weight);
        if result.is_err() {
            self.fatal = true;
        }
        result
    }

    /// Batched form of [`Pages::add_page`]: compresses every chunk up front
    /// and then appends each one in order under the same lock the
    /// single-page path uses, so pages still land at indices matching the
    /// order callers passed them in regardless of how compression itself
    /// was scheduled. Falls back to the plain per-page path whenever an
    /// aside is attached or the store is already fatal, since both of
    /// those change per-call (delegation, early bail) in ways a batched
    /// compress-then-store split would complicate for no benefit.
    ///
    /// With no pipeline attached, chunks are compressed in parallel via
    /// `codec::compress_many` (Rayon, when the `parallel` feature is
    /// enabled). A caller-attached pipeline takes over compression
    /// entirely instead — every chunk submits to it in turn, same as
    /// `add_page` — since a pipeline already claims ownership of how and
    /// where compression runs.
    pub fn add_pages_batch(&mut self, chunks: &[&[u8]], weight: i64) -> Result<Vec<u32>> {
        if self.aside.is_some() || self.fatal {
            return chunks.iter().map(|data| self.add_page(data, weight)).collect();
        }

        let allow_dedup = self.key.is_none();
        let mut results: Vec<Option<u32>> = vec![None; chunks.len()];
        let mut md5s = Vec::with_capacity(chunks.len());
        let mut pending: Vec<&[u8]> = Vec::new();
        let mut pending_idx = Vec::new();

        for (i, data) in chunks.iter().enumerate() {
            let md5 = hash::md5(data);
            md5s.push(md5);
            if allow_dedup {
                if let Some(existing) = self.pgindex.search_by_md5(data.len() as u32, &md5) {
                    results[i] = Some(existing);
                    continue;
                }
            }
            pending.push(data);
            pending_idx.push(i);
        }

        let compressed = if self.pipeline.is_some() {
            let mut out = Vec::with_capacity(pending.len());
            for data in &pending {
                match self.compress_one(data) {
                    Ok(bytes) => out.push(bytes),
                    Err(e) => {
                        self.fatal = true;
                        return Err(e);
                    }
                }
            }
            out
        } else {
            match codec::compress_many(
                &pending,
                self.options.compression,
                self.options.level,
                self.custom_codec.as_ref(),
            ) {
                Ok(c) => c,
                Err(e) => {
                    self.fatal = true;
                    return Err(e);
                }
            }
        };

        for (slot, &i) in pending_idx.iter().enumerate() {
            match self.store_compressed(chunks[i], md5s[i], &compressed[slot]) {
                Ok(idx) => results[i] = Some(idx),
                Err(e) => {
                    self.fatal = true;
                    return Err(e);
                }
            }
        }

        Ok(results.into_iter().map(|r| r.expect("every chunk either deduped or was stored")).collect())
    }

    fn compress_and_store(&mut self, data: &[u8], md5: [u8; 16], _weight: i64) -> Result<u32> {
        let compressed = self.compress_one(data)?;
        self.store_compressed(data, md5, &compressed)
    }

    /// Compress one payload, through the attached pipeline if any, else
    /// inline via `codec::compress`.
    fn compress_one(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        if let Some(pipeline) = self.pipeline.as_mut() {
            let submission_id = self.pgindex.len();
            pipeline.submit(submission_id, data.to_vec());
            loop {
                if let Some((_, bytes)) = pipeline.poll(true) {
                    return Ok(bytes);
                }
            }
        }
        codec::compress(self.options.compression, data, self.options.level, self.custom_codec.as_ref())
    }

    fn store_compressed(&mut self, data: &[u8], md5: [u8; 16], compressed: &[u8]) -> Result<u32> {
        let (tag, body) = if !self.options.always_compress && compressed.len() >= data.len() {
            (CompressionType::None, data.to_vec())
        } else {
            (self.options.compression, compressed.to_vec())
        };

        let (on_disk, encrypted) = if let Some(DataKey(key)) = &self.key {
            (crypto::encrypt_page(key, &body)?, true)
        } else {
            (body, false)
        };

        self.file.seek(SeekFrom::Start(self.data_end))?;
        self.file.write_all(&[tag.tag()])?;
        self.file.write_all(&on_disk)?;
        let size_compressed = 1 + on_disk.len() as u32;
        self.data_end += size_compressed as u64;

        let entry = PgIndexEntry {
            compression: tag,
            level: self.options.level,
            encrypted,
            size_compressed,
            size_uncompressed: data.len() as u32,
            md5,
        };
        Ok(self.pgindex.add(entry, self.key.is_none()))
    }

    /// Page read pipeline (§4.1).
    pub fn get_page(&mut self, index: u32, weight: i64) -> Result<PageBuf> {
        if index & ASIDE_BIT != 0 {
            let aside = self
                .aside
                .as_mut()
                .ok_or_else(|| CookfsError::CorruptArchive("aside page with no aside attached".into()))?;
            return aside.get_page(index & INDEX_MASK, weight);
        }

        if let Some(buf) = self.cache.get(index) {
            return Ok(buf);
        }

        let entry = self
            .pgindex
            .get(index)
            .ok_or(CookfsError::NotFound)?
            .clone();
        // start_offset sums only compressed bodies; each preceding page also
        // carries a 1-byte tag prefix, so add one byte per prior page.
        let offset = self.data_initial_offset + self.pgindex.start_offset(index) + index as u64;

        self.file.seek(SeekFrom::Start(offset))?;
        let mut raw = vec![0u8; entry.size_compressed as usize];
        self.file.read_exact(&mut raw)?;
        let (tag, body) = (CompressionType::from_tag(raw[0])?, &raw[1..]);

        let decrypted;
        let plain_compressed: &[u8] = if entry.encrypted {
            let DataKey(key) = self.key.ok_or(CookfsError::EncryptionError(
                "page is encrypted but no key is set".into(),
            ))?;
            decrypted = crypto::decrypt_page(&key, body)?;
            &decrypted
        } else {
            body
        };

        let decompressed = codec::decompress(tag, plain_compressed, self.custom_codec.as_ref())?;
        if decompressed.len() != entry.size_uncompressed as usize {
            return Err(CookfsError::CorruptArchive("decompressed size mismatch".into()));
        }
        if self.options.verify_md5 && hash::md5(&decompressed) != entry.md5 {
            return Err(CookfsError::CorruptArchive("md5 mismatch on decompression".into()));
        }

        let buf = PageBuf::new(decompressed);
        self.cache.insert(index, buf.clone(), weight);
        Ok(buf)
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    /// Write the pgindex blob, then the length-prefixed fsindex blob,
    /// then the trailer. Called once at close by the mount orchestrator,
    /// which owns the fsindex and supplies its serialized bytes.
    pub fn finalize(&mut self, fsindex_bytes: &[u8]) -> Result<()> {
        if self.fatal {
            return Err(CookfsError::FatalState);
        }
        if let Some(aside) = self.aside.as_mut() {
            return aside.finalize(fsindex_bytes);
        }

        let pgindex_blob = self.pgindex.serialize();
        self.file.seek(SeekFrom::Start(self.data_end))?;
        self.file.write_all(&pgindex_blob)?;

        self.file.write_u32::<BigEndian>(fsindex_bytes.len() as u32)?;
        self.file.write_all(fsindex_bytes)?;

        let signature = if self.key.is_some() { SIGNATURE_ENCRYPTED } else { SIGNATURE_PLAIN };
        self.file.write_u32::<BigEndian>(pgindex_blob.len() as u32)?;
        self.file.write_u32::<BigEndian>(self.pgindex.len())?;
        self.file.write_u8(self.options.compression.tag())?;
        self.file.write_all(signature)?;
        self.file.flush()?;
        Ok(())
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn cursor_file() -> Cursor<Vec<u8>> {
        Cursor::new(Vec::new())
    }

    /// Minimal pipeline that resolves every submission on the very next
    /// poll, compressing inline itself so the bytes it hands back are
    /// still valid for whatever codec the store is configured with.
    struct CountingPipeline {
        kind: CompressionType,
        level: u8,
        ready: Vec<(u32, Vec<u8>)>,
        submit_calls: std::sync::Arc<std::sync::atomic::AtomicUsize>,
    }

    impl CompressionPipeline for CountingPipeline {
        fn submit(&mut self, index: u32, bytes: Vec<u8>) {
            self.submit_calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            let out = codec::compress(self.kind, &bytes, self.level, None).unwrap_or(bytes);
            self.ready.push((index, out));
        }

        fn poll(&mut self, _block: bool) -> Option<(u32, Vec<u8>)> {
            if self.ready.is_empty() {
                None
            } else {
                Some(self.ready.remove(0))
            }
        }

        fn drain(&mut self) -> Vec<(u32, Vec<u8>)> {
            std::mem::take(&mut self.ready)
        }
    }

    #[test]
    fn attached_pipeline_is_used_for_single_and_batched_writes() {
        let mut opts = PagesOptions::default();
        opts.compression = CompressionType::Zstd;
        let mut pages = Pages::create(cursor_file(), opts, None).unwrap();
        let submit_calls = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        pages.set_pipeline(Box::new(CountingPipeline {
            kind: CompressionType::Zstd,
            level: 3,
            ready: Vec::new(),
            submit_calls: submit_calls.clone(),
        }));

        let idx = pages.add_page(b"routed through the pipeline", 1).unwrap();
        assert_eq!(submit_calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(pages.get_page(idx, 1).unwrap().as_slice(), b"routed through the pipeline");

        let chunks: Vec<&[u8]> = vec![b"batch one", b"batch two"];
        let indices = pages.add_pages_batch(&chunks, 1).unwrap();
        assert_eq!(submit_calls.load(std::sync::atomic::Ordering::SeqCst), 3);
        for (chunk, idx) in chunks.iter().zip(indices) {
            assert_eq!(pages.get_page(idx, 1).unwrap().as_slice(), *chunk);
        }
    }

    #[test]
    fn write_then_read_roundtrip() {
        let mut pages = Pages::create(cursor_file(), PagesOptions::default(), None).unwrap();
        let idx = pages.add_page(b"hello world", 1).unwrap();
        let buf = pages.get_page(idx, 1).unwrap();
        assert_eq!(buf.as_slice(), b"hello world");
    }

    #[test]
    fn reopen_with_stamp_reads_pages_at_correct_offset() {
        let stamp = b"#!/bin/sh\nexit 0\n";
        let mut opts = PagesOptions::default();
        opts.compression = CompressionType::None;
        let mut pages = Pages::create(cursor_file(), opts.clone(), Some(stamp)).unwrap();
        let idx = pages.add_page(b"payload after the stamp", 1).unwrap();
        pages.finalize(b"CFS2.200").unwrap();

        let file = pages.file;
        let (mut reopened, _fsindex_bytes) =
            Pages::open(file, opts, None, Some(stamp.len() as u64)).unwrap();
        let buf = reopened.get_page(idx, 1).unwrap();
        assert_eq!(buf.as_slice(), b"payload after the stamp");
    }

    #[test]
    fn dedup_returns_same_index() {
        let mut pages = Pages::create(cursor_file(), PagesOptions::default(), None).unwrap();
        let a = pages.add_page(b"same content", 1).unwrap();
        let b = pages.add_page(b"same content", 1).unwrap();
        assert_eq!(a, b);
        assert_eq!(pages.page_count(), 1);
    }

    #[test]
    fn distinct_content_gets_distinct_indices() {
        let mut pages = Pages::create(cursor_file(), PagesOptions::default(), None).unwrap();
        let a = pages.add_page(b"content a", 1).unwrap();
        let b = pages.add_page(b"content b", 1).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn add_pages_batch_dedups_and_preserves_order() {
        let mut pages = Pages::create(cursor_file(), PagesOptions::default(), None).unwrap();
        let chunks: Vec<&[u8]> = vec![b"chunk one", b"chunk two", b"chunk one", b"chunk three"];
        let indices = pages.add_pages_batch(&chunks, 1).unwrap();
        assert_eq!(indices.len(), 4);
        assert_eq!(indices[0], indices[2]);
        assert_ne!(indices[0], indices[1]);
        assert_ne!(indices[1], indices[3]);
        assert_eq!(pages.page_count(), 3);
        for (chunk, &idx) in chunks.iter().zip(&indices) {
            let buf = pages.get_page(idx, 1).unwrap();
            assert_eq!(buf.as_slice(), *chunk);
        }
    }

    #[test]
    fn cache_evicts_beyond_capacity() {
        let mut opts = PagesOptions::default();
        opts.cache_size = 2;
        opts.cache_max_age = 100;
        let mut pages = Pages::create(cursor_file(), opts, None).unwrap();
        let a = pages.add_page(b"aaaa", 0).unwrap();
        let b = pages.add_page(b"bbbb", 0).unwrap();
        let c = pages.add_page(b"cccc", 0).unwrap();
        pages.get_page(a, 0).unwrap();
        pages.get_page(b, 0).unwrap();
        assert_eq!(pages.cache_len(), 2);
        pages.get_page(c, 0).unwrap();
        assert_eq!(pages.cache_len(), 2);
    }

    #[test]
    fn encrypted_roundtrip_through_finalize_and_reopen() {
        let mut opts = PagesOptions::default();
        opts.compression = CompressionType::None;
        let mut pages = Pages::create(cursor_file(), opts.clone(), None).unwrap();
        pages.init_encryption("hunter2", b"some-salt").unwrap();
        let idx = pages.add_page(b"top secret payload", 1).unwrap();
        pages.finalize(b"CFS2.200").unwrap();

        let buf = pages.get_page(idx, 1).unwrap();
        assert_eq!(buf.as_slice(), b"top secret payload");
    }

    #[test]
    fn reopen_detects_encryption_before_unlock_and_rejects_wrong_password() {
        let mut opts = PagesOptions::default();
        opts.compression = CompressionType::None;
        let mut pages = Pages::create(cursor_file(), opts.clone(), None).unwrap();
        pages.init_encryption("hunter2", b"some-salt").unwrap();
        let canary = pages.encrypt_canary().unwrap();
        pages.add_page(b"top secret payload", 1).unwrap();
        pages.finalize(b"CFS2.200").unwrap();

        let file = pages.file;
        let (mut reopened, _fsindex_bytes) = Pages::open(file, opts, None, None).unwrap();
        assert!(reopened.is_encrypted());

        let wrong = reopened.unlock_encryption("nope", b"some-salt", None);
        if wrong.is_ok() {
            assert!(reopened.verify_canary(&canary).is_err());
        }

        reopened.unlock_encryption("hunter2", b"some-salt", None).unwrap();
        reopened.verify_canary(&canary).unwrap();
    }

    #[test]
    fn aside_write_is_tagged_and_delegated() {
        let opts = PagesOptions::default();
        let mut primary = Pages::create(cursor_file(), opts.clone(), None).unwrap();
        let aside = Pages::create(cursor_file(), opts, None).unwrap();
        primary.attach_aside(aside);

        let idx = primary.add_page(b"delta", 1).unwrap();
        assert_ne!(idx & ASIDE_BIT, 0);
        assert_eq!(primary.page_count(), 0);

        let buf = primary.get_page(idx, 1).unwrap();
        assert_eq!(buf.as_slice(), b"delta");
    }
}
