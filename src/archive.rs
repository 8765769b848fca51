//! [`Mount`] — the top-level orchestrator tying the page store, fsindex,
//! small-file writer, and reader/writer channels together into the
//! command surface a caller actually drives (§6).
//!
//! ```no_run
//! use cookvfs::archive::{Mount, MountOptions};
//!
//! let mut mount = Mount::create("out.ckfs", MountOptions::default())?;
//! mount.add_file_bytes("readme.txt", b"Hello, world!")?;
//! mount.close()?;
//!
//! let mut mount = Mount::open("out.ckfs", MountOptions::default())?;
//! let data = mount.read_file("readme.txt")?;
//! assert_eq!(data, b"Hello, world!");
//! # Ok::<(), cookvfs::error::CookfsError>(())
//! ```

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use tracing::{debug, info, instrument, warn};

use crate::channel::{PageSource, ReaderChannel, WriterChannel};
use crate::codec::CompressionType;
use crate::crypto;
use crate::error::{CookfsError, Result};
use crate::fsindex::{Block, FsIndex};
use crate::page_obj::PageBuf;
use crate::pages::{KeyMode, Pages, PagesOptions};
use crate::path::PathObj;
use crate::rwlock::ExclusiveRwLock;
use crate::writer::SmallFileWriter;

#[derive(Debug, Clone)]
pub struct MountOptions {
    pub page_size: usize,
    pub small_file_size: usize,
    pub small_file_buffer: usize,
    pub compression: CompressionType,
    pub level: u8,
    pub always_compress: bool,
    pub verify_md5: bool,
    pub cache_size: usize,
    pub cache_max_age: u64,
    pub pbkdf2_iterations: u32,
    pub password: Option<String>,
    pub key_mode: KeyMode,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            page_size: 64 * 1024,
            small_file_size: 32 * 1024,
            small_file_buffer: 4 * 1024 * 1024,
            compression: CompressionType::Zstd,
            level: 3,
            always_compress: false,
            verify_md5: true,
            cache_size: 8,
            cache_max_age: 4,
            pbkdf2_iterations: 100_000,
            password: None,
            key_mode: KeyMode::PasswordOnly,
        }
    }
}

impl MountOptions {
    fn pages_options(&self) -> PagesOptions {
        PagesOptions {
            page_size: self.page_size,
            compression: self.compression,
            level: self.level,
            always_compress: self.always_compress,
            verify_md5: self.verify_md5,
            cache_size: self.cache_size,
            cache_max_age: self.cache_max_age,
            key_mode: self.key_mode,
            pbkdf2_iterations: self.pbkdf2_iterations,
        }
    }
}

struct PageSourceAdapter<'a> {
    pages: &'a mut Pages<File>,
    fsindex: &'a FsIndex,
}

impl<'a> PageSource for PageSourceAdapter<'a> {
    fn get_page(&mut self, index: u32, weight: i64) -> Result<PageBuf> {
        self.pages.get_page(index, weight)
    }
    fn block_usage(&self, page_index: u32) -> usize {
        self.fsindex.get_block_usage(page_index)
    }
}

/// The writable, single-mount core. Internals are behind an
/// [`ExclusiveRwLock`] per object the way §5 prescribes, but `Mount`
/// itself is driven single-threaded through `&mut self` — the lock
/// exists so a future shared-mount registry (§5, out of scope here)
/// can wrap these objects without re-deriving the synchronization story.
pub struct Mount {
    path: PathBuf,
    writable: bool,
    pages: ExclusiveRwLock<Pages<File>>,
    fsindex: ExclusiveRwLock<FsIndex>,
    writer: SmallFileWriter,
    closed: bool,
}

impl Mount {
    #[instrument(skip(options))]
    pub fn create<P: AsRef<Path>>(path: P, options: MountOptions) -> Result<Self> {
        let path = path.as_ref().to_owned();
        let file = OpenOptions::new().read(true).write(true).create(true).truncate(true).open(&path)?;

        let mut pages = Pages::create(file, options.pages_options(), None)?;
        let mut fsindex = FsIndex::new();
        if let Some(password) = &options.password {
            let mut salt = [0u8; 16];
            crypto::secure_random(&mut salt)?;
            let wrapped_key = pages.init_encryption(password, &salt)?;
            let canary = pages.encrypt_canary()?;
            fsindex.set_metadata("cookfs.salt", salt.to_vec());
            fsindex.set_metadata("cookfs.canary", canary);
            if !wrapped_key.is_empty() {
                fsindex.set_metadata("cookfs.wrappedKey", wrapped_key);
            }
        }

        let allow_dedup = options.password.is_none();
        let writer = SmallFileWriter::new(
            options.small_file_size,
            options.page_size,
            options.small_file_buffer,
            allow_dedup,
        );

        info!(path = %path.display(), "created archive");
        Ok(Self {
            path,
            writable: true,
            pages: ExclusiveRwLock::new(pages),
            fsindex: ExclusiveRwLock::new(fsindex),
            writer,
            closed: false,
        })
    }

    #[instrument(skip(options))]
    pub fn open<P: AsRef<Path>>(path: P, options: MountOptions) -> Result<Self> {
        let path = path.as_ref().to_owned();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;

        let (mut pages, fsindex_bytes) = Pages::open(file, options.pages_options(), None, None)?;

        // The fsindex is never encrypted, so it can always be parsed before
        // any key material exists — that's where the salt, wrapped data key
        // (if any), and canary live.
        let fsindex = if fsindex_bytes.is_empty() {
            FsIndex::new()
        } else {
            FsIndex::deserialize(&fsindex_bytes)?
        };

        if pages.is_encrypted() {
            let password = options
                .password
                .as_deref()
                .ok_or_else(|| CookfsError::EncryptionError("archive requires a password".into()))?;
            let salt = fsindex
                .get_metadata("cookfs.salt")
                .ok_or_else(|| CookfsError::CorruptArchive("missing encryption salt".into()))?;
            let salt: [u8; 16] = salt
                .try_into()
                .map_err(|_| CookfsError::CorruptArchive("malformed encryption salt".into()))?;
            let wrapped_key = fsindex.get_metadata("cookfs.wrappedKey");
            pages.unlock_encryption(password, &salt, wrapped_key)?;

            let canary = fsindex
                .get_metadata("cookfs.canary")
                .ok_or_else(|| CookfsError::CorruptArchive("missing encryption canary".into()))?;
            pages.verify_canary(canary).map_err(|_| {
                CookfsError::EncryptionError("wrong password or corrupt archive".into())
            })?;
        }

        let allow_dedup = !pages.is_encrypted();
        let mut writer = SmallFileWriter::new(
            options.small_file_size,
            options.page_size,
            options.small_file_buffer,
            allow_dedup,
        );
        if allow_dedup {
            Self::seed_dedup_map(&mut writer, &mut pages, &fsindex)?;
        }

        debug!(path = %path.display(), change_count = fsindex.change_count(), "opened archive");
        Ok(Self {
            path,
            writable: true,
            pages: ExclusiveRwLock::new(pages),
            fsindex: ExclusiveRwLock::new(fsindex),
            writer,
            closed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn is_encrypted(&self) -> bool {
        self.pages.read().map(|p| p.is_encrypted()).unwrap_or(false)
    }

    /// Bytes currently buffered in the small-file writer, not yet packed
    /// into a page.
    pub fn pending_buffer_bytes(&self) -> usize {
        self.writer.pending_bytes()
    }

    pub fn page_count(&self) -> Result<u32> {
        Ok(self.pages.read()?.page_count())
    }

    // ── Command surface: add / read / stat / list / unset ──────────────

    #[instrument(skip(self, data))]
    pub fn add_file_bytes(&mut self, path: &str, data: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(CookfsError::ReadOnly);
        }
        let path_obj = PathObj::new(path).map_err(CookfsError::BadPath)?;
        let mtime = Self::now();

        if self.writer.accepts(data.len()) {
            self.add_small_file(path_obj, data.to_vec(), mtime)
        } else {
            self.add_large_file(path_obj, data, mtime)
        }
    }

    fn add_small_file(&mut self, path: PathObj, data: Vec<u8>, mtime: i64) -> Result<()> {
        let mut pages = self.pages.write()?;
        let mut fsindex = self.fsindex.write()?;
        let size = data.len() as u64;

        let load = |page: u32, offset: u32, slice_size: u32| -> std::result::Result<PageBuf, CookfsError> {
            let buf = pages.get_page(page, 0)?;
            if (offset as usize + slice_size as usize) > buf.len() {
                return Err(CookfsError::CorruptArchive("page slice out of range".into()));
            }
            Ok(PageBuf::new(buf.as_slice()[offset as usize..offset as usize + slice_size as usize].to_vec()))
        };
        let block = self.writer.add_file(path.clone(), data, mtime, load).ok_or(CookfsError::FatalState)?;
        fsindex.set(&path, vec![block], size, mtime)?;

        if self.writer.should_purge() {
            Self::purge_writer(&mut self.writer, &mut pages, &mut fsindex)?;
        }
        Ok(())
    }

    fn add_large_file(&mut self, path: PathObj, data: &[u8], mtime: i64) -> Result<()> {
        let mut pages = self.pages.write()?;
        let mut fsindex = self.fsindex.write()?;
        let page_size = pages.page_size();
        let chunks: Vec<&[u8]> = data.chunks(page_size).collect();
        let indices = pages.add_pages_batch(&chunks, 1)?;
        let blocks = chunks
            .iter()
            .zip(indices)
            .map(|(chunk, page)| Block { page: page as i32, offset: 0, size: chunk.len() as i32 })
            .collect();
        fsindex.set(&path, blocks, data.len() as u64, mtime)?;
        Ok(())
    }

    /// Walk a freshly-deserialized fsindex and register every already-purged
    /// single-block file with the small-file writer's dedup map, so a small
    /// file written in an earlier session is still found as a dedup match
    /// (§4.4's dedup is otherwise session-local: `page_map` starts empty on
    /// every `SmallFileWriter::new`).
    fn seed_dedup_map(writer: &mut SmallFileWriter, pages: &mut Pages<File>, fsindex: &FsIndex) -> Result<()> {
        for (page, offset, size) in fsindex.existing_single_block_files() {
            let whole_page = pages.get_page(page, 1)?;
            let start = offset as usize;
            let end = start + size as usize;
            let Some(slice) = whole_page.as_slice().get(start..end) else {
                continue;
            };
            writer.register_existing(size, crate::hash::md5(slice), page, offset, size);
        }
        Ok(())
    }

    fn purge_writer(
        writer: &mut SmallFileWriter,
        pages: &mut Pages<File>,
        fsindex: &mut FsIndex,
    ) -> Result<()> {
        let results = writer.purge(|bytes| pages.add_page(bytes, 1))?;
        for (path, page, offset, size) in results {
            // The entry can be gone by the time a pending slot is purged
            // (e.g. `unset` on a path whose small file wasn't purged yet
            // already drops its pending slot, but a concurrent removal
            // through another route could still race it here) — treat a
            // missing entry as already-deleted rather than fail the purge.
            let mtime = match fsindex.get(&path) {
                Ok(entry) => entry.mtime(),
                Err(CookfsError::NotFound) => continue,
                Err(e) => return Err(e),
            };
            let block = Block { page: page as i32, offset: offset as i32, size: size as i32 };
            fsindex.set(&path, vec![block], size as u64, mtime)?;
        }
        Ok(())
    }

    pub fn read_file(&mut self, path: &str) -> Result<Vec<u8>> {
        let path_obj = PathObj::new(path).map_err(CookfsError::BadPath)?;

        // Lock order follows pages-before-fsindex throughout `Mount`.
        let mut pages = self.pages.write()?;
        let fsindex = self.fsindex.read()?;
        let entry = fsindex.get(&path_obj)?;
        if entry.is_directory() {
            return Err(CookfsError::IsADirectory);
        }
        let blocks = entry.blocks().to_vec();
        let file_size = entry.size();

        let mut source = PageSourceAdapter { pages: &mut pages, fsindex: &fsindex };
        let mut channel = ReaderChannel::open(blocks);
        let mut out = vec![0u8; file_size as usize];
        let mut written = 0;
        while written < out.len() {
            let n = channel.read(&mut out[written..], &mut source)?;
            if n == 0 {
                break;
            }
            written += n;
        }
        out.truncate(written);
        Ok(out)
    }

    /// Read `len` bytes starting at `offset` via a reader channel's seek,
    /// rather than materializing the whole file (§4.5).
    pub fn read_range(&mut self, path: &str, offset: u64, len: usize) -> Result<Vec<u8>> {
        let path_obj = PathObj::new(path).map_err(CookfsError::BadPath)?;

        let mut pages = self.pages.write()?;
        let fsindex = self.fsindex.read()?;
        let entry = fsindex.get(&path_obj)?;
        if entry.is_directory() {
            return Err(CookfsError::IsADirectory);
        }
        let blocks = entry.blocks().to_vec();

        let mut source = PageSourceAdapter { pages: &mut pages, fsindex: &fsindex };
        let mut channel = ReaderChannel::open(blocks);
        channel.seek(offset as i64, std::io::SeekFrom::Start(0))?;
        let mut out = vec![0u8; len];
        let mut written = 0;
        while written < out.len() {
            let n = channel.read(&mut out[written..], &mut source)?;
            if n == 0 {
                break;
            }
            written += n;
        }
        out.truncate(written);
        Ok(out)
    }

    pub fn open_writer_channel(&mut self, path: &str) -> Result<WriterChannel> {
        if !self.writable {
            return Err(CookfsError::ReadOnly);
        }
        let path_obj = PathObj::new(path).map_err(CookfsError::BadPath)?;
        let existing = {
            let fsindex = self.fsindex.read()?;
            match fsindex.get(&path_obj) {
                Ok(entry) if entry.is_directory() => return Err(CookfsError::IsADirectory),
                Ok(_) => true,
                Err(CookfsError::NotFound) => false,
                Err(e) => return Err(e),
            }
        };
        if existing {
            Ok(WriterChannel::open_existing(self.read_file(path)?))
        } else {
            Ok(WriterChannel::new())
        }
    }

    /// Close a writer channel, handing its contents to the small-file
    /// writer under `path` (§4.6: "on close, rewinds, hands its
    /// contents plus the target path to the small-file writer").
    pub fn close_writer_channel(&mut self, path: &str, channel: WriterChannel) -> Result<()> {
        let contents = channel.into_contents();
        self.add_file_bytes(path, &contents)
    }

    pub fn list(&self, path: &str) -> Result<Vec<String>> {
        let path_obj = PathObj::new(path).map_err(CookfsError::BadPath)?;
        let fsindex = self.fsindex.read()?;
        Ok(fsindex.list(&path_obj)?.into_iter().map(String::from).collect())
    }

    pub fn unset(&mut self, path: &str, recursive: bool) -> Result<()> {
        if !self.writable {
            return Err(CookfsError::ReadOnly);
        }
        let path_obj = PathObj::new(path).map_err(CookfsError::BadPath)?;
        let mut fsindex = self.fsindex.write()?;
        // Snapshot any writer-pending slots this path (or its subtree)
        // still references before the entry disappears, so the writer's
        // buffer and this tree don't drift out of sync.
        let mut pending_slots = fsindex.collect_pending_slots(&path_obj)?;
        if recursive {
            fsindex.unset_recursive(&path_obj)?;
        } else {
            fsindex.unset(&path_obj)?;
        }
        // Highest slot first: removing a slot shifts every later slot down
        // by one, so later removals must be computed against the tree as
        // it stands after each prior removal, not the original snapshot.
        pending_slots.sort_unstable_by(|a, b| b.cmp(a));
        for slot in pending_slots {
            self.writer.remove_pending(slot, &mut fsindex)?;
        }
        Ok(())
    }

    pub fn set_directory(&mut self, path: &str) -> Result<()> {
        if !self.writable {
            return Err(CookfsError::ReadOnly);
        }
        let path_obj = PathObj::new(path).map_err(CookfsError::BadPath)?;
        let mut fsindex = self.fsindex.write()?;
        fsindex.set_directory(&path_obj, Self::now())
    }

    pub fn set_metadata(&mut self, key: &str, value: &[u8]) -> Result<()> {
        let mut fsindex = self.fsindex.write()?;
        fsindex.set_metadata(key, value.to_vec());
        Ok(())
    }

    pub fn get_metadata(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let fsindex = self.fsindex.read()?;
        Ok(fsindex.get_metadata(key).map(|v| v.to_vec()))
    }

    pub fn select_fileset(&mut self, name: &str) -> Result<()> {
        if !self.writable {
            return Err(CookfsError::ReadOnly);
        }
        let mut fsindex = self.fsindex.write()?;
        fsindex.select_fileset(name);
        Ok(())
    }

    pub fn list_filesets(&self) -> Result<Vec<String>> {
        let fsindex = self.fsindex.read()?;
        Ok(fsindex.list_filesets().into_iter().map(String::from).collect())
    }

    /// Attach an aside overlay (§4.1, §4.3). Lock order follows §5:
    /// page store, then fsindex (the writer has no standing lock of its
    /// own here since `Mount` is single-threaded).
    #[instrument(skip(self, options))]
    pub fn attach_aside<P: AsRef<Path>>(&mut self, aside_path: P, options: MountOptions) -> Result<()> {
        let aside_path = aside_path.as_ref();
        let file = OpenOptions::new().read(true).write(true).create(true).open(aside_path)?;

        let mut pages = self.pages.write()?;
        let mut fsindex = self.fsindex.write()?;

        let file_len = file.metadata().map(|m| m.len()).unwrap_or(0);
        let (aside_pages, aside_fsindex_bytes) = if file_len >= 16 {
            Pages::open(file, options.pages_options(), None, None)?
        } else {
            (Pages::create(file, options.pages_options(), None)?, Vec::new())
        };

        if aside_fsindex_bytes.is_empty() {
            // aside starts empty: copy the primary's current state so the
            // overlay begins from the archive as it stands today.
            let primary_bytes = fsindex.serialize();
            *fsindex = FsIndex::deserialize(&primary_bytes)?;
        }

        pages.attach_aside(aside_pages);
        Ok(())
    }

    /// Detach the aside overlay (§9 ambiguity b: a pending small-file
    /// buffer destined for the aside is purged into real pages first
    /// rather than discarded, since those writes already returned success
    /// to the caller).
    pub fn detach_aside(&mut self) -> Result<()> {
        let mut pages = self.pages.write()?;
        let mut fsindex = self.fsindex.write()?;
        if self.writer.pending_count() > 0 {
            Self::purge_writer(&mut self.writer, &mut pages, &mut fsindex)?;
        }
        pages.detach_aside();
        Ok(())
    }

    pub fn has_aside(&self) -> bool {
        self.pages.read().map(|p| p.has_aside()).unwrap_or(false)
    }

    /// Flush pending small files and, if anything changed, rewrite the
    /// index (§7: "if changes accumulated... the index is serialized
    /// and written; failure here turns into a close-time error").
    #[instrument(skip(self))]
    pub fn close(mut self) -> Result<()> {
        self.flush()?;
        self.closed = true;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        let mut pages = self.pages.write()?;
        let mut fsindex = self.fsindex.write()?;
        if self.writer.pending_count() > 0 {
            Self::purge_writer(&mut self.writer, &mut pages, &mut fsindex)?;
        }
        if fsindex.change_count() == 0 {
            debug!("no changes since open, skipping index rewrite");
            return Ok(());
        }
        let fsindex_bytes = fsindex.serialize();
        pages.finalize(&fsindex_bytes)
    }

    fn now() -> i64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0)
    }
}

impl Drop for Mount {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Err(e) = self.flush() {
            warn!(error = %e, "error flushing archive on drop; changes may be lost");
        }
    }
}
