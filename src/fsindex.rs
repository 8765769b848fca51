//! Filesystem index: the hierarchical directory tree, per-entry block
//! maps, metadata map, and filesets.
//!
//! A directory's children start in a fixed 8-slot table (mirroring the
//! original implementation's `COOKFS_FSINDEX_TABLE_MAXENTRIES`) and are
//! promoted to a hash map on first overflow past that count. A file
//! entry's on-disk block count of `-1` marks a directory during
//! serialization — there is no separate tag byte, matching the
//! `COOKFS_NUMBLOCKS_DIRECTORY` sentinel this format was distilled from.

use std::collections::HashMap;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read, Write};

use crate::error::{CookfsError, Result};
use crate::path::PathObj;

const DIRECTORY_SENTINEL: i32 = -1;
const FSINDEX_MARKER: &[u8; 8] = b"CFS2.200";
const FIXED_TABLE_SLOTS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    pub page: i32,
    pub offset: i32,
    pub size: i32,
}

#[derive(Debug, Clone)]
pub enum ChildContainer {
    Fixed(Vec<(String, FsEntry)>),
    Hash(HashMap<String, FsEntry>),
}

impl ChildContainer {
    fn new() -> Self {
        ChildContainer::Fixed(Vec::new())
    }

    fn len(&self) -> usize {
        match self {
            ChildContainer::Fixed(v) => v.len(),
            ChildContainer::Hash(m) => m.len(),
        }
    }

    fn get(&self, name: &str) -> Option<&FsEntry> {
        match self {
            ChildContainer::Fixed(v) => v.iter().find(|(n, _)| n == name).map(|(_, e)| e),
            ChildContainer::Hash(m) => m.get(name),
        }
    }

    fn get_mut(&mut self, name: &str) -> Option<&mut FsEntry> {
        match self {
            ChildContainer::Fixed(v) => v.iter_mut().find(|(n, _)| n == name).map(|(_, e)| e),
            ChildContainer::Hash(m) => m.get_mut(name),
        }
    }

    fn insert(&mut self, name: String, entry: FsEntry) {
        match self {
            ChildContainer::Fixed(v) => {
                if let Some(slot) = v.iter_mut().find(|(n, _)| *n == name) {
                    slot.1 = entry;
                    return;
                }
                if v.len() < FIXED_TABLE_SLOTS {
                    v.push((name, entry));
                } else {
                    let mut map: HashMap<String, FsEntry> = v.drain(..).collect();
                    map.insert(name, entry);
                    *self = ChildContainer::Hash(map);
                }
            }
            ChildContainer::Hash(m) => {
                m.insert(name, entry);
            }
        }
    }

    fn remove(&mut self, name: &str) -> Option<FsEntry> {
        match self {
            ChildContainer::Fixed(v) => {
                let pos = v.iter().position(|(n, _)| n == name)?;
                Some(v.remove(pos).1)
            }
            ChildContainer::Hash(m) => m.remove(name),
        }
    }

    fn iter(&self) -> Box<dyn Iterator<Item = (&String, &FsEntry)> + '_> {
        match self {
            ChildContainer::Fixed(v) => Box::new(v.iter().map(|(n, e)| (n, e))),
            ChildContainer::Hash(m) => Box::new(m.iter()),
        }
    }

    fn iter_mut(&mut self) -> Box<dyn Iterator<Item = (&String, &mut FsEntry)> + '_> {
        match self {
            ChildContainer::Fixed(v) => Box::new(v.iter_mut().map(|(n, e)| (&*n, e))),
            ChildContainer::Hash(m) => Box::new(m.iter_mut()),
        }
    }
}

#[derive(Debug, Clone)]
pub enum FsEntry {
    File { size: u64, mtime: i64, blocks: Vec<Block> },
    Directory { children: ChildContainer, mtime: i64 },
}

impl FsEntry {
    pub fn new_directory(mtime: i64) -> Self {
        FsEntry::Directory { children: ChildContainer::new(), mtime }
    }

    pub fn is_directory(&self) -> bool {
        matches!(self, FsEntry::Directory { .. })
    }

    pub fn mtime(&self) -> i64 {
        match self {
            FsEntry::File { mtime, .. } => *mtime,
            FsEntry::Directory { mtime, .. } => *mtime,
        }
    }

    pub fn size(&self) -> u64 {
        match self {
            FsEntry::File { size, .. } => *size,
            FsEntry::Directory { .. } => 0,
        }
    }

    pub fn blocks(&self) -> &[Block] {
        match self {
            FsEntry::File { blocks, .. } => blocks,
            FsEntry::Directory { .. } => &[],
        }
    }

    fn child_count(&self) -> usize {
        match self {
            FsEntry::Directory { children, .. } => children.len(),
            FsEntry::File { .. } => 0,
        }
    }
}

/// One named root snapshot. The fsindex may hold several; exactly one
/// is active at a time (§4.3 filesets).
struct Fileset {
    root: FsEntry,
}

pub struct FsIndex {
    filesets: HashMap<String, Fileset>,
    active_fileset: String,
    metadata: HashMap<String, Vec<u8>>,
    change_count: u64,
}

const DEFAULT_FILESET: &str = "";

impl FsIndex {
    pub fn new() -> Self {
        let mut filesets = HashMap::new();
        filesets.insert(DEFAULT_FILESET.to_string(), Fileset { root: FsEntry::new_directory(0) });
        Self {
            filesets,
            active_fileset: DEFAULT_FILESET.to_string(),
            metadata: HashMap::new(),
            change_count: 0,
        }
    }

    fn root(&self) -> &FsEntry {
        &self.filesets.get(&self.active_fileset).expect("active fileset always present").root
    }

    fn root_mut(&mut self) -> &mut FsEntry {
        &mut self.filesets.get_mut(&self.active_fileset).expect("active fileset always present").root
    }

    pub fn incr_change_count(&mut self, n: u64) -> u64 {
        self.change_count += n;
        self.change_count
    }

    pub fn change_count(&self) -> u64 {
        self.change_count
    }

    pub fn set_metadata(&mut self, key: &str, value: Vec<u8>) {
        self.metadata.insert(key.to_string(), value);
        self.incr_change_count(1);
    }

    pub fn get_metadata(&self, key: &str) -> Option<&[u8]> {
        self.metadata.get(key).map(|v| v.as_slice())
    }

    pub fn list_filesets(&self) -> Vec<&str> {
        self.filesets.keys().map(|s| s.as_str()).collect()
    }

    pub fn active_fileset(&self) -> &str {
        &self.active_fileset
    }

    /// Create (or switch to) a named fileset and make it active.
    pub fn select_fileset(&mut self, name: &str) {
        self.filesets
            .entry(name.to_string())
            .or_insert_with(|| Fileset { root: FsEntry::new_directory(0) });
        self.active_fileset = name.to_string();
        // set_metadata already bumps the change counter.
        self.set_metadata("cookfs.activeFileset", name.as_bytes().to_vec());
    }

    pub fn get(&self, path: &PathObj) -> Result<&FsEntry> {
        let mut current = self.root();
        for element in path.elements() {
            match current {
                FsEntry::Directory { children, .. } => {
                    current = children.get(element).ok_or(CookfsError::NotFound)?;
                }
                FsEntry::File { .. } => return Err(CookfsError::NotADirectory),
            }
        }
        Ok(current)
    }

    fn walk_parent_mut(&mut self, path: &PathObj) -> Result<&mut FsEntry> {
        let elements = path.elements();
        let parent_elements = &elements[..elements.len().saturating_sub(1)];
        let mut current = self.root_mut();
        for element in parent_elements {
            match current {
                FsEntry::Directory { children, .. } => {
                    current = children.get_mut(element).ok_or(CookfsError::NotFound)?;
                }
                FsEntry::File { .. } => return Err(CookfsError::NotADirectory),
            }
        }
        if !current.is_directory() {
            return Err(CookfsError::NotADirectory);
        }
        Ok(current)
    }

    /// Create or replace a file entry. Replacing an existing directory
    /// with a file — or vice versa — is rejected outright; this
    /// implementation never silently merges the two. (§9 design note:
    /// an ambiguity deliberately preserved rather than guessed at.)
    pub fn set(&mut self, path: &PathObj, blocks: Vec<Block>, size: u64, mtime: i64) -> Result<()> {
        if path.is_root() {
            return Err(CookfsError::IsADirectory);
        }
        let name = path.tail().unwrap().to_string();
        let parent = self.walk_parent_mut(path)?;
        let FsEntry::Directory { children, .. } = parent else {
            return Err(CookfsError::NotADirectory);
        };
        if let Some(existing) = children.get(&name) {
            if existing.is_directory() {
                return Err(CookfsError::IsADirectory);
            }
        }
        children.insert(name, FsEntry::File { size, mtime, blocks });
        self.incr_change_count(1);
        Ok(())
    }

    /// Idempotent directory creation of the final path component.
    pub fn set_directory(&mut self, path: &PathObj, mtime: i64) -> Result<()> {
        if path.is_root() {
            return Ok(());
        }
        let name = path.tail().unwrap().to_string();
        let parent = self.walk_parent_mut(path)?;
        let FsEntry::Directory { children, .. } = parent else {
            return Err(CookfsError::NotADirectory);
        };
        match children.get(&name) {
            Some(e) if e.is_directory() => {}
            Some(_) => return Err(CookfsError::Exists),
            None => {
                children.insert(name, FsEntry::new_directory(mtime));
                self.incr_change_count(1);
            }
        }
        Ok(())
    }

    pub fn unset(&mut self, path: &PathObj) -> Result<()> {
        if path.is_root() {
            return Err(CookfsError::InvalidArgument("cannot remove root".into()));
        }
        let name = path.tail().unwrap().to_string();
        let parent = self.walk_parent_mut(path)?;
        let FsEntry::Directory { children, .. } = parent else {
            return Err(CookfsError::NotADirectory);
        };
        if let Some(FsEntry::Directory { children: grandchildren, .. }) = children.get(&name) {
            if grandchildren.len() > 0 {
                return Err(CookfsError::NotEmpty);
            }
        }
        children.remove(&name).ok_or(CookfsError::NotFound)?;
        self.incr_change_count(1);
        Ok(())
    }

    pub fn unset_recursive(&mut self, path: &PathObj) -> Result<()> {
        if path.is_root() {
            return Err(CookfsError::InvalidArgument("cannot remove root".into()));
        }
        let name = path.tail().unwrap().to_string();
        let parent = self.walk_parent_mut(path)?;
        let FsEntry::Directory { children, .. } = parent else {
            return Err(CookfsError::NotADirectory);
        };
        children.remove(&name).ok_or(CookfsError::NotFound)?;
        self.incr_change_count(1);
        Ok(())
    }

    pub fn list(&self, path: &PathObj) -> Result<Vec<&str>> {
        match self.get(path)? {
            FsEntry::Directory { children, .. } => {
                Ok(children.iter().map(|(n, _)| n.as_str()).collect())
            }
            FsEntry::File { .. } => Err(CookfsError::NotADirectory),
        }
    }

    /// Number of file entries whose blocks reference `page_index` — used
    /// by channel code to pick a cache weight (shared pages get weight 1).
    pub fn get_block_usage(&self, page_index: u32) -> usize {
        fn walk(entry: &FsEntry, page_index: u32, count: &mut usize) {
            match entry {
                FsEntry::File { blocks, .. } => {
                    if blocks.iter().any(|b| b.page >= 0 && b.page as u32 == page_index) {
                        *count += 1;
                    }
                }
                FsEntry::Directory { children, .. } => {
                    for (_, child) in children.iter() {
                        walk(child, page_index, count);
                    }
                }
            }
        }
        let mut count = 0;
        walk(self.root(), page_index, &mut count);
        count
    }

    /// Every already-purged single-block file's `(page, offset, size)`, for
    /// seeding the small-file writer's dedup map on open so content written
    /// in an earlier session is still found as a dedup candidate. Files
    /// packed by multiple blocks or still pending are skipped: there is
    /// nothing for a new small file to dedup-match in a chunked run, and a
    /// pending block has no page yet.
    pub fn existing_single_block_files(&self) -> Vec<(u32, u32, u32)> {
        fn walk(entry: &FsEntry, out: &mut Vec<(u32, u32, u32)>) {
            match entry {
                FsEntry::File { blocks, .. } => {
                    if let [b] = blocks.as_slice() {
                        if b.page >= 0 {
                            out.push((b.page as u32, b.offset as u32, b.size as u32));
                        }
                    }
                }
                FsEntry::Directory { children, .. } => {
                    for (_, child) in children.iter() {
                        walk(child, out);
                    }
                }
            }
        }
        let mut out = Vec::new();
        walk(self.root(), &mut out);
        out
    }

    /// Pending-writer slot indices (the `-slot - 1` encoding a file's
    /// blocks use while still buffered by the small-file writer) referenced
    /// anywhere under `path` — itself if a file, every descendant if a
    /// directory. Used to keep the writer's pending buffer and this tree in
    /// sync when a path is removed before it was purged.
    pub fn collect_pending_slots(&self, path: &PathObj) -> Result<Vec<usize>> {
        let entry = self.get(path)?;
        let mut slots = Vec::new();
        Self::collect_pending_slots_entry(entry, &mut slots);
        Ok(slots)
    }

    fn collect_pending_slots_entry(entry: &FsEntry, out: &mut Vec<usize>) {
        match entry {
            FsEntry::File { blocks, .. } => {
                for b in blocks {
                    if b.page < 0 {
                        out.push((-b.page - 1) as usize);
                    }
                }
            }
            FsEntry::Directory { children, .. } => {
                for (_, child) in children.iter() {
                    Self::collect_pending_slots_entry(child, out);
                }
            }
        }
    }

    /// Applies `f` to the slot index of every pending block (`page < 0`)
    /// still in the tree. Used by the small-file writer to shift down the
    /// references of slots that moved after an earlier slot was removed.
    pub fn rewrite_pending_blocks(&mut self, f: impl FnMut(usize) -> usize) {
        let mut f = f;
        fn walk(entry: &mut FsEntry, f: &mut impl FnMut(usize) -> usize) {
            match entry {
                FsEntry::File { blocks, .. } => {
                    for b in blocks {
                        if b.page < 0 {
                            let slot = (-b.page - 1) as usize;
                            b.page = -(f(slot) as i32) - 1;
                        }
                    }
                }
                FsEntry::Directory { children, .. } => {
                    for (_, child) in children.iter_mut() {
                        walk(child, f);
                    }
                }
            }
        }
        walk(self.root_mut(), &mut f);
    }

    // ── Serialization ──────────────────────────────────────────────────

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(FSINDEX_MARKER);
        Self::serialize_entry(self.root(), &mut out);
        Self::serialize_metadata(&self.metadata, &mut out);
        out
    }

    fn serialize_entry(entry: &FsEntry, out: &mut Vec<u8>) {
        match entry {
            FsEntry::Directory { children, .. } => {
                out.write_u32::<BigEndian>(children.len() as u32).unwrap();
                for (name, child) in children.iter() {
                    Self::write_child_header(name, child, out);
                    if child.is_directory() {
                        Self::serialize_entry(child, out);
                    } else {
                        for b in child.blocks() {
                            out.write_i32::<BigEndian>(b.page).unwrap();
                            out.write_i32::<BigEndian>(b.offset).unwrap();
                            out.write_i32::<BigEndian>(b.size).unwrap();
                        }
                    }
                }
            }
            FsEntry::File { .. } => unreachable!("serialize_entry called on a bare file"),
        }
    }

    fn write_child_header(name: &str, child: &FsEntry, out: &mut Vec<u8>) {
        let name_bytes = name.as_bytes();
        out.write_u8(name_bytes.len() as u8).unwrap();
        out.extend_from_slice(name_bytes);
        out.write_u8(0).unwrap();
        out.write_i64::<BigEndian>(child.mtime()).unwrap();
        let block_count = if child.is_directory() {
            DIRECTORY_SENTINEL
        } else {
            child.blocks().len() as i32
        };
        out.write_i32::<BigEndian>(block_count).unwrap();
    }

    fn serialize_metadata(metadata: &HashMap<String, Vec<u8>>, out: &mut Vec<u8>) {
        out.write_u32::<BigEndian>(metadata.len() as u32).unwrap();
        for (key, value) in metadata {
            let key_bytes = key.as_bytes();
            out.write_u16::<BigEndian>(key_bytes.len() as u16).unwrap();
            out.extend_from_slice(key_bytes);
            out.write_u32::<BigEndian>(value.len() as u32).unwrap();
            out.extend_from_slice(value);
        }
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        if data.len() < 8 || &data[..8] != FSINDEX_MARKER {
            return Err(CookfsError::CorruptArchive("bad fsindex marker".into()));
        }
        let mut cur = Cursor::new(&data[8..]);
        let root = Self::deserialize_directory(&mut cur)?;
        let metadata = Self::deserialize_metadata(&mut cur)?;

        let mut index = FsIndex::new();
        index.filesets.get_mut(DEFAULT_FILESET).unwrap().root = root;
        index.metadata = metadata;
        if let Some(name) = index.get_metadata("cookfs.activeFileset") {
            let name = String::from_utf8_lossy(name).to_string();
            if name != DEFAULT_FILESET {
                index.filesets.insert(name.clone(), Fileset { root: FsEntry::new_directory(0) });
                let root = index.filesets.remove(DEFAULT_FILESET).unwrap();
                index.filesets.insert(name.clone(), root);
                index.active_fileset = name;
            }
        }
        Ok(index)
    }

    fn deserialize_directory(cur: &mut Cursor<&[u8]>) -> Result<FsEntry> {
        let child_count = cur
            .read_u32::<BigEndian>()
            .map_err(|_| CookfsError::CorruptArchive("fsindex: truncated directory".into()))?;
        let mut children = ChildContainer::new();
        for _ in 0..child_count {
            let name_len = cur
                .read_u8()
                .map_err(|_| CookfsError::CorruptArchive("fsindex: truncated name".into()))?;
            let mut name_buf = vec![0u8; name_len as usize];
            cur.read_exact(&mut name_buf)
                .map_err(|_| CookfsError::CorruptArchive("fsindex: truncated name".into()))?;
            let mut nul = [0u8; 1];
            cur.read_exact(&mut nul)
                .map_err(|_| CookfsError::CorruptArchive("fsindex: missing name terminator".into()))?;
            let name = String::from_utf8(name_buf)
                .map_err(|_| CookfsError::CorruptArchive("fsindex: non-UTF8 name".into()))?;
            let mtime = cur
                .read_i64::<BigEndian>()
                .map_err(|_| CookfsError::CorruptArchive("fsindex: truncated mtime".into()))?;
            let block_count = cur
                .read_i32::<BigEndian>()
                .map_err(|_| CookfsError::CorruptArchive("fsindex: truncated block count".into()))?;

            let entry = if block_count == DIRECTORY_SENTINEL {
                let mut dir = Self::deserialize_directory(cur)?;
                if let FsEntry::Directory { mtime: m, .. } = &mut dir {
                    *m = mtime;
                }
                dir
            } else {
                let mut blocks = Vec::with_capacity(block_count.max(0) as usize);
                let mut size = 0u64;
                for _ in 0..block_count {
                    let page = cur.read_i32::<BigEndian>().map_err(|_| {
                        CookfsError::CorruptArchive("fsindex: truncated block".into())
                    })?;
                    let offset = cur.read_i32::<BigEndian>().map_err(|_| {
                        CookfsError::CorruptArchive("fsindex: truncated block".into())
                    })?;
                    let block_size = cur.read_i32::<BigEndian>().map_err(|_| {
                        CookfsError::CorruptArchive("fsindex: truncated block".into())
                    })?;
                    size += block_size.max(0) as u64;
                    blocks.push(Block { page, offset, size: block_size });
                }
                FsEntry::File { size, mtime, blocks }
            };
            children.insert(name, entry);
        }
        Ok(FsEntry::Directory { children, mtime: 0 })
    }

    fn deserialize_metadata(cur: &mut Cursor<&[u8]>) -> Result<HashMap<String, Vec<u8>>> {
        let count = cur
            .read_u32::<BigEndian>()
            .map_err(|_| CookfsError::CorruptArchive("fsindex: truncated metadata header".into()))?;
        let mut map = HashMap::new();
        for _ in 0..count {
            let key_len = cur
                .read_u16::<BigEndian>()
                .map_err(|_| CookfsError::CorruptArchive("fsindex: truncated metadata key".into()))?;
            let mut key_buf = vec![0u8; key_len as usize];
            cur.read_exact(&mut key_buf)
                .map_err(|_| CookfsError::CorruptArchive("fsindex: truncated metadata key".into()))?;
            let key = String::from_utf8(key_buf)
                .map_err(|_| CookfsError::CorruptArchive("fsindex: non-UTF8 metadata key".into()))?;
            let value_len = cur
                .read_u32::<BigEndian>()
                .map_err(|_| CookfsError::CorruptArchive("fsindex: truncated metadata value".into()))?;
            let mut value = vec![0u8; value_len as usize];
            cur.read_exact(&mut value)
                .map_err(|_| CookfsError::CorruptArchive("fsindex: truncated metadata value".into()))?;
            map.insert(key, value);
        }
        Ok(map)
    }
}

impl Default for FsIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(s: &str) -> PathObj {
        PathObj::new(s).unwrap()
    }

    #[test]
    fn set_and_get_roundtrip() {
        let mut idx = FsIndex::new();
        idx.set(&path("a.txt"), vec![Block { page: 0, offset: 0, size: 10 }], 10, 100).unwrap();
        let entry = idx.get(&path("a.txt")).unwrap();
        assert_eq!(entry.size(), 10);
        assert_eq!(entry.mtime(), 100);
    }

    #[test]
    fn nested_directories_are_created_on_demand() {
        let mut idx = FsIndex::new();
        idx.set_directory(&path("a/b"), 0).unwrap_err(); // parent "a" doesn't exist yet
        idx.set_directory(&path("a"), 0).unwrap();
        idx.set_directory(&path("a/b"), 0).unwrap();
        idx.set(&path("a/b/c.txt"), vec![], 0, 0).unwrap();
        assert!(idx.get(&path("a/b/c.txt")).is_ok());
    }

    #[test]
    fn existing_single_block_files_skips_pending_and_multiblock() {
        let mut idx = FsIndex::new();
        idx.set(&path("one.txt"), vec![Block { page: 2, offset: 40, size: 10 }], 10, 0).unwrap();
        idx.set(&path("pending.txt"), vec![Block { page: -1, offset: 0, size: 5 }], 5, 0).unwrap();
        idx.set(
            &path("chunked.txt"),
            vec![Block { page: 0, offset: 0, size: 4096 }, Block { page: 1, offset: 0, size: 4096 }],
            8192,
            0,
        )
        .unwrap();

        let found = idx.existing_single_block_files();
        assert_eq!(found, vec![(2, 40, 10)]);
    }

    #[test]
    fn set_over_directory_bails_without_merging() {
        let mut idx = FsIndex::new();
        idx.set_directory(&path("a"), 0).unwrap();
        let err = idx.set(&path("a"), vec![], 0, 0).unwrap_err();
        assert!(matches!(err, CookfsError::IsADirectory));
    }

    #[test]
    fn unset_refuses_nonempty_directory() {
        let mut idx = FsIndex::new();
        idx.set_directory(&path("a"), 0).unwrap();
        idx.set(&path("a/f.txt"), vec![], 0, 0).unwrap();
        assert!(matches!(idx.unset(&path("a")), Err(CookfsError::NotEmpty)));
        idx.unset(&path("a/f.txt")).unwrap();
        idx.unset(&path("a")).unwrap();
        assert!(matches!(idx.get(&path("a")), Err(CookfsError::NotFound)));
    }

    #[test]
    fn unset_recursive_removes_subtree() {
        let mut idx = FsIndex::new();
        idx.set_directory(&path("a/b"), 0).unwrap();
        idx.set(&path("a/b/c.txt"), vec![], 0, 0).unwrap();
        idx.unset_recursive(&path("a")).unwrap();
        assert!(matches!(idx.get(&path("a")), Err(CookfsError::NotFound)));
    }

    #[test]
    fn child_table_promotes_to_hash_past_eight_entries() {
        let mut idx = FsIndex::new();
        for i in 0..8 {
            idx.set(&path(&format!("f{i}.txt")), vec![], 0, 0).unwrap();
        }
        if let FsEntry::Directory { children, .. } = idx.root() {
            assert!(matches!(children, ChildContainer::Fixed(_)));
        }
        idx.set(&path("f8.txt"), vec![], 0, 0).unwrap();
        if let FsEntry::Directory { children, .. } = idx.root() {
            assert!(matches!(children, ChildContainer::Hash(_)));
        }
        assert_eq!(idx.list(&path("")).unwrap().len(), 9);
    }

    #[test]
    fn serialize_deserialize_roundtrip() {
        let mut idx = FsIndex::new();
        idx.set_directory(&path("dir"), 5).unwrap();
        idx.set(&path("dir/x.txt"), vec![Block { page: 2, offset: 4, size: 6 }], 6, 42).unwrap();
        idx.set_metadata("cookfs.hashAlgo", b"md5".to_vec());

        let bytes = idx.serialize();
        let back = FsIndex::deserialize(&bytes).unwrap();
        let entry = back.get(&path("dir/x.txt")).unwrap();
        assert_eq!(entry.mtime(), 42);
        assert_eq!(entry.blocks(), &[Block { page: 2, offset: 4, size: 6 }]);
        assert_eq!(back.get_metadata("cookfs.hashAlgo"), Some(b"md5".as_slice()));
    }

    #[test]
    fn block_usage_counts_sharing_entries() {
        let mut idx = FsIndex::new();
        idx.set(&path("a"), vec![Block { page: 7, offset: 0, size: 1 }], 1, 0).unwrap();
        idx.set(&path("b"), vec![Block { page: 7, offset: 1, size: 1 }], 1, 0).unwrap();
        idx.set(&path("c"), vec![Block { page: 9, offset: 0, size: 1 }], 1, 0).unwrap();
        assert_eq!(idx.get_block_usage(7), 2);
        assert_eq!(idx.get_block_usage(9), 1);
    }
}
