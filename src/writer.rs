//! Small-file writer: a deduplicating batcher that packs files below
//! `small_file_size` into shared pages so many small files amortize one
//! page's compression-header cost.
//!
//! Pending files live as buffer slots, referenced from the fsindex by a
//! negative pending-block page field (`-slot - 1`, per the GLOSSARY's
//! "pending block"). `purge` sorts and packs them into real pages,
//! rewriting every affected fsindex entry's block to point at the
//! resulting page.

use crate::error::Result;
use crate::fsindex::{Block, FsIndex};
use crate::hash;
use crate::page_obj::PageBuf;
use crate::path::PathObj;

#[derive(Clone)]
struct PendingSlot {
    path: PathObj,
    data: Vec<u8>,
    mtime: i64,
}

/// `(uncompressed_size, md5) -> existing slices already on disk`, used to
/// dedup an incoming small file against content already packed into a
/// page, without re-reading every page up front.
struct PageMapEntry {
    page: u32,
    offset: u32,
    size: u32,
}

pub struct SmallFileWriter {
    pub small_file_size: usize,
    pub page_size: usize,
    pub small_file_buffer: usize,
    pending: Vec<PendingSlot>,
    page_map: std::collections::HashMap<(u32, [u8; 16]), Vec<PageMapEntry>>,
    allow_dedup: bool,
}

impl SmallFileWriter {
    pub fn new(small_file_size: usize, page_size: usize, small_file_buffer: usize, allow_dedup: bool) -> Self {
        Self {
            small_file_size,
            page_size,
            small_file_buffer,
            pending: Vec::new(),
            page_map: std::collections::HashMap::new(),
            allow_dedup,
        }
    }

    pub fn pending_bytes(&self) -> usize {
        self.pending.iter().map(|s| s.data.len()).sum()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// True when `size` qualifies for the small-file path rather than
    /// page store streaming.
    pub fn accepts(&self, size: usize) -> bool {
        size <= self.small_file_size && size <= self.page_size
    }

    /// Register the blocks of an existing single-block file entry so a
    /// later small file with the same content can be deduped against it.
    pub fn register_existing(&mut self, size_uncompressed: u32, md5: [u8; 16], page: u32, offset: u32, size: u32) {
        self.page_map
            .entry((size_uncompressed, md5))
            .or_default()
            .push(PageMapEntry { page, offset, size });
    }

    /// Look for on-disk content matching `data` via the page map; `load`
    /// fetches and byte-compares the candidate page slice to rule out a
    /// hash collision before confirming the match.
    fn find_existing<E>(
        &self,
        data: &[u8],
        mut load: impl FnMut(u32, u32, u32) -> std::result::Result<PageBuf, E>,
    ) -> Option<(u32, u32)> {
        if !self.allow_dedup {
            return None;
        }
        let md5 = hash::md5(data);
        let candidates = self.page_map.get(&(data.len() as u32, md5))?;
        for candidate in candidates {
            if let Ok(buf) = load(candidate.page, candidate.offset, candidate.size) {
                if buf.as_slice() == data {
                    return Some((candidate.page, candidate.offset));
                }
            }
        }
        None
    }

    /// Accept path for a small file. Returns `Some(slot)` when buffered
    /// as a pending block, or `None` when deduped against existing page
    /// content (the fsindex entry is pointed at the existing slice).
    pub fn add_file<E>(
        &mut self,
        path: PathObj,
        data: Vec<u8>,
        mtime: i64,
        load: impl FnMut(u32, u32, u32) -> std::result::Result<PageBuf, E>,
    ) -> Option<Block> {
        if let Some((page, offset)) = self.find_existing(&data, load) {
            return Some(Block { page: page as i32, offset: offset as i32, size: data.len() as i32 });
        }
        let slot_index = self.pending.len();
        self.pending.push(PendingSlot { path, data, mtime });
        Some(Block { page: -(slot_index as i32) - 1, offset: 0, size: self.pending[slot_index].data.len() as i32 })
    }

    pub fn should_purge(&self) -> bool {
        self.pending_bytes() > self.small_file_buffer
    }

    /// Remove a pending slot by position, decrementing the pending-block
    /// index of every later slot so fsindex references stay consistent.
    pub fn remove_pending(&mut self, slot_index: usize, fsindex: &mut FsIndex) -> Result<()> {
        if slot_index >= self.pending.len() {
            return Ok(());
        }
        self.pending.remove(slot_index);
        fsindex.rewrite_pending_blocks(|slot| if slot > slot_index { slot - 1 } else { slot });
        Ok(())
    }

    /// Sort pending buffers by (extension, tail name, full name) so
    /// similar files land adjacent for the compressor, then pack them
    /// into one or more pages via `write_page`. Returns, for each
    /// original pending slot (in packing order), its assigned page and
    /// in-page offset — the caller rewrites the corresponding fsindex
    /// block and clears the buffer.
    pub fn purge(
        &mut self,
        mut write_page: impl FnMut(&[u8]) -> Result<u32>,
    ) -> Result<Vec<(PathObj, u32, u32, u32)>> {
        let items = std::mem::take(&mut self.pending);
        if items.is_empty() {
            return Ok(Vec::new());
        }

        let mut order: Vec<usize> = (0..items.len()).collect();
        order.sort_by(|&a, &b| {
            let pa = &items[a].path;
            let pb = &items[b].path;
            pa.extension()
                .cmp(pb.extension())
                .then_with(|| pa.tail().unwrap_or("").cmp(pb.tail().unwrap_or("")))
                .then_with(|| pa.full_name().cmp(pb.full_name()))
        });

        // Group the sorted slots into page-sized batches, deduping
        // consecutive identical content within each batch to one offset.
        let mut pending_pages: Vec<(Vec<u8>, Vec<(usize, u32)>)> = Vec::new();
        let mut page_buf: Vec<u8> = Vec::new();
        let mut seen_in_page: std::collections::HashMap<Vec<u8>, u32> = std::collections::HashMap::new();
        let mut current_slots: Vec<(usize, u32)> = Vec::new();

        for &slot_index in &order {
            let data = &items[slot_index].data;
            if !page_buf.is_empty() && page_buf.len() + data.len() > self.page_size {
                pending_pages.push((std::mem::take(&mut page_buf), std::mem::take(&mut current_slots)));
                seen_in_page.clear();
            }
            if let Some(&offset) = seen_in_page.get(data) {
                current_slots.push((slot_index, offset));
                continue;
            }
            let offset = page_buf.len() as u32;
            page_buf.extend_from_slice(data);
            seen_in_page.insert(data.clone(), offset);
            current_slots.push((slot_index, offset));
        }
        if !page_buf.is_empty() {
            pending_pages.push((page_buf, current_slots));
        }

        let mut slot_to_location: std::collections::HashMap<usize, (u32, u32)> = std::collections::HashMap::new();
        for (bytes, slots) in pending_pages {
            let page_index = write_page(&bytes)?;
            for (slot_index, offset) in slots {
                slot_to_location.insert(slot_index, (page_index, offset));
                let size = items[slot_index].data.len() as u32;
                self.register_existing(size, hash::md5(&items[slot_index].data), page_index, offset, size);
            }
        }

        let mut results = Vec::with_capacity(order.len());
        for slot_index in order {
            let (page, offset) = slot_to_location[&slot_index];
            let size = items[slot_index].data.len() as u32;
            results.push((items[slot_index].path.clone(), page, offset, size));
        }

        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(s: &str) -> PathObj {
        PathObj::new(s).unwrap()
    }

    fn never_loads(_p: u32, _o: u32, _s: u32) -> std::result::Result<PageBuf, ()> {
        Err(())
    }

    #[test]
    fn small_files_buffer_until_purge() {
        let mut w = SmallFileWriter::new(1024, 4096, 10_000, true);
        for i in 0..3 {
            w.add_file(path(&format!("f{i}.txt")), vec![i as u8; 100], 0, never_loads);
        }
        assert_eq!(w.pending_count(), 3);
        assert_eq!(w.pending_bytes(), 300);
    }

    #[test]
    fn purge_packs_all_into_one_page_when_it_fits() {
        let mut w = SmallFileWriter::new(1024, 4096, 10_000, true);
        for i in 0..10u8 {
            w.add_file(path(&format!("f{i}.txt")), vec![i; 300], 0, never_loads);
        }
        let mut pages_written = 0;
        let results = w
            .purge(|bytes| {
                pages_written += 1;
                assert_eq!(bytes.len(), 3000);
                Ok(0)
            })
            .unwrap();
        assert_eq!(pages_written, 1);
        assert_eq!(results.len(), 10);
        assert_eq!(w.pending_count(), 0);
    }

    #[test]
    fn identical_content_shares_offset_within_a_page() {
        let mut w = SmallFileWriter::new(1024, 4096, 10_000, true);
        w.add_file(path("a.txt"), vec![7u8; 50], 0, never_loads);
        w.add_file(path("b.txt"), vec![7u8; 50], 0, never_loads);
        let results = w.purge(|bytes| {
            assert_eq!(bytes.len(), 50); // deduped within the page
            Ok(0)
        }).unwrap();
        let offsets: Vec<u32> = results.iter().map(|(_, _, off, _)| *off).collect();
        assert_eq!(offsets[0], offsets[1]);
    }

    #[test]
    fn removing_pending_slot_shrinks_count() {
        let mut w = SmallFileWriter::new(1024, 4096, 10_000, true);
        w.add_file(path("a.txt"), vec![1u8; 10], 0, never_loads);
        w.add_file(path("b.txt"), vec![2u8; 10], 0, never_loads);
        let mut fsindex = FsIndex::new();
        w.remove_pending(0, &mut fsindex).unwrap();
        assert_eq!(w.pending_count(), 1);
    }

    #[test]
    fn removing_pending_slot_renumbers_fsindex_references() {
        let mut w = SmallFileWriter::new(1024, 4096, 10_000, true);
        let mut fsindex = FsIndex::new();
        for (i, name) in ["a.txt", "b.txt", "c.txt"].iter().enumerate() {
            let block = w.add_file(path(name), vec![i as u8; 10], 0, never_loads).unwrap();
            fsindex.set(&path(name), vec![block], 10, 0).unwrap();
        }
        // slot 0 -> -1, slot 1 -> -2, slot 2 -> -3
        assert_eq!(fsindex.get(&path("a.txt")).unwrap().blocks()[0].page, -1);
        assert_eq!(fsindex.get(&path("b.txt")).unwrap().blocks()[0].page, -2);
        assert_eq!(fsindex.get(&path("c.txt")).unwrap().blocks()[0].page, -3);

        w.remove_pending(0, &mut fsindex).unwrap();
        assert_eq!(w.pending_count(), 2);
        // b.txt's slot shifted from 1 to 0, c.txt's from 2 to 1
        assert_eq!(fsindex.get(&path("b.txt")).unwrap().blocks()[0].page, -1);
        assert_eq!(fsindex.get(&path("c.txt")).unwrap().blocks()[0].page, -2);
    }
}
