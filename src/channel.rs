//! Reader and writer channels: byte-stream I/O over a logical file that
//! may span multiple pages (§4.5, §4.6).

use crate::error::{CookfsError, Result};
use crate::fsindex::Block;
use crate::page_obj::PageBuf;

/// Cursor into a file's block list: which block, how far into it, and
/// the cumulative absolute offset.
#[derive(Debug, Clone, Copy, Default)]
struct Cursor {
    block_index: usize,
    offset_in_block: usize,
    absolute: u64,
}

/// Anything that can hand back a block's decoded bytes given a cache
/// weight — `Pages::get_page`, abstracted so channels don't depend on a
/// concrete file-handle type parameter.
pub trait PageSource {
    fn get_page(&mut self, index: u32, weight: i64) -> Result<PageBuf>;
    fn block_usage(&self, page_index: u32) -> usize;
}

pub struct ReaderChannel {
    blocks: Vec<Block>,
    file_size: u64,
    cursor: Cursor,
    ticked: bool,
}

impl ReaderChannel {
    pub fn open(blocks: Vec<Block>) -> Self {
        let file_size = blocks.iter().map(|b| b.size.max(0) as u64).sum();
        Self { blocks, file_size, cursor: Cursor::default(), ticked: false }
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn tell(&self) -> u64 {
        self.cursor.absolute
    }

    pub fn is_eof(&self) -> bool {
        self.cursor.absolute == self.file_size
    }

    /// Clamp to `[0, file_size]`, then walk blocks from the start until
    /// the cumulative size exceeds the target offset.
    pub fn seek(&mut self, offset: i64, whence: std::io::SeekFrom) -> Result<u64> {
        let target: i64 = match whence {
            std::io::SeekFrom::Start(_) => offset,
            std::io::SeekFrom::Current(_) => self.cursor.absolute as i64 + offset,
            std::io::SeekFrom::End(_) => self.file_size as i64 + offset,
        };
        let target = target.clamp(0, self.file_size as i64) as u64;

        let mut remaining = target;
        let mut block_index = 0;
        for (i, b) in self.blocks.iter().enumerate() {
            let len = b.size.max(0) as u64;
            if remaining < len || i == self.blocks.len() - 1 {
                block_index = i;
                break;
            }
            remaining -= len;
            block_index = i + 1;
        }
        self.cursor = Cursor { block_index, offset_in_block: remaining as usize, absolute: target };
        Ok(target)
    }

    /// Read up to `out.len()` bytes, returning the number actually read
    /// (0 at EOF).
    pub fn read(&mut self, out: &mut [u8], source: &mut impl PageSource) -> Result<usize> {
        if !self.ticked {
            self.ticked = true;
            // bias eviction away from a cold first block by touching the cache clock
            let _ = self.peek_weight(source);
        }
        let mut written = 0;
        while written < out.len() && self.cursor.block_index < self.blocks.len() {
            let block = self.blocks[self.cursor.block_index];
            if block.size <= 0 {
                self.cursor.block_index += 1;
                self.cursor.offset_in_block = 0;
                continue;
            }
            let weight = self.peek_weight(source);
            let page = source.get_page(block.page as u32, weight)?;
            let block_start = block.offset as usize;
            let remaining_in_block = block.size as usize - self.cursor.offset_in_block;
            let want = (out.len() - written).min(remaining_in_block);
            let src = &page.as_slice()[block_start + self.cursor.offset_in_block..][..want];
            out[written..written + want].copy_from_slice(src);

            written += want;
            self.cursor.offset_in_block += want;
            self.cursor.absolute += want as u64;
            if self.cursor.offset_in_block >= block.size as usize {
                self.cursor.block_index += 1;
                self.cursor.offset_in_block = 0;
            }
        }
        Ok(written)
    }

    fn peek_weight(&self, source: &impl PageSource) -> i64 {
        if self.cursor.block_index >= self.blocks.len() {
            return 0;
        }
        let page = self.blocks[self.cursor.block_index].page;
        if page < 0 {
            return 0;
        }
        if source.block_usage(page as u32) > 1 { 1 } else { 0 }
    }
}

/// Growth bands for the writer channel's elastic in-memory buffer:
/// small appends get a 1 KiB bump, medium ones 128 KiB, everything
/// else rounds up to the next 1 KiB.
fn grown_capacity(current_cap: usize, needed: usize) -> usize {
    if needed <= current_cap {
        return current_cap;
    }
    let deficit = needed - current_cap;
    let bump = if deficit <= 1024 {
        1024
    } else if deficit <= 128 * 1024 {
        128 * 1024
    } else {
        (deficit + 1023) / 1024 * 1024
    };
    current_cap + bump
}

pub struct WriterChannel {
    buf: Vec<u8>,
    cursor: u64,
}

impl WriterChannel {
    pub fn new() -> Self {
        Self { buf: Vec::new(), cursor: 0 }
    }

    /// Open over an existing entry's bytes, prefetched so partial
    /// overwrites work without a read-modify-write round trip per call.
    pub fn open_existing(existing: Vec<u8>) -> Self {
        Self { buf: existing, cursor: 0 }
    }

    pub fn len(&self) -> u64 {
        self.buf.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn tell(&self) -> u64 {
        self.cursor
    }

    pub fn seek(&mut self, offset: i64, whence: std::io::SeekFrom) -> Result<u64> {
        let current_size = self.buf.len() as u64;
        let target: i64 = match whence {
            std::io::SeekFrom::Start(_) => offset,
            std::io::SeekFrom::Current(_) => self.cursor as i64 + offset,
            std::io::SeekFrom::End(_) => current_size as i64 + offset,
        };
        if target < 0 {
            return Err(CookfsError::InvalidArgument("seek before start of file".into()));
        }
        let target = target as u64;
        if target > current_size {
            self.buf.resize(target as usize, 0);
        }
        self.cursor = target;
        Ok(target)
    }

    pub fn read(&mut self, out: &mut [u8]) -> usize {
        let available = self.buf.len().saturating_sub(self.cursor as usize);
        let want = out.len().min(available);
        out[..want].copy_from_slice(&self.buf[self.cursor as usize..self.cursor as usize + want]);
        self.cursor += want as u64;
        want
    }

    pub fn write(&mut self, data: &[u8]) -> usize {
        let end = self.cursor as usize + data.len();
        if end > self.buf.capacity() {
            let new_cap = grown_capacity(self.buf.capacity(), end);
            self.buf.reserve(new_cap - self.buf.capacity());
        }
        if end > self.buf.len() {
            self.buf.resize(end, 0);
        }
        self.buf[self.cursor as usize..end].copy_from_slice(data);
        self.cursor += data.len() as u64;
        data.len()
    }

    pub fn truncate(&mut self, n: u64) {
        self.buf.resize(n as usize, 0);
        if self.cursor > n {
            self.cursor = n;
        }
    }

    /// Rewind and hand back the full contents for the small-file writer
    /// to pack under the target path. Consumes the channel.
    pub fn into_contents(mut self) -> Vec<u8> {
        self.cursor = 0;
        self.buf
    }
}

impl Default for WriterChannel {
    fn default() -> Self {
        Self::new()
    }
}
