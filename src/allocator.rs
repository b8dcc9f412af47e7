//! Block allocator.
//!
//! Owns the hive file and every hbin block loaded from it. Blocks are kept in
//! a vector and referenced by index, so a decoded record carries a
//! [`CellLocation`] (block index plus position) instead of a pointer back to
//! its block. A separate most-recently-used order decides which cached block
//! is tried first when space is needed.

use crate::block_io::BlockFile;
use crate::cell::CellSize;
use crate::error::{RegistryError, Result};
use crate::hbin::{Hbin, HbinHeader, HBIN_HEADER_SIZE};
use crate::utils::{absolute_to_cell_offset, read_u32_le, HBIN_START_OFFSET};
use tracing::{debug, info, warn};

/// Growth granularity of the hive file.
pub const BLOCK_GRANULARITY: u32 = 0x1000;

/// Position of a record: which cached block holds it and where its size
/// field sits inside that block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellLocation {
    /// Index into the allocator's block list.
    pub block: usize,
    /// Position of the record's size field within the block.
    pub pos: u32,
}

/// Size of a new block able to hold a record of `needed` bytes.
pub fn block_size_for(needed: u32) -> u32 {
    let total = needed + HBIN_HEADER_SIZE as u32;
    (total + BLOCK_GRANULARITY - 1) / BLOCK_GRANULARITY * BLOCK_GRANULARITY
}

/// Tracks hbin blocks and carves records out of their free space.
#[derive(Debug)]
pub struct Allocator {
    file: BlockFile,
    blocks: Vec<Hbin>,
    mru: Vec<usize>,
    last_block: u64,
    max_hive_size: u64,
    scan_complete: bool,
}

impl Allocator {
    /// Wraps an open hive file.
    ///
    /// `last_block` is the absolute offset of the last block as recorded in
    /// the header.
    pub fn new(file: BlockFile, last_block: u64, max_hive_size: u64) -> Self {
        Self {
            file,
            blocks: Vec::new(),
            mru: Vec::new(),
            last_block,
            // Record offsets are 32-bit.
            max_hive_size: max_hive_size.min(u64::from(u32::MAX)),
            scan_complete: false,
        }
    }

    /// The underlying file.
    pub fn file_mut(&mut self) -> &mut BlockFile {
        &mut self.file
    }

    /// Read access to the underlying file.
    pub fn file(&self) -> &BlockFile {
        &self.file
    }

    /// All blocks loaded so far, in load order.
    pub fn blocks(&self) -> &[Hbin] {
        &self.blocks
    }

    /// Absolute file offset of the last block in the file.
    pub fn last_block(&self) -> u64 {
        self.last_block
    }

    fn cached(&self, file_offset: u64) -> Option<usize> {
        self.blocks.iter().position(|b| b.file_offset() == file_offset)
    }

    fn promote(&mut self, index: usize) {
        if let Some(at) = self.mru.iter().position(|&i| i == index) {
            self.mru.remove(at);
        }
        self.mru.insert(0, index);
    }

    /// Loads the block at `file_offset`, or returns the cached copy.
    pub fn load_block(&mut self, file_offset: u64) -> Result<usize> {
        if let Some(index) = self.cached(file_offset) {
            return Ok(index);
        }

        let data = self.file.read_window(file_offset, None)?;
        let hbin = Hbin::from_bytes(file_offset, data, HBIN_HEADER_SIZE as u32)?;

        let index = self.blocks.len();
        self.blocks.push(hbin);
        self.mru.push(index);
        Ok(index)
    }

    /// Absolute offset and size of every block in the file, found by walking
    /// the block headers from the first block.
    pub fn block_offsets(&mut self) -> Result<Vec<(u64, u32)>> {
        let file_size = self.file.len()?;
        let mut offsets = Vec::new();
        let mut file_offset = u64::from(HBIN_START_OFFSET);

        while file_offset + HBIN_HEADER_SIZE as u64 <= file_size {
            let size = match self.cached(file_offset) {
                Some(index) => self.blocks[index].size(),
                None => {
                    let raw = self.file.read_window(file_offset, Some(HBIN_HEADER_SIZE))?;
                    HbinHeader::parse(&raw, absolute_to_cell_offset(file_offset)?)?.size
                }
            };
            offsets.push((file_offset, size));
            file_offset += u64::from(size);
        }

        if file_offset != file_size {
            warn!(
                end = %format!("{:#x}", file_offset),
                file_size = %format!("{:#x}", file_size),
                "Trailing bytes after last block"
            );
        }
        Ok(offsets)
    }

    /// Resolves a record offset to the block holding it, loading that block
    /// if it is not cached yet.
    pub fn locate(&mut self, offset: u32) -> Result<CellLocation> {
        if let Some(index) = self.blocks.iter().position(|b| b.contains(offset)) {
            let pos = self.blocks[index].position_of(offset);
            return Ok(CellLocation { block: index, pos });
        }

        for (file_offset, size) in self.block_offsets()? {
            let first = absolute_to_cell_offset(file_offset)?;
            if offset >= first + HBIN_HEADER_SIZE as u32 && offset - first < size {
                let index = self.load_block(file_offset)?;
                let pos = self.blocks[index].position_of(offset);
                return Ok(CellLocation { block: index, pos });
            }
        }

        Err(RegistryError::invalid_offset(offset, self.file.len()?))
    }

    /// Hive-relative offset of a record.
    pub fn offset_of(&self, location: CellLocation) -> u32 {
        self.blocks[location.block].offset_of(location.pos)
    }

    fn cell_span(&self, location: CellLocation) -> Result<(usize, usize)> {
        let block = &self.blocks[location.block];
        let offset = block.offset_of(location.pos);
        let start = location.pos as usize;
        let raw = read_u32_le(block.data(), start)?;

        let len = match CellSize::from_raw(raw) {
            CellSize::Used(len) if len >= 4 => len as usize,
            _ => return Err(RegistryError::invalid_cell_size(raw, offset)),
        };

        let end = start + len;
        if end > block.data().len() {
            debug!(
                offset = %format!("{:#x}", offset),
                size = len,
                "Record extends past end of block"
            );
            return Ok((start + 4, block.data().len()));
        }
        Ok((start + 4, end))
    }

    /// Body of a live record (everything after its size field).
    ///
    /// A record whose declared size overruns its block is clipped to the
    /// block end.
    pub fn cell(&self, location: CellLocation) -> Result<&[u8]> {
        let (start, end) = self.cell_span(location)?;
        Ok(&self.blocks[location.block].data()[start..end])
    }

    /// Mutable body of a live record. Marks the block dirty.
    pub fn cell_mut(&mut self, location: CellLocation) -> Result<&mut [u8]> {
        let (start, end) = self.cell_span(location)?;
        let block = &mut self.blocks[location.block];
        block.mark_dirty();
        Ok(&mut block.data_mut()[start..end])
    }

    /// Finds a block with at least `size` free bytes.
    ///
    /// Cached blocks are tried first, most recently used first. Then the
    /// file is walked for blocks not yet loaded. Failing both, a new block is
    /// appended to the file.
    pub fn find_free_block(&mut self, size: u32) -> Result<usize> {
        if let Some(&index) = self.mru.iter().find(|&&i| self.blocks[i].has_room(size)) {
            self.promote(index);
            return Ok(index);
        }

        if !self.scan_complete {
            for (file_offset, _) in self.block_offsets()? {
                if self.cached(file_offset).is_some() {
                    continue;
                }
                let index = self.load_block(file_offset)?;
                if self.blocks[index].has_room(size) {
                    self.promote(index);
                    return Ok(index);
                }
            }
            self.scan_complete = true;
        }

        self.allocate_block(size)
    }

    fn allocate_block(&mut self, size: u32) -> Result<usize> {
        let block_size = block_size_for(size);
        let file_offset = self.file.len()?;

        if file_offset + u64::from(block_size) > self.max_hive_size {
            return Err(RegistryError::OutOfSpace {
                requested: u64::from(block_size),
                limit: self.max_hive_size,
            });
        }

        let mut hbin = Hbin::new(file_offset, block_size)?;
        let written_at = self.file.append(hbin.flush_bytes())?;
        hbin.mark_clean();

        info!(
            offset = %format!("{:#x}", written_at),
            size = block_size,
            "Allocated new block"
        );

        let index = self.blocks.len();
        self.blocks.push(hbin);
        self.mru.insert(0, index);
        self.last_block = written_at;
        Ok(index)
    }

    /// Reserves a live record of `size` bytes and returns where it lives.
    ///
    /// `size` must already include the size field and be a multiple of 8.
    pub fn reserve(&mut self, size: u32) -> Result<CellLocation> {
        let block = self.find_free_block(size)?;
        let pos = self.blocks[block].reserve(size)?;

        debug!(
            offset = %format!("{:#x}", self.blocks[block].offset_of(pos)),
            size,
            "Reserved record"
        );
        Ok(CellLocation { block, pos })
    }

    /// Writes a block back to disk if it has unwritten changes.
    pub fn flush(&mut self, index: usize) -> Result<()> {
        let block = &mut self.blocks[index];
        if !block.is_dirty() {
            return Ok(());
        }

        let file_offset = block.file_offset();
        self.file.write_window(file_offset, block.flush_bytes())?;
        block.mark_clean();
        Ok(())
    }

    /// Writes back every dirty block.
    pub fn flush_all(&mut self) -> Result<()> {
        for index in 0..self.blocks.len() {
            self.flush(index)?;
        }
        Ok(())
    }
}
