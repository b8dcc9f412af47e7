//! Hive bin (hbin) blocks.
//!
//! Hive bins are 4KB-aligned blocks that hold records. Each hbin has a 32-byte
//! header followed by a packed sequence of records. Blocks written by this
//! crate keep all unused space in a single trailing free record whose size
//! field is followed by [`FREE_SPACE_MARKER`].

use crate::cell::{CellSize, CELL_ALIGNMENT, FREE_SPACE_MARKER};
use crate::error::{RegistryError, Result};
use crate::utils::{absolute_to_cell_offset, read_u32_le, read_u64_le};
use byteorder::{ByteOrder, LittleEndian};
use tracing::{debug, warn};

/// Expected signature for hive bins ("hbin").
pub const HBIN_SIGNATURE: &[u8; 4] = b"hbin";

/// Size of an hbin header; also the position of the first record in a block.
pub const HBIN_HEADER_SIZE: usize = 0x20;

/// Hive bin header structure.
#[derive(Debug, Clone)]
pub struct HbinHeader {
    /// Signature, should be "hbin".
    pub signature: [u8; 4],

    /// Offset of this hbin from the start of the hive bins (relative to 0x1000).
    pub offset: u32,

    /// Size of this hbin in bytes (including header).
    pub size: u32,

    /// Reserved fields.
    pub reserved: [u32; 2],

    /// Timestamp (Windows FILETIME).
    pub timestamp: u64,

    /// Spare field; blocks written here repeat the block size in it.
    pub spare: u32,
}

impl HbinHeader {
    /// Builds the header of a new block.
    pub fn new(offset: u32, size: u32) -> Self {
        HbinHeader {
            signature: *HBIN_SIGNATURE,
            offset,
            size,
            reserved: [0, 0],
            timestamp: 0,
            spare: size,
        }
    }

    /// Parses an hbin header from raw bytes.
    ///
    /// # Arguments
    ///
    /// * `data` - Raw bytes starting at the hbin header.
    /// * `expected_offset` - Expected offset value for validation.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Data is too small
    /// - Signature is invalid
    /// - Offset doesn't match expected value
    pub fn parse(data: &[u8], expected_offset: u32) -> Result<Self> {
        if data.len() < HBIN_HEADER_SIZE {
            return Err(RegistryError::TruncatedData {
                offset: expected_offset,
                expected: HBIN_HEADER_SIZE,
                actual: data.len(),
            });
        }

        let mut signature = [0u8; 4];
        signature.copy_from_slice(&data[0..4]);

        if &signature != HBIN_SIGNATURE {
            return Err(RegistryError::invalid_signature(HBIN_SIGNATURE, &signature));
        }

        let offset = read_u32_le(data, 0x04)?;
        let size = read_u32_le(data, 0x08)?;

        if offset != expected_offset {
            return Err(RegistryError::InvalidFormat(format!(
                "Hbin offset mismatch: expected {:#x}, found {:#x}",
                expected_offset, offset
            )));
        }

        if (size as usize) <= HBIN_HEADER_SIZE || size % CELL_ALIGNMENT != 0 {
            return Err(RegistryError::InvalidFormat(format!(
                "Invalid hbin size {:#x} at offset {:#x}",
                size, offset
            )));
        }

        let reserved = [read_u32_le(data, 0x0C)?, read_u32_le(data, 0x10)?];
        let timestamp = read_u64_le(data, 0x14)?;
        let spare = read_u32_le(data, 0x1C)?;

        Ok(HbinHeader {
            signature,
            offset,
            size,
            reserved,
            timestamp,
            spare,
        })
    }

    /// Writes this header into the first 32 bytes of `data`.
    pub fn encode(&self, data: &mut [u8]) {
        data[0..4].copy_from_slice(&self.signature);
        LittleEndian::write_u32(&mut data[0x04..0x08], self.offset);
        LittleEndian::write_u32(&mut data[0x08..0x0C], self.size);
        LittleEndian::write_u32(&mut data[0x0C..0x10], self.reserved[0]);
        LittleEndian::write_u32(&mut data[0x10..0x14], self.reserved[1]);
        LittleEndian::write_u64(&mut data[0x14..0x1C], self.timestamp);
        LittleEndian::write_u32(&mut data[0x1C..0x20], self.spare);
    }
}

/// One hbin block held in memory, with its free-space bookkeeping.
#[derive(Debug, Clone)]
pub struct Hbin {
    header: HbinHeader,
    file_offset: u64,
    free_off: Option<u32>,
    free_size: u32,
    dirty: bool,
    data: Vec<u8>,
}

impl Hbin {
    /// Allocates an empty block of `size` bytes that will live at
    /// `file_offset`. All space after the header is free.
    pub fn new(file_offset: u64, size: u32) -> Result<Self> {
        let header = HbinHeader::new(absolute_to_cell_offset(file_offset)?, size);
        let mut data = vec![0u8; size as usize];
        header.encode(&mut data);

        Ok(Hbin {
            header,
            file_offset,
            free_off: Some(HBIN_HEADER_SIZE as u32),
            free_size: size - HBIN_HEADER_SIZE as u32,
            dirty: true,
            data,
        })
    }

    /// Decodes a block read from `file_offset` and locates its free space.
    ///
    /// The record stream is walked from `first_record` until the trailing
    /// free record is found or the block ends. A last record whose declared
    /// size runs past the block end is tolerated: the block is simply treated
    /// as having no free space.
    pub fn from_bytes(file_offset: u64, data: Vec<u8>, first_record: u32) -> Result<Self> {
        let header = HbinHeader::parse(&data, absolute_to_cell_offset(file_offset)?)?;

        if header.size as usize != data.len() {
            return Err(RegistryError::TruncatedData {
                offset: header.offset,
                expected: header.size as usize,
                actual: data.len(),
            });
        }

        let mut hbin = Hbin {
            header,
            file_offset,
            free_off: None,
            free_size: 0,
            dirty: false,
            data,
        };
        hbin.scan_free_space(first_record);

        debug!(
            offset = %format!("{:#x}", hbin.header.offset),
            size = hbin.size(),
            free_off = ?hbin.free_off,
            free_size = hbin.free_size,
            "Loaded hbin block"
        );
        Ok(hbin)
    }

    fn scan_free_space(&mut self, first_record: u32) {
        let block_size = self.size();
        let mut pos = first_record;

        while pos + 8 <= block_size {
            let at = pos as usize;
            let raw = LittleEndian::read_u32(&self.data[at..at + 4]);
            let marker = LittleEndian::read_u32(&self.data[at + 4..at + 8]);
            let size = CellSize::from_raw(raw);

            if !size.is_used() && marker == FREE_SPACE_MARKER {
                let remaining = block_size - pos;
                if size.len() != remaining {
                    warn!(
                        block = %format!("{:#x}", self.header.offset),
                        declared = size.len(),
                        remaining,
                        "Free space record disagrees with block end"
                    );
                }
                self.free_off = Some(pos);
                self.free_size = remaining;
                return;
            }

            if size.is_empty() {
                warn!(
                    offset = %format!("{:#x}", self.offset_of(pos)),
                    "Zero-length record, treating rest of block as used"
                );
                return;
            }

            if size.len() > block_size - pos {
                debug!(
                    offset = %format!("{:#x}", self.offset_of(pos)),
                    size = size.len(),
                    "Last record extends past end of block"
                );
                return;
            }

            pos += size.len();
        }
    }

    /// The decoded block header.
    pub fn header(&self) -> &HbinHeader {
        &self.header
    }

    /// Absolute file offset of the block.
    pub fn file_offset(&self) -> u64 {
        self.file_offset
    }

    /// Offset of the block start relative to the first block.
    pub fn first_hbin_off(&self) -> u32 {
        self.header.offset
    }

    /// Block size in bytes.
    pub fn size(&self) -> u32 {
        self.data.len() as u32
    }

    /// Position of the trailing free record inside the block, if any.
    pub fn free_off(&self) -> Option<u32> {
        self.free_off
    }

    /// Number of free bytes at the end of the block.
    pub fn free_size(&self) -> u32 {
        if self.free_off.is_some() {
            self.free_size
        } else {
            0
        }
    }

    /// Returns true if the block has unwritten changes.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Marks the block as modified.
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Returns true if a record at hive offset `offset` lies in this block.
    pub fn contains(&self, offset: u32) -> bool {
        let start = self.header.offset;
        offset >= start + HBIN_HEADER_SIZE as u32 && offset - start < self.size()
    }

    /// Converts a hive offset into a position within this block.
    pub fn position_of(&self, offset: u32) -> u32 {
        offset - self.header.offset
    }

    /// Converts a position within this block into a hive offset.
    pub fn offset_of(&self, pos: u32) -> u32 {
        self.header.offset + pos
    }

    /// Returns true if a record of `size` bytes fits in the free space.
    pub fn has_room(&self, size: u32) -> bool {
        self.free_off.is_some() && self.free_size >= size
    }

    /// Carves a live record of `size` bytes out of the free space.
    ///
    /// The size field is stamped immediately and the record body is zeroed.
    /// Returns the position of the new record's size field.
    pub fn reserve(&mut self, size: u32) -> Result<u32> {
        let pos = match self.free_off {
            Some(pos) if self.free_size >= size => pos,
            _ => {
                return Err(RegistryError::InvalidFormat(format!(
                    "Block at {:#x} has no room for {} bytes",
                    self.header.offset, size
                )))
            }
        };

        let at = pos as usize;
        let end = at + size as usize;
        LittleEndian::write_u32(&mut self.data[at..at + 4], CellSize::Used(size).to_raw());
        self.data[at + 4..end].fill(0);

        self.free_size -= size;
        if self.free_size < CELL_ALIGNMENT {
            self.free_off = None;
            self.free_size = 0;
        } else {
            self.free_off = Some(pos + size);
        }
        self.dirty = true;

        Ok(pos)
    }

    /// Returns the block bytes ready to be written back, with the trailing
    /// free record stamped in.
    pub fn flush_bytes(&mut self) -> &[u8] {
        if let Some(pos) = self.free_off {
            let at = pos as usize;
            LittleEndian::write_u32(
                &mut self.data[at..at + 4],
                CellSize::Free(self.free_size).to_raw(),
            );
            LittleEndian::write_u32(&mut self.data[at + 4..at + 8], FREE_SPACE_MARKER);
        }
        &self.data
    }

    /// Clears the dirty flag once the block is on disk.
    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    /// The raw block bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// The raw block bytes, mutable. Callers must mark the block dirty.
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Iterates over the records of this block.
    pub fn cells(&self) -> CellIterator<'_> {
        CellIterator::new(&self.data, self.header.offset, HBIN_HEADER_SIZE as u32)
    }
}

/// Iterator over the records of one block.
///
/// The iterator is lenient: a zero-length record ends it, and a record whose
/// declared size overruns the block is yielded clipped to the block end and
/// flagged as truncated, after which iteration stops.
pub struct CellIterator<'a> {
    data: &'a [u8],
    pos: usize,
    hbin_offset: u32,
    done: bool,
}

impl<'a> CellIterator<'a> {
    /// Creates a record iterator over a whole block.
    ///
    /// # Arguments
    ///
    /// * `data` - The block bytes, header included.
    /// * `hbin_offset` - The offset of this block from the first block.
    /// * `first_record` - Position of the first record (after the header).
    pub fn new(data: &'a [u8], hbin_offset: u32, first_record: u32) -> Self {
        Self {
            data,
            pos: first_record as usize,
            hbin_offset,
            done: false,
        }
    }
}

impl<'a> Iterator for CellIterator<'a> {
    type Item = CellInfo<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.pos + 4 > self.data.len() {
            return None;
        }

        let raw = LittleEndian::read_u32(&self.data[self.pos..self.pos + 4]);
        let size = CellSize::from_raw(raw);
        if size.len() < 4 {
            self.done = true;
            return None;
        }

        let remaining = self.data.len() - self.pos;
        let truncated = size.len() as usize > remaining;
        let end = self.pos + (size.len() as usize).min(remaining);

        let info = CellInfo {
            offset: self.hbin_offset + self.pos as u32,
            size,
            truncated,
            data: &self.data[self.pos + 4..end],
        };

        if truncated {
            self.done = true;
        }
        self.pos = end;
        Some(info)
    }
}

/// Information about a record within a block.
#[derive(Debug)]
pub struct CellInfo<'a> {
    /// Offset of this record from the first block.
    pub offset: u32,

    /// Decoded size field.
    pub size: CellSize,

    /// True if the declared size ran past the end of the block.
    pub truncated: bool,

    /// Record data (excluding the size field).
    pub data: &'a [u8],
}

impl<'a> CellInfo<'a> {
    /// Returns the record type tag (first 2 bytes of data).
    pub fn cell_type(&self) -> Option<[u8; 2]> {
        if self.data.len() >= 2 {
            Some([self.data[0], self.data[1]])
        } else {
            None
        }
    }

    /// Returns true for a live record.
    pub fn is_allocated(&self) -> bool {
        self.size.is_used()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hbin_header_size() {
        assert_eq!(HBIN_HEADER_SIZE, 32);
    }

    #[test]
    fn test_invalid_signature() {
        let mut data = vec![0u8; HBIN_HEADER_SIZE];
        data[0..4].copy_from_slice(b"XXXX");

        assert!(HbinHeader::parse(&data, 0).is_err());
    }

    #[test]
    fn test_new_block_is_all_free() {
        let mut hbin = Hbin::new(0x2000, 0x1000).unwrap();
        assert_eq!(hbin.first_hbin_off(), 0x1000);
        assert_eq!(hbin.free_off(), Some(0x20));
        assert_eq!(hbin.free_size(), 0xFE0);
        assert!(hbin.is_dirty());

        let bytes = hbin.flush_bytes().to_vec();
        let header = HbinHeader::parse(&bytes, 0x1000).unwrap();
        assert_eq!(header.size, 0x1000);
        assert_eq!(header.spare, 0x1000);
        assert_eq!(read_u32_le(&bytes, 0x20).unwrap(), 0xFE0);
        assert_eq!(read_u32_le(&bytes, 0x24).unwrap(), FREE_SPACE_MARKER);
    }

    #[test]
    fn test_block_offset_must_follow_base_block() {
        assert!(Hbin::new(0x800, 0x1000).is_err());
        assert!(Hbin::new(0x1_0000_1000, 0x1000).is_err());
        assert!(Hbin::from_bytes(0x800, vec![0u8; 0x1000], 0x20).is_err());
    }

    #[test]
    fn test_reserve_then_reload() {
        let mut hbin = Hbin::new(0x1000, 0x1000).unwrap();
        let first = hbin.reserve(0x58).unwrap();
        let second = hbin.reserve(0x20).unwrap();
        assert_eq!(first, 0x20);
        assert_eq!(second, 0x78);
        assert_eq!(hbin.free_off(), Some(0x98));
        assert_eq!(hbin.free_size(), 0x1000 - 0x98);

        let bytes = hbin.flush_bytes().to_vec();
        let reloaded = Hbin::from_bytes(0x1000, bytes, 0x20).unwrap();
        assert_eq!(reloaded.free_off(), Some(0x98));
        assert_eq!(reloaded.free_size(), 0x1000 - 0x98);
        assert!(!reloaded.is_dirty());

        let cells: Vec<_> = reloaded.cells().collect();
        assert_eq!(cells.len(), 3);
        assert_eq!(cells[0].size, CellSize::Used(0x58));
        assert_eq!(cells[1].offset, 0x78);
        assert!(!cells[2].is_allocated());
    }

    #[test]
    fn test_reserve_exhausts_block() {
        let mut hbin = Hbin::new(0x1000, 0x1000).unwrap();
        hbin.reserve(0xFE0).unwrap();
        assert_eq!(hbin.free_off(), None);
        assert_eq!(hbin.free_size(), 0);
        assert!(!hbin.has_room(8));
        assert!(hbin.reserve(8).is_err());

        let bytes = hbin.flush_bytes().to_vec();
        let reloaded = Hbin::from_bytes(0x1000, bytes, 0x20).unwrap();
        assert_eq!(reloaded.free_off(), None);
    }

    #[test]
    fn test_overrunning_last_record_is_tolerated() {
        let mut hbin = Hbin::new(0x1000, 0x1000).unwrap();
        hbin.reserve(0x40).unwrap();
        let mut bytes = hbin.flush_bytes().to_vec();
        // Claim a live record that runs past the block end.
        bytes[0x60..0x64].copy_from_slice(&CellSize::Used(0x2000).to_raw().to_le_bytes());

        let reloaded = Hbin::from_bytes(0x1000, bytes, 0x20).unwrap();
        assert_eq!(reloaded.free_off(), None);

        let cells: Vec<_> = reloaded.cells().collect();
        assert_eq!(cells.len(), 2);
        assert!(cells[1].truncated);
        assert_eq!(cells[1].data.len(), 0x1000 - 0x64);
    }

    #[test]
    fn test_contains() {
        let hbin = Hbin::new(0x2000, 0x2000).unwrap();
        assert!(!hbin.contains(0x1000));
        assert!(hbin.contains(0x1020));
        assert!(hbin.contains(0x2FF8));
        assert!(!hbin.contains(0x3000));
        assert_eq!(hbin.position_of(0x1020), 0x20);
    }
}
