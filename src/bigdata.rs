//! Big data block (db) parsing.
//!
//! On hives of version 1.4 and later, values larger than 16,344 bytes are
//! stored in big data blocks: a header record pointing at a list of segment
//! records, each holding up to 16,344 bytes of the value. Hives created by
//! this crate are version 1.3 and never contain them.

use crate::error::{RegistryError, Result};
use crate::utils::{read_u16_le, read_u32_le};

/// Largest value stored directly in one data record, and the payload size of
/// each big data segment.
pub const BIG_DATA_SEGMENT_SIZE: usize = 16344;

/// Big data block header structure.
///
/// Format:
/// ```text
/// Offset  Size  Description
/// 0x00    2     Signature ("db")
/// 0x02    2     Number of segments
/// 0x04    4     Offset to segment list
/// ```
#[derive(Debug, Clone)]
pub struct BigDataBlock {
    /// Number of data segments
    pub segment_count: u16,

    /// Offset to the list of segment offsets
    pub segment_list_offset: u32,
}

impl BigDataBlock {
    /// Minimum size of a big data block header
    const MIN_SIZE: usize = 8;

    /// Parses a big data block header from cell data.
    ///
    /// # Arguments
    ///
    /// * `data` - Cell data (excluding size field, starting with "db" signature)
    /// * `offset` - Offset of this cell for error reporting
    ///
    /// # Errors
    ///
    /// Returns an error if the data is malformed or truncated.
    pub fn parse(data: &[u8], offset: u32) -> Result<Self> {
        if data.len() < Self::MIN_SIZE {
            return Err(RegistryError::TruncatedData {
                offset,
                expected: Self::MIN_SIZE,
                actual: data.len(),
            });
        }

        if &data[0..2] != b"db" {
            return Err(RegistryError::unknown_cell_type([data[0], data[1]], offset));
        }

        Ok(BigDataBlock {
            segment_count: read_u16_le(data, 0x02)?,
            segment_list_offset: read_u32_le(data, 0x04)?,
        })
    }

    /// Reads the segment offsets out of the segment list record body.
    pub fn segment_offsets(&self, list: &[u8]) -> Result<Vec<u32>> {
        let count = self.segment_count as usize;
        if list.len() < count * 4 {
            return Err(RegistryError::TruncatedData {
                offset: self.segment_list_offset,
                expected: count * 4,
                actual: list.len(),
            });
        }

        (0..count).map(|i| read_u32_le(list, i * 4)).collect()
    }
}

/// Returns true if a value of `len` bytes goes through a db record on a hive
/// that supports them.
pub fn is_big_data(len: u32) -> bool {
    len as usize > BIG_DATA_SEGMENT_SIZE
}
