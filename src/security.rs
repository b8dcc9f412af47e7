//! Security descriptor (sk) records and the hive's descriptor table.
//!
//! On disk the sk records of a hive form a ring through their previous and
//! next offsets. In memory they are a plain vector in creation order, and the
//! ring is derived from that order whenever records are written. Descriptors
//! are shared between keys by byte equality; reference counts only grow.

use crate::allocator::CellLocation;
use crate::error::{RegistryError, Result};
use crate::utils::{align8, read_u32_le, write_bytes, write_u16_le, write_u32_le};
use std::fmt;
use tracing::warn;

/// Offset of the descriptor bytes in an sk record body.
const DESCRIPTOR_OFFSET: usize = 0x14;

/// Decoded sk record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityKey {
    /// Offset of the previous sk record in the ring.
    pub prev_offset: u32,

    /// Offset of the next sk record in the ring.
    pub next_offset: u32,

    /// Number of keys using this descriptor.
    pub ref_count: u32,

    /// Opaque descriptor bytes.
    pub descriptor: Vec<u8>,
}

impl SecurityKey {
    /// Parses an sk record body.
    ///
    /// The stored size counts itself, so the descriptor is four bytes shorter.
    /// A size that does not fit the record is clamped and logged.
    pub fn parse(data: &[u8], offset: u32) -> Result<Self> {
        if data.len() < DESCRIPTOR_OFFSET {
            return Err(RegistryError::TruncatedData {
                offset,
                expected: DESCRIPTOR_OFFSET,
                actual: data.len(),
            });
        }

        if &data[0..2] != b"sk" {
            return Err(RegistryError::unknown_cell_type([data[0], data[1]], offset));
        }

        let prev_offset = read_u32_le(data, 0x04)?;
        let next_offset = read_u32_le(data, 0x08)?;
        let ref_count = read_u32_le(data, 0x0C)?;
        let size = read_u32_le(data, 0x10)? as usize;

        let available = data.len() - DESCRIPTOR_OFFSET;
        let mut len = size.saturating_sub(4);
        if len > available {
            warn!(
                offset = %format!("{:#x}", offset),
                size,
                available,
                "Security descriptor size exceeds its record"
            );
            len = available;
        }

        Ok(SecurityKey {
            prev_offset,
            next_offset,
            ref_count,
            descriptor: data[DESCRIPTOR_OFFSET..DESCRIPTOR_OFFSET + len].to_vec(),
        })
    }

    /// Writes this record into an sk record body.
    pub fn encode(&self, data: &mut [u8]) -> Result<()> {
        write_bytes(data, 0x00, b"sk")?;
        write_u16_le(data, 0x02, 0)?;
        write_u32_le(data, 0x04, self.prev_offset)?;
        write_u32_le(data, 0x08, self.next_offset)?;
        write_u32_le(data, 0x0C, self.ref_count)?;
        write_u32_le(data, 0x10, self.descriptor.len() as u32 + 4)?;
        write_bytes(data, DESCRIPTOR_OFFSET, &self.descriptor)
    }
}

/// Record size of an sk record holding `descriptor_len` bytes.
pub fn security_key_len(descriptor_len: usize) -> u32 {
    align8(4 + DESCRIPTOR_OFFSET as u32 + descriptor_len as u32)
}

/// A descriptor known to the hive.
#[derive(Debug, Clone)]
pub struct SecurityDescriptor {
    /// Offset of its sk record.
    pub offset: u32,

    /// Where the sk record lives.
    pub location: CellLocation,

    /// Reference count.
    pub ref_count: u32,

    /// Opaque descriptor bytes.
    pub descriptor: Vec<u8>,

    dirty: bool,
}

impl SecurityDescriptor {
    /// Returns true if the record must be rewritten.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }
}

impl fmt::Display for SecurityDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "sk@{:#x} refs={} {}",
            self.offset,
            self.ref_count,
            hex::encode(&self.descriptor)
        )
    }
}

/// Every descriptor the hive has seen, in ring order.
#[derive(Debug, Default)]
pub struct SecurityTable {
    entries: Vec<SecurityDescriptor>,
}

impl SecurityTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of descriptors.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no descriptor is known.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Descriptor at `index`.
    pub fn get(&self, index: usize) -> Option<&SecurityDescriptor> {
        self.entries.get(index)
    }

    /// Iterates over all descriptors in ring order.
    pub fn iter(&self) -> impl Iterator<Item = &SecurityDescriptor> {
        self.entries.iter()
    }

    /// Finds a byte-equal descriptor.
    pub fn find_by_bytes(&self, descriptor: &[u8]) -> Option<usize> {
        self.entries.iter().position(|e| e.descriptor == descriptor)
    }

    /// Finds the descriptor whose sk record is at `offset`.
    pub fn find_by_offset(&self, offset: u32) -> Option<usize> {
        self.entries.iter().position(|e| e.offset == offset)
    }

    /// Registers an sk record read from disk. It is not rewritten unless it
    /// changes.
    pub fn insert_loaded(
        &mut self,
        offset: u32,
        location: CellLocation,
        record: SecurityKey,
    ) -> usize {
        self.entries.push(SecurityDescriptor {
            offset,
            location,
            ref_count: record.ref_count,
            descriptor: record.descriptor,
            dirty: false,
        });
        self.entries.len() - 1
    }

    /// Registers a freshly reserved sk record with no references yet.
    ///
    /// Appending changes the ring links of its neighbours, so every record is
    /// marked for rewriting.
    pub fn insert_new(&mut self, offset: u32, location: CellLocation, descriptor: &[u8]) -> usize {
        self.entries.push(SecurityDescriptor {
            offset,
            location,
            ref_count: 0,
            descriptor: descriptor.to_vec(),
            dirty: true,
        });
        for entry in &mut self.entries {
            entry.dirty = true;
        }
        self.entries.len() - 1
    }

    /// Adds a reference to the descriptor at `index`.
    pub fn add_ref(&mut self, index: usize) {
        if let Some(entry) = self.entries.get_mut(index) {
            entry.ref_count = entry.ref_count.saturating_add(1);
            entry.dirty = true;
        }
    }

    /// Records of dirty descriptors, with ring links derived from table order.
    pub fn dirty_records(&self) -> Vec<(CellLocation, SecurityKey)> {
        let n = self.entries.len();
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.dirty)
            .map(|(i, e)| {
                let record = SecurityKey {
                    prev_offset: self.entries[(i + n - 1) % n].offset,
                    next_offset: self.entries[(i + 1) % n].offset,
                    ref_count: e.ref_count,
                    descriptor: e.descriptor.clone(),
                };
                (e.location, record)
            })
            .collect()
    }

    /// Marks every descriptor as written.
    pub fn mark_clean(&mut self) {
        for entry in &mut self.entries {
            entry.dirty = false;
        }
    }
}
