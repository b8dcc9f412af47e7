//! Subkey list codec (lf, lh, li, ri).
//!
//! Registry keys can have multiple subkeys, which are organized in various
//! list structures. Hives produced here only ever contain `lf` lists; the
//! other kinds are understood when reading hives written elsewhere.

use crate::error::{RegistryError, Result};
use crate::utils::{
    align8, compare_names, encode_name, read_u32_le, write_bytes, write_u16_le, write_u32_le,
};

/// Subkey list types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubkeyListType {
    /// Index leaf (li) - simple list of offsets.
    IndexLeaf,

    /// Fast leaf (lf) - list with 4-byte name hints.
    FastLeaf,

    /// Hash leaf (lh) - list with name hash hints.
    HashLeaf,

    /// Index root (ri) - list of subkey list offsets.
    IndexRoot,
}

impl SubkeyListType {
    /// Parses a subkey list type from a 2-byte signature.
    pub fn from_signature(sig: &[u8; 2]) -> Result<Self> {
        match sig {
            b"li" => Ok(SubkeyListType::IndexLeaf),
            b"lf" => Ok(SubkeyListType::FastLeaf),
            b"lh" => Ok(SubkeyListType::HashLeaf),
            b"ri" => Ok(SubkeyListType::IndexRoot),
            _ => Err(RegistryError::InvalidSubkeyList { list_type: *sig }),
        }
    }
}

/// Subkey list entry (for lf/lh lists).
#[derive(Debug, Clone)]
pub struct SubkeyListEntry {
    /// Offset to the key node.
    pub key_offset: u32,

    /// Name hint (first 4 name bytes for lf, hash for lh).
    pub name_hint: u32,
}

/// Parsed subkey list.
#[derive(Debug, Clone)]
pub enum SubkeyList {
    /// Index leaf - simple list of offsets.
    IndexLeaf(Vec<u32>),

    /// Fast leaf or hash leaf - list with hints.
    LeafWithHints(Vec<SubkeyListEntry>),

    /// Index root - list of sublist offsets.
    IndexRoot(Vec<u32>),
}

impl SubkeyList {
    /// Parses a subkey list from cell data.
    ///
    /// # Arguments
    ///
    /// * `data` - Cell data (excluding size field).
    /// * `offset` - Offset of this cell for error reporting.
    pub fn parse(data: &[u8], offset: u32) -> Result<Self> {
        if data.len() < 4 {
            return Err(RegistryError::TruncatedData {
                offset,
                expected: 4,
                actual: data.len(),
            });
        }

        let sig = [data[0], data[1]];
        let list_type = SubkeyListType::from_signature(&sig)?;
        let count = u16::from_le_bytes([data[2], data[3]]) as usize;

        let stride = match list_type {
            SubkeyListType::FastLeaf | SubkeyListType::HashLeaf => 8,
            SubkeyListType::IndexLeaf | SubkeyListType::IndexRoot => 4,
        };
        let expected_size = 4 + count * stride;
        if data.len() < expected_size {
            return Err(RegistryError::TruncatedData {
                offset,
                expected: expected_size,
                actual: data.len(),
            });
        }

        match list_type {
            SubkeyListType::FastLeaf | SubkeyListType::HashLeaf => {
                let mut entries = Vec::with_capacity(count);
                for i in 0..count {
                    let entry_pos = 4 + i * 8;
                    entries.push(SubkeyListEntry {
                        key_offset: read_u32_le(data, entry_pos)?,
                        name_hint: read_u32_le(data, entry_pos + 4)?,
                    });
                }
                Ok(SubkeyList::LeafWithHints(entries))
            }
            SubkeyListType::IndexLeaf | SubkeyListType::IndexRoot => {
                let offsets = (0..count)
                    .map(|i| read_u32_le(data, 4 + i * 4))
                    .collect::<Result<Vec<_>>>()?;
                if list_type == SubkeyListType::IndexRoot {
                    Ok(SubkeyList::IndexRoot(offsets))
                } else {
                    Ok(SubkeyList::IndexLeaf(offsets))
                }
            }
        }
    }

    /// Returns an iterator over the offsets this list holds: key offsets for
    /// leaves, sublist offsets for an index root.
    pub fn key_offsets_iter(&self) -> Box<dyn Iterator<Item = u32> + '_> {
        match self {
            SubkeyList::IndexLeaf(offsets) | SubkeyList::IndexRoot(offsets) => {
                Box::new(offsets.iter().copied())
            }
            SubkeyList::LeafWithHints(entries) => Box::new(entries.iter().map(|e| e.key_offset)),
        }
    }

    /// Returns the number of entries in this list.
    pub fn len(&self) -> usize {
        match self {
            SubkeyList::IndexLeaf(offsets) => offsets.len(),
            SubkeyList::LeafWithHints(entries) => entries.len(),
            SubkeyList::IndexRoot(offsets) => offsets.len(),
        }
    }

    /// Returns true if this list is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true if this is an index root (contains sublists).
    pub fn is_index_root(&self) -> bool {
        matches!(self, SubkeyList::IndexRoot(_))
    }

    /// Converts a leaf into subkey index entries. Names are unknown at this
    /// point and left empty.
    pub fn into_hashes(self) -> Vec<SubkeyHash> {
        match self {
            SubkeyList::LeafWithHints(entries) => entries
                .into_iter()
                .map(|e| SubkeyHash {
                    offset: e.key_offset,
                    check: e.name_hint.to_le_bytes(),
                    name: String::new(),
                })
                .collect(),
            SubkeyList::IndexLeaf(offsets) | SubkeyList::IndexRoot(offsets) => offsets
                .into_iter()
                .map(|offset| SubkeyHash {
                    offset,
                    check: [0; 4],
                    name: String::new(),
                })
                .collect(),
        }
    }
}

/// One entry of a key's in-memory subkey index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubkeyHash {
    /// Offset of the child key.
    pub offset: u32,

    /// Name check bytes stored on disk.
    pub check: [u8; 4],

    /// Full child name, kept in memory only.
    pub name: String,
}

impl SubkeyHash {
    /// Builds the entry for a child called `name` at `offset`.
    pub fn new(offset: u32, name: &str) -> Self {
        Self {
            offset,
            check: name_check(name),
            name: name.to_string(),
        }
    }
}

/// First four bytes of a name as stored on disk, zero padded.
pub fn name_check(name: &str) -> [u8; 4] {
    let (bytes, _) = encode_name(name);
    let mut check = [0u8; 4];
    let len = bytes.len().min(4);
    check[..len].copy_from_slice(&bytes[..len]);
    check
}

/// Sorts index entries by case-insensitive name.
pub fn sort_hashes(entries: &mut [SubkeyHash]) {
    entries.sort_by(|a, b| compare_names(&a.name, &b.name));
}

/// Record size of an `lf` list with room for `capacity` entries.
pub fn fast_leaf_len(capacity: usize) -> u32 {
    align8(4 + 4 + 8 * capacity as u32)
}

/// Number of entries an `lf` record body of `body_len` bytes can hold.
pub fn fast_leaf_capacity(body_len: usize) -> usize {
    body_len.saturating_sub(4) / 8
}

/// Writes an `lf` list into a record body. The count written is the number
/// of entries given, which may be below the record's capacity.
pub fn encode_fast_leaf(data: &mut [u8], entries: &[SubkeyHash]) -> Result<()> {
    let count = u16::try_from(entries.len())
        .map_err(|_| RegistryError::format_error(format!("Too many subkeys: {}", entries.len())))?;

    write_bytes(data, 0, b"lf")?;
    write_u16_le(data, 2, count)?;
    for (i, entry) in entries.iter().enumerate() {
        let pos = 4 + i * 8;
        write_u32_le(data, pos, entry.offset)?;
        write_bytes(data, pos + 4, &entry.check)?;
    }
    Ok(())
}
