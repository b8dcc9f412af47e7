//! Record ("cell") tags, size encoding, key flags and value types.
//!
//! Every record in an hbin block starts with a 4-byte size field. A live
//! record stores the bitwise complement of `size - 1` (the two's complement
//! negation of its size); anything else marks free space. [`CellSize`] keeps
//! that distinction as a tagged value and only converts to the bit-level
//! encoding at the serialization boundary.

use crate::error::{RegistryError, Result};

/// Record granularity: every record size is a multiple of this.
pub const CELL_ALIGNMENT: u32 = 8;

/// Marker written after the size field of the trailing free-space record.
pub const FREE_SPACE_MARKER: u32 = 0xFFFF_FFFF;

/// Record type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellType {
    /// Key node (nk) - represents a registry key.
    KeyNode,

    /// Value key (vk) - represents a registry value.
    ValueKey,

    /// Security descriptor (sk).
    Security,

    /// Index leaf (li) - list of subkey offsets.
    IndexLeaf,

    /// Fast leaf (lf) - list of subkeys with name hints.
    FastLeaf,

    /// Hash leaf (lh) - list of subkeys with name hashes.
    HashLeaf,

    /// Index root (ri) - list of subkey list offsets.
    IndexRoot,

    /// Data block (db) - big data block.
    DataBlock,
}

impl CellType {
    /// Parses a record type from a 2-byte tag.
    pub fn from_signature(sig: &[u8; 2]) -> Result<Self> {
        match sig {
            b"nk" => Ok(CellType::KeyNode),
            b"vk" => Ok(CellType::ValueKey),
            b"sk" => Ok(CellType::Security),
            b"li" => Ok(CellType::IndexLeaf),
            b"lf" => Ok(CellType::FastLeaf),
            b"lh" => Ok(CellType::HashLeaf),
            b"ri" => Ok(CellType::IndexRoot),
            b"db" => Ok(CellType::DataBlock),
            _ => Err(RegistryError::unknown_cell_type(*sig, 0)),
        }
    }

    /// Returns the 2-byte tag for this record type.
    pub fn signature(&self) -> &'static [u8; 2] {
        match self {
            CellType::KeyNode => b"nk",
            CellType::ValueKey => b"vk",
            CellType::Security => b"sk",
            CellType::IndexLeaf => b"li",
            CellType::FastLeaf => b"lf",
            CellType::HashLeaf => b"lh",
            CellType::IndexRoot => b"ri",
            CellType::DataBlock => b"db",
        }
    }
}

/// Decoded record size field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellSize {
    /// A live record of the given size in bytes (size field included).
    Used(u32),
    /// Free space of the given size in bytes.
    Free(u32),
}

impl CellSize {
    /// Decodes a raw size field.
    pub fn from_raw(raw: u32) -> Self {
        if raw & 0x8000_0000 != 0 {
            CellSize::Used((raw ^ 0xFFFF_FFFF).wrapping_add(1))
        } else {
            CellSize::Free(raw)
        }
    }

    /// Encodes this size as stored on disk.
    pub fn to_raw(self) -> u32 {
        match self {
            CellSize::Used(size) => size.wrapping_sub(1) ^ 0xFFFF_FFFF,
            CellSize::Free(size) => size,
        }
    }

    /// Size in bytes regardless of state.
    pub fn len(self) -> u32 {
        match self {
            CellSize::Used(size) | CellSize::Free(size) => size,
        }
    }

    /// Returns true for a zero-length record, which no valid hive contains.
    pub fn is_empty(self) -> bool {
        self.len() == 0
    }

    /// Returns true for a live record.
    pub fn is_used(self) -> bool {
        matches!(self, CellSize::Used(_))
    }
}

/// Flags for key nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct KeyNodeFlags(pub u16);

impl KeyNodeFlags {
    /// Key is volatile (not stored on disk).
    pub const VOLATILE: u16 = 0x0001;

    /// Key is a mount point for another hive.
    pub const HIVE_EXIT: u16 = 0x0002;

    /// Key is the root key.
    pub const ROOT_KEY: u16 = 0x0004;

    /// Key cannot be deleted.
    pub const NO_DELETE: u16 = 0x0008;

    /// Key is a symbolic link.
    pub const SYM_LINK: u16 = 0x0010;

    /// Key name is in compressed format (Latin-1).
    pub const COMP_NAME: u16 = 0x0020;

    /// Type written for the root key of a new hive.
    pub const ROOT_KEY_TYPE: u16 = Self::COMP_NAME | Self::NO_DELETE | Self::ROOT_KEY;

    /// Type written for every other key of a new hive.
    pub const NORMAL_KEY_TYPE: u16 = Self::COMP_NAME;

    /// Creates a new KeyNodeFlags from a u16 value.
    pub fn new(flags: u16) -> Self {
        Self(flags)
    }

    /// Returns true if the specified flag is set.
    pub fn has_flag(&self, flag: u16) -> bool {
        (self.0 & flag) != 0
    }

    /// Returns true if the key name is compressed (Latin-1).
    pub fn is_compressed(&self) -> bool {
        self.has_flag(Self::COMP_NAME)
    }

    /// Returns true if this is a volatile key.
    pub fn is_volatile(&self) -> bool {
        self.has_flag(Self::VOLATILE)
    }

    /// Returns true if this is the root key.
    pub fn is_root(&self) -> bool {
        self.has_flag(Self::ROOT_KEY)
    }
}

/// Registry value data types.
///
/// The tag is carried so that values can be copied faithfully; the data bytes
/// themselves are never interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ValueType {
    /// No value type.
    None,

    /// String (null-terminated).
    String,

    /// String with environment variables.
    ExpandString,

    /// Binary data.
    Binary,

    /// 32-bit little-endian integer.
    Dword,

    /// 32-bit big-endian integer.
    DwordBigEndian,

    /// Symbolic link (Unicode).
    Link,

    /// Multiple strings.
    MultiString,

    /// Resource list.
    ResourceList,

    /// Full resource descriptor.
    FullResourceDescriptor,

    /// Resource requirements list.
    ResourceRequirementsList,

    /// 64-bit little-endian integer.
    Qword,

    /// Non-standard value type, carrying the raw tag.
    Unknown(u32),
}

impl ValueType {
    /// Parses a value type from its on-disk tag.
    ///
    /// Tags 0-11 are predefined, but any other tag is allowed as well and is
    /// returned as `ValueType::Unknown`.
    pub fn from_u32(value: u32) -> Self {
        match value {
            0 => ValueType::None,
            1 => ValueType::String,
            2 => ValueType::ExpandString,
            3 => ValueType::Binary,
            4 => ValueType::Dword,
            5 => ValueType::DwordBigEndian,
            6 => ValueType::Link,
            7 => ValueType::MultiString,
            8 => ValueType::ResourceList,
            9 => ValueType::FullResourceDescriptor,
            10 => ValueType::ResourceRequirementsList,
            11 => ValueType::Qword,
            _ => ValueType::Unknown(value),
        }
    }

    /// Returns the on-disk tag of this value type.
    pub fn to_u32(self) -> u32 {
        match self {
            ValueType::None => 0,
            ValueType::String => 1,
            ValueType::ExpandString => 2,
            ValueType::Binary => 3,
            ValueType::Dword => 4,
            ValueType::DwordBigEndian => 5,
            ValueType::Link => 6,
            ValueType::MultiString => 7,
            ValueType::ResourceList => 8,
            ValueType::FullResourceDescriptor => 9,
            ValueType::ResourceRequirementsList => 10,
            ValueType::Qword => 11,
            ValueType::Unknown(value) => value,
        }
    }

    /// Returns the name of this value type.
    pub fn name(&self) -> String {
        match self {
            ValueType::None => "REG_NONE".to_string(),
            ValueType::String => "REG_SZ".to_string(),
            ValueType::ExpandString => "REG_EXPAND_SZ".to_string(),
            ValueType::Binary => "REG_BINARY".to_string(),
            ValueType::Dword => "REG_DWORD".to_string(),
            ValueType::DwordBigEndian => "REG_DWORD_BIG_ENDIAN".to_string(),
            ValueType::Link => "REG_LINK".to_string(),
            ValueType::MultiString => "REG_MULTI_SZ".to_string(),
            ValueType::ResourceList => "REG_RESOURCE_LIST".to_string(),
            ValueType::FullResourceDescriptor => "REG_FULL_RESOURCE_DESCRIPTOR".to_string(),
            ValueType::ResourceRequirementsList => "REG_RESOURCE_REQUIREMENTS_LIST".to_string(),
            ValueType::Qword => "REG_QWORD".to_string(),
            ValueType::Unknown(value) => format!("REG_UNKNOWN_{:#010x}", value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cell_type_from_signature() {
        assert_eq!(CellType::from_signature(b"nk").unwrap(), CellType::KeyNode);
        assert_eq!(CellType::from_signature(b"vk").unwrap(), CellType::ValueKey);
        assert_eq!(CellType::from_signature(b"lf").unwrap(), CellType::FastLeaf);
        assert!(CellType::from_signature(b"zz").is_err());
    }

    #[test]
    fn test_cell_size_encoding() {
        // A 0x58-byte live record is stored as -0x58.
        assert_eq!(CellSize::Used(0x58).to_raw(), 0xFFFF_FFA8);
        assert_eq!(CellSize::from_raw(0xFFFF_FFA8), CellSize::Used(0x58));
        assert_eq!(CellSize::Used(0x58).to_raw(), (-0x58i32) as u32);

        assert_eq!(CellSize::from_raw(0x0FE0), CellSize::Free(0x0FE0));
        assert!(!CellSize::from_raw(0x0FE0).is_used());
        assert!(CellSize::from_raw(0).is_empty());
    }

    #[test]
    fn test_key_node_flags() {
        let flags = KeyNodeFlags::new(KeyNodeFlags::ROOT_KEY_TYPE);
        assert_eq!(flags.0, 0x2C);
        assert!(flags.is_compressed());
        assert!(flags.is_root());
        assert!(!flags.is_volatile());
        assert!(!KeyNodeFlags::new(KeyNodeFlags::NORMAL_KEY_TYPE).is_root());
    }

    #[test]
    fn test_value_type() {
        assert_eq!(ValueType::from_u32(1), ValueType::String);
        assert_eq!(ValueType::from_u32(4), ValueType::Dword);
        assert_eq!(ValueType::from_u32(0x1234), ValueType::Unknown(0x1234));
        assert_eq!(ValueType::Unknown(0x1234).to_u32(), 0x1234);
        assert_eq!(ValueType::Qword.to_u32(), 11);
        assert_eq!(ValueType::String.name(), "REG_SZ");
    }
}
