//! Registry key node (nk) codec.

use crate::cell::KeyNodeFlags;
use crate::error::{RegistryError, Result};
use crate::utils::{
    align8, encode_name, filetime_now, read_latin1_string, read_u16_le, read_u32_le,
    read_u64_le, read_utf16_string, write_bytes, write_u16_le, write_u32_le, write_u64_le,
    OFFSET_NONE,
};
use tracing::debug;

/// Minimum size of a key node structure in bytes.
const KEY_NODE_MIN_SIZE: usize = 76;

/// Offset of the key name in the key node structure.
const KEY_NAME_OFFSET: usize = 0x4C;

/// Key node (nk) structure.
///
/// Represents a registry key with metadata including name, timestamps,
/// and references to subkeys and values.
#[derive(Debug, Clone)]
pub struct KeyNode {
    /// Flags for this key.
    pub flags: KeyNodeFlags,

    /// Last written timestamp (Windows FILETIME).
    pub last_written: u64,

    /// Access bits (unused).
    pub access_bits: u32,

    /// Offset to parent key node.
    pub parent_offset: u32,

    /// Number of subkeys.
    pub subkey_count: u32,

    /// Number of volatile subkeys.
    pub volatile_subkey_count: u32,

    /// Offset to subkey list.
    pub subkey_list_offset: u32,

    /// Offset to volatile subkey list.
    pub volatile_subkey_list_offset: u32,

    /// Number of values.
    pub value_count: u32,

    /// Offset to value list.
    pub value_list_offset: u32,

    /// Offset to security descriptor.
    pub security_offset: u32,

    /// Offset to class name.
    pub class_name_offset: u32,

    /// Maximum length of subkey name, in UTF-16 bytes.
    pub max_subkey_name_len: u32,

    /// Maximum length of subkey class name.
    pub max_subkey_class_len: u32,

    /// Maximum length of value name, in UTF-16 bytes.
    pub max_value_name_len: u32,

    /// Maximum length of value data.
    pub max_value_data_len: u32,

    /// Unknown index field.
    pub work_var: u32,

    /// Length of class name.
    pub class_name_length: u16,

    /// Key name.
    pub name: String,
}

impl KeyNode {
    /// Builds a key node with no subkeys, values or security descriptor.
    pub fn new(name: &str, flags: u16, parent_offset: u32) -> Self {
        KeyNode {
            flags: KeyNodeFlags::new(flags),
            last_written: filetime_now(),
            access_bits: 0,
            parent_offset,
            subkey_count: 0,
            volatile_subkey_count: 0,
            subkey_list_offset: OFFSET_NONE,
            volatile_subkey_list_offset: OFFSET_NONE,
            value_count: 0,
            value_list_offset: OFFSET_NONE,
            security_offset: OFFSET_NONE,
            class_name_offset: OFFSET_NONE,
            max_subkey_name_len: 0,
            max_subkey_class_len: 0,
            max_value_name_len: 0,
            max_value_data_len: 0,
            work_var: 0,
            class_name_length: 0,
            name: name.to_string(),
        }
    }

    /// Parses a key node from cell data.
    ///
    /// # Arguments
    ///
    /// * `data` - Cell data (excluding size field, starting with "nk" signature).
    /// * `offset` - Offset of this cell for error reporting.
    ///
    /// # Errors
    ///
    /// Returns an error if the data is malformed or truncated. A record larger
    /// than its contents need is accepted and logged.
    pub fn parse(data: &[u8], offset: u32) -> Result<Self> {
        if data.len() < KEY_NODE_MIN_SIZE {
            return Err(RegistryError::TruncatedData {
                offset,
                expected: KEY_NODE_MIN_SIZE,
                actual: data.len(),
            });
        }

        if &data[0..2] != b"nk" {
            return Err(RegistryError::unknown_cell_type([data[0], data[1]], offset));
        }

        let flags = KeyNodeFlags::new(read_u16_le(data, 0x02)?);
        let last_written = read_u64_le(data, 0x04)?;
        let access_bits = read_u32_le(data, 0x0C)?;
        let parent_offset = read_u32_le(data, 0x10)?;
        let subkey_count = read_u32_le(data, 0x14)?;
        let volatile_subkey_count = read_u32_le(data, 0x18)?;
        let subkey_list_offset = read_u32_le(data, 0x1C)?;
        let volatile_subkey_list_offset = read_u32_le(data, 0x20)?;
        let value_count = read_u32_le(data, 0x24)?;
        let value_list_offset = read_u32_le(data, 0x28)?;
        let security_offset = read_u32_le(data, 0x2C)?;
        let class_name_offset = read_u32_le(data, 0x30)?;

        let max_subkey_name_len = read_u32_le(data, 0x34)?;
        let max_subkey_class_len = read_u32_le(data, 0x38)?;
        let max_value_name_len = read_u32_le(data, 0x3C)?;
        let max_value_data_len = read_u32_le(data, 0x40)?;
        let work_var = read_u32_le(data, 0x44)?;

        let name_length = read_u16_le(data, 0x48)? as usize;
        let class_name_length = read_u16_le(data, 0x4A)?;

        let name_end = KEY_NAME_OFFSET + name_length;
        if name_end > data.len() {
            return Err(RegistryError::TruncatedData {
                offset,
                expected: name_end,
                actual: data.len(),
            });
        }

        let name_data = &data[KEY_NAME_OFFSET..name_end];
        let name = if flags.is_compressed() {
            read_latin1_string(name_data)
        } else {
            read_utf16_string(name_data, offset)?
        };

        let consumed = align8(4 + name_end as u32);
        let declared = data.len() as u32 + 4;
        if declared != consumed {
            debug!(
                offset = %format!("{:#x}", offset),
                declared,
                consumed,
                "Encountered reused key record"
            );
        }

        Ok(KeyNode {
            flags,
            last_written,
            access_bits,
            parent_offset,
            subkey_count,
            volatile_subkey_count,
            subkey_list_offset,
            volatile_subkey_list_offset,
            value_count,
            value_list_offset,
            security_offset,
            class_name_offset,
            max_subkey_name_len,
            max_subkey_class_len,
            max_value_name_len,
            max_value_data_len,
            work_var,
            class_name_length,
            name,
        })
    }

    /// Record size needed to store this key, size field included.
    pub fn encoded_len(&self) -> u32 {
        let (name, _) = encode_name(&self.name);
        align8(4 + KEY_NAME_OFFSET as u32 + name.len() as u32)
    }

    /// Writes this key into a record body of at least
    /// `encoded_len() - 4` bytes.
    ///
    /// The compressed-name flag is set or cleared to match the encoding the
    /// name needs. Class names are never written.
    pub fn encode(&self, data: &mut [u8]) -> Result<()> {
        let (name, compressed) = encode_name(&self.name);
        let name_len = u16::try_from(name.len()).map_err(|_| RegistryError::NameTooLong {
            len: name.len(),
            max: u16::MAX as usize,
        })?;

        let flags = if compressed {
            self.flags.0 | KeyNodeFlags::COMP_NAME
        } else {
            self.flags.0 & !KeyNodeFlags::COMP_NAME
        };

        write_bytes(data, 0x00, b"nk")?;
        write_u16_le(data, 0x02, flags)?;
        write_u64_le(data, 0x04, self.last_written)?;

        let fields = [
            (0x0C, self.access_bits),
            (0x10, self.parent_offset),
            (0x14, self.subkey_count),
            (0x18, self.volatile_subkey_count),
            (0x1C, self.subkey_list_offset),
            (0x20, OFFSET_NONE),
            (0x24, self.value_count),
            (0x28, self.value_list_offset),
            (0x2C, self.security_offset),
            (0x30, OFFSET_NONE),
            (0x34, self.max_subkey_name_len),
            (0x38, self.max_subkey_class_len),
            (0x3C, self.max_value_name_len),
            (0x40, self.max_value_data_len),
            (0x44, self.work_var),
        ];
        for (at, value) in fields {
            write_u32_le(data, at, value)?;
        }

        write_u16_le(data, 0x48, name_len)?;
        write_u16_le(data, 0x4A, 0)?;
        write_bytes(data, KEY_NAME_OFFSET, &name)
    }

    /// Returns true if this key has subkeys.
    pub fn has_subkeys(&self) -> bool {
        self.subkey_count > 0 && self.subkey_list_offset != OFFSET_NONE
    }

    /// Returns true if this key has values.
    pub fn has_values(&self) -> bool {
        self.value_count > 0 && self.value_list_offset != OFFSET_NONE
    }

    /// Returns true if this is the root key.
    pub fn is_root(&self) -> bool {
        self.flags.is_root()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_node_minimum_size() {
        let data = vec![0u8; 75];
        let result = KeyNode::parse(&data, 0);
        assert!(result.is_err());
    }

    #[test]
    fn test_key_node_invalid_signature() {
        let mut data = vec![0u8; 80];
        data[0..2].copy_from_slice(b"XX");
        let result = KeyNode::parse(&data, 0);
        assert!(matches!(result, Err(RegistryError::UnknownCellType { .. })));
    }

    #[test]
    fn test_encode_then_parse() {
        let mut node = KeyNode::new("Software", KeyNodeFlags::NORMAL_KEY_TYPE, 0x20);
        node.subkey_count = 3;
        node.subkey_list_offset = 0x200;
        node.max_value_data_len = 12;

        assert_eq!(node.encoded_len(), 0x58);
        let mut body = vec![0u8; node.encoded_len() as usize - 4];
        node.encode(&mut body).unwrap();

        let parsed = KeyNode::parse(&body, 0x78).unwrap();
        assert_eq!(parsed.name, "Software");
        assert_eq!(parsed.parent_offset, 0x20);
        assert_eq!(parsed.subkey_count, 3);
        assert_eq!(parsed.subkey_list_offset, 0x200);
        assert_eq!(parsed.value_list_offset, OFFSET_NONE);
        assert_eq!(parsed.security_offset, OFFSET_NONE);
        assert_eq!(parsed.max_value_data_len, 12);
        assert_eq!(parsed.last_written, node.last_written);
        assert!(parsed.has_subkeys());
        assert!(!parsed.has_values());
        assert!(!parsed.is_root());
    }

    #[test]
    fn test_latin1_name_is_compressed() {
        let node = KeyNode::new("Schlüssel", KeyNodeFlags::NORMAL_KEY_TYPE, 0x20);
        assert_eq!(node.encoded_len(), align8(4 + 0x4C + 9));
        let mut body = vec![0u8; node.encoded_len() as usize - 4];
        node.encode(&mut body).unwrap();
        assert_eq!(body[KEY_NAME_OFFSET + 4], 0xFC);

        let parsed = KeyNode::parse(&body, 0x20).unwrap();
        assert!(parsed.flags.is_compressed());
        assert_eq!(parsed.name, "Schlüssel");
    }

    #[test]
    fn test_wide_name_is_utf16() {
        let node = KeyNode::new("Ключ", KeyNodeFlags::ROOT_KEY_TYPE, OFFSET_NONE);
        let mut body = vec![0u8; node.encoded_len() as usize - 4];
        node.encode(&mut body).unwrap();

        let parsed = KeyNode::parse(&body, 0x20).unwrap();
        assert!(!parsed.flags.is_compressed());
        assert!(parsed.is_root());
        assert_eq!(parsed.name, "Ключ");
    }

    #[test]
    fn test_oversized_record_is_tolerated() {
        let node = KeyNode::new("Run", KeyNodeFlags::NORMAL_KEY_TYPE, 0x20);
        let mut body = vec![0u8; 0x100];
        node.encode(&mut body).unwrap();
        assert_eq!(KeyNode::parse(&body, 0x20).unwrap().name, "Run");
    }
}
