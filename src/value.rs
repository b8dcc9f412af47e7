//! Registry value (vk) codec, value lists and out-of-line data records.

use crate::cell::ValueType;
use crate::error::{RegistryError, Result};
use crate::utils::{
    align8, encode_name, read_latin1_string, read_u16_le, read_u32_le, read_utf16_string,
    write_bytes, write_u16_le, write_u32_le, OFFSET_NONE,
};
use tracing::debug;

/// Minimum size of a value key structure in bytes.
const VALUE_KEY_MIN_SIZE: usize = 20;

/// Offset of the value name in the value key structure.
const VALUE_NAME_OFFSET: usize = 0x14;

/// High bit of the data size: the data lives in the offset field itself.
pub const DATA_INLINE: u32 = 0x8000_0000;

/// Largest data length that can be stored inline.
pub const MAX_INLINE_DATA: usize = 4;

/// VK flag: a name is present, stored compressed (one Latin-1 byte per
/// character).
pub const VALUE_COMP_NAME: u16 = 0x0001;

/// Value key (vk) structure.
///
/// Represents a registry value with its name, type, and data location.
#[derive(Debug, Clone)]
pub struct ValueKey {
    /// Length of data, with the inline bit stripped.
    pub data_length: u32,

    /// Offset to value data, or the data itself when inline.
    pub data_offset: u32,

    /// True if the data is stored in `data_offset`.
    pub inline: bool,

    /// Value data type.
    pub data_type: ValueType,

    /// Flags (0x0001 = name is compressed).
    pub flags: u16,

    /// Value name. Empty for the default value.
    pub name: String,
}

impl ValueKey {
    /// Builds a value key for `value`, with its data either inline or at
    /// `data_offset`.
    pub fn new(value: &Value, data_offset: u32) -> Self {
        let inline = value.data.len() <= MAX_INLINE_DATA;
        let data_offset = if inline {
            let mut word = [0u8; 4];
            word[..value.data.len()].copy_from_slice(&value.data);
            u32::from_le_bytes(word)
        } else {
            data_offset
        };

        ValueKey {
            data_length: value.data.len() as u32,
            data_offset,
            inline,
            data_type: value.value_type,
            flags: 0,
            name: value.name.clone(),
        }
    }

    /// Parses a value key from cell data.
    ///
    /// # Arguments
    ///
    /// * `data` - Cell data (excluding size field, starting with "vk" signature).
    /// * `offset` - Offset of this cell for error reporting.
    ///
    /// # Errors
    ///
    /// Returns an error if the data is malformed or truncated.
    pub fn parse(data: &[u8], offset: u32) -> Result<Self> {
        if data.len() < VALUE_KEY_MIN_SIZE {
            return Err(RegistryError::TruncatedData {
                offset,
                expected: VALUE_KEY_MIN_SIZE,
                actual: data.len(),
            });
        }

        if &data[0..2] != b"vk" {
            return Err(RegistryError::unknown_cell_type([data[0], data[1]], offset));
        }

        let name_length = read_u16_le(data, 0x02)? as usize;
        let data_length_raw = read_u32_le(data, 0x04)?;
        let data_offset = read_u32_le(data, 0x08)?;
        let data_type = ValueType::from_u32(read_u32_le(data, 0x0C)?);
        let flags = read_u16_le(data, 0x10)?;

        let name_end = VALUE_NAME_OFFSET + name_length;
        if name_end > data.len() {
            return Err(RegistryError::TruncatedData {
                offset,
                expected: name_end,
                actual: data.len(),
            });
        }

        let name_data = &data[VALUE_NAME_OFFSET..name_end];
        let name = if name_length == 0 {
            String::new()
        } else if flags & VALUE_COMP_NAME != 0 {
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
                "Encountered reused value record"
            );
        }

        Ok(ValueKey {
            data_length: data_length_raw & !DATA_INLINE,
            data_offset,
            inline: data_length_raw & DATA_INLINE != 0,
            data_type,
            flags,
            name,
        })
    }

    /// Record size needed to store this value key, size field included.
    pub fn encoded_len(&self) -> u32 {
        let (name, _) = encode_name(&self.name);
        align8(4 + VALUE_NAME_OFFSET as u32 + name.len() as u32)
    }

    /// Writes this value key into a record body.
    pub fn encode(&self, data: &mut [u8]) -> Result<()> {
        let (name, compressed) = encode_name(&self.name);
        let name_len = u16::try_from(name.len()).map_err(|_| RegistryError::NameTooLong {
            len: name.len(),
            max: u16::MAX as usize,
        })?;

        let flags = if !name.is_empty() && compressed {
            VALUE_COMP_NAME
        } else {
            0
        };
        let size = if self.inline {
            self.data_length | DATA_INLINE
        } else {
            self.data_length
        };

        write_bytes(data, 0x00, b"vk")?;
        write_u16_le(data, 0x02, name_len)?;
        write_u32_le(data, 0x04, size)?;
        write_u32_le(data, 0x08, self.data_offset)?;
        write_u32_le(data, 0x0C, self.data_type.to_u32())?;
        write_u16_le(data, 0x10, flags)?;
        write_u16_le(data, 0x12, 0)?;
        write_bytes(data, VALUE_NAME_OFFSET, &name)
    }

    /// Returns true if the data is stored inline (in the data_offset field).
    pub fn is_inline_data(&self) -> bool {
        self.inline
    }

    /// Returns true if the value has no data at all.
    pub fn has_no_data(&self) -> bool {
        self.data_length == 0 || (!self.inline && self.data_offset == OFFSET_NONE)
    }

    /// Extracts inline data, truncated to the declared length.
    pub fn inline_data(&self) -> Vec<u8> {
        let bytes = self.data_offset.to_le_bytes();
        let len = (self.data_length as usize).min(MAX_INLINE_DATA);
        bytes[..len].to_vec()
    }
}

/// A value as handed to the writer and returned by the navigator.
///
/// The data bytes are carried verbatim and never interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Value {
    /// Value name; empty for the key's default value.
    pub name: String,

    /// Type tag.
    pub value_type: ValueType,

    /// Raw data.
    pub data: Vec<u8>,
}

impl Value {
    /// Creates a value.
    pub fn new(name: impl Into<String>, value_type: ValueType, data: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            value_type,
            data: data.into(),
        }
    }

    /// Returns true for the unnamed default value.
    pub fn is_default(&self) -> bool {
        self.name.is_empty()
    }
}

/// Record size of a value list with `count` entries.
pub fn value_list_len(count: usize) -> u32 {
    align8(4 + 4 * count as u32)
}

/// Parses the value offsets out of a value list record body.
pub fn parse_value_list(data: &[u8], count: usize, offset: u32) -> Result<Vec<u32>> {
    if data.len() < count * 4 {
        return Err(RegistryError::TruncatedData {
            offset,
            expected: count * 4,
            actual: data.len(),
        });
    }

    (0..count).map(|i| read_u32_le(data, i * 4)).collect()
}

/// Writes value offsets into a value list record body.
pub fn encode_value_list(data: &mut [u8], offsets: &[u32]) -> Result<()> {
    for (i, &value_offset) in offsets.iter().enumerate() {
        write_u32_le(data, i * 4, value_offset)?;
    }
    Ok(())
}

/// Record size of an out-of-line data blob of `len` bytes.
pub fn data_cell_len(len: usize) -> u32 {
    align8(4 + len as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_key_minimum_size() {
        let data = vec![0u8; 19];
        let result = ValueKey::parse(&data, 0);
        assert!(result.is_err());
    }

    #[test]
    fn test_value_key_invalid_signature() {
        let mut data = vec![0u8; 24];
        data[0..2].copy_from_slice(b"XX");
        let result = ValueKey::parse(&data, 0);
        assert!(result.is_err());
    }

    #[test]
    fn test_inline_data() {
        let mut data = vec![0u8; 24];
        data[0..2].copy_from_slice(b"vk");
        // Two bytes of inline data.
        data[4..8].copy_from_slice(&(2 | DATA_INLINE).to_le_bytes());
        data[8..12].copy_from_slice(&[0x01, 0x02, 0x03, 0x04]);

        let vk = ValueKey::parse(&data, 0).unwrap();
        assert!(vk.is_inline_data());
        assert_eq!(vk.data_length, 2);
        assert_eq!(vk.inline_data(), vec![0x01, 0x02]);
        assert!(vk.name.is_empty());
    }

    #[test]
    fn test_encode_then_parse() {
        let value = Value::new("Version", ValueType::String, b"1\x00.\x000\x00\x00\x00".to_vec());
        let vk = ValueKey::new(&value, 0x400);
        assert!(!vk.is_inline_data());
        assert_eq!(vk.encoded_len(), align8(4 + 0x14 + 7));

        let mut body = vec![0u8; vk.encoded_len() as usize - 4];
        vk.encode(&mut body).unwrap();

        let parsed = ValueKey::parse(&body, 0x100).unwrap();
        assert_eq!(parsed.name, "Version");
        assert_eq!(parsed.flags, VALUE_COMP_NAME);
        assert_eq!(parsed.data_type, ValueType::String);
        assert_eq!(parsed.data_length, 8);
        assert_eq!(parsed.data_offset, 0x400);
        assert!(!parsed.is_inline_data());
    }

    #[test]
    fn test_default_value_small_data() {
        let value = Value::new("", ValueType::Dword, vec![0x2A, 0, 0, 0]);
        assert!(value.is_default());

        let vk = ValueKey::new(&value, OFFSET_NONE);
        let mut body = vec![0u8; vk.encoded_len() as usize - 4];
        vk.encode(&mut body).unwrap();

        assert_eq!(read_u32_le(&body, 0x04).unwrap(), 4 | DATA_INLINE);
        let parsed = ValueKey::parse(&body, 0).unwrap();
        assert_eq!(parsed.flags, 0);
        assert!(parsed.name.is_empty());
        assert_eq!(parsed.inline_data(), vec![0x2A, 0, 0, 0]);
    }

    #[test]
    fn test_value_list() {
        assert_eq!(value_list_len(1), 8);
        assert_eq!(value_list_len(2), 16);

        let mut body = vec![0u8; value_list_len(3) as usize - 4];
        encode_value_list(&mut body, &[0x20, 0x80, 0x1020]).unwrap();
        assert_eq!(parse_value_list(&body, 3, 0).unwrap(), vec![0x20, 0x80, 0x1020]);
        assert!(parse_value_list(&body, 5, 0).is_err());
    }
}
