//! Utility functions for binary encoding and name conversion.

use crate::error::{RegistryError, Result};
use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};
use encoding_rs::UTF_16LE;
use std::cmp::Ordering;
use std::io::Cursor;

/// Offset where hive bins start (after base block)
pub const HBIN_START_OFFSET: u32 = 0x1000;

/// Sentinel stored in offset fields that point nowhere.
pub const OFFSET_NONE: u32 = 0xFFFF_FFFF;

/// Difference between the FILETIME epoch (1601) and the Unix epoch, in seconds.
const FILETIME_UNIX_DIFF: i64 = 11_644_473_600;

/// Reads a compressed name: one Latin-1 byte per character, null
/// terminators trimmed.
pub fn read_latin1_string(data: &[u8]) -> String {
    data.iter()
        .map(|&b| char::from(b))
        .collect::<String>()
        .trim_end_matches('\0')
        .to_string()
}

/// Reads a UTF-16LE string from a byte slice, trimming null terminators.
///
/// # Errors
///
/// Returns an error if the data length is not even (UTF-16 requires 2-byte units)
/// or if the UTF-16 decoding fails.
pub fn read_utf16_string(data: &[u8], offset: u32) -> Result<String> {
    if data.is_empty() {
        return Ok(String::new());
    }

    if data.len() % 2 != 0 {
        return Err(RegistryError::InvalidUtf16 { offset });
    }

    let (decoded, _encoding, had_errors) = UTF_16LE.decode(data);

    if had_errors {
        return Err(RegistryError::InvalidUtf16 { offset });
    }

    Ok(decoded.trim_end_matches('\0').to_string())
}

/// Encodes a key or value name the way it is stored on disk.
///
/// Names made only of Latin-1 characters are stored one byte per character
/// ("compressed"); anything else is stored as UTF-16LE. Returns the bytes and
/// whether they are compressed.
pub fn encode_name(name: &str) -> (Vec<u8>, bool) {
    let latin1: Option<Vec<u8>> = name.chars().map(|c| u8::try_from(c).ok()).collect();
    match latin1 {
        Some(bytes) => (bytes, true),
        None => {
            let bytes = name.encode_utf16().flat_map(|unit| unit.to_le_bytes()).collect();
            (bytes, false)
        }
    }
}

/// Length of a name in bytes once widened to UTF-16.
///
/// This is what the "max name length" bookkeeping fields of a key count.
pub fn utf16_byte_len(name: &str) -> u32 {
    (name.encode_utf16().count() * 2) as u32
}

/// Orders two names the way the subkey index requires: case-insensitively,
/// by upper-cased characters.
pub fn compare_names(a: &str, b: &str) -> Ordering {
    let upper = |s: &str| s.chars().flat_map(char::to_uppercase).collect::<Vec<_>>();
    if a.is_ascii() && b.is_ascii() {
        a.bytes()
            .map(|c| c.to_ascii_uppercase())
            .cmp(b.bytes().map(|c| c.to_ascii_uppercase()))
    } else {
        upper(a).cmp(&upper(b))
    }
}

/// Reads a u32 from a byte slice at the given offset.
pub fn read_u32_le(data: &[u8], offset: usize) -> Result<u32> {
    if offset + 4 > data.len() {
        return Err(RegistryError::TruncatedData {
            offset: offset as u32,
            expected: 4,
            actual: data.len().saturating_sub(offset),
        });
    }

    let mut cursor = Cursor::new(&data[offset..offset + 4]);
    Ok(cursor.read_u32::<LittleEndian>()?)
}

/// Reads a u16 from a byte slice at the given offset.
pub fn read_u16_le(data: &[u8], offset: usize) -> Result<u16> {
    if offset + 2 > data.len() {
        return Err(RegistryError::TruncatedData {
            offset: offset as u32,
            expected: 2,
            actual: data.len().saturating_sub(offset),
        });
    }

    let mut cursor = Cursor::new(&data[offset..offset + 2]);
    Ok(cursor.read_u16::<LittleEndian>()?)
}

/// Reads a u64 from a byte slice at the given offset.
pub fn read_u64_le(data: &[u8], offset: usize) -> Result<u64> {
    if offset + 8 > data.len() {
        return Err(RegistryError::TruncatedData {
            offset: offset as u32,
            expected: 8,
            actual: data.len().saturating_sub(offset),
        });
    }

    let mut cursor = Cursor::new(&data[offset..offset + 8]);
    Ok(cursor.read_u64::<LittleEndian>()?)
}

/// Writes a u16 into a byte slice at the given offset.
pub fn write_u16_le(data: &mut [u8], offset: usize, value: u16) -> Result<()> {
    check_room(data, offset, 2)?;
    LittleEndian::write_u16(&mut data[offset..offset + 2], value);
    Ok(())
}

/// Writes a u32 into a byte slice at the given offset.
pub fn write_u32_le(data: &mut [u8], offset: usize, value: u32) -> Result<()> {
    check_room(data, offset, 4)?;
    LittleEndian::write_u32(&mut data[offset..offset + 4], value);
    Ok(())
}

/// Writes a u64 into a byte slice at the given offset.
pub fn write_u64_le(data: &mut [u8], offset: usize, value: u64) -> Result<()> {
    check_room(data, offset, 8)?;
    LittleEndian::write_u64(&mut data[offset..offset + 8], value);
    Ok(())
}

/// Copies `bytes` into a byte slice at the given offset.
pub fn write_bytes(data: &mut [u8], offset: usize, bytes: &[u8]) -> Result<()> {
    check_room(data, offset, bytes.len())?;
    data[offset..offset + bytes.len()].copy_from_slice(bytes);
    Ok(())
}

fn check_room(data: &[u8], offset: usize, len: usize) -> Result<()> {
    if offset + len > data.len() {
        return Err(RegistryError::TruncatedData {
            offset: offset as u32,
            expected: len,
            actual: data.len().saturating_sub(offset),
        });
    }
    Ok(())
}

/// Calculates the header checksum: the XOR of every 32-bit word in
/// `[0x0000, 0x01FB)`, i.e. all words before the checksum field at 0x1FC.
pub fn calculate_checksum(data: &[u8]) -> u32 {
    let mut checksum: u32 = 0;

    for i in (0..0x1FB).step_by(4) {
        if let Ok(dword) = read_u32_le(data, i) {
            checksum ^= dword;
        }
    }

    checksum
}

/// Rounds a record length up to the 8-byte record granularity.
#[inline]
pub fn align8(len: u32) -> u32 {
    (len + 7) & !7
}

/// Current time as a Windows FILETIME (100ns ticks since 1601-01-01).
pub fn filetime_now() -> u64 {
    let now = chrono::Utc::now();
    let secs = (now.timestamp() + FILETIME_UNIX_DIFF).max(0) as u64;
    secs * 10_000_000 + u64::from(now.timestamp_subsec_nanos() / 100)
}

/// Converts a Windows FILETIME to a UTC timestamp.
pub fn filetime_to_datetime(filetime: u64) -> Option<chrono::DateTime<chrono::Utc>> {
    let seconds = (filetime / 10_000_000) as i64 - FILETIME_UNIX_DIFF;
    let nanos = ((filetime % 10_000_000) * 100) as u32;

    chrono::DateTime::from_timestamp(seconds, nanos)
}

/// Converts an absolute file offset to an offset relative to the first
/// hbin (at 0x1000).
///
/// # Errors
///
/// Returns `RegistryError::InvalidFormat` if the offset is before the first
/// hbin or does not fit the 32-bit offsets records use.
#[inline]
pub fn absolute_to_cell_offset(absolute_offset: u64) -> Result<u32> {
    absolute_offset
        .checked_sub(u64::from(HBIN_START_OFFSET))
        .and_then(|rel| u32::try_from(rel).ok())
        .ok_or_else(|| {
            RegistryError::InvalidFormat(format!(
                "Absolute offset {:#x} has no record offset",
                absolute_offset
            ))
        })
}
