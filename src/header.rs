//! Registry hive base block (header) codec.
//!
//! The base block is the first 4096 bytes (0x1000) of a hive file. Only a
//! handful of its fields matter to this crate; everything else is carried
//! through byte-for-byte so that rewriting the header never loses data.

use crate::error::{RegistryError, Result};
use crate::hbin::HBIN_HEADER_SIZE;
use crate::utils::{
    calculate_checksum, filetime_now, filetime_to_datetime, read_u32_le, read_u64_le,
    read_utf16_string, HBIN_START_OFFSET,
};
use byteorder::{ByteOrder, LittleEndian};
use std::fmt;
use tracing::warn;

/// Size of the base block in bytes.
pub const BASE_BLOCK_SIZE: usize = 4096;

/// Expected signature for a valid registry hive ("regf").
pub const REGF_SIGNATURE: &[u8; 4] = b"regf";

/// Offset of the checksum field in the base block.
pub const CHECKSUM_OFFSET: usize = 0x1FC;

/// Offset of the embedded file name.
const FILE_NAME_OFFSET: usize = 0x30;

/// Length of the embedded file name field.
const FILE_NAME_LENGTH: usize = 128;

/// Registry hive base block header.
#[derive(Debug, Clone)]
pub struct BaseBlock {
    /// Signature, should be "regf".
    pub signature: [u8; 4],

    /// Sequence number. Stored twice (0x04 and 0x08); both copies are written
    /// identically.
    pub primary_sequence: u32,

    /// Second copy of the sequence number as read from disk.
    pub secondary_sequence: u32,

    /// Last written timestamp (Windows FILETIME).
    pub last_written: u64,

    /// Major version of the hive format.
    pub major_version: u32,

    /// Minor version of the hive format.
    pub minor_version: u32,

    /// File type (0 = normal hive).
    pub file_type: u32,

    /// File format (1 = direct memory load).
    pub file_format: u32,

    /// Offset of the first record within a block.
    pub data_offset: u32,

    /// Absolute file offset of the last hbin block.
    pub last_block: u32,

    /// Clustering factor (always 1).
    pub clustering_factor: u32,

    /// Checksum (XOR of the words before 0x1FC).
    pub checksum: u32,

    /// The full 4096 header bytes, kept so that opaque fields round-trip.
    raw: Vec<u8>,
}

impl BaseBlock {
    /// Builds the header of a freshly created hive.
    pub fn new() -> Self {
        let mut raw = vec![0u8; BASE_BLOCK_SIZE];
        raw[0..4].copy_from_slice(REGF_SIGNATURE);

        let mut block = BaseBlock {
            signature: *REGF_SIGNATURE,
            primary_sequence: 2,
            secondary_sequence: 2,
            last_written: filetime_now(),
            major_version: 1,
            minor_version: 3,
            file_type: 0,
            file_format: 1,
            data_offset: HBIN_HEADER_SIZE as u32,
            last_block: HBIN_START_OFFSET,
            clustering_factor: 1,
            checksum: 0,
            raw,
        };
        block.checksum = calculate_checksum(&block.encode_fields());
        block
    }

    /// Parses and verifies a base block from raw bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Data is too small
    /// - Signature is invalid
    /// - Checksum doesn't match
    /// - Major version is not 1
    pub fn parse(data: &[u8]) -> Result<Self> {
        Self::parse_with(data, true)
    }

    /// Parses a base block, optionally skipping checksum verification.
    ///
    /// A skipped verification still logs a mismatch.
    pub fn parse_with(data: &[u8], verify_checksum: bool) -> Result<Self> {
        if data.len() < BASE_BLOCK_SIZE {
            return Err(RegistryError::HiveTooSmall {
                size: data.len() as u64,
                minimum: BASE_BLOCK_SIZE as u64,
            });
        }

        let mut signature = [0u8; 4];
        signature.copy_from_slice(&data[0..4]);

        if &signature != REGF_SIGNATURE {
            return Err(RegistryError::invalid_signature(REGF_SIGNATURE, &signature));
        }

        let primary_sequence = read_u32_le(data, 0x04)?;
        let secondary_sequence = read_u32_le(data, 0x08)?;
        let last_written = read_u64_le(data, 0x0C)?;
        let major_version = read_u32_le(data, 0x14)?;
        let minor_version = read_u32_le(data, 0x18)?;
        let file_type = read_u32_le(data, 0x1C)?;
        let file_format = read_u32_le(data, 0x20)?;
        let data_offset = read_u32_le(data, 0x24)?;
        let last_block = read_u32_le(data, 0x28)?;
        let clustering_factor = read_u32_le(data, 0x2C)?;
        let checksum = read_u32_le(data, CHECKSUM_OFFSET)?;

        let calculated = calculate_checksum(data);
        if checksum != calculated {
            if verify_checksum {
                return Err(RegistryError::ChecksumMismatch {
                    expected: checksum,
                    calculated,
                });
            }
            warn!(
                expected = %format!("{:#x}", checksum),
                calculated = %format!("{:#x}", calculated),
                "Ignoring header checksum mismatch"
            );
        }

        if major_version != 1 {
            return Err(RegistryError::UnsupportedVersion {
                major: major_version,
                minor: minor_version,
            });
        }
        if !(3..=6).contains(&minor_version) {
            warn!(
                major_version,
                minor_version, "Unusual hive version, reading anyway"
            );
        }

        if primary_sequence != secondary_sequence {
            warn!(
                primary_sequence,
                secondary_sequence, "Header sequence numbers disagree"
            );
        }

        Ok(BaseBlock {
            signature,
            primary_sequence,
            secondary_sequence,
            last_written,
            major_version,
            minor_version,
            file_type,
            file_format,
            data_offset,
            last_block,
            clustering_factor,
            checksum,
            raw: data[..BASE_BLOCK_SIZE].to_vec(),
        })
    }

    /// Re-stamps the modification time with the current time.
    pub fn stamp(&mut self) {
        self.last_written = filetime_now();
    }

    /// Serializes the header, recomputing and storing the checksum.
    ///
    /// Opaque bytes from the parsed (or freshly built) header are preserved.
    pub fn to_bytes(&mut self) -> Vec<u8> {
        let mut data = self.encode_fields();
        self.checksum = calculate_checksum(&data);
        data[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4].copy_from_slice(&self.checksum.to_le_bytes());
        self.raw.clone_from(&data);
        data
    }

    fn encode_fields(&self) -> Vec<u8> {
        let mut data = self.raw.clone();
        data[0..4].copy_from_slice(&self.signature);

        let words = [
            (0x04, self.primary_sequence),
            (0x08, self.primary_sequence),
            (0x14, self.major_version),
            (0x18, self.minor_version),
            (0x1C, self.file_type),
            (0x20, self.file_format),
            (0x24, self.data_offset),
            (0x28, self.last_block),
            (0x2C, self.clustering_factor),
            (CHECKSUM_OFFSET, self.checksum),
        ];
        for (offset, value) in words {
            LittleEndian::write_u32(&mut data[offset..offset + 4], value);
        }
        LittleEndian::write_u64(&mut data[0x0C..0x14], self.last_written);
        data
    }

    /// Returns true if the hive is in a consistent state.
    ///
    /// The hive is consistent when both copies of the sequence number match.
    pub fn is_consistent(&self) -> bool {
        self.primary_sequence == self.secondary_sequence
    }

    /// Returns true if values larger than 16,344 bytes are stored through
    /// big-data (`db`) records in this hive version.
    pub fn supports_big_data(&self) -> bool {
        self.major_version == 1 && self.minor_version >= 4
    }

    /// File name embedded in the header (UTF-16LE, up to the first null).
    pub fn file_name(&self) -> Result<String> {
        let raw = &self.raw[FILE_NAME_OFFSET..FILE_NAME_OFFSET + FILE_NAME_LENGTH];
        let name = read_utf16_string(raw, FILE_NAME_OFFSET as u32)?;
        Ok(name.split('\0').next().unwrap_or_default().to_string())
    }

    /// Converts the last written timestamp to a human-readable format.
    pub fn last_written_datetime(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        filetime_to_datetime(self.last_written)
    }
}

impl Default for BaseBlock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BaseBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Registry Hive Header:\n\
             - Version: {}.{}\n\
             - Data Offset: {:#x}\n\
             - Last Block: {:#x}\n\
             - Consistent: {}\n\
             - Checksum: {:#010x}",
            self.major_version,
            self.minor_version,
            self.data_offset,
            self.last_block,
            self.is_consistent(),
            self.checksum
        )
    }
}
