//! Error types for hive operations.
//!
//! Errors fall into four groups: I/O failures from the underlying file,
//! format corruption (bad signatures, checksum mismatches, unexpected record
//! types), resource exhaustion when the hive cannot grow any further, and
//! misuse of a handle (writing through a read-only hive, overfilling a subkey
//! index). Soft inconsistencies that real-world hives are known to contain are
//! never reported here; they are logged through `tracing` instead.

use std::io;
use thiserror::Error;

/// Result type alias for hive operations.
pub type Result<T> = std::result::Result<T, RegistryError>;

/// Errors that can occur while reading or writing a hive.
#[derive(Error, Debug)]
pub enum RegistryError {
    /// I/O error from the underlying hive file.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A read extended past the end of the hive file.
    #[error("Read past end of file: {len} bytes at {offset:#x} (file size: {size:#x})")]
    ReadPastEnd {
        /// Absolute file offset of the read.
        offset: u64,
        /// Number of bytes requested.
        len: usize,
        /// Current file size.
        size: u64,
    },

    /// Invalid magic signature in header or structure.
    #[error("Invalid signature: expected {expected:?}, found {found:?}")]
    InvalidSignature {
        /// Signature the format requires.
        expected: Vec<u8>,
        /// Bytes actually present.
        found: Vec<u8>,
    },

    /// Invalid hive format or corrupted data.
    #[error("Invalid hive format: {0}")]
    InvalidFormat(String),

    /// Record offset does not fall inside any block of the hive.
    #[error("Invalid record offset: {offset:#x} (hive size: {hive_size:#x})")]
    InvalidOffset {
        /// Offending offset, relative to the first block.
        offset: u32,
        /// Size of the hive file.
        hive_size: u64,
    },

    /// Record size field is invalid or corrupted.
    #[error("Invalid record size: {size:#x} at offset {offset:#x}")]
    InvalidCellSize {
        /// Raw size field.
        size: u32,
        /// Offset of the record, relative to the first block.
        offset: u32,
    },

    /// A record of a different type was found where one was expected.
    #[error("Unknown record type: {cell_type:?} at offset {offset:#x}")]
    UnknownCellType {
        /// The two tag bytes that were found.
        cell_type: [u8; 2],
        /// Offset of the record, relative to the first block.
        offset: u32,
    },

    /// Key or value not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid UTF-16 name data.
    #[error("Invalid UTF-16 string at offset {offset:#x}")]
    InvalidUtf16 {
        /// Offset of the record holding the name.
        offset: u32,
    },

    /// Hive file is too small to hold a header.
    #[error("Hive too small: {size} bytes (minimum: {minimum} bytes)")]
    HiveTooSmall {
        /// Actual file size.
        size: u64,
        /// Minimum size of a hive.
        minimum: u64,
    },

    /// Checksum mismatch in hive header.
    #[error("Checksum mismatch: expected {expected:#x}, calculated {calculated:#x}")]
    ChecksumMismatch {
        /// Checksum stored in the header.
        expected: u32,
        /// Checksum computed over the header bytes.
        calculated: u32,
    },

    /// Unsupported hive version.
    #[error("Unsupported hive version: {major}.{minor}")]
    UnsupportedVersion {
        /// Major version.
        major: u32,
        /// Minor version.
        minor: u32,
    },

    /// Data truncated or incomplete.
    #[error("Truncated data at offset {offset:#x}: expected {expected} bytes, got {actual} bytes")]
    TruncatedData {
        /// Offset of the record, relative to the first block.
        offset: u32,
        /// Bytes required.
        expected: usize,
        /// Bytes available.
        actual: usize,
    },

    /// Invalid subkey index type.
    #[error("Invalid subkey list type: {list_type:?}")]
    InvalidSubkeyList {
        /// The two tag bytes that were found.
        list_type: [u8; 2],
    },

    /// The hive cannot grow enough to satisfy an allocation.
    #[error("Out of space: cannot allocate {requested} bytes (hive size limit: {limit} bytes)")]
    OutOfSpace {
        /// Bytes the allocation needed.
        requested: u64,
        /// Configured maximum hive size.
        limit: u64,
    },

    /// A write was attempted on a hive opened for reading.
    #[error("Hive is opened read-only")]
    ReadOnly,

    /// A parent key already holds as many subkeys as it declared.
    #[error("Subkey index of key at {offset:#x} is full ({capacity} entries)")]
    SubkeyIndexFull {
        /// Offset of the parent key.
        offset: u32,
        /// Number of subkeys the parent was written with.
        capacity: usize,
    },

    /// A root key was written to a hive that already has one.
    #[error("Hive already has a root key at {offset:#x}")]
    RootKeyExists {
        /// Offset of the existing root key.
        offset: u32,
    },

    /// A key or value name does not fit its 16-bit length field.
    #[error("Name too long: {len} bytes (maximum: {max} bytes)")]
    NameTooLong {
        /// Encoded name length.
        len: usize,
        /// Largest encodable length.
        max: usize,
    },
}

impl RegistryError {
    /// Creates an invalid signature error with context.
    ///
    /// # Arguments
    ///
    /// * `expected` - Expected signature bytes
    /// * `found` - Actual signature bytes found
    pub fn invalid_signature(expected: &[u8], found: &[u8]) -> Self {
        Self::InvalidSignature {
            expected: expected.to_vec(),
            found: found.to_vec(),
        }
    }

    /// Creates an invalid offset error with context.
    pub fn invalid_offset(offset: u32, hive_size: u64) -> Self {
        Self::InvalidOffset { offset, hive_size }
    }

    /// Creates an invalid record size error with context.
    pub fn invalid_cell_size(size: u32, offset: u32) -> Self {
        Self::InvalidCellSize { size, offset }
    }

    /// Creates a format error with detailed context.
    ///
    /// # Examples
    ///
    /// ```rust
    /// # use reg_hive::error::RegistryError;
    /// let len = 256;
    /// let offset = 0x1000;
    /// let err = RegistryError::format_error(
    ///     format!("Invalid key name length: {} at offset {:#x}", len, offset)
    /// );
    /// ```
    pub fn format_error(message: String) -> Self {
        Self::InvalidFormat(message)
    }

    /// Creates a not found error with context about what was being searched.
    ///
    /// # Examples
    ///
    /// ```rust
    /// # use reg_hive::error::RegistryError;
    /// let err = RegistryError::not_found("value", "DisplayName");
    /// ```
    pub fn not_found(item_type: &str, name: &str) -> Self {
        Self::NotFound(format!("{} '{}'", item_type, name))
    }

    /// Creates an unknown record type error.
    pub fn unknown_cell_type(cell_type: [u8; 2], offset: u32) -> Self {
        Self::UnknownCellType { cell_type, offset }
    }

    /// Returns true for errors caused by the hive being unable to grow.
    pub fn is_out_of_space(&self) -> bool {
        matches!(self, Self::OutOfSpace { .. })
    }

    /// Returns true for errors raised by the underlying file.
    pub fn is_io(&self) -> bool {
        matches!(self, Self::Io(_) | Self::ReadPastEnd { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes_are_distinct() {
        let full = RegistryError::OutOfSpace {
            requested: 0x2000,
            limit: 0x1000,
        };
        assert!(full.is_out_of_space());
        assert!(!full.is_io());

        let io = RegistryError::from(io::Error::new(io::ErrorKind::Other, "disk"));
        assert!(io.is_io());
        assert!(!io.is_out_of_space());
    }

    #[test]
    fn test_not_found_message() {
        let err = RegistryError::not_found("value", "Version");
        assert_eq!(err.to_string(), "Not found: value 'Version'");
    }
}
