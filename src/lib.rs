//! # Windows Registry Hive Codec
//!
//! Reads and writes Windows NT registry hive files (the `regf` format).
//!
//! ## Features
//!
//! - **Read**: open a hive, find its root key, walk subkeys and values
//! - **Write**: create a hive and add keys with values, subkeys and shared
//!   security descriptors
//! - **Tolerant**: record size inconsistencies found in real-world hives are
//!   logged, not rejected
//! - **Complete read path**: `lf`, `lh`, `li` and `ri` subkey lists, UTF-16
//!   names, big data (`db`) values
//!
//! ## Architecture
//!
//! The codec is built on several layers:
//!
//! 1. **Block I/O**: positional reads and writes of byte windows
//! 2. **Base Block (Header)**: hive metadata and checksum
//! 3. **Allocator**: hbin blocks and the free space inside them
//! 4. **Record codecs**: key nodes (nk), values (vk), subkey lists (lf),
//!    security descriptors (sk)
//! 5. **Hive**: root discovery, subkey iteration and the key writer
//!
//! ## Binary Layout
//!
//! ```text
//! [Base Block - 4KB]
//!   - Signature: "regf"
//!   - Sequence numbers, timestamp, version
//!   - Offset of the last block
//!   - Checksum at 0x1FC
//!
//! [Hive Bins - variable size, 4KB aligned]
//!   [Hbin Header - 32 bytes]
//!     - Signature: "hbin"
//!     - Offset, size
//!
//!   [Records - variable size, 8-byte aligned]
//!     [Size - 4 bytes, negative if live]
//!     [Record Data]
//!
//!   [Free space - size, then 0xFFFFFFFF]
//! ```
//!
//! All record offsets are relative to the first hbin, at file offset 0x1000.
//!
//! ## Examples
//!
//! ### Walking a hive
//!
//! ```no_run
//! use reg_hive::Hive;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut hive = Hive::open("SYSTEM")?;
//! let mut root = hive.root_key()?;
//!
//! while let Some(subkey) = hive.next_subkey(&mut root)? {
//!     println!("Subkey: {}", subkey.name());
//!     for value in subkey.values() {
//!         let data = hex::encode(&value.data);
//!         println!("  {} ({}) = {}", value.name, value.value_type.name(), data);
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ### Writing a hive
//!
//! ```no_run
//! use reg_hive::{Hive, Value, ValueType};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut hive = Hive::create("NEW.DAT")?;
//! let mut root = hive.write_key("", &[], &["Software"], None, None)?;
//! let value = Value::new("Version", ValueType::Dword, 1u32.to_le_bytes().to_vec());
//! hive.write_key("Software", &[value], &[], None, Some(&mut root))?;
//! hive.close()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Logging
//!
//! Diagnostics go through [`tracing`]. No subscriber is installed.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod allocator;
pub mod bigdata;
pub mod block_io;
pub mod cell;
pub mod error;
pub mod hbin;
pub mod header;
pub mod hive;
pub mod key;
pub mod security;
pub mod subkey_list;
pub mod utils;
pub mod value;

// Re-export main types for convenience
pub use allocator::CellLocation;
pub use cell::{CellSize, CellType, KeyNodeFlags, ValueType};
pub use error::{RegistryError, Result};
pub use hbin::{CellInfo, CellIterator, HbinHeader};
pub use header::BaseBlock;
pub use hive::{Hive, HiveOptions, Key, OpenMode};
pub use key::KeyNode;
pub use security::{SecurityDescriptor, SecurityKey};
pub use subkey_list::{SubkeyHash, SubkeyList, SubkeyListEntry, SubkeyListType};
pub use value::{Value, ValueKey};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
