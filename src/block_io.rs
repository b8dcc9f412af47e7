//! Positional reads and writes of byte windows in the hive file.
//!
//! This layer knows nothing about records. The one concession to the format
//! is [`BlockFile::read_window`] with an unknown size, which sniffs the size
//! an hbin block declares in its own header before reading the whole block.

use crate::error::{RegistryError, Result};
use crate::hbin::{HBIN_HEADER_SIZE, HBIN_SIGNATURE};
use crate::utils::read_u32_le;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// A hive file opened for block-sized reads and writes.
#[derive(Debug)]
pub struct BlockFile {
    path: PathBuf,
    file: File,
    writable: bool,
}

impl BlockFile {
    /// Opens an existing file for reading.
    pub fn open_read(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
            writable: false,
        })
    }

    /// Creates a file for writing, truncating it if it exists.
    pub fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
            writable: true,
        })
    }

    /// Returns the path of the underlying file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current length of the file in bytes.
    pub fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    /// Returns true if the file is empty.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Reads a window of bytes starting at `offset`.
    ///
    /// With `size == None` the window is an hbin block: its header is read
    /// first, checked for the `hbin` signature, and the block size it declares
    /// becomes the window size.
    ///
    /// # Errors
    ///
    /// Fails on any read or seek error, on a bad block signature, and with
    /// [`RegistryError::ReadPastEnd`] if the window extends past end of file.
    pub fn read_window(&mut self, offset: u64, size: Option<usize>) -> Result<Vec<u8>> {
        let size = match size {
            Some(size) => size,
            None => {
                let header = self.read_exact_at(offset, HBIN_HEADER_SIZE)?;
                if &header[0..4] != HBIN_SIGNATURE {
                    return Err(RegistryError::invalid_signature(HBIN_SIGNATURE, &header[0..4]));
                }
                read_u32_le(&header, 0x08)? as usize
            }
        };

        debug!(offset = %format!("{:#x}", offset), size, "Reading window");
        self.read_exact_at(offset, size)
    }

    fn read_exact_at(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let file_size = self.len()?;
        let end = offset.saturating_add(len as u64);
        if offset >= file_size || end > file_size {
            return Err(RegistryError::ReadPastEnd {
                offset,
                len,
                size: file_size,
            });
        }

        self.file.seek(SeekFrom::Start(offset))?;
        let mut buffer = vec![0u8; len];
        self.file.read_exact(&mut buffer)?;
        Ok(buffer)
    }

    /// Writes all of `buffer` at `offset`, extending the file if needed.
    pub fn write_window(&mut self, offset: u64, buffer: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(RegistryError::ReadOnly);
        }

        debug!(offset = %format!("{:#x}", offset), size = buffer.len(), "Writing window");
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(buffer)?;
        Ok(())
    }

    /// Appends `buffer` at the end of the file, returning the offset it was
    /// written at.
    pub fn append(&mut self, buffer: &[u8]) -> Result<u64> {
        let offset = self.len()?;
        self.write_window(offset, buffer)?;
        Ok(offset)
    }

    /// Pushes buffered writes to the operating system and disk.
    pub fn sync(&mut self) -> Result<()> {
        if self.writable {
            self.file.flush()?;
            self.file.sync_all()?;
        }
        Ok(())
    }
}
