//! Hive handle: root discovery, subkey iteration and key writing.

use crate::allocator::{Allocator, CellLocation};
use crate::bigdata::{is_big_data, BigDataBlock, BIG_DATA_SEGMENT_SIZE};
use crate::block_io::BlockFile;
use crate::cell::{CellType, KeyNodeFlags};
use crate::error::{RegistryError, Result};
use crate::header::{BaseBlock, BASE_BLOCK_SIZE};
use crate::key::KeyNode;
use crate::security::{security_key_len, SecurityDescriptor, SecurityKey, SecurityTable};
use crate::subkey_list::{
    encode_fast_leaf, fast_leaf_capacity, fast_leaf_len, sort_hashes, SubkeyHash, SubkeyList,
};
use crate::utils::{encode_name, filetime_to_datetime, utf16_byte_len, write_bytes, OFFSET_NONE};
use crate::value::{
    data_cell_len, encode_value_list, parse_value_list, value_list_len, Value, ValueKey,
    DATA_INLINE, MAX_INLINE_DATA,
};
use std::path::Path;
use tracing::{debug, info, instrument, warn};

/// Default upper bound on the size of a hive file.
pub const DEFAULT_MAX_HIVE_SIZE: u64 = 512 * 1024 * 1024;

/// How a hive file is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Open an existing hive for reading.
    Read,
    /// Create a new, empty hive, truncating any existing file.
    Create,
}

/// Options for opening a hive.
#[derive(Debug, Clone)]
pub struct HiveOptions {
    /// Fail the open on a header checksum mismatch. When false the mismatch
    /// is only logged.
    pub verify_checksum: bool,

    /// The allocator refuses to grow the file past this many bytes.
    pub max_hive_size: u64,
}

impl Default for HiveOptions {
    fn default() -> Self {
        Self {
            verify_checksum: true,
            max_hive_size: DEFAULT_MAX_HIVE_SIZE,
        }
    }
}

/// An open registry hive.
///
/// A hive opened with [`OpenMode::Read`] can be navigated but not written.
/// A hive opened with [`OpenMode::Create`] starts empty; keys are added with
/// [`Hive::write_key`], parents before children, and the file is completed
/// by [`Hive::close`]. Dropping an unclosed hive closes it on a best-effort
/// basis.
///
/// # Examples
///
/// ```no_run
/// use reg_hive::{Hive, Value, ValueType};
///
/// # fn main() -> reg_hive::Result<()> {
/// let mut hive = Hive::create("NEW.DAT")?;
/// let mut root = hive.write_key("", &[], &["Software"], None, None)?;
/// let version = Value::new("Version", ValueType::String, b"1.0".to_vec());
/// hive.write_key("Software", &[version], &[], None, Some(&mut root))?;
/// hive.close()?;
///
/// let mut hive = Hive::open("NEW.DAT")?;
/// let mut root = hive.root_key()?;
/// while let Some(key) = hive.next_subkey(&mut root)? {
///     println!("{} has {} values", key.name(), key.values().len());
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Hive {
    storage: Allocator,
    base_block: BaseBlock,
    security: SecurityTable,
    mode: OpenMode,
    root_offset: Option<u32>,
    closed: bool,
}

impl Hive {
    /// Opens an existing hive for reading.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with_options(path, OpenMode::Read, HiveOptions::default())
    }

    /// Creates a new, empty hive for writing.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with_options(path, OpenMode::Create, HiveOptions::default())
    }

    /// Opens a hive file.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - File cannot be opened or created
    /// - File is too small to be a hive
    /// - Header signature, checksum or version is invalid
    #[instrument(skip(path, options), fields(path = %path.as_ref().display()))]
    pub fn open_with_options<P: AsRef<Path>>(
        path: P,
        mode: OpenMode,
        options: HiveOptions,
    ) -> Result<Self> {
        let path = path.as_ref();
        let (file, base_block) = match mode {
            OpenMode::Read => {
                info!("Opening registry hive");
                let mut file = BlockFile::open_read(path)?;
                let size = file.len()?;
                if size < BASE_BLOCK_SIZE as u64 {
                    return Err(RegistryError::HiveTooSmall {
                        size,
                        minimum: BASE_BLOCK_SIZE as u64,
                    });
                }

                let raw = file.read_window(0, Some(BASE_BLOCK_SIZE))?;
                let base_block = BaseBlock::parse_with(&raw, options.verify_checksum)?;
                debug!(
                    version = %format!("{}.{}", base_block.major_version, base_block.minor_version),
                    last_block = %format!("{:#x}", base_block.last_block),
                    "Header verified"
                );
                (file, base_block)
            }
            OpenMode::Create => {
                info!("Creating registry hive");
                let mut file = BlockFile::create(path)?;
                let mut base_block = BaseBlock::new();
                // Reserves the header; the final copy is written on close.
                file.write_window(0, &base_block.to_bytes())?;
                (file, base_block)
            }
        };

        let storage = Allocator::new(
            file,
            u64::from(base_block.last_block),
            options.max_hive_size,
        );

        Ok(Self {
            storage,
            base_block,
            security: SecurityTable::new(),
            mode,
            root_offset: None,
            closed: false,
        })
    }

    /// Returns a reference to the base block header.
    pub fn base_block(&self) -> &BaseBlock {
        &self.base_block
    }

    /// The mode the hive was opened with.
    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    /// Path of the hive file.
    pub fn path(&self) -> &Path {
        self.storage.file().path()
    }

    /// All security descriptors seen so far, in ring order.
    pub fn security_descriptors(&self) -> impl Iterator<Item = &SecurityDescriptor> {
        self.security.iter()
    }

    /// Descriptor bytes of the security record `key` refers to, if any.
    pub fn security_descriptor(&self, key: &Key) -> Option<&[u8]> {
        key.security
            .and_then(|index| self.security.get(index))
            .map(|sd| sd.descriptor.as_slice())
    }

    /// Finds the root key.
    ///
    /// The format keeps no pointer to the root, so blocks are scanned in file
    /// order for the first live key record flagged as root.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] if no block holds a root key.
    #[instrument(skip(self))]
    pub fn root_key(&mut self) -> Result<Key> {
        for (file_offset, _) in self.storage.block_offsets()? {
            let index = self.storage.load_block(file_offset)?;
            let found = self.storage.blocks()[index]
                .cells()
                .find(|cell| {
                    cell.is_allocated()
                        && cell.cell_type() == Some(*CellType::KeyNode.signature())
                        && cell.data.len() >= 4
                        && KeyNodeFlags::new(u16::from_le_bytes([cell.data[2], cell.data[3]]))
                            .is_root()
                })
                .map(|cell| cell.offset);

            if let Some(offset) = found {
                debug!(offset = %format!("{:#x}", offset), "Found root key");
                return self.read_key(offset);
            }
        }

        Err(RegistryError::not_found("key", "(root)"))
    }

    /// Returns the next subkey of `key`, or `None` once every subkey has
    /// been returned.
    ///
    /// The position is kept in `key` itself, so iterations over different
    /// keys can be interleaved freely. Calling again after `None` keeps
    /// returning `None`; [`Key::reset_subkeys`] starts over.
    pub fn next_subkey(&mut self, key: &mut Key) -> Result<Option<Key>> {
        let limit = (key.node.subkey_count as usize).min(key.subkeys.len());
        if key.cursor >= limit {
            return Ok(None);
        }

        let offset = key.subkeys[key.cursor].offset;
        key.cursor += 1;
        self.read_key(offset).map(Some)
    }

    /// Decodes the key at `offset` with its values and subkey index.
    pub fn read_key(&mut self, offset: u32) -> Result<Key> {
        let location = self.storage.locate(offset)?;
        let node = KeyNode::parse(self.storage.cell(location)?, offset)?;

        let values = self.read_values(&node)?;
        let (subkeys, subkey_capacity, subkey_list) = self.read_subkey_index(&node)?;
        let security = self.read_security(node.security_offset)?;

        Ok(Key {
            offset,
            location,
            node,
            values,
            subkeys,
            subkey_capacity,
            subkey_list,
            cursor: 0,
            security,
        })
    }

    fn read_values(&mut self, node: &KeyNode) -> Result<Vec<Value>> {
        if !node.has_values() {
            return Ok(Vec::new());
        }

        let list_location = self.storage.locate(node.value_list_offset)?;
        let offsets = parse_value_list(
            self.storage.cell(list_location)?,
            node.value_count as usize,
            node.value_list_offset,
        )?;

        offsets
            .into_iter()
            .map(|value_offset| self.read_value(value_offset))
            .collect()
    }

    fn read_value(&mut self, offset: u32) -> Result<Value> {
        let location = self.storage.locate(offset)?;
        let vk = ValueKey::parse(self.storage.cell(location)?, offset)?;
        let data = self.read_value_data(&vk)?;

        Ok(Value {
            name: vk.name,
            value_type: vk.data_type,
            data,
        })
    }

    fn read_value_data(&mut self, vk: &ValueKey) -> Result<Vec<u8>> {
        if vk.is_inline_data() {
            return Ok(vk.inline_data());
        }
        if vk.has_no_data() {
            return Ok(Vec::new());
        }
        if self.base_block.supports_big_data() && is_big_data(vk.data_length) {
            return self.read_big_data(vk.data_offset, vk.data_length);
        }

        let location = self.storage.locate(vk.data_offset)?;
        let cell = self.storage.cell(location)?;
        let len = vk.data_length as usize;
        if cell.len() < len {
            return Err(RegistryError::TruncatedData {
                offset: vk.data_offset,
                expected: len,
                actual: cell.len(),
            });
        }
        Ok(cell[..len].to_vec())
    }

    /// Reassembles a value stored through a db record.
    fn read_big_data(&mut self, offset: u32, length: u32) -> Result<Vec<u8>> {
        debug!(
            offset = %format!("{:#x}", offset),
            length, "Reading big data block"
        );

        let location = self.storage.locate(offset)?;
        let db = BigDataBlock::parse(self.storage.cell(location)?, offset)?;
        let list_location = self.storage.locate(db.segment_list_offset)?;
        let segments = db.segment_offsets(self.storage.cell(list_location)?)?;

        let length = length as usize;
        let mut data = Vec::with_capacity(length);
        for segment in segments {
            let remaining = length - data.len();
            if remaining == 0 {
                break;
            }
            let location = self.storage.locate(segment)?;
            let cell = self.storage.cell(location)?;
            let take = remaining.min(BIG_DATA_SEGMENT_SIZE).min(cell.len());
            data.extend_from_slice(&cell[..take]);
        }

        if data.len() < length {
            return Err(RegistryError::TruncatedData {
                offset,
                expected: length,
                actual: data.len(),
            });
        }
        Ok(data)
    }

    fn read_subkey_index(
        &mut self,
        node: &KeyNode,
    ) -> Result<(Vec<SubkeyHash>, usize, Option<CellLocation>)> {
        if !node.has_subkeys() {
            return Ok((Vec::new(), 0, None));
        }

        let offset = node.subkey_list_offset;
        let location = self.storage.locate(offset)?;
        let (list, lf_capacity) = {
            let body = self.storage.cell(location)?;
            let list = SubkeyList::parse(body, offset)?;
            let capacity = body
                .starts_with(CellType::FastLeaf.signature())
                .then(|| fast_leaf_capacity(body.len()));
            (list, capacity)
        };

        let mut entries = Vec::with_capacity(list.len());
        if list.is_index_root() {
            for sublist_offset in list.key_offsets_iter().collect::<Vec<_>>() {
                let sublist_location = self.storage.locate(sublist_offset)?;
                let sublist =
                    SubkeyList::parse(self.storage.cell(sublist_location)?, sublist_offset)?;
                if sublist.is_index_root() {
                    return Err(RegistryError::InvalidSubkeyList {
                        list_type: *CellType::IndexRoot.signature(),
                    });
                }
                entries.extend(sublist.into_hashes());
            }
        } else {
            entries.extend(list.into_hashes());
        }

        for entry in &mut entries {
            match self.child_name(entry.offset) {
                Ok(name) => entry.name = name,
                Err(err) => warn!(
                    offset = %format!("{:#x}", entry.offset),
                    error = %err,
                    "Cannot read subkey name"
                ),
            }
        }

        // Only an lf record can take further entries in place.
        Ok(match lf_capacity {
            Some(capacity) => (entries, capacity, Some(location)),
            None => {
                let capacity = entries.len();
                (entries, capacity, None)
            }
        })
    }

    fn child_name(&mut self, offset: u32) -> Result<String> {
        let location = self.storage.locate(offset)?;
        Ok(KeyNode::parse(self.storage.cell(location)?, offset)?.name)
    }

    fn read_security(&mut self, offset: u32) -> Result<Option<usize>> {
        if offset == OFFSET_NONE {
            return Ok(None);
        }
        if let Some(index) = self.security.find_by_offset(offset) {
            return Ok(Some(index));
        }

        let location = self.storage.locate(offset)?;
        let record = SecurityKey::parse(self.storage.cell(location)?, offset)?;
        Ok(Some(self.security.insert_loaded(offset, location, record)))
    }

    /// Writes a new key.
    ///
    /// Without a parent the key becomes the hive root. With one, the key is
    /// added to the parent's subkey index, which is kept sorted by
    /// case-insensitive name. `subkeys` declares the names of the children
    /// that will be written under this key later; room for exactly that many
    /// index entries is reserved now. A security descriptor byte-equal to one
    /// already in the hive is shared rather than stored again.
    ///
    /// # Errors
    ///
    /// - [`RegistryError::ReadOnly`] on a hive opened for reading
    /// - [`RegistryError::RootKeyExists`] on a second key without a parent
    /// - [`RegistryError::SubkeyIndexFull`] if `parent` already has as many
    ///   subkeys as it declared
    /// - [`RegistryError::NameTooLong`] for a name over 65,535 encoded bytes
    /// - [`RegistryError::OutOfSpace`] if the hive cannot grow enough
    ///
    /// A failure part way leaves the file inconsistent; it should not be used
    /// further.
    #[instrument(skip(self, values, subkeys, security_descriptor, parent), fields(name = %name))]
    pub fn write_key(
        &mut self,
        name: &str,
        values: &[Value],
        subkeys: &[&str],
        security_descriptor: Option<&[u8]>,
        parent: Option<&mut Key>,
    ) -> Result<Key> {
        if self.mode == OpenMode::Read {
            return Err(RegistryError::ReadOnly);
        }

        check_name(name)?;
        for value in values {
            check_name(&value.name)?;
            if value.data.len() >= DATA_INLINE as usize {
                return Err(RegistryError::format_error(format!(
                    "Value '{}' data too large: {} bytes",
                    value.name,
                    value.data.len()
                )));
            }
        }
        if subkeys.len() > u16::MAX as usize {
            return Err(RegistryError::format_error(format!(
                "Too many subkeys: {}",
                subkeys.len()
            )));
        }
        match (parent.as_deref(), self.root_offset) {
            (Some(parent), _) => {
                if parent.subkey_list.is_none() || parent.subkeys.len() >= parent.subkey_capacity {
                    return Err(RegistryError::SubkeyIndexFull {
                        offset: parent.offset,
                        capacity: parent.subkey_capacity,
                    });
                }
            }
            (None, Some(offset)) => return Err(RegistryError::RootKeyExists { offset }),
            (None, None) => {}
        }

        let (flags, parent_offset) = match parent.as_deref() {
            Some(parent) => (KeyNodeFlags::NORMAL_KEY_TYPE, parent.offset),
            None => (KeyNodeFlags::ROOT_KEY_TYPE, OFFSET_NONE),
        };
        let mut node = KeyNode::new(name, flags, parent_offset);
        let location = self.storage.reserve(node.encoded_len())?;
        let offset = self.storage.offset_of(location);

        if let Some(parent) = parent {
            parent.subkeys.push(SubkeyHash::new(offset, name));
            sort_hashes(&mut parent.subkeys);
            if let Some(list) = parent.subkey_list {
                encode_fast_leaf(self.storage.cell_mut(list)?, &parent.subkeys)?;
            }
        } else {
            self.root_offset = Some(offset);
        }

        let security = match security_descriptor {
            Some(descriptor) => {
                let index = match self.security.find_by_bytes(descriptor) {
                    Some(index) => index,
                    None => {
                        let sk_location = self.storage.reserve(security_key_len(descriptor.len()))?;
                        let sk_offset = self.storage.offset_of(sk_location);
                        self.security.insert_new(sk_offset, sk_location, descriptor)
                    }
                };
                self.security.add_ref(index);
                node.security_offset = self.security.get(index).map_or(OFFSET_NONE, |sd| sd.offset);
                Some(index)
            }
            None => None,
        };

        let subkey_list = if subkeys.is_empty() {
            None
        } else {
            let lf_location = self.storage.reserve(fast_leaf_len(subkeys.len()))?;
            encode_fast_leaf(self.storage.cell_mut(lf_location)?, &[])?;
            node.subkey_count = subkeys.len() as u32;
            node.subkey_list_offset = self.storage.offset_of(lf_location);
            node.max_subkey_name_len =
                subkeys.iter().copied().map(utf16_byte_len).max().unwrap_or(0);
            Some(lf_location)
        };

        if !values.is_empty() {
            let list_location = self.storage.reserve(value_list_len(values.len()))?;
            let mut offsets = Vec::with_capacity(values.len());

            for value in values {
                let vk_len = ValueKey::new(value, OFFSET_NONE).encoded_len();
                let vk_location = self.storage.reserve(vk_len)?;

                let data_offset = if value.data.len() > MAX_INLINE_DATA {
                    let data_location = self.storage.reserve(data_cell_len(value.data.len()))?;
                    write_bytes(self.storage.cell_mut(data_location)?, 0, &value.data)?;
                    self.storage.offset_of(data_location)
                } else {
                    OFFSET_NONE
                };

                ValueKey::new(value, data_offset).encode(self.storage.cell_mut(vk_location)?)?;
                offsets.push(self.storage.offset_of(vk_location));

                node.max_value_name_len = node.max_value_name_len.max(utf16_byte_len(&value.name));
                node.max_value_data_len = node.max_value_data_len.max(value.data.len() as u32);
            }

            encode_value_list(self.storage.cell_mut(list_location)?, &offsets)?;
            node.value_count = values.len() as u32;
            node.value_list_offset = self.storage.offset_of(list_location);
        }

        node.encode(self.storage.cell_mut(location)?)?;
        self.write_security_records()?;
        self.storage.flush_all()?;

        debug!(
            offset = %format!("{:#x}", offset),
            values = values.len(),
            subkeys = subkeys.len(),
            "Wrote key"
        );

        Ok(Key {
            offset,
            location,
            node,
            values: values.to_vec(),
            subkeys: Vec::new(),
            subkey_capacity: subkeys.len(),
            subkey_list,
            cursor: 0,
            security,
        })
    }

    fn write_security_records(&mut self) -> Result<()> {
        for (location, record) in self.security.dirty_records() {
            record.encode(self.storage.cell_mut(location)?)?;
        }
        self.security.mark_clean();
        Ok(())
    }

    fn write_header(&mut self) -> Result<()> {
        self.base_block.stamp();
        self.base_block.last_block = u32::try_from(self.storage.last_block()).map_err(|_| {
            RegistryError::format_error(format!(
                "Last block offset {:#x} does not fit the header",
                self.storage.last_block()
            ))
        })?;

        let bytes = self.base_block.to_bytes();
        let file = self.storage.file_mut();
        file.write_window(0, &bytes)?;
        file.sync()
    }

    /// Writes pending security records, dirty blocks and the header without
    /// closing. Does nothing on a read-only hive.
    pub fn flush(&mut self) -> Result<()> {
        if self.mode == OpenMode::Read {
            return Ok(());
        }
        self.write_security_records()?;
        self.storage.flush_all()?;
        self.write_header()
    }

    /// Closes the hive.
    ///
    /// A writable hive gets its security records, blocks and a re-stamped,
    /// re-checksummed header written back. A read-only hive is released.
    #[instrument(skip(self))]
    pub fn close(mut self) -> Result<()> {
        self.closed = true;
        self.finish()
    }

    fn finish(&mut self) -> Result<()> {
        if self.mode == OpenMode::Create {
            self.write_security_records()?;
            self.storage.flush_all()?;
            self.write_header()?;
        }
        info!("Closed registry hive");
        Ok(())
    }
}

impl Drop for Hive {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(err) = self.finish() {
            warn!(error = %err, "Failed to close hive on drop");
        }
    }
}

fn check_name(name: &str) -> Result<()> {
    let (bytes, _) = encode_name(name);
    if bytes.len() > u16::MAX as usize {
        return Err(RegistryError::NameTooLong {
            len: bytes.len(),
            max: u16::MAX as usize,
        });
    }
    Ok(())
}

/// A decoded key, with its values and subkey index.
///
/// A key also carries the cursor [`Hive::next_subkey`] advances.
#[derive(Debug, Clone)]
pub struct Key {
    offset: u32,
    location: CellLocation,
    node: KeyNode,
    values: Vec<Value>,
    subkeys: Vec<SubkeyHash>,
    subkey_capacity: usize,
    subkey_list: Option<CellLocation>,
    cursor: usize,
    security: Option<usize>,
}

impl Key {
    /// Record offset of this key (relative to the first block).
    pub fn offset(&self) -> u32 {
        self.offset
    }

    /// Where the key record lives in the allocator.
    pub fn location(&self) -> CellLocation {
        self.location
    }

    /// Returns the key name.
    pub fn name(&self) -> &str {
        &self.node.name
    }

    /// The decoded key record.
    pub fn node(&self) -> &KeyNode {
        &self.node
    }

    /// Returns true if this is the root key.
    pub fn is_root(&self) -> bool {
        self.node.is_root()
    }

    /// Offset of the parent key, or `0xFFFFFFFF` for the root.
    pub fn parent_offset(&self) -> u32 {
        self.node.parent_offset
    }

    /// Last written time.
    pub fn last_written(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        filetime_to_datetime(self.node.last_written)
    }

    /// Number of subkeys the key declares.
    pub fn subkey_count(&self) -> u32 {
        self.node.subkey_count
    }

    /// Number of values.
    pub fn value_count(&self) -> u32 {
        self.node.value_count
    }

    /// Longest subkey name, in UTF-16 bytes.
    pub fn max_subkey_name_len(&self) -> u32 {
        self.node.max_subkey_name_len
    }

    /// Longest value name, in UTF-16 bytes.
    pub fn max_value_name_len(&self) -> u32 {
        self.node.max_value_name_len
    }

    /// Largest value data length.
    pub fn max_value_data_len(&self) -> u32 {
        self.node.max_value_data_len
    }

    /// The values of this key, in stored order.
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Gets a specific value by name, ignoring case.
    pub fn value(&self, name: &str) -> Result<&Value> {
        self.values
            .iter()
            .find(|v| v.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| RegistryError::not_found("value", name))
    }

    /// Subkey index entries, in index order.
    pub fn subkeys(&self) -> &[SubkeyHash] {
        &self.subkeys
    }

    /// Subkey names, in index order.
    pub fn subkey_names(&self) -> Vec<&str> {
        self.subkeys.iter().map(|s| s.name.as_str()).collect()
    }

    /// Rewinds subkey iteration to the first subkey.
    pub fn reset_subkeys(&mut self) {
        self.cursor = 0;
    }
}
