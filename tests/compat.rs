//! Reads hives laid out the way other writers lay them out: index roots,
//! li/lh leaves, big data, reused records and a root that is not the first
//! record.

use reg_hive::bigdata::BIG_DATA_SEGMENT_SIZE;
use reg_hive::hbin::HBIN_HEADER_SIZE;
use reg_hive::utils::{align8, OFFSET_NONE};
use reg_hive::value::{encode_value_list, value_list_len};
use reg_hive::{
    BaseBlock, CellSize, HbinHeader, Hive, KeyNode, KeyNodeFlags, RegistryError, Value,
    ValueKey, ValueType,
};
use std::path::Path;

const BLOCK_SIZE: u32 = 0x6000;
const BIG_LEN: usize = 20000;

/// Builds a single-block hive image record by record.
struct ImageBuilder {
    block: Vec<u8>,
}

impl ImageBuilder {
    fn new() -> Self {
        Self {
            block: vec![0u8; HBIN_HEADER_SIZE],
        }
    }

    /// Appends a record just large enough for `body`.
    fn record(&mut self, body: &[u8]) -> u32 {
        self.record_sized(body, align8(4 + body.len() as u32))
    }

    /// Appends a record of `size` bytes, zero padded after `body`.
    fn record_sized(&mut self, body: &[u8], size: u32) -> u32 {
        let offset = self.block.len() as u32;
        self.block.extend_from_slice(&CellSize::Used(size).to_raw().to_le_bytes());
        self.block.extend_from_slice(body);
        self.block.resize(offset as usize + size as usize, 0);
        offset
    }

    fn set_parent(&mut self, key: u32, parent: u32) {
        let at = key as usize + 4 + 0x10;
        self.block[at..at + 4].copy_from_slice(&parent.to_le_bytes());
    }

    /// Closes the block, either with a free record or with a record whose
    /// size runs past the block end, and prepends the header.
    fn finish(mut self, minor_version: u32, overrun: bool) -> Vec<u8> {
        let rest = BLOCK_SIZE - self.block.len() as u32;
        assert!(rest >= 8);
        let tail = if overrun {
            CellSize::Used(rest + 0x1000)
        } else {
            CellSize::Free(rest)
        };
        self.block.extend_from_slice(&tail.to_raw().to_le_bytes());
        if !overrun {
            self.block.extend_from_slice(&0xFFFF_FFFFu32.to_le_bytes());
        }
        self.block.resize(BLOCK_SIZE as usize, 0);
        HbinHeader::new(0, BLOCK_SIZE).encode(&mut self.block);

        let mut header = BaseBlock::new();
        header.minor_version = minor_version;
        let mut bytes = header.to_bytes();
        bytes.extend_from_slice(&self.block);
        bytes
    }
}

fn key_body(node: &KeyNode) -> Vec<u8> {
    let mut body = vec![0u8; node.encoded_len() as usize - 4];
    node.encode(&mut body).unwrap();
    body
}

fn value_body(value: &Value, data_offset: u32) -> Vec<u8> {
    let vk = ValueKey::new(value, data_offset);
    let mut body = vec![0u8; vk.encoded_len() as usize - 4];
    vk.encode(&mut body).unwrap();
    body
}

fn list_body(tag: &[u8; 2], offsets: &[u32], with_hints: bool) -> Vec<u8> {
    let mut body = tag.to_vec();
    body.extend_from_slice(&(offsets.len() as u16).to_le_bytes());
    for (i, offset) in offsets.iter().enumerate() {
        body.extend_from_slice(&offset.to_le_bytes());
        if with_hints {
            body.extend_from_slice(&(0x1000_0000u32 + i as u32).to_le_bytes());
        }
    }
    body
}

fn big_value() -> Value {
    let mut data = vec![0x11; BIG_DATA_SEGMENT_SIZE];
    data.resize(BIG_LEN, 0x22);
    Value::new("Big", ValueType::Binary, data)
}

fn padded_value() -> Value {
    Value::new("Padded", ValueType::Dword, 7u32.to_le_bytes().to_vec())
}

/// Writes an image whose root, tagged ROOT, is written after its children:
///
/// ```text
/// ROOT (ri -> [li: Alpha], [lh: Beta, Gamma])
///   Beta   reused record, values Big (db, two segments) and Padded (reused)
///   Gamma  (li -> Delta)
/// ```
fn write_image(path: &Path, minor_version: u32, overrun: bool) {
    let mut image = ImageBuilder::new();

    let delta = image.record(&key_body(&KeyNode::new(
        "Delta",
        KeyNodeFlags::NORMAL_KEY_TYPE,
        OFFSET_NONE,
    )));
    let alpha = image.record(&key_body(&KeyNode::new(
        "Alpha",
        KeyNodeFlags::NORMAL_KEY_TYPE,
        OFFSET_NONE,
    )));

    // Both segments carry junk past the bytes the value needs.
    let mut first = vec![0x11; BIG_DATA_SEGMENT_SIZE];
    first.extend_from_slice(&[0xEE; 16]);
    let first = image.record(&first);
    let mut second = vec![0x22; BIG_LEN - BIG_DATA_SEGMENT_SIZE];
    second.extend_from_slice(&[0xEE; 40]);
    let second = image.record(&second);

    let mut segments = first.to_le_bytes().to_vec();
    segments.extend_from_slice(&second.to_le_bytes());
    let segments = image.record(&segments);
    let mut db = b"db".to_vec();
    db.extend_from_slice(&2u16.to_le_bytes());
    db.extend_from_slice(&segments.to_le_bytes());
    let db = image.record(&db);

    let big_vk = image.record(&value_body(&big_value(), db));
    let padded = value_body(&padded_value(), OFFSET_NONE);
    let padded_size = padded.len() as u32 + 4 + 0x20;
    let padded_vk = image.record_sized(&padded, padded_size);

    let mut value_list = vec![0u8; value_list_len(2) as usize - 4];
    encode_value_list(&mut value_list, &[big_vk, padded_vk]).unwrap();
    let value_list = image.record(&value_list);

    let mut beta = KeyNode::new("Beta", KeyNodeFlags::NORMAL_KEY_TYPE, OFFSET_NONE);
    beta.value_count = 2;
    beta.value_list_offset = value_list;
    let beta_body = key_body(&beta);
    let beta_size = beta_body.len() as u32 + 4 + 0x40;
    let beta = image.record_sized(&beta_body, beta_size);

    let gamma_list = image.record(&list_body(b"li", &[delta], false));
    let mut gamma = KeyNode::new("Gamma", KeyNodeFlags::NORMAL_KEY_TYPE, OFFSET_NONE);
    gamma.subkey_count = 1;
    gamma.subkey_list_offset = gamma_list;
    let gamma = image.record(&key_body(&gamma));
    image.set_parent(delta, gamma);

    let leaf = image.record(&list_body(b"li", &[alpha], false));
    let hashed = image.record(&list_body(b"lh", &[beta, gamma], true));
    let index_root = image.record(&list_body(b"ri", &[leaf, hashed], false));

    let mut root = KeyNode::new("ROOT", KeyNodeFlags::ROOT_KEY_TYPE, OFFSET_NONE);
    root.subkey_count = 3;
    root.subkey_list_offset = index_root;
    let root = image.record(&key_body(&root));
    for child in [alpha, beta, gamma] {
        image.set_parent(child, root);
    }

    std::fs::write(path, image.finish(minor_version, overrun)).unwrap();
}

#[test]
fn test_root_found_after_other_records() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("late_root.hiv");
    write_image(&path, 5, false);

    let mut hive = Hive::open(&path).unwrap();
    let root = hive.root_key().unwrap();
    assert!(root.is_root());
    assert_eq!(root.name(), "ROOT");
    assert!(root.offset() > HBIN_HEADER_SIZE as u32);
}

#[test]
fn test_index_root_is_flattened() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("index_root.hiv");
    write_image(&path, 5, false);

    let mut hive = Hive::open(&path).unwrap();
    let mut root = hive.root_key().unwrap();
    assert_eq!(root.subkey_count(), 3);
    assert_eq!(root.subkey_names(), vec!["Alpha", "Beta", "Gamma"]);

    let mut names = Vec::new();
    while let Some(child) = hive.next_subkey(&mut root).unwrap() {
        assert_eq!(child.parent_offset(), root.offset());
        names.push(child.name().to_string());
    }
    assert_eq!(names, vec!["Alpha", "Beta", "Gamma"]);
}

#[test]
fn test_index_leaf_without_hints() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("index_leaf.hiv");
    write_image(&path, 5, false);

    let mut hive = Hive::open(&path).unwrap();
    let mut root = hive.root_key().unwrap();
    hive.next_subkey(&mut root).unwrap();
    hive.next_subkey(&mut root).unwrap();
    let mut gamma = hive.next_subkey(&mut root).unwrap().unwrap();
    assert_eq!(gamma.name(), "Gamma");
    assert_eq!(gamma.subkey_names(), vec!["Delta"]);

    let delta = hive.next_subkey(&mut gamma).unwrap().unwrap();
    assert_eq!(delta.name(), "Delta");
    assert_eq!(delta.parent_offset(), gamma.offset());
    assert!(hive.next_subkey(&mut gamma).unwrap().is_none());
}

#[test]
fn test_big_data_and_reused_records() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("big_data.hiv");
    write_image(&path, 5, false);

    let mut hive = Hive::open(&path).unwrap();
    let mut root = hive.root_key().unwrap();
    hive.next_subkey(&mut root).unwrap();
    let beta = hive.next_subkey(&mut root).unwrap().unwrap();
    assert_eq!(beta.name(), "Beta");
    assert_eq!(beta.values(), &[big_value(), padded_value()]);

    let big = beta.value("Big").unwrap();
    assert_eq!(big.data.len(), BIG_LEN);
    assert!(big.data[..BIG_DATA_SEGMENT_SIZE].iter().all(|&b| b == 0x11));
    assert!(big.data[BIG_DATA_SEGMENT_SIZE..].iter().all(|&b| b == 0x22));
}

#[test]
fn test_big_data_needs_version_1_4() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("old_version.hiv");
    write_image(&path, 3, false);

    // Before 1.4 the db record is taken as plain data, which is too short.
    let mut hive = Hive::open(&path).unwrap();
    let mut root = hive.root_key().unwrap();
    hive.next_subkey(&mut root).unwrap();
    assert!(matches!(
        hive.next_subkey(&mut root),
        Err(RegistryError::TruncatedData { .. })
    ));
}

#[test]
fn test_overrunning_last_record_is_tolerated() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("overrun.hiv");
    write_image(&path, 5, true);

    let mut hive = Hive::open(&path).unwrap();
    let mut root = hive.root_key().unwrap();
    assert_eq!(root.name(), "ROOT");

    let mut count = 0;
    while let Some(child) = hive.next_subkey(&mut root).unwrap() {
        assert!(!child.name().is_empty());
        count += 1;
    }
    assert_eq!(count, 3);
}
