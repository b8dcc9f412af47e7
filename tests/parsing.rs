//! Unit tests for parsing specific structures.

use reg_hive::*;

#[test]
fn test_base_block_constants() {
    assert_eq!(header::BASE_BLOCK_SIZE, 4096);
    assert_eq!(header::REGF_SIGNATURE, b"regf");
    assert_eq!(header::CHECKSUM_OFFSET, 0x1FC);
}

#[test]
fn test_hbin_constants() {
    assert_eq!(hbin::HBIN_HEADER_SIZE, 32);
    assert_eq!(hbin::HBIN_SIGNATURE, b"hbin");
}

#[test]
fn test_cell_type_signatures() {
    assert_eq!(CellType::KeyNode.signature(), b"nk");
    assert_eq!(CellType::ValueKey.signature(), b"vk");
    assert_eq!(CellType::Security.signature(), b"sk");
    assert_eq!(CellType::IndexLeaf.signature(), b"li");
    assert_eq!(CellType::FastLeaf.signature(), b"lf");
    assert_eq!(CellType::HashLeaf.signature(), b"lh");
    assert_eq!(CellType::IndexRoot.signature(), b"ri");
    assert_eq!(CellType::DataBlock.signature(), b"db");
}

#[test]
fn test_cell_type_from_signature() {
    assert_eq!(
        CellType::from_signature(b"nk").unwrap(),
        CellType::KeyNode
    );
    assert_eq!(
        CellType::from_signature(b"vk").unwrap(),
        CellType::ValueKey
    );
    assert!(CellType::from_signature(b"XX").is_err());
}

#[test]
fn test_value_type_names() {
    assert_eq!(ValueType::None.name(), "REG_NONE");
    assert_eq!(ValueType::String.name(), "REG_SZ");
    assert_eq!(ValueType::ExpandString.name(), "REG_EXPAND_SZ");
    assert_eq!(ValueType::Binary.name(), "REG_BINARY");
    assert_eq!(ValueType::Dword.name(), "REG_DWORD");
    assert_eq!(ValueType::DwordBigEndian.name(), "REG_DWORD_BIG_ENDIAN");
    assert_eq!(ValueType::Link.name(), "REG_LINK");
    assert_eq!(ValueType::MultiString.name(), "REG_MULTI_SZ");
    assert_eq!(ValueType::Qword.name(), "REG_QWORD");
}

#[test]
fn test_value_type_from_u32() {
    assert_eq!(ValueType::from_u32(0), ValueType::None);
    assert_eq!(ValueType::from_u32(1), ValueType::String);
    assert_eq!(ValueType::from_u32(2), ValueType::ExpandString);
    assert_eq!(ValueType::from_u32(3), ValueType::Binary);
    assert_eq!(ValueType::from_u32(4), ValueType::Dword);
    assert_eq!(ValueType::from_u32(11), ValueType::Qword);
    // Non-standard tags are carried through untouched.
    assert_eq!(ValueType::from_u32(999), ValueType::Unknown(999));
}

#[test]
fn test_key_node_flags() {
    let flags = KeyNodeFlags::new(0);
    assert!(!flags.is_compressed());
    assert!(!flags.is_volatile());
    assert!(!flags.is_root());

    let flags = KeyNodeFlags::new(KeyNodeFlags::COMP_NAME);
    assert!(flags.is_compressed());
    assert!(!flags.is_volatile());

    let flags = KeyNodeFlags::new(KeyNodeFlags::ROOT_KEY);
    assert!(flags.is_root());

    let flags = KeyNodeFlags::new(KeyNodeFlags::VOLATILE);
    assert!(flags.is_volatile());

    assert_eq!(KeyNodeFlags::ROOT_KEY_TYPE, 0x2C);
    assert_eq!(KeyNodeFlags::NORMAL_KEY_TYPE, 0x20);
}

#[test]
fn test_subkey_list_types() {
    assert_eq!(
        SubkeyListType::from_signature(b"li").unwrap(),
        SubkeyListType::IndexLeaf
    );
    assert_eq!(
        SubkeyListType::from_signature(b"lf").unwrap(),
        SubkeyListType::FastLeaf
    );
    assert_eq!(
        SubkeyListType::from_signature(b"lh").unwrap(),
        SubkeyListType::HashLeaf
    );
    assert_eq!(
        SubkeyListType::from_signature(b"ri").unwrap(),
        SubkeyListType::IndexRoot
    );
    assert!(SubkeyListType::from_signature(b"XX").is_err());
}

#[test]
fn test_hash_leaf_reads_like_fast_leaf() {
    let mut body = vec![0u8; 20];
    body[0..2].copy_from_slice(b"lh");
    body[2..4].copy_from_slice(&2u16.to_le_bytes());
    body[4..8].copy_from_slice(&0x120u32.to_le_bytes());
    body[8..12].copy_from_slice(&0xDEADBEEFu32.to_le_bytes());
    body[12..16].copy_from_slice(&0x240u32.to_le_bytes());

    let list = SubkeyList::parse(&body, 0x80).unwrap();
    let offsets: Vec<u32> = list.key_offsets_iter().collect();
    assert_eq!(offsets, vec![0x120, 0x240]);
}

#[test]
fn test_error_types() {
    let err = RegistryError::invalid_signature(b"regf", b"XXXX");
    assert!(matches!(err, RegistryError::InvalidSignature { .. }));

    let err = RegistryError::invalid_offset(0x1234, 0x1000);
    assert!(matches!(err, RegistryError::InvalidOffset { .. }));

    let err = RegistryError::invalid_cell_size(0x0FE0, 0x2000);
    assert!(matches!(err, RegistryError::InvalidCellSize { .. }));

    let err = RegistryError::OutOfSpace {
        requested: 0x1000,
        limit: 0x2000,
    };
    assert!(err.is_out_of_space());
    assert!(!err.is_io());
}

#[test]
fn test_header_display() {
    let header = BaseBlock::new();
    let text = header.to_string();
    assert!(text.contains("Version: 1.3"));
    assert!(text.contains("Consistent: true"));
    assert!(header.last_written_datetime().is_some());
}

#[cfg(test)]
mod property_tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_cell_type_roundtrip() {
        let types = [
            CellType::KeyNode,
            CellType::ValueKey,
            CellType::Security,
            CellType::IndexLeaf,
            CellType::FastLeaf,
            CellType::HashLeaf,
            CellType::IndexRoot,
            CellType::DataBlock,
        ];

        for cell_type in &types {
            let sig = cell_type.signature();
            let parsed = CellType::from_signature(sig).unwrap();
            assert_eq!(*cell_type, parsed);
        }
    }

    proptest! {
        #[test]
        fn value_type_tag_is_preserved(tag in any::<u32>()) {
            prop_assert_eq!(ValueType::from_u32(tag).to_u32(), tag);
        }

        #[test]
        fn live_sizes_are_negative(units in 1u32..0x1000_0000) {
            let size = units * 8;
            let raw = CellSize::Used(size).to_raw();
            prop_assert!(raw & 0x8000_0000 != 0);
            prop_assert_eq!(raw, (size as i32).wrapping_neg() as u32);
            prop_assert_eq!(CellSize::from_raw(raw), CellSize::Used(size));
        }

        #[test]
        fn free_sizes_are_positive(size in 0u32..0x8000_0000) {
            prop_assert_eq!(CellSize::from_raw(size), CellSize::Free(size));
            prop_assert!(!CellSize::from_raw(size).is_used());
        }
    }
}
