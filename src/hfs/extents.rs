//! Extents-overflow tree: records for fork runs past the eight inline
//! descriptors, keyed by (file, fork type, starting fork block).

use byteorder::{BigEndian, ByteOrder};

use crate::error::{DmgError, Result};
use crate::hfs::btree::{BTreeHeaderRecord, BTreeKey, KeyCompare};
use crate::hfs::volume::ExtentDescriptor;

/// Key byte length after the length prefix: fork type, pad, file ID, start.
pub const EXTENT_KEY_LENGTH: u16 = 10;

/// Each extents record holds eight descriptors.
pub const EXTENTS_PER_RECORD: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtentKey {
    pub fork_type: u8,
    pub file_id: u32,
    pub start_block: u32,
}

impl BTreeKey for ExtentKey {
    fn parse(data: &[u8]) -> Result<(Self, usize)> {
        let len = BigEndian::read_u16(&data[0..2]);
        if len != EXTENT_KEY_LENGTH {
            return Err(DmgError::Corrupt(format!(
                "bad extent key length {}",
                len
            )));
        }
        Ok((
            Self {
                fork_type: data[2],
                file_id: BigEndian::read_u32(&data[4..8]),
                start_block: BigEndian::read_u32(&data[8..12]),
            },
            12,
        ))
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![0u8; 12];
        BigEndian::write_u16(&mut out[0..2], EXTENT_KEY_LENGTH);
        out[2] = self.fork_type;
        BigEndian::write_u32(&mut out[4..8], self.file_id);
        BigEndian::write_u32(&mut out[8..12], self.start_block);
        out
    }
}

/// File ID first, then fork type, then start block.
pub fn extent_key_compare(_: &BTreeHeaderRecord) -> KeyCompare<ExtentKey> {
    |a, b| {
        a.file_id
            .cmp(&b.file_id)
            .then(a.fork_type.cmp(&b.fork_type))
            .then(a.start_block.cmp(&b.start_block))
    }
}

pub fn parse_extent_record(data: &[u8]) -> Result<[ExtentDescriptor; EXTENTS_PER_RECORD]> {
    if data.len() < EXTENTS_PER_RECORD * ExtentDescriptor::SIZE {
        return Err(DmgError::Corrupt("short extents record".into()));
    }
    let mut extents = [ExtentDescriptor::default(); EXTENTS_PER_RECORD];
    for (i, ext) in extents.iter_mut().enumerate() {
        *ext = ExtentDescriptor::parse(&data[i * 8..i * 8 + 8]);
    }
    Ok(extents)
}

pub fn write_extent_record(extents: &[ExtentDescriptor]) -> Vec<u8> {
    let mut out = vec![0u8; EXTENTS_PER_RECORD * ExtentDescriptor::SIZE];
    for (i, ext) in extents.iter().take(EXTENTS_PER_RECORD).enumerate() {
        ext.write(&mut out[i * 8..i * 8 + 8]);
    }
    out
}

#[cfg(test)]
mod tests {
    use std::cmp::Ordering;

    use super::*;

    #[test]
    fn test_key_roundtrip() {
        let key = ExtentKey {
            fork_type: 0xFF,
            file_id: 22,
            start_block: 4096,
        };
        let bytes = key.to_bytes();
        assert_eq!(bytes.len(), 12);
        let (back, used) = ExtentKey::parse(&bytes).unwrap();
        assert_eq!(used, 12);
        assert_eq!(back, key);
    }

    #[test]
    fn test_key_ordering() {
        let cmp = extent_key_compare(&dummy_header());
        let a = ExtentKey { fork_type: 0, file_id: 5, start_block: 100 };
        let b = ExtentKey { fork_type: 0, file_id: 5, start_block: 200 };
        let c = ExtentKey { fork_type: 0xFF, file_id: 5, start_block: 0 };
        let d = ExtentKey { fork_type: 0, file_id: 6, start_block: 0 };
        assert_eq!(cmp(&a, &b), Ordering::Less);
        assert_eq!(cmp(&b, &c), Ordering::Less); // data fork before resource
        assert_eq!(cmp(&c, &d), Ordering::Less); // file id dominates
    }

    #[test]
    fn test_record_roundtrip_with_padding() {
        let runs = vec![
            ExtentDescriptor { start_block: 10, block_count: 4 },
            ExtentDescriptor { start_block: 30, block_count: 1 },
        ];
        let rec = write_extent_record(&runs);
        assert_eq!(rec.len(), 64);
        let parsed = parse_extent_record(&rec).unwrap();
        assert_eq!(parsed[0], runs[0]);
        assert_eq!(parsed[1], runs[1]);
        assert!(parsed[2].is_empty());
    }

    fn dummy_header() -> BTreeHeaderRecord {
        BTreeHeaderRecord {
            tree_depth: 0,
            root_node: 0,
            leaf_records: 0,
            first_leaf: 0,
            last_leaf: 0,
            node_size: 1024,
            max_key_length: EXTENT_KEY_LENGTH,
            total_nodes: 1,
            free_nodes: 0,
            clump_size: 1024,
            btree_type: 0,
            key_compare_type: 0,
            attributes: 2,
        }
    }
}
