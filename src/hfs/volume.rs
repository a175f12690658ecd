//! HFS+ volume header structures and the low-level volume core.
//!
//! The volume header lives at byte offset 1024 and is mirrored 1024 bytes
//! before the end of the volume. All fields are big-endian. Fork data
//! records embed the first eight extents of each special file; further
//! extents spill into the extents-overflow tree.

use byteorder::{BigEndian, ByteOrder};
use log::debug;

use crate::error::{DmgError, Result};
use crate::io::IoSource;

pub const HFSP_SIGNATURE: u16 = 0x482B; // "H+"
pub const HFSX_SIGNATURE: u16 = 0x4858; // "HX"

pub const VOLUME_HEADER_OFFSET: u64 = 1024;
pub const VOLUME_HEADER_SIZE: usize = 512;

/// Reserved catalog node IDs.
pub const ROOT_PARENT_CNID: u32 = 1;
pub const ROOT_FOLDER_CNID: u32 = 2;
pub const EXTENTS_FILE_CNID: u32 = 3;
pub const CATALOG_FILE_CNID: u32 = 4;
pub const ALLOCATION_FILE_CNID: u32 = 6;
pub const FIRST_USER_CNID: u32 = 16;

pub const DATA_FORK: u8 = 0x00;
pub const RESOURCE_FORK: u8 = 0xFF;

/// One contiguous run of allocation blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExtentDescriptor {
    pub start_block: u32,
    pub block_count: u32,
}

impl ExtentDescriptor {
    pub const SIZE: usize = 8;

    pub fn parse(data: &[u8]) -> Self {
        Self {
            start_block: BigEndian::read_u32(&data[0..4]),
            block_count: BigEndian::read_u32(&data[4..8]),
        }
    }

    pub fn write(&self, out: &mut [u8]) {
        BigEndian::write_u32(&mut out[0..4], self.start_block);
        BigEndian::write_u32(&mut out[4..8], self.block_count);
    }

    pub fn is_empty(&self) -> bool {
        self.block_count == 0
    }
}

/// 80-byte fork data record: size, clump hint and eight inline extents.
#[derive(Debug, Clone, Default)]
pub struct ForkData {
    pub logical_size: u64,
    pub clump_size: u32,
    pub total_blocks: u32,
    pub extents: [ExtentDescriptor; 8],
}

impl ForkData {
    pub const SIZE: usize = 80;

    pub fn parse(data: &[u8]) -> Self {
        let mut extents = [ExtentDescriptor::default(); 8];
        for (i, ext) in extents.iter_mut().enumerate() {
            *ext = ExtentDescriptor::parse(&data[16 + i * 8..16 + i * 8 + 8]);
        }
        Self {
            logical_size: BigEndian::read_u64(&data[0..8]),
            clump_size: BigEndian::read_u32(&data[8..12]),
            total_blocks: BigEndian::read_u32(&data[12..16]),
            extents,
        }
    }

    pub fn write(&self, out: &mut [u8]) {
        BigEndian::write_u64(&mut out[0..8], self.logical_size);
        BigEndian::write_u32(&mut out[8..12], self.clump_size);
        BigEndian::write_u32(&mut out[12..16], self.total_blocks);
        for (i, ext) in self.extents.iter().enumerate() {
            ext.write(&mut out[16 + i * 8..16 + i * 8 + 8]);
        }
    }
}

/// The 512-byte HFS+ volume header.
#[derive(Debug, Clone)]
pub struct VolumeHeader {
    pub signature: u16,
    pub version: u16,
    pub attributes: u32,
    pub last_mounted_version: u32,
    pub journal_info_block: u32,
    pub create_date: u32,
    pub modify_date: u32,
    pub backup_date: u32,
    pub checked_date: u32,
    pub file_count: u32,
    pub folder_count: u32,
    pub block_size: u32,
    pub total_blocks: u32,
    pub free_blocks: u32,
    pub next_allocation: u32,
    pub rsrc_clump_size: u32,
    pub data_clump_size: u32,
    pub next_catalog_id: u32,
    pub write_count: u32,
    pub encodings_bitmap: u64,
    pub finder_info: [u8; 32],
    pub allocation_file: ForkData,
    pub extents_file: ForkData,
    pub catalog_file: ForkData,
    pub attributes_file: ForkData,
    pub startup_file: ForkData,
}

impl VolumeHeader {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < VOLUME_HEADER_SIZE {
            return Err(DmgError::Corrupt("volume header truncated".into()));
        }
        let signature = BigEndian::read_u16(&data[0..2]);
        if signature != HFSP_SIGNATURE && signature != HFSX_SIGNATURE {
            return Err(DmgError::BadSignature {
                expected: "H+/HX",
                actual: signature as u64,
            });
        }
        let mut finder_info = [0u8; 32];
        finder_info.copy_from_slice(&data[80..112]);
        let header = Self {
            signature,
            version: BigEndian::read_u16(&data[2..4]),
            attributes: BigEndian::read_u32(&data[4..8]),
            last_mounted_version: BigEndian::read_u32(&data[8..12]),
            journal_info_block: BigEndian::read_u32(&data[12..16]),
            create_date: BigEndian::read_u32(&data[16..20]),
            modify_date: BigEndian::read_u32(&data[20..24]),
            backup_date: BigEndian::read_u32(&data[24..28]),
            checked_date: BigEndian::read_u32(&data[28..32]),
            file_count: BigEndian::read_u32(&data[32..36]),
            folder_count: BigEndian::read_u32(&data[36..40]),
            block_size: BigEndian::read_u32(&data[40..44]),
            total_blocks: BigEndian::read_u32(&data[44..48]),
            free_blocks: BigEndian::read_u32(&data[48..52]),
            next_allocation: BigEndian::read_u32(&data[52..56]),
            rsrc_clump_size: BigEndian::read_u32(&data[56..60]),
            data_clump_size: BigEndian::read_u32(&data[60..64]),
            next_catalog_id: BigEndian::read_u32(&data[64..68]),
            write_count: BigEndian::read_u32(&data[68..72]),
            encodings_bitmap: BigEndian::read_u64(&data[72..80]),
            finder_info,
            allocation_file: ForkData::parse(&data[112..192]),
            extents_file: ForkData::parse(&data[192..272]),
            catalog_file: ForkData::parse(&data[272..352]),
            attributes_file: ForkData::parse(&data[352..432]),
            startup_file: ForkData::parse(&data[432..512]),
        };
        if header.block_size == 0 || !header.block_size.is_power_of_two() {
            return Err(DmgError::Corrupt(format!(
                "bad allocation block size {}",
                header.block_size
            )));
        }
        Ok(header)
    }

    pub fn to_bytes(&self) -> [u8; VOLUME_HEADER_SIZE] {
        let mut buf = [0u8; VOLUME_HEADER_SIZE];
        BigEndian::write_u16(&mut buf[0..2], self.signature);
        BigEndian::write_u16(&mut buf[2..4], self.version);
        BigEndian::write_u32(&mut buf[4..8], self.attributes);
        BigEndian::write_u32(&mut buf[8..12], self.last_mounted_version);
        BigEndian::write_u32(&mut buf[12..16], self.journal_info_block);
        BigEndian::write_u32(&mut buf[16..20], self.create_date);
        BigEndian::write_u32(&mut buf[20..24], self.modify_date);
        BigEndian::write_u32(&mut buf[24..28], self.backup_date);
        BigEndian::write_u32(&mut buf[28..32], self.checked_date);
        BigEndian::write_u32(&mut buf[32..36], self.file_count);
        BigEndian::write_u32(&mut buf[36..40], self.folder_count);
        BigEndian::write_u32(&mut buf[40..44], self.block_size);
        BigEndian::write_u32(&mut buf[44..48], self.total_blocks);
        BigEndian::write_u32(&mut buf[48..52], self.free_blocks);
        BigEndian::write_u32(&mut buf[52..56], self.next_allocation);
        BigEndian::write_u32(&mut buf[56..60], self.rsrc_clump_size);
        BigEndian::write_u32(&mut buf[60..64], self.data_clump_size);
        BigEndian::write_u32(&mut buf[64..68], self.next_catalog_id);
        BigEndian::write_u32(&mut buf[68..72], self.write_count);
        BigEndian::write_u64(&mut buf[72..80], self.encodings_bitmap);
        buf[80..112].copy_from_slice(&self.finder_info);
        self.allocation_file.write(&mut buf[112..192]);
        self.extents_file.write(&mut buf[192..272]);
        self.catalog_file.write(&mut buf[272..352]);
        self.attributes_file.write(&mut buf[352..432]);
        self.startup_file.write(&mut buf[432..512]);
        buf
    }

    pub fn is_case_sensitive(&self) -> bool {
        self.signature == HFSX_SIGNATURE
    }
}

/// Which on-disk home a fork's descriptor record has.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecialFile {
    Allocation,
    Extents,
    Catalog,
}

/// An open fork: its owner, size, and the complete extent run list
/// (inline descriptors plus any overflow records already resolved).
#[derive(Debug, Clone)]
pub struct Fork {
    pub cnid: u32,
    pub fork_type: u8,
    pub logical_size: u64,
    pub clump_size: u32,
    pub total_blocks: u32,
    pub extents: Vec<ExtentDescriptor>,
    pub special: Option<SpecialFile>,
}

impl Fork {
    pub fn from_fork_data(
        cnid: u32,
        fork_type: u8,
        data: &ForkData,
        special: Option<SpecialFile>,
    ) -> Self {
        let extents = data
            .extents
            .iter()
            .take_while(|e| !e.is_empty())
            .copied()
            .collect();
        Self {
            cnid,
            fork_type,
            logical_size: data.logical_size,
            clump_size: data.clump_size,
            total_blocks: data.total_blocks,
            extents,
            special,
        }
    }

    /// Pack back into an 80-byte record; extents beyond the inline eight are
    /// returned for the caller to store in the extents-overflow tree.
    pub fn to_fork_data(&self) -> (ForkData, Vec<ExtentDescriptor>) {
        let mut data = ForkData {
            logical_size: self.logical_size,
            clump_size: self.clump_size,
            total_blocks: self.total_blocks,
            extents: [ExtentDescriptor::default(); 8],
        };
        for (i, ext) in self.extents.iter().take(8).enumerate() {
            data.extents[i] = *ext;
        }
        let overflow = if self.extents.len() > 8 {
            self.extents[8..].to_vec()
        } else {
            Vec::new()
        };
        (data, overflow)
    }

    /// Logical block count covered by the run list.
    pub fn blocks_in_extents(&self) -> u32 {
        self.extents.iter().map(|e| e.block_count).sum()
    }
}

/// The image plus its parsed header and open allocation fork. Every higher
/// layer (forks, B-trees, catalog) does its block I/O through this.
pub struct VolumeCore {
    pub image: Box<dyn IoSource>,
    pub header: VolumeHeader,
    pub alloc_fork: Fork,
}

impl VolumeCore {
    pub fn open(mut image: Box<dyn IoSource>) -> Result<Self> {
        let mut buf = [0u8; VOLUME_HEADER_SIZE];
        image.read_at(VOLUME_HEADER_OFFSET, &mut buf)?;
        let header = VolumeHeader::parse(&buf)?;
        let alloc_fork = Fork::from_fork_data(
            ALLOCATION_FILE_CNID,
            DATA_FORK,
            &header.allocation_file,
            Some(SpecialFile::Allocation),
        );
        debug!(
            "opened volume: {} blocks of {} bytes, {} free",
            header.total_blocks, header.block_size, header.free_blocks
        );
        Ok(Self {
            image,
            header,
            alloc_fork,
        })
    }

    pub fn block_size(&self) -> u64 {
        self.header.block_size as u64
    }

    pub fn volume_size(&self) -> u64 {
        self.header.total_blocks as u64 * self.block_size()
    }

    /// Rewrite the primary and alternate volume headers.
    pub fn flush_header(&mut self) -> Result<()> {
        let (alloc_data, overflow) = self.alloc_fork.to_fork_data();
        if !overflow.is_empty() {
            return Err(DmgError::Corrupt(
                "allocation file needs more than 8 extents".into(),
            ));
        }
        self.header.allocation_file = alloc_data;
        let bytes = self.header.to_bytes();
        self.image.write_at(VOLUME_HEADER_OFFSET, &bytes)?;
        let alternate = self.volume_size() - 1024;
        self.image.write_at(alternate, &bytes)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn synthetic_header() -> [u8; 512] {
        let mut buf = [0u8; 512];
        BigEndian::write_u16(&mut buf[0..2], HFSP_SIGNATURE);
        BigEndian::write_u16(&mut buf[2..4], 4);
        BigEndian::write_u32(&mut buf[40..44], 4096); // block size
        BigEndian::write_u32(&mut buf[44..48], 2560); // total blocks
        BigEndian::write_u32(&mut buf[48..52], 2000); // free blocks
        BigEndian::write_u32(&mut buf[64..68], FIRST_USER_CNID);
        // allocation file: 1 block at block 1
        BigEndian::write_u64(&mut buf[112..120], 4096);
        BigEndian::write_u32(&mut buf[124..128], 1);
        BigEndian::write_u32(&mut buf[128..132], 1);
        BigEndian::write_u32(&mut buf[132..136], 1);
        buf
    }

    #[test]
    fn test_parse_header_fields() {
        let header = VolumeHeader::parse(&synthetic_header()).unwrap();
        assert_eq!(header.signature, HFSP_SIGNATURE);
        assert_eq!(header.block_size, 4096);
        assert_eq!(header.total_blocks, 2560);
        assert_eq!(header.free_blocks, 2000);
        assert_eq!(header.allocation_file.logical_size, 4096);
        assert_eq!(header.allocation_file.extents[0].start_block, 1);
        assert_eq!(header.allocation_file.extents[0].block_count, 1);
    }

    #[test]
    fn test_header_roundtrip() {
        let raw = synthetic_header();
        let header = VolumeHeader::parse(&raw).unwrap();
        assert_eq!(header.to_bytes(), raw);
    }

    #[test]
    fn test_bad_signature_rejected() {
        let mut raw = synthetic_header();
        raw[0] = 0;
        raw[1] = 0;
        assert!(matches!(
            VolumeHeader::parse(&raw),
            Err(DmgError::BadSignature { .. })
        ));
    }

    #[test]
    fn test_bad_block_size_rejected() {
        let mut raw = synthetic_header();
        BigEndian::write_u32(&mut raw[40..44], 1000);
        assert!(VolumeHeader::parse(&raw).is_err());
    }

    #[test]
    fn test_fork_data_overflow_split() {
        let mut fork = Fork {
            cnid: 20,
            fork_type: DATA_FORK,
            logical_size: 40960,
            clump_size: 4096,
            total_blocks: 10,
            extents: Vec::new(),
            special: None,
        };
        for i in 0..10 {
            fork.extents.push(ExtentDescriptor {
                start_block: 100 + i * 2,
                block_count: 1,
            });
        }
        let (data, overflow) = fork.to_fork_data();
        assert_eq!(data.extents[7].start_block, 114);
        assert_eq!(overflow.len(), 2);
        assert_eq!(overflow[0].start_block, 116);
    }
}
