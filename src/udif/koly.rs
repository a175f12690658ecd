//! The 512-byte `koly` trailer that ends every UDIF image.

use byteorder::{BigEndian, ByteOrder};

use crate::checksum::CHECKSUM_NONE;
use crate::error::{DmgError, Result};

pub const KOLY_SIGNATURE: u32 = 0x6B6F_6C79;
pub const KOLY_VERSION: u32 = 4;
pub const KOLY_SIZE: usize = 512;

/// A typed checksum slot as stored in the trailer and in `blkx` tables.
///
/// 136 bytes on disk: type, bit size, then a fixed 32-word data area of
/// which CRC32 checksums use only the first word.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdifChecksum {
    pub kind: u32,
    pub size: u32,
    pub data: [u32; 0x20],
}

pub const UDIF_CHECKSUM_SIZE: usize = 136;

impl UdifChecksum {
    pub fn none() -> Self {
        UdifChecksum { kind: CHECKSUM_NONE, size: 0, data: [0; 0x20] }
    }

    pub fn crc32(value: u32) -> Self {
        let mut data = [0u32; 0x20];
        data[0] = value;
        UdifChecksum { kind: crate::checksum::CHECKSUM_CRC32, size: 0x20, data }
    }

    /// The CRC32 word, when this slot holds one.
    pub fn crc_value(&self) -> u32 {
        self.data[0]
    }

    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < UDIF_CHECKSUM_SIZE {
            return Err(DmgError::ShortRead { wanted: UDIF_CHECKSUM_SIZE, got: buf.len() });
        }
        let mut data = [0u32; 0x20];
        for (i, word) in data.iter_mut().enumerate() {
            *word = BigEndian::read_u32(&buf[8 + i * 4..]);
        }
        Ok(UdifChecksum {
            kind: BigEndian::read_u32(&buf[0..]),
            size: BigEndian::read_u32(&buf[4..]),
            data,
        })
    }

    pub fn write(&self, buf: &mut [u8]) {
        BigEndian::write_u32(&mut buf[0..], self.kind);
        BigEndian::write_u32(&mut buf[4..], self.size);
        for (i, word) in self.data.iter().enumerate() {
            BigEndian::write_u32(&mut buf[8 + i * 4..], *word);
        }
    }
}

impl Default for UdifChecksum {
    fn default() -> Self {
        UdifChecksum::none()
    }
}

/// The UDIF resource file trailer, always the final 512 bytes of the image.
#[derive(Debug, Clone)]
pub struct KolyTrailer {
    pub flags: u32,
    pub running_data_fork_offset: u64,
    pub data_fork_offset: u64,
    pub data_fork_length: u64,
    pub rsrc_fork_offset: u64,
    pub rsrc_fork_length: u64,
    pub segment_number: u32,
    pub segment_count: u32,
    pub segment_id: [u8; 16],
    pub data_fork_checksum: UdifChecksum,
    pub xml_offset: u64,
    pub xml_length: u64,
    pub master_checksum: UdifChecksum,
    pub image_variant: u32,
    pub sector_count: u64,
}

impl KolyTrailer {
    pub fn new(image_variant: u32, sector_count: u64) -> Self {
        KolyTrailer {
            flags: super::UDIF_FLAGS_FLATTENED,
            running_data_fork_offset: 0,
            data_fork_offset: 0,
            data_fork_length: 0,
            rsrc_fork_offset: 0,
            rsrc_fork_length: 0,
            segment_number: 1,
            segment_count: 1,
            segment_id: [0; 16],
            data_fork_checksum: UdifChecksum::none(),
            xml_offset: 0,
            xml_length: 0,
            master_checksum: UdifChecksum::none(),
            image_variant,
            sector_count,
        }
    }

    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < KOLY_SIZE {
            return Err(DmgError::ShortRead { wanted: KOLY_SIZE, got: buf.len() });
        }
        let sig = BigEndian::read_u32(&buf[0..]);
        if sig != KOLY_SIGNATURE {
            return Err(DmgError::BadSignature { expected: "koly", actual: sig as u64 });
        }
        let version = BigEndian::read_u32(&buf[4..]);
        let header_size = BigEndian::read_u32(&buf[8..]);
        if version != KOLY_VERSION || header_size != KOLY_SIZE as u32 {
            return Err(DmgError::Corrupt(format!(
                "koly trailer version {version} header size {header_size}"
            )));
        }
        let mut segment_id = [0u8; 16];
        segment_id.copy_from_slice(&buf[64..80]);
        Ok(KolyTrailer {
            flags: BigEndian::read_u32(&buf[12..]),
            running_data_fork_offset: BigEndian::read_u64(&buf[16..]),
            data_fork_offset: BigEndian::read_u64(&buf[24..]),
            data_fork_length: BigEndian::read_u64(&buf[32..]),
            rsrc_fork_offset: BigEndian::read_u64(&buf[40..]),
            rsrc_fork_length: BigEndian::read_u64(&buf[48..]),
            segment_number: BigEndian::read_u32(&buf[56..]),
            segment_count: BigEndian::read_u32(&buf[60..]),
            segment_id,
            data_fork_checksum: UdifChecksum::parse(&buf[80..216])?,
            xml_offset: BigEndian::read_u64(&buf[216..]),
            xml_length: BigEndian::read_u64(&buf[224..]),
            master_checksum: UdifChecksum::parse(&buf[352..488])?,
            image_variant: BigEndian::read_u32(&buf[488..]),
            sector_count: BigEndian::read_u64(&buf[492..]),
        })
    }

    pub fn to_bytes(&self) -> [u8; KOLY_SIZE] {
        let mut buf = [0u8; KOLY_SIZE];
        BigEndian::write_u32(&mut buf[0..], KOLY_SIGNATURE);
        BigEndian::write_u32(&mut buf[4..], KOLY_VERSION);
        BigEndian::write_u32(&mut buf[8..], KOLY_SIZE as u32);
        BigEndian::write_u32(&mut buf[12..], self.flags);
        BigEndian::write_u64(&mut buf[16..], self.running_data_fork_offset);
        BigEndian::write_u64(&mut buf[24..], self.data_fork_offset);
        BigEndian::write_u64(&mut buf[32..], self.data_fork_length);
        BigEndian::write_u64(&mut buf[40..], self.rsrc_fork_offset);
        BigEndian::write_u64(&mut buf[48..], self.rsrc_fork_length);
        BigEndian::write_u32(&mut buf[56..], self.segment_number);
        BigEndian::write_u32(&mut buf[60..], self.segment_count);
        buf[64..80].copy_from_slice(&self.segment_id);
        self.data_fork_checksum.write(&mut buf[80..216]);
        BigEndian::write_u64(&mut buf[216..], self.xml_offset);
        BigEndian::write_u64(&mut buf[224..], self.xml_length);
        self.master_checksum.write(&mut buf[352..488]);
        BigEndian::write_u32(&mut buf[488..], self.image_variant);
        BigEndian::write_u64(&mut buf[492..], self.sector_count);
        buf
    }
}
