//! Driver Descriptor Map and Apple partition map for device images.
//!
//! A device-style image wraps the filesystem in the classic Apple disk
//! layout: one DDM sector, a 63-sector partition map, an ATAPI driver
//! partition, the user partition itself and a small free tail.

use byteorder::{BigEndian, ByteOrder};

use crate::checksum::{ChecksumToken, Crc32};
use crate::error::{DmgError, Result};
use crate::io::{IoSource, MemorySource};
use crate::udif::blkx::insert_blkx;
use crate::udif::resources::{CSumResource, NSizResource, ResourceData, Resources};
use crate::udif::{
    ATAPI_OFFSET, ATAPI_SIZE, ATTRIBUTE_HDIUTIL, DDM_DESCRIPTOR, DDM_SIZE, FREE_SIZE,
    PARTITION_SIZE, SECTOR_SIZE, USER_OFFSET,
};

pub const DRIVER_DESCRIPTOR_SIGNATURE: u16 = 0x4552;
pub const APPLE_PARTITION_MAP_SIGNATURE: u16 = 0x504D;

pub const HFSX_VOLUME_TYPE: &str = "Apple_HFSX";
pub const HFS_VOLUME_TYPE: &str = "Apple_HFS";

/// 'DMMY' boot code tag used on the driver partition.
pub const BOOTCODE_DMMY: u32 = 0x444D_4D59;

/// One driver advertised by the DDM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverDescriptor {
    pub dd_block: u32,
    pub dd_size: u16,
    pub dd_type: u16,
}

/// Sector 0 of a device image.
#[derive(Debug, Clone)]
pub struct DriverDescriptorRecord {
    pub block_size: u16,
    pub block_count: u32,
    pub drivers: Vec<DriverDescriptor>,
}

impl DriverDescriptorRecord {
    /// A DDM covering `num_sectors` of user volume, advertising the ATAPI
    /// driver partition.
    pub fn new(num_sectors: u64) -> Self {
        DriverDescriptorRecord {
            block_size: SECTOR_SIZE as u16,
            block_count: (crate::udif::EXTRA_SIZE + num_sectors) as u32,
            drivers: vec![DriverDescriptor {
                dd_block: ATAPI_OFFSET as u32,
                dd_size: ATAPI_SIZE as u16,
                dd_type: 1,
            }],
        }
    }

    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < SECTOR_SIZE as usize {
            return Err(DmgError::ShortRead { wanted: SECTOR_SIZE as usize, got: buf.len() });
        }
        let sig = BigEndian::read_u16(&buf[0..]);
        if sig != DRIVER_DESCRIPTOR_SIGNATURE {
            return Err(DmgError::BadSignature { expected: "ER", actual: sig as u64 });
        }
        let driver_count = BigEndian::read_u16(&buf[16..]) as usize;
        if driver_count > 61 {
            return Err(DmgError::Corrupt(format!("DDM claims {driver_count} drivers")));
        }
        let mut drivers = Vec::with_capacity(driver_count);
        for i in 0..driver_count {
            let base = 18 + i * 8;
            drivers.push(DriverDescriptor {
                dd_block: BigEndian::read_u32(&buf[base..]),
                dd_size: BigEndian::read_u16(&buf[base + 4..]),
                dd_type: BigEndian::read_u16(&buf[base + 6..]),
            });
        }
        Ok(DriverDescriptorRecord {
            block_size: BigEndian::read_u16(&buf[2..]),
            block_count: BigEndian::read_u32(&buf[4..]),
            drivers,
        })
    }

    pub fn to_bytes(&self) -> [u8; SECTOR_SIZE as usize] {
        let mut buf = [0u8; SECTOR_SIZE as usize];
        BigEndian::write_u16(&mut buf[0..], DRIVER_DESCRIPTOR_SIGNATURE);
        BigEndian::write_u16(&mut buf[2..], self.block_size);
        BigEndian::write_u32(&mut buf[4..], self.block_count);
        BigEndian::write_u16(&mut buf[16..], self.drivers.len() as u16);
        for (i, driver) in self.drivers.iter().enumerate() {
            let base = 18 + i * 8;
            BigEndian::write_u32(&mut buf[base..], driver.dd_block);
            BigEndian::write_u16(&mut buf[base + 4..], driver.dd_size);
            BigEndian::write_u16(&mut buf[base + 6..], driver.dd_type);
        }
        buf
    }
}

/// One Apple partition map entry, one sector on disk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Partition {
    pub map_entries: u32,
    pub start: u32,
    pub block_count: u32,
    pub name: String,
    pub kind: String,
    pub data_count: u32,
    pub status: u32,
    pub boot_size: u32,
    pub boot_code: u32,
}

impl Partition {
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < SECTOR_SIZE as usize {
            return Err(DmgError::ShortRead { wanted: SECTOR_SIZE as usize, got: buf.len() });
        }
        let sig = BigEndian::read_u16(&buf[0..]);
        if sig != APPLE_PARTITION_MAP_SIGNATURE {
            return Err(DmgError::BadSignature { expected: "PM", actual: sig as u64 });
        }
        Ok(Partition {
            map_entries: BigEndian::read_u32(&buf[4..]),
            start: BigEndian::read_u32(&buf[8..]),
            block_count: BigEndian::read_u32(&buf[12..]),
            name: fixed_string(&buf[16..48]),
            kind: fixed_string(&buf[48..80]),
            data_count: BigEndian::read_u32(&buf[84..]),
            status: BigEndian::read_u32(&buf[88..]),
            boot_size: BigEndian::read_u32(&buf[96..]),
            boot_code: BigEndian::read_u32(&buf[136..]),
        })
    }

    pub fn to_bytes(&self) -> [u8; SECTOR_SIZE as usize] {
        let mut buf = [0u8; SECTOR_SIZE as usize];
        BigEndian::write_u16(&mut buf[0..], APPLE_PARTITION_MAP_SIGNATURE);
        BigEndian::write_u32(&mut buf[4..], self.map_entries);
        BigEndian::write_u32(&mut buf[8..], self.start);
        BigEndian::write_u32(&mut buf[12..], self.block_count);
        write_fixed_string(&mut buf[16..48], &self.name);
        write_fixed_string(&mut buf[48..80], &self.kind);
        BigEndian::write_u32(&mut buf[84..], self.data_count);
        BigEndian::write_u32(&mut buf[88..], self.status);
        BigEndian::write_u32(&mut buf[96..], self.boot_size);
        BigEndian::write_u32(&mut buf[136..], self.boot_code);
        buf
    }
}

fn fixed_string(buf: &[u8]) -> String {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

fn write_fixed_string(buf: &mut [u8], value: &str) {
    let bytes = value.as_bytes();
    let take = bytes.len().min(buf.len() - 1);
    buf[..take].copy_from_slice(&bytes[..take]);
}

/// The standard four-entry map wrapping a volume of `num_sectors` sectors.
pub fn create_partition_map(num_sectors: u64, volume_type: &str) -> Vec<Partition> {
    let user_name = if volume_type == HFS_VOLUME_TYPE { "disk image" } else { "Mac_OS_X" };
    vec![
        Partition {
            map_entries: 4,
            start: DDM_SIZE as u32,
            block_count: PARTITION_SIZE as u32,
            name: "Apple".into(),
            kind: "Apple_partition_map".into(),
            data_count: PARTITION_SIZE as u32,
            status: 0x3,
            boot_size: 0,
            boot_code: 0,
        },
        Partition {
            map_entries: 4,
            start: ATAPI_OFFSET as u32,
            block_count: ATAPI_SIZE as u32,
            name: "Macintosh".into(),
            kind: "Apple_Driver_ATAPI".into(),
            data_count: ATAPI_SIZE as u32,
            status: 0x303,
            boot_size: (ATAPI_SIZE * SECTOR_SIZE) as u32,
            boot_code: BOOTCODE_DMMY,
        },
        Partition {
            map_entries: 4,
            start: USER_OFFSET as u32,
            block_count: num_sectors as u32,
            name: user_name.into(),
            kind: volume_type.into(),
            data_count: num_sectors as u32,
            status: 0x4000_0033,
            boot_size: 0,
            boot_code: 0,
        },
        Partition {
            map_entries: 4,
            start: (USER_OFFSET + num_sectors) as u32,
            block_count: FREE_SIZE as u32,
            name: String::new(),
            kind: "Apple_Free".into(),
            data_count: FREE_SIZE as u32,
            status: 0,
            boot_size: 0,
            boot_code: 0,
        },
    ]
}

/// Read a partition map from a raw device image: DDM in sector 0, entries
/// from sector 1 onwards.
pub fn read_partition_map(source: &mut dyn IoSource) -> Result<Vec<Partition>> {
    let mut sector = vec![0u8; SECTOR_SIZE as usize];
    source.read_at(0, &mut sector)?;
    DriverDescriptorRecord::parse(&sector)?;

    source.read_at(SECTOR_SIZE, &mut sector)?;
    let first = Partition::parse(&sector)?;
    let count = first.map_entries as usize;
    if count == 0 || count > PARTITION_SIZE as usize {
        return Err(DmgError::Corrupt(format!("partition map claims {count} entries")));
    }
    let mut partitions = vec![first];
    for i in 1..count {
        source.read_at(SECTOR_SIZE * (1 + i as u64), &mut sector)?;
        partitions.push(Partition::parse(&sector)?);
    }
    Ok(partitions)
}

fn compress_sectors(
    out: &mut dyn IoSource,
    plain: Vec<u8>,
    first_sector: u64,
    descriptor: u32,
    data_fork: &mut Crc32,
) -> Result<(Vec<u8>, ChecksumToken)> {
    let sectors = plain.len() as u64 / SECTOR_SIZE;
    let mut input = MemorySource::new(plain);
    let mut token = ChecksumToken::crc_only();
    let table =
        insert_blkx(out, &mut input, first_sector, sectors, descriptor, &mut token, data_fork)?;
    Ok((table.to_bytes(), token))
}

fn push_csum_and_nsiz(
    resources: &mut Resources,
    nsiz: &mut Vec<NSizResource>,
    partition_number: u32,
    token: &ChecksumToken,
) {
    resources.insert(
        "cSum",
        ResourceData {
            attributes: 0,
            id: partition_number as i32,
            name: String::new(),
            data: CSumResource::new(token.block_value()).to_bytes().to_vec(),
        },
    );
    nsiz.push(NSizResource {
        is_volume: false,
        sha1_digest: None,
        block_checksum_2: token.block_value(),
        bytes: 0,
        modify_date: 0,
        partition_number,
        version: 6,
        volume_signature: 0,
    });
}

/// Compress the DDM into `out` and register its `blkx` resource.
pub fn write_driver_descriptor_map(
    out: &mut dyn IoSource,
    ddm: &DriverDescriptorRecord,
    data_fork: &mut Crc32,
    resources: &mut Resources,
) -> Result<()> {
    let (table, _) = compress_sectors(out, ddm.to_bytes().to_vec(), 0, DDM_DESCRIPTOR, data_fork)?;
    resources.insert(
        "blkx",
        ResourceData {
            attributes: ATTRIBUTE_HDIUTIL,
            id: -1,
            name: "Driver Descriptor Map (DDM : 0)".into(),
            data: table,
        },
    );
    Ok(())
}

/// Compress the partition map sectors into `out` and register its
/// `blkx`, `cSum` and `nsiz` resources.
pub fn write_apple_partition_map(
    out: &mut dyn IoSource,
    partitions: &[Partition],
    data_fork: &mut Crc32,
    resources: &mut Resources,
    nsiz: &mut Vec<NSizResource>,
) -> Result<()> {
    let mut plain = vec![0u8; (PARTITION_SIZE * SECTOR_SIZE) as usize];
    for (i, partition) in partitions.iter().enumerate() {
        let base = i * SECTOR_SIZE as usize;
        plain[base..base + SECTOR_SIZE as usize].copy_from_slice(&partition.to_bytes());
    }
    let (table, token) = compress_sectors(out, plain, DDM_SIZE, 0, data_fork)?;
    resources.insert(
        "blkx",
        ResourceData {
            attributes: ATTRIBUTE_HDIUTIL,
            id: 0,
            name: "Apple (Apple_partition_map : 1)".into(),
            data: table,
        },
    );
    push_csum_and_nsiz(resources, nsiz, 0, &token);
    Ok(())
}

/// Compress the (empty) ATAPI driver partition into `out`.
pub fn write_atapi(
    out: &mut dyn IoSource,
    data_fork: &mut Crc32,
    resources: &mut Resources,
    nsiz: &mut Vec<NSizResource>,
) -> Result<()> {
    let plain = vec![0u8; (ATAPI_SIZE * SECTOR_SIZE) as usize];
    let (table, token) = compress_sectors(out, plain, ATAPI_OFFSET, 1, data_fork)?;
    resources.insert(
        "blkx",
        ResourceData {
            attributes: ATTRIBUTE_HDIUTIL,
            id: 1,
            name: "Macintosh (Apple_Driver_ATAPI : 2)".into(),
            data: table,
        },
    );
    push_csum_and_nsiz(resources, nsiz, 1, &token);
    Ok(())
}

/// Compress the free tail after a volume of `num_sectors` sectors.
pub fn write_free_partition(
    out: &mut dyn IoSource,
    num_sectors: u64,
    data_fork: &mut Crc32,
    resources: &mut Resources,
) -> Result<()> {
    let plain = vec![0u8; (FREE_SIZE * SECTOR_SIZE) as usize];
    let (table, _) = compress_sectors(out, plain, USER_OFFSET + num_sectors, 3, data_fork)?;
    resources.insert(
        "blkx",
        ResourceData {
            attributes: ATTRIBUTE_HDIUTIL,
            id: 3,
            name: " (Apple_Free : 4)".into(),
            data: table,
        },
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::GrowableMemorySource;
    use crate::udif::EXTRA_SIZE;

    #[test]
    fn test_ddm_roundtrip() {
        let ddm = DriverDescriptorRecord::new(2048);
        let parsed = DriverDescriptorRecord::parse(&ddm.to_bytes()).unwrap();
        assert_eq!(parsed.block_size, 512);
        assert_eq!(parsed.block_count as u64, EXTRA_SIZE + 2048);
        assert_eq!(parsed.drivers.len(), 1);
        assert_eq!(parsed.drivers[0].dd_block as u64, ATAPI_OFFSET);
    }

    #[test]
    fn test_partition_entry_roundtrip() {
        let map = create_partition_map(2048, HFSX_VOLUME_TYPE);
        for partition in &map {
            let parsed = Partition::parse(&partition.to_bytes()).unwrap();
            assert_eq!(&parsed, partition);
        }
    }

    #[test]
    fn test_map_accounts_for_every_sector() {
        let num_sectors = 2048;
        let map = create_partition_map(num_sectors, HFSX_VOLUME_TYPE);
        assert_eq!(map.len(), 4);
        let covered: u64 = map.iter().map(|p| p.block_count as u64).sum();
        assert_eq!(DDM_SIZE + covered, EXTRA_SIZE + num_sectors);
        // Partitions are laid out back to back.
        let mut next = DDM_SIZE;
        for partition in &map {
            assert_eq!(partition.start as u64, next);
            next += partition.block_count as u64;
        }
    }

    #[test]
    fn test_map_read_back_from_raw_image() {
        let num_sectors = 64;
        let mut raw = GrowableMemorySource::new();
        let ddm = DriverDescriptorRecord::new(num_sectors);
        raw.write_all(&ddm.to_bytes()).unwrap();
        for partition in create_partition_map(num_sectors, HFS_VOLUME_TYPE) {
            raw.write_all(&partition.to_bytes()).unwrap();
        }
        let map = read_partition_map(&mut raw).unwrap();
        assert_eq!(map.len(), 4);
        assert_eq!(map[2].kind, HFS_VOLUME_TYPE);
        assert_eq!(map[2].name, "disk image");
        assert_eq!(map[2].block_count as u64, num_sectors);
    }
}
