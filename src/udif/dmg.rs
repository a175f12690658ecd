//! Building, extracting, converting and verifying whole UDIF images.

use std::time::{SystemTime, UNIX_EPOCH};

use byteorder::{BigEndian, ByteOrder};
use log::{debug, info};

use crate::checksum::{ChecksumToken, Crc32, Sha1Sum, CHECKSUM_CRC32};
use crate::error::{DmgError, Result};
use crate::hfs::{VolumeHeader, VOLUME_HEADER_OFFSET};
use crate::io::IoSource;
use crate::udif::blkx::{extract_blkx, insert_blkx, BlkxTable};
use crate::udif::koly::{KolyTrailer, UdifChecksum, KOLY_SIZE};
use crate::udif::partition::{
    create_partition_map, read_partition_map, write_apple_partition_map, write_atapi,
    write_driver_descriptor_map, write_free_partition, DriverDescriptorRecord, HFSX_VOLUME_TYPE,
    HFS_VOLUME_TYPE,
};
use crate::udif::resources::{
    make_plst, make_size, write_nsiz, CSumResource, NSizResource, ResourceData, Resources,
};
use crate::udif::{
    ATTRIBUTE_HDIUTIL, ENTIRE_DEVICE_DESCRIPTOR, EXTRA_SIZE, SECTOR_SIZE,
    UDIF_DEVICE_IMAGE_TYPE, UDIF_PARTITION_IMAGE_TYPE, USER_OFFSET,
};

const VERIFY_CHUNK: usize = 1024 * 1024;

/// Wrap a raw HFS+ volume image as a flattened device-style UDIF image.
///
/// The volume is framed with a DDM, Apple partition map, ATAPI driver
/// partition and free tail, each stored as its own compressed `blkx`.
pub fn build_dmg(image: &mut dyn IoSource, out: &mut dyn IoSource) -> Result<KolyTrailer> {
    let mut header_buf = [0u8; 512];
    image.read_at(VOLUME_HEADER_OFFSET, &mut header_buf)?;
    let header = VolumeHeader::parse(&header_buf)?;
    let vol_sectors = header.total_blocks as u64 * header.block_size as u64 / SECTOR_SIZE;

    let volume_type =
        if header.is_case_sensitive() { HFSX_VOLUME_TYPE } else { HFS_VOLUME_TYPE };
    let partitions = create_partition_map(vol_sectors, volume_type);
    let user_partition_name =
        format!("{} ({} : 3)", partitions[2].name, partitions[2].kind);

    let mut resources = Resources::new();
    let mut nsiz: Vec<NSizResource> = Vec::new();
    let mut data_fork = Crc32::new();

    info!("writing DDM and partition map");
    let ddm = DriverDescriptorRecord::new(vol_sectors);
    write_driver_descriptor_map(out, &ddm, &mut data_fork, &mut resources)?;
    write_apple_partition_map(out, &partitions, &mut data_fork, &mut resources, &mut nsiz)?;
    write_atapi(out, &mut data_fork, &mut resources, &mut nsiz)?;

    info!("writing main data blkx ({vol_sectors} sectors)");
    image.seek(0)?;
    let mut token = ChecksumToken::full();
    let table = insert_blkx(out, image, USER_OFFSET, vol_sectors, 2, &mut token, &mut data_fork)?;
    resources.insert(
        "blkx",
        ResourceData {
            attributes: ATTRIBUTE_HDIUTIL,
            id: 2,
            name: user_partition_name,
            data: table.to_bytes(),
        },
    );
    let block_value = token.block_value();
    resources.insert(
        "cSum",
        ResourceData {
            attributes: 0,
            id: 2,
            name: String::new(),
            data: CSumResource::new(block_value).to_bytes().to_vec(),
        },
    );
    let volume_nsiz = NSizResource {
        is_volume: true,
        sha1_digest: token.sha1_digest(),
        block_checksum_2: block_value,
        bytes: (header.total_blocks - header.free_blocks) as u64 * header.block_size as u64,
        modify_date: header.modify_date,
        partition_number: 2,
        version: 6,
        volume_signature: header.signature,
    };
    nsiz.insert(nsiz.len().min(1), volume_nsiz);

    write_free_partition(out, vol_sectors, &mut data_fork, &mut resources)?;

    write_nsiz(&mut resources, &nsiz);
    make_plst(&mut resources);
    make_size(&mut resources, &header);

    let mut koly =
        KolyTrailer::new(UDIF_DEVICE_IMAGE_TYPE, EXTRA_SIZE + vol_sectors);
    finish_image(out, &mut koly, &resources, data_fork.value())?;
    Ok(koly)
}

/// Wrap an arbitrary raw device image (partitioned or not) as a UDIF image.
///
/// With a Driver Descriptor Map in sector 0 each mapped partition becomes
/// its own `blkx`; otherwise the whole disk is stored as one table.
pub fn convert_to_dmg(input: &mut dyn IoSource, out: &mut dyn IoSource) -> Result<KolyTrailer> {
    let mut resources = Resources::new();
    let mut nsiz: Vec<NSizResource> = Vec::new();
    let mut data_fork = Crc32::new();

    let mut sector = vec![0u8; SECTOR_SIZE as usize];
    input.read_at(0, &mut sector)?;

    let (image_variant, num_sectors) = match DriverDescriptorRecord::parse(&sector) {
        Ok(ddm) => {
            info!("device image, processing partition map");
            write_driver_descriptor_map(out, &ddm, &mut data_fork, &mut resources)?;
            let partitions = read_partition_map(input)?;
            let mut num_sectors = 0u64;
            for (i, partition) in partitions.iter().enumerate() {
                debug!("processing blkx {i} of {}", partitions.len());
                let name = format!("{} ({} : {})", partition.name, partition.kind, i + 1);
                input.seek(partition.start as u64 * SECTOR_SIZE)?;
                let mut token = ChecksumToken::crc_only();
                let table = insert_blkx(
                    out,
                    input,
                    partition.start as u64,
                    partition.block_count as u64,
                    i as u32,
                    &mut token,
                    &mut data_fork,
                )?;
                resources.insert(
                    "blkx",
                    ResourceData {
                        attributes: ATTRIBUTE_HDIUTIL,
                        id: i as i32,
                        name,
                        data: table.to_bytes(),
                    },
                );
                resources.insert(
                    "cSum",
                    ResourceData {
                        attributes: 0,
                        id: i as i32,
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
                    partition_number: i as u32,
                    version: 6,
                    volume_signature: 0,
                });
                num_sectors =
                    num_sectors.max(partition.start as u64 + partition.block_count as u64);
            }
            (UDIF_DEVICE_IMAGE_TYPE, num_sectors)
        }
        Err(DmgError::BadSignature { .. }) => {
            info!("no DDM, storing the whole disk as one blkx");
            let num_sectors = input.len()? / SECTOR_SIZE;
            input.seek(0)?;
            let mut token = ChecksumToken::crc_only();
            let table = insert_blkx(
                out,
                input,
                0,
                num_sectors,
                ENTIRE_DEVICE_DESCRIPTOR,
                &mut token,
                &mut data_fork,
            )?;
            resources.insert(
                "blkx",
                ResourceData {
                    attributes: ATTRIBUTE_HDIUTIL,
                    id: 0,
                    name: "whole disk (unknown partition : 0)".into(),
                    data: table.to_bytes(),
                },
            );
            resources.insert(
                "cSum",
                ResourceData {
                    attributes: 0,
                    id: 0,
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
                partition_number: 0,
                version: 6,
                volume_signature: 0,
            });
            (UDIF_PARTITION_IMAGE_TYPE, num_sectors)
        }
        Err(e) => return Err(e),
    };

    write_nsiz(&mut resources, &nsiz);
    make_plst(&mut resources);

    let mut koly = KolyTrailer::new(image_variant, num_sectors);
    finish_image(out, &mut koly, &resources, data_fork.value())?;
    Ok(koly)
}

/// Write the plist and trailer, completing the image.
fn finish_image(
    out: &mut dyn IoSource,
    koly: &mut KolyTrailer,
    resources: &Resources,
    data_fork_crc: u32,
) -> Result<()> {
    let plist_offset = out.tell()?;
    let xml = resources.to_plist();
    out.write_all(&xml)?;

    koly.data_fork_length = plist_offset;
    koly.data_fork_checksum = UdifChecksum::crc32(data_fork_crc);
    koly.xml_offset = plist_offset;
    koly.xml_length = xml.len() as u64;
    koly.segment_id = generate_segment_id(data_fork_crc);
    koly.master_checksum = UdifChecksum::crc32(calculate_master_checksum(resources)?);
    debug!("master checksum: {:#x}", koly.master_checksum.crc_value());

    out.write_all(&koly.to_bytes())?;
    Ok(())
}

/// CRC32 over the big-endian CRC words of every CRC-checksummed blkx table.
pub fn calculate_master_checksum(resources: &Resources) -> Result<u32> {
    let mut buffer = Vec::new();
    if let Some(data) = resources.get("blkx") {
        for datum in data {
            let table = BlkxTable::parse(&datum.data)?;
            if table.checksum.kind == CHECKSUM_CRC32 {
                let mut word = [0u8; 4];
                BigEndian::write_u32(&mut word, table.checksum.crc_value());
                buffer.extend_from_slice(&word);
            }
        }
    }
    Ok(crate::checksum::crc32(&buffer))
}

fn generate_segment_id(seed: u32) -> [u8; 16] {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let mut sha1 = Sha1Sum::new();
    sha1.update(&nanos.to_be_bytes());
    sha1.update(&seed.to_be_bytes());
    let digest = sha1.finalize();
    let mut id = [0u8; 16];
    id.copy_from_slice(&digest[..16]);
    id
}

/// Read the trailer and resource fork from the end of a UDIF image.
pub fn read_image_metadata(input: &mut dyn IoSource) -> Result<(KolyTrailer, Resources)> {
    let len = input.len()?;
    if len < KOLY_SIZE as u64 {
        return Err(DmgError::ShortRead { wanted: KOLY_SIZE, got: len as usize });
    }
    let mut trailer_buf = [0u8; KOLY_SIZE];
    input.read_at(len - KOLY_SIZE as u64, &mut trailer_buf)?;
    let koly = KolyTrailer::parse(&trailer_buf)?;

    let mut xml = vec![0u8; koly.xml_length as usize];
    input.read_at(koly.xml_offset, &mut xml)?;
    let resources = Resources::parse_plist(&xml)?;
    Ok((koly, resources))
}

/// Extract one partition of a UDIF image as a raw volume image.
///
/// With no partition number the first `blkx` whose name mentions an HFS
/// volume is chosen, which is the main partition in the standard layout.
pub fn extract_dmg(
    input: &mut dyn IoSource,
    out: &mut dyn IoSource,
    partition: Option<i32>,
) -> Result<()> {
    let (_, resources) = read_image_metadata(input)?;
    let datum = match partition {
        Some(id) => resources.get_data_by_id("blkx", id),
        None => resources
            .get("blkx")
            .and_then(|data| data.iter().find(|d| d.name.contains("Apple_HFS"))),
    }
    .ok_or_else(|| DmgError::NotFound("blkx resource for requested partition".into()))?;

    info!("extracting {}", datum.name);
    let table = BlkxTable::parse(&datum.data)?;
    out.seek(0)?;
    extract_blkx(input, out, &table)
}

/// Flatten every partition of a UDIF image back into a raw device image.
pub fn convert_to_iso(input: &mut dyn IoSource, out: &mut dyn IoSource) -> Result<()> {
    let (_, resources) = read_image_metadata(input)?;
    let data = resources
        .get("blkx")
        .ok_or_else(|| DmgError::NotFound("blkx resources".into()))?
        .to_vec();
    for datum in &data {
        let table = BlkxTable::parse(&datum.data)?;
        debug!("writing {} at sector {}", datum.name, table.first_sector_number);
        out.seek(table.first_sector_number * SECTOR_SIZE)?;
        extract_blkx(input, out, &table)?;
    }
    Ok(())
}

/// Check the data fork CRC and master checksum of an image.
pub fn verify_dmg(input: &mut dyn IoSource) -> Result<()> {
    let (koly, resources) = read_image_metadata(input)?;

    if koly.data_fork_checksum.kind == CHECKSUM_CRC32 {
        let mut crc = Crc32::new();
        let mut remaining = koly.data_fork_length;
        let mut offset = koly.data_fork_offset;
        let mut page = vec![0u8; VERIFY_CHUNK];
        while remaining > 0 {
            let step = remaining.min(VERIFY_CHUNK as u64) as usize;
            input.read_at(offset, &mut page[..step])?;
            crc.update(&page[..step]);
            offset += step as u64;
            remaining -= step as u64;
        }
        if crc.value() != koly.data_fork_checksum.crc_value() {
            return Err(DmgError::ChecksumMismatch {
                expected: koly.data_fork_checksum.crc_value(),
                actual: crc.value(),
            });
        }
    }

    if koly.master_checksum.kind == CHECKSUM_CRC32 {
        let recomputed = calculate_master_checksum(&resources)?;
        if recomputed != koly.master_checksum.crc_value() {
            return Err(DmgError::ChecksumMismatch {
                expected: koly.master_checksum.crc_value(),
                actual: recomputed,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::GrowableMemorySource;
    use crate::udif::DDM_SIZE;

    #[test]
    fn test_convert_whole_disk_roundtrip() {
        let mut plain = vec![0u8; (32 * SECTOR_SIZE) as usize];
        for (i, byte) in plain.iter_mut().enumerate() {
            *byte = ((i / 100) % 256) as u8;
        }
        let mut input = GrowableMemorySource::from_vec(plain.clone());
        let mut image = GrowableMemorySource::new();
        let koly = convert_to_dmg(&mut input, &mut image).unwrap();
        assert_eq!(koly.image_variant, UDIF_PARTITION_IMAGE_TYPE);
        assert_eq!(koly.sector_count, 32);

        verify_dmg(&mut image).unwrap();

        let mut restored = GrowableMemorySource::new();
        convert_to_iso(&mut image, &mut restored).unwrap();
        assert_eq!(restored.into_inner(), plain);
    }

    #[test]
    fn test_convert_device_image_keeps_partitions() {
        // A tiny device image: DDM, map, then one-sector partitions.
        let vol_sectors = 16u64;
        let total = EXTRA_SIZE + vol_sectors;
        let mut raw = vec![0u8; (total * SECTOR_SIZE) as usize];
        let ddm = DriverDescriptorRecord::new(vol_sectors);
        raw[..SECTOR_SIZE as usize].copy_from_slice(&ddm.to_bytes());
        for (i, partition) in create_partition_map(vol_sectors, HFS_VOLUME_TYPE).iter().enumerate()
        {
            let base = ((DDM_SIZE as usize + i) * SECTOR_SIZE as usize) as usize;
            raw[base..base + SECTOR_SIZE as usize].copy_from_slice(&partition.to_bytes());
        }
        for (i, byte) in raw
            [(USER_OFFSET * SECTOR_SIZE) as usize..((USER_OFFSET + vol_sectors) * SECTOR_SIZE) as usize]
            .iter_mut()
            .enumerate()
        {
            *byte = (i % 253) as u8;
        }

        let mut input = GrowableMemorySource::from_vec(raw.clone());
        let mut image = GrowableMemorySource::new();
        let koly = convert_to_dmg(&mut input, &mut image).unwrap();
        assert_eq!(koly.image_variant, UDIF_DEVICE_IMAGE_TYPE);
        assert_eq!(koly.sector_count, total);
        verify_dmg(&mut image).unwrap();

        let (_, resources) = read_image_metadata(&mut image).unwrap();
        let blkx = resources.get("blkx").unwrap();
        // DDM plus four mapped partitions.
        assert_eq!(blkx.len(), 5);
        assert!(blkx.iter().any(|d| d.name.contains("Apple_HFS")));

        let mut restored = GrowableMemorySource::new();
        convert_to_iso(&mut image, &mut restored).unwrap();
        assert_eq!(restored.into_inner(), raw);
    }

    #[test]
    fn test_verify_catches_data_fork_corruption() {
        let plain = vec![0xA5u8; (8 * SECTOR_SIZE) as usize];
        let mut input = GrowableMemorySource::from_vec(plain);
        let mut image = GrowableMemorySource::new();
        convert_to_dmg(&mut input, &mut image).unwrap();

        let mut bytes = image.into_inner();
        bytes[10] ^= 0xFF;
        let mut corrupted = GrowableMemorySource::from_vec(bytes);
        assert!(matches!(
            verify_dmg(&mut corrupted),
            Err(DmgError::ChecksumMismatch { .. })
        ));
    }
}
