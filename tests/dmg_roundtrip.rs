//! End-to-end tests over the whole stack: format a volume, populate it,
//! wrap it as a UDIF image, verify, extract and read the contents back.
//!
//! Everything runs against in-memory sources except the file-backed test,
//! which goes through a real temporary file.
//!
//! Run with: cargo test --test dmg_roundtrip

use std::io::Cursor;

use byteorder::{BigEndian, ByteOrder};
use rusty_dmg::filevault::{FileVaultKey, FileVaultSource, FILEVAULT_HEADER_SIZE};
use rusty_dmg::hfs::Volume;
use rusty_dmg::io::{FileSource, GrowableMemorySource, IoSource};
use rusty_dmg::udif::blkx::BlkxTable;
use rusty_dmg::udif::dmg::read_image_metadata;
use rusty_dmg::udif::partition::read_partition_map;
use rusty_dmg::udif::{
    build_dmg, convert_to_iso, extract_dmg, verify_dmg, EXTRA_SIZE, SECTOR_SIZE, USER_OFFSET,
};
use rusty_dmg::DmgError;

const BLOCK_SIZE: u32 = 4096;
const TOTAL_BLOCKS: u32 = 1024; // 4 MiB volume

/// Format a small volume with a few entries and hand back its raw image.
fn populated_volume_image() -> Vec<u8> {
    let image_len = (BLOCK_SIZE * TOTAL_BLOCKS) as usize;
    let image = Box::new(GrowableMemorySource::from_vec(vec![0u8; image_len]));
    let mut volume = Volume::format(image, BLOCK_SIZE, TOTAL_BLOCKS, "Test", true).unwrap();

    volume.create_folder("docs", 0o755).unwrap();
    volume.create_file("docs/hello.txt", 0o644).unwrap();
    let body = b"Hello, HFS+!".to_vec();
    volume
        .write_file("docs/hello.txt", &mut Cursor::new(&body), body.len() as u64)
        .unwrap();
    volume.make_symlink("docs/link.txt", "hello.txt").unwrap();
    volume.sync().unwrap();

    let len = volume.core.image.len().unwrap() as usize;
    let mut bytes = vec![0u8; len];
    volume.core.image.read_at(0, &mut bytes).unwrap();
    bytes
}

// ============================================================================
// Build, verify, extract, reopen
// ============================================================================

#[test]
fn test_build_verify_extract_reopen() {
    let raw = populated_volume_image();
    let mut input = GrowableMemorySource::from_vec(raw);
    let mut image = GrowableMemorySource::new();
    let koly = build_dmg(&mut input, &mut image).unwrap();

    let vol_sectors = (BLOCK_SIZE as u64 * TOTAL_BLOCKS as u64) / SECTOR_SIZE;
    assert_eq!(koly.sector_count, EXTRA_SIZE + vol_sectors);
    // The compressed image should be far smaller than the raw volume.
    assert!(image.len().unwrap() < (vol_sectors * SECTOR_SIZE) / 4);

    verify_dmg(&mut image).unwrap();

    let mut extracted = GrowableMemorySource::new();
    extract_dmg(&mut image, &mut extracted, None).unwrap();
    assert_eq!(extracted.len().unwrap(), vol_sectors * SECTOR_SIZE);

    let mut volume = Volume::open(Box::new(extracted)).unwrap();
    let entries = volume.list_dir("docs").unwrap();
    let names: Vec<&str> = entries.iter().map(|(name, _)| name.as_str()).collect();
    assert_eq!(names, ["hello.txt", "link.txt"]);

    let mut body = Vec::new();
    volume.read_file("docs/hello.txt", &mut body).unwrap();
    assert_eq!(body, b"Hello, HFS+!");
    assert_eq!(volume.read_symlink("docs/link.txt").unwrap(), "hello.txt");
}

// ============================================================================
// Resource fork layout
// ============================================================================

#[test]
fn test_image_resource_layout() {
    let raw = populated_volume_image();
    let mut input = GrowableMemorySource::from_vec(raw);
    let mut image = GrowableMemorySource::new();
    build_dmg(&mut input, &mut image).unwrap();

    let (koly, resources) = read_image_metadata(&mut image).unwrap();

    let blkx = resources.get("blkx").unwrap();
    assert_eq!(blkx.len(), 5);
    let ids: Vec<i32> = blkx.iter().map(|d| d.id).collect();
    assert_eq!(ids, [-1, 0, 1, 2, 3]);
    assert_eq!(blkx[0].name, "Driver Descriptor Map (DDM : 0)");
    assert_eq!(blkx[3].name, "Mac_OS_X (Apple_HFSX : 3)");
    assert_eq!(blkx[4].name, " (Apple_Free : 4)");

    // Every sector of the device is covered by exactly one blkx table.
    let mut covered = 0u64;
    for datum in blkx {
        let table = BlkxTable::parse(&datum.data).unwrap();
        assert_eq!(table.first_sector_number, covered);
        covered += table.sector_count;
    }
    assert_eq!(covered, koly.sector_count);

    // cSum for partition map, ATAPI and the volume; nsiz matches; plst and
    // size are stamped once each.
    let csums: Vec<i32> = resources.get("cSum").unwrap().iter().map(|d| d.id).collect();
    assert_eq!(csums, [0, 1, 2]);
    assert_eq!(resources.get("nsiz").unwrap().len(), 3);
    assert_eq!(resources.get("plst").unwrap().len(), 1);
    assert_eq!(resources.get("size").unwrap().len(), 1);
}

// ============================================================================
// Corruption detection
// ============================================================================

#[test]
fn test_verify_catches_corruption() {
    let raw = populated_volume_image();
    let mut input = GrowableMemorySource::from_vec(raw);
    let mut image = GrowableMemorySource::new();
    build_dmg(&mut input, &mut image).unwrap();

    let mut bytes = image.into_inner();
    bytes[40] ^= 0x01;
    let mut corrupted = GrowableMemorySource::from_vec(bytes);
    assert!(matches!(
        verify_dmg(&mut corrupted),
        Err(DmgError::ChecksumMismatch { .. })
    ));
}

// ============================================================================
// File-backed images
// ============================================================================

#[test]
fn test_file_backed_build_and_extract() {
    let raw = populated_volume_image();
    let mut input = GrowableMemorySource::from_vec(raw.clone());
    let mut image = FileSource::new(tempfile::tempfile().unwrap());
    build_dmg(&mut input, &mut image).unwrap();

    verify_dmg(&mut image).unwrap();

    let mut extracted = GrowableMemorySource::new();
    extract_dmg(&mut image, &mut extracted, None).unwrap();
    assert_eq!(extracted.into_inner(), raw);
}

// ============================================================================
// Device image conversion
// ============================================================================

#[test]
fn test_convert_to_iso_restores_device_layout() {
    let raw = populated_volume_image();
    let mut input = GrowableMemorySource::from_vec(raw.clone());
    let mut image = GrowableMemorySource::new();
    build_dmg(&mut input, &mut image).unwrap();

    let mut iso = GrowableMemorySource::new();
    convert_to_iso(&mut image, &mut iso).unwrap();

    // The flattened device has a partition map up front and the volume at
    // the user offset.
    let map = read_partition_map(&mut iso).unwrap();
    assert_eq!(map.len(), 4);
    assert_eq!(map[2].kind, "Apple_HFSX");
    assert_eq!(map[2].start as u64, USER_OFFSET);

    let mut volume_bytes = vec![0u8; raw.len()];
    iso.read_at(USER_OFFSET * SECTOR_SIZE, &mut volume_bytes).unwrap();
    assert_eq!(volume_bytes, raw);
}

// ============================================================================
// FileVault wrapping
// ============================================================================

const FV_BLOCK_SIZE: u32 = 4096;
const FV_DATA_OFFSET: u64 = 1024;

/// An encrypted container big enough for `data_size` payload bytes, with a
/// zeroed ciphertext area ready to be written through a FileVaultSource.
fn empty_filevault_image(data_size: u64) -> Vec<u8> {
    // "encrcdsa"
    let signature: u64 = 0x656E_6372_6364_7361;
    let padded = data_size.div_ceil(FV_BLOCK_SIZE as u64) * FV_BLOCK_SIZE as u64;
    let mut image = vec![0u8; (FV_DATA_OFFSET + padded) as usize];
    BigEndian::write_u64(&mut image[0..], signature);
    BigEndian::write_u32(&mut image[8..], 2);
    BigEndian::write_u32(&mut image[12..], 16);
    BigEndian::write_u32(&mut image[36..], FV_BLOCK_SIZE);
    BigEndian::write_u64(&mut image[40..], data_size);
    BigEndian::write_u64(&mut image[48..], FV_DATA_OFFSET);
    assert!(FILEVAULT_HEADER_SIZE as u64 <= FV_DATA_OFFSET);
    image
}

#[test]
fn test_filevault_wrapped_image() {
    let raw = populated_volume_image();
    let mut input = GrowableMemorySource::from_vec(raw);
    let mut image = GrowableMemorySource::new();
    build_dmg(&mut input, &mut image).unwrap();
    let dmg_bytes = image.into_inner();

    let hex_key: String = (1u8..=36).map(|b| format!("{b:02x}")).collect();
    let key = FileVaultKey::from_hex(&hex_key).unwrap();

    // Write the image through the encrypting view.
    let container = empty_filevault_image(dmg_bytes.len() as u64);
    let inner = Box::new(GrowableMemorySource::from_vec(container));
    let mut vault = FileVaultSource::open(inner, &key).unwrap();
    vault.write_at(0, &dmg_bytes).unwrap();
    vault.flush().unwrap();
    let mut encrypted = vault.into_inner().unwrap();

    // The ciphertext must not contain the koly signature in the clear.
    let mut encrypted_bytes = vec![0u8; encrypted.len().unwrap() as usize];
    encrypted.read_at(0, &mut encrypted_bytes).unwrap();
    assert!(!encrypted_bytes[FV_DATA_OFFSET as usize..]
        .windows(4)
        .any(|w| w == b"koly"));

    // Through the decrypting view the image verifies and extracts.
    let mut vault =
        FileVaultSource::open(Box::new(GrowableMemorySource::from_vec(encrypted_bytes.clone())), &key)
            .unwrap();
    verify_dmg(&mut vault).unwrap();
    let mut extracted = GrowableMemorySource::new();
    extract_dmg(&mut vault, &mut extracted, None).unwrap();
    let mut volume = Volume::open(Box::new(extracted)).unwrap();
    let mut body = Vec::new();
    volume.read_file("docs/hello.txt", &mut body).unwrap();
    assert_eq!(body, b"Hello, HFS+!");

    // Flipping one ciphertext byte garbles a payload block and surfaces as
    // a checksum mismatch.
    encrypted_bytes[FV_DATA_OFFSET as usize + 10] ^= 0xFF;
    let mut vault = FileVaultSource::open(
        Box::new(GrowableMemorySource::from_vec(encrypted_bytes)),
        &key,
    )
    .unwrap();
    assert!(matches!(
        verify_dmg(&mut vault),
        Err(DmgError::ChecksumMismatch { .. })
    ));
}
