//! Shared fixtures for the volume-level unit tests: a small in-memory
//! volume with a valid header and allocation bitmap but no trees.

use byteorder::{BigEndian, ByteOrder};

use crate::hfs::volume::{
    VolumeCore, FIRST_USER_CNID, HFSP_SIGNATURE, VOLUME_HEADER_OFFSET,
};
use crate::io::MemorySource;

pub const TEST_BLOCK_SIZE: u32 = 512;
pub const TEST_TOTAL_BLOCKS: u32 = 2048;

/// Build a 1 MiB volume: 512-byte blocks, bitmap in block 3, blocks 0-3 and
/// the alternate-header block reserved.
pub fn new_test_core() -> VolumeCore {
    let bs = TEST_BLOCK_SIZE;
    let total = TEST_TOTAL_BLOCKS;
    let mut image = vec![0u8; (total * bs) as usize];

    // Bitmap: 2048 bits = 256 bytes, one block at block 3.
    let bitmap_block = 3u32;
    let used = [0u32, 1, 2, bitmap_block, total - 1];
    for block in used {
        let at = (bitmap_block * bs + block / 8) as usize;
        image[at] |= 1 << (7 - (block % 8));
    }
    let free = total - used.len() as u32;

    let mut header = [0u8; 512];
    BigEndian::write_u16(&mut header[0..2], HFSP_SIGNATURE);
    BigEndian::write_u16(&mut header[2..4], 4); // version
    BigEndian::write_u32(&mut header[40..44], bs);
    BigEndian::write_u32(&mut header[44..48], total);
    BigEndian::write_u32(&mut header[48..52], free);
    BigEndian::write_u32(&mut header[52..56], 4); // next allocation
    BigEndian::write_u32(&mut header[64..68], FIRST_USER_CNID);
    // Allocation file: one block at block 3.
    BigEndian::write_u64(&mut header[112..120], bs as u64);
    BigEndian::write_u32(&mut header[120..124], bs);
    BigEndian::write_u32(&mut header[124..128], 1);
    BigEndian::write_u32(&mut header[128..132], bitmap_block);
    BigEndian::write_u32(&mut header[132..136], 1);

    let hoff = VOLUME_HEADER_OFFSET as usize;
    image[hoff..hoff + 512].copy_from_slice(&header);
    let alt = image.len() - 1024;
    image[alt..alt + 512].copy_from_slice(&header);

    match VolumeCore::open(Box::new(MemorySource::new(image))) {
        Ok(core) => core,
        Err(e) => panic!("test volume failed to open: {}", e),
    }
}
