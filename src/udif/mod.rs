//! UDIF disk image codec.
//!
//! A UDIF image is a compressed data fork holding the sector runs of each
//! partition, followed by an XML plist resource fork describing them, and a
//! 512-byte `koly` trailer at the very end of the file. The `blkx` resources
//! in the plist map partition sectors to compressed runs in the data fork.

pub mod blkx;
pub mod dmg;
pub mod koly;
pub mod partition;
pub mod resources;

pub use blkx::{BlkxRun, BlkxTable};
pub use dmg::{build_dmg, convert_to_dmg, convert_to_iso, extract_dmg, verify_dmg};
pub use koly::{KolyTrailer, UdifChecksum};
pub use resources::{ResourceData, Resources};

/// Sector size used throughout the UDIF format.
pub const SECTOR_SIZE: u64 = 512;

/// Sectors processed per compression chunk when building a `blkx` table.
pub const SECTORS_AT_A_TIME: u64 = 0x200;

/// Layout of the synthesized device image, in sectors.
pub const DDM_SIZE: u64 = 0x1;
pub const PARTITION_SIZE: u64 = 0x3f;
pub const ATAPI_SIZE: u64 = 0x8;
pub const FREE_SIZE: u64 = 0xa;
/// Sector where the ATAPI driver partition begins.
pub const ATAPI_OFFSET: u64 = DDM_SIZE + PARTITION_SIZE;
/// Sector where the user (filesystem) partition begins.
pub const USER_OFFSET: u64 = ATAPI_OFFSET + ATAPI_SIZE;
/// Total overhead sectors around the user partition.
pub const EXTRA_SIZE: u64 = ATAPI_OFFSET + ATAPI_SIZE + FREE_SIZE;

/// Resource attribute flags hdiutil stamps on generated resources.
pub const ATTRIBUTE_HDIUTIL: u32 = 0x0050;

/// Run types within a `blkx` table.
pub const BLOCK_ZLIB: u32 = 0x80000005;
pub const BLOCK_ADC: u32 = 0x80000004;
pub const BLOCK_RAW: u32 = 0x00000001;
pub const BLOCK_IGNORE: u32 = 0x00000002;
pub const BLOCK_COMMENT: u32 = 0x7FFFFFFE;
pub const BLOCK_TERMINATOR: u32 = 0xFFFFFFFF;

/// `blocksDescriptor` values for the synthetic whole-device tables.
pub const DDM_DESCRIPTOR: u32 = 0xFFFFFFFF;
pub const ENTIRE_DEVICE_DESCRIPTOR: u32 = 0xFFFFFFFE;

/// `imageVariant` values in the koly trailer.
pub const UDIF_DEVICE_IMAGE_TYPE: u32 = 1;
pub const UDIF_PARTITION_IMAGE_TYPE: u32 = 2;

/// koly trailer flags.
pub const UDIF_FLAGS_FLATTENED: u32 = 1;
