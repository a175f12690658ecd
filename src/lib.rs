//! An HFS+ volume and UDIF ("DMG") disk image engine.
//!
//! The crate is layered bottom-up:
//!
//! - [`io`] — the [`io::IoSource`] abstraction over files, memory buffers
//!   and other byte stores that every layer above reads and writes through.
//! - [`checksum`] — CRC32, SHA-1 and the block-rotate checksum UDIF images
//!   carry, combined into streaming tokens.
//! - [`hfs`] — the volume model: header and fork codecs, block allocation,
//!   the on-disk B-tree engine and the catalog and extents trees, with
//!   file-level operations on [`hfs::Volume`].
//! - [`udif`] — the disk image codec: compressed `blkx` sector runs, the
//!   XML resource fork, Apple partition maps and the `koly` trailer, with
//!   [`udif::build_dmg`] / [`udif::extract_dmg`] and both conversions.
//! - [`filevault`] — transparent decryption of FileVault v2 encrypted
//!   images, itself an [`io::IoSource`].

pub mod checksum;
pub mod error;
pub mod filevault;
pub mod hfs;
pub mod io;
pub mod udif;

pub use error::{DmgError, Result};
pub use filevault::{FileVaultKey, FileVaultSource};
pub use hfs::Volume;
pub use io::{FileSource, GrowableMemorySource, IoSource, MemorySource};
pub use udif::{build_dmg, convert_to_dmg, convert_to_iso, extract_dmg, verify_dmg};
