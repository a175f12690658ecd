//! HFS+ volume support: header and fork structures, block allocation, the
//! on-disk B-tree engine, and the catalog/extents trees layered on top.

pub mod btree;
pub mod catalog;
pub mod extents;
pub mod ops;
pub mod rawfile;
pub mod unicode;
pub mod volume;

#[cfg(test)]
pub(crate) mod test_support;

pub use catalog::{CatalogKey, CatalogRecord};
pub use ops::Volume;
pub use volume::{ExtentDescriptor, Fork, ForkData, VolumeCore, VolumeHeader, VOLUME_HEADER_OFFSET};
