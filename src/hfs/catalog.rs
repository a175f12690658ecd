//! Catalog tree structures: keys, folder/file/thread records and their
//! on-disk codecs. Volume-level path operations live in `ops`.

use byteorder::{BigEndian, ByteOrder};

use crate::error::{DmgError, Result};
use crate::hfs::btree::{
    BTreeHeaderRecord, BTreeKey, KeyCompare, KEY_COMPARE_CASE_FOLDING,
};
use crate::hfs::unicode::{self, HfsStr, MAX_NAME_UNITS};
use crate::hfs::volume::ForkData;

pub const RECORD_FOLDER: i16 = 1;
pub const RECORD_FILE: i16 = 2;
pub const RECORD_FOLDER_THREAD: i16 = 3;
pub const RECORD_FILE_THREAD: i16 = 4;

/// 6 bytes of fixed key fields plus the longest name.
pub const CATALOG_KEY_MAX_LENGTH: u16 = 6 + 2 * MAX_NAME_UNITS as u16;

pub const S_IFMT: u16 = 0o170000;
pub const S_IFDIR: u16 = 0o040000;
pub const S_IFREG: u16 = 0o100000;
pub const S_IFLNK: u16 = 0o120000;

/// 'slnk' / 'rhap': finder type and creator stamped on symlink files.
pub const SYMLINK_FILE_TYPE: u32 = 0x736C_6E6B;
pub const SYMLINK_CREATOR: u32 = 0x7268_6170;

/// Seconds between the 1904 epoch and the Unix epoch.
const HFS_EPOCH_OFFSET: u64 = 2_082_844_800;

/// Current time in HFS date format (seconds since 1904).
pub fn hfs_now() -> u32 {
    let unix = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    (unix + HFS_EPOCH_OFFSET) as u32
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogKey {
    pub parent_id: u32,
    pub name: HfsStr,
}

impl CatalogKey {
    pub fn new(parent_id: u32, name: &str) -> Self {
        Self {
            parent_id,
            name: unicode::name_to_units(name),
        }
    }

    /// Thread records are keyed by CNID with an empty name.
    pub fn thread(cnid: u32) -> Self {
        Self {
            parent_id: cnid,
            name: Vec::new(),
        }
    }
}

impl BTreeKey for CatalogKey {
    fn parse(data: &[u8]) -> Result<(Self, usize)> {
        let key_len = BigEndian::read_u16(&data[0..2]) as usize;
        if key_len < 6 || (key_len - 6) % 2 != 0 || data.len() < 2 + key_len {
            return Err(DmgError::Corrupt(format!(
                "bad catalog key length {}",
                key_len
            )));
        }
        let parent_id = BigEndian::read_u32(&data[2..6]);
        let unit_count = BigEndian::read_u16(&data[6..8]) as usize;
        if unit_count != (key_len - 6) / 2 {
            return Err(DmgError::Corrupt(format!(
                "catalog key name length {} does not match key length {}",
                unit_count, key_len
            )));
        }
        let mut name = Vec::with_capacity(unit_count);
        for i in 0..unit_count {
            name.push(BigEndian::read_u16(&data[8 + i * 2..10 + i * 2]));
        }
        Ok((Self { parent_id, name }, 2 + key_len))
    }

    fn to_bytes(&self) -> Vec<u8> {
        let key_len = 6 + 2 * self.name.len();
        let mut out = vec![0u8; 2 + key_len];
        BigEndian::write_u16(&mut out[0..2], key_len as u16);
        BigEndian::write_u32(&mut out[2..6], self.parent_id);
        BigEndian::write_u16(&mut out[6..8], self.name.len() as u16);
        for (i, unit) in self.name.iter().enumerate() {
            BigEndian::write_u16(&mut out[8 + i * 2..10 + i * 2], *unit);
        }
        out
    }
}

/// Parent CNID first, then the name under the volume's comparison rule.
pub fn catalog_key_compare(header: &BTreeHeaderRecord) -> KeyCompare<CatalogKey> {
    if header.key_compare_type == KEY_COMPARE_CASE_FOLDING {
        |a, b| {
            a.parent_id
                .cmp(&b.parent_id)
                .then_with(|| unicode::fast_unicode_compare(&a.name, &b.name))
        }
    } else {
        |a, b| {
            a.parent_id
                .cmp(&b.parent_id)
                .then_with(|| unicode::binary_compare(&a.name, &b.name))
        }
    }
}

/// BSD permissions block shared by files and folders.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Permissions {
    pub owner_id: u32,
    pub group_id: u32,
    pub admin_flags: u8,
    pub owner_flags: u8,
    pub file_mode: u16,
    /// Union field: inode number, link count, or raw device.
    pub special: u32,
}

impl Permissions {
    pub const SIZE: usize = 16;

    fn parse(data: &[u8]) -> Self {
        Self {
            owner_id: BigEndian::read_u32(&data[0..4]),
            group_id: BigEndian::read_u32(&data[4..8]),
            admin_flags: data[8],
            owner_flags: data[9],
            file_mode: BigEndian::read_u16(&data[10..12]),
            special: BigEndian::read_u32(&data[12..16]),
        }
    }

    fn write(&self, out: &mut [u8]) {
        BigEndian::write_u32(&mut out[0..4], self.owner_id);
        BigEndian::write_u32(&mut out[4..8], self.group_id);
        out[8] = self.admin_flags;
        out[9] = self.owner_flags;
        BigEndian::write_u16(&mut out[10..12], self.file_mode);
        BigEndian::write_u32(&mut out[12..16], self.special);
    }
}

#[derive(Debug, Clone)]
pub struct FolderRecord {
    pub flags: u16,
    pub valence: u32,
    pub folder_id: u32,
    pub create_date: u32,
    pub content_mod_date: u32,
    pub attribute_mod_date: u32,
    pub access_date: u32,
    pub backup_date: u32,
    pub permissions: Permissions,
    pub user_info: [u8; 16],
    pub finder_info: [u8; 16],
    pub text_encoding: u32,
}

impl FolderRecord {
    pub const SIZE: usize = 88;

    pub fn new(folder_id: u32, mode: u16) -> Self {
        let now = hfs_now();
        Self {
            flags: 0,
            valence: 0,
            folder_id,
            create_date: now,
            content_mod_date: now,
            attribute_mod_date: now,
            access_date: now,
            backup_date: 0,
            permissions: Permissions {
                file_mode: S_IFDIR | (mode & !S_IFMT),
                ..Permissions::default()
            },
            user_info: [0; 16],
            finder_info: [0; 16],
            text_encoding: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FileRecord {
    pub flags: u16,
    pub file_id: u32,
    pub create_date: u32,
    pub content_mod_date: u32,
    pub attribute_mod_date: u32,
    pub access_date: u32,
    pub backup_date: u32,
    pub permissions: Permissions,
    pub user_info: [u8; 16],
    pub finder_info: [u8; 16],
    pub text_encoding: u32,
    pub data_fork: ForkData,
    pub resource_fork: ForkData,
}

impl FileRecord {
    pub const SIZE: usize = 248;

    pub fn new(file_id: u32, mode: u16) -> Self {
        let now = hfs_now();
        Self {
            flags: 0,
            file_id,
            create_date: now,
            content_mod_date: now,
            attribute_mod_date: now,
            access_date: now,
            backup_date: 0,
            permissions: Permissions {
                file_mode: S_IFREG | (mode & !S_IFMT),
                ..Permissions::default()
            },
            user_info: [0; 16],
            finder_info: [0; 16],
            text_encoding: 0,
            data_fork: ForkData::default(),
            resource_fork: ForkData::default(),
        }
    }

    pub fn finder_type(&self) -> u32 {
        BigEndian::read_u32(&self.user_info[0..4])
    }

    pub fn set_finder_type(&mut self, file_type: u32, creator: u32) {
        BigEndian::write_u32(&mut self.user_info[0..4], file_type);
        BigEndian::write_u32(&mut self.user_info[4..8], creator);
    }

    pub fn is_symlink(&self) -> bool {
        self.permissions.file_mode & S_IFMT == S_IFLNK
    }
}

#[derive(Debug, Clone)]
pub struct ThreadRecord {
    pub parent_id: u32,
    pub name: HfsStr,
}

#[derive(Debug, Clone)]
pub enum CatalogRecord {
    Folder(FolderRecord),
    File(FileRecord),
    FolderThread(ThreadRecord),
    FileThread(ThreadRecord),
}

impl CatalogRecord {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 2 {
            return Err(DmgError::Corrupt("catalog record truncated".into()));
        }
        let tag = BigEndian::read_i16(&data[0..2]);
        match tag {
            RECORD_FOLDER => {
                if data.len() < FolderRecord::SIZE {
                    return Err(DmgError::Corrupt("short folder record".into()));
                }
                Ok(Self::Folder(FolderRecord {
                    flags: BigEndian::read_u16(&data[2..4]),
                    valence: BigEndian::read_u32(&data[4..8]),
                    folder_id: BigEndian::read_u32(&data[8..12]),
                    create_date: BigEndian::read_u32(&data[12..16]),
                    content_mod_date: BigEndian::read_u32(&data[16..20]),
                    attribute_mod_date: BigEndian::read_u32(&data[20..24]),
                    access_date: BigEndian::read_u32(&data[24..28]),
                    backup_date: BigEndian::read_u32(&data[28..32]),
                    permissions: Permissions::parse(&data[32..48]),
                    user_info: data[48..64].try_into().map_err(|_| {
                        DmgError::Corrupt("short folder record".into())
                    })?,
                    finder_info: data[64..80].try_into().map_err(|_| {
                        DmgError::Corrupt("short folder record".into())
                    })?,
                    text_encoding: BigEndian::read_u32(&data[80..84]),
                }))
            }
            RECORD_FILE => {
                if data.len() < FileRecord::SIZE {
                    return Err(DmgError::Corrupt("short file record".into()));
                }
                Ok(Self::File(FileRecord {
                    flags: BigEndian::read_u16(&data[2..4]),
                    file_id: BigEndian::read_u32(&data[8..12]),
                    create_date: BigEndian::read_u32(&data[12..16]),
                    content_mod_date: BigEndian::read_u32(&data[16..20]),
                    attribute_mod_date: BigEndian::read_u32(&data[20..24]),
                    access_date: BigEndian::read_u32(&data[24..28]),
                    backup_date: BigEndian::read_u32(&data[28..32]),
                    permissions: Permissions::parse(&data[32..48]),
                    user_info: data[48..64].try_into().map_err(|_| {
                        DmgError::Corrupt("short file record".into())
                    })?,
                    finder_info: data[64..80].try_into().map_err(|_| {
                        DmgError::Corrupt("short file record".into())
                    })?,
                    text_encoding: BigEndian::read_u32(&data[80..84]),
                    data_fork: ForkData::parse(&data[88..168]),
                    resource_fork: ForkData::parse(&data[168..248]),
                }))
            }
            RECORD_FOLDER_THREAD | RECORD_FILE_THREAD => {
                if data.len() < 10 {
                    return Err(DmgError::Corrupt("short thread record".into()));
                }
                let parent_id = BigEndian::read_u32(&data[4..8]);
                let unit_count = BigEndian::read_u16(&data[8..10]) as usize;
                if data.len() < 10 + unit_count * 2 {
                    return Err(DmgError::Corrupt("short thread record".into()));
                }
                let mut name = Vec::with_capacity(unit_count);
                for i in 0..unit_count {
                    name.push(BigEndian::read_u16(&data[10 + i * 2..12 + i * 2]));
                }
                let thread = ThreadRecord { parent_id, name };
                if tag == RECORD_FOLDER_THREAD {
                    Ok(Self::FolderThread(thread))
                } else {
                    Ok(Self::FileThread(thread))
                }
            }
            other => Err(DmgError::Corrupt(format!(
                "unknown catalog record type {}",
                other
            ))),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Self::Folder(f) => {
                let mut out = vec![0u8; FolderRecord::SIZE];
                BigEndian::write_i16(&mut out[0..2], RECORD_FOLDER);
                BigEndian::write_u16(&mut out[2..4], f.flags);
                BigEndian::write_u32(&mut out[4..8], f.valence);
                BigEndian::write_u32(&mut out[8..12], f.folder_id);
                BigEndian::write_u32(&mut out[12..16], f.create_date);
                BigEndian::write_u32(&mut out[16..20], f.content_mod_date);
                BigEndian::write_u32(&mut out[20..24], f.attribute_mod_date);
                BigEndian::write_u32(&mut out[24..28], f.access_date);
                BigEndian::write_u32(&mut out[28..32], f.backup_date);
                f.permissions.write(&mut out[32..48]);
                out[48..64].copy_from_slice(&f.user_info);
                out[64..80].copy_from_slice(&f.finder_info);
                BigEndian::write_u32(&mut out[80..84], f.text_encoding);
                out
            }
            Self::File(f) => {
                let mut out = vec![0u8; FileRecord::SIZE];
                BigEndian::write_i16(&mut out[0..2], RECORD_FILE);
                BigEndian::write_u16(&mut out[2..4], f.flags);
                BigEndian::write_u32(&mut out[8..12], f.file_id);
                BigEndian::write_u32(&mut out[12..16], f.create_date);
                BigEndian::write_u32(&mut out[16..20], f.content_mod_date);
                BigEndian::write_u32(&mut out[20..24], f.attribute_mod_date);
                BigEndian::write_u32(&mut out[24..28], f.access_date);
                BigEndian::write_u32(&mut out[28..32], f.backup_date);
                f.permissions.write(&mut out[32..48]);
                out[48..64].copy_from_slice(&f.user_info);
                out[64..80].copy_from_slice(&f.finder_info);
                BigEndian::write_u32(&mut out[80..84], f.text_encoding);
                f.data_fork.write(&mut out[88..168]);
                f.resource_fork.write(&mut out[168..248]);
                out
            }
            Self::FolderThread(t) | Self::FileThread(t) => {
                let tag = if matches!(self, Self::FolderThread(_)) {
                    RECORD_FOLDER_THREAD
                } else {
                    RECORD_FILE_THREAD
                };
                let mut out = vec![0u8; 10 + t.name.len() * 2];
                BigEndian::write_i16(&mut out[0..2], tag);
                BigEndian::write_u32(&mut out[4..8], t.parent_id);
                BigEndian::write_u16(&mut out[8..10], t.name.len() as u16);
                for (i, unit) in t.name.iter().enumerate() {
                    BigEndian::write_u16(&mut out[10 + i * 2..12 + i * 2], *unit);
                }
                out
            }
        }
    }

    /// The CNID this record describes, when it describes one.
    pub fn cnid(&self) -> Option<u32> {
        match self {
            Self::Folder(f) => Some(f.folder_id),
            Self::File(f) => Some(f.file_id),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::Ordering;

    fn folding_header() -> BTreeHeaderRecord {
        BTreeHeaderRecord {
            tree_depth: 0,
            root_node: 0,
            leaf_records: 0,
            first_leaf: 0,
            last_leaf: 0,
            node_size: 4096,
            max_key_length: CATALOG_KEY_MAX_LENGTH,
            total_nodes: 1,
            free_nodes: 0,
            clump_size: 4096,
            btree_type: 0,
            key_compare_type: KEY_COMPARE_CASE_FOLDING,
            attributes: 6,
        }
    }

    #[test]
    fn test_key_roundtrip() {
        let key = CatalogKey::new(2, "Read Me.txt");
        let bytes = key.to_bytes();
        let (back, used) = CatalogKey::parse(&bytes).unwrap();
        assert_eq!(used, bytes.len());
        assert_eq!(back, key);
    }

    #[test]
    fn test_key_compare_folds_case() {
        let cmp = catalog_key_compare(&folding_header());
        let a = CatalogKey::new(2, "hello");
        let b = CatalogKey::new(2, "HELLO");
        assert_eq!(cmp(&a, &b), Ordering::Equal);
        let mut binary_header = folding_header();
        binary_header.key_compare_type = 0xBC;
        let cmp = catalog_key_compare(&binary_header);
        assert_ne!(cmp(&a, &b), Ordering::Equal);
    }

    #[test]
    fn test_parent_dominates_name() {
        let cmp = catalog_key_compare(&folding_header());
        let a = CatalogKey::new(2, "zzz");
        let b = CatalogKey::new(3, "aaa");
        assert_eq!(cmp(&a, &b), Ordering::Less);
    }

    #[test]
    fn test_folder_record_roundtrip() {
        let folder = FolderRecord::new(16, 0o755);
        let bytes = CatalogRecord::Folder(folder.clone()).to_bytes();
        assert_eq!(bytes.len(), FolderRecord::SIZE);
        match CatalogRecord::parse(&bytes).unwrap() {
            CatalogRecord::Folder(back) => {
                assert_eq!(back.folder_id, 16);
                assert_eq!(back.permissions.file_mode, S_IFDIR | 0o755);
                assert_eq!(back.valence, 0);
            }
            other => panic!("wrong record type: {:?}", other),
        }
    }

    #[test]
    fn test_file_record_roundtrip_with_forks() {
        let mut file = FileRecord::new(17, 0o644);
        file.data_fork.logical_size = 1234;
        file.data_fork.total_blocks = 1;
        file.set_finder_type(SYMLINK_FILE_TYPE, SYMLINK_CREATOR);
        let bytes = CatalogRecord::File(file).to_bytes();
        assert_eq!(bytes.len(), FileRecord::SIZE);
        match CatalogRecord::parse(&bytes).unwrap() {
            CatalogRecord::File(back) => {
                assert_eq!(back.file_id, 17);
                assert_eq!(back.data_fork.logical_size, 1234);
                assert_eq!(back.finder_type(), SYMLINK_FILE_TYPE);
            }
            other => panic!("wrong record type: {:?}", other),
        }
    }

    #[test]
    fn test_thread_record_roundtrip() {
        let thread = CatalogRecord::FileThread(ThreadRecord {
            parent_id: 2,
            name: crate::hfs::unicode::name_to_units("notes.txt"),
        });
        let bytes = thread.to_bytes();
        match CatalogRecord::parse(&bytes).unwrap() {
            CatalogRecord::FileThread(back) => {
                assert_eq!(back.parent_id, 2);
                assert_eq!(
                    crate::hfs::unicode::units_to_name(&back.name),
                    "notes.txt"
                );
            }
            other => panic!("wrong record type: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_record_type_rejected() {
        let mut bytes = vec![0u8; 16];
        BigEndian::write_i16(&mut bytes[0..2], 9);
        assert!(matches!(
            CatalogRecord::parse(&bytes),
            Err(DmgError::Corrupt(_))
        ));
    }
}
