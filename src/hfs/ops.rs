//! Path-level volume operations: open/format, lookup, create, read, write,
//! remove, move, permissions and volume growth. Everything funnels through
//! the catalog and extents-overflow trees.

use std::io::{Read, Write};

use log::{debug, warn};

use crate::error::{DmgError, Result};
use crate::hfs::btree::BTree;
use crate::hfs::catalog::{
    self, catalog_key_compare, CatalogKey, CatalogRecord, FileRecord, FolderRecord,
    ThreadRecord, CATALOG_KEY_MAX_LENGTH, SYMLINK_CREATOR, SYMLINK_FILE_TYPE,
};
use crate::hfs::extents::{
    extent_key_compare, parse_extent_record, write_extent_record, ExtentKey,
    EXTENTS_PER_RECORD, EXTENT_KEY_LENGTH,
};
use crate::hfs::unicode;
use crate::hfs::volume::{
    Fork, ForkData, SpecialFile, VolumeCore, VolumeHeader, CATALOG_FILE_CNID,
    DATA_FORK, EXTENTS_FILE_CNID, FIRST_USER_CNID, HFSP_SIGNATURE, HFSX_SIGNATURE,
    ROOT_FOLDER_CNID, ROOT_PARENT_CNID,
};
use crate::io::IoSource;

/// Streaming transfer unit for file contents.
const CHUNK_SIZE: usize = 1024 * 1024;

const MAX_SYMLINK_HOPS: u32 = 32;

const EXTENTS_NODE_SIZE: u16 = 1024;
const CATALOG_NODE_SIZE: u16 = 4096;
const EXTENTS_INITIAL_NODES: u64 = 4;
const CATALOG_INITIAL_NODES: u64 = 8;

/// Big keys; the catalog additionally uses variable-length index keys.
const ATTR_BIG_KEYS: u32 = 2;
const ATTR_VARIABLE_INDEX_KEYS: u32 = 4;

/// An open HFS+ volume: the core plus its catalog and extents trees.
pub struct Volume {
    pub core: VolumeCore,
    catalog: BTree<CatalogKey>,
    extents: BTree<ExtentKey>,
}

impl Volume {
    pub fn open(image: Box<dyn IoSource>) -> Result<Self> {
        let mut core = VolumeCore::open(image)?;
        let extents_fork = Fork::from_fork_data(
            EXTENTS_FILE_CNID,
            DATA_FORK,
            &core.header.extents_file,
            Some(SpecialFile::Extents),
        );
        let extents = BTree::open(&mut core, extents_fork, extent_key_compare)?;
        let catalog_fork = Fork::from_fork_data(
            CATALOG_FILE_CNID,
            DATA_FORK,
            &core.header.catalog_file,
            Some(SpecialFile::Catalog),
        );
        let catalog = BTree::open(&mut core, catalog_fork, catalog_key_compare)?;
        Ok(Self {
            core,
            catalog,
            extents,
        })
    }

    /// Write a fresh filesystem onto `image` and open it. The image must
    /// already span `total_blocks * block_size` bytes (or grow on write).
    pub fn format(
        image: Box<dyn IoSource>,
        block_size: u32,
        total_blocks: u32,
        name: &str,
        case_sensitive: bool,
    ) -> Result<Self> {
        if block_size < 512 || !block_size.is_power_of_two() {
            return Err(DmgError::Corrupt(format!(
                "bad allocation block size {}",
                block_size
            )));
        }
        let bs = block_size as u64;
        // Boot blocks and the volume header occupy the first 1536 bytes.
        let reserved_head = 1536u64.div_ceil(bs) as u32;
        let bitmap_bytes = (total_blocks as u64).div_ceil(8);
        let bitmap_blocks = bitmap_bytes.div_ceil(bs) as u32;
        let metadata_blocks = reserved_head + bitmap_blocks;
        if total_blocks <= metadata_blocks + 1 {
            return Err(DmgError::InsufficientSpace {
                needed: (metadata_blocks + 2) as u64 * bs,
                available: total_blocks as u64 * bs,
            });
        }

        let now = catalog::hfs_now();
        let mut header = VolumeHeader {
            signature: if case_sensitive {
                HFSX_SIGNATURE
            } else {
                HFSP_SIGNATURE
            },
            version: if case_sensitive { 5 } else { 4 },
            attributes: 1 << 8, // volume unmounted cleanly
            last_mounted_version: 0,
            journal_info_block: 0,
            create_date: now,
            modify_date: now,
            backup_date: 0,
            checked_date: now,
            file_count: 0,
            folder_count: 0,
            block_size,
            total_blocks,
            free_blocks: total_blocks - metadata_blocks - 1,
            next_allocation: metadata_blocks,
            rsrc_clump_size: block_size,
            data_clump_size: block_size,
            next_catalog_id: FIRST_USER_CNID,
            write_count: 0,
            encodings_bitmap: 1,
            finder_info: [0; 32],
            allocation_file: ForkData::default(),
            extents_file: ForkData::default(),
            catalog_file: ForkData::default(),
            attributes_file: ForkData::default(),
            startup_file: ForkData::default(),
        };
        header.allocation_file.logical_size = bitmap_bytes;
        header.allocation_file.clump_size = block_size;
        header.allocation_file.total_blocks = bitmap_blocks;
        header.allocation_file.extents[0].start_block = reserved_head;
        header.allocation_file.extents[0].block_count = bitmap_blocks;

        let alloc_fork = Fork::from_fork_data(
            crate::hfs::volume::ALLOCATION_FILE_CNID,
            DATA_FORK,
            &header.allocation_file,
            Some(SpecialFile::Allocation),
        );
        let mut core = VolumeCore {
            image,
            header,
            alloc_fork,
        };
        core.zero_blocks(reserved_head, bitmap_blocks)?;
        for block in 0..metadata_blocks {
            core.set_block_used(block, true)?;
        }
        core.set_block_used(total_blocks - 1, true)?;
        // Bits past the last block stay set so the scanner never claims them.
        for bit in total_blocks..(bitmap_bytes * 8) as u32 {
            core.set_block_used(bit, true)?;
        }

        debug!(
            "formatting {} blocks of {} bytes ({} reserved)",
            total_blocks,
            block_size,
            metadata_blocks + 1
        );

        let mut extents_fork = Fork {
            cnid: EXTENTS_FILE_CNID,
            fork_type: DATA_FORK,
            logical_size: 0,
            clump_size: EXTENTS_INITIAL_NODES as u32 * EXTENTS_NODE_SIZE as u32,
            total_blocks: 0,
            extents: Vec::new(),
            special: Some(SpecialFile::Extents),
        };
        core.allocate(
            &mut extents_fork,
            EXTENTS_INITIAL_NODES * EXTENTS_NODE_SIZE as u64,
        )?;
        let extents = BTree::create(
            &mut core,
            extents_fork,
            EXTENTS_NODE_SIZE,
            EXTENT_KEY_LENGTH,
            0,
            ATTR_BIG_KEYS,
            extent_key_compare,
        )?;

        let mut catalog_fork = Fork {
            cnid: CATALOG_FILE_CNID,
            fork_type: DATA_FORK,
            logical_size: 0,
            clump_size: CATALOG_INITIAL_NODES as u32 * CATALOG_NODE_SIZE as u32,
            total_blocks: 0,
            extents: Vec::new(),
            special: Some(SpecialFile::Catalog),
        };
        core.allocate(
            &mut catalog_fork,
            CATALOG_INITIAL_NODES * CATALOG_NODE_SIZE as u64,
        )?;
        let compare_type = if case_sensitive {
            crate::hfs::btree::KEY_COMPARE_BINARY
        } else {
            crate::hfs::btree::KEY_COMPARE_CASE_FOLDING
        };
        let mut cat = BTree::create(
            &mut core,
            catalog_fork,
            CATALOG_NODE_SIZE,
            CATALOG_KEY_MAX_LENGTH,
            compare_type,
            ATTR_BIG_KEYS | ATTR_VARIABLE_INDEX_KEYS,
            catalog_key_compare,
        )?;

        // Root folder plus its thread record.
        let root = FolderRecord::new(ROOT_FOLDER_CNID, 0o755);
        cat.insert(
            &mut core,
            &CatalogKey::new(ROOT_PARENT_CNID, name),
            &CatalogRecord::Folder(root).to_bytes(),
        )?;
        cat.insert(
            &mut core,
            &CatalogKey::thread(ROOT_FOLDER_CNID),
            &CatalogRecord::FolderThread(ThreadRecord {
                parent_id: ROOT_PARENT_CNID,
                name: unicode::name_to_units(name),
            })
            .to_bytes(),
        )?;

        let mut volume = Self {
            core,
            catalog: cat,
            extents,
        };
        volume.sync()?;
        Ok(volume)
    }

    /// Persist tree fork records and both volume headers.
    pub fn sync(&mut self) -> Result<()> {
        let (catalog_data, overflow) = self.catalog.fork.to_fork_data();
        if !overflow.is_empty() {
            return Err(DmgError::Corrupt(
                "catalog file needs more than 8 extents".into(),
            ));
        }
        self.core.header.catalog_file = catalog_data;
        let (extents_data, overflow) = self.extents.fork.to_fork_data();
        if !overflow.is_empty() {
            return Err(DmgError::Corrupt(
                "extents file needs more than 8 extents".into(),
            ));
        }
        self.core.header.extents_file = extents_data;
        self.core.header.modify_date = catalog::hfs_now();
        self.core.header.write_count = self.core.header.write_count.wrapping_add(1);
        self.core.flush_header()
    }

    // Path plumbing.

    fn components(path: &str) -> Vec<&str> {
        path.split('/').filter(|c| !c.is_empty()).collect()
    }

    fn root_record(&mut self) -> Result<(CatalogKey, CatalogRecord)> {
        self.record_for_cnid(ROOT_FOLDER_CNID)
    }

    /// Follow a CNID's thread record back to its main catalog record.
    pub fn record_for_cnid(&mut self, cnid: u32) -> Result<(CatalogKey, CatalogRecord)> {
        let Self { core, catalog, .. } = self;
        let data = catalog
            .get(core, &CatalogKey::thread(cnid))?
            .ok_or_else(|| DmgError::NotFound(format!("cnid {}", cnid)))?;
        let key = match CatalogRecord::parse(&data)? {
            CatalogRecord::FolderThread(t) | CatalogRecord::FileThread(t) => CatalogKey {
                parent_id: t.parent_id,
                name: t.name,
            },
            _ => {
                return Err(DmgError::Corrupt(format!(
                    "cnid {} thread is not a thread record",
                    cnid
                )))
            }
        };
        let data = catalog.get(core, &key)?.ok_or_else(|| {
            DmgError::Corrupt(format!("cnid {} thread points at nothing", cnid))
        })?;
        Ok((key, CatalogRecord::parse(&data)?))
    }

    /// Resolve a path to its catalog key and record. Symlinks in
    /// intermediate components are followed; a symlink in the final
    /// component is returned as found.
    pub fn lookup(&mut self, path: &str) -> Result<(CatalogKey, CatalogRecord)> {
        self.resolve_path(path, false)
    }

    /// Resolve a path, also following a symlink in the final component.
    pub fn lookup_traversed(&mut self, path: &str) -> Result<(CatalogKey, CatalogRecord)> {
        self.resolve_path(path, true)
    }

    fn resolve_path(
        &mut self,
        path: &str,
        traverse_final: bool,
    ) -> Result<(CatalogKey, CatalogRecord)> {
        let mut parts: Vec<String> =
            Self::components(path).iter().map(|p| p.to_string()).collect();
        let mut parent = ROOT_FOLDER_CNID;
        let mut hops = 0u32;
        let mut i = 0;
        while i < parts.len() {
            let key = CatalogKey::new(parent, &parts[i]);
            let Self { core, catalog, .. } = self;
            let data = catalog
                .get(core, &key)?
                .ok_or_else(|| DmgError::NotFound(path.to_string()))?;
            let record = CatalogRecord::parse(&data)?;
            let last = i == parts.len() - 1;
            if let CatalogRecord::File(ref f) = record {
                if f.is_symlink() && (!last || traverse_final) {
                    hops += 1;
                    if hops > MAX_SYMLINK_HOPS {
                        return Err(DmgError::Corrupt(format!(
                            "{}: too many levels of symbolic links",
                            path
                        )));
                    }
                    let target = self.symlink_target(f)?;
                    let tail = parts.split_off(i + 1);
                    if target.starts_with('/') {
                        parent = ROOT_FOLDER_CNID;
                        parts.clear();
                        i = 0;
                    } else {
                        parts.truncate(i);
                    }
                    parts.extend(Self::components(&target).iter().map(|p| p.to_string()));
                    parts.extend(tail);
                    continue;
                }
            }
            if last {
                return Ok((key, record));
            }
            match record {
                CatalogRecord::Folder(f) => parent = f.folder_id,
                _ => return Err(DmgError::NotAFolder(parts[..=i].join("/"))),
            }
            i += 1;
        }
        // Empty path, or a symlink whose target collapsed to the root.
        if parent == ROOT_FOLDER_CNID {
            return self.root_record();
        }
        self.record_for_cnid(parent)
    }

    /// Target path stored in a symlink's data fork.
    fn symlink_target(&mut self, record: &FileRecord) -> Result<String> {
        let fork = self.load_fork(record.file_id, DATA_FORK, &record.data_fork)?;
        let mut raw = vec![0u8; fork.logical_size as usize];
        self.core.read_fork(&fork, 0, &mut raw)?;
        String::from_utf8(raw)
            .map_err(|_| DmgError::Corrupt("non-UTF-8 symlink target".into()))
    }

    fn folder_id(&mut self, path: &str) -> Result<u32> {
        match self.lookup(path)? {
            (_, CatalogRecord::Folder(f)) => Ok(f.folder_id),
            _ => Err(DmgError::NotAFolder(path.to_string())),
        }
    }

    /// Split a path into its parent folder CNID and final name.
    fn resolve_parent(&mut self, path: &str) -> Result<(u32, String)> {
        let mut parts = Self::components(path);
        let name = parts
            .pop()
            .ok_or_else(|| DmgError::Corrupt("empty path".into()))?
            .to_string();
        let parent = if parts.is_empty() {
            ROOT_FOLDER_CNID
        } else {
            self.folder_id(&parts.join("/"))?
        };
        Ok((parent, name))
    }

    /// Entries of a folder in catalog order.
    pub fn list_dir(&mut self, path: &str) -> Result<Vec<(String, CatalogRecord)>> {
        let folder = self.folder_id(path)?;
        let Self { core, catalog, .. } = self;
        let mut entries = Vec::new();
        catalog.scan_from(core, &CatalogKey::thread(folder), |key, data| {
            if key.parent_id != folder {
                return Ok(false);
            }
            if key.name.is_empty() {
                // The folder's own thread record.
                return Ok(true);
            }
            entries.push((unicode::units_to_name(&key.name), CatalogRecord::parse(data)?));
            Ok(true)
        })?;
        Ok(entries)
    }

    fn replace_record(&mut self, key: &CatalogKey, record: &CatalogRecord) -> Result<()> {
        let Self { core, catalog, .. } = self;
        catalog.remove(core, key)?;
        catalog.insert(core, key, &record.to_bytes())
    }

    fn adjust_valence(&mut self, folder_cnid: u32, delta: i32) -> Result<()> {
        let (key, record) = self.record_for_cnid(folder_cnid)?;
        match record {
            CatalogRecord::Folder(mut f) => {
                f.valence = (f.valence as i64 + delta as i64).max(0) as u32;
                f.content_mod_date = catalog::hfs_now();
                self.replace_record(&key, &CatalogRecord::Folder(f))
            }
            _ => Err(DmgError::Corrupt(format!(
                "cnid {} is not a folder",
                folder_cnid
            ))),
        }
    }

    fn claim_cnid(&mut self) -> u32 {
        let cnid = self.core.header.next_catalog_id;
        self.core.header.next_catalog_id += 1;
        cnid
    }

    fn insert_entry(
        &mut self,
        parent: u32,
        name: &str,
        record: CatalogRecord,
        thread: CatalogRecord,
    ) -> Result<u32> {
        let cnid = match record.cnid() {
            Some(c) => c,
            None => return Err(DmgError::Corrupt("entry without a cnid".into())),
        };
        let key = CatalogKey::new(parent, name);
        {
            let Self { core, catalog, .. } = self;
            if catalog.get(core, &key)?.is_some() {
                return Err(DmgError::AlreadyExists(name.to_string()));
            }
            catalog.insert(core, &key, &record.to_bytes())?;
            catalog.insert(core, &CatalogKey::thread(cnid), &thread.to_bytes())?;
        }
        self.adjust_valence(parent, 1)?;
        Ok(cnid)
    }

    pub fn create_folder(&mut self, path: &str, mode: u16) -> Result<u32> {
        let (parent, name) = self.resolve_parent(path)?;
        let cnid = self.claim_cnid();
        let record = CatalogRecord::Folder(FolderRecord::new(cnid, mode));
        let thread = CatalogRecord::FolderThread(ThreadRecord {
            parent_id: parent,
            name: unicode::name_to_units(&name),
        });
        let cnid = self.insert_entry(parent, &name, record, thread)?;
        self.core.header.folder_count += 1;
        self.sync()?;
        Ok(cnid)
    }

    pub fn create_file(&mut self, path: &str, mode: u16) -> Result<u32> {
        let (parent, name) = self.resolve_parent(path)?;
        let cnid = self.claim_cnid();
        let record = CatalogRecord::File(FileRecord::new(cnid, mode));
        let thread = CatalogRecord::FileThread(ThreadRecord {
            parent_id: parent,
            name: unicode::name_to_units(&name),
        });
        let cnid = self.insert_entry(parent, &name, record, thread)?;
        self.core.header.file_count += 1;
        self.sync()?;
        Ok(cnid)
    }

    // Fork overflow plumbing: runs past the eight inline descriptors live in
    // the extents tree, chunked eight to a record and keyed by the fork
    // block where each record's runs begin.

    fn load_fork(&mut self, cnid: u32, fork_type: u8, data: &ForkData) -> Result<Fork> {
        let mut fork = Fork::from_fork_data(cnid, fork_type, data, None);
        let Self { core, extents, .. } = self;
        while fork.blocks_in_extents() < fork.total_blocks {
            let key = ExtentKey {
                fork_type,
                file_id: cnid,
                start_block: fork.blocks_in_extents(),
            };
            let rec = extents.get(core, &key)?.ok_or_else(|| {
                DmgError::Corrupt(format!(
                    "missing overflow extents for cnid {} at block {}",
                    cnid, key.start_block
                ))
            })?;
            for ext in parse_extent_record(&rec)? {
                if ext.is_empty() {
                    break;
                }
                fork.extents.push(ext);
            }
        }
        Ok(fork)
    }

    fn drop_fork_overflow(&mut self, cnid: u32, fork_type: u8) -> Result<()> {
        let Self { core, extents, .. } = self;
        let start = ExtentKey {
            fork_type,
            file_id: cnid,
            start_block: 0,
        };
        let mut stale = Vec::new();
        extents.scan_from(core, &start, |key, _| {
            if key.file_id != cnid || key.fork_type != fork_type {
                return Ok(false);
            }
            stale.push(*key);
            Ok(true)
        })?;
        for key in stale {
            extents.remove(core, &key)?;
        }
        Ok(())
    }

    /// Pack a fork back into its inline record, rewriting overflow records.
    fn store_fork(&mut self, fork: &Fork) -> Result<ForkData> {
        let (data, overflow) = fork.to_fork_data();
        self.drop_fork_overflow(fork.cnid, fork.fork_type)?;
        if !overflow.is_empty() {
            let mut start: u32 = data.extents.iter().map(|e| e.block_count).sum();
            let Self { core, extents, .. } = self;
            for chunk in overflow.chunks(EXTENTS_PER_RECORD) {
                let key = ExtentKey {
                    fork_type: fork.fork_type,
                    file_id: fork.cnid,
                    start_block: start,
                };
                extents.insert(core, &key, &write_extent_record(chunk))?;
                start += chunk.iter().map(|e| e.block_count).sum::<u32>();
            }
        }
        Ok(data)
    }

    fn file_record(&mut self, path: &str) -> Result<(CatalogKey, FileRecord)> {
        match self.lookup(path)? {
            (key, CatalogRecord::File(f)) => Ok((key, f)),
            _ => Err(DmgError::NotAFile(path.to_string())),
        }
    }

    /// Stream `size` bytes from `source` into the file's data fork,
    /// resizing it first.
    pub fn write_file(
        &mut self,
        path: &str,
        source: &mut impl Read,
        size: u64,
    ) -> Result<()> {
        let (key, mut record) = self.file_record(path)?;
        let mut fork = self.load_fork(record.file_id, DATA_FORK, &record.data_fork)?;
        self.core.allocate(&mut fork, size)?;
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut offset = 0u64;
        while offset < size {
            let chunk = ((size - offset) as usize).min(CHUNK_SIZE);
            source.read_exact(&mut buf[..chunk])?;
            self.core.write_fork(&fork, offset, &buf[..chunk])?;
            offset += chunk as u64;
        }
        record.data_fork = self.store_fork(&fork)?;
        record.content_mod_date = catalog::hfs_now();
        self.replace_record(&key, &CatalogRecord::File(record))?;
        self.sync()
    }

    /// Stream the file's data fork into `sink`; returns the byte count.
    pub fn read_file(&mut self, path: &str, sink: &mut impl Write) -> Result<u64> {
        let (_, record) = self.file_record(path)?;
        let fork = self.load_fork(record.file_id, DATA_FORK, &record.data_fork)?;
        let size = fork.logical_size;
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut offset = 0u64;
        while offset < size {
            let chunk = ((size - offset) as usize).min(CHUNK_SIZE);
            self.core.read_fork(&fork, offset, &mut buf[..chunk])?;
            sink.write_all(&buf[..chunk])?;
            offset += chunk as u64;
        }
        Ok(size)
    }

    pub fn remove_file(&mut self, path: &str) -> Result<()> {
        let (key, record) = self.file_record(path)?;
        for (fork_data, fork_type) in [
            (&record.data_fork, DATA_FORK),
            (&record.resource_fork, crate::hfs::volume::RESOURCE_FORK),
        ] {
            if fork_data.total_blocks == 0 {
                continue;
            }
            let mut fork = self.load_fork(record.file_id, fork_type, fork_data)?;
            self.core.allocate(&mut fork, 0)?;
            self.drop_fork_overflow(record.file_id, fork_type)?;
        }
        {
            let Self { core, catalog, .. } = self;
            catalog.remove(core, &key)?;
            catalog.remove(core, &CatalogKey::thread(record.file_id))?;
        }
        self.adjust_valence(key.parent_id, -1)?;
        self.core.header.file_count = self.core.header.file_count.saturating_sub(1);
        self.sync()
    }

    pub fn remove_folder(&mut self, path: &str) -> Result<()> {
        let (key, record) = match self.lookup(path)? {
            (key, CatalogRecord::Folder(f)) => (key, f),
            _ => return Err(DmgError::NotAFolder(path.to_string())),
        };
        if record.folder_id == ROOT_FOLDER_CNID {
            return Err(DmgError::Unsupported("cannot remove the root folder".into()));
        }
        if record.valence != 0 {
            return Err(DmgError::NotEmpty(path.to_string()));
        }
        {
            let Self { core, catalog, .. } = self;
            catalog.remove(core, &key)?;
            catalog.remove(core, &CatalogKey::thread(record.folder_id))?;
        }
        self.adjust_valence(key.parent_id, -1)?;
        self.core.header.folder_count = self.core.header.folder_count.saturating_sub(1);
        self.sync()
    }

    /// Rename or reparent an entry. `to` names the destination path.
    pub fn move_entry(&mut self, from: &str, to: &str) -> Result<()> {
        let (old_key, record) = self.lookup(from)?;
        let cnid = record.cnid().ok_or_else(|| {
            DmgError::Corrupt(format!("{} has no catalog node id", from))
        })?;
        let (new_parent, new_name) = self.resolve_parent(to)?;
        let new_key = CatalogKey::new(new_parent, &new_name);
        {
            let Self { core, catalog, .. } = self;
            if catalog.get(core, &new_key)?.is_some() {
                return Err(DmgError::AlreadyExists(to.to_string()));
            }
            catalog.remove(core, &old_key)?;
            catalog.insert(core, &new_key, &record.to_bytes())?;
        }
        let thread = match record {
            CatalogRecord::Folder(_) => CatalogRecord::FolderThread(ThreadRecord {
                parent_id: new_parent,
                name: unicode::name_to_units(&new_name),
            }),
            _ => CatalogRecord::FileThread(ThreadRecord {
                parent_id: new_parent,
                name: unicode::name_to_units(&new_name),
            }),
        };
        self.replace_record(&CatalogKey::thread(cnid), &thread)?;
        if new_parent != old_key.parent_id {
            self.adjust_valence(old_key.parent_id, -1)?;
            self.adjust_valence(new_parent, 1)?;
        }
        self.sync()
    }

    /// Replace the permission bits, keeping the file-type bits.
    pub fn chmod(&mut self, path: &str, mode: u16) -> Result<()> {
        let (key, record) = self.lookup(path)?;
        let updated = match record {
            CatalogRecord::File(mut f) => {
                f.permissions.file_mode = (f.permissions.file_mode & catalog::S_IFMT)
                    | (mode & !catalog::S_IFMT);
                CatalogRecord::File(f)
            }
            CatalogRecord::Folder(mut f) => {
                f.permissions.file_mode = (f.permissions.file_mode & catalog::S_IFMT)
                    | (mode & !catalog::S_IFMT);
                CatalogRecord::Folder(f)
            }
            _ => return Err(DmgError::NotFound(path.to_string())),
        };
        self.replace_record(&key, &updated)?;
        self.sync()
    }

    pub fn chown(&mut self, path: &str, owner_id: u32, group_id: u32) -> Result<()> {
        let (key, record) = self.lookup(path)?;
        let updated = match record {
            CatalogRecord::File(mut f) => {
                f.permissions.owner_id = owner_id;
                f.permissions.group_id = group_id;
                CatalogRecord::File(f)
            }
            CatalogRecord::Folder(mut f) => {
                f.permissions.owner_id = owner_id;
                f.permissions.group_id = group_id;
                CatalogRecord::Folder(f)
            }
            _ => return Err(DmgError::NotFound(path.to_string())),
        };
        self.replace_record(&key, &updated)?;
        self.sync()
    }

    /// Create a symlink: a file stamped 'slnk'/'rhap' whose data fork holds
    /// the target path.
    pub fn make_symlink(&mut self, path: &str, target: &str) -> Result<u32> {
        let (parent, name) = self.resolve_parent(path)?;
        let cnid = self.claim_cnid();
        let mut file = FileRecord::new(cnid, 0o755);
        file.permissions.file_mode =
            catalog::S_IFLNK | (file.permissions.file_mode & !catalog::S_IFMT);
        file.set_finder_type(SYMLINK_FILE_TYPE, SYMLINK_CREATOR);
        let thread = CatalogRecord::FileThread(ThreadRecord {
            parent_id: parent,
            name: unicode::name_to_units(&name),
        });
        let cnid = self.insert_entry(parent, &name, CatalogRecord::File(file), thread)?;
        self.core.header.file_count += 1;
        let mut cursor = std::io::Cursor::new(target.as_bytes().to_vec());
        self.write_file(path, &mut cursor, target.len() as u64)?;
        Ok(cnid)
    }

    pub fn read_symlink(&mut self, path: &str) -> Result<String> {
        let (_, record) = self.file_record(path)?;
        if !record.is_symlink() {
            return Err(DmgError::NotAFile(format!("{} is not a symlink", path)));
        }
        self.symlink_target(&record)
    }

    /// Extend the volume to `new_size` bytes: release the old alternate
    /// header block, widen the bitmap, extend the backing image, then
    /// reserve the new last block and rewrite both headers.
    pub fn grow(&mut self, new_size: u64) -> Result<()> {
        let bs = self.core.block_size();
        let old_total = self.core.header.total_blocks;
        let new_total = (new_size / bs) as u32;
        if new_total <= old_total {
            return Err(DmgError::Unsupported(format!(
                "volume can only grow ({} -> {} blocks)",
                old_total, new_total
            )));
        }
        let bitmap_bytes = (new_total as u64).div_ceil(8);
        if bitmap_bytes > self.core.alloc_fork.logical_size {
            // Widen the bitmap while the block counts still describe the old
            // region, so the scan cannot claim blocks past the old end.
            let mut alloc = self.core.alloc_fork.clone();
            self.core.allocate(&mut alloc, bitmap_bytes)?;
            self.core.alloc_fork = alloc;
        }
        // Extend the backing image out to the new size.
        self.core.image.write_at(new_total as u64 * bs - 1, &[0])?;

        self.core.set_block_used(old_total - 1, false)?;
        self.core.header.total_blocks = new_total;
        for block in old_total..new_total {
            self.core.set_block_used(block, false)?;
        }
        for bit in new_total..(bitmap_bytes * 8) as u32 {
            self.core.set_block_used(bit, true)?;
        }
        self.core.set_block_used(new_total - 1, true)?;
        self.core.header.free_blocks += new_total - old_total;
        debug!(
            "volume grown from {} to {} blocks",
            old_total, new_total
        );
        self.sync()
    }

    /// Recursively add a host directory tree to the volume. Symlinks on the
    /// host become catalog symlinks.
    pub fn add_tree(&mut self, host_dir: &std::path::Path, volume_path: &str) -> Result<()> {
        for entry in std::fs::read_dir(host_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                warn!("skipping non-UTF-8 name in {}", host_dir.display());
                continue;
            };
            let child_path = format!("{}/{}", volume_path.trim_end_matches('/'), name);
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                self.create_folder(&child_path, 0o755)?;
                self.add_tree(&entry.path(), &child_path)?;
            } else if file_type.is_symlink() {
                let target = std::fs::read_link(entry.path())?;
                let target = target.to_string_lossy().into_owned();
                self.make_symlink(&child_path, &target)?;
            } else {
                let meta = entry.metadata()?;
                self.create_file(&child_path, 0o644)?;
                let mut file = std::fs::File::open(entry.path())?;
                self.write_file(&child_path, &mut file, meta.len())?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hfs::test_support::{TEST_BLOCK_SIZE, TEST_TOTAL_BLOCKS};
    use crate::io::MemorySource;
    use std::io::Cursor;

    fn new_volume() -> Volume {
        let image = vec![0u8; (TEST_TOTAL_BLOCKS * TEST_BLOCK_SIZE) as usize];
        Volume::format(
            Box::new(MemorySource::new(image)),
            TEST_BLOCK_SIZE,
            TEST_TOTAL_BLOCKS,
            "Test",
            false,
        )
        .unwrap()
    }

    #[test]
    fn test_format_then_open_root() {
        let mut volume = new_volume();
        let (key, record) = volume.lookup("/").unwrap();
        assert_eq!(key.parent_id, ROOT_PARENT_CNID);
        match record {
            CatalogRecord::Folder(f) => {
                assert_eq!(f.folder_id, ROOT_FOLDER_CNID);
                assert_eq!(f.valence, 0);
            }
            other => panic!("root is not a folder: {:?}", other),
        }
    }

    #[test]
    fn test_file_roundtrip() {
        let mut volume = new_volume();
        volume.create_file("/hello.txt", 0o644).unwrap();
        let payload = b"hello, world".to_vec();
        volume
            .write_file("/hello.txt", &mut Cursor::new(payload.clone()), 12)
            .unwrap();
        let mut back = Vec::new();
        let n = volume.read_file("/hello.txt", &mut back).unwrap();
        assert_eq!(n, 12);
        assert_eq!(back, payload);
        assert_eq!(volume.core.header.file_count, 1);
    }

    #[test]
    fn test_lookup_is_case_insensitive() {
        let mut volume = new_volume();
        volume.create_file("/ReadMe.txt", 0o644).unwrap();
        assert!(volume.lookup("/readme.TXT").is_ok());
        let err = volume.create_file("/README.TXT", 0o644).unwrap_err();
        assert!(matches!(err, DmgError::AlreadyExists(_)));
    }

    #[test]
    fn test_nested_folders_and_listing() {
        let mut volume = new_volume();
        volume.create_folder("/docs", 0o755).unwrap();
        volume.create_folder("/docs/old", 0o755).unwrap();
        volume.create_file("/docs/a.txt", 0o644).unwrap();
        volume.create_file("/docs/b.txt", 0o644).unwrap();
        let entries = volume.list_dir("/docs").unwrap();
        let names: Vec<_> = entries.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, ["a.txt", "b.txt", "old"]);
        let (_, record) = volume.lookup("/docs").unwrap();
        match record {
            CatalogRecord::Folder(f) => assert_eq!(f.valence, 3),
            other => panic!("not a folder: {:?}", other),
        }
    }

    #[test]
    fn test_remove_file_releases_blocks() {
        let mut volume = new_volume();
        let free_before = volume.core.header.free_blocks;
        volume.create_file("/data.bin", 0o644).unwrap();
        let payload = vec![0x5Au8; 8 * TEST_BLOCK_SIZE as usize];
        volume
            .write_file(
                "/data.bin",
                &mut Cursor::new(payload.clone()),
                payload.len() as u64,
            )
            .unwrap();
        assert!(volume.core.header.free_blocks < free_before);
        volume.remove_file("/data.bin").unwrap();
        assert_eq!(volume.core.header.free_blocks, free_before);
        assert!(matches!(
            volume.lookup("/data.bin"),
            Err(DmgError::NotFound(_))
        ));
    }

    #[test]
    fn test_remove_folder_requires_empty() {
        let mut volume = new_volume();
        volume.create_folder("/d", 0o755).unwrap();
        volume.create_file("/d/f", 0o644).unwrap();
        assert!(matches!(
            volume.remove_folder("/d"),
            Err(DmgError::NotEmpty(_))
        ));
        volume.remove_file("/d/f").unwrap();
        volume.remove_folder("/d").unwrap();
        assert!(matches!(volume.lookup("/d"), Err(DmgError::NotFound(_))));
    }

    #[test]
    fn test_move_and_rename() {
        let mut volume = new_volume();
        volume.create_folder("/a", 0o755).unwrap();
        volume.create_folder("/b", 0o755).unwrap();
        volume.create_file("/a/f.txt", 0o644).unwrap();
        volume.move_entry("/a/f.txt", "/b/g.txt").unwrap();
        assert!(volume.lookup("/a/f.txt").is_err());
        assert!(volume.lookup("/b/g.txt").is_ok());
        match volume.lookup("/a").unwrap().1 {
            CatalogRecord::Folder(f) => assert_eq!(f.valence, 0),
            other => panic!("not a folder: {:?}", other),
        }
        match volume.lookup("/b").unwrap().1 {
            CatalogRecord::Folder(f) => assert_eq!(f.valence, 1),
            other => panic!("not a folder: {:?}", other),
        }
    }

    #[test]
    fn test_chmod_keeps_type_bits() {
        let mut volume = new_volume();
        volume.create_file("/f", 0o644).unwrap();
        volume.chmod("/f", 0o600).unwrap();
        match volume.lookup("/f").unwrap().1 {
            CatalogRecord::File(f) => {
                assert_eq!(f.permissions.file_mode, catalog::S_IFREG | 0o600)
            }
            other => panic!("not a file: {:?}", other),
        }
        volume.make_symlink("/l", "/f").unwrap();
        volume.chmod("/l", 0o777).unwrap();
        match volume.lookup("/l").unwrap().1 {
            CatalogRecord::File(f) => {
                assert_eq!(f.permissions.file_mode, catalog::S_IFLNK | 0o777)
            }
            other => panic!("not a file: {:?}", other),
        }
    }

    #[test]
    fn test_symlink_roundtrip() {
        let mut volume = new_volume();
        volume.make_symlink("/link", "/target/path").unwrap();
        assert_eq!(volume.read_symlink("/link").unwrap(), "/target/path");
        match volume.lookup("/link").unwrap().1 {
            CatalogRecord::File(f) => {
                assert!(f.is_symlink());
                assert_eq!(f.finder_type(), SYMLINK_FILE_TYPE);
            }
            other => panic!("not a file: {:?}", other),
        }
    }

    #[test]
    fn test_lookup_follows_intermediate_symlinks() {
        let mut volume = new_volume();
        volume.create_folder("/real", 0o755).unwrap();
        volume.create_file("/real/file.txt", 0o644).unwrap();
        volume
            .write_file("/real/file.txt", &mut Cursor::new(b"via alias".to_vec()), 9)
            .unwrap();
        volume.make_symlink("/alias", "/real").unwrap();

        let mut back = Vec::new();
        volume.read_file("/alias/file.txt", &mut back).unwrap();
        assert_eq!(back, b"via alias");

        // The final component is only followed on request.
        match volume.lookup("/alias").unwrap().1 {
            CatalogRecord::File(f) => assert!(f.is_symlink()),
            other => panic!("not a file: {:?}", other),
        }
        match volume.lookup_traversed("/alias").unwrap().1 {
            CatalogRecord::Folder(f) => assert_eq!(f.valence, 1),
            other => panic!("not a folder: {:?}", other),
        }
    }

    #[test]
    fn test_relative_symlink_resolves_in_parent_folder() {
        let mut volume = new_volume();
        volume.create_folder("/d", 0o755).unwrap();
        volume.create_folder("/d/sub", 0o755).unwrap();
        volume.create_file("/d/sub/x.txt", 0o644).unwrap();
        volume.make_symlink("/d/alias", "sub").unwrap();
        match volume.lookup("/d/alias/x.txt").unwrap().1 {
            CatalogRecord::File(_) => {}
            other => panic!("not a file: {:?}", other),
        }
    }

    #[test]
    fn test_symlink_loops_are_detected() {
        let mut volume = new_volume();
        volume.make_symlink("/a", "/b").unwrap();
        volume.make_symlink("/b", "/a").unwrap();
        let err = volume.lookup("/a/anything").unwrap_err();
        assert!(matches!(err, DmgError::Corrupt(_)), "unexpected: {:?}", err);
    }

    #[test]
    fn test_large_file_spills_into_extents_tree() {
        let mut volume = new_volume();
        volume.create_file("/big", 0o644).unwrap();
        // Fragment the free space so the file needs more than 8 runs.
        let next = volume.core.header.next_allocation;
        let mut pinned = Vec::new();
        for i in 0..40 {
            let block = next + i * 3;
            if !volume.core.is_block_used(block).unwrap() {
                volume.core.set_block_used(block, true).unwrap();
                volume.core.header.free_blocks -= 1;
                pinned.push(block);
            }
        }
        let payload: Vec<u8> = (0..(60 * TEST_BLOCK_SIZE as usize))
            .map(|i| (i % 253) as u8)
            .collect();
        volume
            .write_file(
                "/big",
                &mut Cursor::new(payload.clone()),
                payload.len() as u64,
            )
            .unwrap();
        let (_, record) = volume.file_record("/big").unwrap();
        let inline: u32 = record.data_fork.extents.iter().map(|e| e.block_count).sum();
        assert!(inline < record.data_fork.total_blocks);
        let mut back = Vec::new();
        volume.read_file("/big", &mut back).unwrap();
        assert_eq!(back, payload);
        // Removal drops the overflow records and frees every block.
        volume.remove_file("/big").unwrap();
        for block in pinned {
            volume.core.set_block_used(block, false).unwrap();
            volume.core.header.free_blocks += 1;
        }
    }

    #[test]
    fn test_reopen_preserves_contents() {
        let mut volume = new_volume();
        volume.create_file("/persist.txt", 0o644).unwrap();
        volume
            .write_file("/persist.txt", &mut Cursor::new(b"kept".to_vec()), 4)
            .unwrap();
        let len = volume.core.image.len().unwrap();
        let mut image = vec![0u8; len as usize];
        volume.core.image.read_at(0, &mut image).unwrap();
        let mut volume = Volume::open(Box::new(MemorySource::new(image))).unwrap();
        let mut back = Vec::new();
        volume.read_file("/persist.txt", &mut back).unwrap();
        assert_eq!(back, b"kept");
    }

    #[test]
    fn test_grow_adds_free_blocks() {
        let image = vec![0u8; (TEST_TOTAL_BLOCKS * TEST_BLOCK_SIZE) as usize];
        let mut volume = Volume::format(
            Box::new(crate::io::GrowableMemorySource::from_vec(image)),
            TEST_BLOCK_SIZE,
            TEST_TOTAL_BLOCKS,
            "Grow",
            false,
        )
        .unwrap();
        let free_before = volume.core.header.free_blocks;
        let new_size = (TEST_TOTAL_BLOCKS as u64 + 512) * TEST_BLOCK_SIZE as u64;
        volume.grow(new_size).unwrap();
        assert_eq!(volume.core.header.total_blocks, TEST_TOTAL_BLOCKS + 512);
        assert_eq!(volume.core.header.free_blocks, free_before + 512);
        assert!(volume.core.is_block_used(volume.core.header.total_blocks - 1).unwrap());
        assert!(!volume
            .core
            .is_block_used(TEST_TOTAL_BLOCKS - 1)
            .unwrap());
        // Still usable after the grow.
        volume.create_file("/after", 0o644).unwrap();
        volume
            .write_file("/after", &mut Cursor::new(b"ok".to_vec()), 2)
            .unwrap();
    }
}
