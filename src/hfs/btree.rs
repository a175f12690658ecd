//! Generic on-disk B-tree engine.
//!
//! Node 0 is the header node: a 14-byte node descriptor, the header record,
//! 128 bytes of user data, and a node-use bitmap that chains through map
//! nodes when the tree outgrows it. Every node carries its records back to
//! back after the descriptor, with a trailing table of big-endian u16 record
//! offsets growing backward from the end of the node; the entry past the
//! last record marks the start of free space, so record `i` has length
//! `offset[i+1] - offset[i]`.
//!
//! Key handling is generic: a tree is parameterized by its key codec and a
//! comparison function chosen when the tree is opened (the catalog swaps in
//! case folding when the header record asks for it).

use std::cmp::Ordering;

use byteorder::{BigEndian, ByteOrder};
use log::debug;

use crate::error::{DmgError, Result};
use crate::hfs::volume::{Fork, VolumeCore};

pub const KIND_LEAF: i8 = -1;
pub const KIND_INDEX: i8 = 0;
pub const KIND_HEADER: i8 = 1;
pub const KIND_MAP: i8 = 2;

/// Case-folding comparator selector stored in the header record.
pub const KEY_COMPARE_CASE_FOLDING: u8 = 0xCF;
pub const KEY_COMPARE_BINARY: u8 = 0xBC;

const NODE_DESCRIPTOR_SIZE: usize = 14;
const HEADER_RECORD_OFFSET: usize = 14;
const USER_DATA_OFFSET: usize = 120;
const HEADER_MAP_OFFSET: usize = 248;
const MAP_NODE_MAP_OFFSET: usize = 14;

/// Per-key codec. `parse` returns the key and the bytes it consumed
/// (length prefix included); `to_bytes` emits the same wire form.
pub trait BTreeKey: Sized + Clone + std::fmt::Debug {
    fn parse(data: &[u8]) -> Result<(Self, usize)>;
    fn to_bytes(&self) -> Vec<u8>;
}

pub type KeyCompare<K> = fn(&K, &K) -> Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeDescriptor {
    pub flink: u32,
    pub blink: u32,
    pub kind: i8,
    pub height: u8,
    pub num_records: u16,
}

impl NodeDescriptor {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let kind = data[8] as i8;
        if !(KIND_LEAF..=KIND_MAP).contains(&kind) {
            return Err(DmgError::Corrupt(format!("bad node kind {}", kind)));
        }
        Ok(Self {
            flink: BigEndian::read_u32(&data[0..4]),
            blink: BigEndian::read_u32(&data[4..8]),
            kind,
            height: data[9],
            num_records: BigEndian::read_u16(&data[10..12]),
        })
    }

    pub fn write(&self, out: &mut [u8]) {
        BigEndian::write_u32(&mut out[0..4], self.flink);
        BigEndian::write_u32(&mut out[4..8], self.blink);
        out[8] = self.kind as u8;
        out[9] = self.height;
        BigEndian::write_u16(&mut out[10..12], self.num_records);
        BigEndian::write_u16(&mut out[12..14], 0);
    }
}

#[derive(Debug, Clone)]
pub struct BTreeHeaderRecord {
    pub tree_depth: u16,
    pub root_node: u32,
    pub leaf_records: u32,
    pub first_leaf: u32,
    pub last_leaf: u32,
    pub node_size: u16,
    pub max_key_length: u16,
    pub total_nodes: u32,
    pub free_nodes: u32,
    pub clump_size: u32,
    pub btree_type: u8,
    pub key_compare_type: u8,
    pub attributes: u32,
}

impl BTreeHeaderRecord {
    pub fn parse(data: &[u8]) -> Self {
        Self {
            tree_depth: BigEndian::read_u16(&data[0..2]),
            root_node: BigEndian::read_u32(&data[2..6]),
            leaf_records: BigEndian::read_u32(&data[6..10]),
            first_leaf: BigEndian::read_u32(&data[10..14]),
            last_leaf: BigEndian::read_u32(&data[14..18]),
            node_size: BigEndian::read_u16(&data[18..20]),
            max_key_length: BigEndian::read_u16(&data[20..22]),
            total_nodes: BigEndian::read_u32(&data[22..26]),
            free_nodes: BigEndian::read_u32(&data[26..30]),
            clump_size: BigEndian::read_u32(&data[32..36]),
            btree_type: data[36],
            key_compare_type: data[37],
            attributes: BigEndian::read_u32(&data[38..42]),
        }
    }

    pub fn write(&self, out: &mut [u8]) {
        BigEndian::write_u16(&mut out[0..2], self.tree_depth);
        BigEndian::write_u32(&mut out[2..6], self.root_node);
        BigEndian::write_u32(&mut out[6..10], self.leaf_records);
        BigEndian::write_u32(&mut out[10..14], self.first_leaf);
        BigEndian::write_u32(&mut out[14..18], self.last_leaf);
        BigEndian::write_u16(&mut out[18..20], self.node_size);
        BigEndian::write_u16(&mut out[20..22], self.max_key_length);
        BigEndian::write_u32(&mut out[22..26], self.total_nodes);
        BigEndian::write_u32(&mut out[26..30], self.free_nodes);
        BigEndian::write_u16(&mut out[30..32], 0);
        BigEndian::write_u32(&mut out[32..36], self.clump_size);
        out[36] = self.btree_type;
        out[37] = self.key_compare_type;
        BigEndian::write_u32(&mut out[38..42], self.attributes);
    }
}

/// Leaf coordinates of a search: the matching record when `exact`, otherwise
/// the insertion index (which may be one past the last record).
#[derive(Debug, Clone, Copy)]
pub struct Location {
    pub node: u32,
    pub record: u16,
    pub exact: bool,
}

pub struct BTree<K: BTreeKey> {
    pub fork: Fork,
    pub header: BTreeHeaderRecord,
    cmp: KeyCompare<K>,
}

// Node buffer accessors. The offset table for record i sits at
// len - 2*(i+1); entry num_records marks the start of free space.

fn record_offset(node: &[u8], i: u16) -> usize {
    let at = node.len() - 2 * (i as usize + 1);
    BigEndian::read_u16(&node[at..at + 2]) as usize
}

fn set_record_offset(node: &mut [u8], i: u16, value: usize) {
    let at = node.len() - 2 * (i as usize + 1);
    BigEndian::write_u16(&mut node[at..at + 2], value as u16);
}

fn free_space(node: &[u8], num_records: u16) -> usize {
    let data_end = record_offset(node, num_records);
    let table_start = node.len() - 2 * (num_records as usize + 2);
    table_start.saturating_sub(data_end)
}

/// Shift records to open a hole and insert the record bytes at `idx`.
/// Returns false when the node has no room.
fn insert_record_bytes(node: &mut [u8], idx: u16, rec: &[u8]) -> Result<bool> {
    let mut desc = NodeDescriptor::parse(node)?;
    if free_space(node, desc.num_records) < rec.len() + 2 {
        return Ok(false);
    }
    let start = record_offset(node, idx);
    let end = record_offset(node, desc.num_records);
    node.copy_within(start..end, start + rec.len());
    node[start..start + rec.len()].copy_from_slice(rec);
    // Entries past the insertion point slide out one slot and shift by the
    // inserted length; earlier entries keep their values.
    let old: Vec<usize> = (0..=desc.num_records).map(|i| record_offset(node, i)).collect();
    for (i, off) in old.iter().enumerate() {
        let i = i as u16;
        if i < idx {
            set_record_offset(node, i, *off);
        } else {
            set_record_offset(node, i + 1, *off + rec.len());
        }
    }
    set_record_offset(node, idx, start);
    desc.num_records += 1;
    desc.write(node);
    Ok(true)
}

fn remove_record_bytes(node: &mut [u8], idx: u16) -> Result<()> {
    let mut desc = NodeDescriptor::parse(node)?;
    let start = record_offset(node, idx);
    let end = record_offset(node, idx + 1);
    let data_end = record_offset(node, desc.num_records);
    let len = end - start;
    node.copy_within(end..data_end, start);
    for i in idx..desc.num_records {
        let next = record_offset(node, i + 1);
        set_record_offset(node, i, next - len);
    }
    desc.num_records -= 1;
    desc.write(node);
    Ok(())
}

fn record_slice(node: &[u8], i: u16) -> &[u8] {
    let start = record_offset(node, i);
    let end = record_offset(node, i + 1);
    &node[start..end]
}

impl<K: BTreeKey> BTree<K> {
    /// Open an existing tree over a fork. `select_cmp` picks the comparator
    /// from the parsed header record.
    pub fn open(
        core: &mut VolumeCore,
        fork: Fork,
        select_cmp: fn(&BTreeHeaderRecord) -> KeyCompare<K>,
    ) -> Result<Self> {
        let mut head = vec![0u8; 512];
        core.read_fork(&fork, 0, &mut head)?;
        let desc = NodeDescriptor::parse(&head)?;
        if desc.kind != KIND_HEADER {
            return Err(DmgError::Corrupt(format!(
                "tree node 0 has kind {}, not header",
                desc.kind
            )));
        }
        let header = BTreeHeaderRecord::parse(&head[HEADER_RECORD_OFFSET..USER_DATA_OFFSET]);
        if header.node_size < 512 || !header.node_size.is_power_of_two() {
            return Err(DmgError::Corrupt(format!(
                "bad tree node size {}",
                header.node_size
            )));
        }
        if header.total_nodes as u64 * header.node_size as u64 > fork.logical_size {
            return Err(DmgError::Corrupt(
                "tree node count exceeds fork size".into(),
            ));
        }
        let cmp = select_cmp(&header);
        Ok(Self { fork, header, cmp })
    }

    /// Initialize an empty tree in a freshly allocated fork and open it.
    pub fn create(
        core: &mut VolumeCore,
        fork: Fork,
        node_size: u16,
        max_key_length: u16,
        key_compare_type: u8,
        attributes: u32,
        select_cmp: fn(&BTreeHeaderRecord) -> KeyCompare<K>,
    ) -> Result<Self> {
        let total_nodes = (fork.logical_size / node_size as u64) as u32;
        if total_nodes == 0 {
            return Err(DmgError::Corrupt("tree fork smaller than one node".into()));
        }
        let header = BTreeHeaderRecord {
            tree_depth: 0,
            root_node: 0,
            leaf_records: 0,
            first_leaf: 0,
            last_leaf: 0,
            node_size,
            max_key_length,
            total_nodes,
            free_nodes: total_nodes - 1,
            clump_size: fork.clump_size,
            btree_type: 0,
            key_compare_type,
            attributes,
        };
        let mut node = vec![0u8; node_size as usize];
        NodeDescriptor {
            flink: 0,
            blink: 0,
            kind: KIND_HEADER,
            height: 0,
            num_records: 3,
        }
        .write(&mut node);
        header.write(&mut node[HEADER_RECORD_OFFSET..USER_DATA_OFFSET]);
        set_record_offset(&mut node, 0, HEADER_RECORD_OFFSET);
        set_record_offset(&mut node, 1, USER_DATA_OFFSET);
        set_record_offset(&mut node, 2, HEADER_MAP_OFFSET);
        set_record_offset(&mut node, 3, node_size as usize - 8);
        // Node 0 occupies the first map bit.
        node[HEADER_MAP_OFFSET] = 0x80;
        core.write_fork(&fork, 0, &node)?;
        let cmp = select_cmp(&header);
        Ok(Self { fork, header, cmp })
    }

    pub fn node_size(&self) -> usize {
        self.header.node_size as usize
    }

    fn read_node(&self, core: &mut VolumeCore, id: u32) -> Result<Vec<u8>> {
        if id >= self.header.total_nodes {
            return Err(DmgError::Corrupt(format!(
                "node {} out of range ({} total)",
                id, self.header.total_nodes
            )));
        }
        let mut buf = vec![0u8; self.node_size()];
        core.read_fork(&self.fork, id as u64 * self.node_size() as u64, &mut buf)?;
        Ok(buf)
    }

    fn write_node(&self, core: &mut VolumeCore, id: u32, buf: &[u8]) -> Result<()> {
        core.write_fork(&self.fork, id as u64 * self.node_size() as u64, buf)
    }

    /// Persist the header record (and the map bits live in node 0, written
    /// by the map helpers).
    pub fn write_header(&mut self, core: &mut VolumeCore) -> Result<()> {
        let mut node = self.read_node(core, 0)?;
        self.header
            .write(&mut node[HEADER_RECORD_OFFSET..USER_DATA_OFFSET]);
        self.write_node(core, 0, &node)
    }

    // Node-use map. Bits pack big-endian within bytes; the header node's map
    // record covers the first (node_size - 256) * 8 nodes, continuation map
    // nodes each cover (node_size - 20) * 8 more.

    fn map_locate(&self, core: &mut VolumeCore, node_num: u32) -> Result<(u32, usize, u8)> {
        let mut map_node = 0u32;
        let mut base_bits = 0u32;
        loop {
            let (off, len) = if map_node == 0 {
                (HEADER_MAP_OFFSET, self.node_size() - 256)
            } else {
                (MAP_NODE_MAP_OFFSET, self.node_size() - 20)
            };
            let bits = len as u32 * 8;
            if node_num < base_bits + bits {
                let rel = (node_num - base_bits) as usize;
                return Ok((map_node, off + rel / 8, 7 - (rel % 8) as u8));
            }
            let node = self.read_node(core, map_node)?;
            let desc = NodeDescriptor::parse(&node)?;
            if desc.flink == 0 {
                return Err(DmgError::Corrupt(format!(
                    "node map ends before node {}",
                    node_num
                )));
            }
            map_node = desc.flink;
            base_bits += bits;
        }
    }

    fn is_node_used(&self, core: &mut VolumeCore, node_num: u32) -> Result<bool> {
        let (map_node, byte, bit) = self.map_locate(core, node_num)?;
        let node = self.read_node(core, map_node)?;
        Ok(node[byte] & (1 << bit) != 0)
    }

    fn set_node_used(&self, core: &mut VolumeCore, node_num: u32, used: bool) -> Result<()> {
        let (map_node, byte, bit) = self.map_locate(core, node_num)?;
        let mut node = self.read_node(core, map_node)?;
        if used {
            node[byte] |= 1 << bit;
        } else {
            node[byte] &= !(1 << bit);
        }
        self.write_node(core, map_node, &node)
    }

    /// Claim a free node, growing the tree fork when none remain.
    fn alloc_node(&mut self, core: &mut VolumeCore) -> Result<u32> {
        if self.header.free_nodes == 0 {
            self.grow(core)?;
        }
        for id in 0..self.header.total_nodes {
            if !self.is_node_used(core, id)? {
                self.set_node_used(core, id, true)?;
                self.header.free_nodes -= 1;
                return Ok(id);
            }
        }
        Err(DmgError::Corrupt(
            "free node count does not match node map".into(),
        ))
    }

    fn free_node(&mut self, core: &mut VolumeCore, id: u32) -> Result<()> {
        self.set_node_used(core, id, false)?;
        self.header.free_nodes += 1;
        Ok(())
    }

    fn grow(&mut self, core: &mut VolumeCore) -> Result<()> {
        let node_size = self.node_size() as u64;
        let grow_nodes = ((self.fork.clump_size as u64 / node_size).max(8)) as u32;
        let new_total = self.header.total_nodes + grow_nodes;
        let map_bits = ((self.node_size() - 256) * 8) as u32;
        if new_total > map_bits {
            // One map record has held every tree this engine produces;
            // chaining map nodes on write is not implemented.
            return Err(DmgError::Unsupported(
                "tree grew past the header map record".into(),
            ));
        }
        debug!(
            "growing tree fork cnid {} from {} to {} nodes",
            self.fork.cnid, self.header.total_nodes, new_total
        );
        core.allocate(&mut self.fork, new_total as u64 * node_size)?;
        self.header.free_nodes += new_total - self.header.total_nodes;
        self.header.total_nodes = new_total;
        self.write_header(core)
    }

    fn parse_key<'a>(&self, rec: &'a [u8]) -> Result<(K, &'a [u8])> {
        let (key, used) = K::parse(rec)?;
        Ok((key, &rec[used..]))
    }

    /// Index within `node` of the first record whose key compares greater
    /// than `key`; sets `exact` when an equal key exists. Binary search over
    /// the record offset table; keys within a node are unique.
    fn scan_node(&self, node: &[u8], key: &K) -> Result<(u16, bool)> {
        let desc = NodeDescriptor::parse(node)?;
        let mut lo = 0u16;
        let mut hi = desc.num_records;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let (rec_key, _) = self.parse_key(record_slice(node, mid))?;
            match (self.cmp)(&rec_key, key) {
                Ordering::Less => lo = mid + 1,
                Ordering::Equal => return Ok((mid, true)),
                Ordering::Greater => hi = mid,
            }
        }
        Ok((lo, false))
    }

    fn index_child(node: &[u8], idx: u16) -> Result<u32> {
        let rec = record_slice(node, idx);
        if rec.len() < 4 {
            return Err(DmgError::Corrupt("index record too short".into()));
        }
        Ok(BigEndian::read_u32(&rec[rec.len() - 4..]))
    }

    /// Descend to the leaf holding `key` (or its insertion point).
    /// Returns `None` for an empty tree.
    pub fn search(&self, core: &mut VolumeCore, key: &K) -> Result<Option<Location>> {
        if self.header.root_node == 0 && self.header.tree_depth == 0 {
            return Ok(None);
        }
        let mut node_id = self.header.root_node;
        loop {
            let node = self.read_node(core, node_id)?;
            let desc = NodeDescriptor::parse(&node)?;
            match desc.kind {
                KIND_LEAF => {
                    let (idx, exact) = self.scan_node(&node, key)?;
                    return Ok(Some(Location {
                        node: node_id,
                        record: idx,
                        exact,
                    }));
                }
                KIND_INDEX => {
                    let (idx, exact) = self.scan_node(&node, key)?;
                    // Descend at the last record at or before the key;
                    // below-all keys go down the leftmost child.
                    let child_idx = if exact {
                        idx
                    } else {
                        idx.saturating_sub(1)
                    };
                    node_id = Self::index_child(&node, child_idx)?;
                }
                other => {
                    return Err(DmgError::Corrupt(format!(
                        "unexpected node kind {} on search path",
                        other
                    )))
                }
            }
        }
    }

    /// Fetch the record data for an exact key match.
    pub fn get(&self, core: &mut VolumeCore, key: &K) -> Result<Option<Vec<u8>>> {
        match self.search(core, key)? {
            Some(loc) if loc.exact => {
                let node = self.read_node(core, loc.node)?;
                let (_, data) = self.parse_key(record_slice(&node, loc.record))?;
                Ok(Some(data.to_vec()))
            }
            _ => Ok(None),
        }
    }

    /// Insert a record. An existing equal key is `AlreadyExists`.
    pub fn insert(&mut self, core: &mut VolumeCore, key: &K, data: &[u8]) -> Result<()> {
        let mut rec = key.to_bytes();
        rec.extend_from_slice(data);
        if rec.len() + 2 > self.node_size() - NODE_DESCRIPTOR_SIZE - 8 {
            return Err(DmgError::Corrupt(format!(
                "record of {} bytes cannot fit a {}-byte node",
                rec.len(),
                self.node_size()
            )));
        }
        if self.header.root_node == 0 && self.header.tree_depth == 0 {
            let id = self.alloc_node(core)?;
            let mut node = vec![0u8; self.node_size()];
            NodeDescriptor {
                flink: 0,
                blink: 0,
                kind: KIND_LEAF,
                height: 1,
                num_records: 0,
            }
            .write(&mut node);
            set_record_offset(&mut node, 0, NODE_DESCRIPTOR_SIZE);
            if !insert_record_bytes(&mut node, 0, &rec)? {
                return Err(DmgError::Corrupt("record does not fit empty leaf".into()));
            }
            self.write_node(core, id, &node)?;
            self.header.root_node = id;
            self.header.first_leaf = id;
            self.header.last_leaf = id;
            self.header.tree_depth = 1;
            self.header.leaf_records = 1;
            return self.write_header(core);
        }

        let root = self.header.root_node;
        if let Some((split_key, split_node)) = self.insert_in(core, root, key, &rec)? {
            self.increase_height(core, split_key, split_node)?;
        }
        self.header.leaf_records += 1;
        self.write_header(core)
    }

    fn insert_in(
        &mut self,
        core: &mut VolumeCore,
        node_id: u32,
        key: &K,
        rec: &[u8],
    ) -> Result<Option<(K, u32)>> {
        let mut node = self.read_node(core, node_id)?;
        let desc = NodeDescriptor::parse(&node)?;
        match desc.kind {
            KIND_LEAF => {
                let (idx, exact) = self.scan_node(&node, key)?;
                if exact {
                    return Err(DmgError::AlreadyExists(format!("key {:?}", key)));
                }
                self.place_record(core, node_id, &mut node, idx, rec)
            }
            KIND_INDEX => {
                let (idx, exact) = self.scan_node(&node, key)?;
                let child_idx = if exact { idx } else { idx.saturating_sub(1) };
                let child = Self::index_child(&node, child_idx)?;
                match self.insert_in(core, child, key, rec)? {
                    None => Ok(None),
                    Some((promoted, new_child)) => {
                        // Re-read: the child split may have rewritten us via
                        // sibling links only, but the buffer could be stale
                        // if this node also served as the child's neighbor.
                        let mut node = self.read_node(core, node_id)?;
                        let mut idx_rec = promoted.to_bytes();
                        let mut child_be = [0u8; 4];
                        BigEndian::write_u32(&mut child_be, new_child);
                        idx_rec.extend_from_slice(&child_be);
                        let (at, _) = self.scan_node(&node, &promoted)?;
                        self.place_record(core, node_id, &mut node, at, &idx_rec)
                    }
                }
            }
            other => Err(DmgError::Corrupt(format!(
                "unexpected node kind {} on insert path",
                other
            ))),
        }
    }

    /// Insert into this node, splitting when full. Returns the promotion
    /// (first key of the new right sibling, its node id) on split.
    fn place_record(
        &mut self,
        core: &mut VolumeCore,
        node_id: u32,
        node: &mut Vec<u8>,
        idx: u16,
        rec: &[u8],
    ) -> Result<Option<(K, u32)>> {
        if insert_record_bytes(node, idx, rec)? {
            self.write_node(core, node_id, node)?;
            return Ok(None);
        }
        // Split: the right node takes the upper half of the records.
        let desc = NodeDescriptor::parse(node)?;
        let half = desc.num_records / 2;
        let new_id = self.alloc_node(core)?;
        let mut right = vec![0u8; self.node_size()];
        NodeDescriptor {
            flink: desc.flink,
            blink: node_id,
            kind: desc.kind,
            height: desc.height,
            num_records: 0,
        }
        .write(&mut right);
        set_record_offset(&mut right, 0, NODE_DESCRIPTOR_SIZE);
        for (j, i) in (half..desc.num_records).enumerate() {
            let rec_bytes = record_slice(node, i).to_vec();
            if !insert_record_bytes(&mut right, j as u16, &rec_bytes)? {
                return Err(DmgError::Corrupt("split target overflow".into()));
            }
        }
        for i in (half..desc.num_records).rev() {
            remove_record_bytes(node, i)?;
        }
        let mut left_desc = NodeDescriptor::parse(node)?;
        left_desc.flink = new_id;
        left_desc.write(node);

        // Stitch the sibling chain and the leaf bookkeeping.
        if desc.kind == KIND_LEAF && self.header.last_leaf == node_id {
            self.header.last_leaf = new_id;
        } else if desc.flink != 0 {
            let mut next = self.read_node(core, desc.flink)?;
            let mut next_desc = NodeDescriptor::parse(&next)?;
            next_desc.blink = new_id;
            next_desc.write(&mut next);
            self.write_node(core, desc.flink, &next)?;
        }

        // Place the pending record on the side its key belongs to.
        let (right_first, _) = self.parse_key(record_slice(&right, 0))?;
        let (pending_key, _) = self.parse_key(rec)?;
        if (self.cmp)(&pending_key, &right_first) == Ordering::Less {
            let (at, _) = self.scan_node(node, &pending_key)?;
            if !insert_record_bytes(node, at, rec)? {
                return Err(DmgError::Corrupt("record does not fit after split".into()));
            }
        } else {
            let (at, _) = self.scan_node(&right, &pending_key)?;
            if !insert_record_bytes(&mut right, at, rec)? {
                return Err(DmgError::Corrupt("record does not fit after split".into()));
            }
        }
        self.write_node(core, node_id, node)?;
        self.write_node(core, new_id, &right)?;
        let (split_key, _) = self.parse_key(record_slice(&right, 0))?;
        debug!(
            "split node {} -> {} at record {}",
            node_id, new_id, half
        );
        Ok(Some((split_key, new_id)))
    }

    fn increase_height(
        &mut self,
        core: &mut VolumeCore,
        split_key: K,
        split_node: u32,
    ) -> Result<()> {
        let old_root = self.header.root_node;
        let old = self.read_node(core, old_root)?;
        let old_desc = NodeDescriptor::parse(&old)?;
        let (left_key, _) = self.parse_key(record_slice(&old, 0))?;
        let new_root = self.alloc_node(core)?;
        let mut node = vec![0u8; self.node_size()];
        NodeDescriptor {
            flink: 0,
            blink: 0,
            kind: KIND_INDEX,
            height: old_desc.height + 1,
            num_records: 0,
        }
        .write(&mut node);
        set_record_offset(&mut node, 0, NODE_DESCRIPTOR_SIZE);
        let mut left_rec = left_key.to_bytes();
        let mut be = [0u8; 4];
        BigEndian::write_u32(&mut be, old_root);
        left_rec.extend_from_slice(&be);
        let mut right_rec = split_key.to_bytes();
        BigEndian::write_u32(&mut be, split_node);
        right_rec.extend_from_slice(&be);
        if !insert_record_bytes(&mut node, 0, &left_rec)?
            || !insert_record_bytes(&mut node, 1, &right_rec)?
        {
            return Err(DmgError::Corrupt("root records do not fit new root".into()));
        }
        self.write_node(core, new_root, &node)?;
        self.header.root_node = new_root;
        self.header.tree_depth += 1;
        debug!("tree height now {}", self.header.tree_depth);
        Ok(())
    }

    /// Remove the record with an exactly matching key.
    pub fn remove(&mut self, core: &mut VolumeCore, key: &K) -> Result<()> {
        if self.header.root_node == 0 && self.header.tree_depth == 0 {
            return Err(DmgError::NotFound(format!("key {:?}", key)));
        }
        let root = self.header.root_node;
        let emptied = self.remove_in(core, root, key)?;
        if emptied {
            self.free_node(core, root)?;
            self.header.root_node = 0;
            self.header.first_leaf = 0;
            self.header.last_leaf = 0;
            self.header.tree_depth = 0;
        } else {
            // Collapse a root index node left with a single child.
            let node = self.read_node(core, self.header.root_node)?;
            let desc = NodeDescriptor::parse(&node)?;
            if desc.kind == KIND_INDEX && desc.num_records == 1 {
                let child = Self::index_child(&node, 0)?;
                self.free_node(core, self.header.root_node)?;
                self.header.root_node = child;
                self.header.tree_depth -= 1;
            }
        }
        self.header.leaf_records -= 1;
        self.write_header(core)
    }

    fn remove_in(&mut self, core: &mut VolumeCore, node_id: u32, key: &K) -> Result<bool> {
        let mut node = self.read_node(core, node_id)?;
        let desc = NodeDescriptor::parse(&node)?;
        match desc.kind {
            KIND_LEAF => {
                let (idx, exact) = self.scan_node(&node, key)?;
                if !exact {
                    return Err(DmgError::NotFound(format!("key {:?}", key)));
                }
                remove_record_bytes(&mut node, idx)?;
                let desc = NodeDescriptor::parse(&node)?;
                if desc.num_records == 0 {
                    self.unlink_leaf(core, node_id, &desc)?;
                    return Ok(true);
                }
                self.write_node(core, node_id, &node)?;
                Ok(false)
            }
            KIND_INDEX => {
                let (idx, exact) = self.scan_node(&node, key)?;
                let child_idx = if exact { idx } else { idx.saturating_sub(1) };
                let child = Self::index_child(&node, child_idx)?;
                if self.remove_in(core, child, key)? {
                    self.free_node(core, child)?;
                    let mut node = self.read_node(core, node_id)?;
                    remove_record_bytes(&mut node, child_idx)?;
                    let desc = NodeDescriptor::parse(&node)?;
                    if desc.num_records == 0 {
                        return Ok(true);
                    }
                    self.write_node(core, node_id, &node)?;
                }
                Ok(false)
            }
            other => Err(DmgError::Corrupt(format!(
                "unexpected node kind {} on remove path",
                other
            ))),
        }
    }

    fn unlink_leaf(
        &mut self,
        core: &mut VolumeCore,
        node_id: u32,
        desc: &NodeDescriptor,
    ) -> Result<()> {
        if desc.blink != 0 {
            let mut prev = self.read_node(core, desc.blink)?;
            let mut prev_desc = NodeDescriptor::parse(&prev)?;
            prev_desc.flink = desc.flink;
            prev_desc.write(&mut prev);
            self.write_node(core, desc.blink, &prev)?;
        }
        if desc.flink != 0 {
            let mut next = self.read_node(core, desc.flink)?;
            let mut next_desc = NodeDescriptor::parse(&next)?;
            next_desc.blink = desc.blink;
            next_desc.write(&mut next);
            self.write_node(core, desc.flink, &next)?;
        }
        if self.header.first_leaf == node_id {
            self.header.first_leaf = desc.flink;
        }
        if self.header.last_leaf == node_id {
            self.header.last_leaf = desc.blink;
        }
        Ok(())
    }

    /// Walk leaf records in key order starting at `start`, calling `visit`
    /// until it returns false or the leaves end.
    pub fn scan_from(
        &self,
        core: &mut VolumeCore,
        start: &K,
        mut visit: impl FnMut(&K, &[u8]) -> Result<bool>,
    ) -> Result<()> {
        let Some(loc) = self.search(core, start)? else {
            return Ok(());
        };
        let mut node_id = loc.node;
        let mut idx = loc.record;
        loop {
            let node = self.read_node(core, node_id)?;
            let desc = NodeDescriptor::parse(&node)?;
            while idx < desc.num_records {
                let (key, data) = self.parse_key(record_slice(&node, idx))?;
                if !visit(&key, data)? {
                    return Ok(());
                }
                idx += 1;
            }
            if desc.flink == 0 {
                return Ok(());
            }
            node_id = desc.flink;
            idx = 0;
        }
    }
}
