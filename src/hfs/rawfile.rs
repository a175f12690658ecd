//! Fork-level I/O and block allocation.
//!
//! A fork's bytes are scattered across its extent runs; reads and writes walk
//! the run list translating logical offsets into volume block offsets.
//! `allocate` resizes a fork in place: growth scans the allocation bitmap
//! from `nextAllocation` (wrapping once), zero-fills every block it claims,
//! and records new runs; shrinking releases blocks from the tail.

use log::debug;

use crate::error::{DmgError, Result};
use crate::hfs::volume::{ExtentDescriptor, Fork, VolumeCore};

/// Map a logical fork block to its volume block via the extent runs.
fn fork_block_to_volume(fork: &Fork, block: u64) -> Result<u64> {
    let mut logical = 0u64;
    for ext in &fork.extents {
        let count = ext.block_count as u64;
        if block < logical + count {
            return Ok(ext.start_block as u64 + (block - logical));
        }
        logical += count;
    }
    Err(DmgError::Corrupt(format!(
        "no extent covers fork block {}",
        block
    )))
}

fn check_fork_range(fork: &Fork, bs: u64, offset: u64, len: usize) -> Result<()> {
    let allocated = fork.total_blocks as u64 * bs;
    if offset + len as u64 > allocated {
        return Err(DmgError::Corrupt(format!(
            "fork access past allocation: offset {} len {} allocated {}",
            offset, len, allocated
        )));
    }
    Ok(())
}

impl VolumeCore {
    /// Read from a fork at a logical byte offset.
    pub fn read_fork(&mut self, fork: &Fork, offset: u64, buf: &mut [u8]) -> Result<()> {
        let bs = self.block_size();
        check_fork_range(fork, bs, offset, buf.len())?;
        let mut cur = offset;
        let mut buf_off = 0usize;
        while buf_off < buf.len() {
            let vol_block = fork_block_to_volume(fork, cur / bs)?;
            let within = cur % bs;
            let chunk = ((bs - within) as usize).min(buf.len() - buf_off);
            self.image
                .read_at(vol_block * bs + within, &mut buf[buf_off..buf_off + chunk])?;
            cur += chunk as u64;
            buf_off += chunk;
        }
        Ok(())
    }

    /// Write to a fork at a logical byte offset. The range must already be
    /// allocated; growth happens through `allocate`.
    pub fn write_fork(&mut self, fork: &Fork, offset: u64, buf: &[u8]) -> Result<()> {
        let bs = self.block_size();
        check_fork_range(fork, bs, offset, buf.len())?;
        let mut cur = offset;
        let mut buf_off = 0usize;
        while buf_off < buf.len() {
            let vol_block = fork_block_to_volume(fork, cur / bs)?;
            let within = cur % bs;
            let chunk = ((bs - within) as usize).min(buf.len() - buf_off);
            self.image
                .write_at(vol_block * bs + within, &buf[buf_off..buf_off + chunk])?;
            cur += chunk as u64;
            buf_off += chunk;
        }
        Ok(())
    }

    /// Whether a bit is set in the allocation bitmap.
    pub fn is_block_used(&mut self, block: u32) -> Result<bool> {
        let alloc = self.alloc_fork.clone();
        let mut byte = [0u8; 1];
        self.read_fork(&alloc, (block / 8) as u64, &mut byte)?;
        Ok(byte[0] & (1 << (7 - (block % 8))) != 0)
    }

    pub fn set_block_used(&mut self, block: u32, used: bool) -> Result<()> {
        let alloc = self.alloc_fork.clone();
        let mut byte = [0u8; 1];
        self.read_fork(&alloc, (block / 8) as u64, &mut byte)?;
        if used {
            byte[0] |= 1 << (7 - (block % 8));
        } else {
            byte[0] &= !(1 << (7 - (block % 8)));
        }
        self.write_fork(&alloc, (block / 8) as u64, &byte)
    }

    /// Zero-fill a run of allocation blocks.
    pub fn zero_blocks(&mut self, start: u32, count: u32) -> Result<()> {
        let bs = self.block_size() as usize;
        let zeros = vec![0u8; bs];
        for block in start..start + count {
            self.image.write_at(block as u64 * bs as u64, &zeros)?;
        }
        Ok(())
    }

    /// Resize a fork to `size` bytes, growing or shrinking its extent runs.
    /// New blocks are claimed from the bitmap starting at `nextAllocation`
    /// and zero-filled. The caller persists the updated fork record.
    pub fn allocate(&mut self, fork: &mut Fork, size: u64) -> Result<()> {
        let bs = self.block_size();
        let blocks_needed = size.div_ceil(bs) as u32;

        if blocks_needed > fork.total_blocks {
            let mut to_add = blocks_needed - fork.total_blocks;
            if to_add > self.header.free_blocks {
                return Err(DmgError::InsufficientSpace {
                    needed: to_add as u64 * bs,
                    available: self.header.free_blocks as u64 * bs,
                });
            }
            debug!(
                "allocating {} blocks for cnid {} fork {}",
                to_add, fork.cnid, fork.fork_type
            );
            let total = self.header.total_blocks;
            let mut scan = self.header.next_allocation % total.max(1);
            let mut scanned = 0u32;
            while to_add > 0 {
                if scanned >= total {
                    // Bitmap disagrees with the free-block count.
                    return Err(DmgError::Corrupt(
                        "free block count does not match allocation bitmap".into(),
                    ));
                }
                if self.is_block_used(scan)? {
                    scan = (scan + 1) % total;
                    scanned += 1;
                    continue;
                }
                // Extend the run while blocks stay free and contiguous.
                let run_start = scan;
                let mut run_len = 0u32;
                while run_len < to_add
                    && scan < total
                    && !self.is_block_used(scan)?
                {
                    run_len += 1;
                    scan += 1;
                }
                scanned += run_len;
                for block in run_start..run_start + run_len {
                    self.set_block_used(block, true)?;
                }
                self.zero_blocks(run_start, run_len)?;
                self.header.free_blocks -= run_len;
                to_add -= run_len;
                match fork.extents.last_mut() {
                    Some(last) if last.start_block + last.block_count == run_start => {
                        last.block_count += run_len;
                    }
                    _ => fork.extents.push(ExtentDescriptor {
                        start_block: run_start,
                        block_count: run_len,
                    }),
                }
                if scan >= total {
                    scan = 0;
                }
            }
            self.header.next_allocation = scan % total.max(1);
        } else if blocks_needed < fork.total_blocks {
            let mut to_free = fork.total_blocks - blocks_needed;
            debug!(
                "releasing {} blocks from cnid {} fork {}",
                to_free, fork.cnid, fork.fork_type
            );
            while to_free > 0 {
                let last = fork
                    .extents
                    .last_mut()
                    .ok_or_else(|| DmgError::Corrupt("fork extent list underflow".into()))?;
                let freed = last.block_count.min(to_free);
                let free_start = last.start_block + last.block_count - freed;
                for block in free_start..free_start + freed {
                    self.set_block_used(block, false)?;
                }
                self.header.free_blocks += freed;
                to_free -= freed;
                last.block_count -= freed;
                if last.block_count == 0 {
                    fork.extents.pop();
                }
            }
        }

        fork.total_blocks = blocks_needed;
        fork.logical_size = size;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hfs::test_support::new_test_core;

    #[test]
    fn test_bitmap_bit_math() {
        let mut core = new_test_core();
        assert!(core.is_block_used(0).unwrap()); // header area reserved
        assert!(!core.is_block_used(100).unwrap());
        core.set_block_used(100, true).unwrap();
        assert!(core.is_block_used(100).unwrap());
        assert!(!core.is_block_used(99).unwrap());
        assert!(!core.is_block_used(101).unwrap());
        core.set_block_used(100, false).unwrap();
        assert!(!core.is_block_used(100).unwrap());
    }

    #[test]
    fn test_allocate_claims_free_run() {
        let mut core = new_test_core();
        let free_before = core.header.free_blocks;
        let mut fork = Fork {
            cnid: 20,
            fork_type: 0,
            logical_size: 0,
            clump_size: 512,
            total_blocks: 0,
            extents: Vec::new(),
            special: None,
        };
        core.allocate(&mut fork, 3 * 512 + 10).unwrap();
        assert_eq!(fork.total_blocks, 4);
        assert_eq!(fork.logical_size, 3 * 512 + 10);
        assert_eq!(fork.blocks_in_extents(), 4);
        assert_eq!(core.header.free_blocks, free_before - 4);
        for ext in &fork.extents {
            for b in ext.start_block..ext.start_block + ext.block_count {
                assert!(core.is_block_used(b).unwrap());
            }
        }
    }

    #[test]
    fn test_allocate_skips_used_blocks() {
        let mut core = new_test_core();
        let next = core.header.next_allocation;
        core.set_block_used(next, true).unwrap();
        core.set_block_used(next + 2, true).unwrap();
        core.header.free_blocks -= 2;
        let mut fork = Fork {
            cnid: 21,
            fork_type: 0,
            logical_size: 0,
            clump_size: 512,
            total_blocks: 0,
            extents: Vec::new(),
            special: None,
        };
        core.allocate(&mut fork, 3 * 512).unwrap();
        // One free block between the used pair, then a run after them.
        assert!(fork.extents.len() >= 2);
        assert_eq!(fork.blocks_in_extents(), 3);
        for ext in &fork.extents {
            assert!(ext.start_block != next && ext.start_block != next + 2);
        }
    }

    #[test]
    fn test_shrink_frees_tail_blocks() {
        let mut core = new_test_core();
        let free_before = core.header.free_blocks;
        let mut fork = Fork {
            cnid: 22,
            fork_type: 0,
            logical_size: 0,
            clump_size: 512,
            total_blocks: 0,
            extents: Vec::new(),
            special: None,
        };
        core.allocate(&mut fork, 6 * 512).unwrap();
        core.allocate(&mut fork, 2 * 512).unwrap();
        assert_eq!(fork.total_blocks, 2);
        assert_eq!(fork.blocks_in_extents(), 2);
        assert_eq!(core.header.free_blocks, free_before - 2);
        core.allocate(&mut fork, 0).unwrap();
        assert_eq!(core.header.free_blocks, free_before);
        assert!(fork.extents.is_empty());
    }

    #[test]
    fn test_insufficient_space_is_recoverable() {
        let mut core = new_test_core();
        let mut fork = Fork {
            cnid: 23,
            fork_type: 0,
            logical_size: 0,
            clump_size: 512,
            total_blocks: 0,
            extents: Vec::new(),
            special: None,
        };
        let err = core
            .allocate(&mut fork, core.volume_size() * 2)
            .unwrap_err();
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_fork_read_write_across_extents() {
        let mut core = new_test_core();
        let mut fork = Fork {
            cnid: 24,
            fork_type: 0,
            logical_size: 0,
            clump_size: 512,
            total_blocks: 0,
            extents: Vec::new(),
            special: None,
        };
        core.allocate(&mut fork, 4 * 512).unwrap();
        let data: Vec<u8> = (0..1500u32).map(|i| (i % 251) as u8).collect();
        core.write_fork(&fork, 300, &data).unwrap();
        let mut back = vec![0u8; data.len()];
        core.read_fork(&fork, 300, &mut back).unwrap();
        assert_eq!(back, data);
        // Newly allocated blocks start zeroed.
        let mut head = vec![0u8; 300];
        core.read_fork(&fork, 0, &mut head).unwrap();
        assert!(head.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_fork_access_past_allocation_fails() {
        let mut core = new_test_core();
        let mut fork = Fork {
            cnid: 25,
            fork_type: 0,
            logical_size: 0,
            clump_size: 512,
            total_blocks: 0,
            extents: Vec::new(),
            special: None,
        };
        core.allocate(&mut fork, 512).unwrap();
        let mut buf = [0u8; 16];
        assert!(core.read_fork(&fork, 510, &mut buf).is_err());
    }
}
