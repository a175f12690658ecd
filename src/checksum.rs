//! Incremental checksum accumulators.
//!
//! The image build path streams each sector chunk exactly once while feeding
//! two digests: one over the logical bytes read from the source, one over the
//! physical bytes written to the container. [`ChecksumToken`] bundles the
//! CRC32 / block-checksum / SHA-1 state so a single `update` call covers all
//! of them.

use sha1::{Digest, Sha1};

pub const CHECKSUM_CRC32: u32 = 0x0000_0002;
pub const CHECKSUM_MKBLOCK: u32 = 0x0000_0002;
pub const CHECKSUM_NONE: u32 = 0x0000_0000;

/// CRC32 (IEEE polynomial) accumulator.
pub struct Crc32 {
    hasher: crc32fast::Hasher,
}

impl Crc32 {
    pub fn new() -> Self {
        Self {
            hasher: crc32fast::Hasher::new(),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    pub fn value(&self) -> u32 {
        self.hasher.clone().finalize()
    }
}

impl Default for Crc32 {
    fn default() -> Self {
        Self::new()
    }
}

/// One-shot CRC32.
pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// SHA-1 accumulator.
pub struct Sha1Sum {
    hasher: Sha1,
}

impl Sha1Sum {
    pub fn new() -> Self {
        Self {
            hasher: Sha1::new(),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    pub fn finalize(self) -> [u8; 20] {
        self.hasher.finalize().into()
    }
}

impl Default for Sha1Sum {
    fn default() -> Self {
        Self::new()
    }
}

/// Word-folding block checksum used by the `cSum` and `nsiz` bookkeeping
/// records. Input is folded as big-endian u32 words, the trailing partial
/// word zero-padded. Not a data-integrity digest.
pub struct BlockChecksum {
    state: u32,
    partial: [u8; 4],
    partial_len: usize,
}

impl BlockChecksum {
    pub fn new() -> Self {
        Self {
            state: 0,
            partial: [0; 4],
            partial_len: 0,
        }
    }

    pub fn update(&mut self, mut data: &[u8]) {
        if self.partial_len > 0 {
            while self.partial_len < 4 && !data.is_empty() {
                self.partial[self.partial_len] = data[0];
                self.partial_len += 1;
                data = &data[1..];
            }
            if self.partial_len == 4 {
                self.fold(u32::from_be_bytes(self.partial));
                self.partial_len = 0;
            }
        }
        let mut chunks = data.chunks_exact(4);
        for word in &mut chunks {
            self.fold(u32::from_be_bytes([word[0], word[1], word[2], word[3]]));
        }
        for &b in chunks.remainder() {
            self.partial[self.partial_len] = b;
            self.partial_len += 1;
        }
    }

    pub fn value(&self) -> u32 {
        if self.partial_len == 0 {
            self.state
        } else {
            let mut last = [0u8; 4];
            last[..self.partial_len].copy_from_slice(&self.partial[..self.partial_len]);
            let mut state = self.state;
            state = state.wrapping_add(u32::from_be_bytes(last)).rotate_left(1);
            state
        }
    }

    fn fold(&mut self, word: u32) {
        self.state = self.state.wrapping_add(word).rotate_left(1);
    }
}

impl Default for BlockChecksum {
    fn default() -> Self {
        Self::new()
    }
}

/// Combined digest state threaded through a streaming copy.
///
/// The SHA-1 leg is optional: the data-fork token only tracks CRC32 while the
/// uncompressed (per-partition) token tracks all three.
pub struct ChecksumToken {
    pub crc: Crc32,
    pub block: BlockChecksum,
    pub sha1: Option<Sha1Sum>,
}

impl ChecksumToken {
    /// CRC32-only token, used for the physical (written) byte stream.
    pub fn crc_only() -> Self {
        Self {
            crc: Crc32::new(),
            block: BlockChecksum::new(),
            sha1: None,
        }
    }

    /// Full token: CRC32, block checksum and SHA-1 over the logical bytes.
    pub fn full() -> Self {
        Self {
            crc: Crc32::new(),
            block: BlockChecksum::new(),
            sha1: Some(Sha1Sum::new()),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.crc.update(data);
        self.block.update(data);
        if let Some(sha1) = self.sha1.as_mut() {
            sha1.update(data);
        }
    }

    pub fn crc_value(&self) -> u32 {
        self.crc.value()
    }

    pub fn block_value(&self) -> u32 {
        self.block.value()
    }

    pub fn sha1_digest(self) -> Option<[u8; 20]> {
        self.sha1.map(Sha1Sum::finalize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc32_empty_is_zero_state() {
        assert_eq!(Crc32::new().value(), 0);
        assert_eq!(crc32(&[]), 0);
    }

    #[test]
    fn test_crc32_reference_vector() {
        // CRC32("123456789") is the standard check value.
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn test_crc32_incremental_matches_oneshot() {
        let mut acc = Crc32::new();
        acc.update(b"hello ");
        acc.update(b"world");
        assert_eq!(acc.value(), crc32(b"hello world"));
    }

    #[test]
    fn test_sha1_empty_reference() {
        let digest = Sha1Sum::new().finalize();
        let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
        assert_eq!(hex, "da39a3ee5e6b4b0d3255bfef95601890afd80709");
    }

    #[test]
    fn test_block_checksum_split_independent() {
        let mut a = BlockChecksum::new();
        a.update(&[1, 2, 3, 4, 5, 6, 7, 8]);
        let mut b = BlockChecksum::new();
        b.update(&[1, 2, 3]);
        b.update(&[4, 5]);
        b.update(&[6, 7, 8]);
        assert_eq!(a.value(), b.value());
    }

    #[test]
    fn test_block_checksum_partial_tail() {
        let mut a = BlockChecksum::new();
        a.update(&[1, 2, 3, 4, 5]);
        let mut b = BlockChecksum::new();
        b.update(&[1, 2, 3, 4, 5, 0, 0, 0]);
        assert_eq!(a.value(), b.value());
    }

    #[test]
    fn test_token_tracks_all_legs() {
        let mut token = ChecksumToken::full();
        token.update(b"abc");
        assert_eq!(token.crc_value(), crc32(b"abc"));
        let digest = token.sha1_digest().unwrap();
        let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
        assert_eq!(hex, "a9993e364706816aba3e25717850c26c9cd0d89d");
    }
}
