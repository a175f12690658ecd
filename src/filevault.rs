//! FileVault v2 ("encrcdsa") encrypted image access.
//!
//! The payload is divided into fixed-size chunks, each encrypted with
//! AES-128-CBC under a per-chunk IV: the first 16 bytes of HMAC-SHA1 of the
//! big-endian chunk number. [`FileVaultSource`] exposes the decrypted payload
//! as an [`IoSource`], caching one chunk at a time and writing dirty chunks
//! back on eviction.

use byteorder::{BigEndian, ByteOrder};
use cbc::cipher::block_padding::NoPadding;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use log::debug;
use pbkdf2::pbkdf2_hmac;
use sha1::Sha1;

use crate::error::{DmgError, Result};
use crate::io::IoSource;

type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;
type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type HmacSha1 = Hmac<Sha1>;

/// "encrcdsa"
pub const FILEVAULT_V2_SIGNATURE: u64 = 0x656E_6372_6364_7361;
/// "cdsaencr"
pub const FILEVAULT_V1_SIGNATURE: u64 = 0x6364_7361_656E_6372;

pub const FILEVAULT_HEADER_SIZE: usize = 816;

const AES_KEY_LEN: usize = 16;
const HMAC_KEY_LEN: usize = 20;
const IV_LEN: usize = 16;

/// The v2 header at the start of an encrypted image.
#[derive(Debug, Clone)]
pub struct FileVaultHeader {
    pub version: u32,
    pub enc_iv_size: u32,
    pub block_size: u32,
    pub data_size: u64,
    pub data_offset: u64,
    pub kdf_iteration_count: u32,
    pub kdf_salt: Vec<u8>,
    pub blob_enc_iv: [u8; 32],
    pub blob_enc_key_bits: u32,
    pub encrypted_keyblob: Vec<u8>,
}

impl FileVaultHeader {
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < FILEVAULT_HEADER_SIZE {
            return Err(DmgError::ShortRead {
                wanted: FILEVAULT_HEADER_SIZE,
                got: buf.len(),
            });
        }
        let signature = BigEndian::read_u64(&buf[0..]);
        if signature == FILEVAULT_V1_SIGNATURE {
            return Err(DmgError::Unsupported("FileVault v1 image".into()));
        }
        if signature != FILEVAULT_V2_SIGNATURE {
            return Err(DmgError::BadSignature { expected: "encrcdsa", actual: signature });
        }
        let version = BigEndian::read_u32(&buf[8..]);
        if version != 2 {
            return Err(DmgError::Unsupported(format!("FileVault header version {version}")));
        }
        let block_size = BigEndian::read_u32(&buf[36..]);
        if block_size == 0 {
            return Err(DmgError::Corrupt("FileVault block size is zero".into()));
        }
        let salt_len = BigEndian::read_u32(&buf[676..]) as usize;
        if salt_len > 32 {
            return Err(DmgError::Corrupt(format!("FileVault salt length {salt_len}")));
        }
        let keyblob_size = BigEndian::read_u32(&buf[764..]) as usize;
        if keyblob_size > 48 {
            return Err(DmgError::Corrupt(format!("FileVault keyblob size {keyblob_size}")));
        }
        let mut blob_enc_iv = [0u8; 32];
        blob_enc_iv.copy_from_slice(&buf[716..748]);
        Ok(FileVaultHeader {
            version,
            enc_iv_size: BigEndian::read_u32(&buf[12..]),
            block_size,
            data_size: BigEndian::read_u64(&buf[40..]),
            data_offset: BigEndian::read_u64(&buf[48..]),
            kdf_iteration_count: BigEndian::read_u32(&buf[672..]),
            kdf_salt: buf[680..680 + salt_len].to_vec(),
            blob_enc_iv,
            blob_enc_key_bits: BigEndian::read_u32(&buf[748..]),
            encrypted_keyblob: buf[768..768 + keyblob_size].to_vec(),
        })
    }
}

/// The unwrapped key material: an AES key and an HMAC-SHA1 key.
#[derive(Clone)]
pub struct FileVaultKey {
    aes: [u8; AES_KEY_LEN],
    hmac: [u8; HMAC_KEY_LEN],
}

impl FileVaultKey {
    /// A raw 36-byte key given as 72 hex digits: AES key followed by the
    /// HMAC-SHA1 key.
    pub fn from_hex(hex: &str) -> Result<Self> {
        let hex = hex.trim();
        if hex.len() != 2 * (AES_KEY_LEN + HMAC_KEY_LEN) {
            return Err(DmgError::Corrupt(format!(
                "raw key must be {} hex digits, got {}",
                2 * (AES_KEY_LEN + HMAC_KEY_LEN),
                hex.len()
            )));
        }
        let mut raw = [0u8; AES_KEY_LEN + HMAC_KEY_LEN];
        for (i, byte) in raw.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16)
                .map_err(|_| DmgError::Corrupt("raw key is not hex".into()))?;
        }
        Ok(Self::from_raw(&raw))
    }

    fn from_raw(raw: &[u8; AES_KEY_LEN + HMAC_KEY_LEN]) -> Self {
        let mut aes = [0u8; AES_KEY_LEN];
        let mut hmac = [0u8; HMAC_KEY_LEN];
        aes.copy_from_slice(&raw[..AES_KEY_LEN]);
        hmac.copy_from_slice(&raw[AES_KEY_LEN..]);
        FileVaultKey { aes, hmac }
    }

    /// Derive the keyblob unwrap key from a passphrase via PBKDF2-HMAC-SHA1
    /// and decrypt the header's keyblob with it.
    ///
    /// Only AES-wrapped keyblobs are handled; 3DES-wrapped blobs from older
    /// tooling are rejected as unsupported.
    pub fn from_passphrase(header: &FileVaultHeader, passphrase: &str) -> Result<Self> {
        if header.blob_enc_key_bits != 128 {
            return Err(DmgError::Unsupported(format!(
                "{}-bit keyblob cipher",
                header.blob_enc_key_bits
            )));
        }
        if header.encrypted_keyblob.len() < AES_KEY_LEN + HMAC_KEY_LEN {
            return Err(DmgError::Corrupt("keyblob too short".into()));
        }
        let mut unwrap_key = [0u8; AES_KEY_LEN];
        pbkdf2_hmac::<Sha1>(
            passphrase.as_bytes(),
            &header.kdf_salt,
            header.kdf_iteration_count.max(1),
            &mut unwrap_key,
        );
        let decryptor = Aes128CbcDec::new_from_slices(&unwrap_key, &header.blob_enc_iv[..IV_LEN])
            .map_err(|_| DmgError::Corrupt("bad keyblob cipher parameters".into()))?;
        let blob = decryptor
            .decrypt_padded_vec_mut::<NoPadding>(&header.encrypted_keyblob)
            .map_err(|_| DmgError::Corrupt("keyblob decrypt failed".into()))?;
        let mut raw = [0u8; AES_KEY_LEN + HMAC_KEY_LEN];
        raw.copy_from_slice(&blob[..AES_KEY_LEN + HMAC_KEY_LEN]);
        Ok(Self::from_raw(&raw))
    }
}

/// Decrypted view of a FileVault v2 image.
pub struct FileVaultSource {
    inner: Box<dyn IoSource>,
    header: FileVaultHeader,
    raw_header: Vec<u8>,
    key: FileVaultKey,
    chunk: Vec<u8>,
    cur_chunk: u64,
    dirty: bool,
    header_dirty: bool,
    offset: u64,
}

impl FileVaultSource {
    pub fn open(mut inner: Box<dyn IoSource>, key: &FileVaultKey) -> Result<Self> {
        let mut raw_header = vec![0u8; FILEVAULT_HEADER_SIZE];
        inner.read_at(0, &mut raw_header)?;
        let header = FileVaultHeader::parse(&raw_header)?;
        debug!(
            "FileVault v2 image: {} bytes in {}-byte chunks",
            header.data_size, header.block_size
        );
        let mut source = FileVaultSource {
            inner,
            header,
            raw_header,
            key: key.clone(),
            chunk: Vec::new(),
            cur_chunk: u64::MAX,
            dirty: false,
            header_dirty: false,
            offset: 0,
        };
        source.cache_chunk(0)?;
        Ok(source)
    }

    pub fn header(&self) -> &FileVaultHeader {
        &self.header
    }

    /// Write back any dirty chunk and header fields.
    pub fn flush(&mut self) -> Result<()> {
        if self.dirty {
            self.write_chunk()?;
        }
        if self.header_dirty {
            BigEndian::write_u64(&mut self.raw_header[40..], self.header.data_size);
            self.inner.write_at(0, &self.raw_header)?;
            self.header_dirty = false;
        }
        Ok(())
    }

    /// Flush and hand back the underlying encrypted source.
    pub fn into_inner(mut self) -> Result<Box<dyn IoSource>> {
        self.flush()?;
        Ok(self.inner)
    }

    fn chunk_iv(&self, chunk: u64) -> Result<[u8; IV_LEN]> {
        let mut mac = HmacSha1::new_from_slice(&self.key.hmac)
            .map_err(|_| DmgError::Corrupt("bad HMAC key".into()))?;
        mac.update(&(chunk as u32).to_be_bytes());
        let digest = mac.finalize().into_bytes();
        let mut iv = [0u8; IV_LEN];
        iv.copy_from_slice(&digest[..IV_LEN]);
        Ok(iv)
    }

    fn chunk_offset(&self, chunk: u64) -> u64 {
        self.header.data_offset + chunk * self.header.block_size as u64
    }

    fn cache_chunk(&mut self, chunk: u64) -> Result<()> {
        if chunk == self.cur_chunk {
            return Ok(());
        }
        if self.dirty {
            self.write_chunk()?;
        }
        let block_size = self.header.block_size as usize;
        let offset = self.chunk_offset(chunk);
        if offset >= self.inner.len()? {
            // Writing past the existing ciphertext starts a fresh chunk.
            self.chunk = vec![0u8; block_size];
            self.cur_chunk = chunk;
            return Ok(());
        }
        let mut encrypted = vec![0u8; block_size];
        self.inner.read_at(offset, &mut encrypted)?;
        let iv = self.chunk_iv(chunk)?;
        let decryptor = Aes128CbcDec::new_from_slices(&self.key.aes, &iv)
            .map_err(|_| DmgError::Corrupt("bad cipher parameters".into()))?;
        self.chunk = decryptor
            .decrypt_padded_vec_mut::<NoPadding>(&encrypted)
            .map_err(|_| DmgError::Corrupt(format!("chunk {chunk} decrypt failed")))?;
        self.cur_chunk = chunk;
        Ok(())
    }

    fn write_chunk(&mut self) -> Result<()> {
        let iv = self.chunk_iv(self.cur_chunk)?;
        let encryptor = Aes128CbcEnc::new_from_slices(&self.key.aes, &iv)
            .map_err(|_| DmgError::Corrupt("bad cipher parameters".into()))?;
        let encrypted = encryptor.encrypt_padded_vec_mut::<NoPadding>(&self.chunk);
        self.inner.write_at(self.chunk_offset(self.cur_chunk), &encrypted)?;
        self.dirty = false;
        Ok(())
    }
}

impl IoSource for FileVaultSource {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() || self.offset >= self.header.data_size {
            return Ok(0);
        }
        let block_size = self.header.block_size as u64;
        self.cache_chunk(self.offset / block_size)?;
        let within = (self.offset % block_size) as usize;
        let available = (self.header.data_size - self.offset).min((block_size as usize - within) as u64);
        let step = buf.len().min(available as usize);
        buf[..step].copy_from_slice(&self.chunk[within..within + step]);
        self.offset += step as u64;
        Ok(step)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let block_size = self.header.block_size as u64;
        if self.offset + buf.len() as u64 > self.header.data_size {
            self.header.data_size = self.offset + buf.len() as u64;
            self.header_dirty = true;
        }
        self.cache_chunk(self.offset / block_size)?;
        let within = (self.offset % block_size) as usize;
        let step = buf.len().min(block_size as usize - within);
        self.chunk[within..within + step].copy_from_slice(&buf[..step]);
        self.dirty = true;
        self.offset += step as u64;
        Ok(step)
    }

    fn seek(&mut self, offset: u64) -> Result<()> {
        self.offset = offset;
        Ok(())
    }

    fn tell(&mut self) -> Result<u64> {
        Ok(self.offset)
    }

    fn len(&mut self) -> Result<u64> {
        Ok(self.header.data_size)
    }
}
