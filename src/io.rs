//! Abstract I/O sources.
//!
//! Everything above this layer reads and writes through [`IoSource`]: a
//! file-backed stream, a fixed in-memory region, a growable memory buffer, or
//! a byte-counting sink. `read` and `write` may transfer fewer bytes than
//! asked (a chunked source stops at its chunk boundary); the positioned
//! `read_at`/`write_at` helpers retry until done and are the contract the
//! B-tree, volume and image codecs are written against. Running out of bytes
//! mid-transfer is a hard error.

use std::io::{Read, Seek, SeekFrom, Write};

use crate::error::{DmgError, Result};

pub trait IoSource {
    /// Read up to `buf.len()` bytes at the cursor, returning the count read.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Write `buf` at the cursor, returning the count written.
    fn write(&mut self, buf: &[u8]) -> Result<usize>;

    /// Move the cursor to an absolute offset.
    fn seek(&mut self, offset: u64) -> Result<()>;

    /// Current cursor offset.
    fn tell(&mut self) -> Result<u64>;

    /// Total length in bytes.
    fn len(&mut self) -> Result<u64>;

    fn is_empty(&mut self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Positioned exact read.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.seek(offset)?;
        self.read_exact(buf)
    }

    /// Positioned exact write.
    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        self.seek(offset)?;
        self.write_all(buf)
    }

    /// Exact write at the cursor.
    fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        let mut put = 0;
        while put < buf.len() {
            match self.write(&buf[put..])? {
                0 => {
                    return Err(DmgError::ShortWrite {
                        wanted: buf.len(),
                        got: put,
                    })
                }
                n => put += n,
            }
        }
        Ok(())
    }

    /// Exact read at the cursor.
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        let mut got = 0;
        while got < buf.len() {
            match self.read(&mut buf[got..])? {
                0 => {
                    return Err(DmgError::ShortRead {
                        wanted: buf.len(),
                        got,
                    })
                }
                n => got += n,
            }
        }
        Ok(())
    }
}

/// File-backed source over any seekable stream (`File`, `Cursor`, ...).
pub struct FileSource<F: Read + Write + Seek> {
    inner: F,
}

impl<F: Read + Write + Seek> FileSource<F> {
    pub fn new(inner: F) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> F {
        self.inner
    }
}

impl<F: Read + Write + Seek> IoSource for FileSource<F> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut total = 0;
        // Loop so a pipe-like reader can't produce a spurious short read.
        while total < buf.len() {
            let n = self.inner.read(&mut buf[total..])?;
            if n == 0 {
                break;
            }
            total += n;
        }
        Ok(total)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.inner.write_all(buf)?;
        Ok(buf.len())
    }

    fn seek(&mut self, offset: u64) -> Result<()> {
        self.inner.seek(SeekFrom::Start(offset))?;
        Ok(())
    }

    fn tell(&mut self) -> Result<u64> {
        Ok(self.inner.stream_position()?)
    }

    fn len(&mut self) -> Result<u64> {
        let pos = self.inner.stream_position()?;
        let end = self.inner.seek(SeekFrom::End(0))?;
        self.inner.seek(SeekFrom::Start(pos))?;
        Ok(end)
    }
}

/// Fixed-size memory region. Reads clamp at the end; writes past the end
/// fail rather than grow.
pub struct MemorySource {
    data: Vec<u8>,
    offset: usize,
}

impl MemorySource {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data, offset: 0 }
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }
}

impl IoSource for MemorySource {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let avail = self.data.len().saturating_sub(self.offset);
        let n = buf.len().min(avail);
        buf[..n].copy_from_slice(&self.data[self.offset..self.offset + n]);
        self.offset += n;
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let avail = self.data.len().saturating_sub(self.offset);
        if buf.len() > avail {
            return Err(DmgError::InsufficientSpace {
                needed: buf.len() as u64,
                available: avail as u64,
            });
        }
        self.data[self.offset..self.offset + buf.len()].copy_from_slice(buf);
        self.offset += buf.len();
        Ok(buf.len())
    }

    fn seek(&mut self, offset: u64) -> Result<()> {
        self.offset = offset as usize;
        Ok(())
    }

    fn tell(&mut self) -> Result<u64> {
        Ok(self.offset as u64)
    }

    fn len(&mut self) -> Result<u64> {
        Ok(self.data.len() as u64)
    }
}

/// Growable memory buffer. The logical length only covers bytes actually
/// written; capacity doubles whenever a write runs past it.
pub struct GrowableMemorySource {
    data: Vec<u8>,
    len: usize,
    offset: usize,
}

impl GrowableMemorySource {
    pub fn new() -> Self {
        Self {
            data: vec![0; 1024],
            len: 0,
            offset: 0,
        }
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        let len = data.len();
        Self {
            data,
            len,
            offset: 0,
        }
    }

    /// The written bytes, trimmed to the logical length.
    pub fn into_inner(mut self) -> Vec<u8> {
        self.data.truncate(self.len);
        self.data
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }
}

impl Default for GrowableMemorySource {
    fn default() -> Self {
        Self::new()
    }
}

impl IoSource for GrowableMemorySource {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let avail = self.len.saturating_sub(self.offset);
        let n = buf.len().min(avail);
        buf[..n].copy_from_slice(&self.data[self.offset..self.offset + n]);
        self.offset += n;
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let end = self.offset + buf.len();
        if end > self.data.len() {
            let mut cap = self.data.len().max(1024);
            while cap < end {
                cap <<= 1;
            }
            self.data.resize(cap, 0);
        }
        self.data[self.offset..end].copy_from_slice(buf);
        self.offset = end;
        if end > self.len {
            self.len = end;
        }
        Ok(buf.len())
    }

    fn seek(&mut self, offset: u64) -> Result<()> {
        self.offset = offset as usize;
        Ok(())
    }

    fn tell(&mut self) -> Result<u64> {
        Ok(self.offset as u64)
    }

    fn len(&mut self) -> Result<u64> {
        Ok(self.len as u64)
    }
}

/// Null sink that only tracks the write offset. Used for sizing passes.
pub struct DummySource {
    offset: u64,
}

impl DummySource {
    pub fn new() -> Self {
        Self { offset: 0 }
    }
}

impl Default for DummySource {
    fn default() -> Self {
        Self::new()
    }
}

impl IoSource for DummySource {
    fn read(&mut self, _buf: &mut [u8]) -> Result<usize> {
        Ok(0)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.offset += buf.len() as u64;
        Ok(buf.len())
    }

    fn seek(&mut self, offset: u64) -> Result<()> {
        self.offset = offset;
        Ok(())
    }

    fn tell(&mut self) -> Result<u64> {
        Ok(self.offset)
    }

    fn len(&mut self) -> Result<u64> {
        Ok(self.offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_file_source_roundtrip() {
        let mut src = FileSource::new(Cursor::new(vec![0u8; 16]));
        src.write_at(4, &[1, 2, 3, 4]).unwrap();
        let mut buf = [0u8; 4];
        src.read_at(4, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
        assert_eq!(src.len().unwrap(), 16);
    }

    #[test]
    fn test_short_read_is_error() {
        let mut src = MemorySource::new(vec![0u8; 8]);
        let mut buf = [0u8; 16];
        let err = src.read_at(0, &mut buf).unwrap_err();
        assert!(matches!(err, DmgError::ShortRead { wanted: 16, got: 8 }));
    }

    #[test]
    fn test_memory_source_fixed_bounds() {
        let mut src = MemorySource::new(vec![0u8; 8]);
        assert!(src.write_at(6, &[1, 2, 3]).is_err());
        src.write_at(6, &[1, 2]).unwrap();
        assert_eq!(&src.as_slice()[6..], &[1, 2]);
    }

    #[test]
    fn test_growable_doubles_capacity() {
        let mut src = GrowableMemorySource::new();
        src.write_at(2000, &[0xAB; 100]).unwrap();
        assert_eq!(src.len().unwrap(), 2100);
        let mut buf = [0u8; 100];
        src.read_at(2000, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0xAB));
        // Bytes never written read back as zero.
        src.read_at(0, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_growable_into_inner_trims() {
        let mut src = GrowableMemorySource::new();
        src.write_all(&[1, 2, 3]).unwrap();
        assert_eq!(src.into_inner(), vec![1, 2, 3]);
    }

    #[test]
    fn test_dummy_counts_bytes() {
        let mut sink = DummySource::new();
        sink.write_all(&[0; 512]).unwrap();
        sink.write_all(&[0; 12]).unwrap();
        assert_eq!(sink.tell().unwrap(), 524);
    }
}
