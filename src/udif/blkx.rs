//! `blkx` tables: the sector-run maps stored in the resource fork.

use std::io::{Read, Write};

use byteorder::{BigEndian, ByteOrder};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use log::debug;

use crate::checksum::{ChecksumToken, Crc32};
use crate::error::{DmgError, Result};
use crate::io::IoSource;
use crate::udif::koly::UdifChecksum;
use crate::udif::{
    BLOCK_ADC, BLOCK_COMMENT, BLOCK_IGNORE, BLOCK_RAW, BLOCK_TERMINATOR, BLOCK_ZLIB,
    SECTORS_AT_A_TIME, SECTOR_SIZE,
};

pub const BLKX_SIGNATURE: u32 = 0x6D69_7368; // 'mish'
pub const BLKX_INFO_VERSION: u32 = 1;
pub const BLKX_HEADER_SIZE: usize = 204;
pub const BLKX_RUN_SIZE: usize = 40;

/// How much decompression buffer readers should reserve, in sectors.
const DECOMPRESS_BUFFER_REQUESTED: u32 = 0x208;

const COPY_CHUNK: usize = 1024 * 1024;

/// One run within a `blkx` table: a span of sectors and where its
/// (possibly compressed) bytes live in the data fork.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlkxRun {
    pub kind: u32,
    pub sector_start: u64,
    pub sector_count: u64,
    pub comp_offset: u64,
    pub comp_length: u64,
}

impl BlkxRun {
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < BLKX_RUN_SIZE {
            return Err(DmgError::ShortRead { wanted: BLKX_RUN_SIZE, got: buf.len() });
        }
        Ok(BlkxRun {
            kind: BigEndian::read_u32(&buf[0..]),
            sector_start: BigEndian::read_u64(&buf[8..]),
            sector_count: BigEndian::read_u64(&buf[16..]),
            comp_offset: BigEndian::read_u64(&buf[24..]),
            comp_length: BigEndian::read_u64(&buf[32..]),
        })
    }

    pub fn write(&self, buf: &mut [u8]) {
        BigEndian::write_u32(&mut buf[0..], self.kind);
        BigEndian::write_u32(&mut buf[4..], 0);
        BigEndian::write_u64(&mut buf[8..], self.sector_start);
        BigEndian::write_u64(&mut buf[16..], self.sector_count);
        BigEndian::write_u64(&mut buf[24..], self.comp_offset);
        BigEndian::write_u64(&mut buf[32..], self.comp_length);
    }
}

/// A full `blkx` table: 204-byte header plus one 40-byte entry per run.
#[derive(Debug, Clone)]
pub struct BlkxTable {
    pub first_sector_number: u64,
    pub sector_count: u64,
    pub data_start: u64,
    pub blocks_descriptor: u32,
    pub checksum: UdifChecksum,
    pub runs: Vec<BlkxRun>,
}

impl BlkxTable {
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < BLKX_HEADER_SIZE {
            return Err(DmgError::ShortRead {
                wanted: BLKX_HEADER_SIZE,
                got: buf.len(),
            });
        }
        let sig = BigEndian::read_u32(&buf[0..]);
        if sig != BLKX_SIGNATURE {
            return Err(DmgError::BadSignature { expected: "mish", actual: sig as u64 });
        }
        let run_count = BigEndian::read_u32(&buf[200..]) as usize;
        let wanted = BLKX_HEADER_SIZE + run_count * BLKX_RUN_SIZE;
        if buf.len() < wanted {
            return Err(DmgError::ShortRead { wanted, got: buf.len() });
        }
        let mut runs = Vec::with_capacity(run_count);
        for i in 0..run_count {
            runs.push(BlkxRun::parse(&buf[BLKX_HEADER_SIZE + i * BLKX_RUN_SIZE..])?);
        }
        Ok(BlkxTable {
            first_sector_number: BigEndian::read_u64(&buf[8..]),
            sector_count: BigEndian::read_u64(&buf[16..]),
            data_start: BigEndian::read_u64(&buf[24..]),
            blocks_descriptor: BigEndian::read_u32(&buf[36..]),
            checksum: UdifChecksum::parse(&buf[64..200])?,
            runs,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; BLKX_HEADER_SIZE + self.runs.len() * BLKX_RUN_SIZE];
        BigEndian::write_u32(&mut buf[0..], BLKX_SIGNATURE);
        BigEndian::write_u32(&mut buf[4..], BLKX_INFO_VERSION);
        BigEndian::write_u64(&mut buf[8..], self.first_sector_number);
        BigEndian::write_u64(&mut buf[16..], self.sector_count);
        BigEndian::write_u64(&mut buf[24..], self.data_start);
        BigEndian::write_u32(&mut buf[32..], DECOMPRESS_BUFFER_REQUESTED);
        BigEndian::write_u32(&mut buf[36..], self.blocks_descriptor);
        self.checksum.write(&mut buf[64..200]);
        BigEndian::write_u32(&mut buf[200..], self.runs.len() as u32);
        for (i, run) in self.runs.iter().enumerate() {
            run.write(&mut buf[BLKX_HEADER_SIZE + i * BLKX_RUN_SIZE..]);
        }
        buf
    }
}

/// Compress `sector_count` sectors from `input` into `out`, appending runs at
/// the current write position, and return the finished table.
///
/// Each chunk is deflated wholesale; if the deflated form occupies at least as
/// many sectors as the input, the chunk is stored raw instead. `uncompressed`
/// observes the plain sector bytes, `data_fork` the bytes actually written.
pub fn insert_blkx(
    out: &mut dyn IoSource,
    input: &mut dyn IoSource,
    first_sector_number: u64,
    sector_count: u64,
    blocks_descriptor: u32,
    uncompressed: &mut ChecksumToken,
    data_fork: &mut Crc32,
) -> Result<BlkxTable> {
    let mut table = BlkxTable {
        first_sector_number,
        sector_count,
        data_start: 0,
        blocks_descriptor,
        checksum: UdifChecksum::none(),
        runs: Vec::new(),
    };

    let mut cur_sector: u64 = 0;
    let mut remaining = sector_count;
    while remaining > 0 {
        let sectors = remaining.min(SECTORS_AT_A_TIME);
        let mut plain = vec![0u8; (sectors * SECTOR_SIZE) as usize];
        input.read_exact(&mut plain)?;
        uncompressed.update(&plain);

        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&plain)?;
        let compressed = encoder.finish()?;

        let comp_offset = out.tell()? - table.data_start;
        let run = if (compressed.len() as u64) / SECTOR_SIZE > sectors {
            // Incompressible chunk, store it raw.
            out.write_all(&plain)?;
            data_fork.update(&plain);
            BlkxRun {
                kind: BLOCK_RAW,
                sector_start: cur_sector,
                sector_count: sectors,
                comp_offset,
                comp_length: plain.len() as u64,
            }
        } else {
            out.write_all(&compressed)?;
            data_fork.update(&compressed);
            BlkxRun {
                kind: BLOCK_ZLIB,
                sector_start: cur_sector,
                sector_count: sectors,
                comp_offset,
                comp_length: compressed.len() as u64,
            }
        };
        table.runs.push(run);
        cur_sector += sectors;
        remaining -= sectors;
    }

    table.runs.push(BlkxRun {
        kind: BLOCK_TERMINATOR,
        sector_start: cur_sector,
        sector_count: 0,
        comp_offset: out.tell()? - table.data_start,
        comp_length: 0,
    });

    table.checksum = UdifChecksum::crc32(uncompressed.crc_value());
    debug!(
        "blkx table for sectors {}..{}: {} runs",
        first_sector_number,
        first_sector_number + sector_count,
        table.runs.len()
    );
    Ok(table)
}

/// Decompress every run of `table` into `out`, starting at the current
/// write position of `out`.
pub fn extract_blkx(input: &mut dyn IoSource, out: &mut dyn IoSource, table: &BlkxTable) -> Result<()> {
    let base = out.tell()?;
    for run in &table.runs {
        match run.kind {
            BLOCK_TERMINATOR => break,
            BLOCK_IGNORE | BLOCK_COMMENT => continue,
            _ => {}
        }
        if run.comp_length == 0 {
            continue;
        }

        // Pre-extend the output to cover the run span so sparse seeks land
        // inside the file.
        let span_end = base + (run.sector_start + run.sector_count) * SECTOR_SIZE;
        if out.len()? < span_end {
            out.seek(span_end - 1)?;
            out.write(&[0])?;
        }
        out.seek(base + run.sector_start * SECTOR_SIZE)?;
        input.seek(table.data_start + run.comp_offset)?;

        match run.kind {
            BLOCK_ZLIB => {
                let mut compressed = vec![0u8; run.comp_length as usize];
                input.read_exact(&mut compressed)?;
                let mut decoder = ZlibDecoder::new(&compressed[..]);
                let mut plain = Vec::with_capacity((run.sector_count * SECTOR_SIZE) as usize);
                decoder.read_to_end(&mut plain)?;
                if plain.len() as u64 != run.sector_count * SECTOR_SIZE {
                    return Err(DmgError::Corrupt(format!(
                        "zlib run at sector {} inflated to {} bytes, wanted {}",
                        run.sector_start,
                        plain.len(),
                        run.sector_count * SECTOR_SIZE
                    )));
                }
                out.write_all(&plain)?;
            }
            BLOCK_RAW => {
                let mut remaining = run.comp_length;
                let mut page = vec![0u8; COPY_CHUNK];
                while remaining > 0 {
                    let step = remaining.min(COPY_CHUNK as u64) as usize;
                    input.read_exact(&mut page[..step])?;
                    out.write_all(&page[..step])?;
                    remaining -= step as u64;
                }
            }
            BLOCK_ADC => {
                return Err(DmgError::Unsupported("ADC-compressed run".into()));
            }
            other => {
                return Err(DmgError::Corrupt(format!("unknown blkx run type {other:#x}")));
            }
        }
    }
    Ok(())
}
