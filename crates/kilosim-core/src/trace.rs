//! Access trace files: fixed-size records, chunked and deflate-compressed,
//! for inter-run reproducibility.
//!
//! # File format
//!
//! - 16-byte header: magic, version, `numChildren`, `finished`.
//!   `finished` flips to 1 on a clean close; readers reject torn files.
//! - A sequence of chunks, each `[raw_len: u32][comp_len: u32][deflate
//!   bytes]`, holding up to 256 Ki packed records.
//! - Packed record (24 bytes, little-endian): `lineAddr: u64, reqCycle:
//!   u64, latency: u32, childId: u16, type: u16`.

use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::mem::{AccessType, Address};

const TRACE_MAGIC: u32 = 0x4b_53_54_52; // "KSTR"
const TRACE_VERSION: u32 = 1;
const CHUNK_RECORDS: usize = 256 * 1024;
const RECORD_BYTES: usize = 24;
const FINISHED_OFFSET: u64 = 12;

/// One traced access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessRecord {
    pub line_addr: Address,
    pub req_cycle: u64,
    pub latency: u32,
    pub child_id: u16,
    pub acc_type: AccessType,
}

fn pack(rec: &AccessRecord, out: &mut Vec<u8>) {
    out.extend_from_slice(&rec.line_addr.to_le_bytes());
    out.extend_from_slice(&rec.req_cycle.to_le_bytes());
    out.extend_from_slice(&rec.latency.to_le_bytes());
    out.extend_from_slice(&rec.child_id.to_le_bytes());
    out.extend_from_slice(&rec.acc_type.to_u16().to_le_bytes());
}

fn unpack(buf: &[u8]) -> io::Result<AccessRecord> {
    let addr = u64::from_le_bytes(buf[0..8].try_into().unwrap());
    let cycle = u64::from_le_bytes(buf[8..16].try_into().unwrap());
    let latency = u32::from_le_bytes(buf[16..20].try_into().unwrap());
    let child = u16::from_le_bytes(buf[20..22].try_into().unwrap());
    let ty = u16::from_le_bytes(buf[22..24].try_into().unwrap());
    let acc_type = AccessType::from_u16(ty)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, format!("bad access type {ty}")))?;
    Ok(AccessRecord {
        line_addr: addr,
        req_cycle: cycle,
        latency,
        child_id: child,
        acc_type,
    })
}

/// Writes a trace file; call [`AccessTraceWriter::finish`] for a clean
/// close, or the `finished` attribute stays 0.
pub struct AccessTraceWriter {
    file: BufWriter<File>,
    buf: Vec<u8>,
    buffered_records: usize,
}

impl AccessTraceWriter {
    pub fn create(path: &Path, num_children: u32) -> io::Result<Self> {
        let mut file = BufWriter::new(
            OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .read(true)
                .open(path)?,
        );
        file.write_all(&TRACE_MAGIC.to_le_bytes())?;
        file.write_all(&TRACE_VERSION.to_le_bytes())?;
        file.write_all(&num_children.to_le_bytes())?;
        file.write_all(&0u32.to_le_bytes())?; // finished
        Ok(AccessTraceWriter {
            file,
            buf: Vec::with_capacity(CHUNK_RECORDS * RECORD_BYTES),
            buffered_records: 0,
        })
    }

    pub fn write(&mut self, rec: &AccessRecord) -> io::Result<()> {
        pack(rec, &mut self.buf);
        self.buffered_records += 1;
        if self.buffered_records >= CHUNK_RECORDS {
            self.dump_chunk()?;
        }
        Ok(())
    }

    fn dump_chunk(&mut self) -> io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let mut enc = ZlibEncoder::new(Vec::new(), Compression::best());
        enc.write_all(&self.buf)?;
        let comp = enc.finish()?;
        self.file.write_all(&(self.buf.len() as u32).to_le_bytes())?;
        self.file.write_all(&(comp.len() as u32).to_le_bytes())?;
        self.file.write_all(&comp)?;
        self.buf.clear();
        self.buffered_records = 0;
        Ok(())
    }

    /// Flush pending records and set the `finished` attribute.
    pub fn finish(mut self) -> io::Result<()> {
        self.dump_chunk()?;
        self.file.flush()?;
        let f = self.file.get_mut();
        f.seek(SeekFrom::Start(FINISHED_OFFSET))?;
        f.write_all(&1u32.to_le_bytes())?;
        f.flush()
    }
}

/// Streaming trace reader; decompresses one chunk at a time.
pub struct AccessTraceReader {
    file: BufReader<File>,
    num_children: u32,
    chunk: Vec<u8>,
    cur: usize,
}

impl AccessTraceReader {
    pub fn open(path: &Path) -> io::Result<Self> {
        let mut file = BufReader::new(File::open(path)?);
        let mut header = [0u8; 16];
        file.read_exact(&mut header)?;
        let magic = u32::from_le_bytes(header[0..4].try_into().unwrap());
        let version = u32::from_le_bytes(header[4..8].try_into().unwrap());
        let num_children = u32::from_le_bytes(header[8..12].try_into().unwrap());
        let finished = u32::from_le_bytes(header[12..16].try_into().unwrap());
        if magic != TRACE_MAGIC {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "not a trace file"));
        }
        if version != TRACE_VERSION {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unsupported trace version {version}"),
            ));
        }
        if finished != 1 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "trace file was not closed cleanly",
            ));
        }
        Ok(AccessTraceReader {
            file,
            num_children,
            chunk: Vec::new(),
            cur: 0,
        })
    }

    pub fn num_children(&self) -> u32 {
        self.num_children
    }

    fn next_chunk(&mut self) -> io::Result<bool> {
        let mut lens = [0u8; 8];
        match self.file.read_exact(&mut lens) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(false),
            Err(e) => return Err(e),
        }
        let raw_len = u32::from_le_bytes(lens[0..4].try_into().unwrap()) as usize;
        let comp_len = u32::from_le_bytes(lens[4..8].try_into().unwrap()) as u64;
        let mut dec = ZlibDecoder::new((&mut self.file).take(comp_len));
        self.chunk.clear();
        self.chunk.reserve(raw_len);
        dec.read_to_end(&mut self.chunk)?;
        if self.chunk.len() != raw_len {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "truncated chunk"));
        }
        self.cur = 0;
        Ok(true)
    }

    /// Next record, or `None` at end of trace.
    pub fn read(&mut self) -> io::Result<Option<AccessRecord>> {
        if self.cur + RECORD_BYTES > self.chunk.len() && !self.next_chunk()? {
            return Ok(None);
        }
        let rec = unpack(&self.chunk[self.cur..self.cur + RECORD_BYTES])?;
        self.cur += RECORD_BYTES;
        Ok(Some(rec))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_records(n: u64) -> Vec<AccessRecord> {
        (0..n)
            .map(|i| AccessRecord {
                line_addr: 0x1000 + i * 7,
                req_cycle: i * 100,
                latency: (i % 300) as u32,
                child_id: (i % 4) as u16,
                acc_type: match i % 4 {
                    0 => AccessType::Gets,
                    1 => AccessType::Getx,
                    2 => AccessType::Puts,
                    _ => AccessType::Putx,
                },
            })
            .collect()
    }

    #[test]
    fn trace_survives_write_and_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.trace");
        let records = sample_records(1000);
        let mut w = AccessTraceWriter::create(&path, 4).unwrap();
        for r in &records {
            w.write(r).unwrap();
        }
        w.finish().unwrap();

        let mut rd = AccessTraceReader::open(&path).unwrap();
        assert_eq!(rd.num_children(), 4);
        let mut got = Vec::new();
        while let Some(r) = rd.read().unwrap() {
            got.push(r);
        }
        assert_eq!(got, records);
    }

    #[test]
    fn unfinished_trace_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.trace");
        let mut w = AccessTraceWriter::create(&path, 1).unwrap();
        w.write(&sample_records(1)[0]).unwrap();
        // Drop without finish(): finished stays 0.
        drop(w);
        assert!(AccessTraceReader::open(&path).is_err());
    }

    #[test]
    fn garbage_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.trace");
        std::fs::write(&path, b"definitely not a trace file").unwrap();
        assert!(AccessTraceReader::open(&path).is_err());
    }
}
