//! Framed append-only record log.
//!
//! Used for both the write-ahead log (records are write batches) and the
//! manifest (records are version edits). The file is a sequence of 32KiB
//! blocks; records never straddle a block boundary raw, they are split into
//! fragments with a per-fragment header:
//!
//! ```text
//! +-----------+-------------+----------+------------------+
//! | crc32: u32| length: u16 | type: u8 | payload (length) |
//! +-----------+-------------+----------+------------------+
//! ```
//!
//! Type is Full for an unfragmented record, or First/Middle/Last for the
//! fragments of a record spanning blocks. The checksum covers the type byte
//! and the payload. A block tail smaller than a header is zero-padded; a
//! zeroed header signals the reader to skip to the next block.
//!
//! A torn final record (crash mid-append) surfaces as `Corruption` from the
//! reader; every record before it is intact. Recovery decides whether to
//! stop quietly or escalate based on `paranoid_checks`.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};

use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI};

use crate::corruption;
use crate::error::Result;

pub const BLOCK_SIZE: usize = 32 * 1024;
pub const HEADER_SIZE: usize = 4 + 2 + 1;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

const FULL: u8 = 1;
const FIRST: u8 = 2;
const MIDDLE: u8 = 3;
const LAST: u8 = 4;

pub struct LogWriter {
    file: File,
    writer: BufWriter<File>,
    block_offset: usize,
}

impl LogWriter {
    pub fn new(file: File) -> Result<Self> {
        Self::with_offset(file, 0)
    }

    /// Resumes appending to a log whose current length is `initial_len`,
    /// as used when `reuse_logs` keeps the recovered WAL open.
    pub fn with_offset(file: File, initial_len: u64) -> Result<Self> {
        let writer = BufWriter::new(file.try_clone()?);
        Ok(LogWriter {
            file,
            writer,
            block_offset: (initial_len % BLOCK_SIZE as u64) as usize,
        })
    }

    /// Appends one record, fragmenting across blocks as needed.
    pub fn add_record(&mut self, record: &[u8]) -> Result<()> {
        let mut remaining = record;
        let mut begin = true;

        loop {
            let leftover = BLOCK_SIZE - self.block_offset;
            if leftover < HEADER_SIZE {
                // Too small for a header: pad and move to a fresh block.
                if leftover > 0 {
                    self.writer.write_all(&[0u8; HEADER_SIZE][..leftover])?;
                }
                self.block_offset = 0;
            }

            let available = BLOCK_SIZE - self.block_offset - HEADER_SIZE;
            let fragment_len = remaining.len().min(available);
            let end = fragment_len == remaining.len();

            let record_type = match (begin, end) {
                (true, true) => FULL,
                (true, false) => FIRST,
                (false, true) => LAST,
                (false, false) => MIDDLE,
            };

            self.emit_physical_record(record_type, &remaining[..fragment_len])?;
            remaining = &remaining[fragment_len..];
            begin = false;
            if end {
                return Ok(());
            }
        }
    }

    fn emit_physical_record(&mut self, record_type: u8, payload: &[u8]) -> Result<()> {
        let mut digest = CRC32.digest();
        digest.update(&[record_type]);
        digest.update(payload);
        let checksum = digest.finalize();

        self.writer.write_u32::<BigEndian>(checksum)?;
        self.writer.write_u16::<BigEndian>(payload.len() as u16)?;
        self.writer.write_u8(record_type)?;
        self.writer.write_all(payload)?;
        self.block_offset += HEADER_SIZE + payload.len();
        Ok(())
    }

    /// Flushes buffered records to the OS.
    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    /// Flushes and fsyncs, making every appended record durable.
    pub fn sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.file.sync_all()?;
        Ok(())
    }
}

pub struct LogReader {
    reader: BufReader<File>,
    block: Vec<u8>,
    pos: usize,
    eof: bool,
}

impl LogReader {
    pub fn new(file: File) -> Self {
        LogReader {
            reader: BufReader::new(file),
            block: Vec::new(),
            pos: 0,
            eof: false,
        }
    }

    /// Reads the next complete record, reassembling fragments. Returns
    /// Ok(None) at a clean end of log and `Corruption` for a torn or
    /// mangled record; everything read before the error is valid.
    pub fn read_record(&mut self) -> Result<Option<Vec<u8>>> {
        let mut scratch: Option<Vec<u8>> = None;

        loop {
            let (record_type, payload) = match self.read_physical_record()? {
                Some(fragment) => fragment,
                None => {
                    return if scratch.is_none() {
                        Ok(None)
                    } else {
                        // Log ended inside a fragmented record.
                        Err(corruption!("log ended mid-record"))
                    };
                }
            };

            match (record_type, &mut scratch) {
                (FULL, None) => return Ok(Some(payload)),
                (FIRST, None) => scratch = Some(payload),
                (MIDDLE, Some(buf)) => buf.extend_from_slice(&payload),
                (LAST, Some(buf)) => {
                    buf.extend_from_slice(&payload);
                    return Ok(Some(scratch.take().unwrap()));
                }
                (t, _) => {
                    return Err(corruption!("unexpected record fragment type {t}"));
                }
            }
        }
    }

    fn read_physical_record(&mut self) -> Result<Option<(u8, Vec<u8>)>> {
        loop {
            if self.block.len() - self.pos < HEADER_SIZE {
                if !self.fill_block()? {
                    return Ok(None);
                }
                continue;
            }

            let header = &self.block[self.pos..self.pos + HEADER_SIZE];
            let expected_crc = BigEndian::read_u32(&header[0..4]);
            let length = BigEndian::read_u16(&header[4..6]) as usize;
            let record_type = header[6];

            if record_type == 0 && length == 0 {
                // Zero padding at a block tail; skip to the next block.
                self.pos = self.block.len();
                continue;
            }

            if self.pos + HEADER_SIZE + length > self.block.len() {
                return Err(corruption!("log record extends past block tail"));
            }

            let start = self.pos + HEADER_SIZE;
            let payload = &self.block[start..start + length];

            let mut digest = CRC32.digest();
            digest.update(&[record_type]);
            digest.update(payload);
            if digest.finalize() != expected_crc {
                return Err(corruption!("log record checksum mismatch"));
            }

            let payload = payload.to_vec();
            self.pos = start + length;
            return Ok(Some((record_type, payload)));
        }
    }

    /// Loads the next 32KiB block (possibly short at EOF). Returns false at
    /// end of file.
    fn fill_block(&mut self) -> Result<bool> {
        if self.eof {
            return Ok(false);
        }
        let mut block = vec![0u8; BLOCK_SIZE];
        let mut filled = 0;
        while filled < BLOCK_SIZE {
            let n = self.reader.read(&mut block[filled..])?;
            if n == 0 {
                self.eof = true;
                break;
            }
            filled += n;
        }
        block.truncate(filled);
        if filled == 0 {
            return Ok(false);
        }
        self.block = block;
        self.pos = 0;
        Ok(true)
    }
}
