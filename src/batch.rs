//! Atomic write batches.
//!
//! A batch is the unit of WAL append and memtable apply. Its wire form is
//! also its in-memory form, so group commit can splice batches together
//! without re-encoding:
//!
//! ```text
//! +---------------+------------+------+------+-----+
//! | sequence: u64 | count: u32 | op 1 | op 2 | ... |
//! +---------------+------------+------+------+-----+
//! ```
//!
//! Each op is a tag byte (0 delete, 1 put) followed by a length-prefixed
//! key and, for puts, a length-prefixed value. All integers big-endian.

use byteorder::{BigEndian, ByteOrder, ReadBytesExt, WriteBytesExt};

use crate::error::Result;
use crate::ikey::ValueType;
use crate::memtable::MemTable;
use crate::{corruption, Error};

/// Byte length of the sequence + count header.
pub const BATCH_HEADER_SIZE: usize = 12;

/// An ordered list of put/delete operations applied atomically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteBatch {
    rep: Vec<u8>,
}

impl Default for WriteBatch {
    fn default() -> Self {
        Self::new()
    }
}

impl WriteBatch {
    pub fn new() -> Self {
        WriteBatch {
            rep: vec![0; BATCH_HEADER_SIZE],
        }
    }

    /// Rebuilds a batch from its wire form, as read back from the WAL.
    pub fn from_contents(contents: Vec<u8>) -> Result<Self> {
        if contents.len() < BATCH_HEADER_SIZE {
            return Err(corruption!("write batch shorter than header"));
        }
        Ok(WriteBatch { rep: contents })
    }

    pub fn put(&mut self, key: &[u8], value: &[u8]) {
        self.set_count(self.count() + 1);
        self.rep.push(ValueType::Value as u8);
        self.append_slice(key);
        self.append_slice(value);
    }

    pub fn delete(&mut self, key: &[u8]) {
        self.set_count(self.count() + 1);
        self.rep.push(ValueType::Deletion as u8);
        self.append_slice(key);
    }

    pub fn clear(&mut self) {
        self.rep.clear();
        self.rep.resize(BATCH_HEADER_SIZE, 0);
    }

    /// Number of operations in the batch.
    pub fn count(&self) -> u32 {
        BigEndian::read_u32(&self.rep[8..12])
    }

    fn set_count(&mut self, count: u32) {
        BigEndian::write_u32(&mut self.rep[8..12], count);
    }

    /// Base sequence assigned to the first operation.
    pub fn sequence(&self) -> u64 {
        BigEndian::read_u64(&self.rep[..8])
    }

    pub fn set_sequence(&mut self, seq: u64) {
        BigEndian::write_u64(&mut self.rep[..8], seq);
    }

    /// Wire form, suitable for a WAL record.
    pub fn contents(&self) -> &[u8] {
        &self.rep
    }

    /// Bytes the batch occupies; used by the group-commit size caps.
    pub fn approximate_size(&self) -> usize {
        self.rep.len()
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Splices every op of `other` onto the end of this batch.
    pub fn append(&mut self, other: &WriteBatch) {
        self.set_count(self.count() + other.count());
        self.rep.extend_from_slice(&other.rep[BATCH_HEADER_SIZE..]);
    }

    /// Applies the batch to a memtable, consuming one sequence number per
    /// op starting at the batch's base sequence.
    pub fn insert_into(&self, mem: &MemTable) -> Result<()> {
        let mut seq = self.sequence();
        for op in self.iter() {
            match op? {
                BatchOp::Put(key, value) => mem.add(seq, ValueType::Value, key, value),
                BatchOp::Delete(key) => mem.add(seq, ValueType::Deletion, key, b""),
            }
            seq += 1;
        }
        Ok(())
    }

    pub fn iter(&self) -> BatchIter {
        BatchIter {
            rep: &self.rep,
            pos: BATCH_HEADER_SIZE,
            remaining: self.count(),
        }
    }

    fn append_slice(&mut self, data: &[u8]) {
        self.rep.write_u32::<BigEndian>(data.len() as u32).unwrap();
        self.rep.extend_from_slice(data);
    }
}

/// One decoded batch operation.
#[derive(Debug, PartialEq, Eq)]
pub enum BatchOp<'a> {
    Put(&'a [u8], &'a [u8]),
    Delete(&'a [u8]),
}

pub struct BatchIter<'a> {
    rep: &'a [u8],
    pos: usize,
    remaining: u32,
}

impl<'a> BatchIter<'a> {
    fn read_slice(&mut self) -> Result<&'a [u8]> {
        let mut len_bytes = &self.rep[self.pos..];
        if len_bytes.len() < 4 {
            return Err(corruption!("write batch op truncated"));
        }
        let len = len_bytes.read_u32::<BigEndian>()? as usize;
        self.pos += 4;
        if self.rep.len() - self.pos < len {
            return Err(corruption!("write batch op truncated"));
        }
        let slice = &self.rep[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }
}

impl<'a> Iterator for BatchIter<'a> {
    type Item = Result<BatchOp<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            // Trailing garbage after the counted ops means the count lied.
            if self.pos != self.rep.len() {
                self.pos = self.rep.len();
                return Some(Err(corruption!("write batch count mismatch")));
            }
            return None;
        }
        self.remaining -= 1;

        if self.pos >= self.rep.len() {
            return Some(Err(corruption!("write batch op truncated")));
        }
        let tag = self.rep[self.pos];
        self.pos += 1;

        let op = match ValueType::from_u8(tag) {
            Some(ValueType::Value) => {
                let key = match self.read_slice() {
                    Ok(k) => k,
                    Err(e) => return Some(Err(e)),
                };
                let value = match self.read_slice() {
                    Ok(v) => v,
                    Err(e) => return Some(Err(e)),
                };
                BatchOp::Put(key, value)
            }
            Some(ValueType::Deletion) => {
                let key = match self.read_slice() {
                    Ok(k) => k,
                    Err(e) => return Some(Err(e)),
                };
                BatchOp::Delete(key)
            }
            None => {
                return Some(Err(Error::Corruption(format!(
                    "unknown write batch tag: {tag}"
                ))))
            }
        };
        Some(Ok(op))
    }
}
