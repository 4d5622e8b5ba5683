//! Prefix-compressed key-value blocks.
//!
//! Entries share key prefixes with their predecessor except at restart
//! points, which anchor binary search for seeks:
//!
//! ```text
//! +------------+------------+---------------+---------------+---------+
//! | shared:u16 |unshared:u16| value_len:u32 | key unshared  | value   |
//! +------------+------------+---------------+---------------+---------+
//! ...entries...
//! +---------------------+-------------------+
//! | restart offsets:u32 | restart count:u32 |
//! +---------------------+-------------------+
//! ```
//!
//! Keys are encoded internal keys; ordering throughout is internal-key
//! order.

use std::cmp::Ordering;
use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder, WriteBytesExt};

use crate::corruption;
use crate::error::Result;
use crate::ikey;

/// Accumulates sorted entries into one block image.
pub struct BlockBuilder {
    restart_interval: usize,
    buffer: Vec<u8>,
    restart_positions: Vec<u32>,
    entry_count: usize,
    last_key: Vec<u8>,
}

impl BlockBuilder {
    pub fn new(restart_interval: usize) -> Self {
        Self {
            restart_interval: restart_interval.max(1),
            buffer: Vec::new(),
            restart_positions: Vec::new(),
            entry_count: 0,
            last_key: Vec::new(),
        }
    }

    /// Adds an entry; keys must arrive in ascending internal-key order.
    pub fn add(&mut self, key: &[u8], value: &[u8]) {
        debug_assert!(
            self.entry_count == 0 || ikey::compare(&self.last_key, key) == Ordering::Less
        );

        let shared = if self.entry_count % self.restart_interval == 0 {
            self.restart_positions.push(self.buffer.len() as u32);
            0
        } else {
            shared_prefix_length(&self.last_key, key)
        };
        let unshared = key.len() - shared;

        self.buffer.write_u16::<BigEndian>(shared as u16).unwrap();
        self.buffer.write_u16::<BigEndian>(unshared as u16).unwrap();
        self.buffer
            .write_u32::<BigEndian>(value.len() as u32)
            .unwrap();
        self.buffer.extend_from_slice(&key[shared..]);
        self.buffer.extend_from_slice(value);

        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        self.entry_count += 1;
    }

    /// Appends the restart array and returns the finished block image.
    pub fn finish(mut self) -> Vec<u8> {
        if self.restart_positions.is_empty() {
            self.restart_positions.push(0);
        }
        for pos in &self.restart_positions {
            self.buffer.write_u32::<BigEndian>(*pos).unwrap();
        }
        self.buffer
            .write_u32::<BigEndian>(self.restart_positions.len() as u32)
            .unwrap();
        self.buffer
    }

    /// Bytes the finished block will occupy.
    pub fn current_size_estimate(&self) -> usize {
        self.buffer.len() + self.restart_positions.len() * 4 + 4
    }

    pub fn is_empty(&self) -> bool {
        self.entry_count == 0
    }

    pub fn entry_count(&self) -> usize {
        self.entry_count
    }

    pub fn last_key(&self) -> &[u8] {
        &self.last_key
    }
}

fn shared_prefix_length(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|&(x, y)| x == y).count()
}

/// A decoded, immutable block.
pub struct Block {
    data: Vec<u8>,
    restart_positions: Vec<u32>,
}

impl Block {
    pub fn new(data: Vec<u8>) -> Result<Self> {
        if data.len() < 4 {
            return Err(corruption!("block shorter than restart count"));
        }
        let num_restarts_offset = data.len() - 4;
        let num_restarts = BigEndian::read_u32(&data[num_restarts_offset..]) as usize;

        let restart_array_size = num_restarts
            .checked_mul(4)
            .ok_or_else(|| corruption!("block restart count overflow"))?;
        if num_restarts_offset < restart_array_size {
            return Err(corruption!("block too short for restart array"));
        }

        let restart_array_offset = num_restarts_offset - restart_array_size;
        let mut restart_positions = Vec::with_capacity(num_restarts);
        for i in 0..num_restarts {
            let pos = BigEndian::read_u32(&data[restart_array_offset + i * 4..]);
            if pos as usize > restart_array_offset {
                return Err(corruption!("block restart offset out of range"));
            }
            restart_positions.push(pos);
        }

        Ok(Self {
            data: data[..restart_array_offset].to_vec(),
            restart_positions,
        })
    }

    pub fn iter(self: Arc<Self>) -> BlockIterator {
        BlockIterator::new(self)
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }
}

/// Forward iterator over one block with restart-anchored seeking.
pub struct BlockIterator {
    block: Arc<Block>,
    offset: usize,
    last_key: Vec<u8>,
}

impl BlockIterator {
    pub fn new(block: Arc<Block>) -> Self {
        Self {
            block,
            offset: 0,
            last_key: Vec::new(),
        }
    }

    /// Positions the iterator at the first entry with key >= target.
    pub fn seek(&mut self, target: &[u8]) -> Result<()> {
        // Binary-search restarts for the last restart whose key < target.
        let restarts = &self.block.restart_positions;
        let mut left = 0usize;
        let mut right = restarts.len().saturating_sub(1);
        while left < right {
            let mid = (left + right + 1) / 2;
            let key = self.restart_key(restarts[mid] as usize)?;
            if ikey::compare(&key, target) == Ordering::Less {
                left = mid;
            } else {
                right = mid - 1;
            }
        }

        self.offset = restarts.get(left).copied().unwrap_or(0) as usize;
        self.last_key.clear();

        // Linear scan forward to the first entry >= target.
        loop {
            let before = self.offset;
            let saved_key = self.last_key.clone();
            match self.parse_next()? {
                Some((key, _)) => {
                    if ikey::compare(&key, target) != Ordering::Less {
                        // Rewind so next() yields this entry.
                        self.offset = before;
                        self.last_key = saved_key;
                        return Ok(());
                    }
                }
                None => return Ok(()),
            }
        }
    }

    /// Decodes the key at a restart point, which never shares a prefix.
    fn restart_key(&self, offset: usize) -> Result<Vec<u8>> {
        let data = &self.block.data;
        if offset + 8 > data.len() {
            return Err(corruption!("block restart entry truncated"));
        }
        let shared = BigEndian::read_u16(&data[offset..]) as usize;
        let unshared = BigEndian::read_u16(&data[offset + 2..]) as usize;
        if shared != 0 {
            return Err(corruption!("restart entry shares a prefix"));
        }
        let start = offset + 8;
        if start + unshared > data.len() {
            return Err(corruption!("block restart key truncated"));
        }
        Ok(data[start..start + unshared].to_vec())
    }

    fn parse_next(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let data = &self.block.data;
        if self.offset >= data.len() {
            return Ok(None);
        }
        if self.offset + 8 > data.len() {
            return Err(corruption!("block entry header truncated"));
        }

        let shared = BigEndian::read_u16(&data[self.offset..]) as usize;
        let unshared = BigEndian::read_u16(&data[self.offset + 2..]) as usize;
        let value_len = BigEndian::read_u32(&data[self.offset + 4..]) as usize;
        let mut pos = self.offset + 8;

        if shared > self.last_key.len() {
            return Err(corruption!("block entry shares more than previous key"));
        }
        if pos + unshared + value_len > data.len() {
            return Err(corruption!("block entry body truncated"));
        }

        let mut key = Vec::with_capacity(shared + unshared);
        key.extend_from_slice(&self.last_key[..shared]);
        key.extend_from_slice(&data[pos..pos + unshared]);
        pos += unshared;

        let value = data[pos..pos + value_len].to_vec();
        pos += value_len;

        self.last_key = key.clone();
        self.offset = pos;
        Ok(Some((key, value)))
    }
}

impl Iterator for BlockIterator {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        self.parse_next().transpose()
    }
}
