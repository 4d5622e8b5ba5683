//! Sparse index over a table file's data blocks.
//!
//! One entry per block, carrying the first internal key of the block and
//! the block's handle. The index is decoded whole when a table is opened;
//! lookups binary-search for the block whose key range may contain the
//! target.

use std::cmp::Ordering;
use std::io::Cursor;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::corruption;
use crate::error::Result;
use crate::ikey;

/// Location of a block within a table file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHandle {
    pub offset: u64,
    pub size: u64,
}

impl BlockHandle {
    pub const ENCODED_SIZE: usize = 16;

    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.write_u64::<BigEndian>(self.offset).unwrap();
        buf.write_u64::<BigEndian>(self.size).unwrap();
    }

    pub fn decode_from(cursor: &mut Cursor<&[u8]>) -> Result<Self> {
        let offset = cursor.read_u64::<BigEndian>()?;
        let size = cursor.read_u64::<BigEndian>()?;
        Ok(BlockHandle { offset, size })
    }
}

/// The decoded index: `(first internal key, handle)` per data block, in
/// file order.
#[derive(Debug, Clone, Default)]
pub struct Index {
    entries: Vec<(Vec<u8>, BlockHandle)>,
}

impl Index {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn push(&mut self, first_key: Vec<u8>, handle: BlockHandle) {
        self.entries.push((first_key, handle));
    }

    /// Index of the block that may contain `target`: the last block whose
    /// first key is <= target. Returns None when the target sorts before
    /// every block.
    pub fn find_block(&self, target: &[u8]) -> Option<usize> {
        let mut low = 0;
        let mut high = self.entries.len();
        while low < high {
            let mid = (low + high) / 2;
            match ikey::compare(&self.entries[mid].0, target) {
                Ordering::Greater => high = mid,
                Ordering::Less => low = mid + 1,
                Ordering::Equal => return Some(mid),
            }
        }
        low.checked_sub(1)
    }

    pub fn handle(&self, block: usize) -> Option<BlockHandle> {
        self.entries.get(block).map(|(_, handle)| *handle)
    }

    /// Finds a handle by exact raw key match. Used for the metaindex,
    /// whose keys are plain names rather than internal keys.
    pub fn find_raw(&self, key: &[u8]) -> Option<BlockHandle> {
        self.entries
            .iter()
            .find(|(entry_key, _)| entry_key.as_slice() == key)
            .map(|(_, handle)| *handle)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.write_u32::<BigEndian>(self.entries.len() as u32).unwrap();
        for (key, handle) in &self.entries {
            buf.write_u32::<BigEndian>(key.len() as u32).unwrap();
            buf.extend_from_slice(key);
            handle.encode_into(&mut buf);
        }
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(data);
        let count = cursor.read_u32::<BigEndian>()? as usize;
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            let key_len = cursor.read_u32::<BigEndian>()? as usize;
            let pos = cursor.position() as usize;
            if pos + key_len > data.len() {
                return Err(corruption!("index entry key truncated"));
            }
            let key = data[pos..pos + key_len].to_vec();
            cursor.set_position((pos + key_len) as u64);
            let handle = BlockHandle::decode_from(&mut cursor)?;
            entries.push((key, handle));
        }
        Ok(Self { entries })
    }
}
