//! Immutable sorted table files.
//!
//! ## File layout
//!
//! ```text
//! +-------------------+
//! | Data Block 1      |
//! +-------------------+
//! | ...               |
//! +-------------------+
//! | Data Block N      |
//! +-------------------+
//! | Filter Block      |  (optional)
//! +-------------------+
//! | Metaindex Block   |  filter.<policy> -> filter handle
//! +-------------------+
//! | Index Block       |  first key of block -> block handle
//! +-------------------+
//! | Footer (40 bytes) |  metaindex handle, index handle, magic
//! +-------------------+
//! ```
//!
//! Every block is followed by a five-byte trailer: a compression tag and a
//! crc32 over the stored payload plus the tag. Entries are encoded internal
//! keys; a table is immutable once built, so concurrent readers share it
//! freely.

use std::fs::File;
use std::io::{BufWriter, Cursor, Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI};

use super::block::{Block, BlockBuilder, BlockIterator};
use super::index::{BlockHandle, Index};
use crate::cache::BlockCache;
use crate::config::{Compression, Options, ReadOptions};
use crate::corruption;
use crate::error::Result;
use crate::filter::FilterPolicy;
use crate::ikey;

const MAGIC: u64 = 0xc1d3_4d8a_905f_71ed;
const FOOTER_SIZE: usize = 2 * BlockHandle::ENCODED_SIZE + 8;
const BLOCK_TRAILER_SIZE: usize = 5;

const COMPRESSION_NONE: u8 = 0;
const COMPRESSION_SNAPPY: u8 = 1;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Builds a table file from entries added in ascending internal-key order.
pub struct TableBuilder {
    file: File,
    writer: BufWriter<File>,
    offset: u64,

    block_size: usize,
    restart_interval: usize,
    compression: Compression,
    filter_policy: Option<Arc<dyn FilterPolicy>>,

    data_block: BlockBuilder,
    pending_first_key: Option<Vec<u8>>,
    index: Index,
    filter_keys: Vec<Vec<u8>>,
    num_entries: u64,
}

impl TableBuilder {
    pub fn new(options: &Options, file: File) -> Result<Self> {
        let writer = BufWriter::new(file.try_clone()?);
        Ok(Self {
            file,
            writer,
            offset: 0,
            block_size: options.block_size,
            restart_interval: options.block_restart_interval,
            compression: options.compression,
            filter_policy: options.filter_policy.clone(),
            data_block: BlockBuilder::new(options.block_restart_interval),
            pending_first_key: None,
            index: Index::new(),
            filter_keys: Vec::new(),
            num_entries: 0,
        })
    }

    /// Adds an entry; keys must arrive in ascending internal-key order.
    pub fn add(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        if self.pending_first_key.is_none() {
            self.pending_first_key = Some(key.to_vec());
        }
        if self.filter_policy.is_some() {
            self.filter_keys.push(ikey::user_key(key).to_vec());
        }

        self.data_block.add(key, value);
        self.num_entries += 1;

        if self.data_block.current_size_estimate() >= self.block_size {
            self.flush_data_block()?;
        }
        Ok(())
    }

    fn flush_data_block(&mut self) -> Result<()> {
        if self.data_block.is_empty() {
            return Ok(());
        }
        let block = std::mem::replace(
            &mut self.data_block,
            BlockBuilder::new(self.restart_interval),
        );
        let image = block.finish();
        let handle = self.write_block(&image, self.compression)?;
        let first_key = self
            .pending_first_key
            .take()
            .expect("flushed block without a first key");
        self.index.push(first_key, handle);
        Ok(())
    }

    fn write_block(&mut self, image: &[u8], compression: Compression) -> Result<BlockHandle> {
        let (payload, compression_tag): (Vec<u8>, u8) = match compression {
            Compression::Snappy => {
                let compressed = snap::raw::Encoder::new().compress_vec(image)?;
                // Incompressible blocks are stored raw.
                if compressed.len() < image.len() {
                    (compressed, COMPRESSION_SNAPPY)
                } else {
                    (image.to_vec(), COMPRESSION_NONE)
                }
            }
            Compression::None => (image.to_vec(), COMPRESSION_NONE),
        };

        let mut digest = CRC32.digest();
        digest.update(&payload);
        digest.update(&[compression_tag]);
        let checksum = digest.finalize();

        self.writer.write_all(&payload)?;
        self.writer.write_u8(compression_tag)?;
        self.writer.write_u32::<BigEndian>(checksum)?;

        let handle = BlockHandle {
            offset: self.offset,
            size: payload.len() as u64,
        };
        self.offset += (payload.len() + BLOCK_TRAILER_SIZE) as u64;
        Ok(handle)
    }

    /// Writes the trailing sections, syncs, and returns the final file
    /// size. The builder is consumed whether or not it succeeds; on failure
    /// the caller deletes the output file.
    pub fn finish(mut self) -> Result<u64> {
        self.flush_data_block()?;

        // Filter block plus its metaindex pointer.
        let mut metaindex = Index::new();
        if let Some(policy) = self.filter_policy.clone() {
            let filter = policy.create_filter(&self.filter_keys);
            let handle = self.write_block(&filter, Compression::None)?;
            let mut name = b"filter.".to_vec();
            name.extend_from_slice(policy.name().as_bytes());
            metaindex.push(name, handle);
        }
        let metaindex_handle = self.write_block(&metaindex.encode(), Compression::None)?;

        let index_image = self.index.encode();
        let index_handle = self.write_block(&index_image, Compression::None)?;

        let mut footer = Vec::with_capacity(FOOTER_SIZE);
        metaindex_handle.encode_into(&mut footer);
        index_handle.encode_into(&mut footer);
        footer.write_u64::<BigEndian>(MAGIC).unwrap();
        self.writer.write_all(&footer)?;
        self.offset += FOOTER_SIZE as u64;

        self.writer.flush()?;
        self.file.sync_all()?;
        Ok(self.offset)
    }

    pub fn num_entries(&self) -> u64 {
        self.num_entries
    }

    /// Bytes written so far, not counting the buffered open block.
    pub fn file_size(&self) -> u64 {
        self.offset
    }
}

/// An open, immutable table file.
pub struct Table {
    file: File,
    index: Index,
    filter: Option<(Arc<dyn FilterPolicy>, Vec<u8>)>,
    block_cache: Option<Arc<BlockCache>>,
    /// Distinguishes this file's blocks in the shared block cache.
    cache_id: u64,
}

impl Table {
    pub fn open(
        options: &Options,
        file: File,
        file_size: u64,
        cache_id: u64,
        block_cache: Option<Arc<BlockCache>>,
    ) -> Result<Arc<Self>> {
        if (file_size as usize) < FOOTER_SIZE {
            return Err(corruption!("table file shorter than footer"));
        }

        let mut footer = vec![0u8; FOOTER_SIZE];
        read_exact_at(&file, file_size - FOOTER_SIZE as u64, &mut footer)?;

        let mut cursor = Cursor::new(footer.as_slice());
        let metaindex_handle = BlockHandle::decode_from(&mut cursor)?;
        let index_handle = BlockHandle::decode_from(&mut cursor)?;
        let magic = BigEndian::read_u64(&footer[FOOTER_SIZE - 8..]);
        if magic != MAGIC {
            return Err(corruption!("bad table magic number"));
        }

        let index_image = read_raw_block(&file, index_handle, true)?;
        let index = Index::decode(&index_image)?;

        let filter = match &options.filter_policy {
            Some(policy) => {
                let metaindex_image = read_raw_block(&file, metaindex_handle, true)?;
                let metaindex = Index::decode(&metaindex_image)?;
                let mut name = b"filter.".to_vec();
                name.extend_from_slice(policy.name().as_bytes());
                match metaindex.find_raw(&name) {
                    Some(handle) => {
                        let filter_data = read_raw_block(&file, handle, true)?;
                        Some((Arc::clone(policy), filter_data))
                    }
                    None => None,
                }
            }
            None => None,
        };

        Ok(Arc::new(Self {
            file,
            index,
            filter,
            block_cache,
            cache_id,
        }))
    }

    /// Finds the first entry with key >= target, or None when the table
    /// holds nothing at or after it. The filter is consulted first, so most
    /// absent keys cost no block read.
    pub fn internal_get(
        &self,
        options: &ReadOptions,
        target: &[u8],
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        if let Some((policy, filter)) = &self.filter {
            if !policy.key_may_match(ikey::user_key(target), filter) {
                return Ok(None);
            }
        }

        let start = self.index.find_block(target).unwrap_or(0);
        for block_idx in start..self.index.len() {
            let block = self.read_block_cached(block_idx, options)?;
            let mut iter = block.iter();
            iter.seek(target)?;
            if let Some(entry) = iter.next() {
                return Ok(Some(entry?));
            }
            // Seek exhausted the candidate block; the target falls between
            // it and the next block's first key.
        }
        Ok(None)
    }

    /// Byte offset where data for the key would live; used by approximate
    /// size accounting.
    pub fn approximate_offset_of(&self, target: &[u8]) -> u64 {
        match self.index.find_block(target) {
            Some(idx) => self.index.handle(idx).map(|h| h.offset).unwrap_or(0),
            None => 0,
        }
    }

    fn read_block_cached(&self, block_idx: usize, options: &ReadOptions) -> Result<Arc<Block>> {
        let handle = self
            .index
            .handle(block_idx)
            .ok_or_else(|| corruption!("table block index out of range"))?;

        if let Some(cache) = &self.block_cache {
            if let Some(block) = cache.get(self.cache_id, handle.offset) {
                return Ok(block);
            }
            let image = read_raw_block(&self.file, handle, options.verify_checksums)?;
            let block = Arc::new(Block::new(image)?);
            if options.fill_cache {
                cache.insert(self.cache_id, handle.offset, Arc::clone(&block));
            }
            return Ok(block);
        }

        let image = read_raw_block(&self.file, handle, options.verify_checksums)?;
        Ok(Arc::new(Block::new(image)?))
    }

    pub fn iter(self: Arc<Self>, options: ReadOptions, start: Option<&[u8]>) -> TableIterator {
        TableIterator::new(self, options, start)
    }
}

/// Forward iterator over every entry of a table, optionally starting at the
/// first entry >= a seek key.
pub struct TableIterator {
    table: Arc<Table>,
    options: ReadOptions,
    next_block: usize,
    current: Option<BlockIterator>,
    /// Set when the first block must be seeked before yielding.
    pending_seek: Option<Vec<u8>>,
    errored: bool,
}

impl TableIterator {
    fn new(table: Arc<Table>, options: ReadOptions, start: Option<&[u8]>) -> Self {
        let (next_block, pending_seek) = match start {
            Some(target) => (
                table.index.find_block(target).unwrap_or(0),
                Some(target.to_vec()),
            ),
            None => (0, None),
        };
        Self {
            table,
            options,
            next_block,
            current: None,
            pending_seek,
            errored: false,
        }
    }

    fn advance_block(&mut self) -> Result<bool> {
        if self.next_block >= self.table.index.len() {
            return Ok(false);
        }
        let block = self
            .table
            .read_block_cached(self.next_block, &self.options)?;
        let mut iter = block.iter();
        if let Some(target) = self.pending_seek.take() {
            iter.seek(&target)?;
        }
        self.current = Some(iter);
        self.next_block += 1;
        Ok(true)
    }
}

impl Iterator for TableIterator {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.errored {
            return None;
        }
        loop {
            if let Some(iter) = &mut self.current {
                match iter.next() {
                    Some(Ok(entry)) => return Some(Ok(entry)),
                    Some(Err(e)) => {
                        self.errored = true;
                        return Some(Err(e));
                    }
                    None => self.current = None,
                }
            }
            match self.advance_block() {
                Ok(true) => continue,
                Ok(false) => return None,
                Err(e) => {
                    self.errored = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

/// Reads a block payload at `handle` and validates its trailer.
fn read_raw_block(file: &File, handle: BlockHandle, verify_checksum: bool) -> Result<Vec<u8>> {
    let mut raw = vec![0u8; handle.size as usize + BLOCK_TRAILER_SIZE];
    read_exact_at(file, handle.offset, &mut raw)?;

    let payload_len = handle.size as usize;
    let compression_tag = raw[payload_len];

    if verify_checksum {
        let expected = BigEndian::read_u32(&raw[payload_len + 1..]);
        let mut digest = CRC32.digest();
        digest.update(&raw[..payload_len + 1]);
        if digest.finalize() != expected {
            return Err(corruption!("table block checksum mismatch"));
        }
    }

    raw.truncate(payload_len);
    match compression_tag {
        COMPRESSION_NONE => Ok(raw),
        COMPRESSION_SNAPPY => {
            let decompressed = snap::raw::Decoder::new().decompress_vec(&raw)?;
            Ok(decompressed)
        }
        tag => Err(corruption!("unknown block compression tag {tag}")),
    }
}

fn read_exact_at(file: &File, offset: u64, buf: &mut [u8]) -> Result<()> {
    let mut reader = file.try_clone()?;
    reader.seek(SeekFrom::Start(offset))?;
    reader.read_exact(buf)?;
    Ok(())
}
