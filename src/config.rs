use std::sync::Arc;

use crate::filter::FilterPolicy;

/// Number of levels in the tree.
pub const NUM_LEVELS: usize = 7;

/// Level-0 file count that triggers a compaction.
pub const L0_COMPACTION_TRIGGER: usize = 4;

/// Level-0 file count at which incoming writes are slowed by one millisecond.
pub const L0_SLOWDOWN_WRITES_TRIGGER: usize = 8;

/// Level-0 file count at which incoming writes stall until compaction catches up.
pub const L0_STOP_WRITES_TRIGGER: usize = 12;

/// Highest level a fresh memtable flush may be pushed to when it overlaps
/// nothing below.
pub const MAX_MEM_COMPACT_LEVEL: usize = 2;

/// Sequence numbers are packed into 56 bits alongside the value tag.
pub const MAX_SEQUENCE: u64 = (1 << 56) - 1;

/// Manifest size beyond which recovery writes a fresh snapshot manifest.
pub const MANIFEST_ROLL_BYTES: u64 = 4 * 1024 * 1024;

/// Block compression applied to table file blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Snappy,
}

/// Configuration for opening a database.
#[derive(Clone)]
pub struct Options {
    /// Create the database directory and initial manifest if missing.
    pub create_if_missing: bool,

    /// Fail open when the database already exists.
    pub error_if_exists: bool,

    /// Escalate recoverable corruption (torn WAL tails, bad table blocks)
    /// into hard errors.
    pub paranoid_checks: bool,

    /// Bytes the memtable may hold before it is sealed (default: 4MB).
    pub write_buffer_size: usize,

    /// Table cache capacity in open files (default: 1000).
    pub max_open_files: usize,

    /// Shared block cache capacity in entries. None disables block caching.
    pub block_cache_entries: Option<usize>,

    /// Target uncompressed size of a table data block (default: 4KB).
    pub block_size: usize,

    /// Keys between restart points inside a block (default: 16).
    pub block_restart_interval: usize,

    /// Bytes a compaction output file may reach before rotation (default: 2MB).
    pub max_file_size: u64,

    /// Block compression (default: Snappy).
    pub compression: Compression,

    /// Append to the tail of the last WAL after a clean recovery instead of
    /// rolling a fresh one.
    pub reuse_logs: bool,

    /// Per-table filter consulted before block reads. None disables filters.
    pub filter_policy: Option<Arc<dyn FilterPolicy>>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            create_if_missing: false,
            error_if_exists: false,
            paranoid_checks: false,
            write_buffer_size: 4 * 1024 * 1024,
            max_open_files: 1000,
            block_cache_entries: Some(8 * 1024),
            block_size: 4 * 1024,
            block_restart_interval: 16,
            max_file_size: 2 * 1024 * 1024,
            compression: Compression::Snappy,
            reuse_logs: false,
            filter_policy: None,
        }
    }
}

impl Options {
    pub fn create_if_missing(mut self, create: bool) -> Self {
        self.create_if_missing = create;
        self
    }

    pub fn error_if_exists(mut self, error: bool) -> Self {
        self.error_if_exists = error;
        self
    }

    pub fn paranoid_checks(mut self, paranoid: bool) -> Self {
        self.paranoid_checks = paranoid;
        self
    }

    pub fn write_buffer_size(mut self, size: usize) -> Self {
        self.write_buffer_size = size;
        self
    }

    pub fn max_open_files(mut self, count: usize) -> Self {
        self.max_open_files = count;
        self
    }

    pub fn block_cache_entries(mut self, entries: Option<usize>) -> Self {
        self.block_cache_entries = entries;
        self
    }

    pub fn block_size(mut self, size: usize) -> Self {
        self.block_size = size;
        self
    }

    pub fn block_restart_interval(mut self, interval: usize) -> Self {
        self.block_restart_interval = interval;
        self
    }

    pub fn max_file_size(mut self, size: u64) -> Self {
        self.max_file_size = size;
        self
    }

    pub fn compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    pub fn reuse_logs(mut self, reuse: bool) -> Self {
        self.reuse_logs = reuse;
        self
    }

    pub fn filter_policy(mut self, policy: Option<Arc<dyn FilterPolicy>>) -> Self {
        self.filter_policy = policy;
        self
    }

    /// Maximum total bytes for a level before it becomes a compaction
    /// candidate. Level 1 holds 10MB, each level after that ten times more.
    /// Level 0 is scored by file count instead.
    pub fn max_bytes_for_level(&self, level: usize) -> f64 {
        let mut result = 10.0 * 1024.0 * 1024.0;
        let mut level = level;
        while level > 1 {
            result *= 10.0;
            level -= 1;
        }
        result
    }

    /// Maximum bytes of grandparent overlap before a compaction output is
    /// rotated.
    pub fn max_grandparent_overlap_bytes(&self) -> u64 {
        10 * self.max_file_size
    }

    /// Upper bound on the byte size of an expanded compaction input set.
    pub fn expanded_compaction_byte_size_limit(&self) -> u64 {
        25 * self.max_file_size
    }
}

/// Per-write durability options.
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteOptions {
    /// Fsync the WAL before the write returns.
    pub sync: bool,
}

impl WriteOptions {
    pub fn sync(mut self, sync: bool) -> Self {
        self.sync = sync;
        self
    }
}

/// Per-read options.
#[derive(Debug, Clone, Copy)]
pub struct ReadOptions {
    /// Verify block checksums on every read, not only on open.
    pub verify_checksums: bool,

    /// Populate the block cache with blocks read on behalf of this call.
    pub fill_cache: bool,

    /// Read as of this snapshot sequence instead of the latest state.
    pub snapshot: Option<u64>,
}

impl ReadOptions {
    pub fn verify_checksums(mut self, verify: bool) -> Self {
        self.verify_checksums = verify;
        self
    }

    pub fn fill_cache(mut self, fill: bool) -> Self {
        self.fill_cache = fill;
        self
    }

    pub fn snapshot(mut self, snapshot: Option<u64>) -> Self {
        self.snapshot = snapshot;
        self
    }
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            verify_checksums: false,
            fill_cache: true,
            snapshot: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options() {
        let options = Options::default();
        assert_eq!(options.write_buffer_size, 4 * 1024 * 1024);
        assert_eq!(options.max_open_files, 1000);
        assert_eq!(options.block_size, 4 * 1024);
        assert_eq!(options.block_restart_interval, 16);
        assert_eq!(options.max_file_size, 2 * 1024 * 1024);
        assert_eq!(options.compression, Compression::Snappy);
        assert!(!options.create_if_missing);
    }

    #[test]
    fn options_builder() {
        let options = Options::default()
            .create_if_missing(true)
            .write_buffer_size(64 * 1024)
            .compression(Compression::None)
            .reuse_logs(true);

        assert!(options.create_if_missing);
        assert_eq!(options.write_buffer_size, 64 * 1024);
        assert_eq!(options.compression, Compression::None);
        assert!(options.reuse_logs);
    }

    #[test]
    fn level_capacities_grow_geometrically() {
        let options = Options::default();
        assert_eq!(options.max_bytes_for_level(1) as u64, 10 * 1024 * 1024);
        assert_eq!(options.max_bytes_for_level(2) as u64, 100 * 1024 * 1024);
        assert_eq!(options.max_bytes_for_level(3) as u64, 1000 * 1024 * 1024);
    }

    #[test]
    fn compaction_limits_follow_file_size() {
        let options = Options::default().max_file_size(1024);
        assert_eq!(options.max_grandparent_overlap_bytes(), 10 * 1024);
        assert_eq!(options.expanded_compaction_byte_size_limit(), 25 * 1024);
    }
}
