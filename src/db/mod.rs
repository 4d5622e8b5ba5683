//! The database coordinator.
//!
//! One exclusive mutex guards all mutable state: the memtable pointers, the
//! version set, the writer queue, pending outputs, stats, and the
//! background error. One background worker thread flushes sealed memtables
//! and runs compactions. Writers commit through a queued group: the queue
//! head becomes the leader, merges the batches queued behind it, writes the
//! merged batch to the WAL and memtable with the mutex released, and then
//! signals everyone it carried.
//!
//! The mutex is released at every IO suspension point: WAL append and
//! memtable apply (leader only), table builds, file syncs, and the
//! compaction merge loop. Readers pin state by cloning Arcs under the
//! mutex and never block writers.

pub mod filename;
pub mod iterator;
mod repair;

pub use repair::{destroy_db, repair_db};

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::fs::{File, OpenOptions};
use std::ops::{Bound, RangeBounds};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use crate::batch::{WriteBatch, BATCH_HEADER_SIZE};
use crate::cache::TableCache;
use crate::config::{
    Options, ReadOptions, WriteOptions, L0_SLOWDOWN_WRITES_TRIGGER, L0_STOP_WRITES_TRIGGER,
    NUM_LEVELS,
};
use crate::error::{Error, Result};
use crate::flock::FileLock;
use crate::ikey::{self, InternalKey, LookupKey, ValueType};
use crate::memtable::{LookupResult, MemTable, MemTableIterator};
use crate::sstable::table::TableBuilder;
use crate::version::compaction::Compaction;
use crate::version::edit::VersionEdit;
use crate::version::VersionSet;
use crate::wal::{LogReader, LogWriter};
use crate::{corruption, invalid_argument};

use iterator::{InternalIterator, LevelFileIterator, MergeIterator, ScanIterator};

/// Property name prefix accepted by [`Database::property`].
const PROPERTY_PREFIX: &str = "cinderdb.";

/// A consistent read view: reads tagged with a snapshot see only mutations
/// with sequence numbers at or below it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    seq: u64,
}

impl Snapshot {
    pub fn sequence(&self) -> u64 {
        self.seq
    }
}

/// One queued write. The queue head is the group leader; everyone else
/// waits on their own condvar until the leader carries their batch.
struct Writer {
    batch: Mutex<Option<WriteBatch>>,
    sync: bool,
    done: AtomicBool,
    result: Mutex<Option<Result<()>>>,
    cv: Condvar,
}

impl Writer {
    fn new(batch: Option<WriteBatch>, sync: bool) -> Self {
        Self {
            batch: Mutex::new(batch),
            sync,
            done: AtomicBool::new(false),
            result: Mutex::new(None),
            cv: Condvar::new(),
        }
    }

    fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    fn complete(&self, result: Result<()>) {
        *self.result.lock().unwrap() = Some(result);
        self.done.store(true, Ordering::Release);
    }

    fn take_result(&self) -> Result<()> {
        self.result
            .lock()
            .unwrap()
            .take()
            .expect("completed writer carries a result")
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct CompactionStats {
    micros: u64,
    bytes_read: u64,
    bytes_written: u64,
}

impl CompactionStats {
    fn add(&mut self, micros: u64, bytes_read: u64, bytes_written: u64) {
        self.micros += micros;
        self.bytes_read += bytes_read;
        self.bytes_written += bytes_written;
    }
}

struct ManualCompaction {
    level: usize,
    done: bool,
    begin: Option<Vec<u8>>,
    end: Option<Vec<u8>>,
    /// Largest input key of the previous step; the next step resumes past
    /// it until the range is covered.
    resume_after: Option<InternalKey>,
}

impl ManualCompaction {
    fn next_begin(&self) -> Option<Vec<u8>> {
        match &self.resume_after {
            Some(key) => Some(key.user_key().to_vec()),
            None => self.begin.clone(),
        }
    }
}

/// An output file being produced by a compaction.
struct PendingOutput {
    number: u64,
    builder: TableBuilder,
    smallest: InternalKey,
    largest: InternalKey,
}

/// Book-keeping for one running compaction.
struct CompactionState {
    /// Oldest live snapshot at compaction start; entries shadowed for
    /// every sequence at or below it may be dropped.
    smallest_snapshot: u64,
    outputs: Vec<FinishedOutput>,
    builder: Option<PendingOutput>,
    total_bytes: u64,
}

struct FinishedOutput {
    number: u64,
    size: u64,
    smallest: InternalKey,
    largest: InternalKey,
}

impl CompactionState {
    fn new(smallest_snapshot: u64) -> Self {
        Self {
            smallest_snapshot,
            outputs: Vec::new(),
            builder: None,
            total_bytes: 0,
        }
    }

    /// Whether the open output's last key shares `key`'s user key. Closing
    /// between them would split one user key across two files and break
    /// the level invariant.
    fn would_split_user_key(&self, key: &[u8]) -> bool {
        self.builder.as_ref().map_or(false, |out| {
            out.builder.num_entries() > 0 && out.largest.user_key() == ikey::user_key(key)
        })
    }
}

/// All coordinator state guarded by the single mutex.
struct DbState {
    mem: Arc<MemTable>,
    /// Sealed memtable being flushed by the background worker.
    imm: Option<Arc<MemTable>>,
    log: Option<Arc<Mutex<LogWriter>>>,
    log_file_number: u64,

    versions: VersionSet,
    writers: VecDeque<Arc<Writer>>,
    /// Live snapshots: sequence -> handle count. The smallest key bounds
    /// what compaction may drop.
    snapshots: BTreeMap<u64, usize>,
    /// File numbers reserved by in-flight builds; protected from deletion
    /// until their version edit lands or the build is abandoned.
    pending_outputs: HashSet<u64>,

    bg_compaction_scheduled: bool,
    /// Latched background failure; all subsequent writes fail with it.
    bg_error: Option<Error>,
    manual_compaction: Option<ManualCompaction>,
    stats: Vec<CompactionStats>,
}

struct DbInner {
    dir: PathBuf,
    options: Options,
    table_cache: Arc<TableCache>,
    _lock: FileLock,

    state: Mutex<DbState>,
    /// Wakes the background worker.
    bg_work_signal: Condvar,
    /// Broadcast when background work finishes or the sealed memtable
    /// clears; write throttling and manual compaction wait on it.
    bg_finished: Condvar,
    shutting_down: AtomicBool,
    /// Mirror of `state.imm.is_some()` readable without the mutex, so the
    /// compaction merge loop can poll it cheaply.
    has_imm: AtomicBool,
}

/// An embedded, ordered, persistent key-value store.
pub struct Database {
    inner: Arc<DbInner>,
    bg_thread: Option<thread::JoinHandle<()>>,
}

impl Database {
    /// Opens (and if configured, creates) the database at `path`, holding
    /// an exclusive lock on it, recovering the manifest and outstanding
    /// WALs, and starting the background worker.
    pub fn open(options: Options, path: impl AsRef<Path>) -> Result<Database> {
        let dir = path.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        let lock = FileLock::acquire(&filename::lock_file(&dir))?;

        if !filename::current_file(&dir).exists() {
            if !options.create_if_missing {
                return Err(invalid_argument!(
                    "{}: does not exist (create_if_missing is false)",
                    dir.display()
                ));
            }
            initialize_db(&dir)?;
            tracing::info!(dir = %dir.display(), "created new database");
        } else if options.error_if_exists {
            return Err(invalid_argument!(
                "{}: exists (error_if_exists is true)",
                dir.display()
            ));
        }

        let cache_capacity = options.max_open_files.saturating_sub(10).max(16);
        let table_cache = Arc::new(TableCache::new(dir.clone(), options.clone(), cache_capacity));

        let mut versions = VersionSet::new(dir.clone(), options.clone());
        let mut save_manifest = versions.recover()?;

        let mut state = DbState {
            mem: Arc::new(MemTable::new()),
            imm: None,
            log: None,
            log_file_number: 0,
            versions,
            writers: VecDeque::new(),
            snapshots: BTreeMap::new(),
            pending_outputs: HashSet::new(),
            bg_compaction_scheduled: false,
            bg_error: None,
            manual_compaction: None,
            stats: vec![CompactionStats::default(); NUM_LEVELS],
        };

        let reused_log =
            recover_wals(&mut state, &dir, &options, &table_cache, &mut save_manifest)?;

        if !reused_log {
            let number = state.versions.new_file_number();
            let file = File::create(filename::log_file(&dir, number))?;
            state.log = Some(Arc::new(Mutex::new(LogWriter::new(file)?)));
            state.log_file_number = number;
            save_manifest = true;
        }

        if save_manifest {
            let mut edit = VersionEdit::new();
            edit.set_log_number(state.log_file_number);
            state.versions.log_and_apply(&mut edit)?;
        }

        let inner = Arc::new(DbInner {
            dir,
            options,
            table_cache,
            _lock: lock,
            state: Mutex::new(state),
            bg_work_signal: Condvar::new(),
            bg_finished: Condvar::new(),
            shutting_down: AtomicBool::new(false),
            has_imm: AtomicBool::new(false),
        });

        {
            let mut state = inner.state.lock()?;
            inner.delete_obsolete_files(&mut state);
            inner.maybe_schedule_compaction(&mut state);
        }

        let worker = Arc::clone(&inner);
        let bg_thread = thread::Builder::new()
            .name("cinderdb-bg".to_string())
            .spawn(move || background_main(worker))
            .map_err(|e| Error::Io(e.to_string()))?;

        Ok(Database {
            inner,
            bg_thread: Some(bg_thread),
        })
    }

    pub fn put(&self, options: &WriteOptions, key: &[u8], value: &[u8]) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.put(key, value);
        self.write(options, batch)
    }

    pub fn delete(&self, options: &WriteOptions, key: &[u8]) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.delete(key);
        self.write(options, batch)
    }

    pub fn write(&self, options: &WriteOptions, batch: WriteBatch) -> Result<()> {
        self.inner.write(options, Some(batch))
    }

    pub fn get(&self, options: &ReadOptions, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.inner.get(options, key)
    }

    /// Forward range scan over user keys, pinned to the read options'
    /// snapshot (or the latest state).
    pub fn scan<R>(&self, options: &ReadOptions, range: R) -> Result<ScanIterator>
    where
        R: RangeBounds<Vec<u8>>,
    {
        self.inner.scan(options, range)
    }

    pub fn snapshot(&self) -> Snapshot {
        self.inner.snapshot()
    }

    pub fn release_snapshot(&self, snapshot: Snapshot) {
        self.inner.release_snapshot(snapshot)
    }

    /// Database introspection: `cinderdb.num-files-at-level<N>`,
    /// `cinderdb.stats`, `cinderdb.sstables`,
    /// `cinderdb.approximate-memory-usage`.
    pub fn property(&self, name: &str) -> Option<String> {
        self.inner.property(name)
    }

    /// Approximate on-disk bytes each `[begin, end)` range occupies.
    pub fn approximate_sizes(&self, ranges: &[(Vec<u8>, Vec<u8>)]) -> Result<Vec<u64>> {
        self.inner.approximate_sizes(ranges)
    }

    /// Compacts everything overlapping `[begin, end]` down the tree,
    /// flushing the memtable first. None bounds are open.
    pub fn compact_range(&self, begin: Option<&[u8]>, end: Option<&[u8]>) -> Result<()> {
        self.inner.compact_range(begin, end)
    }

    /// Validates the structural invariants of the current version: unique
    /// file numbers, and sorted, non-overlapping files above level 0.
    pub fn check_invariants(&self) -> Result<()> {
        let state = self.inner.state.lock()?;
        state.versions.current().check_invariants()
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        self.inner.shutting_down.store(true, Ordering::Release);
        self.inner.bg_work_signal.notify_all();
        if let Some(handle) = self.bg_thread.take() {
            let _ = handle.join();
        }
        // Push buffered WAL records to the OS; synced writes are already
        // durable.
        if let Ok(state) = self.inner.state.lock() {
            if let Some(log) = &state.log {
                if let Ok(mut log) = log.lock() {
                    let _ = log.flush();
                }
            }
        }
    }
}

impl DbInner {
    // ---------------- write path ----------------

    fn write(&self, options: &WriteOptions, batch: Option<WriteBatch>) -> Result<()> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(Error::Io("database is shutting down".to_string()));
        }

        let writer = Arc::new(Writer::new(batch, options.sync));
        let mut state = self.state.lock()?;
        state.writers.push_back(Arc::clone(&writer));

        while !writer.is_done() && !is_front(&state.writers, &writer) {
            state = writer.cv.wait(state)?;
        }
        if writer.is_done() {
            return writer.take_result();
        }

        // This writer is the leader.
        let force = writer.batch.lock().unwrap().is_none();
        let (returned, room_status) = self.make_room_for_write(state, force);
        state = returned;

        let mut last_writer = Arc::clone(&writer);
        let mut status = room_status;

        if status.is_ok() && !force {
            let (mut group, last) = build_batch_group(&state.writers, &writer);
            last_writer = last;

            let base_seq = state.versions.last_sequence + 1;
            group.set_sequence(base_seq);
            let last_seq = base_seq + group.count() as u64 - 1;

            let log = Arc::clone(state.log.as_ref().expect("log writer present after open"));
            let mem = Arc::clone(&state.mem);

            // Only the queue head is ever past this point, so the WAL and
            // memtable may be touched without the coordinator mutex.
            drop(state);

            let mut sync_error = false;
            status = {
                let mut log = log.lock()?;
                let appended = log.add_record(group.contents());
                match appended {
                    Ok(()) if options.sync => log.sync().map_err(|e| {
                        sync_error = true;
                        e
                    }),
                    other => other,
                }
            };
            if status.is_ok() {
                status = group.insert_into(&mem);
            }

            state = self.state.lock()?;
            if sync_error {
                // The WAL tail state is unknown; fail all future writes.
                if let Err(e) = &status {
                    self.record_background_error(&mut state, e.clone());
                }
            }
            if status.is_ok() {
                state.versions.last_sequence = last_seq;
            }
        }

        loop {
            let front = state.writers.pop_front().expect("leader still queued");
            let is_self = Arc::ptr_eq(&front, &writer);
            if !is_self {
                front.complete(status.clone());
                front.cv.notify_one();
            }
            if Arc::ptr_eq(&front, &last_writer) {
                break;
            }
        }
        if let Some(new_front) = state.writers.front() {
            new_front.cv.notify_one();
        }
        drop(state);
        status
    }

    /// The write throttle: returns once the memtable can accept the
    /// batch, rolling the WAL and sealing the memtable as needed. Applies
    /// the one-millisecond slowdown at most once per write.
    fn make_room_for_write<'a>(
        &'a self,
        mut state: MutexGuard<'a, DbState>,
        force: bool,
    ) -> (MutexGuard<'a, DbState>, Result<()>) {
        let mut allow_delay = !force;
        let mut force = force;
        loop {
            if let Some(e) = state.bg_error.clone() {
                return (state, Err(e));
            }

            if allow_delay
                && state.versions.num_level_files(0) >= L0_SLOWDOWN_WRITES_TRIGGER
            {
                // Close to the hard limit: cede one millisecond to the
                // compactor rather than stalling a write for seconds
                // later. At most one delay per write.
                drop(state);
                thread::sleep(Duration::from_millis(1));
                allow_delay = false;
                state = match self.state.lock() {
                    Ok(guard) => guard,
                    Err(e) => {
                        return (e.into_inner(), Err(Error::Io("mutex poisoned".to_string())))
                    }
                };
                continue;
            }

            if !force
                && state.mem.approximate_memory_usage() <= self.options.write_buffer_size
            {
                return (state, Ok(()));
            }

            if state.imm.is_some() {
                // Previous memtable still flushing; wait for it to clear.
                tracing::debug!("write waits for memtable flush");
                state = match self.bg_finished.wait(state) {
                    Ok(guard) => guard,
                    Err(e) => {
                        return (e.into_inner(), Err(Error::Io("mutex poisoned".to_string())))
                    }
                };
                continue;
            }

            if state.versions.num_level_files(0) >= L0_STOP_WRITES_TRIGGER {
                tracing::debug!("write waits for level-0 compaction");
                state = match self.bg_finished.wait(state) {
                    Ok(guard) => guard,
                    Err(e) => {
                        return (e.into_inner(), Err(Error::Io("mutex poisoned".to_string())))
                    }
                };
                continue;
            }

            // Roll: new WAL, seal the memtable, fresh memtable.
            let number = state.versions.new_file_number();
            let file = match File::create(filename::log_file(&self.dir, number)) {
                Ok(file) => file,
                Err(e) => return (state, Err(e.into())),
            };
            let new_log = match LogWriter::new(file) {
                Ok(writer) => writer,
                Err(e) => return (state, Err(e)),
            };
            if let Some(old_log) = &state.log {
                if let Ok(mut old_log) = old_log.lock() {
                    let _ = old_log.flush();
                }
            }
            state.log = Some(Arc::new(Mutex::new(new_log)));
            state.log_file_number = number;
            state.imm = Some(Arc::clone(&state.mem));
            self.has_imm.store(true, Ordering::Release);
            state.mem = Arc::new(MemTable::new());
            force = false;
            self.maybe_schedule_compaction(&mut state);
        }
    }

    // ---------------- read path ----------------

    fn get(&self, options: &ReadOptions, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let (mem, imm, current, seq) = {
            let state = self.state.lock()?;
            (
                Arc::clone(&state.mem),
                state.imm.clone(),
                state.versions.current(),
                options.snapshot.unwrap_or(state.versions.last_sequence),
            )
        };

        let lookup = LookupKey::new(key, seq);
        let mut charge = None;

        let result = if let Some(found) = mem.get(&lookup) {
            Some(found)
        } else if let Some(found) = imm.as_ref().and_then(|imm| imm.get(&lookup)) {
            Some(found)
        } else {
            let (found, seek_charge) = current.get(options, &lookup, &self.table_cache)?;
            charge = seek_charge;
            found
        };

        if let Some((level, file)) = charge {
            // The lookup fell through this file; charge its seek budget
            // and queue it for compaction when exhausted.
            let mut state = self.state.lock()?;
            if file.charge_seek() && state.versions.file_to_compact.is_none() {
                state.versions.file_to_compact = Some((level, file));
                self.maybe_schedule_compaction(&mut state);
            }
        }

        match result {
            Some(LookupResult::Value(value)) => Ok(Some(value)),
            Some(LookupResult::Deleted) | None => Ok(None),
        }
    }

    fn scan<R>(&self, options: &ReadOptions, range: R) -> Result<ScanIterator>
    where
        R: RangeBounds<Vec<u8>>,
    {
        let (mem, imm, current, seq) = {
            let state = self.state.lock()?;
            (
                Arc::clone(&state.mem),
                state.imm.clone(),
                state.versions.current(),
                options.snapshot.unwrap_or(state.versions.last_sequence),
            )
        };

        let (start, skip) = match range.start_bound() {
            Bound::Included(key) => (Some(LookupKey::new(key, seq)), None),
            Bound::Excluded(key) => (Some(LookupKey::new(key, seq)), Some(key.clone())),
            Bound::Unbounded => (None, None),
        };
        let start_key = start.as_ref().map(|k| k.internal_key());
        let end = match range.end_bound() {
            Bound::Included(key) => Bound::Included(key.clone()),
            Bound::Excluded(key) => Bound::Excluded(key.clone()),
            Bound::Unbounded => Bound::Unbounded,
        };

        let mut sources: Vec<InternalIterator> = Vec::new();
        sources.push(Box::new(
            MemTableIterator::new(mem, start_key).map(Ok),
        ));
        if let Some(imm) = imm {
            sources.push(Box::new(MemTableIterator::new(imm, start_key).map(Ok)));
        }
        for file in &current.files[0] {
            let iter =
                self.table_cache
                    .iter(*options, file.number, file.size, start_key)?;
            sources.push(Box::new(iter));
        }
        for level in 1..NUM_LEVELS {
            if current.files[level].is_empty() {
                continue;
            }
            sources.push(Box::new(LevelFileIterator::new(
                Arc::clone(&self.table_cache),
                *options,
                current.files[level].clone(),
                start_key,
            )));
        }

        Ok(ScanIterator::new(MergeIterator::new(sources), seq, skip, end)
            .pin_version(current))
    }

    fn snapshot(&self) -> Snapshot {
        let mut state = self.state.lock().unwrap();
        let seq = state.versions.last_sequence;
        *state.snapshots.entry(seq).or_insert(0) += 1;
        Snapshot { seq }
    }

    fn release_snapshot(&self, snapshot: Snapshot) {
        let mut state = self.state.lock().unwrap();
        if let Some(count) = state.snapshots.get_mut(&snapshot.seq) {
            *count -= 1;
            if *count == 0 {
                state.snapshots.remove(&snapshot.seq);
            }
        }
    }

    fn property(&self, name: &str) -> Option<String> {
        let rest = name.strip_prefix(PROPERTY_PREFIX)?;
        let state = self.state.lock().ok()?;

        if let Some(level) = rest.strip_prefix("num-files-at-level") {
            let level: usize = level.parse().ok()?;
            if level >= NUM_LEVELS {
                return None;
            }
            return Some(state.versions.num_level_files(level).to_string());
        }

        match rest {
            "stats" => {
                let mut out = String::from(
                    "Level  Files Size(MB) Time(sec) Read(MB) Write(MB)\n\
                     --------------------------------------------------\n",
                );
                for level in 0..NUM_LEVELS {
                    let files = state.versions.num_level_files(level);
                    let stats = state.stats[level];
                    if files == 0 && stats.micros == 0 {
                        continue;
                    }
                    out.push_str(&format!(
                        "{:5} {:6} {:8.1} {:9.3} {:8.1} {:9.1}\n",
                        level,
                        files,
                        state.versions.num_level_bytes(level) as f64 / 1048576.0,
                        stats.micros as f64 / 1e6,
                        stats.bytes_read as f64 / 1048576.0,
                        stats.bytes_written as f64 / 1048576.0,
                    ));
                }
                Some(out)
            }
            "sstables" => Some(state.versions.current().describe()),
            "approximate-memory-usage" => {
                let mut usage = state.mem.approximate_memory_usage();
                if let Some(imm) = &state.imm {
                    usage += imm.approximate_memory_usage();
                }
                Some(usage.to_string())
            }
            _ => None,
        }
    }

    fn approximate_sizes(&self, ranges: &[(Vec<u8>, Vec<u8>)]) -> Result<Vec<u64>> {
        let current = {
            let state = self.state.lock()?;
            state.versions.current()
        };

        let mut sizes = Vec::with_capacity(ranges.len());
        for (begin, end) in ranges {
            let begin_key = LookupKey::new(begin, crate::config::MAX_SEQUENCE);
            let end_key = LookupKey::new(end, crate::config::MAX_SEQUENCE);
            let start = self.approximate_offset(&current, begin_key.internal_key())?;
            let limit = self.approximate_offset(&current, end_key.internal_key())?;
            sizes.push(limit.saturating_sub(start));
        }
        Ok(sizes)
    }

    fn approximate_offset(
        &self,
        version: &crate::version::Version,
        target: &[u8],
    ) -> Result<u64> {
        let mut offset = 0u64;
        for (level, files) in version.files.iter().enumerate() {
            for file in files {
                if ikey::compare(file.largest.as_bytes(), target) == std::cmp::Ordering::Less {
                    offset += file.size;
                } else if ikey::compare(file.smallest.as_bytes(), target)
                    != std::cmp::Ordering::Less
                {
                    // Entirely past the target; later files in a sorted
                    // level are too.
                    if level > 0 {
                        break;
                    }
                } else {
                    let table = self.table_cache.get_table(file.number, file.size)?;
                    offset += table.approximate_offset_of(target);
                }
            }
        }
        Ok(offset)
    }

    // ---------------- manual compaction ----------------

    fn compact_range(&self, begin: Option<&[u8]>, end: Option<&[u8]>) -> Result<()> {
        let mut max_level_with_files = 1;
        {
            let state = self.state.lock()?;
            let current = state.versions.current();
            for level in 1..NUM_LEVELS {
                if current.overlap_in_level(level, begin, end) {
                    max_level_with_files = level;
                }
            }
        }

        // Seal and flush the memtable so its contents participate.
        self.write(&WriteOptions::default(), None)?;
        {
            let mut state = self.state.lock()?;
            while state.imm.is_some() && state.bg_error.is_none() {
                state = self.bg_finished.wait(state)?;
            }
            if let Some(e) = state.bg_error.clone() {
                return Err(e);
            }
        }

        for level in 0..max_level_with_files {
            self.manual_compact_level(level, begin, end)?;
        }
        Ok(())
    }

    fn manual_compact_level(
        &self,
        level: usize,
        begin: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Result<()> {
        let mut state = self.state.lock()?;

        // One manual compaction at a time.
        loop {
            if let Some(e) = state.bg_error.clone() {
                return Err(e);
            }
            if state.manual_compaction.is_none() {
                break;
            }
            state = self.bg_finished.wait(state)?;
        }

        state.manual_compaction = Some(ManualCompaction {
            level,
            done: false,
            begin: begin.map(|b| b.to_vec()),
            end: end.map(|e| e.to_vec()),
            resume_after: None,
        });
        self.maybe_schedule_compaction(&mut state);

        loop {
            if let Some(e) = state.bg_error.clone() {
                state.manual_compaction = None;
                return Err(e);
            }
            let done = state
                .manual_compaction
                .as_ref()
                .map_or(true, |manual| manual.done);
            if done {
                break;
            }
            self.maybe_schedule_compaction(&mut state);
            state = self.bg_finished.wait(state)?;
        }
        state.manual_compaction = None;
        Ok(())
    }

    // ---------------- background work ----------------

    /// Idempotent: wakes the worker only when it is idle and some work
    /// exists (a sealed memtable, a manual request, or a planner
    /// candidate).
    fn maybe_schedule_compaction(&self, state: &mut DbState) {
        if state.bg_compaction_scheduled {
            return;
        }
        if self.shutting_down.load(Ordering::Acquire) || state.bg_error.is_some() {
            return;
        }
        let manual_pending = state
            .manual_compaction
            .as_ref()
            .map_or(false, |manual| !manual.done);
        if state.imm.is_none() && !manual_pending && !state.versions.needs_compaction() {
            return;
        }
        state.bg_compaction_scheduled = true;
        self.bg_work_signal.notify_one();
    }

    fn record_background_error(&self, state: &mut DbState, error: Error) {
        if state.bg_error.is_none() {
            tracing::error!(error = %error, "background error; writes will fail");
            state.bg_error = Some(error);
        }
        self.bg_finished.notify_all();
    }

    fn background_compaction<'a>(
        &'a self,
        mut state: MutexGuard<'a, DbState>,
    ) -> MutexGuard<'a, DbState> {
        if state.imm.is_some() {
            return self.compact_mem_table(state);
        }

        let s = &mut *state;
        let (planned, is_manual) = match &mut s.manual_compaction {
            Some(manual) if !manual.done => {
                let begin = manual.next_begin();
                let planned = s.versions.compact_range(
                    manual.level,
                    begin.as_deref(),
                    manual.end.as_deref(),
                );
                match &planned {
                    Some(compaction) => {
                        let largest = compaction.inputs[0]
                            .iter()
                            .map(|f| f.largest.clone())
                            .max()
                            .expect("manual compaction has inputs");
                        manual.resume_after = Some(largest);
                        tracing::info!(
                            level = manual.level,
                            files = compaction.inputs[0].len(),
                            "manual compaction step"
                        );
                    }
                    None => manual.done = true,
                }
                (planned, true)
            }
            _ => (s.versions.pick_compaction(), false),
        };

        match planned {
            None => state,
            Some(mut compaction) if !is_manual && compaction.is_trivial_move() => {
                // Move the file down a level by edit alone.
                let file = Arc::clone(&compaction.inputs[0][0]);
                compaction.edit.delete_file(compaction.level, file.number);
                compaction.edit.add_file(
                    compaction.level + 1,
                    file.number,
                    file.size,
                    file.smallest.clone(),
                    file.largest.clone(),
                );
                match state.versions.log_and_apply(&mut compaction.edit) {
                    Ok(()) => {
                        tracing::info!(
                            file = file.number,
                            from = compaction.level,
                            to = compaction.level + 1,
                            size = file.size,
                            "trivial move"
                        );
                    }
                    Err(e) => self.record_background_error(&mut state, e),
                }
                state
            }
            Some(compaction) => self.do_compaction_work(state, compaction),
        }
    }

    /// Flushes the sealed memtable to a table file and installs it.
    fn compact_mem_table<'a>(
        &'a self,
        mut state: MutexGuard<'a, DbState>,
    ) -> MutexGuard<'a, DbState> {
        let Some(imm) = state.imm.clone() else {
            return state;
        };
        let number = state.versions.new_file_number();
        state.pending_outputs.insert(number);
        let base = state.versions.current();
        let log_number = state.log_file_number;
        drop(state);

        let started = Instant::now();
        let built = build_table(&self.dir, &self.options, &self.table_cache, number, &imm);

        let mut state = self.state.lock().unwrap();
        state.pending_outputs.remove(&number);

        let applied = match built {
            Ok(Some((size, smallest, largest))) => {
                let level = base.pick_level_for_memtable_output(
                    &self.options,
                    smallest.user_key(),
                    largest.user_key(),
                );
                tracing::info!(file = number, level, size, "flushed memtable");
                let mut edit = VersionEdit::new();
                edit.set_log_number(log_number);
                edit.add_file(level, number, size, smallest, largest);
                let result = state.versions.log_and_apply(&mut edit);
                if result.is_ok() {
                    state.stats[level].add(started.elapsed().as_micros() as u64, 0, size);
                }
                result
            }
            Ok(None) => {
                // Sealed memtable was empty; still advance the recorded
                // log number so the old WAL becomes obsolete.
                let mut edit = VersionEdit::new();
                edit.set_log_number(log_number);
                state.versions.log_and_apply(&mut edit)
            }
            Err(e) => Err(e),
        };

        match applied {
            Ok(()) => {
                state.imm = None;
                self.has_imm.store(false, Ordering::Release);
                self.delete_obsolete_files(&mut state);
            }
            Err(e) => self.record_background_error(&mut state, e),
        }
        self.bg_finished.notify_all();
        state
    }

    fn open_compaction_output(&self, compact: &mut CompactionState) -> Result<()> {
        let number = {
            let mut state = self.state.lock()?;
            let number = state.versions.new_file_number();
            state.pending_outputs.insert(number);
            number
        };
        let file = File::create(filename::table_file(&self.dir, number))?;
        let builder = TableBuilder::new(&self.options, file)?;
        compact.builder = Some(PendingOutput {
            number,
            builder,
            smallest: InternalKey::new(b"", 0, ValueType::Value),
            largest: InternalKey::new(b"", 0, ValueType::Value),
        });
        Ok(())
    }

    fn finish_compaction_output(&self, compact: &mut CompactionState) -> Result<()> {
        let output = compact.builder.take().expect("open output to finish");
        let number = output.number;
        let entries = output.builder.num_entries();
        let size = output.builder.finish()?;

        // Verify the new table is usable before committing to it.
        self.table_cache.get_table(number, size)?;

        tracing::debug!(file = number, entries, size, "compaction output");
        compact.total_bytes += size;
        compact.outputs.push(FinishedOutput {
            number,
            size,
            smallest: output.smallest,
            largest: output.largest,
        });
        Ok(())
    }

    /// The compaction merge loop: streams every input entry in
    /// internal-key order, applies the snapshot-aware drop rules, rotates
    /// output files, and atomically installs the result.
    fn do_compaction_work<'a>(
        &'a self,
        state: MutexGuard<'a, DbState>,
        mut compaction: Compaction,
    ) -> MutexGuard<'a, DbState> {
        let started = Instant::now();
        let mut imm_micros = 0u128;

        tracing::info!(
            level = compaction.level,
            inputs_low = compaction.num_input_files(0),
            inputs_high = compaction.num_input_files(1),
            "compacting"
        );

        let smallest_snapshot = state
            .snapshots
            .keys()
            .next()
            .copied()
            .unwrap_or(state.versions.last_sequence);
        let mut compact = CompactionState::new(smallest_snapshot);
        drop(state);

        let read_options = ReadOptions {
            verify_checksums: self.options.paranoid_checks,
            fill_cache: false,
            snapshot: None,
        };

        let mut status: Result<()> = Ok(());
        let sources = (|| -> Result<Vec<InternalIterator>> {
            let mut sources: Vec<InternalIterator> = Vec::new();
            if compaction.level == 0 {
                for file in &compaction.inputs[0] {
                    let iter =
                        self.table_cache
                            .iter(read_options, file.number, file.size, None)?;
                    sources.push(Box::new(iter));
                }
            } else {
                sources.push(Box::new(LevelFileIterator::new(
                    Arc::clone(&self.table_cache),
                    read_options,
                    compaction.inputs[0].clone(),
                    None,
                )));
            }
            sources.push(Box::new(LevelFileIterator::new(
                Arc::clone(&self.table_cache),
                read_options,
                compaction.inputs[1].clone(),
                None,
            )));
            Ok(sources)
        })();

        let mut merge = match sources {
            Ok(sources) => Some(MergeIterator::new(sources)),
            Err(e) => {
                status = Err(e);
                None
            }
        };

        let mut last_user_key: Option<Vec<u8>> = None;
        let mut last_sequence_for_key = u64::MAX;

        if let Some(merge) = &mut merge {
            for entry in merge {
                // Give priority to a newly sealed memtable so level-0 work
                // does not back up behind a long compaction.
                if self.has_imm.load(Ordering::Acquire) {
                    let pause = Instant::now();
                    let guard = self.state.lock().unwrap();
                    let guard = if guard.imm.is_some() {
                        self.compact_mem_table(guard)
                    } else {
                        guard
                    };
                    drop(guard);
                    imm_micros += pause.elapsed().as_micros();
                }
                if self.shutting_down.load(Ordering::Acquire) {
                    status = Err(Error::Io(
                        "database shutting down during compaction".to_string(),
                    ));
                    break;
                }

                let (key, value) = match entry {
                    Ok(entry) => entry,
                    Err(e) => {
                        status = Err(e);
                        break;
                    }
                };

                // Rotate the output when the grandparent overlap or the
                // file size says so, but never between two entries of the
                // same user key: splitting one would break the level
                // invariant.
                let grandparent_stop = compaction.should_stop_before(&key);
                if compact.builder.is_some() {
                    let size_full = compact
                        .builder
                        .as_ref()
                        .map_or(false, |out| out.builder.file_size() >= self.options.max_file_size);
                    if (grandparent_stop || size_full) && !compact.would_split_user_key(&key) {
                        if let Err(e) = self.finish_compaction_output(&mut compact) {
                            status = Err(e);
                            break;
                        }
                    }
                }

                let user_key = ikey::user_key(&key);
                if last_user_key.as_deref() != Some(user_key) {
                    last_user_key = Some(user_key.to_vec());
                    last_sequence_for_key = u64::MAX;
                }

                let seq = ikey::sequence(&key);
                let hidden = last_sequence_for_key <= compact.smallest_snapshot;
                let obsolete_tombstone = !hidden
                    && ikey::value_type(&key) == Some(ValueType::Deletion)
                    && seq <= compact.smallest_snapshot
                    && compaction.is_base_level_for_key(user_key);
                last_sequence_for_key = seq;

                if hidden || obsolete_tombstone {
                    continue;
                }

                if compact.builder.is_none() {
                    if let Err(e) = self.open_compaction_output(&mut compact) {
                        status = Err(e);
                        break;
                    }
                }
                let output = compact.builder.as_mut().expect("output just opened");
                if output.builder.num_entries() == 0 {
                    output.smallest = InternalKey::decode_from(&key);
                }
                output.largest = InternalKey::decode_from(&key);
                if let Err(e) = output.builder.add(&key, &value) {
                    status = Err(e);
                    break;
                }
            }
        }

        if status.is_ok() && compact.builder.is_some() {
            status = self.finish_compaction_output(&mut compact);
        }

        let bytes_read = crate::version::total_file_size(&compaction.inputs[0])
            + crate::version::total_file_size(&compaction.inputs[1]);
        let bytes_written = compact.total_bytes;

        let mut state = self.state.lock().unwrap();
        state.stats[compaction.level + 1].add(
            (started.elapsed().as_micros().saturating_sub(imm_micros)) as u64,
            bytes_read,
            bytes_written,
        );

        if status.is_ok() {
            tracing::info!(
                level = compaction.level,
                outputs = compact.outputs.len(),
                bytes = bytes_written,
                "compacted"
            );
            compaction.add_input_deletions();
            for output in &compact.outputs {
                compaction.edit.add_file(
                    compaction.level + 1,
                    output.number,
                    output.size,
                    output.smallest.clone(),
                    output.largest.clone(),
                );
            }
            status = state.versions.log_and_apply(&mut compaction.edit);
        }
        if let Err(e) = status {
            self.record_background_error(&mut state, e);
        }

        // Release reserved output numbers; anything not installed becomes
        // unreferenced and is swept below.
        for output in &compact.outputs {
            state.pending_outputs.remove(&output.number);
        }
        if let Some(open) = compact.builder.take() {
            state.pending_outputs.remove(&open.number);
            drop(open.builder);
            let _ = std::fs::remove_file(filename::table_file(&self.dir, open.number));
        }
        self.delete_obsolete_files(&mut state);
        state
    }

    /// Deletes files no live version references: old WALs and manifests,
    /// dropped tables, stale temp files. Skipped entirely after a
    /// background error, when the recorded state cannot be trusted.
    fn delete_obsolete_files(&self, state: &mut DbState) {
        if state.bg_error.is_some() {
            return;
        }
        let mut live = state.versions.live_files();
        live.extend(state.pending_outputs.iter().copied());

        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(error = %e, "cannot scan database directory");
                return;
            }
        };

        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some((file_type, number)) = filename::parse_file_name(name) else {
                continue;
            };

            let keep = match file_type {
                filename::FileType::Log => number >= state.versions.log_number,
                filename::FileType::Manifest => number >= state.versions.manifest_file_number,
                filename::FileType::Table => live.contains(&number),
                filename::FileType::Temp => live.contains(&number),
                filename::FileType::Current | filename::FileType::Lock => true,
            };
            if keep {
                continue;
            }

            if file_type == filename::FileType::Table {
                self.table_cache.evict(number);
            }
            tracing::debug!(file = name, "deleting obsolete file");
            if let Err(e) = std::fs::remove_file(entry.path()) {
                tracing::warn!(file = name, error = %e, "failed to delete obsolete file");
            }
        }
    }
}

/// The background worker: waits for scheduled work, runs exactly one
/// flush/compaction cycle at a time, and re-checks for follow-up work
/// before sleeping.
fn background_main(inner: Arc<DbInner>) {
    let mut state = inner.state.lock().unwrap();
    loop {
        while !inner.shutting_down.load(Ordering::Acquire) && !state.bg_compaction_scheduled {
            state = inner.bg_work_signal.wait(state).unwrap();
        }
        if inner.shutting_down.load(Ordering::Acquire) {
            break;
        }

        state = inner.background_compaction(state);
        state.bg_compaction_scheduled = false;
        // Compaction may have unblocked more work (or a manual request
        // arrived meanwhile).
        inner.maybe_schedule_compaction(&mut state);
        inner.bg_finished.notify_all();
    }
    drop(state);
    inner.bg_finished.notify_all();
}

fn is_front(writers: &VecDeque<Arc<Writer>>, writer: &Arc<Writer>) -> bool {
    writers
        .front()
        .map_or(false, |front| Arc::ptr_eq(front, writer))
}

/// Merges the leader's batch with queued followers, bounded so a burst of
/// small writes commits together without penalizing a small leader with a
/// huge group.
fn build_batch_group(
    writers: &VecDeque<Arc<Writer>>,
    leader: &Arc<Writer>,
) -> (WriteBatch, Arc<Writer>) {
    debug_assert!(is_front(writers, leader));

    let mut group = leader
        .batch
        .lock()
        .unwrap()
        .take()
        .expect("leader has a batch");
    let mut size = group.approximate_size();

    // Cap the group: 1MiB, but if the leader is small keep the group
    // small too so its latency stays low.
    let max_size = if size >= 128 * 1024 {
        1024 * 1024
    } else {
        size + 128 * 1024
    };

    let mut last_writer = Arc::clone(leader);
    for writer in writers.iter().skip(1) {
        if writer.sync && !leader.sync {
            // A sync write must not piggyback on a non-sync commit.
            break;
        }
        let batch = writer.batch.lock().unwrap();
        let Some(batch) = batch.as_ref() else {
            break;
        };
        size += batch.approximate_size();
        if size > max_size {
            break;
        }
        group.append(batch);
        last_writer = Arc::clone(writer);
    }
    (group, last_writer)
}

/// Builds a table file from a memtable's contents and verifies it opens
/// cleanly through the table cache. Returns None for an empty memtable; on
/// failure the partial output is deleted.
fn build_table(
    dir: &Path,
    options: &Options,
    cache: &TableCache,
    number: u64,
    mem: &Arc<MemTable>,
) -> Result<Option<(u64, InternalKey, InternalKey)>> {
    let mut iter = MemTableIterator::new(Arc::clone(mem), None).peekable();
    if iter.peek().is_none() {
        return Ok(None);
    }

    let path = filename::table_file(dir, number);
    let result = (|| {
        let file = File::create(&path)?;
        let mut builder = TableBuilder::new(options, file)?;

        let mut smallest: Option<Vec<u8>> = None;
        let mut largest: Vec<u8> = Vec::new();
        for (key, value) in iter {
            if smallest.is_none() {
                smallest = Some(key.clone());
            }
            largest = key.clone();
            builder.add(&key, &value)?;
        }
        let size = builder.finish()?;

        // Verify the table is usable.
        cache.get_table(number, size)?;

        Ok(Some((
            size,
            InternalKey::from_vec(smallest.expect("non-empty memtable")),
            InternalKey::from_vec(largest),
        )))
    })();

    if result.is_err() {
        cache.evict(number);
        let _ = std::fs::remove_file(&path);
    }
    result
}

/// Writes the initial manifest and CURRENT for a brand-new database.
fn initialize_db(dir: &Path) -> Result<()> {
    let mut edit = VersionEdit::new();
    edit.set_log_number(0);
    edit.set_next_file_number(2);
    edit.set_last_sequence(0);

    let manifest_number = 1;
    let path = filename::manifest_file(dir, manifest_number);
    let file = File::create(&path)?;
    let mut writer = LogWriter::new(file)?;
    let result = writer
        .add_record(&edit.encode())
        .and_then(|_| writer.sync())
        .and_then(|_| filename::set_current_file(dir, manifest_number));
    if result.is_err() {
        let _ = std::fs::remove_file(&path);
    }
    result
}

/// Replays every WAL at or above the manifest's log number, oldest first,
/// flushing the reconstructed memtable whenever it fills. Returns whether
/// the final WAL was kept as the live one (`reuse_logs`).
fn recover_wals(
    state: &mut DbState,
    dir: &Path,
    options: &Options,
    cache: &Arc<TableCache>,
    save_manifest: &mut bool,
) -> Result<bool> {
    let mut log_numbers: Vec<u64> = Vec::new();
    for entry in std::fs::read_dir(dir)?.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some((filename::FileType::Log, number)) = filename::parse_file_name(name) {
            if number >= state.versions.log_number {
                log_numbers.push(number);
            }
        }
    }
    log_numbers.sort_unstable();

    let mut max_sequence = 0u64;
    let mut reused = false;
    let count = log_numbers.len();
    for (i, &number) in log_numbers.iter().enumerate() {
        state.versions.mark_file_number_used(number);
        reused = replay_wal(
            state,
            dir,
            options,
            cache,
            number,
            i + 1 == count,
            &mut max_sequence,
            save_manifest,
        )?;
    }

    if state.versions.last_sequence < max_sequence {
        state.versions.last_sequence = max_sequence;
    }
    Ok(reused)
}

#[allow(clippy::too_many_arguments)]
fn replay_wal(
    state: &mut DbState,
    dir: &Path,
    options: &Options,
    cache: &Arc<TableCache>,
    number: u64,
    last_log: bool,
    max_sequence: &mut u64,
    save_manifest: &mut bool,
) -> Result<bool> {
    let path = filename::log_file(dir, number);
    let file = File::open(&path)?;
    let mut reader = LogReader::new(file);
    tracing::info!(log = number, "recovering write-ahead log");

    let mut mem: Option<Arc<MemTable>> = None;
    let mut flushes = 0usize;
    let mut clean_tail = true;

    loop {
        match reader.read_record() {
            Ok(Some(record)) => {
                if record.len() < BATCH_HEADER_SIZE {
                    let err = corruption!("log record smaller than a batch header");
                    if options.paranoid_checks {
                        return Err(err);
                    }
                    tracing::warn!(log = number, error = %err, "truncating log");
                    clean_tail = false;
                    break;
                }
                let batch = WriteBatch::from_contents(record)?;
                let target = mem
                    .get_or_insert_with(|| Arc::new(MemTable::new()))
                    .clone();
                batch.insert_into(&target)?;

                let last_seq = batch.sequence() + batch.count() as u64 - 1;
                *max_sequence = (*max_sequence).max(last_seq);

                if target.approximate_memory_usage() > options.write_buffer_size {
                    flushes += 1;
                    *save_manifest = true;
                    flush_recovered_memtable(state, dir, options, cache, &target)?;
                    mem = None;
                }
            }
            Ok(None) => break,
            Err(e) => {
                // A torn tail record: everything before it is intact.
                if options.paranoid_checks {
                    return Err(e);
                }
                tracing::warn!(log = number, error = %e, "truncating log at corruption");
                clean_tail = false;
                break;
            }
        }
    }

    // Keep appending to a cleanly recovered final WAL when configured.
    if options.reuse_logs && last_log && flushes == 0 && clean_tail {
        let file = OpenOptions::new().read(true).append(true).open(&path)?;
        let len = file.metadata()?.len();
        state.log = Some(Arc::new(Mutex::new(LogWriter::with_offset(file, len)?)));
        state.log_file_number = number;
        if let Some(mem) = mem.take() {
            state.mem = mem;
        }
        tracing::info!(log = number, "reusing write-ahead log");
        return Ok(true);
    }

    if let Some(mem) = mem {
        *save_manifest = true;
        flush_recovered_memtable(state, dir, options, cache, &mem)?;
    }
    Ok(false)
}

fn flush_recovered_memtable(
    state: &mut DbState,
    dir: &Path,
    options: &Options,
    cache: &Arc<TableCache>,
    mem: &Arc<MemTable>,
) -> Result<()> {
    let number = state.versions.new_file_number();
    let Some((size, smallest, largest)) = build_table(dir, options, cache, number, mem)? else {
        return Ok(());
    };
    let base = state.versions.current();
    let level =
        base.pick_level_for_memtable_output(options, smallest.user_key(), largest.user_key());
    tracing::info!(file = number, level, size, "recovered memtable into table");

    let mut edit = VersionEdit::new();
    edit.add_file(level, number, size, smallest, largest);
    state.versions.log_and_apply(&mut edit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::TempDir;

    fn queued(batch_bytes: usize, sync: bool) -> Arc<Writer> {
        let mut batch = WriteBatch::new();
        batch.put(b"k", &vec![0u8; batch_bytes]);
        Arc::new(Writer::new(Some(batch), sync))
    }

    #[test]
    fn batch_group_merges_followers() {
        let mut writers = VecDeque::new();
        for _ in 0..3 {
            writers.push_back(queued(10, false));
        }
        let leader = Arc::clone(writers.front().unwrap());

        let (group, last) = build_batch_group(&writers, &leader);
        assert_eq!(group.count(), 3);
        assert!(Arc::ptr_eq(&last, writers.back().unwrap()));
    }

    #[test]
    fn batch_group_stops_at_sync_upgrade() {
        let mut writers = VecDeque::new();
        writers.push_back(queued(10, false));
        writers.push_back(queued(10, true));
        writers.push_back(queued(10, false));
        let leader = Arc::clone(writers.front().unwrap());

        let (group, last) = build_batch_group(&writers, &leader);
        assert_eq!(group.count(), 1);
        assert!(Arc::ptr_eq(&last, &leader));
    }

    #[test]
    fn sync_leader_carries_sync_followers() {
        let mut writers = VecDeque::new();
        writers.push_back(queued(10, true));
        writers.push_back(queued(10, true));
        let leader = Arc::clone(writers.front().unwrap());

        let (group, _) = build_batch_group(&writers, &leader);
        assert_eq!(group.count(), 2);
    }

    #[test]
    fn batch_group_respects_small_leader_cap() {
        let mut writers = VecDeque::new();
        writers.push_back(queued(16, false));
        // A follower large enough to blow the small-leader cap.
        writers.push_back(queued(200 * 1024, false));
        let leader = Arc::clone(writers.front().unwrap());

        let (group, last) = build_batch_group(&writers, &leader);
        assert_eq!(group.count(), 1);
        assert!(Arc::ptr_eq(&last, &leader));
    }

    #[test]
    fn batch_group_stops_at_force_writer() {
        let mut writers = VecDeque::new();
        writers.push_back(queued(10, false));
        writers.push_back(Arc::new(Writer::new(None, false)));
        writers.push_back(queued(10, false));
        let leader = Arc::clone(writers.front().unwrap());

        let (group, last) = build_batch_group(&writers, &leader);
        assert_eq!(group.count(), 1);
        assert!(Arc::ptr_eq(&last, &leader));
    }

    fn open_small(dir: &TempDir) -> Database {
        Database::open(
            Options::default()
                .create_if_missing(true)
                .write_buffer_size(64 * 1024)
                .compression(crate::config::Compression::None),
            dir.path(),
        )
        .expect("open")
    }

    #[test]
    fn put_get_delete() {
        let dir = TempDir::new().unwrap();
        let db = open_small(&dir);
        let wopts = WriteOptions::default();
        let ropts = ReadOptions::default();

        db.put(&wopts, b"a", b"1").unwrap();
        db.put(&wopts, b"b", b"2").unwrap();
        db.delete(&wopts, b"a").unwrap();

        assert_eq!(db.get(&ropts, b"a").unwrap(), None);
        assert_eq!(db.get(&ropts, b"b").unwrap(), Some(b"2".to_vec()));
        assert_eq!(db.get(&ropts, b"c").unwrap(), None);
    }

    #[test]
    fn overwrites_visible_immediately() {
        let dir = TempDir::new().unwrap();
        let db = open_small(&dir);
        let wopts = WriteOptions::default();
        let ropts = ReadOptions::default();

        db.put(&wopts, b"k", b"v1").unwrap();
        db.put(&wopts, b"k", b"v2").unwrap();
        assert_eq!(db.get(&ropts, b"k").unwrap(), Some(b"v2".to_vec()));
    }

    #[test]
    fn atomic_batch() {
        let dir = TempDir::new().unwrap();
        let db = open_small(&dir);

        let mut batch = WriteBatch::new();
        batch.put(b"a", b"1");
        batch.put(b"b", b"2");
        batch.delete(b"a");
        db.write(&WriteOptions::default(), batch).unwrap();

        let ropts = ReadOptions::default();
        assert_eq!(db.get(&ropts, b"a").unwrap(), None);
        assert_eq!(db.get(&ropts, b"b").unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn snapshot_isolation() {
        let dir = TempDir::new().unwrap();
        let db = open_small(&dir);
        let wopts = WriteOptions::default();

        db.put(&wopts, b"k", b"v1").unwrap();
        let snapshot = db.snapshot();
        db.put(&wopts, b"k", b"v2").unwrap();

        assert_eq!(
            db.get(&ReadOptions::default(), b"k").unwrap(),
            Some(b"v2".to_vec())
        );
        let pinned = ReadOptions::default().snapshot(Some(snapshot.sequence()));
        assert_eq!(db.get(&pinned, b"k").unwrap(), Some(b"v1".to_vec()));

        db.release_snapshot(snapshot);
    }

    #[test]
    fn snapshot_sees_pre_delete_value() {
        let dir = TempDir::new().unwrap();
        let db = open_small(&dir);
        let wopts = WriteOptions::default();

        db.put(&wopts, b"k", b"v").unwrap();
        let snapshot = db.snapshot();
        db.delete(&wopts, b"k").unwrap();

        assert_eq!(db.get(&ReadOptions::default(), b"k").unwrap(), None);
        let pinned = ReadOptions::default().snapshot(Some(snapshot.sequence()));
        assert_eq!(db.get(&pinned, b"k").unwrap(), Some(b"v".to_vec()));
        db.release_snapshot(snapshot);
    }

    #[test]
    fn scan_is_ordered_and_collapsed() {
        let dir = TempDir::new().unwrap();
        let db = open_small(&dir);
        let wopts = WriteOptions::default();

        db.put(&wopts, b"c", b"3").unwrap();
        db.put(&wopts, b"a", b"1").unwrap();
        db.put(&wopts, b"b", b"old").unwrap();
        db.put(&wopts, b"b", b"2").unwrap();
        db.delete(&wopts, b"c").unwrap();

        let entries: Vec<_> = db
            .scan(&ReadOptions::default(), ..)
            .unwrap()
            .map(|e| e.unwrap())
            .collect();
        assert_eq!(
            entries,
            vec![
                (b"a".to_vec(), b"1".to_vec()),
                (b"b".to_vec(), b"2".to_vec()),
            ]
        );
    }

    #[test]
    fn scan_range_bounds() {
        let dir = TempDir::new().unwrap();
        let db = open_small(&dir);
        let wopts = WriteOptions::default();
        for key in [b"a", b"b", b"c", b"d"] {
            db.put(&wopts, key, b"v").unwrap();
        }

        let keys: Vec<_> = db
            .scan(&ReadOptions::default(), b"b".to_vec()..b"d".to_vec())
            .unwrap()
            .map(|e| e.unwrap().0)
            .collect();
        assert_eq!(keys, vec![b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn properties_report_state() {
        let dir = TempDir::new().unwrap();
        let db = open_small(&dir);
        db.put(&WriteOptions::default(), b"k", b"v").unwrap();

        assert!(db.property("cinderdb.num-files-at-level0").is_some());
        assert!(db.property("cinderdb.stats").is_some());
        assert!(db.property("cinderdb.sstables").is_some());
        let usage: usize = db
            .property("cinderdb.approximate-memory-usage")
            .unwrap()
            .parse()
            .unwrap();
        assert!(usage > 0);
        assert!(db.property("bogus.property").is_none());
        assert!(db.property("cinderdb.bogus").is_none());
    }

    #[test]
    fn second_open_fails_while_locked() {
        let dir = TempDir::new().unwrap();
        let _db = open_small(&dir);
        let second = Database::open(Options::default(), dir.path());
        assert!(second.is_err());
    }

    #[test]
    fn open_missing_without_create_fails() {
        let dir = TempDir::new().unwrap();
        let result = Database::open(Options::default(), dir.path().join("nope"));
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn open_existing_with_error_if_exists_fails() {
        let dir = TempDir::new().unwrap();
        drop(open_small(&dir));
        let result = Database::open(
            Options::default().create_if_missing(true).error_if_exists(true),
            dir.path(),
        );
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn empty_value_roundtrips() {
        let dir = TempDir::new().unwrap();
        let db = open_small(&dir);
        db.put(&WriteOptions::default(), b"k", b"").unwrap();
        assert_eq!(
            db.get(&ReadOptions::default(), b"k").unwrap(),
            Some(Vec::new())
        );
    }

    #[test]
    fn approximate_sizes_grow_with_data() {
        let dir = TempDir::new().unwrap();
        let db = open_small(&dir);
        let wopts = WriteOptions::default();
        for i in 0..2000u32 {
            let key = format!("key{i:06}");
            db.put(&wopts, key.as_bytes(), &[0u8; 100]).unwrap();
        }
        // Force tables onto disk so offsets are meaningful.
        db.compact_range(None, None).unwrap();

        let sizes = db
            .approximate_sizes(&[(b"key000000".to_vec(), b"key001999".to_vec())])
            .unwrap();
        assert!(sizes[0] > 0, "expected non-zero approximate size");
    }
}
