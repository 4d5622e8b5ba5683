//! Versions: immutable descriptions of the live file set.
//!
//! The version set is the manifest's in-memory counterpart. Every flush or
//! compaction produces a version edit; applying the edit to the current
//! version yields a new version, and the edit is appended to the manifest
//! so the same state is reconstructed on recovery. The manifest is a WAL
//! for database metadata rather than user data: where the WAL records
//! key-value mutations, the manifest records which table files exist at
//! which levels.
//!
//! Readers pin a version by cloning its Arc; file metadata is shared
//! between versions the same way, so a table file stays referenced until
//! the last version using it drops. Obsolete-file deletion consults the
//! set of files reachable from any still-live version plus the pending
//! outputs of running compactions.

pub mod compaction;
pub mod edit;

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};

use itertools::Itertools;

use crate::cache::TableCache;
use crate::config::{Options, ReadOptions, NUM_LEVELS};
use crate::corruption;
use crate::db::filename;
use crate::error::Result;
use crate::ikey::{self, InternalKey, LookupKey, ValueType};
use crate::memtable::LookupResult;
use crate::wal::{LogReader, LogWriter};
use edit::VersionEdit;

/// Metadata for one live table file. Shared between versions via Arc; the
/// seek budget is the only mutable part.
#[derive(Debug)]
pub struct FileMetaData {
    pub number: u64,
    pub size: u64,
    pub smallest: InternalKey,
    pub largest: InternalKey,
    /// Seeks that may fall through this file before it becomes a
    /// compaction candidate. One seek costs about as much as compacting
    /// 16KiB, so the budget scales with file size.
    pub allowed_seeks: AtomicI64,
}

impl FileMetaData {
    pub fn new(number: u64, size: u64, smallest: InternalKey, largest: InternalKey) -> Self {
        let allowed = (size / 16384).max(100) as i64;
        Self {
            number,
            size,
            smallest,
            largest,
            allowed_seeks: AtomicI64::new(allowed),
        }
    }

    /// Records one charged seek; true when the budget just ran out.
    pub fn charge_seek(&self) -> bool {
        self.allowed_seeks.fetch_sub(1, Ordering::Relaxed) == 1
    }
}

/// Index of the first file whose largest key is >= target, assuming files
/// sorted by smallest key and non-overlapping.
fn find_file(files: &[Arc<FileMetaData>], target: &[u8]) -> usize {
    let mut low = 0;
    let mut high = files.len();
    while low < high {
        let mid = (low + high) / 2;
        if ikey::compare(files[mid].largest.as_bytes(), target) == std::cmp::Ordering::Less {
            low = mid + 1;
        } else {
            high = mid;
        }
    }
    low
}

fn after_file(user_key: &[u8], file: &FileMetaData) -> bool {
    user_key > file.largest.user_key()
}

fn before_file(user_key: &[u8], file: &FileMetaData) -> bool {
    user_key < file.smallest.user_key()
}

/// Whether any file overlaps `[smallest, largest]` (None bounds are open).
/// `disjoint` enables binary search for levels above zero.
fn some_file_overlaps_range(
    files: &[Arc<FileMetaData>],
    disjoint: bool,
    smallest_user: Option<&[u8]>,
    largest_user: Option<&[u8]>,
) -> bool {
    if !disjoint {
        return files.iter().any(|f| {
            !(smallest_user.map_or(false, |s| after_file(s, f))
                || largest_user.map_or(false, |l| before_file(l, f)))
        });
    }

    let index = match smallest_user {
        Some(user) => {
            let probe = LookupKey::new(user, crate::config::MAX_SEQUENCE);
            find_file(files, probe.internal_key())
        }
        None => 0,
    };
    if index >= files.len() {
        return false;
    }
    !largest_user.map_or(false, |l| before_file(l, &files[index]))
}

pub fn total_file_size(files: &[Arc<FileMetaData>]) -> u64 {
    files.iter().map(|f| f.size).sum()
}

/// An immutable snapshot of which files are live at which levels.
pub struct Version {
    /// Level 0 ordered newest-first by file number; levels above ordered by
    /// smallest key and pairwise non-overlapping.
    pub files: Vec<Vec<Arc<FileMetaData>>>,
    /// Best size-triggered compaction candidate, filled by `finalize`.
    pub compaction_score: f64,
    pub compaction_level: usize,
}

impl Default for Version {
    fn default() -> Self {
        Self::new()
    }
}

impl Version {
    pub fn new() -> Self {
        Self {
            files: (0..NUM_LEVELS).map(|_| Vec::new()).collect(),
            compaction_score: 0.0,
            compaction_level: 0,
        }
    }

    pub fn num_files(&self, level: usize) -> usize {
        self.files[level].len()
    }

    /// Computes the compaction score: level 0 by file count, other levels
    /// by total bytes against their geometric capacity.
    pub fn finalize(&mut self, options: &Options) {
        let mut best_level = 0;
        let mut best_score = -1.0f64;

        for level in 0..NUM_LEVELS - 1 {
            let score = if level == 0 {
                self.files[0].len() as f64 / crate::config::L0_COMPACTION_TRIGGER as f64
            } else {
                total_file_size(&self.files[level]) as f64 / options.max_bytes_for_level(level)
            };
            if score > best_score {
                best_level = level;
                best_score = score;
            }
        }
        self.compaction_level = best_level;
        self.compaction_score = best_score;
    }

    /// Point lookup through the version: level 0 newest-first, then binary
    /// search down the levels. Also reports the file to charge for the
    /// seek when the lookup traversed more than one file.
    pub fn get(
        &self,
        options: &ReadOptions,
        key: &LookupKey,
        cache: &TableCache,
    ) -> Result<(Option<LookupResult>, Option<(usize, Arc<FileMetaData>)>)> {
        let ikey = key.internal_key();
        let ukey = key.user_key();

        let mut first_read: Option<(usize, Arc<FileMetaData>)> = None;
        let mut reads = 0usize;

        for level in 0..NUM_LEVELS {
            let files = &self.files[level];
            if files.is_empty() {
                continue;
            }

            let candidates: Vec<Arc<FileMetaData>> = if level == 0 {
                files
                    .iter()
                    .filter(|f| ukey >= f.smallest.user_key() && ukey <= f.largest.user_key())
                    .cloned()
                    .collect()
            } else {
                let index = find_file(files, ikey);
                match files.get(index) {
                    Some(f) if !before_file(ukey, f) => vec![Arc::clone(f)],
                    _ => Vec::new(),
                }
            };

            for file in candidates {
                reads += 1;
                if reads == 1 {
                    first_read = Some((level, Arc::clone(&file)));
                }

                if let Some((found_key, value)) = cache.get(options, file.number, file.size, ikey)?
                {
                    if ikey::user_key(&found_key) == ukey {
                        let charge = if reads >= 2 { first_read } else { None };
                        let result = match ikey::value_type(&found_key) {
                            Some(ValueType::Value) => LookupResult::Value(value),
                            Some(ValueType::Deletion) => LookupResult::Deleted,
                            None => {
                                return Err(corruption!(
                                    "unknown value tag in table {}",
                                    file.number
                                ))
                            }
                        };
                        return Ok((Some(result), charge));
                    }
                }
            }
        }

        let charge = if reads >= 2 { first_read } else { None };
        Ok((None, charge))
    }

    /// Whether any file at `level` overlaps the user-key range.
    pub fn overlap_in_level(
        &self,
        level: usize,
        smallest_user: Option<&[u8]>,
        largest_user: Option<&[u8]>,
    ) -> bool {
        some_file_overlaps_range(&self.files[level], level > 0, smallest_user, largest_user)
    }

    /// All files at `level` overlapping the user-key range. For level 0 the
    /// range grows to cover each overlapping file and the scan restarts,
    /// because level-0 files overlap one another.
    pub fn overlapping_files(
        &self,
        level: usize,
        begin: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Vec<Arc<FileMetaData>> {
        let mut user_begin = begin.map(|b| b.to_vec());
        let mut user_end = end.map(|e| e.to_vec());
        let mut inputs: Vec<Arc<FileMetaData>> = Vec::new();

        let files = &self.files[level];
        let mut i = 0;
        while i < files.len() {
            let file = Arc::clone(&files[i]);
            i += 1;
            let file_start = file.smallest.user_key();
            let file_limit = file.largest.user_key();

            if user_begin.as_deref().map_or(false, |b| file_limit < b) {
                continue;
            }
            if user_end.as_deref().map_or(false, |e| file_start > e) {
                continue;
            }

            if level == 0 {
                let grew_start = user_begin.as_deref().map_or(false, |b| file_start < b);
                let grew_end = user_end.as_deref().map_or(false, |e| file_limit > e);
                if grew_start {
                    user_begin = Some(file_start.to_vec());
                }
                if grew_end {
                    user_end = Some(file_limit.to_vec());
                }
                if grew_start || grew_end {
                    inputs.clear();
                    i = 0;
                    continue;
                }
            }
            inputs.push(file);
        }
        inputs
    }

    /// Level a fresh memtable flush should land at. Normally 0, but a file
    /// overlapping nothing below may be pushed down (up to level 2) so
    /// bulk loads of disjoint ranges do not pile up small level-0 files.
    pub fn pick_level_for_memtable_output(
        &self,
        options: &Options,
        smallest_user: &[u8],
        largest_user: &[u8],
    ) -> usize {
        let mut level = 0;
        if self.overlap_in_level(0, Some(smallest_user), Some(largest_user)) {
            return level;
        }
        while level < crate::config::MAX_MEM_COMPACT_LEVEL {
            if self.overlap_in_level(level + 1, Some(smallest_user), Some(largest_user)) {
                break;
            }
            if level + 2 < NUM_LEVELS {
                let overlaps =
                    self.overlapping_files(level + 2, Some(smallest_user), Some(largest_user));
                if total_file_size(&overlaps) > options.max_grandparent_overlap_bytes() {
                    break;
                }
            }
            level += 1;
        }
        level
    }

    /// Asserts structural invariants: unique file numbers everywhere and,
    /// above level 0, files sorted and pairwise non-overlapping in user-key
    /// range.
    pub fn check_invariants(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for (level, files) in self.files.iter().enumerate() {
            for file in files {
                if !seen.insert(file.number) {
                    return Err(corruption!(
                        "file {} appears twice in one version",
                        file.number
                    ));
                }
            }
            if level == 0 {
                continue;
            }
            for (a, b) in files.iter().tuple_windows() {
                if a.largest.user_key() >= b.smallest.user_key() {
                    return Err(corruption!(
                        "files {} and {} overlap at level {}",
                        a.number,
                        b.number,
                        level
                    ));
                }
            }
        }
        Ok(())
    }

    /// One line per file, for the sstables property.
    pub fn describe(&self) -> String {
        let mut out = String::new();
        for (level, files) in self.files.iter().enumerate() {
            if files.is_empty() {
                continue;
            }
            out.push_str(&format!("--- level {level} ---\n"));
            for f in files {
                out.push_str(&format!(
                    "{}: {} bytes [{:?} .. {:?}]\n",
                    f.number,
                    f.size,
                    f.smallest.user_key(),
                    f.largest.user_key()
                ));
            }
        }
        out
    }
}

/// Accumulates edits on top of a base version and produces the resulting
/// version.
pub struct Builder {
    base: Arc<Version>,
    deleted: Vec<HashSet<u64>>,
    added: Vec<Vec<Arc<FileMetaData>>>,
}

impl Builder {
    pub fn new(base: Arc<Version>) -> Self {
        Self {
            base,
            deleted: (0..NUM_LEVELS).map(|_| HashSet::new()).collect(),
            added: (0..NUM_LEVELS).map(|_| Vec::new()).collect(),
        }
    }

    /// Folds one edit in, updating the version set's compaction pointers.
    pub fn apply(&mut self, edit: &VersionEdit, compact_pointer: &mut [Option<InternalKey>]) {
        for (level, key) in &edit.compact_pointers {
            compact_pointer[*level] = Some(key.clone());
        }
        for (level, number) in &edit.deleted_files {
            self.deleted[*level].insert(*number);
        }
        for (level, file) in &edit.new_files {
            let meta = Arc::new(FileMetaData::new(
                file.number,
                file.size,
                file.smallest.clone(),
                file.largest.clone(),
            ));
            self.deleted[*level].remove(&file.number);
            self.added[*level].push(meta);
        }
    }

    pub fn save_to(self, options: &Options) -> Version {
        let mut version = Version::new();
        for level in 0..NUM_LEVELS {
            let deleted = &self.deleted[level];
            let mut files: Vec<Arc<FileMetaData>> = self.base.files[level]
                .iter()
                .filter(|f| !deleted.contains(&f.number))
                .cloned()
                .chain(
                    self.added[level]
                        .iter()
                        .filter(|f| !deleted.contains(&f.number))
                        .cloned(),
                )
                .collect();

            if level == 0 {
                files.sort_by(|a, b| b.number.cmp(&a.number));
            } else {
                files.sort_by(|a, b| ikey::compare(a.smallest.as_bytes(), b.smallest.as_bytes()));
            }
            version.files[level] = files;
        }
        version.finalize(options);
        version
    }
}

/// The sequence of versions plus the manifest that persists their deltas.
/// Lives under the coordinator mutex; all methods take &mut.
pub struct VersionSet {
    dir: PathBuf,
    options: Options,

    pub next_file_number: u64,
    pub manifest_file_number: u64,
    pub last_sequence: u64,
    /// WALs numbered below this are obsolete.
    pub log_number: u64,

    current: Arc<Version>,
    /// Versions still pinned by readers or iterators; pruned lazily.
    live_versions: Vec<Weak<Version>>,

    /// Where the next compaction at each level should start, so repeated
    /// compactions rotate across the key range.
    pub compact_pointer: Vec<Option<InternalKey>>,

    /// Seek-triggered compaction candidate, set when a file exhausts its
    /// seek budget.
    pub file_to_compact: Option<(usize, Arc<FileMetaData>)>,

    manifest: Option<LogWriter>,
}

impl VersionSet {
    pub fn new(dir: PathBuf, options: Options) -> Self {
        let mut current = Version::new();
        current.finalize(&options);
        Self {
            dir,
            options,
            next_file_number: 2,
            manifest_file_number: 0,
            last_sequence: 0,
            log_number: 0,
            current: Arc::new(current),
            live_versions: Vec::new(),
            compact_pointer: (0..NUM_LEVELS).map(|_| None).collect(),
            file_to_compact: None,
            manifest: None,
        }
    }

    pub fn current(&self) -> Arc<Version> {
        Arc::clone(&self.current)
    }

    pub fn new_file_number(&mut self) -> u64 {
        let number = self.next_file_number;
        self.next_file_number += 1;
        number
    }

    pub fn mark_file_number_used(&mut self, number: u64) {
        if self.next_file_number <= number {
            self.next_file_number = number + 1;
        }
    }

    pub fn num_level_files(&self, level: usize) -> usize {
        self.current.files[level].len()
    }

    pub fn num_level_bytes(&self, level: usize) -> u64 {
        total_file_size(&self.current.files[level])
    }

    pub fn needs_compaction(&self) -> bool {
        self.current.compaction_score >= 1.0 || self.file_to_compact.is_some()
    }

    /// Applies an edit: writes it to the manifest (creating the manifest
    /// with a full snapshot first when needed), then installs the new
    /// version. Either the whole edit lands or none of it does.
    pub fn log_and_apply(&mut self, edit: &mut VersionEdit) -> Result<()> {
        if edit.log_number.is_none() {
            edit.set_log_number(self.log_number);
        }
        edit.set_next_file_number(self.next_file_number);
        edit.set_last_sequence(self.last_sequence);

        let version = {
            let mut builder = Builder::new(self.current());
            builder.apply(edit, &mut self.compact_pointer);
            builder.save_to(&self.options)
        };

        let mut created_manifest = false;
        if self.manifest.is_none() {
            let path = filename::manifest_file(&self.dir, self.manifest_file_number);
            let file = File::create(&path)?;
            let mut writer = LogWriter::new(file)?;
            self.write_snapshot(&mut writer)?;
            self.manifest = Some(writer);
            created_manifest = true;
        }

        let written = (|| {
            let writer = self.manifest.as_mut().expect("manifest just ensured");
            writer.add_record(&edit.encode())?;
            writer.sync()?;
            if created_manifest {
                filename::set_current_file(&self.dir, self.manifest_file_number)?;
            }
            Ok(())
        })();
        if let Err(e) = written {
            // A half-created manifest must not be appended to later:
            // CURRENT still names the previous one.
            if created_manifest {
                self.manifest = None;
                let _ = std::fs::remove_file(filename::manifest_file(
                    &self.dir,
                    self.manifest_file_number,
                ));
            }
            return Err(e);
        }

        if let Some(number) = edit.log_number {
            self.log_number = number;
        }
        let version = Arc::new(version);
        self.live_versions.push(Arc::downgrade(&version));
        self.current = version;
        Ok(())
    }

    /// Writes one edit describing the entire current state; the first
    /// record of every manifest.
    fn write_snapshot(&self, writer: &mut LogWriter) -> Result<()> {
        let mut snapshot = VersionEdit::new();
        snapshot.set_log_number(self.log_number);
        snapshot.set_next_file_number(self.next_file_number);
        snapshot.set_last_sequence(self.last_sequence);
        for (level, pointer) in self.compact_pointer.iter().enumerate() {
            if let Some(key) = pointer {
                snapshot.set_compact_pointer(level, key.clone());
            }
        }
        for (level, files) in self.current.files.iter().enumerate() {
            for file in files {
                snapshot.add_file(
                    level,
                    file.number,
                    file.size,
                    file.smallest.clone(),
                    file.largest.clone(),
                );
            }
        }
        writer.add_record(&snapshot.encode())?;
        Ok(())
    }

    /// Rebuilds the current version from CURRENT + manifest. Returns true
    /// when open should write a fresh manifest snapshot (the recovered one
    /// is not being reused).
    pub fn recover(&mut self) -> Result<bool> {
        let current_name = filename::read_current_file(&self.dir)?;
        let manifest_path = self.dir.join(&current_name);
        let manifest_number = match filename::parse_file_name(&current_name) {
            Some((filename::FileType::Manifest, number)) => number,
            _ => return Err(corruption!("CURRENT names a non-manifest file")),
        };

        let file = File::open(&manifest_path)?;
        let manifest_size = file.metadata()?.len();
        let mut reader = LogReader::new(file);

        let mut builder = Builder::new(Arc::new(Version::new()));
        let mut log_number = None;
        let mut next_file_number = None;
        let mut last_sequence = None;

        loop {
            let record = match reader.read_record() {
                Ok(Some(record)) => record,
                Ok(None) => break,
                Err(e) => return Err(e),
            };
            let edit = VersionEdit::decode(&record)?;
            builder.apply(&edit, &mut self.compact_pointer);
            if edit.log_number.is_some() {
                log_number = edit.log_number;
            }
            if edit.next_file_number.is_some() {
                next_file_number = edit.next_file_number;
            }
            if edit.last_sequence.is_some() {
                last_sequence = edit.last_sequence;
            }
        }

        let next_file_number =
            next_file_number.ok_or_else(|| corruption!("manifest missing next file number"))?;
        let last_sequence =
            last_sequence.ok_or_else(|| corruption!("manifest missing last sequence"))?;
        let log_number = log_number.ok_or_else(|| corruption!("manifest missing log number"))?;

        self.next_file_number = next_file_number;
        self.mark_file_number_used(log_number);
        self.last_sequence = last_sequence;
        self.log_number = log_number;

        let version = Arc::new(builder.save_to(&self.options));
        self.live_versions.push(Arc::downgrade(&version));
        self.current = version;

        // Reuse a small manifest when asked; otherwise roll to a fresh one
        // so replay work stays bounded.
        let reuse = self.options.reuse_logs && manifest_size < crate::config::MANIFEST_ROLL_BYTES;
        if reuse {
            let file = OpenOptions::new()
                .read(true)
                .append(true)
                .open(&manifest_path)?;
            self.manifest = Some(LogWriter::with_offset(file, manifest_size)?);
            self.manifest_file_number = manifest_number;
            self.mark_file_number_used(manifest_number);
            Ok(false)
        } else {
            self.mark_file_number_used(manifest_number);
            self.manifest_file_number = self.new_file_number();
            Ok(true)
        }
    }

    /// File numbers referenced by any live version. Dead weak entries are
    /// pruned as a side effect.
    pub fn live_files(&mut self) -> HashSet<u64> {
        let mut live = HashSet::new();
        self.live_versions.retain(|weak| match weak.upgrade() {
            Some(version) => {
                for files in &version.files {
                    for file in files {
                        live.insert(file.number);
                    }
                }
                true
            }
            None => false,
        });
        for files in &self.current.files {
            for file in files {
                live.insert(file.number);
            }
        }
        live
    }

    /// Per-level file counts for the stats property, e.g. `[2, 5, 0, ...]`.
    pub fn level_summary(&self) -> String {
        format!(
            "files[ {} ]",
            self.current
                .files
                .iter()
                .map(|files| files.len().to_string())
                .join(" ")
        )
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(user: &[u8], seq: u64) -> InternalKey {
        InternalKey::new(user, seq, ValueType::Value)
    }

    fn file(number: u64, smallest: &[u8], largest: &[u8]) -> Arc<FileMetaData> {
        Arc::new(FileMetaData::new(
            number,
            1024,
            key(smallest, 5),
            key(largest, 1),
        ))
    }

    fn version_with(levels: Vec<(usize, Vec<Arc<FileMetaData>>)>) -> Version {
        let mut version = Version::new();
        for (level, files) in levels {
            version.files[level] = files;
        }
        version
    }

    #[test]
    fn find_file_binary_search() {
        let files = vec![
            file(1, b"a", b"c"),
            file(2, b"e", b"g"),
            file(3, b"i", b"k"),
        ];
        let probe = |user: &[u8]| find_file(&files, LookupKey::new(user, 1).internal_key());
        assert_eq!(probe(b"a"), 0);
        assert_eq!(probe(b"d"), 1);
        assert_eq!(probe(b"g"), 1);
        assert_eq!(probe(b"h"), 2);
        assert_eq!(probe(b"z"), 3);
    }

    #[test]
    fn overlap_checks() {
        let version = version_with(vec![
            (0, vec![file(4, b"m", b"s"), file(3, b"a", b"f")]),
            (1, vec![file(1, b"a", b"c"), file(2, b"e", b"g")]),
        ]);

        assert!(version.overlap_in_level(0, Some(b"d"), Some(b"e")));
        assert!(!version.overlap_in_level(0, Some(b"t"), Some(b"z")));
        assert!(version.overlap_in_level(1, Some(b"b"), Some(b"b")));
        assert!(!version.overlap_in_level(1, Some(b"d"), Some(b"d")));
        assert!(version.overlap_in_level(1, None, Some(b"a")));
        assert!(version.overlap_in_level(1, Some(b"g"), None));
        assert!(!version.overlap_in_level(1, Some(b"h"), None));
    }

    #[test]
    fn level0_overlapping_files_grow_range() {
        // Files overlap in a chain: pulling in one pulls in its neighbors.
        let version = version_with(vec![(
            0,
            vec![
                file(3, b"h", b"m"),
                file(2, b"d", b"i"),
                file(1, b"a", b"e"),
            ],
        )]);

        let inputs = version.overlapping_files(0, Some(b"h"), Some(b"h"));
        let numbers: HashSet<u64> = inputs.iter().map(|f| f.number).collect();
        assert_eq!(numbers, HashSet::from([1, 2, 3]));
    }

    #[test]
    fn overlapping_files_disjoint_level() {
        let version = version_with(vec![(
            1,
            vec![
                file(1, b"a", b"c"),
                file(2, b"e", b"g"),
                file(3, b"i", b"k"),
            ],
        )]);

        let inputs = version.overlapping_files(1, Some(b"f"), Some(b"j"));
        let numbers: Vec<u64> = inputs.iter().map(|f| f.number).collect();
        assert_eq!(numbers, vec![2, 3]);

        assert!(version.overlapping_files(1, Some(b"x"), Some(b"z")).is_empty());
        assert_eq!(version.overlapping_files(1, None, None).len(), 3);
    }

    #[test]
    fn finalize_scores_level0_by_count() {
        let options = Options::default();
        let mut version = version_with(vec![(
            0,
            (0..8).map(|i| file(i + 1, b"a", b"z")).collect(),
        )]);
        version.finalize(&options);
        assert_eq!(version.compaction_level, 0);
        assert!(version.compaction_score >= 2.0);
    }

    #[test]
    fn memtable_output_pushed_past_empty_levels() {
        let options = Options::default();
        let version = version_with(vec![]);
        // Nothing anywhere: push to the max memtable compact level.
        assert_eq!(
            version.pick_level_for_memtable_output(&options, b"a", b"b"),
            crate::config::MAX_MEM_COMPACT_LEVEL
        );

        // Overlap at level 0 pins the file to level 0.
        let version = version_with(vec![(0, vec![file(1, b"a", b"z")])]);
        assert_eq!(
            version.pick_level_for_memtable_output(&options, b"b", b"c"),
            0
        );

        // Overlap at level 1 stops the push at level 0.
        let version = version_with(vec![(1, vec![file(1, b"a", b"z")])]);
        assert_eq!(
            version.pick_level_for_memtable_output(&options, b"b", b"c"),
            0
        );
    }

    #[test]
    fn builder_applies_adds_and_deletes() {
        let options = Options::default();
        let base = version_with(vec![(1, vec![file(1, b"a", b"c"), file(2, b"e", b"g")])]);

        let mut edit = VersionEdit::new();
        edit.delete_file(1, 1);
        edit.add_file(1, 3, 2048, key(b"h", 9), key(b"k", 2));

        let mut pointers: Vec<Option<InternalKey>> = (0..NUM_LEVELS).map(|_| None).collect();
        let mut builder = Builder::new(Arc::new(base));
        builder.apply(&edit, &mut pointers);
        let version = builder.save_to(&options);

        let numbers: Vec<u64> = version.files[1].iter().map(|f| f.number).collect();
        assert_eq!(numbers, vec![2, 3]);
        version.check_invariants().unwrap();
    }

    #[test]
    fn builder_orders_level0_newest_first() {
        let options = Options::default();
        let mut edit = VersionEdit::new();
        edit.add_file(0, 5, 100, key(b"a", 1), key(b"c", 1));
        edit.add_file(0, 9, 100, key(b"b", 2), key(b"d", 2));
        edit.add_file(0, 7, 100, key(b"a", 3), key(b"b", 3));

        let mut pointers: Vec<Option<InternalKey>> = (0..NUM_LEVELS).map(|_| None).collect();
        let mut builder = Builder::new(Arc::new(Version::new()));
        builder.apply(&edit, &mut pointers);
        let version = builder.save_to(&options);

        let numbers: Vec<u64> = version.files[0].iter().map(|f| f.number).collect();
        assert_eq!(numbers, vec![9, 7, 5]);
    }

    #[test]
    fn invariant_rejects_overlap_above_level0() {
        let version = version_with(vec![(1, vec![file(1, b"a", b"f"), file(2, b"e", b"g")])]);
        assert!(version.check_invariants().is_err());
    }

    #[test]
    fn version_set_roundtrips_through_manifest() {
        let dir = crate::tmpfs::TempDir::new().expect("temp dir");
        let options = Options::default().create_if_missing(true);

        {
            let mut vset = VersionSet::new(dir.path().to_path_buf(), options.clone());
            vset.manifest_file_number = vset.new_file_number();
            vset.last_sequence = 77;

            let mut edit = VersionEdit::new();
            edit.set_log_number(5);
            edit.add_file(2, 10, 4096, key(b"aa", 6), key(b"zz", 3));
            vset.log_and_apply(&mut edit).expect("apply");
        }

        let mut recovered = VersionSet::new(dir.path().to_path_buf(), options);
        let save_manifest = recovered.recover().expect("recover");
        assert!(save_manifest);
        assert_eq!(recovered.last_sequence, 77);
        assert_eq!(recovered.log_number, 5);
        assert_eq!(recovered.num_level_files(2), 1);
        assert_eq!(recovered.current().files[2][0].number, 10);
    }

    #[test]
    fn live_files_tracks_pinned_versions() {
        let dir = crate::tmpfs::TempDir::new().expect("temp dir");
        let options = Options::default();
        let mut vset = VersionSet::new(dir.path().to_path_buf(), options);
        vset.manifest_file_number = vset.new_file_number();

        let mut edit = VersionEdit::new();
        edit.add_file(1, 10, 100, key(b"a", 1), key(b"b", 1));
        vset.log_and_apply(&mut edit).expect("apply");

        // Pin the version holding file 10, then delete the file.
        let pinned = vset.current();
        let mut edit = VersionEdit::new();
        edit.delete_file(1, 10);
        edit.add_file(1, 11, 100, key(b"a", 2), key(b"b", 2));
        vset.log_and_apply(&mut edit).expect("apply");

        let live = vset.live_files();
        assert!(live.contains(&10), "pinned version keeps file 10 live");
        assert!(live.contains(&11));

        drop(pinned);
        let live = vset.live_files();
        assert!(!live.contains(&10));
        assert!(live.contains(&11));
    }
}
