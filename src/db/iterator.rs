//! Merging and scan iterators.
//!
//! `MergeIterator` merges N sorted internal-key streams with a min-heap,
//! yielding every entry in internal-key order; ties break toward the
//! lower source index, so callers list newer sources first. It performs no
//! deduplication: for a scan the wrapping `ScanIterator` collapses entries
//! per user key, and for compaction the drop rules need to see every
//! entry.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::ops::Bound;
use std::sync::Arc;

use crate::cache::TableCache;
use crate::config::ReadOptions;
use crate::error::Result;
use crate::ikey::{self, ValueType};
use crate::version::FileMetaData;

/// A sorted stream of `(internal key, value)` entries.
pub type InternalIterator = Box<dyn Iterator<Item = Result<(Vec<u8>, Vec<u8>)>> + Send>;

struct HeapEntry {
    key: Vec<u8>,
    value: Vec<u8>,
    source: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed for min-heap behavior; equal keys yield the lower
        // (newer) source first.
        match ikey::compare(&self.key, &other.key) {
            Ordering::Equal => other.source.cmp(&self.source),
            ord => ord.reverse(),
        }
    }
}

/// Merges sorted internal-key iterators into one ascending stream.
pub struct MergeIterator {
    sources: Vec<InternalIterator>,
    heap: BinaryHeap<HeapEntry>,
    error: Option<crate::Error>,
}

impl MergeIterator {
    pub fn new(mut sources: Vec<InternalIterator>) -> Self {
        let mut heap = BinaryHeap::new();
        let mut error = None;

        for (source, iter) in sources.iter_mut().enumerate() {
            match iter.next() {
                Some(Ok((key, value))) => heap.push(HeapEntry { key, value, source }),
                Some(Err(e)) => {
                    error = Some(e);
                    break;
                }
                None => {}
            }
        }
        Self {
            sources,
            heap,
            error,
        }
    }
}

impl Iterator for MergeIterator {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(e) = self.error.take() {
            self.heap.clear();
            return Some(Err(e));
        }
        let entry = self.heap.pop()?;

        match self.sources[entry.source].next() {
            Some(Ok((key, value))) => self.heap.push(HeapEntry {
                key,
                value,
                source: entry.source,
            }),
            Some(Err(e)) => self.error = Some(e),
            None => {}
        }
        Some(Ok((entry.key, entry.value)))
    }
}

/// Concatenating iterator over the non-overlapping files of one level,
/// opening each table lazily through the table cache.
pub struct LevelFileIterator {
    cache: Arc<TableCache>,
    options: ReadOptions,
    files: Vec<Arc<FileMetaData>>,
    next_file: usize,
    current: Option<crate::sstable::table::TableIterator>,
    pending_seek: Option<Vec<u8>>,
    errored: bool,
}

impl LevelFileIterator {
    pub fn new(
        cache: Arc<TableCache>,
        options: ReadOptions,
        files: Vec<Arc<FileMetaData>>,
        start: Option<&[u8]>,
    ) -> Self {
        let next_file = match start {
            // First file that may hold keys >= start.
            Some(target) => files
                .iter()
                .position(|f| ikey::compare(f.largest.as_bytes(), target) != Ordering::Less)
                .unwrap_or(files.len()),
            None => 0,
        };
        Self {
            cache,
            options,
            files,
            next_file,
            current: None,
            pending_seek: start.map(|s| s.to_vec()),
            errored: false,
        }
    }

    fn advance_file(&mut self) -> Result<bool> {
        let Some(file) = self.files.get(self.next_file) else {
            return Ok(false);
        };
        let start = self.pending_seek.take();
        let iter = self
            .cache
            .iter(self.options, file.number, file.size, start.as_deref())?;
        self.current = Some(iter);
        self.next_file += 1;
        Ok(true)
    }
}

impl Iterator for LevelFileIterator {
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
            match self.advance_file() {
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

/// User-facing scan over a merged internal stream: pins a sequence, keeps
/// only each user key's newest visible entry, collapses tombstones, and
/// enforces the range bounds.
///
/// Holds the version its table sources came from, so the files stay
/// referenced (and undeleted) for the scan's lifetime.
pub struct ScanIterator {
    inner: MergeIterator,
    sequence: u64,
    /// User key to skip entirely (an excluded start bound).
    skip_user_key: Option<Vec<u8>>,
    end: Bound<Vec<u8>>,
    last_user_key: Option<Vec<u8>>,
    done: bool,
    _pinned_version: Option<Arc<crate::version::Version>>,
}

impl ScanIterator {
    pub fn new(
        inner: MergeIterator,
        sequence: u64,
        skip_user_key: Option<Vec<u8>>,
        end: Bound<Vec<u8>>,
    ) -> Self {
        Self {
            inner,
            sequence,
            skip_user_key,
            end,
            last_user_key: None,
            done: false,
            _pinned_version: None,
        }
    }

    /// Keeps `version` alive for the iterator's lifetime.
    pub fn pin_version(mut self, version: Arc<crate::version::Version>) -> Self {
        self._pinned_version = Some(version);
        self
    }

    fn past_end(&self, user_key: &[u8]) -> bool {
        match &self.end {
            Bound::Included(end) => user_key > end.as_slice(),
            Bound::Excluded(end) => user_key >= end.as_slice(),
            Bound::Unbounded => false,
        }
    }
}

impl Iterator for ScanIterator {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            let (key, value) = match self.inner.next()? {
                Ok(entry) => entry,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            };

            // Entries newer than the pinned sequence are invisible.
            if ikey::sequence(&key) > self.sequence {
                continue;
            }

            let user_key = ikey::user_key(&key);
            if self
                .last_user_key
                .as_deref()
                .map_or(false, |last| last == user_key)
            {
                // An older entry for a user key already decided.
                continue;
            }
            self.last_user_key = Some(user_key.to_vec());

            if self
                .skip_user_key
                .as_deref()
                .map_or(false, |skip| skip == user_key)
            {
                continue;
            }
            if self.past_end(user_key) {
                self.done = true;
                return None;
            }

            match ikey::value_type(&key) {
                Some(ValueType::Value) => {
                    return Some(Ok((user_key.to_vec(), value)));
                }
                // A tombstone decides its user key: nothing to yield, and
                // older entries are skipped by the last_user_key check.
                Some(ValueType::Deletion) => continue,
                None => {
                    self.done = true;
                    return Some(Err(crate::corruption!("unknown value tag in scan")));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MAX_SEQUENCE;
    use crate::ikey::ValueType;

    fn entry(user: &[u8], seq: u64, t: ValueType, value: &[u8]) -> (Vec<u8>, Vec<u8>) {
        let mut key = Vec::new();
        ikey::append_internal_key(&mut key, user, seq, t);
        (key, value.to_vec())
    }

    fn source(entries: Vec<(Vec<u8>, Vec<u8>)>) -> InternalIterator {
        Box::new(entries.into_iter().map(Ok))
    }

    #[test]
    fn merge_interleaves_sources() {
        let a = source(vec![
            entry(b"a", 1, ValueType::Value, b"1"),
            entry(b"c", 1, ValueType::Value, b"3"),
        ]);
        let b = source(vec![
            entry(b"b", 1, ValueType::Value, b"2"),
            entry(b"d", 1, ValueType::Value, b"4"),
        ]);

        let merged: Vec<_> = MergeIterator::new(vec![a, b])
            .map(|e| e.unwrap())
            .map(|(k, _)| ikey::user_key(&k).to_vec())
            .collect();
        assert_eq!(
            merged,
            vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec()]
        );
    }

    #[test]
    fn merge_orders_same_user_key_by_sequence() {
        let newer = source(vec![entry(b"k", 9, ValueType::Value, b"new")]);
        let older = source(vec![entry(b"k", 2, ValueType::Value, b"old")]);

        let merged: Vec<_> = MergeIterator::new(vec![older, newer])
            .map(|e| e.unwrap())
            .collect();
        assert_eq!(ikey::sequence(&merged[0].0), 9);
        assert_eq!(ikey::sequence(&merged[1].0), 2);
    }

    #[test]
    fn merge_yields_every_duplicate() {
        let a = source(vec![entry(b"k", 5, ValueType::Value, b"a")]);
        let b = source(vec![entry(b"k", 5, ValueType::Value, b"b")]);
        assert_eq!(MergeIterator::new(vec![a, b]).count(), 2);
    }

    fn scan(
        entries: Vec<Vec<(Vec<u8>, Vec<u8>)>>,
        sequence: u64,
        end: Bound<Vec<u8>>,
    ) -> Vec<(Vec<u8>, Vec<u8>)> {
        let sources = entries.into_iter().map(source).collect();
        ScanIterator::new(MergeIterator::new(sources), sequence, None, end)
            .map(|e| e.unwrap())
            .collect()
    }

    #[test]
    fn scan_newest_visible_entry_wins() {
        let results = scan(
            vec![vec![
                entry(b"k", 9, ValueType::Value, b"v9"),
                entry(b"k", 5, ValueType::Value, b"v5"),
                entry(b"k", 1, ValueType::Value, b"v1"),
            ]],
            MAX_SEQUENCE,
            Bound::Unbounded,
        );
        assert_eq!(results, vec![(b"k".to_vec(), b"v9".to_vec())]);
    }

    #[test]
    fn scan_respects_snapshot() {
        let results = scan(
            vec![vec![
                entry(b"k", 9, ValueType::Value, b"v9"),
                entry(b"k", 5, ValueType::Value, b"v5"),
            ]],
            6,
            Bound::Unbounded,
        );
        assert_eq!(results, vec![(b"k".to_vec(), b"v5".to_vec())]);
    }

    #[test]
    fn scan_collapses_tombstones() {
        let results = scan(
            vec![vec![
                entry(b"a", 3, ValueType::Value, b"alive"),
                entry(b"b", 9, ValueType::Deletion, b""),
                entry(b"b", 5, ValueType::Value, b"dead"),
                entry(b"c", 2, ValueType::Value, b"alive"),
            ]],
            MAX_SEQUENCE,
            Bound::Unbounded,
        );
        assert_eq!(
            results,
            vec![
                (b"a".to_vec(), b"alive".to_vec()),
                (b"c".to_vec(), b"alive".to_vec()),
            ]
        );
    }

    #[test]
    fn scan_deleted_key_visible_at_older_snapshot() {
        let entries = vec![vec![
            entry(b"b", 9, ValueType::Deletion, b""),
            entry(b"b", 5, ValueType::Value, b"v5"),
        ]];
        assert_eq!(
            scan(entries.clone(), 7, Bound::Unbounded),
            vec![(b"b".to_vec(), b"v5".to_vec())]
        );
        assert_eq!(scan(entries, MAX_SEQUENCE, Bound::Unbounded), vec![]);
    }

    #[test]
    fn scan_enforces_end_bound() {
        let entries = vec![vec![
            entry(b"a", 1, ValueType::Value, b"1"),
            entry(b"b", 1, ValueType::Value, b"2"),
            entry(b"c", 1, ValueType::Value, b"3"),
        ]];
        let results = scan(entries.clone(), MAX_SEQUENCE, Bound::Excluded(b"c".to_vec()));
        assert_eq!(results.len(), 2);
        let results = scan(entries, MAX_SEQUENCE, Bound::Included(b"b".to_vec()));
        assert_eq!(results.len(), 2);
    }

    #[test]
    fn scan_skips_excluded_start_key() {
        let sources = vec![source(vec![
            entry(b"a", 1, ValueType::Value, b"1"),
            entry(b"b", 1, ValueType::Value, b"2"),
        ])];
        let results: Vec<_> = ScanIterator::new(
            MergeIterator::new(sources),
            MAX_SEQUENCE,
            Some(b"a".to_vec()),
            Bound::Unbounded,
        )
        .map(|e| e.unwrap())
        .collect();
        assert_eq!(results, vec![(b"b".to_vec(), b"2".to_vec())]);
    }
}
