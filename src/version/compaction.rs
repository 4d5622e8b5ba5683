//! Compaction selection.
//!
//! A compaction merges files from `level` and `level + 1` into new files at
//! `level + 1`. Candidates are either size-triggered (the level with the
//! highest score at or above 1.0) or seek-triggered (a file that exhausted
//! its seek budget); size takes precedence. Within a level, successive
//! compactions rotate across the key range via per-level compaction
//! pointers persisted in the manifest.

use std::cmp::Ordering;
use std::sync::Arc;

use super::{edit::VersionEdit, total_file_size, FileMetaData, Version, VersionSet};
use crate::config::NUM_LEVELS;
use crate::ikey::{self, InternalKey};

/// A planned compaction: inputs at two adjacent levels plus the overlapping
/// grandparent files used to bound output size.
pub struct Compaction {
    pub level: usize,
    /// inputs[0] from `level`, inputs[1] from `level + 1`.
    pub inputs: [Vec<Arc<FileMetaData>>; 2],
    /// Files at `level + 2` overlapping the input range.
    pub grandparents: Vec<Arc<FileMetaData>>,
    pub edit: VersionEdit,
    /// Version the inputs were chosen from, pinned for the duration.
    pub input_version: Arc<Version>,

    max_grandparent_overlap_bytes: u64,
    grandparent_index: usize,
    seen_key: bool,
    overlapped_bytes: u64,
    /// Per-level scan positions for `is_base_level_for_key`.
    level_ptrs: Vec<usize>,
}

impl Compaction {
    fn new(level: usize, input_version: Arc<Version>, max_grandparent_overlap_bytes: u64) -> Self {
        Self {
            level,
            inputs: [Vec::new(), Vec::new()],
            grandparents: Vec::new(),
            edit: VersionEdit::new(),
            input_version,
            max_grandparent_overlap_bytes,
            grandparent_index: 0,
            seen_key: false,
            overlapped_bytes: 0,
            level_ptrs: vec![0; NUM_LEVELS],
        }
    }

    pub fn num_input_files(&self, which: usize) -> usize {
        self.inputs[which].len()
    }

    /// A move: one input file, nothing to merge with, and little enough
    /// grandparent overlap that moving it down will not create an oversized
    /// future compaction. Recorded as a version edit alone, no rewriting.
    pub fn is_trivial_move(&self) -> bool {
        self.inputs[0].len() == 1
            && self.inputs[1].is_empty()
            && total_file_size(&self.grandparents) <= self.max_grandparent_overlap_bytes
    }

    /// Marks every input file deleted in the edit.
    pub fn add_input_deletions(&mut self) {
        let mut edit = std::mem::take(&mut self.edit);
        for which in 0..2 {
            for file in &self.inputs[which] {
                edit.delete_file(self.level + which, file.number);
            }
        }
        self.edit = edit;
    }

    /// True when no level deeper than the output level contains the user
    /// key. A tombstone at the output level can then be dropped: there is
    /// nothing older left to shadow. Callers must present keys in
    /// ascending order, which lets the per-level scan positions advance
    /// monotonically instead of binary searching every key.
    pub fn is_base_level_for_key(&mut self, user_key: &[u8]) -> bool {
        for level in (self.level + 2)..NUM_LEVELS {
            let files = &self.input_version.files[level];
            while self.level_ptrs[level] < files.len() {
                let file = &files[self.level_ptrs[level]];
                if user_key <= file.largest.user_key() {
                    if user_key >= file.smallest.user_key() {
                        return false;
                    }
                    break;
                }
                self.level_ptrs[level] += 1;
            }
        }
        true
    }

    /// Called for each output key: true when the current output file should
    /// be closed before adding the key, because the output's overlap with
    /// the grandparent level has grown past the bound. Keeps any single
    /// future compaction of the output bounded.
    pub fn should_stop_before(&mut self, internal_key: &[u8]) -> bool {
        while self.grandparent_index < self.grandparents.len()
            && ikey::compare(
                internal_key,
                self.grandparents[self.grandparent_index].largest.as_bytes(),
            ) == Ordering::Greater
        {
            if self.seen_key {
                self.overlapped_bytes += self.grandparents[self.grandparent_index].size;
            }
            self.grandparent_index += 1;
        }
        self.seen_key = true;

        if self.overlapped_bytes > self.max_grandparent_overlap_bytes {
            self.overlapped_bytes = 0;
            true
        } else {
            false
        }
    }

    /// Union user-key range of all inputs.
    pub fn input_range(&self) -> (Vec<u8>, Vec<u8>) {
        let (smallest, largest) = self.internal_range();
        (
            smallest.user_key().to_vec(),
            largest.user_key().to_vec(),
        )
    }

    fn internal_range(&self) -> (InternalKey, InternalKey) {
        let mut iter = self.inputs.iter().flatten();
        let first = iter.next().expect("compaction with no inputs");
        let mut smallest = first.smallest.clone();
        let mut largest = first.largest.clone();
        for file in iter {
            if file.smallest < smallest {
                smallest = file.smallest.clone();
            }
            if largest < file.largest {
                largest = file.largest.clone();
            }
        }
        (smallest, largest)
    }
}

impl VersionSet {
    /// Chooses the next compaction to run, or None when nothing needs
    /// compacting. Size-triggered candidates take precedence over
    /// seek-triggered ones.
    pub fn pick_compaction(&mut self) -> Option<Compaction> {
        let version = self.current();
        let max_overlap = self.options().max_grandparent_overlap_bytes();

        let size_compaction = version.compaction_score >= 1.0;
        let mut compaction = if size_compaction {
            let level = version.compaction_level;
            let mut c = Compaction::new(level, Arc::clone(&version), max_overlap);

            // Resume after the last compacted key at this level, wrapping
            // to the start when nothing is past the pointer.
            let pointer = self.compact_pointer[level].clone();
            let pick = version.files[level]
                .iter()
                .find(|f| match &pointer {
                    Some(p) => ikey::compare(f.largest.as_bytes(), p.as_bytes())
                        == Ordering::Greater,
                    None => true,
                })
                .or_else(|| version.files[level].first())?;
            c.inputs[0].push(Arc::clone(pick));
            c
        } else if let Some((level, file)) = self.file_to_compact.take() {
            // The charged file may have been compacted away since the
            // lookup that exhausted its budget.
            if !version.files[level].iter().any(|f| Arc::ptr_eq(f, &file)) {
                return None;
            }
            let mut c = Compaction::new(level, Arc::clone(&version), max_overlap);
            c.inputs[0].push(file);
            c
        } else {
            return None;
        };

        // Level-0 files overlap each other; widen to every overlapping one.
        if compaction.level == 0 {
            let (smallest, largest) = compaction.input_range();
            compaction.inputs[0] =
                version.overlapping_files(0, Some(&smallest), Some(&largest));
            debug_assert!(!compaction.inputs[0].is_empty());
        }

        self.setup_other_inputs(&mut compaction);
        Some(compaction)
    }

    /// Fills in the level+1 inputs, optionally widens the level inputs
    /// while that adds no level+1 work, and collects grandparents.
    fn setup_other_inputs(&mut self, c: &mut Compaction) {
        let version = Arc::clone(&c.input_version);
        let level = c.level;

        let (smallest, largest) = c.input_range();
        c.inputs[1] = version.overlapping_files(level + 1, Some(&smallest), Some(&largest));

        let (mut all_smallest, mut all_largest) = (smallest.clone(), largest.clone());
        if !c.inputs[1].is_empty() {
            let (s, l) = union_range(&c.inputs[0], &c.inputs[1]);
            all_smallest = s;
            all_largest = l;
        }

        // Try growing the level inputs over the combined range, as long as
        // that does not pull in more level+1 files and the expanded inputs
        // stay within the size limit.
        if !c.inputs[1].is_empty() {
            let expanded0 =
                version.overlapping_files(level, Some(&all_smallest), Some(&all_largest));
            let inputs1_size = total_file_size(&c.inputs[1]);
            let expanded0_size = total_file_size(&expanded0);
            if expanded0.len() > c.inputs[0].len()
                && inputs1_size + expanded0_size
                    < self.options().expanded_compaction_byte_size_limit()
            {
                let (new_smallest, new_largest) = user_key_range(&expanded0);
                let expanded1 =
                    version.overlapping_files(level + 1, Some(&new_smallest), Some(&new_largest));
                if expanded1.len() == c.inputs[1].len() {
                    tracing::debug!(
                        level,
                        from = c.inputs[0].len(),
                        to = expanded0.len(),
                        "expanding compaction inputs"
                    );
                    c.inputs[0] = expanded0;
                    c.inputs[1] = expanded1;
                    let (s, l) = union_range(&c.inputs[0], &c.inputs[1]);
                    all_smallest = s;
                    all_largest = l;
                }
            }
        }

        if level + 2 < NUM_LEVELS {
            c.grandparents =
                version.overlapping_files(level + 2, Some(&all_smallest), Some(&all_largest));
        }

        // Remember where this compaction ends so the next one at this level
        // starts past it. Recorded in the edit now, applied even if the
        // compaction itself fails, which just wastes one pointer advance.
        let largest_internal = c
            .inputs[0]
            .iter()
            .map(|f| f.largest.clone())
            .max()
            .expect("compaction has level inputs");
        self.compact_pointer[level] = Some(largest_internal.clone());
        c.edit.set_compact_pointer(level, largest_internal);
    }

    /// Plans one step of a manual range compaction at `level`. Caps the
    /// input set so a wide range compacts in several bounded steps; the
    /// caller loops until the range is covered.
    pub fn compact_range(
        &mut self,
        level: usize,
        begin: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Option<Compaction> {
        let version = self.current();
        let mut inputs = version.overlapping_files(level, begin, end);
        if inputs.is_empty() {
            return None;
        }

        // Bound one step's work above level 0, where files do not overlap.
        if level > 0 {
            let limit = self.options().max_file_size * 25;
            let mut total = 0u64;
            for (i, file) in inputs.iter().enumerate() {
                total += file.size;
                if total >= limit {
                    inputs.truncate(i + 1);
                    break;
                }
            }
        }

        let mut c = Compaction::new(
            level,
            version,
            self.options().max_grandparent_overlap_bytes(),
        );
        c.inputs[0] = inputs;
        self.setup_other_inputs(&mut c);
        Some(c)
    }
}

/// Smallest and largest user keys across two input sets.
fn union_range(a: &[Arc<FileMetaData>], b: &[Arc<FileMetaData>]) -> (Vec<u8>, Vec<u8>) {
    let all: Vec<Arc<FileMetaData>> = a.iter().chain(b.iter()).cloned().collect();
    user_key_range(&all)
}

fn user_key_range(files: &[Arc<FileMetaData>]) -> (Vec<u8>, Vec<u8>) {
    let mut iter = files.iter();
    let first = iter.next().expect("range of no files");
    let mut smallest = first.smallest.user_key().to_vec();
    let mut largest = first.largest.user_key().to_vec();
    for file in iter {
        if file.smallest.user_key() < smallest.as_slice() {
            smallest = file.smallest.user_key().to_vec();
        }
        if file.largest.user_key() > largest.as_slice() {
            largest = file.largest.user_key().to_vec();
        }
    }
    (smallest, largest)
}
