//! Last-resort maintenance: destroying a database and rebuilding a usable
//! manifest from whatever files survive.
//!
//! Repair ignores the manifest entirely: every WAL is converted into a
//! table, every readable table is re-registered at level 0 with bounds and
//! sequences recovered by scanning it, and a fresh manifest + CURRENT are
//! written. Unreadable tables are dropped. Level-0 ordering by file number
//! keeps newer data shadowing older data after repair.

use std::fs::{self, File};
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::batch::{WriteBatch, BATCH_HEADER_SIZE};
use crate::cache::TableCache;
use crate::config::{Options, ReadOptions};
use crate::error::Result;
use crate::flock::FileLock;
use crate::ikey::{self, InternalKey};
use crate::memtable::MemTable;
use crate::version::edit::VersionEdit;
use crate::wal::{LogReader, LogWriter};

use super::filename::{self, FileType};
use super::build_table;

/// Deletes every database file in `path` and, when nothing foreign
/// remains, the directory itself. A no-op for a missing directory.
pub fn destroy_db(path: impl AsRef<Path>, _options: &Options) -> Result<()> {
    let dir = path.as_ref();
    if !dir.exists() {
        return Ok(());
    }

    let lock = FileLock::acquire(&filename::lock_file(dir))?;

    let mut result: Result<()> = Ok(());
    for entry in fs::read_dir(dir)?.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some((file_type, _)) = filename::parse_file_name(name) else {
            continue;
        };
        if file_type == FileType::Lock {
            continue;
        }
        if let Err(e) = fs::remove_file(entry.path()) {
            if result.is_ok() {
                result = Err(e.into());
            }
        }
    }

    drop(lock);
    let _ = fs::remove_file(filename::lock_file(dir));
    let _ = fs::remove_dir(dir);
    result
}

/// Rebuilds a database that lost or corrupted its manifest. Best effort:
/// data in unreadable tables is dropped, everything else survives.
pub fn repair_db(path: impl AsRef<Path>, options: &Options) -> Result<()> {
    let dir = path.as_ref();
    let _lock = FileLock::acquire(&filename::lock_file(dir))?;

    let mut logs = Vec::new();
    let mut tables = Vec::new();
    let mut manifests = Vec::new();
    let mut max_number = 1u64;

    for entry in fs::read_dir(dir)?.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some((file_type, number)) = filename::parse_file_name(name) else {
            continue;
        };
        max_number = max_number.max(number);
        match file_type {
            FileType::Log => logs.push(number),
            FileType::Table => tables.push(number),
            FileType::Manifest => manifests.push(number),
            FileType::Temp => {
                let _ = fs::remove_file(entry.path());
            }
            FileType::Current | FileType::Lock => {}
        }
    }
    logs.sort_unstable();
    tables.sort_unstable();

    let mut next_number = max_number + 1;
    let cache = TableCache::new(dir.to_path_buf(), options.clone(), 16);
    let cache = Arc::new(cache);

    // Convert every WAL into a table so its writes survive.
    for &log_number in &logs {
        let number = next_number;
        next_number += 1;
        match convert_log_to_table(dir, options, &cache, log_number, number) {
            Ok(true) => tables.push(number),
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(log = log_number, error = %e, "dropping unreadable log")
            }
        }
        let _ = fs::remove_file(filename::log_file(dir, log_number));
    }

    // Scan every table for its bounds; drop the unreadable ones.
    let mut metas: Vec<(u64, u64, InternalKey, InternalKey)> = Vec::new();
    let mut max_sequence = 0u64;
    for &number in &tables {
        match scan_table(dir, &cache, number) {
            Ok((size, smallest, largest, table_max_seq)) => {
                max_sequence = max_sequence.max(table_max_seq);
                metas.push((number, size, smallest, largest));
            }
            Err(e) => {
                tracing::warn!(table = number, error = %e, "dropping unreadable table");
                cache.evict(number);
                let _ = fs::remove_file(filename::table_file(dir, number));
            }
        }
    }

    // Fresh manifest: every surviving table at level 0.
    let manifest_number = next_number;
    next_number += 1;

    let mut edit = VersionEdit::new();
    edit.set_log_number(next_number);
    edit.set_next_file_number(next_number + 1);
    edit.set_last_sequence(max_sequence);
    for (number, size, smallest, largest) in metas {
        edit.add_file(0, number, size, smallest, largest);
    }

    let manifest_path = filename::manifest_file(dir, manifest_number);
    let file = File::create(&manifest_path)?;
    let mut writer = LogWriter::new(file)?;
    let written = writer
        .add_record(&edit.encode())
        .and_then(|_| writer.sync())
        .and_then(|_| filename::set_current_file(dir, manifest_number));
    if written.is_err() {
        let _ = fs::remove_file(&manifest_path);
        return written;
    }

    for number in manifests {
        let _ = fs::remove_file(filename::manifest_file(dir, number));
    }

    tracing::info!(
        dir = %dir.display(),
        tables = edit.new_files.len(),
        last_sequence = max_sequence,
        "repaired database"
    );
    Ok(())
}

/// Replays one WAL into a memtable and flushes it as a table. Returns
/// false when the log held no complete records.
fn convert_log_to_table(
    dir: &Path,
    options: &Options,
    cache: &Arc<TableCache>,
    log_number: u64,
    table_number: u64,
) -> Result<bool> {
    let file = File::open(filename::log_file(dir, log_number))?;
    let mut reader = LogReader::new(file);
    let mem = Arc::new(MemTable::new());

    loop {
        match reader.read_record() {
            Ok(Some(record)) => {
                if record.len() < BATCH_HEADER_SIZE {
                    tracing::warn!(log = log_number, "short record; truncating");
                    break;
                }
                let batch = WriteBatch::from_contents(record)?;
                batch.insert_into(&mem)?;
            }
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(log = log_number, error = %e, "truncating log at corruption");
                break;
            }
        }
    }

    Ok(build_table(dir, options, cache, table_number, &mem)?.is_some())
}

/// Reads a whole table, returning its size, key bounds, and highest
/// sequence number.
fn scan_table(
    dir: &Path,
    cache: &Arc<TableCache>,
    number: u64,
) -> Result<(u64, InternalKey, InternalKey, u64)> {
    let size = fs::metadata(filename::table_file(dir, number))?.len();
    let read_options = ReadOptions {
        verify_checksums: true,
        fill_cache: false,
        snapshot: None,
    };

    let mut smallest: Option<Vec<u8>> = None;
    let mut largest: Vec<u8> = Vec::new();
    let mut max_sequence = 0u64;
    for entry in cache.iter(read_options, number, size, None)? {
        let (key, _) = entry?;
        if smallest.is_none() {
            smallest = Some(key.clone());
        }
        max_sequence = max_sequence.max(ikey::sequence(&key));
        largest = key;
    }

    let smallest = smallest.ok_or_else(|| crate::corruption!("table {number} is empty"))?;
    Ok((
        size,
        InternalKey::from_vec(smallest),
        InternalKey::from_vec(largest),
        max_sequence,
    ))
}
