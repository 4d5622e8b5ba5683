//! File naming within the database directory.
//!
//! ```text
//! CURRENT          one text line naming the live manifest
//! MANIFEST-<n>     framed log of version edits
//! <n>.log          write-ahead log
//! <n>.sst          immutable sorted table
//! <n>.dbtmp        scratch file, renamed into place or deleted
//! LOCK             flock'd lock file
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Log,
    Table,
    Manifest,
    Current,
    Lock,
    Temp,
}

pub fn log_file(dir: &Path, number: u64) -> PathBuf {
    dir.join(format!("{number:06}.log"))
}

pub fn table_file(dir: &Path, number: u64) -> PathBuf {
    dir.join(format!("{number:06}.sst"))
}

pub fn manifest_file(dir: &Path, number: u64) -> PathBuf {
    dir.join(format!("MANIFEST-{number:06}"))
}

pub fn temp_file(dir: &Path, number: u64) -> PathBuf {
    dir.join(format!("{number:06}.dbtmp"))
}

pub fn current_file(dir: &Path) -> PathBuf {
    dir.join("CURRENT")
}

pub fn lock_file(dir: &Path) -> PathBuf {
    dir.join("LOCK")
}

/// Classifies a directory entry name. Returns None for foreign files, which
/// obsolete-file deletion leaves untouched.
pub fn parse_file_name(name: &str) -> Option<(FileType, u64)> {
    if name == "CURRENT" {
        return Some((FileType::Current, 0));
    }
    if name == "LOCK" {
        return Some((FileType::Lock, 0));
    }
    if let Some(rest) = name.strip_prefix("MANIFEST-") {
        let number = rest.parse::<u64>().ok()?;
        return Some((FileType::Manifest, number));
    }
    if let Some(stem) = name.strip_suffix(".log") {
        let number = stem.parse::<u64>().ok()?;
        return Some((FileType::Log, number));
    }
    if let Some(stem) = name.strip_suffix(".sst") {
        let number = stem.parse::<u64>().ok()?;
        return Some((FileType::Table, number));
    }
    if let Some(stem) = name.strip_suffix(".dbtmp") {
        let number = stem.parse::<u64>().ok()?;
        return Some((FileType::Temp, number));
    }
    None
}

/// Points CURRENT at the named manifest, atomically via a temp file.
pub fn set_current_file(dir: &Path, manifest_number: u64) -> Result<()> {
    let tmp = temp_file(dir, manifest_number);
    let contents = format!("MANIFEST-{manifest_number:06}\n");

    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&tmp)?;
    file.write_all(contents.as_bytes())?;
    file.sync_all()?;
    drop(file);

    fs::rename(&tmp, current_file(dir))?;
    sync_dir(dir)?;
    Ok(())
}

/// Reads the manifest name out of CURRENT.
pub fn read_current_file(dir: &Path) -> Result<String> {
    let contents = fs::read_to_string(current_file(dir))?;
    let name = contents.trim_end_matches('\n');
    if name.is_empty() || contents == name {
        return Err(crate::corruption!("CURRENT file malformed"));
    }
    Ok(name.to_string())
}

/// Fsyncs the directory so renames within it are durable.
pub fn sync_dir(dir: &Path) -> Result<()> {
    let handle = File::open(dir)?;
    handle.sync_all()?;
    Ok(())
}
