//! Scratch directories and files for tests.
//!
//! Everything lands under one per-crate root in /tmp. Names combine the
//! pid with a process-wide counter, so parallel test threads never
//! collide and reruns never inherit a previous run's state. Both guards
//! clean up on drop.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

const SCRATCH_ROOT: &str = "/tmp/cinderdb_tests";

/// Reserves a unique, not-yet-existing path under the scratch root.
fn fresh_path(kind: &str) -> std::io::Result<PathBuf> {
    static NEXT: AtomicU64 = AtomicU64::new(0);

    fs::create_dir_all(SCRATCH_ROOT)?;
    loop {
        let n = NEXT.fetch_add(1, Ordering::Relaxed);
        let path =
            PathBuf::from(SCRATCH_ROOT).join(format!("{kind}-{}-{n}", std::process::id()));
        // A leftover from a crashed run with a recycled pid is skipped,
        // not reused.
        if !path.exists() {
            return Ok(path);
        }
    }
}

/// A directory removed recursively on drop.
pub struct TempDir {
    path: PathBuf,
}

impl TempDir {
    pub fn new() -> std::io::Result<Self> {
        let path = fresh_path("dir")?;
        fs::create_dir(&path)?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.path);
    }
}

/// A file path removed on drop. The file itself comes into existence on
/// the first `reopen`.
pub struct NamedTempFile {
    path: PathBuf,
}

impl NamedTempFile {
    pub fn new() -> std::io::Result<Self> {
        Ok(Self {
            path: fresh_path("file")?,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Opens the file for reading and writing, creating it if absent and
    /// keeping existing contents.
    pub fn reopen(&self) -> std::io::Result<File> {
        File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
    }
}

impl Drop for NamedTempFile {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}
