//! Exclusive lock on the database directory.
//!
//! A held `FileLock` means this process owns the database; a second open
//! of the same directory fails instead of corrupting shared state. The
//! lock is advisory (`flock` on Unix) and tied to the file descriptor, so
//! dropping the guard is what releases it. The LOCK file itself is left
//! behind: deleting it would race a concurrent opener that has already
//! opened the path.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use crate::error::{Error, Result};

pub struct FileLock {
    _file: File,
}

impl FileLock {
    /// Acquires the lock, creating the file as needed. Fails immediately
    /// when another process holds it rather than waiting. The owning pid
    /// is written into the file so a stuck lock can be traced.
    pub fn acquire(path: &Path) -> Result<Self> {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .map_err(|e| Error::Io(format!("open lock file {}: {e}", path.display())))?;

        if let Err(e) = flock_exclusive(&file) {
            return Err(Error::Io(format!(
                "{} held by another process: {e}",
                path.display()
            )));
        }

        // Best effort; the lock is valid even if the pid note fails.
        let _ = writeln!(file, "{}", std::process::id());
        Ok(Self { _file: file })
    }
}

#[cfg(unix)]
fn flock_exclusive(file: &File) -> std::io::Result<()> {
    use std::os::unix::io::AsRawFd;

    match unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) } {
        0 => Ok(()),
        _ => Err(std::io::Error::last_os_error()),
    }
}

#[cfg(not(unix))]
fn flock_exclusive(_file: &File) -> std::io::Result<()> {
    // No advisory locking available; rely on the caller being the only
    // opener.
    Ok(())
}
