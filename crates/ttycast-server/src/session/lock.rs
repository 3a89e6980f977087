//! Lock artifacts asserting "a worker for user X is running".
//!
//! A lock is a file `<username>:<basename>.lock` in the game's lock dir whose
//! first three lines are the worker PID and the terminal geometry. The live
//! owner holds an exclusive `flock(2)` on it for the worker's whole lifetime.
//! Locks left behind by a crashed broker are found by scanning the dir.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use ttycast_core::{CastError, CastResult};

/// Name of the lock file for one session.
pub fn lock_file_name(username: &str, basename: &str) -> String {
    format!("{username}:{basename}.lock")
}

/// Find an existing lock for `username`, if any.
pub fn find_lock(dir: &Path, username: &str) -> io::Result<Option<PathBuf>> {
    let prefix = format!("{username}:");
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with(&prefix) && name.ends_with(".lock") {
            return Ok(Some(entry.path()));
        }
    }
    Ok(None)
}

/// PID recorded on the first line of a lock, or `None` if it is not a
/// valid PID.
pub fn read_lock_pid(path: &Path) -> io::Result<Option<i32>> {
    let content = std::fs::read_to_string(path)?;
    Ok(content
        .lines()
        .next()
        .and_then(|line| line.trim().parse::<i32>().ok())
        .filter(|pid| *pid > 0))
}

/// Remove a stale lock. Removing one that is already gone is not an error.
pub fn remove_stale_lock(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            debug!(path = %path.display(), "stale lock removed");
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// A lock held by this broker for a live worker.
pub struct LockArtifact {
    path: PathBuf,
    file: Option<File>,
}

impl LockArtifact {
    /// Create and lock `<dir>/<username>:<basename>.lock`.
    pub fn create(
        dir: &Path,
        username: &str,
        basename: &str,
        pid: u32,
        rows: u16,
        cols: u16,
    ) -> CastResult<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(lock_file_name(username, basename));
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| CastError::Lock(format!("failed to open {}: {e}", path.display())))?;

        // SAFETY: flock is safe to call with a valid file descriptor
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            return Err(CastError::Lock(format!(
                "{} is locked by another process",
                path.display()
            )));
        }

        file.set_len(0)
            .and_then(|_| write!(file, "{pid}\n{rows}\n{cols}\n"))
            .and_then(|_| file.flush())
            .map_err(|e| CastError::Lock(format!("failed to write {}: {e}", path.display())))?;

        debug!(path = %path.display(), pid, "lock created");
        Ok(Self {
            path,
            file: Some(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_held(&self) -> bool {
        self.file.is_some()
    }

    /// Unlock and delete the lock. A second call does nothing.
    pub fn release(&mut self) {
        let Some(file) = self.file.take() else {
            return;
        };
        // SAFETY: flock is safe to call with a valid file descriptor
        unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_UN) };
        drop(file);
        if let Err(e) = remove_stale_lock(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to remove lock");
        }
    }
}

impl Drop for LockArtifact {
    fn drop(&mut self) {
        self.release();
    }
}
