//! Single-pipeline process lock backed by a pid file.
//!
//! A lock file whose pid no longer refers to a live process is stale and is
//! reclaimed without complaint.

use crate::errors::LockError;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub struct ProcessLock {
    path: PathBuf,
    /// Open pid file carrying the advisory lock while held.
    file: Option<File>,
}

impl ProcessLock {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            file: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(path: &Path, source: std::io::Error) -> LockError {
        LockError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    /// Try to take the lock. Returns `Ok(false)` when a live process holds it.
    ///
    /// The pid file is held under an exclusive advisory lock for as long as
    /// the lock is owned, so two racing callers cannot both succeed.
    pub fn acquire(&mut self) -> Result<bool, LockError> {
        if self.file.is_some() {
            return Ok(true);
        }
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir).map_err(|e| Self::io_error(dir, e))?;
        }

        // A holder may unlink the file between our open and our lock; retry
        // against the fresh file in that case.
        for _ in 0..3 {
            let mut file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&self.path)
                .map_err(|e| Self::io_error(&self.path, e))?;
            if let Err(e) = file.try_lock_exclusive() {
                if e.kind() == fs2::lock_contended_error().kind() {
                    debug!(path = %self.path.display(), "lock file locked by another process");
                    return Ok(false);
                }
                return Err(Self::io_error(&self.path, e));
            }
            if !self.is_current(&file) {
                continue;
            }

            if let Some(pid) = self.holder() {
                if pid_alive(pid) {
                    debug!(pid, path = %self.path.display(), "lock held by live process");
                    return Ok(false);
                }
                debug!(pid, "reclaiming stale lock");
            }
            file.set_len(0)
                .and_then(|_| write!(file, "{}", std::process::id()))
                .and_then(|_| file.flush())
                .map_err(|e| Self::io_error(&self.path, e))?;
            self.file = Some(file);
            return Ok(true);
        }
        Ok(false)
    }

    /// Whether `file` is still the file at `path`.
    fn is_current(&self, file: &File) -> bool {
        match (file.metadata(), fs::metadata(&self.path)) {
            (Ok(open), Ok(named)) => open.dev() == named.dev() && open.ino() == named.ino(),
            _ => false,
        }
    }

    /// Release the lock if this instance holds it. A missing lock file is
    /// not an error.
    pub fn release(&mut self) -> Result<(), LockError> {
        let Some(file) = self.file.take() else {
            return Ok(());
        };
        // Unlink before unlocking so a waiter never locks a file that is
        // about to disappear.
        let removed = match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(Self::io_error(&self.path, source)),
        };
        drop(file);
        removed
    }

    /// Acquire the lock and hold it until the guard is dropped.
    pub fn guard(mut self) -> Result<LockGuard, LockError> {
        if self.acquire()? {
            Ok(LockGuard { lock: self })
        } else {
            Err(LockError::Held {
                pid: self.holder().unwrap_or_default(),
                path: self.path,
            })
        }
    }

    /// Pid recorded in the lock file, if it parses.
    pub fn holder(&self) -> Option<i32> {
        fs::read_to_string(&self.path)
            .ok()
            .and_then(|s| s.trim().parse::<i32>().ok())
            .filter(|pid| *pid > 0)
    }
}

/// Releases the process lock on drop.
pub struct LockGuard {
    lock: ProcessLock,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = self.lock.release() {
            warn!("Failed to release process lock: {}", e);
        }
    }
}

/// Zero-signal liveness probe. `EPERM` means the process exists.
pub fn pid_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    // SAFETY: signal 0 performs error checking only; nothing is delivered.
    let rc = unsafe { libc::kill(pid, 0) };
    if rc == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}
