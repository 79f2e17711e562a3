//! Advisory write lock held for the lifetime of a writable store.

use crate::error::{Result, TimeIndexError};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Exclusive advisory lock on one of the store's files.
///
/// The lock is released on [`WriteLock::release`] or when dropped.
#[derive(Debug)]
pub(crate) struct WriteLock {
    file: File,
    path: PathBuf,
    released: bool,
}

impl WriteLock {
    /// Locks `path` without waiting. The file is created if missing.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyWriteLocked` if another handle holds the lock.
    pub(crate) fn acquire(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)?;

        if let Err(e) = file.try_lock_exclusive() {
            if is_contended(&e) {
                return Err(TimeIndexError::AlreadyWriteLocked(path.to_path_buf()));
            }
            return Err(e.into());
        }
        debug!("Acquired write lock on {}", path.display());

        Ok(Self {
            file,
            path: path.to_path_buf(),
            released: false,
        })
    }

    /// Releases the lock.
    pub(crate) fn release(mut self) -> Result<()> {
        self.released = true;
        FileExt::unlock(&self.file)?;
        debug!("Released write lock on {}", self.path.display());
        Ok(())
    }
}

impl Drop for WriteLock {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = FileExt::unlock(&self.file) {
                warn!("Failed to release write lock on {}: {:?}", self.path.display(), e);
            }
        }
    }
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}
