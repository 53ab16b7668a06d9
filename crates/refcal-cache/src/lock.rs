use std::fs::{self, File, OpenOptions};
use std::path::PathBuf;

use fs2::FileExt;
use tracing::debug;

use crate::error::CacheError;
use crate::layout::CacheLayout;

/// Exclusive advisory lock on `<root>/.refcal.lock`, released on drop.
///
/// Every acquisition opens a fresh handle, so the lock also serializes threads of
/// one process. It is not re-entrant: acquiring it twice on one thread blocks.
#[derive(Debug)]
pub struct CacheLock {
    file: File,
    path: PathBuf,
}

impl CacheLock {
    /// Block until the cache lock is held.
    ///
    /// # Errors
    /// Returns [`CacheError::Lock`] when the lock file cannot be opened or locked.
    pub fn acquire(layout: &CacheLayout) -> Result<Self, CacheError> {
        let path = layout.lock_path();
        fs::create_dir_all(layout.root()).map_err(|err| CacheError::io(layout.root(), err))?;
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|source| CacheError::Lock { path: path.clone(), source })?;
        file.lock_exclusive().map_err(|source| CacheError::Lock { path: path.clone(), source })?;
        debug!(path = %path.display(), "acquired cache lock");
        Ok(Self { file, path })
    }
}

impl Drop for CacheLock {
    fn drop(&mut self) {
        if let Err(err) = FileExt::unlock(&self.file) {
            debug!(path = %self.path.display(), error = %err, "cache lock release failed");
        }
    }
}
