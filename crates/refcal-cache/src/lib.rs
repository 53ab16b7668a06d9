//! On-disk mapping cache: layout, loader, locking, downloads and synchronization.

mod checksum;
mod download;
mod error;
mod layout;
mod loader;
mod lock;
mod sync;

#[cfg(test)]
mod testing;

pub use checksum::rewrite_checksum;
pub use download::{DirectoryMirror, Downloader, HttpDownloader};
pub use error::{CacheError, DownloadError};
pub use layout::{install_file, CacheLayout};
pub use loader::{MappingCache, MappingSource};
pub use lock::CacheLock;
pub use sync::{CacheSynchronizer, SyncFailure, SyncOptions, SyncReport};
