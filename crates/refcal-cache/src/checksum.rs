use std::fs;
use std::path::Path;

use refcal_core::{MappingDocument, MappingError, ParseOptions};
use tracing::info;

use crate::error::CacheError;
use crate::layout::{install_file, CacheLayout};
use crate::lock::CacheLock;

/// Re-render a hand-edited mapping in canonical form with a fresh `sha1sum`.
///
/// The file is replaced in place under the cache lock of `layout`. Returns the new
/// checksum.
///
/// # Errors
/// Returns an error when the file cannot be read or replaced, or when its contents
/// are not a well-formed mapping.
pub fn rewrite_checksum(layout: &CacheLayout, path: &Path) -> Result<String, CacheError> {
    let _lock = CacheLock::acquire(layout)?;
    let bytes = fs::read(path).map_err(|err| CacheError::io(path, err))?;
    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| MappingError::InvalidName(path.display().to_string()))?;
    let document = MappingDocument::parse_named(name, &bytes, ParseOptions::unverified())?;
    install_file(path, document.serialize().as_bytes())?;
    let checksum = document.checksum();
    info!(mapping = name, checksum = %checksum, "rewrote mapping checksum");
    Ok(checksum)
}
