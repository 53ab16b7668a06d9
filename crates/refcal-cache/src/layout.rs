use std::collections::BTreeSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use refcal_core::MappingName;
use tracing::debug;
use ulid::Ulid;

use crate::error::CacheError;

const COMPLETE_CONTEXTS_FILE: &str = "complete_contexts.json";
const LOCK_FILE: &str = ".refcal.lock";

/// Directory structure of a local cache:
///
/// ```text
/// <root>/mappings/<name>.{pmap,imap,rmap}
/// <root>/references/<name>
/// <root>/config/*.json
/// <root>/.refcal.lock
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheLayout {
    root: PathBuf,
}

impl CacheLayout {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn mappings_dir(&self) -> PathBuf {
        self.root.join("mappings")
    }

    #[must_use]
    pub fn references_dir(&self) -> PathBuf {
        self.root.join("references")
    }

    #[must_use]
    pub fn config_dir(&self) -> PathBuf {
        self.root.join("config")
    }

    #[must_use]
    pub fn lock_path(&self) -> PathBuf {
        self.root.join(LOCK_FILE)
    }

    #[must_use]
    pub fn mapping_path(&self, name: &str) -> PathBuf {
        self.mappings_dir().join(name)
    }

    #[must_use]
    pub fn reference_path(&self, name: &str) -> PathBuf {
        self.references_dir().join(name)
    }

    /// Mapping directory for mapping names, reference directory for anything else.
    #[must_use]
    pub fn path_for(&self, name: &str) -> PathBuf {
        if MappingName::parse(name).is_ok() {
            self.mapping_path(name)
        } else {
            self.reference_path(name)
        }
    }

    /// # Errors
    /// Returns [`CacheError::Io`] when a cache directory cannot be created.
    pub fn ensure_dirs(&self) -> Result<(), CacheError> {
        for dir in [self.mappings_dir(), self.references_dir(), self.config_dir()] {
            fs::create_dir_all(&dir).map_err(|err| CacheError::io(&dir, err))?;
        }
        Ok(())
    }

    /// # Errors
    /// Returns [`CacheError::Io`] when the mapping directory cannot be listed.
    pub fn list_mappings(&self) -> Result<BTreeSet<String>, CacheError> {
        list_files(&self.mappings_dir())
    }

    /// # Errors
    /// Returns [`CacheError::Io`] when the reference directory cannot be listed.
    pub fn list_references(&self) -> Result<BTreeSet<String>, CacheError> {
        list_files(&self.references_dir())
    }

    /// Contexts the synchronizer last recorded as fully present.
    ///
    /// # Errors
    /// Returns an error when the state file exists but cannot be read or parsed.
    pub fn read_complete_contexts(&self) -> Result<BTreeSet<String>, CacheError> {
        let path = self.config_dir().join(COMPLETE_CONTEXTS_FILE);
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(BTreeSet::new()),
            Err(err) => return Err(CacheError::io(&path, err)),
        };
        serde_json::from_slice(&raw)
            .map_err(|err| CacheError::State { path, message: err.to_string() })
    }

    /// # Errors
    /// Returns an error when the state file cannot be serialized or installed.
    pub fn write_complete_contexts(&self, contexts: &BTreeSet<String>) -> Result<(), CacheError> {
        let path = self.config_dir().join(COMPLETE_CONTEXTS_FILE);
        let json = serde_json::to_vec_pretty(contexts)
            .map_err(|err| CacheError::State { path: path.clone(), message: err.to_string() })?;
        install_file(&path, &json)
    }
}

fn list_files(dir: &Path) -> Result<BTreeSet<String>, CacheError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(BTreeSet::new()),
        Err(err) => return Err(CacheError::io(dir, err)),
    };
    let mut names = BTreeSet::new();
    for entry in entries {
        let entry = entry.map_err(|err| CacheError::io(dir, err))?;
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        if name.starts_with('.') || !entry.path().is_file() {
            continue;
        }
        names.insert(name);
    }
    Ok(names)
}

/// Write `bytes` to a uniquely named staging file beside `path`, then rename it
/// into place so readers only ever observe complete files.
///
/// # Errors
/// Returns [`CacheError::Io`] when the staging write or the rename fails.
pub fn install_file(path: &Path, bytes: &[u8]) -> Result<(), CacheError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir).map_err(|err| CacheError::io(dir, err))?;
    let file_name =
        path.file_name().map(|name| name.to_string_lossy().into_owned()).unwrap_or_default();
    let staging = dir.join(format!(".{file_name}.{}.part", Ulid::new()));

    fs::write(&staging, bytes).map_err(|err| CacheError::io(&staging, err))?;
    if let Err(err) = fs::rename(&staging, path) {
        let _ = fs::remove_file(&staging);
        return Err(CacheError::io(path, err));
    }
    debug!(path = %path.display(), bytes = bytes.len(), "installed cache file");
    Ok(())
}
