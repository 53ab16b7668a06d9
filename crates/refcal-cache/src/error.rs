use std::path::PathBuf;

use refcal_core::MappingError;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error(transparent)]
    Mapping(#[from] MappingError),
    #[error("mapping {0} is not in the cache")]
    NotFound(String),
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to acquire cache lock {}: {source}", path.display())]
    Lock {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid cache state file {}: {message}", path.display())]
    State { path: PathBuf, message: String },
    #[error("refusing to install {0}: not a plain file name")]
    UnsafeName(String),
    #[error(transparent)]
    Download(#[from] DownloadError),
}

impl CacheError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io { path: path.into(), source }
    }

    /// Name of the mapping a parse or integrity failure concerns.
    #[must_use]
    pub fn mapping_name(&self) -> Option<&str> {
        match self {
            Self::Mapping(
                MappingError::Format { mapping, .. }
                | MappingError::Checksum { mapping, .. }
                | MappingError::MissingHeaderKey { mapping, .. }
                | MappingError::InconsistentParkey { mapping, .. }
                | MappingError::DuplicateSelectorKey { mapping, .. },
            ) => Some(mapping),
            Self::Mapping(MappingError::InvalidName(name)) | Self::NotFound(name) => Some(name),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum DownloadError {
    #[error("{name} is not available from {origin}")]
    NotFound { name: String, origin: String },
    #[error("transfer of {name} failed: {message}")]
    Transfer { name: String, message: String },
    #[error("{name} failed verification: expected sha1 {expected}, got {actual}")]
    Checksum { name: String, expected: String, actual: String },
}
