use std::fs;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::time::Duration;

use refcal_core::is_plain_file_name;
use tracing::debug;

use crate::error::DownloadError;
use crate::layout::CacheLayout;

/// Channel the synchronizer fetches mappings and reference files through.
///
/// Retries and timeouts are the implementation's concern.
pub trait Downloader: Send + Sync {
    /// # Errors
    /// Returns [`DownloadError::NotFound`] when the origin has no such file, or
    /// [`DownloadError::Transfer`] for any other failure.
    fn fetch(&self, name: &str) -> Result<Vec<u8>, DownloadError>;

    /// Hex SHA-1 the origin publishes for `name`, if it publishes one.
    ///
    /// # Errors
    /// Returns [`DownloadError::Transfer`] when the checksum cannot be retrieved.
    fn expected_sha1(&self, name: &str) -> Result<Option<String>, DownloadError>;

    fn origin(&self) -> String;
}

fn transfer(name: &str, err: impl std::fmt::Display) -> DownloadError {
    DownloadError::Transfer { name: name.to_string(), message: err.to_string() }
}

/// Reads files from another cache root or from a flat directory.
///
/// A `<name>.sha1` file beside a reference file supplies its published checksum.
#[derive(Debug, Clone)]
pub struct DirectoryMirror {
    root: PathBuf,
}

impl DirectoryMirror {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn locate(&self, name: &str) -> Option<PathBuf> {
        if !is_plain_file_name(name) {
            return None;
        }
        let structured = CacheLayout::new(&self.root).path_for(name);
        [self.root.join(name), structured].into_iter().find(|path| path.is_file())
    }

    fn read(&self, path: &Path, name: &str) -> Result<Option<Vec<u8>>, DownloadError> {
        match fs::read(path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(transfer(name, err)),
        }
    }
}

impl Downloader for DirectoryMirror {
    fn fetch(&self, name: &str) -> Result<Vec<u8>, DownloadError> {
        let not_found =
            || DownloadError::NotFound { name: name.to_string(), origin: self.origin() };
        let path = self.locate(name).ok_or_else(not_found)?;
        debug!(file = name, path = %path.display(), "copying from mirror");
        self.read(&path, name)?.ok_or_else(not_found)
    }

    fn expected_sha1(&self, name: &str) -> Result<Option<String>, DownloadError> {
        let Some(path) = self.locate(name) else {
            return Ok(None);
        };
        let mut sidecar = path.into_os_string();
        sidecar.push(".sha1");
        Ok(self
            .read(Path::new(&sidecar), name)?
            .map(|bytes| String::from_utf8_lossy(&bytes).trim().to_ascii_lowercase()))
    }

    fn origin(&self) -> String {
        self.root.display().to_string()
    }
}

/// Fetches `<base_url>/<name>` over HTTP; checksums come from `<base_url>/<name>.sha1`.
#[derive(Debug, Clone)]
pub struct HttpDownloader {
    base_url: String,
    agent: ureq::Agent,
}

impl HttpDownloader {
    #[must_use]
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Self { base_url: base_url.trim_end_matches('/').to_string(), agent }
    }

    fn get(&self, name: &str) -> Result<Option<Vec<u8>>, DownloadError> {
        if !is_plain_file_name(name) {
            return Err(transfer(name, "not a plain file name"));
        }
        let url = format!("{}/{name}", self.base_url);
        let response = match self.agent.get(&url).call() {
            Ok(response) => response,
            Err(ureq::Error::Status(404, _)) => return Ok(None),
            Err(err) => return Err(transfer(name, err)),
        };
        let mut bytes = Vec::new();
        response
            .into_reader()
            .read_to_end(&mut bytes)
            .map_err(|err| transfer(name, err))?;
        debug!(url, bytes = bytes.len(), "downloaded");
        Ok(Some(bytes))
    }
}

impl Downloader for HttpDownloader {
    fn fetch(&self, name: &str) -> Result<Vec<u8>, DownloadError> {
        self.get(name)?.ok_or_else(|| DownloadError::NotFound {
            name: name.to_string(),
            origin: self.origin(),
        })
    }

    fn expected_sha1(&self, name: &str) -> Result<Option<String>, DownloadError> {
        Ok(self
            .get(&format!("{name}.sha1"))?
            .map(|bytes| String::from_utf8_lossy(&bytes).trim().to_ascii_lowercase()))
    }

    fn origin(&self) -> String {
        self.base_url.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{self, Fixture};

    #[test]
    fn mirror_reads_flat_and_structured_roots() -> anyhow::Result<()> {
        let fixture = Fixture::standard()?;
        let flat = DirectoryMirror::new(fixture.mirror_path());
        assert_eq!(flat.fetch("hrc_bia.fits")?, testing::reference_bytes("hrc_bia.fits"));

        let structured = DirectoryMirror::new(fixture.installed()?.root());
        assert!(!structured.fetch(testing::CONTEXT)?.is_empty());
        assert!(matches!(structured.fetch("absent.fits"), Err(DownloadError::NotFound { .. })));
        Ok(())
    }

    #[test]
    fn mirror_publishes_sidecar_checksums() -> anyhow::Result<()> {
        let fixture = Fixture::standard()?;
        fs::write(fixture.mirror_path().join("hrc_bia.fits.sha1"), "ABCDEF\n")?;
        let mirror = DirectoryMirror::new(fixture.mirror_path());
        assert_eq!(mirror.expected_sha1("hrc_bia.fits")?, Some("abcdef".to_string()));
        assert_eq!(mirror.expected_sha1("wfc_2002_bia.fits")?, None);
        Ok(())
    }

    #[test]
    fn mirror_never_reads_outside_its_root() -> anyhow::Result<()> {
        let fixture = Fixture::standard()?;
        let nested = fixture.mirror_path().join("nested");
        fs::create_dir(&nested)?;
        let mirror = DirectoryMirror::new(&nested);
        let escaping = "../hrc_bia.fits";
        assert!(fixture.mirror_path().join("hrc_bia.fits").is_file());
        assert!(matches!(mirror.fetch(escaping), Err(DownloadError::NotFound { .. })));
        assert_eq!(mirror.expected_sha1(escaping)?, None);

        let http = HttpDownloader::new("http://127.0.0.1:9/refcal", Duration::from_millis(200));
        let Err(DownloadError::Transfer { message, .. }) = http.fetch(escaping) else {
            panic!("path-like names should be refused before any request");
        };
        assert_eq!(message, "not a plain file name");
        Ok(())
    }

    #[test]
    fn unreachable_server_is_a_transfer_error() {
        let downloader =
            HttpDownloader::new("http://127.0.0.1:9/refcal/", Duration::from_millis(200));
        assert_eq!(downloader.origin(), "http://127.0.0.1:9/refcal");
        assert!(matches!(downloader.fetch("hst_0001.pmap"), Err(DownloadError::Transfer { .. })));
    }
}
