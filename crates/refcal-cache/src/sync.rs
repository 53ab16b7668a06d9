use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt::Display;
use std::fs;
use std::path::Path;

use refcal_core::{is_plain_file_name, MappingDocument, ParseOptions};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use tracing::{debug, info, warn};

use crate::download::Downloader;
use crate::error::{CacheError, DownloadError};
use crate::layout::{install_file, CacheLayout};
use crate::loader::{MappingCache, MappingSource};
use crate::lock::CacheLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(clippy::struct_excessive_bools)]
pub struct SyncOptions {
    /// Download reference files as well as mappings.
    pub fetch_references: bool,
    /// Re-check present reference files against the origin's published checksums.
    pub verify: bool,
    /// Remove cached mappings no synced context requires.
    pub purge_mappings: bool,
    /// Remove cached reference files no synced context requires.
    pub purge_references: bool,
    /// Report what would change without touching the cache.
    pub dry_run: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            fetch_references: true,
            verify: false,
            purge_mappings: false,
            purge_references: false,
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncFailure {
    pub name: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub dry_run: bool,
    pub downloaded: Vec<String>,
    pub failures: Vec<SyncFailure>,
    pub complete_contexts: Vec<String>,
    pub incomplete_contexts: Vec<String>,
    pub purged: Vec<String>,
}

impl SyncReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && self.incomplete_contexts.is_empty()
    }
}

fn sha1_hex(bytes: &[u8]) -> String {
    hex::encode(Sha1::digest(bytes))
}

fn file_sha1(path: &Path) -> Result<String, CacheError> {
    fs::read(path).map(|bytes| sha1_hex(&bytes)).map_err(|err| CacheError::io(path, err))
}

/// Mapping source that sees files fetched during a dry run before they would land on disk.
struct StagedSource {
    layout: CacheLayout,
    staged: HashMap<String, Vec<u8>>,
}

impl MappingSource for StagedSource {
    fn read(&self, name: &str) -> Result<Option<Vec<u8>>, CacheError> {
        match self.staged.get(name) {
            Some(bytes) => Ok(Some(bytes.clone())),
            None => self.layout.read(name),
        }
    }
}

/// Brings a local cache up to date with an origin, one context at a time.
pub struct CacheSynchronizer {
    layout: CacheLayout,
    downloader: Box<dyn Downloader>,
}

impl CacheSynchronizer {
    #[must_use]
    pub fn new(layout: CacheLayout, downloader: impl Downloader + 'static) -> Self {
        Self { layout, downloader: Box::new(downloader) }
    }

    #[must_use]
    pub fn layout(&self) -> &CacheLayout {
        &self.layout
    }

    /// Fetch whatever `contexts` need and is not yet valid in the cache.
    ///
    /// Per-file problems are collected in the report and never undo files that
    /// were already installed. Running twice in a row downloads nothing the second
    /// time.
    ///
    /// # Errors
    /// Returns an error when the cache lock cannot be taken or the cache itself
    /// cannot be read or updated.
    pub fn sync(
        &self,
        contexts: &[String],
        options: &SyncOptions,
    ) -> Result<SyncReport, CacheError> {
        let _lock = CacheLock::acquire(&self.layout)?;
        if !options.dry_run {
            self.layout.ensure_dirs()?;
        }

        let mut run = SyncRun {
            sync: self,
            options,
            report: SyncReport { dry_run: options.dry_run, ..SyncReport::default() },
            staged_mappings: HashMap::new(),
            staged_references: HashSet::new(),
            required_mappings: BTreeSet::new(),
            required_references: BTreeSet::new(),
            closures_known: true,
        };
        for context in contexts {
            if run.sync_context(context)? {
                run.report.complete_contexts.push(context.clone());
            } else {
                warn!(context = %context, "context is incomplete after sync");
                run.report.incomplete_contexts.push(context.clone());
            }
        }

        if !contexts.is_empty() {
            run.purge()?;
        }
        if !options.dry_run {
            let mut recorded = self.layout.read_complete_contexts()?;
            recorded.extend(run.report.complete_contexts.iter().cloned());
            for context in &run.report.incomplete_contexts {
                recorded.remove(context);
            }
            if !run.report.purged.is_empty() {
                let cache = MappingCache::open(&self.layout);
                recorded.retain(|context| {
                    let kept = run.report.complete_contexts.contains(context)
                        || self.is_intact(&cache, context);
                    if !kept {
                        info!(context = %context, "purge removed files of a recorded context");
                    }
                    kept
                });
            }
            self.layout.write_complete_contexts(&recorded)?;
        }

        let report = run.report;
        info!(
            contexts = contexts.len(),
            downloaded = report.downloaded.len(),
            failures = report.failures.len(),
            purged = report.purged.len(),
            dry_run = report.dry_run,
            "cache sync finished"
        );
        Ok(report)
    }

    fn is_intact(&self, cache: &MappingCache, context: &str) -> bool {
        cache.missing_mappings(context).is_ok_and(|missing| missing.is_empty())
            && cache.reference_names(context).is_ok_and(|names| {
                names.iter().all(|name| self.layout.reference_path(name).is_file())
            })
    }
}

struct SyncRun<'a> {
    sync: &'a CacheSynchronizer,
    options: &'a SyncOptions,
    report: SyncReport,
    staged_mappings: HashMap<String, Vec<u8>>,
    staged_references: HashSet<String>,
    required_mappings: BTreeSet<String>,
    required_references: BTreeSet<String>,
    closures_known: bool,
}

impl SyncRun<'_> {
    fn layout(&self) -> &CacheLayout {
        &self.sync.layout
    }

    fn fail(&mut self, name: &str, error: &impl Display) {
        warn!(file = name, error = %error, "sync failure");
        self.report.failures.push(SyncFailure { name: name.to_string(), error: error.to_string() });
    }

    /// Records a failure for names that would resolve outside the cache directories.
    fn rejects(&mut self, name: &str) -> bool {
        if is_plain_file_name(name) {
            return false;
        }
        self.fail(name, &CacheError::UnsafeName(name.to_string()));
        true
    }

    fn mapping_cache(&self) -> MappingCache {
        let source =
            StagedSource { layout: self.layout().clone(), staged: self.staged_mappings.clone() };
        MappingCache::new(source, ParseOptions::default())
    }

    /// Returns true when the context ends up complete.
    fn sync_context(&mut self, context: &str) -> Result<bool, CacheError> {
        let mut refetched = HashSet::new();
        let cache = loop {
            let cache = self.mapping_cache();
            match cache.get_cached_mapping(context) {
                Ok(_) => {
                    let missing = cache.missing_mappings(context)?;
                    if missing.is_empty() {
                        break cache;
                    }
                    let mut progressed = false;
                    for name in missing {
                        if refetched.insert(name.clone()) && self.fetch_mapping(&name) {
                            progressed = true;
                        }
                    }
                    if !progressed {
                        self.required_mappings.extend(cache.mapping_names(context)?);
                        self.closures_known = false;
                        return Ok(false);
                    }
                }
                Err(err) => {
                    let name = match (&err, err.mapping_name()) {
                        (CacheError::Mapping(_) | CacheError::NotFound(_), Some(name)) => {
                            name.to_string()
                        }
                        _ => return Err(err),
                    };
                    if refetched.insert(name.clone()) {
                        if !matches!(err, CacheError::NotFound(_)) {
                            warn!(
                                mapping = %name,
                                error = %err,
                                "refetching invalid cached mapping"
                            );
                        }
                        if self.fetch_mapping(&name) {
                            continue;
                        }
                    } else {
                        self.fail(&name, &err);
                    }
                    self.closures_known = false;
                    return Ok(false);
                }
            }
        };

        self.required_mappings.extend(cache.mapping_names(context)?);
        let references = cache.reference_names(context)?;
        self.required_references.extend(references.iter().cloned());
        let mut complete = true;
        for name in &references {
            complete &= self.sync_reference(name)?;
        }
        debug!(context, references = references.len(), complete, "synced context");
        Ok(complete)
    }

    fn install(&mut self, path: &Path, name: &str, bytes: Vec<u8>) -> bool {
        if self.options.dry_run {
            if path.starts_with(self.layout().mappings_dir()) {
                self.staged_mappings.insert(name.to_string(), bytes);
            } else {
                self.staged_references.insert(name.to_string());
            }
        } else if let Err(err) = install_file(path, &bytes) {
            self.fail(name, &err);
            return false;
        }
        self.report.downloaded.push(name.to_string());
        true
    }

    fn fetch_mapping(&mut self, name: &str) -> bool {
        if self.rejects(name) {
            return false;
        }
        let bytes = match self.sync.downloader.fetch(name) {
            Ok(bytes) => bytes,
            Err(err) => {
                self.fail(name, &err);
                return false;
            }
        };
        if let Err(err) = MappingDocument::parse_named(name, &bytes, ParseOptions::default()) {
            self.fail(name, &err);
            return false;
        }
        let path = self.layout().mapping_path(name);
        self.install(&path, name, bytes)
    }

    fn fetch_reference(&mut self, name: &str) -> bool {
        let bytes = match self.sync.downloader.fetch(name) {
            Ok(bytes) => bytes,
            Err(err) => {
                self.fail(name, &err);
                return false;
            }
        };
        match self.sync.downloader.expected_sha1(name) {
            Ok(Some(expected)) => {
                let actual = sha1_hex(&bytes);
                if !actual.eq_ignore_ascii_case(&expected) {
                    let err = DownloadError::Checksum { name: name.to_string(), expected, actual };
                    self.fail(name, &err);
                    return false;
                }
            }
            Ok(None) => {}
            Err(err) => {
                self.fail(name, &err);
                return false;
            }
        }
        let path = self.layout().reference_path(name);
        self.install(&path, name, bytes)
    }

    fn sync_reference(&mut self, name: &str) -> Result<bool, CacheError> {
        if self.staged_references.contains(name) {
            return Ok(true);
        }
        if self.rejects(name) {
            return Ok(false);
        }
        let path = self.layout().reference_path(name);
        if path.is_file() {
            if !self.options.verify {
                return Ok(true);
            }
            match self.sync.downloader.expected_sha1(name) {
                Ok(None) => return Ok(true),
                Ok(Some(expected)) => {
                    if file_sha1(&path)?.eq_ignore_ascii_case(&expected) {
                        return Ok(true);
                    }
                    warn!(reference = name, "cached reference failed verification");
                }
                Err(err) => {
                    self.fail(name, &err);
                    return Ok(false);
                }
            }
        }
        if !self.options.fetch_references {
            debug!(reference = name, "reference not cached and fetching is disabled");
            return Ok(false);
        }
        Ok(self.fetch_reference(name))
    }

    fn purge(&mut self) -> Result<(), CacheError> {
        if !(self.options.purge_mappings || self.options.purge_references) {
            return Ok(());
        }
        if !self.closures_known {
            warn!("skipping purge because some required mappings are unavailable");
            return Ok(());
        }
        let mut doomed = Vec::new();
        if self.options.purge_mappings {
            for name in self.layout().list_mappings()?.difference(&self.required_mappings) {
                doomed.push((self.layout().mapping_path(name), name.clone()));
            }
        }
        if self.options.purge_references {
            for name in self.layout().list_references()?.difference(&self.required_references) {
                doomed.push((self.layout().reference_path(name), name.clone()));
            }
        }
        for (path, name) in doomed {
            if !self.options.dry_run {
                if let Err(err) = fs::remove_file(&path) {
                    self.fail(&name, &CacheError::io(&path, err));
                    continue;
                }
                debug!(file = %name, "purged");
            }
            self.report.purged.push(name);
        }
        Ok(())
    }
}
