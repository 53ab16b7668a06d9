use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::io::ErrorKind;
use std::sync::Arc;

use parking_lot::RwLock;
use refcal_core::{
    diff_documents, Difference, MappingDocument, MappingError, MappingKind, ParseOptions,
};
use tracing::debug;

use crate::error::CacheError;
use crate::layout::CacheLayout;

/// Where the loader reads mapping bytes from.
pub trait MappingSource: Send + Sync {
    /// `Ok(None)` when no mapping of that name exists.
    ///
    /// # Errors
    /// Returns an error for any failure other than absence.
    fn read(&self, name: &str) -> Result<Option<Vec<u8>>, CacheError>;
}

impl MappingSource for CacheLayout {
    fn read(&self, name: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let path = self.mapping_path(name);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(CacheError::io(path, err)),
        }
    }
}

/// Memoizing arena of parsed mappings.
///
/// Loading a mapping eagerly loads every mapping it names. Children that do not
/// exist are tolerated and reported by [`MappingCache::missing_mappings`]; children
/// that fail to parse or verify fail the whole load. Only successful loads are
/// memoized, and one name always yields the same shared document.
pub struct MappingCache {
    source: Box<dyn MappingSource>,
    options: ParseOptions,
    loaded: RwLock<HashMap<String, Arc<MappingDocument>>>,
}

impl std::fmt::Debug for MappingCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappingCache")
            .field("options", &self.options)
            .field("loaded", &self.loaded.read().len())
            .finish_non_exhaustive()
    }
}

impl MappingCache {
    #[must_use]
    pub fn new(source: impl MappingSource + 'static, options: ParseOptions) -> Self {
        Self { source: Box::new(source), options, loaded: RwLock::new(HashMap::new()) }
    }

    /// Verified cache over the mapping directory of `layout`.
    #[must_use]
    pub fn open(layout: &CacheLayout) -> Self {
        Self::new(layout.clone(), ParseOptions::default())
    }

    /// Load `name` and every mapping it transitively names.
    ///
    /// # Errors
    /// Returns [`CacheError::NotFound`] when `name` itself does not exist, and a
    /// mapping error when it or any existing descendant is malformed, fails its
    /// checksum, has an unexpected kind, or closes a cycle.
    pub fn get_cached_mapping(&self, name: &str) -> Result<Arc<MappingDocument>, CacheError> {
        let mut stack = Vec::new();
        self.load(name, None, &mut stack)?.ok_or_else(|| CacheError::NotFound(name.to_string()))
    }

    fn load(
        &self,
        name: &str,
        expected: Option<MappingKind>,
        stack: &mut Vec<String>,
    ) -> Result<Option<Arc<MappingDocument>>, CacheError> {
        if let Some(document) = self.loaded.read().get(name) {
            return Ok(Some(Arc::clone(document)));
        }
        if let Some(start) = stack.iter().position(|loading| loading == name) {
            let mut cycle = stack[start..].to_vec();
            cycle.push(name.to_string());
            return Err(MappingError::Format {
                mapping: name.to_string(),
                message: format!("mapping cycle {}", cycle.join(" -> ")),
            }
            .into());
        }

        let Some(bytes) = self.source.read(name)? else {
            debug!(mapping = name, "mapping not present");
            return Ok(None);
        };
        let document = MappingDocument::parse_named(name, &bytes, self.options)?;
        if let Some(expected) = expected {
            if document.kind() != expected {
                return Err(MappingError::Format {
                    mapping: name.to_string(),
                    message: format!(
                        "expected a {} mapping",
                        expected.as_str().to_ascii_lowercase()
                    ),
                }
                .into());
            }
        }

        stack.push(name.to_string());
        if let Some(table) = document.table() {
            let child_kind = document.kind().child();
            for child in table.children() {
                self.load(child, child_kind, stack)?;
            }
        }
        stack.pop();

        debug!(mapping = name, checksum = %document.checksum(), "loaded mapping");
        let document = Arc::new(document);
        let mut loaded = self.loaded.write();
        let shared = loaded.entry(name.to_string()).or_insert(document);
        Ok(Some(Arc::clone(shared)))
    }

    /// Forget every memoized document.
    pub fn clear_cache(&self) {
        self.loaded.write().clear();
    }

    #[must_use]
    pub fn is_loaded(&self, name: &str) -> bool {
        self.loaded.read().contains_key(name)
    }

    fn loaded(&self, name: &str) -> Option<Arc<MappingDocument>> {
        self.loaded.read().get(name).cloned()
    }

    /// Documents reachable from `context`, parents before children.
    fn closure(&self, context: &str) -> Result<Vec<Arc<MappingDocument>>, CacheError> {
        let root = self.get_cached_mapping(context)?;
        let mut seen = BTreeSet::from([root.name().to_string()]);
        let mut documents = vec![root];
        let mut index = 0;
        while index < documents.len() {
            let children = documents[index]
                .table()
                .map(|table| {
                    table
                        .children()
                        .filter(|child| seen.insert((*child).to_string()))
                        .filter_map(|child| self.loaded(child))
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default();
            documents.extend(children);
            index += 1;
        }
        Ok(documents)
    }

    /// Every mapping name `context` requires, including ones not present.
    ///
    /// # Errors
    /// As [`MappingCache::get_cached_mapping`].
    pub fn mapping_names(&self, context: &str) -> Result<BTreeSet<String>, CacheError> {
        Ok(self.closure(context)?.iter().flat_map(|document| document.mapping_names()).collect())
    }

    /// Every reference file named by the present reference mappings of `context`.
    ///
    /// # Errors
    /// As [`MappingCache::get_cached_mapping`].
    pub fn reference_names(&self, context: &str) -> Result<BTreeSet<String>, CacheError> {
        Ok(self.closure(context)?.iter().flat_map(|document| document.reference_names()).collect())
    }

    /// Required mappings of `context` that could not be found.
    ///
    /// # Errors
    /// As [`MappingCache::get_cached_mapping`].
    pub fn missing_mappings(&self, context: &str) -> Result<BTreeSet<String>, CacheError> {
        Ok(self.mapping_names(context)?.into_iter().filter(|name| !self.is_loaded(name)).collect())
    }

    /// Differences from mapping `old` to mapping `new`.
    ///
    /// Every path starts with the `old -> new` pair it was found in; replaced
    /// sub-mappings are compared recursively beneath the entry that names them.
    ///
    /// # Errors
    /// Returns an error when either side, or a replaced sub-mapping, cannot be loaded.
    pub fn difference(&self, old: &str, new: &str) -> Result<Vec<Difference>, CacheError> {
        let mut differences = Vec::new();
        self.difference_under(old, new, &[], &mut differences)?;
        Ok(differences)
    }

    fn difference_under(
        &self,
        old: &str,
        new: &str,
        prefix: &[String],
        differences: &mut Vec<Difference>,
    ) -> Result<(), CacheError> {
        let before = self.get_cached_mapping(old)?;
        let after = self.get_cached_mapping(new)?;
        let mut location = prefix.to_vec();
        location.push(format!("{old} -> {new}"));

        for difference in diff_documents(&before, &after) {
            let located = difference.nested_under(&location);
            let replaced = difference
                .replaced_mappings()
                .map(|(old, new)| (old.to_string(), new.to_string()));
            let path = located.path.clone();
            differences.push(located);
            if let Some((old_child, new_child)) = replaced {
                self.difference_under(&old_child, &new_child, &path, differences)?;
            }
        }
        Ok(())
    }
}
