use std::collections::{BTreeMap, BTreeSet, HashSet};

use serde::Serialize;
use sha1::{Digest, Sha1};

use crate::expr::Expr;
use crate::header::Header;
use crate::name::MappingName;
use crate::selector::{Leaf, MatchPolicy, Selector};
use crate::syntax::{parse_module, render_module, Value};
use crate::{LookupError, MappingError};

const CHECKSUM_KEY: &str = "sha1sum";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MappingKind {
    Pipeline,
    Instrument,
    Reference,
}

impl MappingKind {
    #[must_use]
    pub fn from_extension(extension: &str) -> Option<Self> {
        match extension.to_ascii_lowercase().as_str() {
            "pmap" => Some(Self::Pipeline),
            "imap" => Some(Self::Instrument),
            "rmap" => Some(Self::Reference),
            _ => None,
        }
    }

    #[must_use]
    pub fn extension(self) -> &'static str {
        match self {
            Self::Pipeline => "pmap",
            Self::Instrument => "imap",
            Self::Reference => "rmap",
        }
    }

    /// Value of the `mapping` header key.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pipeline => "PIPELINE",
            Self::Instrument => "INSTRUMENT",
            Self::Reference => "REFERENCE",
        }
    }

    /// Kind of the documents a table of this kind points at.
    #[must_use]
    pub fn child(self) -> Option<Self> {
        match self {
            Self::Pipeline => Some(Self::Instrument),
            Self::Instrument => Some(Self::Reference),
            Self::Reference => None,
        }
    }

    fn required_keys(self) -> &'static [&'static str] {
        match self {
            Self::Pipeline => &["mapping", "name", "observatory"],
            Self::Instrument => &["mapping", "name", "observatory", "instrument"],
            Self::Reference => {
                &["mapping", "name", "observatory", "instrument", "filekind", "parkey"]
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParseOptions {
    /// Check the `sha1sum` header entry against the computed checksum.
    pub verify: bool,
}

impl Default for ParseOptions {
    fn default() -> Self {
        Self { verify: true }
    }
}

impl ParseOptions {
    #[must_use]
    pub fn unverified() -> Self {
        Self { verify: false }
    }
}

/// Keyed table of a pipeline or instrument mapping: instrument or filekind → child name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameTable {
    entries: Vec<(String, String)>,
}

impl NameTable {
    fn from_value(value: &Value, mapping: &str) -> Result<Self, MappingError> {
        let Value::Dict(items) = value else {
            return Err(MappingError::format(
                mapping,
                format!("selector must be a dictionary, found {}", value.describe()),
            ));
        };
        let mut seen = HashSet::new();
        let mut entries = Vec::with_capacity(items.len());
        for (key, child) in items {
            let key = key.as_str().map(str::trim).ok_or_else(|| {
                MappingError::format(
                    mapping,
                    format!("table key must be a string, found {}", key.describe()),
                )
            })?;
            if !seen.insert(key.to_ascii_uppercase()) {
                return Err(MappingError::DuplicateSelectorKey {
                    mapping: mapping.to_string(),
                    key: key.to_string(),
                });
            }
            let child = child.as_str().map(str::trim).ok_or_else(|| {
                MappingError::format(mapping, format!("entry '{key}' must name a mapping"))
            })?;
            if matches!(Leaf::from_text(child), Leaf::File(_)) {
                MappingName::parse(child).map_err(|_| {
                    MappingError::format(
                        mapping,
                        format!("entry '{key}' names '{child}', not a mapping"),
                    )
                })?;
            }
            entries.push((key.to_string(), child.to_string()));
        }
        Ok(Self { entries })
    }

    fn to_value(&self) -> Value {
        Value::Dict(
            self.entries
                .iter()
                .map(|(key, child)| (Value::Str(key.clone()), Value::Str(child.clone())))
                .collect(),
        )
    }

    /// Case-insensitive lookup.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        let key = key.trim();
        self.entries
            .iter()
            .find(|(candidate, _)| candidate.eq_ignore_ascii_case(key))
            .map(|(_, child)| child.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(key, child)| (key.as_str(), child.as_str()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Child mapping names, skipping `N/A` and `OMIT` entries.
    pub fn children(&self) -> impl Iterator<Item = &str> {
        self.iter()
            .map(|(_, child)| child)
            .filter(|child| matches!(Leaf::from_text(child), Leaf::File(_)))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MappingBody {
    Table(NameTable),
    Selector(Selector),
}

/// A parsed, validated, immutable mapping document.
///
/// The header holds every metadata key except `sha1sum`, which is checked on
/// parse and recomputed on [`MappingDocument::serialize`].
#[derive(Debug, Clone, PartialEq)]
pub struct MappingDocument {
    name: MappingName,
    header: BTreeMap<String, Value>,
    parkey: Vec<Vec<String>>,
    relevance: Option<Expr>,
    omit: Option<Expr>,
    body: MappingBody,
}

fn header_text<'a>(
    header: &'a BTreeMap<String, Value>,
    key: &str,
    mapping: &str,
) -> Result<&'a str, MappingError> {
    let value = header.get(key).ok_or_else(|| MappingError::MissingHeaderKey {
        mapping: mapping.to_string(),
        key: key.to_string(),
    })?;
    value.as_str().ok_or_else(|| {
        MappingError::format(
            mapping,
            format!("header '{key}' must be a string, found {}", value.describe()),
        )
    })
}

fn parse_parkey(value: &Value, mapping: &str) -> Result<Vec<Vec<String>>, MappingError> {
    let invalid =
        || MappingError::format(mapping, "parkey must be a tuple of tuples of keyword names");
    let Value::Tuple(levels) = value else {
        return Err(invalid());
    };
    levels
        .iter()
        .map(|level| match level {
            Value::Tuple(names) => names
                .iter()
                .map(|name| {
                    name.as_str()
                        .map(|name| name.trim().to_ascii_uppercase())
                        .ok_or_else(invalid)
                })
                .collect::<Result<Vec<_>, _>>(),
            _ => Err(invalid()),
        })
        .collect()
}

fn parse_expression(
    header: &BTreeMap<String, Value>,
    key: &str,
    mapping: &str,
) -> Result<Option<Expr>, MappingError> {
    if !header.contains_key(key) {
        return Ok(None);
    }
    let source = header_text(header, key, mapping)?;
    Expr::parse(source)
        .map(Some)
        .map_err(|message| {
            MappingError::format(mapping, format!("invalid {key} '{source}': {message}"))
        })
}

fn check_field(
    header: &BTreeMap<String, Value>,
    key: &str,
    expected: Option<&str>,
    mapping: &str,
) -> Result<(), MappingError> {
    let (Some(expected), Some(value)) = (expected, header.get(key).and_then(Value::as_str)) else {
        return Ok(());
    };
    if value.trim().eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        Err(MappingError::format(
            mapping,
            format!("header {key} '{value}' disagrees with the mapping name"),
        ))
    }
}

impl MappingDocument {
    /// Parse a mapping whose file name is not known independently of its header.
    ///
    /// # Errors
    /// Returns [`MappingError`] for syntax, header, parkey, duplicate-key, or
    /// checksum problems.
    pub fn parse(bytes: &[u8], options: ParseOptions) -> Result<Self, MappingError> {
        Self::parse_inner(None, bytes, options)
    }

    /// Parse a mapping read from the file `name`; the header must carry the same name.
    ///
    /// # Errors
    /// As [`MappingDocument::parse`], plus a format error when the names disagree.
    pub fn parse_named(
        name: &str,
        bytes: &[u8],
        options: ParseOptions,
    ) -> Result<Self, MappingError> {
        Self::parse_inner(Some(name), bytes, options)
    }

    fn parse_inner(
        expected_name: Option<&str>,
        bytes: &[u8],
        options: ParseOptions,
    ) -> Result<Self, MappingError> {
        let label = expected_name.unwrap_or("<mapping>");
        let text = std::str::from_utf8(bytes)
            .map_err(|err| MappingError::format(label, format!("not valid UTF-8: {err}")))?;
        let assignments =
            parse_module(text).map_err(|err| MappingError::format(label, err.to_string()))?;

        let mut header_value = None;
        let mut selector_value = None;
        for (target, value) in assignments {
            let slot = match target.as_str() {
                "header" => &mut header_value,
                "selector" => &mut selector_value,
                other => {
                    return Err(MappingError::format(
                        label,
                        format!("unexpected assignment to '{other}'"),
                    ))
                }
            };
            if slot.replace(value).is_some() {
                return Err(MappingError::format(label, format!("'{target}' is assigned twice")));
            }
        }
        let Some(Value::Dict(header_entries)) = header_value else {
            return Err(MappingError::format(label, "missing 'header = {...}' dictionary"));
        };
        let selector_value =
            selector_value.ok_or_else(|| MappingError::format(label, "missing 'selector = ...'"))?;

        let mut header = BTreeMap::new();
        for (key, value) in header_entries {
            let key = key
                .as_str()
                .map(|key| key.trim().to_ascii_lowercase())
                .ok_or_else(|| MappingError::format(label, "header keys must be strings"))?;
            if header.insert(key.clone(), value).is_some() {
                return Err(MappingError::format(
                    label,
                    format!("header key '{key}' appears twice"),
                ));
            }
        }
        let expected_sum = header.remove(CHECKSUM_KEY);

        let name_text = header_text(&header, "name", label)?.trim().to_string();
        if let Some(expected) = expected_name {
            if expected != name_text {
                return Err(MappingError::format(
                    expected,
                    format!("header names '{name_text}' but the file is '{expected}'"),
                ));
            }
        }
        let name = MappingName::parse(&name_text)?;
        let mapping = name_text.as_str();
        let kind = name.kind();

        for key in kind.required_keys() {
            if !header.contains_key(*key) {
                return Err(MappingError::MissingHeaderKey {
                    mapping: mapping.to_string(),
                    key: (*key).to_string(),
                });
            }
        }
        let declared = header_text(&header, "mapping", mapping)?;
        if !declared.trim().eq_ignore_ascii_case(kind.as_str()) {
            return Err(MappingError::format(
                mapping,
                format!(
                    "header mapping '{declared}' disagrees with extension .{}",
                    kind.extension()
                ),
            ));
        }
        check_field(&header, "observatory", Some(name.observatory()), mapping)?;
        check_field(&header, "instrument", name.instrument(), mapping)?;
        check_field(&header, "filekind", name.filekind(), mapping)?;

        let (parkey, body) = if kind == MappingKind::Reference {
            let parkey = header
                .get("parkey")
                .map(|value| parse_parkey(value, mapping))
                .transpose()?
                .unwrap_or_default();
            let selector = Selector::from_value(&selector_value, &parkey, 0, mapping)?;
            (parkey, MappingBody::Selector(selector))
        } else {
            (Vec::new(), MappingBody::Table(NameTable::from_value(&selector_value, mapping)?))
        };

        let document = Self {
            relevance: parse_expression(&header, "rmap_relevance", mapping)?,
            omit: parse_expression(&header, "rmap_omit", mapping)?,
            name,
            header,
            parkey,
            body,
        };

        if options.verify {
            let expected = expected_sum.as_ref().and_then(Value::as_str).ok_or_else(|| {
                MappingError::MissingHeaderKey {
                    mapping: mapping.to_string(),
                    key: CHECKSUM_KEY.to_string(),
                }
            })?;
            let actual = document.checksum();
            if !expected.trim().eq_ignore_ascii_case(&actual) {
                return Err(MappingError::Checksum {
                    mapping: mapping.to_string(),
                    expected: expected.trim().to_string(),
                    actual,
                });
            }
        }
        Ok(document)
    }

    fn render(&self, checksum: Option<&str>) -> String {
        let mut entries = self
            .header
            .iter()
            .map(|(key, value)| (key.as_str(), value.clone()))
            .collect::<BTreeMap<_, _>>();
        if let Some(checksum) = checksum {
            entries.insert(CHECKSUM_KEY, Value::Str(checksum.to_string()));
        }
        let header = Value::Dict(
            entries.into_iter().map(|(key, value)| (Value::Str(key.to_string()), value)).collect(),
        );
        let body = match &self.body {
            MappingBody::Table(table) => table.to_value(),
            MappingBody::Selector(selector) => selector.to_value(),
        };
        render_module(&[("header", &header), ("selector", &body)])
    }

    /// Hex SHA-1 of the canonical text without the `sha1sum` entry.
    #[must_use]
    pub fn checksum(&self) -> String {
        hex::encode(Sha1::digest(self.render(None).as_bytes()))
    }

    /// Canonical text including a freshly computed `sha1sum`.
    #[must_use]
    pub fn serialize(&self) -> String {
        self.render(Some(&self.checksum()))
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    #[must_use]
    pub fn mapping_name(&self) -> &MappingName {
        &self.name
    }

    #[must_use]
    pub fn kind(&self) -> MappingKind {
        self.name.kind()
    }

    #[must_use]
    pub fn header(&self) -> &BTreeMap<String, Value> {
        &self.header
    }

    /// String value of a header key, looked up case-insensitively.
    #[must_use]
    pub fn header_str(&self, key: &str) -> Option<&str> {
        self.header.get(&key.to_ascii_lowercase()).and_then(Value::as_str)
    }

    #[must_use]
    pub fn observatory(&self) -> &str {
        self.name.observatory()
    }

    #[must_use]
    pub fn instrument(&self) -> Option<&str> {
        self.name.instrument()
    }

    #[must_use]
    pub fn filekind(&self) -> Option<&str> {
        self.name.filekind()
    }

    #[must_use]
    pub fn parkey(&self) -> &[Vec<String>] {
        &self.parkey
    }

    #[must_use]
    pub fn body(&self) -> &MappingBody {
        &self.body
    }

    #[must_use]
    pub fn table(&self) -> Option<&NameTable> {
        match &self.body {
            MappingBody::Table(table) => Some(table),
            MappingBody::Selector(_) => None,
        }
    }

    #[must_use]
    pub fn selector(&self) -> Option<&Selector> {
        match &self.body {
            MappingBody::Selector(selector) => Some(selector),
            MappingBody::Table(_) => None,
        }
    }

    /// Table entry for an instrument (pipeline) or filekind (instrument).
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.table().and_then(|table| table.get(key))
    }

    /// Choose the reference leaf for `header`.
    ///
    /// # Errors
    /// Returns the selector's [`LookupError`], or
    /// [`LookupError::NotReferenceMapping`] for pipeline and instrument mappings.
    pub fn get_best_ref(&self, header: &Header, policy: MatchPolicy) -> Result<Leaf, LookupError> {
        self.selector()
            .ok_or_else(|| LookupError::NotReferenceMapping(self.name().to_string()))?
            .choose_with(header, policy)
    }

    /// Reference files named by this document alone.
    #[must_use]
    pub fn reference_names(&self) -> BTreeSet<String> {
        self.selector().map(Selector::reference_names).unwrap_or_default()
    }

    /// This document's name plus the child mappings its table names.
    #[must_use]
    pub fn mapping_names(&self) -> BTreeSet<String> {
        let mut names = BTreeSet::from([self.name().to_string()]);
        if let Some(table) = self.table() {
            names.extend(table.children().map(str::to_string));
        }
        names
    }

    /// `rmap_relevance` evaluated against `header`; true when absent.
    #[must_use]
    pub fn is_relevant(&self, header: &Header) -> bool {
        self.relevance.as_ref().map_or(true, |expr| expr.evaluate(header))
    }

    /// `rmap_omit` evaluated against `header`; false when absent.
    #[must_use]
    pub fn is_omitted(&self, header: &Header) -> bool {
        self.omit.as_ref().is_some_and(|expr| expr.evaluate(header))
    }
}
