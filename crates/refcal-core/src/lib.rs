mod diff;
mod expr;
mod header;
mod keys;
mod mapping;
mod name;
mod pattern;
mod selector;
pub mod syntax;

pub use diff::{diff_documents, DiffAction, Difference};
pub use expr::{Expr, Operand};
pub use header::Header;
pub use keys::{parse_timestamp, Version};
pub use mapping::{MappingBody, MappingDocument, MappingKind, NameTable, ParseOptions};
pub use name::{is_plain_file_name, MappingName};
pub use pattern::MatchPattern;
pub use selector::{Choice, Entry, Leaf, MatchPolicy, Selector, SelectorKind};

/// Errors raised while parsing or constructing a mapping document.
///
/// These are always fatal to the single document they concern.
#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum MappingError {
    #[error("format error in {mapping}: {message}")]
    Format { mapping: String, message: String },
    #[error("checksum mismatch for {mapping}: header has {expected}, computed {actual}")]
    Checksum { mapping: String, expected: String, actual: String },
    #[error("{mapping} is missing required header key '{key}'")]
    MissingHeaderKey { mapping: String, key: String },
    #[error("inconsistent parkey in {mapping}: {message}")]
    InconsistentParkey { mapping: String, message: String },
    #[error("duplicate selector key {key} in {mapping}")]
    DuplicateSelectorKey { mapping: String, key: String },
    #[error("invalid mapping name '{0}'")]
    InvalidName(String),
}

impl MappingError {
    pub(crate) fn format(mapping: &str, message: impl Into<String>) -> Self {
        Self::Format { mapping: mapping.to_string(), message: message.into() }
    }

    pub(crate) fn parkey(mapping: &str, message: impl Into<String>) -> Self {
        Self::InconsistentParkey { mapping: mapping.to_string(), message: message.into() }
    }
}

/// Errors raised while choosing a leaf from a selector tree.
///
/// Fatal to one reference type only; callers resolving many types collect them.
#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum LookupError {
    #[error("ambiguous match on {parameters}: equally specific choices {candidates:?}")]
    AmbiguousMatch { parameters: String, candidates: Vec<String> },
    #[error("no match on {parameters} for values {values}")]
    NoMatch { parameters: String, values: String },
    #[error("no use-after entry at or before {time} for {parameters}")]
    UseAfter { parameters: String, time: String },
    #[error("no version rule matches {version} and no default is defined")]
    VersionAfter { version: String },
    #[error("missing required parameter {0}")]
    MissingParameter(String),
    #[error("bad value {value:?} for {parameter}: {reason}")]
    BadValue { parameter: String, value: String, reason: String },
    #[error("{0} is not a reference mapping")]
    NotReferenceMapping(String),
}
