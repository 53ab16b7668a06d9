use std::collections::BTreeMap;
use std::path::PathBuf;

use refcal_cache::CacheError;

use crate::remote::NetworkError;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error("{0} is not a pipeline mapping")]
    NotAContext(String),
    #[error("cannot determine instrument: none of {keywords:?} is set in the header")]
    InstrumentUndetermined { keywords: Vec<String> },
    #[error("instrument {instrument} is not defined by {context}")]
    UnknownInstrument { context: String, instrument: String },
    #[error("every reference type failed under {context}: {}", summarize(failures))]
    AllTypesFailed { context: String, failures: BTreeMap<String, String> },
    #[error("no operative context: none given, configured, or recorded")]
    NoContext,
    #[error("context {context} cannot be resolved: {reason}")]
    Unresolvable { context: String, reason: String },
    #[error(transparent)]
    Network(#[from] NetworkError),
    #[error("invalid configuration from {origin}: {message}")]
    Config { origin: String, message: String },
    #[error("invalid client state file {}: {message}", path.display())]
    State { path: PathBuf, message: String },
}

fn summarize(failures: &BTreeMap<String, String>) -> String {
    failures
        .iter()
        .map(|(reftype, message)| format!("{reftype}: {message}"))
        .collect::<Vec<_>>()
        .join("; ")
}
