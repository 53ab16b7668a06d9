use std::collections::BTreeMap;

use refcal_cache::MappingCache;
use refcal_core::{Header, Leaf, MappingDocument, MappingKind, MatchPolicy};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ClientError;

/// Header keywords consulted, in order, when no instrument is given explicitly.
pub const DEFAULT_INSTRUMENT_KEYWORDS: [&str; 3] =
    ["INSTRUME", "INSTRUMENT", "META.INSTRUMENT.NAME"];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BestRefsRequest {
    /// Overrides the header's instrument keywords.
    pub instrument: Option<String>,
    /// Reference types to resolve; every type the instrument mapping knows when `None`.
    pub reftypes: Option<Vec<String>>,
    /// Empty means [`DEFAULT_INSTRUMENT_KEYWORDS`].
    pub instrument_keywords: Vec<String>,
    pub policy: MatchPolicy,
}

/// Result for a single reference type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum RefOutcome {
    File(String),
    Files(Vec<String>),
    /// The type does not apply to this dataset.
    Irrelevant,
    /// The type applies but is deliberately not used.
    Omit,
    Error(String),
}

impl RefOutcome {
    #[must_use]
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    fn from_leaf(leaf: &Leaf) -> Self {
        match leaf {
            Leaf::File(name) => Self::File(name.clone()),
            Leaf::NotApplicable => Self::Irrelevant,
            Leaf::Omit => Self::Omit,
            Leaf::Tuple(_) => Self::Files(leaf.files().into_iter().map(str::to_string).collect()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BestRefs {
    pub context: String,
    pub instrument: String,
    pub refs: BTreeMap<String, RefOutcome>,
}

impl BestRefs {
    /// The single file chosen for `reftype`, if that is what it resolved to.
    #[must_use]
    pub fn file(&self, reftype: &str) -> Option<&str> {
        match self.refs.get(&reftype.to_ascii_lowercase()) {
            Some(RefOutcome::File(name)) => Some(name),
            _ => None,
        }
    }

    pub fn failures(&self) -> impl Iterator<Item = (&str, &str)> {
        self.refs.iter().filter_map(|(reftype, outcome)| match outcome {
            RefOutcome::Error(message) => Some((reftype.as_str(), message.as_str())),
            _ => None,
        })
    }
}

fn determine_instrument(header: &Header, request: &BestRefsRequest) -> Result<String, ClientError> {
    let explicit = request.instrument.as_deref().map(str::trim).filter(|value| !value.is_empty());
    if let Some(instrument) = explicit {
        return Ok(instrument.to_ascii_lowercase());
    }
    let keywords = if request.instrument_keywords.is_empty() {
        DEFAULT_INSTRUMENT_KEYWORDS.iter().map(ToString::to_string).collect()
    } else {
        request.instrument_keywords.clone()
    };
    let found = keywords
        .iter()
        .filter_map(|keyword| header.get(keyword))
        .map(str::trim)
        .find(|value| !value.is_empty() && !Header::is_wildcard(value))
        .map(str::to_ascii_lowercase);
    found.ok_or(ClientError::InstrumentUndetermined { keywords })
}

fn resolve_type(
    cache: &MappingCache,
    imap: &MappingDocument,
    reftype: &str,
    header: &Header,
    policy: MatchPolicy,
) -> RefOutcome {
    let Some(entry) = imap.get(reftype) else {
        return RefOutcome::Error(format!("unknown reference type {reftype} for {}", imap.name()));
    };
    let rmap_name = match Leaf::from_text(entry) {
        Leaf::File(name) => name,
        Leaf::NotApplicable => return RefOutcome::Irrelevant,
        Leaf::Omit => return RefOutcome::Omit,
        Leaf::Tuple(_) => {
            return RefOutcome::Error(format!("malformed entry for {reftype} in {}", imap.name()))
        }
    };
    let rmap = match cache.get_cached_mapping(&rmap_name) {
        Ok(rmap) => rmap,
        Err(err) => return RefOutcome::Error(err.to_string()),
    };
    if !rmap.is_relevant(header) {
        return RefOutcome::Irrelevant;
    }
    if rmap.is_omitted(header) {
        return RefOutcome::Omit;
    }
    match rmap.get_best_ref(header, policy) {
        Ok(leaf) => RefOutcome::from_leaf(&leaf),
        Err(err) => RefOutcome::Error(err.to_string()),
    }
}

/// Resolve the reference files `header` needs under `context`.
///
/// Problems with individual reference types are recorded as [`RefOutcome::Error`]
/// and do not stop the remaining types.
///
/// # Errors
/// Fails when the pipeline or instrument mapping cannot be loaded, the instrument
/// cannot be determined, or every resolved type failed.
pub fn get_best_references(
    cache: &MappingCache,
    context: &str,
    header: &Header,
    request: &BestRefsRequest,
) -> Result<BestRefs, ClientError> {
    let pipeline = cache.get_cached_mapping(context)?;
    if pipeline.kind() != MappingKind::Pipeline {
        return Err(ClientError::NotAContext(context.to_string()));
    }
    let instrument = determine_instrument(header, request)?;
    let unknown = || ClientError::UnknownInstrument {
        context: context.to_string(),
        instrument: instrument.clone(),
    };
    let imap_name = match pipeline.get(&instrument).map(Leaf::from_text) {
        Some(Leaf::File(name)) => name,
        _ => return Err(unknown()),
    };
    let imap = cache.get_cached_mapping(&imap_name)?;

    let reftypes = match &request.reftypes {
        Some(reftypes) => {
            reftypes.iter().map(|reftype| reftype.trim().to_ascii_lowercase()).collect::<Vec<_>>()
        }
        None => imap
            .table()
            .map(|table| table.iter().map(|(reftype, _)| reftype.to_ascii_lowercase()).collect())
            .unwrap_or_default(),
    };

    let mut refs = BTreeMap::new();
    for reftype in reftypes {
        let outcome = resolve_type(cache, &imap, &reftype, header, request.policy);
        debug!(
            context,
            instrument = %instrument,
            reftype = %reftype,
            outcome = ?outcome,
            "resolved reference type"
        );
        refs.insert(reftype, outcome);
    }

    if !refs.is_empty() && refs.values().all(RefOutcome::is_error) {
        let failures = refs
            .into_iter()
            .filter_map(|(reftype, outcome)| match outcome {
                RefOutcome::Error(message) => Some((reftype, message)),
                _ => None,
            })
            .collect();
        return Err(ClientError::AllTypesFailed { context: context.to_string(), failures });
    }
    Ok(BestRefs { context: context.to_string(), instrument, refs })
}
