use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeSet, HashSet};
use std::fmt::{Display, Formatter};

use serde::Serialize;
use time::PrimitiveDateTime;

use crate::header::Header;
use crate::keys::{parse_timestamp, Version};
use crate::name::is_plain_file_name;
use crate::pattern::{MatchPattern, Specificity};
use crate::syntax::Value;
use crate::{LookupError, MappingError};

/// Tie handling for `Match` selectors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MatchPolicy {
    /// Any tie between equally specific candidates is an error.
    #[default]
    Strict,
    /// A tie is tolerated when every tied candidate resolves to the same leaf.
    MergeIdentical,
}

/// Terminal value of a selector tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Leaf {
    File(String),
    /// `N/A`: the reference type does not apply to this dataset.
    NotApplicable,
    /// `OMIT`: the reference type is deliberately left out.
    Omit,
    Tuple(Vec<Leaf>),
}

impl Leaf {
    #[must_use]
    pub fn from_text(text: &str) -> Self {
        let text = text.trim();
        if text.eq_ignore_ascii_case("N/A") {
            Self::NotApplicable
        } else if text.eq_ignore_ascii_case("OMIT") {
            Self::Omit
        } else {
            Self::File(text.to_string())
        }
    }

    fn from_value(value: &Value) -> Result<Self, String> {
        match value {
            Value::Str(text) => match Self::from_text(text) {
                Self::File(name) if !is_plain_file_name(&name) => {
                    Err(format!("'{name}' is not a plain file name"))
                }
                leaf => Ok(leaf),
            },
            Value::Tuple(items) => {
                Ok(Self::Tuple(items.iter().map(Self::from_value).collect::<Result<_, _>>()?))
            }
            other => Err(format!(
                "expected a filename or tuple of filenames, found {}",
                other.describe()
            )),
        }
    }

    fn to_value(&self) -> Value {
        match self {
            Self::File(name) => Value::Str(name.clone()),
            Self::NotApplicable => Value::Str("N/A".to_string()),
            Self::Omit => Value::Str("OMIT".to_string()),
            Self::Tuple(items) => Value::Tuple(items.iter().map(Self::to_value).collect()),
        }
    }

    /// Every filename named by this leaf.
    #[must_use]
    pub fn files(&self) -> Vec<&str> {
        match self {
            Self::File(name) => vec![name.as_str()],
            Self::NotApplicable | Self::Omit => Vec::new(),
            Self::Tuple(items) => items.iter().flat_map(Self::files).collect(),
        }
    }
}

impl Display for Leaf {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::File(name) => f.write_str(name),
            Self::NotApplicable => f.write_str("N/A"),
            Self::Omit => f.write_str("OMIT"),
            Self::Tuple(items) => {
                let parts = items.iter().map(ToString::to_string).collect::<Vec<_>>();
                write!(f, "({})", parts.join(", "))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Choice {
    Leaf(Leaf),
    Nested(Box<Selector>),
}

impl Choice {
    fn from_value(
        value: &Value,
        parkey: &[Vec<String>],
        depth: usize,
        mapping: &str,
    ) -> Result<Self, MappingError> {
        if matches!(value, Value::Call { .. }) {
            return Ok(Self::Nested(Box::new(Selector::from_value(value, parkey, depth, mapping)?)));
        }
        if depth != parkey.len() {
            return Err(MappingError::parkey(
                mapping,
                format!(
                    "leaf {} sits at nesting depth {depth} but parkey defines {} levels",
                    value.render(),
                    parkey.len()
                ),
            ));
        }
        Leaf::from_value(value)
            .map(Self::Leaf)
            .map_err(|message| MappingError::format(mapping, message))
    }

    fn to_value(&self) -> Value {
        match self {
            Self::Leaf(leaf) => leaf.to_value(),
            Self::Nested(selector) => selector.to_value(),
        }
    }

    fn resolve(&self, header: &Header, policy: MatchPolicy) -> Result<Leaf, LookupError> {
        match self {
            Self::Leaf(leaf) => Ok(leaf.clone()),
            Self::Nested(selector) => selector.choose_with(header, policy),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "PascalCase")]
pub enum SelectorKind {
    Match,
    UseAfter,
    ClosestTime,
    SelectVersion,
    Bracket,
    GeometricallyNearest,
}

impl SelectorKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Match => "Match",
            Self::UseAfter => "UseAfter",
            Self::ClosestTime => "ClosestTime",
            Self::SelectVersion => "SelectVersion",
            Self::Bracket => "Bracket",
            Self::GeometricallyNearest => "GeometricallyNearest",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "Match" => Some(Self::Match),
            "UseAfter" => Some(Self::UseAfter),
            "ClosestTime" => Some(Self::ClosestTime),
            "SelectVersion" => Some(Self::SelectVersion),
            "Bracket" => Some(Self::Bracket),
            "GeometricallyNearest" => Some(Self::GeometricallyNearest),
            _ => None,
        }
    }

    fn single_parameter(self) -> bool {
        matches!(self, Self::SelectVersion | Self::Bracket | Self::GeometricallyNearest)
    }
}

trait SelectionKey: Sized {
    fn from_value(value: &Value, arity: usize, mapping: &str) -> Result<Self, MappingError>;
    fn source(&self) -> &Value;
    fn normalized(&self) -> String;
}

fn key_text<'a>(value: &'a Value, mapping: &str, what: &str) -> Result<&'a str, MappingError> {
    value.as_scalar_text().ok_or_else(|| {
        MappingError::format(
            mapping,
            format!("{what} key must be a string, found {}", value.describe()),
        )
    })
}

#[derive(Debug, Clone, PartialEq)]
struct MatchKey {
    source: Value,
    patterns: Vec<MatchPattern>,
}

/// Fewer wildcards first, then more exact literals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct MatchRank {
    wildcards: Reverse<usize>,
    exact: usize,
}

impl MatchKey {
    fn rank(&self, values: &[Option<&str>]) -> Option<MatchRank> {
        let mut wildcards = 0;
        let mut exact = 0;
        for (pattern, value) in self.patterns.iter().zip(values) {
            match pattern.specificity(*value)? {
                Specificity::Wildcard => wildcards += 1,
                Specificity::Exact => exact += 1,
                Specificity::Pattern => {}
            }
        }
        Some(MatchRank { wildcards: Reverse(wildcards), exact })
    }
}

impl SelectionKey for MatchKey {
    fn from_value(value: &Value, arity: usize, mapping: &str) -> Result<Self, MappingError> {
        let texts = match value {
            Value::Tuple(items) => items
                .iter()
                .map(|item| key_text(item, mapping, "match"))
                .collect::<Result<Vec<_>, _>>()?,
            scalar => vec![key_text(scalar, mapping, "match")?],
        };
        if texts.len() != arity {
            return Err(MappingError::parkey(
                mapping,
                format!(
                    "match key {} has {} values but the selector has {arity} parameters",
                    value.render(),
                    texts.len()
                ),
            ));
        }
        let patterns = texts
            .into_iter()
            .map(|text| {
                MatchPattern::parse(text).map_err(|err| {
                    MappingError::format(mapping, format!("invalid match pattern '{text}': {err}"))
                })
            })
            .collect::<Result<_, _>>()?;
        Ok(Self { source: value.clone(), patterns })
    }

    fn source(&self) -> &Value {
        &self.source
    }

    fn normalized(&self) -> String {
        let parts = self.patterns.iter().map(MatchPattern::normalized).collect::<Vec<_>>();
        format!("({})", parts.join(", "))
    }
}

#[derive(Debug, Clone, PartialEq)]
struct TimeKey {
    source: Value,
    at: PrimitiveDateTime,
}

impl SelectionKey for TimeKey {
    fn from_value(value: &Value, _arity: usize, mapping: &str) -> Result<Self, MappingError> {
        let text = key_text(value, mapping, "time")?;
        let at = parse_timestamp(text).ok_or_else(|| {
            MappingError::format(mapping, format!("invalid date/time key '{text}'"))
        })?;
        Ok(Self { source: value.clone(), at })
    }

    fn source(&self) -> &Value {
        &self.source
    }

    fn normalized(&self) -> String {
        self.at.to_string()
    }
}

#[derive(Debug, Clone, PartialEq)]
enum VersionBound {
    Below(Version),
    AtMost(Version),
    Default,
}

#[derive(Debug, Clone, PartialEq)]
struct VersionKey {
    source: Value,
    bound: VersionBound,
}

impl SelectionKey for VersionKey {
    fn from_value(value: &Value, _arity: usize, mapping: &str) -> Result<Self, MappingError> {
        let text = key_text(value, mapping, "version")?.trim();
        let invalid = || MappingError::format(mapping, format!("invalid version key '{text}'"));
        let bound = if text.eq_ignore_ascii_case("default") {
            VersionBound::Default
        } else if let Some(limit) = text.strip_prefix("<=") {
            VersionBound::AtMost(Version::parse(limit).ok_or_else(invalid)?)
        } else if let Some(limit) = text.strip_prefix('<') {
            VersionBound::Below(Version::parse(limit).ok_or_else(invalid)?)
        } else {
            return Err(invalid());
        };
        Ok(Self { source: value.clone(), bound })
    }

    fn source(&self) -> &Value {
        &self.source
    }

    fn normalized(&self) -> String {
        match &self.bound {
            VersionBound::Below(limit) => format!("<{}", limit.canonical()),
            VersionBound::AtMost(limit) => format!("<={}", limit.canonical()),
            VersionBound::Default => "default".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct NumberKey {
    source: Value,
    value: f64,
}

impl SelectionKey for NumberKey {
    fn from_value(value: &Value, _arity: usize, mapping: &str) -> Result<Self, MappingError> {
        let text = key_text(value, mapping, "numeric")?;
        let number = text
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|number| number.is_finite())
            .ok_or_else(|| MappingError::format(mapping, format!("invalid numeric key '{text}'")))?;
        Ok(Self { source: value.clone(), value: number })
    }

    fn source(&self) -> &Value {
        &self.source
    }

    fn normalized(&self) -> String {
        self.value.to_string()
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Strategy {
    Match(Vec<(MatchKey, Choice)>),
    UseAfter(Vec<(TimeKey, Choice)>),
    ClosestTime(Vec<(TimeKey, Choice)>),
    SelectVersion(Vec<(VersionKey, Choice)>),
    Bracket(Vec<(NumberKey, Choice)>),
    GeometricallyNearest(Vec<(NumberKey, Choice)>),
}

/// One selector node: the parameters consulted at this depth and its ordered choices.
#[derive(Debug, Clone, PartialEq)]
pub struct Selector {
    parameters: Vec<String>,
    strategy: Strategy,
}

/// A choice of a selector as seen by tree walkers.
#[derive(Debug, Clone)]
pub struct Entry<'a> {
    /// Key as written in the mapping source.
    pub label: String,
    /// Key after normalization; equal keys select the same datasets.
    pub key: String,
    pub choice: &'a Choice,
}

fn build_choices<K: SelectionKey>(
    entries: &[(Value, Value)],
    arity: usize,
    parkey: &[Vec<String>],
    depth: usize,
    mapping: &str,
) -> Result<Vec<(K, Choice)>, MappingError> {
    let mut seen = HashSet::new();
    let mut choices = Vec::with_capacity(entries.len());
    for (key, child) in entries {
        let key = K::from_value(key, arity, mapping)?;
        if !seen.insert(key.normalized()) {
            return Err(MappingError::DuplicateSelectorKey {
                mapping: mapping.to_string(),
                key: key.source().render(),
            });
        }
        let child = Choice::from_value(child, parkey, depth + 1, mapping)?;
        choices.push((key, child));
    }
    Ok(choices)
}

fn entries_to_value<K: SelectionKey>(choices: &[(K, Choice)]) -> Value {
    Value::Dict(
        choices
            .iter()
            .map(|(key, choice)| (key.source().clone(), choice.to_value()))
            .collect(),
    )
}

fn walk_entries<K: SelectionKey>(choices: &[(K, Choice)]) -> Vec<Entry<'_>> {
    choices
        .iter()
        .map(|(key, choice)| Entry { label: key.source().render(), key: key.normalized(), choice })
        .collect()
}

impl Selector {
    /// Build a selector from its parsed source; `parkey[depth]` names its parameters.
    pub(crate) fn from_value(
        value: &Value,
        parkey: &[Vec<String>],
        depth: usize,
        mapping: &str,
    ) -> Result<Self, MappingError> {
        let Value::Call { name, args } = value else {
            return Err(MappingError::format(
                mapping,
                format!("expected a selector call, found {}", value.describe()),
            ));
        };
        let kind = SelectorKind::parse(name).ok_or_else(|| {
            MappingError::format(mapping, format!("unknown selector kind '{name}'"))
        })?;
        let [Value::Dict(entries)] = args.as_slice() else {
            return Err(MappingError::format(
                mapping,
                format!("{name} takes a single dictionary of choices"),
            ));
        };

        let parameters = parkey.get(depth).cloned().ok_or_else(|| {
            MappingError::parkey(
                mapping,
                format!("{name} selector at nesting depth {} has no parkey entry", depth + 1),
            )
        })?;
        if parameters.is_empty() || (kind.single_parameter() && parameters.len() != 1) {
            return Err(MappingError::parkey(
                mapping,
                format!("{name} selector cannot use parameters {parameters:?}"),
            ));
        }

        let arity = parameters.len();
        let strategy = match kind {
            SelectorKind::Match => {
                Strategy::Match(build_choices(entries, arity, parkey, depth, mapping)?)
            }
            SelectorKind::UseAfter => {
                Strategy::UseAfter(build_choices(entries, arity, parkey, depth, mapping)?)
            }
            SelectorKind::ClosestTime => {
                Strategy::ClosestTime(build_choices(entries, arity, parkey, depth, mapping)?)
            }
            SelectorKind::SelectVersion => {
                Strategy::SelectVersion(build_choices(entries, arity, parkey, depth, mapping)?)
            }
            SelectorKind::Bracket => {
                Strategy::Bracket(build_choices(entries, arity, parkey, depth, mapping)?)
            }
            SelectorKind::GeometricallyNearest => {
                let choices = build_choices(entries, arity, parkey, depth, mapping)?;
                Strategy::GeometricallyNearest(choices)
            }
        };
        Ok(Self { parameters, strategy })
    }

    pub(crate) fn to_value(&self) -> Value {
        let entries = match &self.strategy {
            Strategy::Match(choices) => entries_to_value(choices),
            Strategy::UseAfter(choices) | Strategy::ClosestTime(choices) => {
                entries_to_value(choices)
            }
            Strategy::SelectVersion(choices) => entries_to_value(choices),
            Strategy::Bracket(choices) | Strategy::GeometricallyNearest(choices) => {
                entries_to_value(choices)
            }
        };
        Value::Call { name: self.kind().as_str().to_string(), args: vec![entries] }
    }

    #[must_use]
    pub fn kind(&self) -> SelectorKind {
        match &self.strategy {
            Strategy::Match(_) => SelectorKind::Match,
            Strategy::UseAfter(_) => SelectorKind::UseAfter,
            Strategy::ClosestTime(_) => SelectorKind::ClosestTime,
            Strategy::SelectVersion(_) => SelectorKind::SelectVersion,
            Strategy::Bracket(_) => SelectorKind::Bracket,
            Strategy::GeometricallyNearest(_) => SelectorKind::GeometricallyNearest,
        }
    }

    #[must_use]
    pub fn parameters(&self) -> &[String] {
        &self.parameters
    }

    #[must_use]
    pub fn entries(&self) -> Vec<Entry<'_>> {
        match &self.strategy {
            Strategy::Match(choices) => walk_entries(choices),
            Strategy::UseAfter(choices) | Strategy::ClosestTime(choices) => walk_entries(choices),
            Strategy::SelectVersion(choices) => walk_entries(choices),
            Strategy::Bracket(choices) | Strategy::GeometricallyNearest(choices) => {
                walk_entries(choices)
            }
        }
    }

    /// Number of selector levels from this node down to its leaves.
    #[must_use]
    pub fn depth(&self) -> usize {
        let below = self
            .entries()
            .iter()
            .filter_map(|entry| match entry.choice {
                Choice::Nested(selector) => Some(selector.depth()),
                Choice::Leaf(_) => None,
            })
            .max()
            .unwrap_or(0);
        below + 1
    }

    /// Every filename reachable from this node.
    #[must_use]
    pub fn reference_names(&self) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        for entry in self.entries() {
            match entry.choice {
                Choice::Leaf(leaf) => names.extend(leaf.files().into_iter().map(str::to_string)),
                Choice::Nested(selector) => names.extend(selector.reference_names()),
            }
        }
        names
    }

    /// Choose a leaf for `header`, treating any `Match` tie as an error.
    ///
    /// # Errors
    /// Returns the [`LookupError`] of the first node that cannot select a choice.
    pub fn choose(&self, header: &Header) -> Result<Leaf, LookupError> {
        self.choose_with(header, MatchPolicy::Strict)
    }

    /// Choose a leaf for `header` under an explicit `Match` tie policy.
    ///
    /// # Errors
    /// Returns the [`LookupError`] of the first node that cannot select a choice.
    pub fn choose_with(&self, header: &Header, policy: MatchPolicy) -> Result<Leaf, LookupError> {
        match &self.strategy {
            Strategy::Match(choices) => self.choose_match(choices, header, policy),
            Strategy::UseAfter(choices) => {
                let time = self.dataset_time(header)?;
                let (_, choice) = choices
                    .iter()
                    .filter(|(key, _)| key.at <= time)
                    .max_by_key(|(key, _)| key.at)
                    .ok_or_else(|| LookupError::UseAfter {
                        parameters: self.parameter_label(),
                        time: time.to_string(),
                    })?;
                choice.resolve(header, policy)
            }
            Strategy::ClosestTime(choices) => {
                let time = self.dataset_time(header)?;
                let (_, choice) = choices
                    .iter()
                    .min_by_key(|(key, _)| ((key.at - time).abs(), key.at))
                    .ok_or_else(|| self.no_match(&[Some(time.to_string().as_str())]))?;
                choice.resolve(header, policy)
            }
            Strategy::SelectVersion(choices) => self.choose_version(choices, header, policy),
            Strategy::Bracket(choices) => {
                let value = self.numeric_value(header)?;
                let exact = choices.iter().find(|(key, _)| key.value.total_cmp(&value).is_eq());
                if let Some((_, choice)) = exact {
                    let leaf = choice.resolve(header, policy)?;
                    return Ok(Leaf::Tuple(vec![leaf.clone(), leaf]));
                }
                let lower = choices
                    .iter()
                    .filter(|(key, _)| key.value < value)
                    .max_by(|lhs, rhs| lhs.0.value.total_cmp(&rhs.0.value));
                let upper = choices
                    .iter()
                    .filter(|(key, _)| key.value > value)
                    .min_by(|lhs, rhs| lhs.0.value.total_cmp(&rhs.0.value));
                match (lower, upper) {
                    (Some((_, below)), Some((_, above))) => Ok(Leaf::Tuple(vec![
                        below.resolve(header, policy)?,
                        above.resolve(header, policy)?,
                    ])),
                    _ => Err(LookupError::BadValue {
                        parameter: self.parameter_label(),
                        value: value.to_string(),
                        reason: "outside the bracketed range".to_string(),
                    }),
                }
            }
            Strategy::GeometricallyNearest(choices) => {
                let value = self.numeric_value(header)?;
                let distance = |key: &NumberKey| (key.value - value).abs();
                let (_, choice) = choices
                    .iter()
                    .min_by(|lhs, rhs| {
                        distance(&lhs.0)
                            .total_cmp(&distance(&rhs.0))
                            .then_with(|| lhs.0.value.total_cmp(&rhs.0.value))
                    })
                    .ok_or_else(|| self.no_match(&[Some(value.to_string().as_str())]))?;
                choice.resolve(header, policy)
            }
        }
    }

    fn choose_match(
        &self,
        choices: &[(MatchKey, Choice)],
        header: &Header,
        policy: MatchPolicy,
    ) -> Result<Leaf, LookupError> {
        let values = self.parameters.iter().map(|name| header.get(name)).collect::<Vec<_>>();

        let mut best: Option<MatchRank> = None;
        let mut tied: Vec<&(MatchKey, Choice)> = Vec::new();
        for entry in choices {
            let Some(rank) = entry.0.rank(&values) else {
                continue;
            };
            match best.map(|current| rank.cmp(&current)) {
                None | Some(Ordering::Greater) => {
                    best = Some(rank);
                    tied.clear();
                    tied.push(entry);
                }
                Some(Ordering::Equal) => tied.push(entry),
                Some(Ordering::Less) => {}
            }
        }

        match tied.as_slice() {
            [] => Err(self.no_match(&values)),
            [(_, choice)] => choice.resolve(header, policy),
            candidates => {
                if policy == MatchPolicy::MergeIdentical {
                    let resolved = candidates
                        .iter()
                        .map(|(_, choice)| choice.resolve(header, policy))
                        .collect::<Result<Vec<_>, _>>();
                    if let Ok(leaves) = resolved {
                        if leaves.windows(2).all(|pair| pair[0] == pair[1]) {
                            if let Some(leaf) = leaves.into_iter().next() {
                                return Ok(leaf);
                            }
                        }
                    }
                }
                Err(LookupError::AmbiguousMatch {
                    parameters: self.parameter_label(),
                    candidates: candidates.iter().map(|(key, _)| key.source.render()).collect(),
                })
            }
        }
    }

    fn choose_version(
        &self,
        choices: &[(VersionKey, Choice)],
        header: &Header,
        policy: MatchPolicy,
    ) -> Result<Leaf, LookupError> {
        let raw = self.single_value(header)?;
        let version = Version::parse(raw).ok_or_else(|| LookupError::BadValue {
            parameter: self.parameter_label(),
            value: raw.to_string(),
            reason: "not a dotted numeric version".to_string(),
        })?;

        let tightest = choices
            .iter()
            .filter_map(|(key, choice)| match &key.bound {
                VersionBound::Below(limit) if version < *limit => Some(((limit, 0_u8), choice)),
                VersionBound::AtMost(limit) if version <= *limit => Some(((limit, 1_u8), choice)),
                _ => None,
            })
            .min_by(|lhs, rhs| lhs.0.cmp(&rhs.0))
            .map(|(_, choice)| choice);
        let choice = match tightest {
            Some(choice) => choice,
            None => choices
                .iter()
                .find(|(key, _)| key.bound == VersionBound::Default)
                .map(|(_, choice)| choice)
                .ok_or_else(|| LookupError::VersionAfter { version: raw.to_string() })?,
        };
        choice.resolve(header, policy)
    }

    fn parameter_label(&self) -> String {
        self.parameters.join(", ")
    }

    fn no_match(&self, values: &[Option<&str>]) -> LookupError {
        let rendered = values.iter().map(|value| value.unwrap_or("UNDEFINED")).collect::<Vec<_>>();
        LookupError::NoMatch {
            parameters: self.parameter_label(),
            values: format!("({})", rendered.join(", ")),
        }
    }

    fn single_value<'a>(&self, header: &'a Header) -> Result<&'a str, LookupError> {
        let name = self.parameters.first().map(String::as_str).unwrap_or_default();
        header.get(name).ok_or_else(|| LookupError::MissingParameter(name.to_string()))
    }

    fn numeric_value(&self, header: &Header) -> Result<f64, LookupError> {
        let raw = self.single_value(header)?;
        raw.trim().parse::<f64>().ok().filter(|value| value.is_finite()).ok_or_else(|| {
            LookupError::BadValue {
                parameter: self.parameter_label(),
                value: raw.to_string(),
                reason: "not a number".to_string(),
            }
        })
    }

    fn dataset_time(&self, header: &Header) -> Result<PrimitiveDateTime, LookupError> {
        let mut parts = Vec::with_capacity(self.parameters.len());
        for name in &self.parameters {
            let value =
                header.get(name).ok_or_else(|| LookupError::MissingParameter(name.clone()))?;
            parts.push(value.trim());
        }
        let joined = parts.join(" ");
        parse_timestamp(&joined).ok_or_else(|| LookupError::BadValue {
            parameter: self.parameter_label(),
            value: joined.clone(),
            reason: "not a recognizable date/time".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syntax::parse_module;

    fn selector(parkey: &[&[&str]], source: &str) -> Result<Selector, MappingError> {
        let parkey = parkey
            .iter()
            .map(|level| level.iter().map(|name| (*name).to_string()).collect())
            .collect::<Vec<Vec<String>>>();
        let module = parse_module(&format!("selector = {source}"))
            .unwrap_or_else(|err| panic!("fixture should parse: {err}"));
        Selector::from_value(&module[0].1, &parkey, 0, "fixture.rmap")
    }

    fn header(pairs: &[(&str, &str)]) -> Header {
        pairs.iter().copied().collect()
    }

    fn file(name: &str) -> Leaf {
        Leaf::File(name.to_string())
    }

    #[test]
    fn match_prefers_specific_over_wildcard() -> Result<(), MappingError> {
        let tree = selector(
            &[&["DETECTOR", "CCD"]],
            "Match({('WFC', 'A') : 'f1', ('*', 'A') : 'f2'})",
        )?;
        assert_eq!(tree.choose(&header(&[("DETECTOR", "WFC"), ("CCD", "A")])), Ok(file("f1")));
        assert_eq!(tree.choose(&header(&[("DETECTOR", "HRC"), ("CCD", "A")])), Ok(file("f2")));
        assert!(matches!(
            tree.choose(&header(&[("DETECTOR", "HRC"), ("CCD", "B")])),
            Err(LookupError::NoMatch { .. })
        ));
        Ok(())
    }

    #[test]
    fn match_prefers_literal_over_or_glob() -> Result<(), MappingError> {
        let tree = selector(
            &[&["FILTER"]],
            "Match({'F110W|F140W' : 'glob.fits', 'F110W' : 'exact.fits'})",
        )?;
        assert_eq!(tree.choose(&header(&[("FILTER", "F110W")])), Ok(file("exact.fits")));
        assert_eq!(tree.choose(&header(&[("FILTER", "F140W")])), Ok(file("glob.fits")));
        Ok(())
    }

    #[test]
    fn equal_specificity_is_ambiguous_unless_merge_tolerated() -> Result<(), MappingError> {
        let tree = selector(
            &[&["DETECTOR", "CCD"]],
            "Match({('WFC', '*') : 'same.fits', ('*', 'A') : 'same.fits', \
             ('HRC', '*') : 'h.fits'})",
        )?;
        let dataset = header(&[("DETECTOR", "WFC"), ("CCD", "A")]);
        let Err(LookupError::AmbiguousMatch { candidates, .. }) = tree.choose(&dataset) else {
            panic!("expected ambiguity");
        };
        assert_eq!(candidates.len(), 2);
        assert_eq!(tree.choose_with(&dataset, MatchPolicy::MergeIdentical), Ok(file("same.fits")));

        let conflicting = selector(
            &[&["DETECTOR", "CCD"]],
            "Match({('WFC', '*') : 'a.fits', ('*', 'A') : 'b.fits'})",
        )?;
        assert!(matches!(
            conflicting.choose_with(&dataset, MatchPolicy::MergeIdentical),
            Err(LookupError::AmbiguousMatch { .. })
        ));
        Ok(())
    }

    #[test]
    fn missing_and_wildcard_header_values_match_anything() -> Result<(), MappingError> {
        let tree = selector(&[&["DETECTOR", "CCD"]], "Match({('WFC', 'A') : 'f1'})")?;
        assert_eq!(tree.choose(&header(&[("DETECTOR", "WFC")])), Ok(file("f1")));
        assert_eq!(tree.choose(&header(&[("DETECTOR", "WFC"), ("CCD", "N/A")])), Ok(file("f1")));
        Ok(())
    }

    #[test]
    fn use_after_picks_latest_not_after_observation() -> Result<(), MappingError> {
        let tree = selector(
            &[&["DATE-OBS"]],
            "UseAfter({'2017-04-24' : 'early.fits', '2018-02-01' : 'late.fits'})",
        )?;
        assert_eq!(tree.choose(&header(&[("DATE-OBS", "2017-12-01")])), Ok(file("early.fits")));
        assert_eq!(tree.choose(&header(&[("DATE-OBS", "2018-02-01")])), Ok(file("late.fits")));
        assert!(matches!(
            tree.choose(&header(&[("DATE-OBS", "2017-01-01")])),
            Err(LookupError::UseAfter { .. })
        ));
        assert_eq!(
            tree.choose(&header(&[])),
            Err(LookupError::MissingParameter("DATE-OBS".to_string()))
        );
        assert!(matches!(
            tree.choose(&header(&[("DATE-OBS", "last tuesday")])),
            Err(LookupError::BadValue { .. })
        ));
        Ok(())
    }

    #[test]
    fn use_after_joins_date_and_time_parameters() -> Result<(), MappingError> {
        let tree = selector(
            &[&["DATE-OBS", "TIME-OBS"]],
            "UseAfter({'2020-01-01 00:00:00' : 'midnight.fits', \
             '2020-01-01 12:00:00' : 'noon.fits'})",
        )?;
        let morning = header(&[("DATE-OBS", "2020-01-01"), ("TIME-OBS", "11:59:59")]);
        assert_eq!(tree.choose(&morning), Ok(file("midnight.fits")));
        Ok(())
    }

    #[test]
    fn closest_time_prefers_earlier_on_ties() -> Result<(), MappingError> {
        let tree = selector(
            &[&["EXPSTART"]],
            "ClosestTime({'2020-01-01' : 'a.fits', '2020-01-03' : 'b.fits', \
             '2020-02-01' : 'c.fits'})",
        )?;
        assert_eq!(tree.choose(&header(&[("EXPSTART", "2020-01-02")])), Ok(file("a.fits")));
        assert_eq!(tree.choose(&header(&[("EXPSTART", "2020-01-10")])), Ok(file("b.fits")));
        assert_eq!(tree.choose(&header(&[("EXPSTART", "2019-06-01")])), Ok(file("a.fits")));
        assert_eq!(tree.choose(&header(&[("EXPSTART", "2021-01-01")])), Ok(file("c.fits")));
        Ok(())
    }

    #[test]
    fn select_version_uses_tightest_bound_then_default() -> Result<(), MappingError> {
        let tree = selector(
            &[&["CAL_VER"]],
            "SelectVersion({'<5' : 'old.fits', 'default' : 'new.fits'})",
        )?;
        assert_eq!(tree.choose(&header(&[("CAL_VER", "4.2")])), Ok(file("old.fits")));
        assert_eq!(tree.choose(&header(&[("CAL_VER", "6.0")])), Ok(file("new.fits")));

        let bounded = selector(
            &[&["CAL_VER"]],
            "SelectVersion({'<=3' : 'le3.fits', '<3' : 'lt3.fits', '<7.1' : 'lt71.fits'})",
        )?;
        assert_eq!(bounded.choose(&header(&[("CAL_VER", "2.9")])), Ok(file("lt3.fits")));
        assert_eq!(bounded.choose(&header(&[("CAL_VER", "3.0")])), Ok(file("le3.fits")));
        assert_eq!(bounded.choose(&header(&[("CAL_VER", "7.0.5")])), Ok(file("lt71.fits")));
        assert!(matches!(
            bounded.choose(&header(&[("CAL_VER", "8")])),
            Err(LookupError::VersionAfter { .. })
        ));
        Ok(())
    }

    #[test]
    fn bracket_returns_surrounding_pair() -> Result<(), MappingError> {
        let tree = selector(
            &[&["WAVELENGTH"]],
            "Bracket({1.0 : 'one.fits', 2.5 : 'two.fits', 4 : 'four.fits'})",
        )?;
        let pair = |a: &str, b: &str| Leaf::Tuple(vec![file(a), file(b)]);
        assert_eq!(tree.choose(&header(&[("WAVELENGTH", "3")])), Ok(pair("two.fits", "four.fits")));
        assert_eq!(
            tree.choose(&header(&[("WAVELENGTH", "2.5")])),
            Ok(pair("two.fits", "two.fits"))
        );
        assert!(matches!(
            tree.choose(&header(&[("WAVELENGTH", "9")])),
            Err(LookupError::BadValue { .. })
        ));
        Ok(())
    }

    #[test]
    fn geometrically_nearest_breaks_ties_to_smaller_key() -> Result<(), MappingError> {
        let tree = selector(
            &[&["TEMP"]],
            "GeometricallyNearest({'10' : 'ten.fits', '20' : 'twenty.fits'})",
        )?;
        assert_eq!(tree.choose(&header(&[("TEMP", "15")])), Ok(file("ten.fits")));
        assert_eq!(tree.choose(&header(&[("TEMP", "16")])), Ok(file("twenty.fits")));
        assert_eq!(tree.choose(&header(&[("TEMP", "-100")])), Ok(file("ten.fits")));
        Ok(())
    }

    #[test]
    fn nested_selectors_recurse_with_same_header() -> Result<(), MappingError> {
        let tree = selector(
            &[&["DETECTOR"], &["DATE-OBS"]],
            "Match({'WFC' : UseAfter({'2000-01-01' : 'w2000.fits', '2010-01-01' : 'w2010.fits'}), \
             'HRC' : UseAfter({'2000-01-01' : ('h_lo.fits', 'h_hi.fits')})})",
        )?;
        let wfc = header(&[("DETECTOR", "WFC"), ("DATE-OBS", "2012-03-04")]);
        assert_eq!(tree.choose(&wfc), Ok(file("w2010.fits")));
        assert_eq!(tree.depth(), 2);
        let names = tree.reference_names().into_iter().collect::<Vec<_>>();
        assert_eq!(names, vec!["h_hi.fits", "h_lo.fits", "w2000.fits", "w2010.fits"]);
        Ok(())
    }

    #[test]
    fn special_leaves_are_not_files() -> Result<(), MappingError> {
        let tree = selector(
            &[&["DETECTOR"]],
            "Match({'SBC' : 'N/A', 'HRC' : 'OMIT', 'WFC' : 'w.fits'})",
        )?;
        assert_eq!(tree.choose(&header(&[("DETECTOR", "SBC")])), Ok(Leaf::NotApplicable));
        assert_eq!(tree.choose(&header(&[("DETECTOR", "HRC")])), Ok(Leaf::Omit));
        assert_eq!(tree.reference_names().len(), 1);
        Ok(())
    }

    #[test]
    fn duplicate_keys_are_rejected_after_normalization() {
        let cases = [
            (vec!["DETECTOR"], "Match({'A|B' : 'x', 'B|A' : 'y'})"),
            (vec!["DATE-OBS"], "UseAfter({'2017-04-24' : 'x', '2017-04-24 00:00:00' : 'y'})"),
            (vec!["VER"], "SelectVersion({'<5' : 'x', '<5.0' : 'y'})"),
            (vec!["TEMP"], "Bracket({1 : 'x', '1.0' : 'y'})"),
        ];
        for (parameters, source) in cases {
            let result = selector(&[&parameters], source);
            assert!(
                matches!(result, Err(MappingError::DuplicateSelectorKey { .. })),
                "{source} should be rejected, got {result:?}"
            );
        }
    }

    #[test]
    fn parkey_shape_is_enforced() {
        let too_shallow = selector(&[&["DETECTOR"], &["DATE-OBS"]], "Match({'WFC' : 'w.fits'})");
        assert!(matches!(too_shallow, Err(MappingError::InconsistentParkey { .. })));

        let too_deep = selector(
            &[&["DETECTOR"]],
            "Match({'WFC' : UseAfter({'2000-01-01' : 'w.fits'})})",
        );
        assert!(matches!(too_deep, Err(MappingError::InconsistentParkey { .. })));

        let wrong_arity = selector(&[&["DETECTOR", "CCD"]], "Match({'WFC' : 'w.fits'})");
        assert!(matches!(wrong_arity, Err(MappingError::InconsistentParkey { .. })));

        let two_versions = selector(&[&["A", "B"]], "SelectVersion({'default' : 'x'})");
        assert!(matches!(two_versions, Err(MappingError::InconsistentParkey { .. })));
    }

    #[test]
    fn malformed_selectors_are_format_errors() {
        for source in [
            "Lookup({'a' : 'b'})",
            "Match('a')",
            "UseAfter({'soon' : 'x'})",
            "Match({'a' : 3})",
        ] {
            let result = selector(&[&["DETECTOR"]], source);
            assert!(matches!(result, Err(MappingError::Format { .. })), "{source}: {result:?}");
        }
    }
}
