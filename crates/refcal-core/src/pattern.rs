use glob::{MatchOptions, Pattern, PatternError};

use crate::header::Header;

/// One parameter position of a `Match` selector key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchPattern {
    /// `*` or `N/A`: compatible with every value.
    Wildcard,
    Literal(String),
    /// `|`-separated alternatives, each possibly containing `*` / `?` globs.
    OrGlob(Vec<Glob>),
}

/// One `|` alternative. Only `*` and `?` are special; everything else is literal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Glob {
    text: String,
    pattern: Pattern,
}

/// How a pattern matched, from least to most specific.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum Specificity {
    Wildcard,
    Pattern,
    Exact,
}

const GLOB_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: false,
    require_literal_separator: false,
    require_literal_leading_dot: false,
};

impl Glob {
    fn parse(text: &str) -> Result<Self, PatternError> {
        let text = text.trim().to_ascii_uppercase();
        let mut source = String::with_capacity(text.len());
        let mut literal = String::new();
        for ch in text.chars() {
            match ch {
                '*' | '?' => {
                    source.push_str(&Pattern::escape(&std::mem::take(&mut literal)));
                    // glob reserves `**`; a run of `*` matches like a single one.
                    if !(ch == '*' && source.ends_with('*')) {
                        source.push(ch);
                    }
                }
                ch => literal.push(ch),
            }
        }
        source.push_str(&Pattern::escape(&literal));
        Ok(Self { pattern: Pattern::new(&source)?, text })
    }

    fn is_match(&self, value: &str) -> bool {
        self.pattern.matches_with(value.trim(), GLOB_OPTIONS)
    }
}

impl MatchPattern {
    /// # Errors
    /// Returns [`PatternError`] when an alternative cannot be compiled.
    pub fn parse(text: &str) -> Result<Self, PatternError> {
        let trimmed = text.trim();
        if Header::is_wildcard(trimmed) {
            return Ok(Self::Wildcard);
        }
        if trimmed.contains(['|', '*', '?']) {
            let globs = trimmed.split('|').map(Glob::parse).collect::<Result<Vec<_>, _>>()?;
            return Ok(Self::OrGlob(globs));
        }
        Ok(Self::Literal(trimmed.to_string()))
    }

    /// Normalized form used for duplicate-key detection.
    #[must_use]
    pub fn normalized(&self) -> String {
        match self {
            Self::Wildcard => "*".to_string(),
            Self::Literal(text) => text.to_ascii_uppercase(),
            Self::OrGlob(globs) => {
                let mut alternatives =
                    globs.iter().map(|glob| glob.text.clone()).collect::<Vec<_>>();
                alternatives.sort();
                alternatives.dedup();
                alternatives.join("|")
            }
        }
    }

    /// `None` when incompatible; a header value that is missing or a wildcard is
    /// compatible with every pattern.
    pub(crate) fn specificity(&self, value: Option<&str>) -> Option<Specificity> {
        let matches = match (self, value) {
            (Self::Wildcard, _) => return Some(Specificity::Wildcard),
            (_, None) => true,
            (_, Some(value)) if Header::is_wildcard(value) => true,
            (Self::Literal(text), Some(value)) => text.eq_ignore_ascii_case(value.trim()),
            (Self::OrGlob(globs), Some(value)) => globs.iter().any(|glob| glob.is_match(value)),
        };
        if !matches {
            return None;
        }
        Some(match self {
            Self::Literal(_) => Specificity::Exact,
            _ => Specificity::Pattern,
        })
    }
}
