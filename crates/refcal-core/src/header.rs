use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

/// Dataset parameters as uppercase keyword → string value.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(transparent)]
pub struct Header(BTreeMap<String, String>);

impl Header {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl AsRef<str>, value: impl Into<String>) {
        self.0.insert(key.as_ref().trim().to_ascii_uppercase(), value.into());
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(&key.trim().to_ascii_uppercase()).map(String::as_str)
    }

    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(key, value)| (key.as_str(), value.as_str()))
    }

    /// True for the values that match any pattern: `*` and `N/A`.
    #[must_use]
    pub fn is_wildcard(value: &str) -> bool {
        let value = value.trim();
        value == "*" || value.eq_ignore_ascii_case("N/A")
    }
}

impl<K, V> FromIterator<(K, V)> for Header
where
    K: AsRef<str>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut header = Self::new();
        for (key, value) in iter {
            header.insert(key, value);
        }
        header
    }
}

impl Display for Header {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let parts = self.iter().map(|(key, value)| format!("{key}={value}")).collect::<Vec<_>>();
        write!(f, "{{{}}}", parts.join(", "))
    }
}
