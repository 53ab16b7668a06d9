use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};

use serde::Serialize;

use crate::mapping::{MappingBody, MappingDocument, NameTable};
use crate::name::MappingName;
use crate::selector::{Choice, Selector};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DiffAction {
    Added,
    Replaced,
    Deleted,
}

impl DiffAction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Added => "added",
            Self::Replaced => "replaced",
            Self::Deleted => "deleted",
        }
    }
}

/// One change between two mappings, located by the keys leading to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Difference {
    pub path: Vec<String>,
    pub action: DiffAction,
    pub old: Option<String>,
    pub new: Option<String>,
}

impl Difference {
    fn new(path: &[String], action: DiffAction, old: Option<String>, new: Option<String>) -> Self {
        Self { path: path.to_vec(), action, old, new }
    }

    /// A replacement of one mapping by an older revision of the same series.
    #[must_use]
    pub fn is_reversion(&self) -> bool {
        if self.action != DiffAction::Replaced {
            return false;
        }
        let (Some(old), Some(new)) = (&self.old, &self.new) else {
            return false;
        };
        match (MappingName::parse(old), MappingName::parse(new)) {
            (Ok(old), Ok(new)) => old.is_newer_than(&new),
            _ => false,
        }
    }

    /// Both sides of a table replacement when they name mappings.
    #[must_use]
    pub fn replaced_mappings(&self) -> Option<(&str, &str)> {
        match (self.action, &self.old, &self.new) {
            (DiffAction::Replaced, Some(old), Some(new))
                if MappingName::parse(old).is_ok() && MappingName::parse(new).is_ok() =>
            {
                Some((old, new))
            }
            _ => None,
        }
    }

    /// Copy of this difference located under `prefix`.
    #[must_use]
    pub fn nested_under(&self, prefix: &[String]) -> Self {
        let mut path = prefix.to_vec();
        path.extend(self.path.iter().cloned());
        Self { path, ..self.clone() }
    }
}

impl Display for Difference {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.path.join(" / "), self.action.as_str())?;
        match (&self.old, &self.new) {
            (Some(old), Some(new)) => write!(f, " {old} -> {new}"),
            (Some(old), None) => write!(f, " {old}"),
            (None, Some(new)) => write!(f, " {new}"),
            (None, None) => Ok(()),
        }
    }
}

/// Structural differences from `old` to `new`, header first, then body.
///
/// The `name` header entry is skipped since it differs between any two revisions.
#[must_use]
pub fn diff_documents(old: &MappingDocument, new: &MappingDocument) -> Vec<Difference> {
    let mut differences = Vec::new();

    let keys = old.header().keys().chain(new.header().keys()).collect::<BTreeSet<_>>();
    for key in keys.into_iter().filter(|key| key.as_str() != "name") {
        let path = vec!["header".to_string(), key.clone()];
        let before = old.header().get(key).map(ToString::to_string);
        let after = new.header().get(key).map(ToString::to_string);
        push_change(&mut differences, &path, before, after);
    }

    match (old.body(), new.body()) {
        (MappingBody::Table(before), MappingBody::Table(after)) => {
            diff_tables(&mut differences, before, after);
        }
        (MappingBody::Selector(before), MappingBody::Selector(after)) => {
            diff_selectors(&mut differences, &[], before, after);
        }
        _ => differences.push(Difference::new(
            &["selector".to_string()],
            DiffAction::Replaced,
            Some(old.kind().as_str().to_string()),
            Some(new.kind().as_str().to_string()),
        )),
    }
    differences
}

fn push_change(
    differences: &mut Vec<Difference>,
    path: &[String],
    before: Option<String>,
    after: Option<String>,
) {
    let action = match (&before, &after) {
        (None, Some(_)) => DiffAction::Added,
        (Some(_), None) => DiffAction::Deleted,
        (Some(before), Some(after)) if before != after => DiffAction::Replaced,
        _ => return,
    };
    differences.push(Difference::new(path, action, before, after));
}

fn diff_tables(differences: &mut Vec<Difference>, before: &NameTable, after: &NameTable) {
    let keys = before
        .iter()
        .chain(after.iter())
        .map(|(key, _)| key.to_ascii_uppercase())
        .collect::<BTreeSet<_>>();
    for key in keys {
        let old = before.get(&key).map(str::to_string);
        let new = after.get(&key).map(str::to_string);
        push_change(differences, &[key], old, new);
    }
}

fn describe_choice(choice: &Choice) -> String {
    match choice {
        Choice::Leaf(leaf) => leaf.to_string(),
        Choice::Nested(selector) => describe_selector(selector),
    }
}

fn describe_selector(selector: &Selector) -> String {
    format!("{}({})", selector.kind().as_str(), selector.parameters().join(", "))
}

fn diff_selectors(
    differences: &mut Vec<Difference>,
    path: &[String],
    before: &Selector,
    after: &Selector,
) {
    if before.kind() != after.kind() || before.parameters() != after.parameters() {
        let location = if path.is_empty() { vec!["selector".to_string()] } else { path.to_vec() };
        differences.push(Difference::new(
            &location,
            DiffAction::Replaced,
            Some(describe_selector(before)),
            Some(describe_selector(after)),
        ));
        return;
    }

    let old_entries = before.entries();
    let new_entries = after.entries();
    for entry in &old_entries {
        let mut location = path.to_vec();
        location.push(entry.label.clone());
        match new_entries.iter().find(|candidate| candidate.key == entry.key) {
            None => differences.push(Difference::new(
                &location,
                DiffAction::Deleted,
                Some(describe_choice(entry.choice)),
                None,
            )),
            Some(replacement) => match (entry.choice, replacement.choice) {
                (Choice::Nested(old), Choice::Nested(new)) => {
                    diff_selectors(differences, &location, old, new);
                }
                (old, new) => push_change(
                    differences,
                    &location,
                    Some(describe_choice(old)),
                    Some(describe_choice(new)),
                ),
            },
        }
    }
    for entry in new_entries
        .iter()
        .filter(|entry| old_entries.iter().all(|old| old.key != entry.key))
    {
        let mut location = path.to_vec();
        location.push(entry.label.clone());
        differences.push(Difference::new(
            &location,
            DiffAction::Added,
            None,
            Some(describe_choice(entry.choice)),
        ));
    }
}
