use std::cmp::Ordering;
use std::fmt::{Display, Formatter};
use std::path::{Component, Path};
use std::str::FromStr;

use crate::mapping::MappingKind;
use crate::MappingError;

/// Parsed mapping filename: `<observatory>[_<instrument>[_<filekind>]][_<serial>].<ext>`.
///
/// Ordering is "newer sorts later": series first, then serial (an unserialed
/// development name sorts before serial 0), then the full name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MappingName {
    name: String,
    kind: MappingKind,
    observatory: String,
    instrument: Option<String>,
    filekind: Option<String>,
    serial: Option<u32>,
}

/// True when `name` is a single file name that cannot address anything outside
/// the directory it is joined onto.
#[must_use]
pub fn is_plain_file_name(name: &str) -> bool {
    if name.contains(['/', '\\']) {
        return false;
    }
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(part)), None) if *part == *name
    )
}

fn valid_field(field: &str) -> bool {
    !field.is_empty()
        && field.chars().all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_')
}

impl MappingName {
    /// Parse and validate a mapping filename.
    ///
    /// # Errors
    /// Returns [`MappingError::InvalidName`] when the extension is not a mapping
    /// extension or the number of name fields does not fit the kind.
    pub fn parse(name: &str) -> Result<Self, MappingError> {
        let invalid = || MappingError::InvalidName(name.to_string());
        let (stem, extension) = name.rsplit_once('.').ok_or_else(invalid)?;
        let kind = MappingKind::from_extension(extension).ok_or_else(invalid)?;

        let mut fields = stem.split('_').collect::<Vec<_>>();
        let serial = fields
            .last()
            .filter(|last| last.len() == 4 && last.chars().all(|ch| ch.is_ascii_digit()))
            .and_then(|last| last.parse::<u32>().ok())
            .filter(|_| fields.len() > 1);
        if serial.is_some() {
            fields.pop();
        }

        let required = match kind {
            MappingKind::Pipeline => 1,
            MappingKind::Instrument => 2,
            MappingKind::Reference => 3,
        };
        if fields.len() < required || (kind != MappingKind::Reference && fields.len() != required) {
            return Err(invalid());
        }
        if !fields.iter().all(|field| valid_field(field)) {
            return Err(invalid());
        }

        Ok(Self {
            name: name.to_string(),
            kind,
            observatory: fields[0].to_ascii_lowercase(),
            instrument: fields.get(1).map(|field| field.to_ascii_lowercase()),
            filekind: (fields.len() > 2).then(|| fields[2..].join("_").to_ascii_lowercase()),
            serial,
        })
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn kind(&self) -> MappingKind {
        self.kind
    }

    #[must_use]
    pub fn observatory(&self) -> &str {
        &self.observatory
    }

    #[must_use]
    pub fn instrument(&self) -> Option<&str> {
        self.instrument.as_deref()
    }

    #[must_use]
    pub fn filekind(&self) -> Option<&str> {
        self.filekind.as_deref()
    }

    #[must_use]
    pub fn serial(&self) -> Option<u32> {
        self.serial
    }

    /// Series key shared by every revision of the same mapping.
    #[must_use]
    pub fn series(&self) -> String {
        let mut parts = vec![self.observatory.as_str()];
        parts.extend(self.instrument.as_deref());
        parts.extend(self.filekind.as_deref());
        format!("{}.{}", parts.join("_"), self.kind.extension())
    }

    /// True when `self` is a later revision of the same series than `other`.
    #[must_use]
    pub fn is_newer_than(&self, other: &Self) -> bool {
        self.series() == other.series() && self > other
    }
}

impl Ord for MappingName {
    fn cmp(&self, other: &Self) -> Ordering {
        self.series()
            .cmp(&other.series())
            .then_with(|| self.serial.cmp(&other.serial))
            .then_with(|| self.name.cmp(&other.name))
    }
}

impl PartialOrd for MappingName {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl FromStr for MappingName {
    type Err = MappingError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value)
    }
}

impl Display for MappingName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(name: &str) -> MappingName {
        MappingName::parse(name).unwrap_or_else(|err| panic!("{name}: {err}"))
    }

    #[test]
    fn plain_file_names_stay_inside_their_directory() {
        for name in ["hrc_bia.fits", "wfc 2010.fits", "x..fits"] {
            assert!(is_plain_file_name(name), "{name} should be accepted");
        }
        for name in [
            "",
            ".",
            "..",
            "../outside.fits",
            "../../outside.fits",
            "/etc/passwd",
            "sub/ref.fits",
            "ref.fits/",
            "..\\up.fits",
        ] {
            assert!(!is_plain_file_name(name), "{name} should be rejected");
        }
    }

    #[test]
    fn parses_each_kind() {
        let pipeline = parse("hst_0042.pmap");
        assert_eq!(pipeline.kind(), MappingKind::Pipeline);
        assert_eq!(pipeline.serial(), Some(42));
        assert_eq!(pipeline.instrument(), None);

        let instrument = parse("hst_acs_0003.imap");
        assert_eq!(instrument.instrument(), Some("acs"));

        let reference = parse("jwst_nircam_dark_0123.rmap");
        assert_eq!(reference.observatory(), "jwst");
        assert_eq!(reference.filekind(), Some("dark"));
        assert_eq!(reference.serial(), Some(123));

        let development = parse("hst_acs_biasfile.rmap");
        assert_eq!(development.serial(), None);
        assert_eq!(development.series(), "hst_acs_biasfile.rmap");
    }

    #[test]
    fn rejects_malformed_names() {
        for name in [
            "hst.fits",
            "hst_acs_0001.pmap",
            "hst_0001.imap",
            "hst_acs.rmap",
            "noext",
            "hst__0001.pmap",
        ] {
            assert!(MappingName::parse(name).is_err(), "{name} should be rejected");
        }
    }

    #[test]
    fn newer_serials_sort_later_within_a_series() {
        let older = parse("hst_0099.pmap");
        let newer = parse("hst_0100.pmap");
        let development = parse("hst.pmap");
        assert!(newer.is_newer_than(&older));
        assert!(!older.is_newer_than(&newer));
        assert!(older.is_newer_than(&development));
        assert!(!parse("hst_acs_0002.imap").is_newer_than(&parse("hst_wfc3_0001.imap")));

        let mut names = vec![newer.clone(), development.clone(), older.clone()];
        names.sort();
        assert_eq!(names, vec![development, older, newer]);
    }
}
