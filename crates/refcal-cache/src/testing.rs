//! Mapping fixtures shared by the cache tests.

use std::fs;
use std::path::Path;

use refcal_core::{MappingDocument, MappingName, ParseOptions};
use tempfile::TempDir;

use crate::error::CacheError;
use crate::layout::{install_file, CacheLayout};

pub(crate) const CONTEXT: &str = "hst_0001.pmap";
pub(crate) const IMAP: &str = "hst_acs_0001.imap";
pub(crate) const RMAP: &str = "hst_acs_biasfile_0001.rmap";
pub(crate) const REFERENCES: [&str; 3] = ["hrc_bia.fits", "wfc_2002_bia.fits", "wfc_2010_bia.fits"];

pub(crate) const RMAP_BODY: &str = "Match({
    'HRC' : UseAfter({
        '1996-01-01' : 'hrc_bia.fits',
    }),
    'SBC' : UseAfter({
        '1996-01-01' : 'N/A',
    }),
    'WFC' : UseAfter({
        '2002-03-01' : 'wfc_2002_bia.fits',
        '2010-01-01' : 'wfc_2010_bia.fits',
    }),
})";

fn canonical(source: &str) -> String {
    MappingDocument::parse(source.as_bytes(), ParseOptions::unverified())
        .unwrap_or_else(|err| panic!("fixture mapping should parse: {err}"))
        .serialize()
}

fn table(entries: &[(&str, &str)]) -> String {
    let lines = entries
        .iter()
        .map(|(key, child)| format!("    '{key}' : '{child}',\n"))
        .collect::<String>();
    format!("{{\n{lines}}}")
}

fn parsed_name(name: &str) -> MappingName {
    MappingName::parse(name).unwrap_or_else(|err| panic!("fixture name {name}: {err}"))
}

pub(crate) fn pmap(name: &str, entries: &[(&str, &str)]) -> String {
    let parsed = parsed_name(name);
    canonical(&format!(
        "header = {{'mapping' : 'PIPELINE', 'name' : '{name}', 'observatory' : '{}'}}\n\
         selector = {}\n",
        parsed.observatory().to_ascii_uppercase(),
        table(entries)
    ))
}

pub(crate) fn imap(name: &str, entries: &[(&str, &str)]) -> String {
    let parsed = parsed_name(name);
    canonical(&format!(
        "header = {{'instrument' : '{}', 'mapping' : 'INSTRUMENT', 'name' : '{name}', \
         'observatory' : '{}'}}\n\
         selector = {}\n",
        parsed.instrument().unwrap_or_default().to_ascii_uppercase(),
        parsed.observatory().to_ascii_uppercase(),
        table(entries)
    ))
}

pub(crate) fn rmap(name: &str, body: &str) -> String {
    let parsed = parsed_name(name);
    canonical(&format!(
        "header = {{'filekind' : '{}', 'instrument' : '{}', 'mapping' : 'REFERENCE', \
         'name' : '{name}', \
         'observatory' : '{}', 'parkey' : (('DETECTOR',), ('DATE-OBS',))}}\nselector = {body}\n",
        parsed.filekind().unwrap_or_default().to_ascii_uppercase(),
        parsed.instrument().unwrap_or_default().to_ascii_uppercase(),
        parsed.observatory().to_ascii_uppercase(),
    ))
}

/// Install canonical mapping text into the mapping directory under its header name.
pub(crate) fn install(layout: &CacheLayout, text: &str) -> Result<(), CacheError> {
    let document = MappingDocument::parse(text.as_bytes(), ParseOptions::default())?;
    install_file(&layout.mapping_path(document.name()), text.as_bytes())
}

pub(crate) fn reference_bytes(name: &str) -> Vec<u8> {
    format!("reference data for {name}\n").into_bytes()
}

/// A flat mirror directory holding one complete context, plus an empty cache root.
pub(crate) struct Fixture {
    mirror: TempDir,
    cache: TempDir,
}

impl Fixture {
    pub(crate) fn standard() -> anyhow::Result<Self> {
        let mirror = tempfile::tempdir()?;
        let files = [
            (CONTEXT.to_string(), pmap(CONTEXT, &[("ACS", IMAP)])),
            (IMAP.to_string(), imap(IMAP, &[("biasfile", RMAP), ("darkfile", "N/A")])),
            (RMAP.to_string(), rmap(RMAP, RMAP_BODY)),
        ];
        for (name, text) in files {
            fs::write(mirror.path().join(name), text)?;
        }
        for name in REFERENCES {
            fs::write(mirror.path().join(name), reference_bytes(name))?;
        }
        Ok(Self { mirror, cache: tempfile::tempdir()? })
    }

    pub(crate) fn mirror_path(&self) -> &Path {
        self.mirror.path()
    }

    /// Layout over the (initially empty) cache root.
    pub(crate) fn layout(&self) -> CacheLayout {
        CacheLayout::new(self.cache.path())
    }

    /// Layout over the cache root after copying every mirror file into place.
    pub(crate) fn installed(&self) -> anyhow::Result<CacheLayout> {
        let layout = self.layout();
        layout.ensure_dirs()?;
        for entry in fs::read_dir(self.mirror.path())? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            fs::copy(entry.path(), layout.path_for(&name))?;
        }
        Ok(layout)
    }
}
