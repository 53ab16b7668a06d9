//! A small ACS context installed into a temporary cache.

use std::collections::BTreeSet;

use refcal_cache::{install_file, CacheLayout};
use refcal_core::{Header, MappingDocument, ParseOptions};
use tempfile::TempDir;

pub(crate) const CONTEXT: &str = "hst_0001.pmap";
pub(crate) const IMAP: &str = "hst_acs_0001.imap";

const PMAP_TEXT: &str = "header = {
    'mapping' : 'PIPELINE',
    'name' : 'hst_0001.pmap',
    'observatory' : 'HST',
}
selector = {
    'ACS' : 'hst_acs_0001.imap',
}
";

const IMAP_TEXT: &str = "header = {
    'instrument' : 'ACS',
    'mapping' : 'INSTRUMENT',
    'name' : 'hst_acs_0001.imap',
    'observatory' : 'HST',
}
selector = {
    'biasfile' : 'hst_acs_biasfile_0001.rmap',
    'crrejtab' : 'hst_acs_crrejtab_0001.rmap',
    'darkfile' : 'N/A',
    'flatfile' : 'hst_acs_flatfile_0001.rmap',
}
";

const BIAS_TEXT: &str = "header = {
    'filekind' : 'BIASFILE',
    'instrument' : 'ACS',
    'mapping' : 'REFERENCE',
    'name' : 'hst_acs_biasfile_0001.rmap',
    'observatory' : 'HST',
    'parkey' : (('DETECTOR',), ('DATE-OBS',)),
}
selector = Match({
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
})
";

const FLAT_TEXT: &str = r#"header = {
    'filekind' : 'FLATFILE',
    'instrument' : 'ACS',
    'mapping' : 'REFERENCE',
    'name' : 'hst_acs_flatfile_0001.rmap',
    'observatory' : 'HST',
    'parkey' : (('DETECTOR',),),
    'rmap_relevance' : "(DETECTOR != 'HRC')",
}
selector = Match({
    'WFC' : 'wfc_flat.fits',
})
"#;

const CRREJ_TEXT: &str = r#"header = {
    'filekind' : 'CRREJTAB',
    'instrument' : 'ACS',
    'mapping' : 'REFERENCE',
    'name' : 'hst_acs_crrejtab_0001.rmap',
    'observatory' : 'HST',
    'parkey' : (('DETECTOR',),),
    'rmap_omit' : "DETECTOR == 'HRC'",
}
selector = Match({
    'HRC' : 'hrc_crr.fits',
    'WFC' : 'wfc_crr.fits',
})
"#;

pub(crate) fn header(pairs: &[(&str, &str)]) -> Header {
    pairs.iter().copied().collect()
}

/// A cache root holding the whole context with valid checksums, recorded as synced.
pub(crate) struct Fixture {
    root: TempDir,
}

impl Fixture {
    pub(crate) fn complete() -> anyhow::Result<Self> {
        let root = tempfile::tempdir()?;
        let layout = CacheLayout::new(root.path());
        layout.ensure_dirs()?;
        for text in [PMAP_TEXT, IMAP_TEXT, BIAS_TEXT, FLAT_TEXT, CRREJ_TEXT] {
            let document = MappingDocument::parse(text.as_bytes(), ParseOptions::unverified())?;
            install_file(&layout.mapping_path(document.name()), document.serialize().as_bytes())?;
        }
        layout.write_complete_contexts(&BTreeSet::from([CONTEXT.to_string()]))?;
        Ok(Self { root })
    }

    /// Leave the mappings in place but drop the record that a sync completed.
    pub(crate) fn forget_sync_record(&self) -> anyhow::Result<()> {
        self.layout().write_complete_contexts(&BTreeSet::new())?;
        Ok(())
    }

    pub(crate) fn layout(&self) -> CacheLayout {
        CacheLayout::new(self.root.path())
    }
}
