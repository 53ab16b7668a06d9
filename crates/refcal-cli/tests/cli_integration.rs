use std::ffi::OsStr;
use std::fs;
use std::path::Path;
use std::process::{Command, Output};

use refcal_core::{MappingDocument, ParseOptions};
use serde_json::Value;
use tempfile::TempDir;

const CONTEXT: &str = "hst_0001.pmap";

fn pmap(name: &str, imap: &str) -> String {
    format!(
        "header = {{'mapping' : 'PIPELINE', 'name' : '{name}', 'observatory' : 'HST'}}\n\
         selector = {{'ACS' : '{imap}'}}\n"
    )
}

fn imap(name: &str, rmap: &str) -> String {
    format!(
        "header = {{'instrument' : 'ACS', 'mapping' : 'INSTRUMENT', 'name' : '{name}', \
         'observatory' : 'HST'}}\n\
         selector = {{'biasfile' : '{rmap}', 'darkfile' : 'N/A'}}\n"
    )
}

fn rmap(name: &str, wfc_file: &str) -> String {
    format!(
        "header = {{'filekind' : 'BIASFILE', 'instrument' : 'ACS', 'mapping' : 'REFERENCE', \
         'name' : '{name}', \
         'observatory' : 'HST', 'parkey' : (('DETECTOR',), ('DATE-OBS',))}}\n\
         selector = Match({{\n\
             'HRC' : UseAfter({{'1996-01-01' : 'hrc_bia.fits'}}),\n\
             'WFC' : UseAfter({{'2002-03-01' : 'wfc_2002_bia.fits', \
             '2010-01-01' : '{wfc_file}'}}),\n\
         }})\n"
    )
}

fn canonical(source: &str) -> (String, String) {
    let document = MappingDocument::parse(source.as_bytes(), ParseOptions::unverified())
        .unwrap_or_else(|err| panic!("fixture mapping should parse: {err}"));
    (document.name().to_string(), document.serialize())
}

/// Flat mirror holding two successive contexts and every file they name.
fn mirror() -> TempDir {
    let dir =
        tempfile::tempdir().unwrap_or_else(|err| panic!("failed to create mirror dir: {err}"));
    let sources = [
        pmap(CONTEXT, "hst_acs_0001.imap"),
        imap("hst_acs_0001.imap", "hst_acs_biasfile_0001.rmap"),
        rmap("hst_acs_biasfile_0001.rmap", "wfc_2010_bia.fits"),
        pmap("hst_0002.pmap", "hst_acs_0002.imap"),
        imap("hst_acs_0002.imap", "hst_acs_biasfile_0002.rmap"),
        rmap("hst_acs_biasfile_0002.rmap", "wfc_2011_bia.fits"),
    ];
    for source in sources {
        let (name, text) = canonical(&source);
        write(&dir.path().join(name), text.as_bytes());
    }
    for name in ["hrc_bia.fits", "wfc_2002_bia.fits", "wfc_2010_bia.fits", "wfc_2011_bia.fits"] {
        write(&dir.path().join(name), format!("reference data for {name}\n").as_bytes());
    }
    dir
}

fn cache_dir() -> TempDir {
    tempfile::tempdir().unwrap_or_else(|err| panic!("failed to create cache dir: {err}"))
}

fn write(path: &Path, bytes: &[u8]) {
    fs::write(path, bytes)
        .unwrap_or_else(|err| panic!("failed to write {}: {err}", path.display()));
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap_or_else(|| panic!("path should be valid UTF-8: {}", path.display()))
}

fn run_refcal<I, S>(cache: &Path, args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_refcal"))
        .arg("--cache")
        .arg(cache)
        .args(args)
        .env_remove("REFCAL_PATH")
        .env_remove("REFCAL_CONTEXT")
        .env_remove("REFCAL_MODE")
        .env_remove("REFCAL_SERVER_URL")
        .env_remove("REFCAL_ALLOW_FALLBACK")
        .output()
        .unwrap_or_else(|err| panic!("failed to execute refcal binary: {err}"))
}

fn run_json<I, S>(cache: &Path, args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_refcal(cache, args);
    if !output.status.success() {
        panic!(
            "refcal command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
            output.status,
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
    }
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    serde_json::from_str(&stdout)
        .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"))
}

fn sync(cache: &Path, mirror: &Path, context: &str) -> Value {
    run_json(cache, ["sync", "--context", context, "--mirror", path_str(mirror)])
}

fn string_list(value: &Value, key: &str) -> Vec<String> {
    value
        .get(key)
        .and_then(Value::as_array)
        .unwrap_or_else(|| panic!("missing array field `{key}` in payload: {value}"))
        .iter()
        .filter_map(Value::as_str)
        .map(str::to_string)
        .collect()
}

#[test]
fn sync_then_resolve_locally() {
    let mirror = mirror();
    let cache = cache_dir();

    let first = sync(cache.path(), mirror.path(), CONTEXT);
    assert_eq!(first["contract_version"], "cli.v1");
    assert_eq!(string_list(&first, "downloaded").len(), 6);
    assert_eq!(string_list(&first, "complete_contexts"), vec![CONTEXT.to_string()]);
    let second = sync(cache.path(), mirror.path(), CONTEXT);
    assert!(string_list(&second, "downloaded").is_empty());

    let resolved = run_json(
        cache.path(),
        [
            "bestrefs",
            "--context",
            CONTEXT,
            "--header",
            "INSTRUME=ACS",
            "--header",
            "DETECTOR=WFC",
            "--header",
            "DATE-OBS=2012-05-01",
        ],
    );
    assert_eq!(resolved["source"], "local");
    assert_eq!(resolved["refs"]["biasfile"]["status"], "file");
    assert_eq!(resolved["refs"]["biasfile"]["value"], "wfc_2010_bia.fits");
    assert_eq!(resolved["refs"]["darkfile"]["status"], "irrelevant");
}

#[test]
fn header_file_and_reftype_filter() {
    let mirror = mirror();
    let cache = cache_dir();
    sync(cache.path(), mirror.path(), CONTEXT);

    let header_path = cache.path().join("dataset.json");
    write(&header_path, br#"{"INSTRUME": "ACS", "DETECTOR": "HRC", "DATE-OBS": "2003-01-01"}"#);
    let resolved = run_json(
        cache.path(),
        [
            "bestrefs",
            "--context",
            CONTEXT,
            "--header-file",
            path_str(&header_path),
            "--reftype",
            "biasfile",
        ],
    );
    let refs = resolved["refs"]
        .as_object()
        .unwrap_or_else(|| panic!("refs should be an object: {resolved}"));
    assert_eq!(refs.len(), 1);
    assert_eq!(refs["biasfile"]["value"], "hrc_bia.fits");
}

#[test]
fn list_reports_the_context_closure() {
    let mirror = mirror();
    let cache = cache_dir();
    sync(cache.path(), mirror.path(), CONTEXT);

    let listed = run_json(cache.path(), ["list", "--context", CONTEXT]);
    assert_eq!(
        string_list(&listed, "mappings"),
        vec!["hst_0001.pmap", "hst_acs_0001.imap", "hst_acs_biasfile_0001.rmap"]
    );
    assert_eq!(
        string_list(&listed, "references"),
        vec!["hrc_bia.fits", "wfc_2002_bia.fits", "wfc_2010_bia.fits"]
    );
    assert!(string_list(&listed, "missing_mappings").is_empty());
    assert!(string_list(&listed, "missing_references").is_empty());
    assert_eq!(listed["recorded_complete"], true);
}

#[test]
fn diff_recurses_through_the_hierarchy() {
    let mirror = mirror();
    let cache = cache_dir();
    sync(cache.path(), mirror.path(), CONTEXT);
    sync(cache.path(), mirror.path(), "hst_0002.pmap");

    let diff = run_json(cache.path(), ["diff", CONTEXT, "hst_0002.pmap"]);
    let differences =
        diff["differences"].as_array().unwrap_or_else(|| panic!("differences array: {diff}"));
    assert_eq!(differences.len(), 3);
    let deepest = &differences[2];
    assert_eq!(deepest["old"], "wfc_2010_bia.fits");
    assert_eq!(deepest["new"], "wfc_2011_bia.fits");
    assert_eq!(diff["reversions"], 0);
}

#[test]
fn checksum_rewrite_repairs_hand_edits() {
    let mirror = mirror();
    let cache = cache_dir();
    sync(cache.path(), mirror.path(), CONTEXT);

    let rmap_path = cache.path().join("mappings/hst_acs_biasfile_0001.rmap");
    let edited = fs::read_to_string(&rmap_path)
        .unwrap_or_else(|err| panic!("failed to read rmap: {err}"))
        .replace("hrc_bia.fits", "hrc_bia_v2.fits");
    write(&rmap_path, edited.as_bytes());
    assert!(!run_refcal(cache.path(), ["list", "--context", CONTEXT]).status.success());

    let rewritten = run_json(cache.path(), ["checksum", path_str(&rmap_path)]);
    let checksum = rewritten["rewritten"][path_str(&rmap_path)].as_str().unwrap_or_default();
    assert_eq!(checksum.len(), 40);

    let listed = run_json(cache.path(), ["list", "--context", CONTEXT]);
    assert!(string_list(&listed, "references").contains(&"hrc_bia_v2.fits".to_string()));
    assert_eq!(string_list(&listed, "missing_references"), vec!["hrc_bia_v2.fits"]);
}

#[test]
fn failures_exit_non_zero() {
    let mirror = mirror();
    let cache = cache_dir();

    let missing = run_refcal(
        cache.path(),
        ["sync", "--context", "hst_0099.pmap", "--mirror", path_str(mirror.path())],
    );
    assert!(!missing.status.success());

    let unresolved =
        run_refcal(cache.path(), ["bestrefs", "--context", CONTEXT, "--header", "INSTRUME=ACS"]);
    assert!(!unresolved.status.success());
    assert!(
        String::from_utf8_lossy(&unresolved.stderr).contains("best reference resolution failed")
    );
}

#[test]
fn remote_mode_is_refused() {
    let mirror = mirror();
    let cache = cache_dir();
    sync(cache.path(), mirror.path(), CONTEXT);

    let output = Command::new(env!("CARGO_BIN_EXE_refcal"))
        .arg("--cache")
        .arg(cache.path())
        .args(["bestrefs", "--context", CONTEXT, "--header", "INSTRUME=ACS"])
        .env_remove("REFCAL_PATH")
        .env_remove("REFCAL_CONTEXT")
        .env_remove("REFCAL_SERVER_URL")
        .env_remove("REFCAL_ALLOW_FALLBACK")
        .env("REFCAL_MODE", "remote")
        .output()
        .unwrap_or_else(|err| panic!("failed to execute refcal binary: {err}"));
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("remote resolution is not available"));

    let auto = run_json(
        cache.path(),
        [
            "bestrefs",
            "--context",
            CONTEXT,
            "--header",
            "INSTRUME=ACS",
            "--header",
            "DETECTOR=HRC",
            "--header",
            "DATE-OBS=2003-01-01",
        ],
    );
    assert_eq!(auto["source"], "local");
}
