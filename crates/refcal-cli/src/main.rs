use std::fs;
use std::path::PathBuf;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use refcal_cache::{
    rewrite_checksum, CacheLayout, CacheSynchronizer, DirectoryMirror, HttpDownloader, MappingCache,
    SyncOptions,
};
use refcal_client::{BestRefsRequest, ClientConfig, HeavyClient, ResolutionMode};
use refcal_core::{Header, MatchPolicy};
use serde_json::Value;
use tracing::info;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "refcal")]
#[command(about = "Calibration reference resolution")]
struct Cli {
    /// YAML client configuration; `REFCAL_*` environment variables apply on top.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Cache root, overriding the configuration.
    #[arg(long, global = true)]
    cache: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Resolve best references for one dataset header from the local cache.
    Bestrefs(BestrefsArgs),
    /// Bring the cache up to date for one or more contexts.
    Sync(SyncArgs),
    /// Show the mappings and references a context requires.
    List(ListArgs),
    /// Differences between two mappings, recursing into replaced sub-mappings.
    Diff(DiffArgs),
    /// Rewrite the sha1sum of hand-edited mappings.
    Checksum(ChecksumArgs),
}

#[derive(Debug, Args)]
struct BestrefsArgs {
    #[arg(long)]
    context: Option<String>,
    /// Header parameter as KEYWORD=VALUE; repeatable.
    #[arg(long = "header", value_parser = parse_header_pair)]
    header: Vec<(String, String)>,
    /// JSON object of header keywords to string values.
    #[arg(long)]
    header_file: Option<PathBuf>,
    #[arg(long)]
    instrument: Option<String>,
    #[arg(long = "reftype")]
    reftypes: Vec<String>,
    /// Accept Match ties whose candidates all resolve to the same file.
    #[arg(long, default_value_t = false)]
    merge_identical: bool,
}

#[derive(Debug, Args)]
struct SyncArgs {
    #[arg(long = "context", required = true)]
    contexts: Vec<String>,
    /// Directory (flat or cache-structured) to copy files from.
    #[arg(long, conflicts_with = "server_url")]
    mirror: Option<PathBuf>,
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long, default_value_t = false)]
    no_references: bool,
    #[arg(long, default_value_t = false)]
    verify: bool,
    #[arg(long, default_value_t = false)]
    purge_mappings: bool,
    #[arg(long, default_value_t = false)]
    purge_references: bool,
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct ListArgs {
    #[arg(long)]
    context: String,
}

#[derive(Debug, Args)]
struct DiffArgs {
    old: String,
    new: String,
}

#[derive(Debug, Args)]
struct ChecksumArgs {
    #[arg(required = true)]
    paths: Vec<PathBuf>,
}

fn parse_header_pair(raw: &str) -> Result<(String, String), String> {
    let (key, value) =
        raw.split_once('=').ok_or_else(|| format!("expected KEYWORD=VALUE, got '{raw}'"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty keyword in '{raw}'"));
    }
    Ok((key.to_string(), value.trim().to_string()))
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let mut config =
        ClientConfig::load(cli.config.as_deref()).context("failed to load client configuration")?;
    if let Some(cache) = cli.cache {
        config.cache_root = cache;
    }
    match cli.command {
        Command::Bestrefs(args) => run_bestrefs(args, config),
        Command::Sync(args) => run_sync(&args, &config),
        Command::List(args) => run_list(&args, &config.layout()),
        Command::Diff(args) => run_diff(&args, &config.layout()),
        Command::Checksum(args) => run_checksum(&args, &config.layout()),
    }
}

fn read_header(args: &BestrefsArgs) -> Result<Header> {
    let mut header = Header::new();
    if let Some(path) = args.header_file.as_ref() {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read header file {}", path.display()))?;
        let object: serde_json::Map<String, Value> = serde_json::from_str(&raw)
            .with_context(|| format!("header file {} is not a JSON object", path.display()))?;
        for (key, value) in object {
            let text = match value {
                Value::String(text) => text,
                Value::Number(number) => number.to_string(),
                Value::Bool(flag) => flag.to_string(),
                other => bail!("header keyword {key} has unsupported value {other}"),
            };
            header.insert(key, text);
        }
    }
    for (key, value) in &args.header {
        header.insert(key, value.clone());
    }
    Ok(header)
}

/// The command line carries no server transport, so it always answers locally.
fn run_bestrefs(args: BestrefsArgs, mut config: ClientConfig) -> Result<()> {
    if config.mode == ResolutionMode::Remote {
        bail!("remote resolution is not available from the command line; use local or auto mode");
    }
    config.mode = ResolutionMode::Local;
    let header = read_header(&args)?;
    let request = BestRefsRequest {
        instrument: args.instrument,
        reftypes: (!args.reftypes.is_empty()).then_some(args.reftypes),
        instrument_keywords: Vec::new(),
        policy: if args.merge_identical {
            MatchPolicy::MergeIdentical
        } else {
            MatchPolicy::Strict
        },
    };
    let client = HeavyClient::new(config);
    let resolution = client
        .get_references(args.context.as_deref(), &header, &request)
        .context("best reference resolution failed")?;
    emit_json(serde_json::to_value(&resolution).context("failed to serialize resolution")?)
}

fn run_sync(args: &SyncArgs, config: &ClientConfig) -> Result<()> {
    let layout = config.layout();
    let synchronizer = if let Some(mirror) = args.mirror.as_ref() {
        CacheSynchronizer::new(layout, DirectoryMirror::new(mirror))
    } else {
        let url = args
            .server_url
            .as_deref()
            .or(config.server_url.as_deref())
            .ok_or_else(|| anyhow!("sync needs --mirror, --server-url, or REFCAL_SERVER_URL"))?;
        CacheSynchronizer::new(layout, HttpDownloader::new(url, config.timeout()))
    };
    let options = SyncOptions {
        fetch_references: !args.no_references,
        verify: args.verify,
        purge_mappings: args.purge_mappings,
        purge_references: args.purge_references,
        dry_run: args.dry_run,
    };
    let report = synchronizer.sync(&args.contexts, &options).context("cache sync failed")?;
    emit_json(serde_json::to_value(&report).context("failed to serialize sync report")?)?;
    if !report.failures.is_empty() {
        bail!("sync finished with {} failed files", report.failures.len());
    }
    Ok(())
}

fn run_list(args: &ListArgs, layout: &CacheLayout) -> Result<()> {
    let cache = MappingCache::open(layout);
    let mappings = cache
        .mapping_names(&args.context)
        .with_context(|| format!("failed to load context {}", args.context))?;
    let references = cache.reference_names(&args.context)?;
    let missing_references = references
        .iter()
        .filter(|name| !layout.reference_path(name).is_file())
        .cloned()
        .collect::<Vec<_>>();
    emit_json(serde_json::json!({
        "context": args.context,
        "mappings": mappings,
        "references": references,
        "missing_mappings": cache.missing_mappings(&args.context)?,
        "missing_references": missing_references,
        "recorded_complete": layout.read_complete_contexts()?.contains(&args.context)
    }))
}

fn run_diff(args: &DiffArgs, layout: &CacheLayout) -> Result<()> {
    let cache = MappingCache::open(layout);
    let differences = cache
        .difference(&args.old, &args.new)
        .with_context(|| format!("failed to compare {} with {}", args.old, args.new))?;
    let reversions = differences.iter().filter(|difference| difference.is_reversion()).count();
    emit_json(serde_json::json!({
        "old": args.old,
        "new": args.new,
        "reversions": reversions,
        "differences": differences
    }))
}

fn run_checksum(args: &ChecksumArgs, layout: &CacheLayout) -> Result<()> {
    let mut rewritten = serde_json::Map::new();
    for path in &args.paths {
        let checksum = rewrite_checksum(layout, path)
            .with_context(|| format!("failed to rewrite checksum of {}", path.display()))?;
        info!(path = %path.display(), checksum = %checksum, "checksum rewritten");
        rewritten.insert(path.display().to_string(), Value::String(checksum));
    }
    emit_json(serde_json::json!({ "rewritten": rewritten }))
}
