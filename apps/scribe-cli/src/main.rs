use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use scribe_core::{
    apply_env_overrides, config_schema_json, load_config, ActionParams, ActionValidator,
    CachedSearch, Config, ConnectionPool, CreateParams, FieldUpdate, FileKvStore, MemoryStore,
    ModifyParams, OperationRequest, QueryCache, ReqwestTransport, RemoteValidator, RenameParams,
    ServiceCoordinator, UpdateMode,
};
use serde_json::{json, Value};
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "scribe-cli", version, about = "Verified note edits on a JSON wiki file")]
struct Cli {
    /// Wiki file: a JSON array of notes. Missing files start empty.
    #[arg(long, global = true, default_value = "wiki.json")]
    wiki: PathBuf,
    /// TOML config; defaults plus SCRIBE_* overrides when omitted
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Directory for the persisted search cache; defaults to `<wiki>.cache`
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,
    /// The user's request, forwarded to the remote validator
    #[arg(long, global = true)]
    request: Option<String>,
    /// Debug logging on stderr
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the config JSON schema
    Schema,
    /// Create a note
    Create(CreateArgs),
    /// Rename a note and rewrite references to it
    Rename {
        #[arg(long)]
        from: String,
        #[arg(long)]
        to: String,
    },
    /// Update fields and tags of a note
    Modify(ModifyArgs),
    /// Search titles and text
    Search {
        query: String,
        /// Skip notes carrying this tag (repeatable)
        #[arg(long = "exclude-tag")]
        exclude_tags: Vec<String>,
    },
    /// Run a JSON array of actions as one query; nothing is saved unless all succeed
    Apply { file: PathBuf },
}

#[derive(Args)]
struct CreateArgs {
    #[arg(long)]
    title: String,
    #[arg(long, default_value = "")]
    text: String,
    #[arg(long = "tag")]
    tags: Vec<String>,
    /// Extra field as name=value (repeatable)
    #[arg(long = "field", value_parser = parse_pair)]
    fields: Vec<(String, String)>,
}

#[derive(Args)]
struct ModifyArgs {
    #[arg(long)]
    title: String,
    /// Replace a field: name=value (repeatable)
    #[arg(long = "set", value_parser = parse_pair)]
    set: Vec<(String, String)>,
    /// Append to a field: name=value (repeatable)
    #[arg(long = "append", value_parser = parse_pair)]
    append: Vec<(String, String)>,
    #[arg(long = "add-tag")]
    add_tags: Vec<String>,
    #[arg(long = "remove-tag")]
    remove_tags: Vec<String>,
}

fn parse_pair(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((name, value)) if !name.trim().is_empty() => {
            Ok((name.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected name=value, got '{raw}'")),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    scribe_otel::init_with_default(if cli.verbose { "debug" } else { "warn" });

    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => {
            let mut cfg = Config::default();
            apply_env_overrides(&mut cfg);
            cfg
        }
    };

    let cache_dir = cli
        .cache_dir
        .clone()
        .unwrap_or_else(|| cli.wiki.with_extension("cache"));

    match cli.command {
        Commands::Schema => print_json(&config_schema_json()),
        Commands::Search {
            query,
            exclude_tags,
        } => {
            let store = Arc::new(load_store(&cli.wiki)?);
            let cache = open_cache(&config, &cache_dir).await;
            let search = CachedSearch::new(store, cache.clone());
            let titles = search.search(&query, &exclude_tags);
            persist_cache(&cache).await;
            print_json(&json!({ "query": query, "titles": titles }))
        }
        Commands::Create(args) => {
            let params = ActionParams::Create(CreateParams {
                title: args.title,
                text: args.text,
                tags: args.tags,
                fields: args.fields.into_iter().collect::<BTreeMap<_, _>>(),
            });
            run_batch(&cli.wiki, &cache_dir, cli.request.as_deref(), &config, vec![params]).await
        }
        Commands::Rename { from, to } => {
            let params = ActionParams::Rename(RenameParams {
                old_title: from,
                new_title: to,
            });
            run_batch(&cli.wiki, &cache_dir, cli.request.as_deref(), &config, vec![params]).await
        }
        Commands::Modify(args) => {
            let updates = args
                .set
                .into_iter()
                .map(|(field, value)| (field, value, UpdateMode::Replace))
                .chain(
                    args.append
                        .into_iter()
                        .map(|(field, value)| (field, value, UpdateMode::Append)),
                )
                .map(|(field, value, mode)| FieldUpdate { field, value, mode })
                .collect();
            let params = ActionParams::Modify(ModifyParams {
                title: args.title,
                updates,
                tags_to_add: args.add_tags,
                tags_to_remove: args.remove_tags,
            });
            run_batch(&cli.wiki, &cache_dir, cli.request.as_deref(), &config, vec![params]).await
        }
        Commands::Apply { file } => {
            let raw = std::fs::read_to_string(&file)
                .with_context(|| format!("read {}", file.display()))?;
            let batch: Vec<ActionParams> = serde_json::from_str(&raw)
                .with_context(|| format!("parse actions in {}", file.display()))?;
            run_batch(&cli.wiki, &cache_dir, cli.request.as_deref(), &config, batch).await
        }
    }
}

fn load_store(path: &Path) -> Result<MemoryStore> {
    MemoryStore::load_json(path).with_context(|| format!("load wiki {}", path.display()))
}

/// Search cache backed by files under `dir`; a missing or unreadable image
/// starts empty.
async fn open_cache(config: &Config, dir: &Path) -> Arc<QueryCache> {
    let cache = Arc::new(
        QueryCache::new(config.cache.clone()).with_kv(Arc::new(FileKvStore::new(dir))),
    );
    if let Err(err) = cache.restore().await {
        warn!(dir = %dir.display(), error = %err, "search cache not restored");
    }
    cache
}

async fn persist_cache(cache: &QueryCache) {
    if let Err(err) = cache.persist().await {
        warn!(error = %err, "search cache not persisted");
    }
}

fn build_validator(config: &Config) -> Result<Option<Arc<dyn ActionValidator>>> {
    let Some(url) = config.validator.url.clone() else {
        return Ok(None);
    };
    let timeout = Duration::from_millis(config.validator.timeout_ms);
    let transport = ReqwestTransport::new(timeout).context("build http client")?;
    let pool = ConnectionPool::new(config.pool.clone(), Arc::new(transport));
    let mut validator = RemoteValidator::new(pool, url, timeout);
    if let Ok(key) = std::env::var("SCRIBE_VALIDATOR_API_KEY") {
        if !key.trim().is_empty() {
            validator = validator.with_api_key(key.trim());
        }
    }
    Ok(Some(Arc::new(validator)))
}

async fn run_batch(
    wiki: &Path,
    cache_dir: &Path,
    user_request: Option<&str>,
    config: &Config,
    batch: Vec<ActionParams>,
) -> Result<()> {
    let store = Arc::new(load_store(wiki)?);
    let cache = open_cache(config, cache_dir).await;
    let mut coordinator = ServiceCoordinator::new(store.clone(), config.coordinator.clone())
        .with_cache(cache.clone());
    if let Some(validator) = build_validator(config)? {
        coordinator = coordinator.with_validator(validator);
    }

    let mut results: Vec<Value> = Vec::with_capacity(batch.len());
    for params in batch {
        let mut request = OperationRequest::new(params);
        if let Some(text) = user_request {
            request = request.with_user_request(text);
        }
        match coordinator.execute_operation(request).await {
            Ok(success) => results.push(json!({
                "outcome": success.outcome,
                "changes": success.changes,
            })),
            Err(failure) => {
                error!(
                    kind = %failure.kind,
                    completed = results.len(),
                    "batch failed; wiki not saved"
                );
                print_json(&json!({
                    "ok": false,
                    "completed": results,
                    "failure": &failure,
                }))?;
                return Err(anyhow::Error::new(failure).context("wiki left unchanged"));
            }
        }
    }

    store
        .save_json(wiki)
        .with_context(|| format!("save wiki {}", wiki.display()))?;
    // Committed actions cleared the cache; drop the stale image too.
    persist_cache(&cache).await;
    info!(wiki = %wiki.display(), actions = results.len(), "wiki saved");
    print_json(&json!({ "ok": true, "results": results }))
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
