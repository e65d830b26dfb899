//! CLI entry point for the vector search engine.
//!
//! Opens the store named by the settings, runs one command, and prints its
//! result as JSON on stdout. Logs go to stderr.

use anyhow::{Context, Result, anyhow, bail};
use clap::{
    Parser, Subcommand,
    builder::styling::{AnsiColor, Effects, Styles},
};
use plotarmor::search::fingerprint_of;
use plotarmor::storage::prune_backups;
use plotarmor::{
    EmbeddingGenerator, MetadataFilter, SearchEngine, SearchResult, Settings,
    TermFrequencyEmbedder, Vector, VectorStore, Vocabulary,
};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

fn clap_cargo_style() -> Styles {
    Styles::styled()
        .header(AnsiColor::Cyan.on_default() | Effects::BOLD)
        .usage(AnsiColor::Cyan.on_default() | Effects::BOLD)
        .literal(AnsiColor::Green.on_default())
        .placeholder(AnsiColor::Green.on_default())
}

/// Embedded vector similarity search
#[derive(Parser)]
#[command(
    name = "plotarmor",
    version = env!("CARGO_PKG_VERSION"),
    about = "Embedded vector similarity search",
    long_about = "Store vectors with metadata and find the most similar ones by vector or by text.",
    next_line_help = true,
    styles = clap_cargo_style()
)]
struct Cli {
    /// Path to custom settings.toml file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log debug details to stderr
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    /// Only log errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Available CLI commands
#[derive(Subcommand)]
enum Commands {
    #[command(about = "Set up .plotarmor directory with default configuration")]
    Init {
        /// Force overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },

    #[command(about = "Display active settings")]
    Config,

    #[command(about = "Store one vector")]
    Put {
        id: String,

        /// Comma-separated components, e.g. "0.1,0.2,0.3"
        #[arg(long, value_parser = parse_values)]
        values: Components,

        /// Metadata entry as key=value; repeatable
        #[arg(short, long = "meta", value_parser = parse_pair)]
        metadata: Vec<(String, String)>,
    },

    #[command(
        about = "Store a JSON array of vectors as one atomic batch",
        after_help = "Input format:\n  [{\"id\": \"a\", \"values\": [1.0, 0.0], \"metadata\": {\"category\": \"x\"}}]"
    )]
    Import {
        /// JSON file to read
        file: PathBuf,
    },

    #[command(about = "Print a stored vector")]
    Get {
        id: String,

        /// Include the vector components
        #[arg(long)]
        full: bool,
    },

    #[command(about = "Delete a vector")]
    Delete { id: String },

    #[command(about = "List stored vectors in ID order")]
    Scan {
        /// First ID to include
        #[arg(long, conflicts_with = "prefix")]
        start: Option<String>,

        /// Last ID to include
        #[arg(long, conflicts_with = "prefix")]
        end: Option<String>,

        /// Only IDs starting with this prefix
        #[arg(long)]
        prefix: Option<String>,

        #[arg(short, long, default_value_t = 100)]
        limit: usize,
    },

    #[command(about = "Find the vectors most similar to a query vector")]
    Search {
        /// Comma-separated query components
        #[arg(long, value_parser = parse_values)]
        values: Components,

        #[arg(short = 'k', long, default_value_t = 10)]
        top_k: usize,

        /// Required metadata as key=value; repeatable
        #[arg(short, long, value_parser = parse_pair)]
        filter: Vec<(String, String)>,
    },

    #[command(name = "search-text", about = "Find the vectors most similar to a text")]
    SearchText {
        text: String,

        #[arg(short = 'k', long, default_value_t = 10)]
        top_k: usize,

        #[arg(short, long, value_parser = parse_pair)]
        filter: Vec<(String, String)>,
    },

    #[command(name = "ingest-text", about = "Embed a text and store it under an ID")]
    IngestText {
        id: String,
        text: String,

        #[arg(short, long = "meta", value_parser = parse_pair)]
        metadata: Vec<(String, String)>,
    },

    #[command(about = "Write a point-in-time copy of the store")]
    Backup {
        /// Destination directory; defaults to a timestamped directory under
        /// <data_path>/backups
        path: Option<PathBuf>,
    },

    #[command(name = "prune-backups", about = "Delete all but the newest backups")]
    PruneBackups {
        /// Directory holding backup_* directories
        #[arg(long)]
        base: Option<PathBuf>,

        #[arg(long, default_value_t = 5)]
        keep: usize,
    },

    #[command(about = "Fold the write-ahead log into a fresh snapshot")]
    Compact,

    #[command(about = "Show storage statistics")]
    Stats,
}

/// Vector components parsed from one comma-separated argument.
#[derive(Debug, Clone)]
struct Components(Vec<f32>);

fn parse_values(s: &str) -> Result<Components, String> {
    s.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.parse::<f32>()
                .map_err(|e| format!("invalid component '{part}': {e}"))
        })
        .collect::<Result<Vec<_>, _>>()
        .map(Components)
}

fn parse_pair(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{s}'"))?;
    Ok((key.to_string(), value.to_string()))
}

#[derive(Debug, Serialize)]
struct ResultView<'a> {
    id: &'a str,
    similarity: f64,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    metadata: &'a HashMap<String, String>,
}

#[derive(Debug, Serialize)]
struct VectorView<'a> {
    id: &'a str,
    dimension: usize,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    metadata: &'a HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    values: Option<&'a [f32]>,
}

impl<'a> VectorView<'a> {
    fn new(vector: &'a Vector, full: bool) -> Self {
        Self {
            id: &vector.id,
            dimension: vector.values.len(),
            metadata: &vector.metadata,
            values: full.then_some(vector.values.as_slice()),
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_results(results: &[SearchResult]) -> Result<()> {
    let views: Vec<ResultView> = results
        .iter()
        .map(|r| ResultView {
            id: r.id(),
            similarity: r.similarity,
            metadata: &r.vector.metadata,
        })
        .collect();
    print_json(&views)
}

fn init_logging(cli: &Cli, settings: &Settings) {
    let level = if cli.quiet {
        tracing::Level::ERROR
    } else if cli.verbose {
        tracing::Level::DEBUG
    } else {
        settings.logging.level.parse().unwrap_or(tracing::Level::INFO)
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn load_settings(cli: &Cli) -> Result<Settings> {
    match &cli.config {
        Some(path) => Settings::load_from(path)
            .map_err(|e| anyhow!("Configuration error loading from {}: {e}", path.display())),
        None => Settings::load().map_err(|e| anyhow!("Configuration error: {e}")),
    }
}

fn open_store(settings: &Settings) -> Result<Arc<VectorStore>> {
    let path = settings.store_path();
    let store = VectorStore::open(&path, settings.storage_options())
        .with_context(|| format!("failed to open vector store at {}", path.display()))?;
    Ok(Arc::new(store))
}

fn open_embedder(settings: &Settings) -> Result<TermFrequencyEmbedder> {
    let vocabulary =
        Vocabulary::load_or_new(&settings.vocabulary_path(), settings.embedding.vocabulary_size)?;
    Ok(TermFrequencyEmbedder::with_vocabulary(Arc::new(vocabulary))?)
}

fn to_filter(pairs: Vec<(String, String)>) -> Option<MetadataFilter> {
    if pairs.is_empty() {
        None
    } else {
        Some(pairs.into_iter().collect())
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = load_settings(&cli)?;
    init_logging(&cli, &settings);

    match &cli.command {
        Commands::Init { force } => {
            let cwd = std::env::current_dir()?;
            let path = Settings::init_config_file(&cwd, *force).map_err(|e| anyhow!("{e}"))?;
            println!("Created configuration file at: {}", path.display());
            println!("Edit this file to customize your settings.");
            return Ok(());
        }
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&settings)?);
            return Ok(());
        }
        Commands::PruneBackups { base, keep } => {
            let base = base
                .clone()
                .unwrap_or_else(|| settings.data_path.join("backups"));
            let removed = prune_backups(&base, *keep)?;
            return print_json(&removed);
        }
        _ => {}
    }

    let store = open_store(&settings)?;

    match cli.command {
        Commands::Put {
            id,
            values,
            metadata,
        } => {
            let vector = Vector {
                id,
                values: values.0,
                metadata: metadata.into_iter().collect(),
            };
            store.store(vector)?;
        }

        Commands::Import { file } => {
            let data = std::fs::read(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            let vectors: Vec<Vector> = serde_json::from_slice(&data)
                .with_context(|| format!("{} is not a JSON array of vectors", file.display()))?;
            let count = vectors.len();
            store.store_batch(vectors)?;
            print_json(&serde_json::json!({ "imported": count }))?;
        }

        Commands::Get { id, full } => match store.retrieve(&id)? {
            Some(vector) => print_json(&VectorView::new(&vector, full))?,
            None => bail!("vector '{id}' not found"),
        },

        Commands::Delete { id } => {
            let deleted = store.delete(&id)?;
            print_json(&serde_json::json!({ "id": id, "deleted": deleted }))?;
        }

        Commands::Scan {
            start,
            end,
            prefix,
            limit,
        } => {
            let vectors = match prefix {
                Some(prefix) => store.scan_prefix(&prefix, limit)?,
                None => store.scan_range(start.as_deref(), end.as_deref(), limit)?,
            };
            let views: Vec<VectorView> = vectors.iter().map(|v| VectorView::new(v, false)).collect();
            print_json(&views)?;
        }

        Commands::Search {
            values,
            top_k,
            filter,
        } => {
            let filter = to_filter(filter);
            let engine = SearchEngine::new(Arc::clone(&store), settings.search_options())?;
            let started = Instant::now();
            let results = engine.search(&values.0, top_k, filter.as_ref())?;
            tracing::info!(
                top_k,
                filter = %fingerprint_of(filter.as_ref()),
                results = results.len(),
                elapsed = ?started.elapsed(),
                "search finished"
            );
            print_results(&results)?;
        }

        Commands::SearchText {
            text,
            top_k,
            filter,
        } => {
            let filter = to_filter(filter);
            let embedder = Arc::new(open_embedder(&settings)?);
            let engine = SearchEngine::new(Arc::clone(&store), settings.search_options())?
                .with_embedder(embedder.clone());
            let results = engine.search_by_text(&text, top_k, filter.as_ref())?;
            embedder.vocabulary().save(&settings.vocabulary_path())?;
            print_results(&results)?;
        }

        Commands::IngestText { id, text, metadata } => {
            let embedder = open_embedder(&settings)?;
            let values = embedder.generate_embedding(&text)?;
            store.store(Vector {
                id,
                values,
                metadata: metadata.into_iter().collect(),
            })?;
            embedder.vocabulary().save(&settings.vocabulary_path())?;
        }

        Commands::Backup { path } => {
            let path = match path {
                Some(path) => {
                    store.create_backup(&path)?;
                    path
                }
                None => store.create_timestamped_backup(settings.data_path.join("backups"))?,
            };
            print_json(&serde_json::json!({ "backup": path }))?;
        }

        Commands::Compact => {
            store.compact()?;
            print_json(&store.statistics())?;
        }

        Commands::Stats => print_json(&store.statistics())?,

        // Handled before the store is opened.
        Commands::Init { .. } | Commands::Config | Commands::PruneBackups { .. } => {}
    }

    store.close()?;
    Ok(())
}
