//! Configuration module for the vector search engine.
//!
//! This module provides a layered configuration system that supports:
//! - Default values
//! - TOML configuration file
//! - Environment variable overrides
//!
//! # Environment Variables
//!
//! Environment variables must be prefixed with `PLOTARMOR_` and use double
//! underscores to separate nested levels:
//! - `PLOTARMOR_SEARCH__BATCH_SIZE=500` sets `search.batch_size`
//! - `PLOTARMOR_STORAGE__DURABILITY=buffered` sets `storage.durability`
//! - `PLOTARMOR_CACHE__MAX_ENTRIES=5000` sets `cache.max_entries`

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::DEFAULT_MAX_ENTRIES;
use crate::search::SearchOptions;
use crate::storage::{Durability, StorageOptions};
use crate::vector::VectorDimension;

const CONFIG_DIR: &str = ".plotarmor";
const CONFIG_FILE: &str = "settings.toml";
const ENV_PREFIX: &str = "PLOTARMOR_";

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Settings {
    /// Version of the configuration schema
    #[serde(default = "default_version")]
    pub version: u32,

    /// Directory holding the vector store and the vocabulary
    #[serde(default = "default_data_path")]
    pub data_path: PathBuf,

    /// Embedding dimension every stored vector and query is conformed to
    #[serde(default)]
    pub dimension: VectorDimension,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub search: SearchConfig,

    #[serde(default)]
    pub embedding: EmbeddingConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct StorageConfig {
    /// Compress WAL and snapshot frames with lz4
    #[serde(default = "default_true")]
    pub compression: bool,

    /// "sync" fsyncs every write, "buffered" leaves it to the OS
    #[serde(default)]
    pub durability: Durability,

    /// Threads available for background compaction
    #[serde(default = "default_background_jobs")]
    pub background_jobs: usize,

    /// WAL records written before a compaction is scheduled
    #[serde(default = "default_compaction_threshold")]
    pub compaction_threshold: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct CacheConfig {
    /// Maximum number of cached queries
    #[serde(default = "default_cache_max_entries")]
    pub max_entries: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct SearchConfig {
    /// Vectors scored per parallel task
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Threads in the scoring pool
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,

    /// Grace period for in-flight searches on shutdown
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct EmbeddingConfig {
    /// Maximum number of distinct terms; also the embedding width
    #[serde(default = "default_vocabulary_size")]
    pub vocabulary_size: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct LoggingConfig {
    /// One of "error", "warn", "info", "debug", "trace"
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default value functions
fn default_version() -> u32 {
    1
}
fn default_data_path() -> PathBuf {
    PathBuf::from(CONFIG_DIR).join("data")
}
fn default_true() -> bool {
    true
}
fn default_background_jobs() -> usize {
    4
}
fn default_compaction_threshold() -> u64 {
    4096
}
fn default_cache_max_entries() -> usize {
    DEFAULT_MAX_ENTRIES
}
fn default_batch_size() -> usize {
    1000
}
fn default_worker_threads() -> usize {
    num_cpus::get()
}
fn default_shutdown_timeout_ms() -> u64 {
    5000
}
fn default_vocabulary_size() -> usize {
    10_000
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: default_version(),
            data_path: default_data_path(),
            dimension: VectorDimension::default(),
            storage: StorageConfig::default(),
            cache: CacheConfig::default(),
            search: SearchConfig::default(),
            embedding: EmbeddingConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            compression: true,
            durability: Durability::Sync,
            background_jobs: default_background_jobs(),
            compaction_threshold: default_compaction_threshold(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: default_cache_max_entries(),
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            worker_threads: default_worker_threads(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            vocabulary_size: default_vocabulary_size(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Settings {
    /// Load configuration from all sources
    pub fn load() -> Result<Self, Box<figment::Error>> {
        let config_path = Self::find_config()
            .unwrap_or_else(|| PathBuf::from(CONFIG_DIR).join(CONFIG_FILE));
        Self::load_from(config_path)
    }

    /// Load configuration from a specific file, still honouring env overrides
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, Box<figment::Error>> {
        Figment::new()
            .merge(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path))
            // Double underscore separates nested levels; single underscores
            // stay part of the field name.
            .merge(Env::prefixed(ENV_PREFIX).map(|key| {
                key.as_str().to_lowercase().replace("__", ".").into()
            }))
            .extract()
            .map_err(Box::new)
    }

    /// Find the settings file by looking for a .plotarmor directory
    /// Searches from current directory up to root
    fn find_config() -> Option<PathBuf> {
        let current = std::env::current_dir().ok()?;

        for ancestor in current.ancestors() {
            let config_dir = ancestor.join(CONFIG_DIR);
            if config_dir.is_dir() {
                return Some(config_dir.join(CONFIG_FILE));
            }
        }

        None
    }

    /// Save current configuration to file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), Box<dyn std::error::Error>> {
        let parent = path.as_ref().parent().ok_or("Invalid path")?;
        std::fs::create_dir_all(parent)?;

        let toml_string = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_string)?;

        Ok(())
    }

    /// Create a default settings file with helpful comments in `dir`
    pub fn init_config_file(
        dir: impl AsRef<Path>,
        force: bool,
    ) -> Result<PathBuf, Box<dyn std::error::Error>> {
        let config_path = dir.as_ref().join(CONFIG_DIR).join(CONFIG_FILE);

        if !force && config_path.exists() {
            return Err("Configuration file already exists. Use --force to overwrite".into());
        }

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let template = format!(
            r#"# Plotarmor Configuration File

# Version of the configuration schema
version = 1

# Directory holding the vector store and the vocabulary
data_path = ".plotarmor/data"

# Embedding dimension; shorter vectors are zero-padded, longer ones truncated
dimension = 10000

[storage]
# Compress log and snapshot frames with lz4
compression = true

# "sync" fsyncs every write, "buffered" leaves flushing to the OS
durability = "sync"

# Threads available for background compaction
background_jobs = 4

# WAL records written before a compaction is scheduled
compaction_threshold = 4096

[cache]
# Maximum number of cached queries (entries expire after one hour)
max_entries = 1000

[search]
# Vectors scored per parallel task
batch_size = 1000

# Threads in the scoring pool (defaults to CPU count)
# worker_threads = {}

# Grace period for in-flight searches on shutdown
shutdown_timeout_ms = 5000

[embedding]
# Maximum number of distinct terms
vocabulary_size = 10000

[logging]
level = "info"
"#,
            num_cpus::get()
        );

        std::fs::write(&config_path, template)?;
        Ok(config_path)
    }

    /// Directory of the vector store.
    pub fn store_path(&self) -> PathBuf {
        self.data_path.join("vectors")
    }

    /// File the embedding vocabulary is persisted to.
    pub fn vocabulary_path(&self) -> PathBuf {
        self.data_path.join("vocabulary.json")
    }

    pub fn storage_options(&self) -> StorageOptions {
        StorageOptions {
            dimension: self.dimension,
            compression: self.storage.compression,
            durability: self.storage.durability,
            background_jobs: self.storage.background_jobs,
            compaction_threshold: self.storage.compaction_threshold,
        }
    }

    pub fn search_options(&self) -> SearchOptions {
        SearchOptions {
            batch_size: self.search.batch_size,
            worker_threads: self.search.worker_threads,
            shutdown_timeout: Duration::from_millis(self.search.shutdown_timeout_ms),
            cache_max_entries: self.cache.max_entries,
        }
    }
}
