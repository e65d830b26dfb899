//! Error types for the vector search system
//!
//! This module provides structured error types using thiserror. Each domain
//! (input validation, storage, search, embedding) has its own enum so callers
//! can tell a malformed request apart from an I/O fault or a failed search.
//!
//! "Not found" is never an error: lookups return `Ok(None)`.

use std::path::PathBuf;
use thiserror::Error;

/// Malformed input rejected before any state is touched.
///
/// Validation errors are always local and immediate, and never worth retrying.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Vector ID cannot be empty")]
    MissingId,

    #[error("Vector '{id}' has no values\nSuggestion: Provide at least one component")]
    EmptyValues { id: String },

    #[error("Vector '{id}' has a non-finite value at index {index}")]
    NonFiniteValue { id: String, index: usize },

    #[error(
        "Vector length mismatch: expected {expected}, got {actual}\nSuggestion: Ensure the store and the query use the same dimension"
    )]
    LengthMismatch { expected: usize, actual: usize },

    #[error("Invalid vector dimension: {dimension}\nReason: {reason}")]
    InvalidDimension {
        dimension: usize,
        reason: &'static str,
    },

    #[error("Query vector cannot be empty")]
    EmptyQuery,
}

/// Failures of the persistent vector store.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("I/O failure during {operation}{}: {source}", key_suffix(.key))]
    Io {
        operation: &'static str,
        key: Option<String>,
        source: std::io::Error,
    },

    #[error("Serialization failure during {operation}{}: {reason}", key_suffix(.key))]
    Serialization {
        operation: &'static str,
        key: Option<String>,
        reason: String,
    },

    #[error("Storage file '{path}' is corrupted: {reason}")]
    Corrupted { path: PathBuf, reason: String },

    #[error("Failed to create backup at '{path}': {source}")]
    Backup {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Backup destination '{dest}' overlaps the live store at '{store}'")]
    BackupOverlapsStore { dest: PathBuf, store: PathBuf },

    #[error("Vector store is closed")]
    Closed,

    #[error("Failed to start background workers: {0}")]
    ThreadPool(String),
}

fn key_suffix(key: &Option<String>) -> String {
    match key {
        Some(key) => format!(" of '{key}'"),
        None => String::new(),
    }
}

impl StorageError {
    pub(crate) fn io(operation: &'static str, source: std::io::Error) -> Self {
        Self::Io {
            operation,
            key: None,
            source,
        }
    }

    pub(crate) fn io_for_key(
        operation: &'static str,
        key: impl Into<String>,
        source: std::io::Error,
    ) -> Self {
        Self::Io {
            operation,
            key: Some(key.into()),
            source,
        }
    }

    /// Get a stable status code for this error type.
    pub fn status_code(&self) -> String {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::Io { .. } => "STORAGE_IO_ERROR",
            Self::Serialization { .. } => "SERIALIZATION_ERROR",
            Self::Corrupted { .. } => "STORAGE_CORRUPTED",
            Self::Backup { .. } => "BACKUP_FAILED",
            Self::BackupOverlapsStore { .. } => "BACKUP_OVERLAPS_STORE",
            Self::Closed => "STORE_CLOSED",
            Self::ThreadPool(_) => "THREAD_POOL_ERROR",
        }
        .to_string()
    }

    /// Get recovery suggestions for this error
    pub fn recovery_suggestions(&self) -> Vec<&'static str> {
        match self {
            Self::Io { .. } | Self::Backup { .. } => vec![
                "Check disk space and permissions in the data directory",
                "Ensure no other process holds the data directory open",
            ],
            Self::Corrupted { .. } => vec![
                "Restore the data directory from a recent backup",
                "Check for disk errors or filesystem corruption",
            ],
            Self::BackupOverlapsStore { .. } => {
                vec!["Choose a backup directory outside the store's data directory"]
            }
            Self::Closed => vec!["Reopen the store before issuing further operations"],
            _ => vec![],
        }
    }
}

/// Failures of the parallel scan/score/merge pipeline.
///
/// A failed batch always fails the whole search: partial top-K results are
/// never returned as success.
#[derive(Error, Debug)]
pub enum SearchError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Search failed while reading the store: {0}")]
    Storage(#[from] StorageError),

    #[error("Search failed while embedding the query: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("Batch {batch} failed: {reason}")]
    TaskFailed { batch: usize, reason: String },

    #[error("Search was cancelled because the engine is shutting down")]
    Cancelled,

    #[error("Search engine is closed")]
    ShuttingDown,

    #[error("Failed to start search workers: {0}")]
    ThreadPool(String),
}

impl SearchError {
    /// Get a stable status code for this error type.
    pub fn status_code(&self) -> String {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::Storage(inner) => return inner.status_code(),
            Self::Embedding(_) => "EMBEDDING_ERROR",
            Self::TaskFailed { .. } => "SEARCH_TASK_FAILED",
            Self::Cancelled => "SEARCH_CANCELLED",
            Self::ShuttingDown => "ENGINE_CLOSED",
            Self::ThreadPool(_) => "THREAD_POOL_ERROR",
        }
        .to_string()
    }

    /// Get recovery suggestions for this error
    pub fn recovery_suggestions(&self) -> Vec<&'static str> {
        match self {
            Self::Storage(inner) => inner.recovery_suggestions(),
            Self::TaskFailed { .. } => vec![
                "Stored vectors may have a different dimension than the engine expects",
                "Try the search again; no partial results were returned",
            ],
            Self::Cancelled | Self::ShuttingDown => {
                vec!["Create a new engine before issuing further searches"]
            }
            _ => vec![],
        }
    }
}

/// Failures of the text embedding producer.
#[derive(Error, Debug)]
pub enum EmbeddingError {
    #[error("Failed to read vocabulary from '{path}': {reason}")]
    VocabularyLoad { path: PathBuf, reason: String },

    #[error("Failed to write vocabulary to '{path}': {reason}")]
    VocabularySave { path: PathBuf, reason: String },

    #[error("Embedding generation failed: {0}")]
    Generation(String),

    #[error("No embedding generator is configured for text search")]
    NotConfigured,
}

/// Result type alias for validation
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;
