//! Embedded vector similarity search.
//!
//! Vectors with string metadata are kept in a persistent [`VectorStore`] and
//! queried by a [`SearchEngine`] that scores the whole store in parallel
//! batches, merges a global top-K, and memoizes results in a [`ResultCache`].

pub mod cache;
pub mod config;
pub mod error;
pub mod search;
pub mod storage;
pub mod vector;

// Explicit exports for better API clarity
pub use cache::{CacheMetrics, ResultCache};
pub use config::Settings;
pub use error::{
    EmbeddingError, SearchError, StorageError, StorageResult, ValidationError, ValidationResult,
};
pub use search::{MetadataFilter, SearchEngine, SearchOptions};
pub use storage::{Durability, StorageOptions, StoreStatistics, VectorStore};
pub use vector::{
    EmbeddingGenerator, SearchResult, TermFrequencyEmbedder, Vector, VectorDimension, Vocabulary,
};
