//! Similarity search over the vector store.

mod engine;
mod filter;
mod merge;

pub use engine::{SearchEngine, SearchOptions};
pub use filter::{MetadataFilter, fingerprint_of, matches_metadata};
pub use merge::{merge_top_k, rank, top_k};
