//! Vector data model, numeric primitives and text embedding.
//!
//! Every vector that enters the system, whether stored or used as a query, is
//! conformed to the configured dimension (zero-padded or truncated, then
//! L2-normalized) before it is persisted or scored.

mod embedding;
mod math;
mod types;

pub use embedding::{EmbeddingGenerator, TermFrequencyEmbedder, Vocabulary, tokenize};
pub use math::{
    conform, conformed, cosine_similarity, l2_norm, normalize_in_place, pad_or_truncate,
};
pub use types::{DEFAULT_DIMENSION, SearchResult, Vector, VectorDimension};
