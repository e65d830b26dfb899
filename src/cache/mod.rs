//! Query result caching.

mod metrics;
mod result_cache;

pub use metrics::CacheMetrics;
pub use result_cache::{CacheKey, DEFAULT_MAX_ENTRIES, DEFAULT_TTL, ResultCache};
