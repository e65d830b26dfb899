//! Metadata equality filters.
//!
//! A vector matches when, for every filter key, its metadata holds exactly
//! the same string value. Vectors without metadata never match a non-empty
//! filter; an empty filter matches everything.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::vector::Vector;

/// Required `key == value` metadata pairs, kept sorted by key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetadataFilter(BTreeMap<String, String>);

impl MetadataFilter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a required pair, replacing any earlier value for `key`.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Check if a vector's metadata satisfies every pair.
    #[must_use]
    pub fn matches(&self, vector: &Vector) -> bool {
        matches_metadata(&vector.metadata, self)
    }

    /// Stable cache-key encoding: key-sorted JSON, or `""` when empty.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        if self.0.is_empty() {
            return String::new();
        }
        serde_json::to_string(&self.0).unwrap_or_default()
    }
}

/// Fingerprint of an optional filter; absent and empty are the same.
#[must_use]
pub fn fingerprint_of(filter: Option<&MetadataFilter>) -> String {
    filter.map(MetadataFilter::fingerprint).unwrap_or_default()
}

pub fn matches_metadata(metadata: &HashMap<String, String>, filter: &MetadataFilter) -> bool {
    filter
        .0
        .iter()
        .all(|(key, expected)| metadata.get(key) == Some(expected))
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for MetadataFilter {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

impl From<HashMap<String, String>> for MetadataFilter {
    fn from(map: HashMap<String, String>) -> Self {
        Self(map.into_iter().collect())
    }
}
