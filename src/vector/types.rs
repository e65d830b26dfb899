//! Core data types for vector storage and search.
//!
//! `Vector` is the durable record, `SearchResult` the per-query ranking entry,
//! and `VectorDimension` the validated embedding width every stored vector is
//! conformed to.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{ValidationError, ValidationResult};

/// Default embedding dimension.
pub const DEFAULT_DIMENSION: usize = 10_000;

/// A vector record with its metadata.
///
/// Once stored, `values.len()` equals the store's configured dimension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vector {
    pub id: String,
    pub values: Vec<f32>,
    #[serde(
        default,
        deserialize_with = "null_as_empty",
        skip_serializing_if = "HashMap::is_empty"
    )]
    pub metadata: HashMap<String, String>,
}

/// Accepts an explicit `null` wherever a map may be omitted.
fn null_as_empty<'de, D>(deserializer: D) -> Result<HashMap<String, String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<HashMap<String, String>>::deserialize(deserializer)?.unwrap_or_default())
}

impl Vector {
    /// Creates a vector without metadata.
    pub fn new(id: impl Into<String>, values: Vec<f32>) -> Self {
        Self {
            id: id.into(),
            values,
            metadata: HashMap::new(),
        }
    }

    /// Adds a metadata entry, replacing any previous value for the key.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Checks the record is storable: a non-empty ID and at least one finite value.
    pub fn validate(&self) -> ValidationResult<()> {
        if self.id.is_empty() {
            return Err(ValidationError::MissingId);
        }
        if self.values.is_empty() {
            return Err(ValidationError::EmptyValues {
                id: self.id.clone(),
            });
        }
        if let Some(index) = self.values.iter().position(|v| !v.is_finite()) {
            return Err(ValidationError::NonFiniteValue {
                id: self.id.clone(),
                index,
            });
        }
        Ok(())
    }
}

/// One ranked entry of a query response.
///
/// The vector is shared with the store snapshot it was scored against, so
/// results are cheap to clone and to keep in the result cache.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResult {
    pub vector: Arc<Vector>,
    /// Cosine similarity in `[-1, 1]`.
    pub similarity: f64,
}

impl SearchResult {
    pub fn new(vector: Arc<Vector>, similarity: f64) -> Self {
        Self { vector, similarity }
    }

    /// Returns the ID of the matched vector.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.vector.id
    }
}

/// Type-safe wrapper for vector dimensions.
///
/// Ensures runtime validation of vector dimensions to prevent
/// zero-width stores and queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "usize", into = "usize")]
pub struct VectorDimension(usize);

impl VectorDimension {
    /// Creates a new `VectorDimension` with validation.
    ///
    /// Returns an error if the dimension is zero.
    pub fn new(dim: usize) -> ValidationResult<Self> {
        if dim == 0 {
            return Err(ValidationError::InvalidDimension {
                dimension: 0,
                reason: "Vector dimension cannot be zero",
            });
        }
        Ok(Self(dim))
    }

    /// Returns the underlying dimension value.
    #[must_use]
    pub const fn get(&self) -> usize {
        self.0
    }

}

impl Default for VectorDimension {
    fn default() -> Self {
        Self(DEFAULT_DIMENSION)
    }
}

impl TryFrom<usize> for VectorDimension {
    type Error = ValidationError;

    fn try_from(value: usize) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<VectorDimension> for usize {
    fn from(value: VectorDimension) -> Self {
        value.0
    }
}

impl std::fmt::Display for VectorDimension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vector_dimension() {
        let dim = VectorDimension::new(384).unwrap();
        assert_eq!(dim.get(), 384);
        assert_eq!(VectorDimension::default().get(), DEFAULT_DIMENSION);

        // Invalid dimension
        assert!(VectorDimension::new(0).is_err());
    }

    #[test]
    fn test_dimension_deserialize_rejects_zero() {
        assert!(serde_json::from_str::<VectorDimension>("0").is_err());
        let dim: VectorDimension = serde_json::from_str("16").unwrap();
        assert_eq!(dim.get(), 16);
    }

    #[test]
    fn test_vector_validation() {
        assert!(Vector::new("a", vec![1.0]).validate().is_ok());
        assert_eq!(
            Vector::new("", vec![1.0]).validate(),
            Err(ValidationError::MissingId)
        );
        assert_eq!(
            Vector::new("a", vec![]).validate(),
            Err(ValidationError::EmptyValues { id: "a".into() })
        );
        assert_eq!(
            Vector::new("a", vec![0.0, f32::NAN]).validate(),
            Err(ValidationError::NonFiniteValue {
                id: "a".into(),
                index: 1
            })
        );
    }

    #[test]
    fn test_metadata_is_optional_in_encoding() {
        let bare: Vector = serde_json::from_str(r#"{"id":"x","values":[1.0]}"#).unwrap();
        assert!(bare.metadata.is_empty());

        let null: Vector =
            serde_json::from_str(r#"{"id":"x","values":[1.0],"metadata":null}"#).unwrap();
        assert!(null.metadata.is_empty());

        let tagged = Vector::new("y", vec![0.5]).with_metadata("category", "news");
        let json = serde_json::to_string(&tagged).unwrap();
        assert!(json.contains("\"category\":\"news\""));
    }
}
