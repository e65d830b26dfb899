//! Numeric primitives shared by ingestion and search.
//!
//! Every vector, stored or queried, goes through [`conform`]: zero-extend or
//! truncate to the target dimension, then L2-normalize. Normalizing an
//! all-zero vector is a no-op rather than a fault.

use crate::error::{ValidationError, ValidationResult};
use crate::vector::VectorDimension;

/// Calculates cosine similarity between two vectors of equal length.
///
/// Accumulates in `f64`. Returns `0.0` when either vector has zero norm.
///
/// # Errors
/// `LengthMismatch` when the slices differ in length.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> ValidationResult<f64> {
    if a.len() != b.len() {
        return Err(ValidationError::LengthMismatch {
            expected: a.len(),
            actual: b.len(),
        });
    }

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (&x, &y) in a.iter().zip(b) {
        let (x, y) = (f64::from(x), f64::from(y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let norms = norm_a.sqrt() * norm_b.sqrt();
    if norms == 0.0 {
        Ok(0.0)
    } else {
        // Rounding can push the ratio a hair outside [-1, 1].
        Ok((dot / norms).clamp(-1.0, 1.0))
    }
}

/// Sum of squares in `f64`, where no finite `f32` input can overflow or
/// underflow to zero.
fn norm_f64(vector: &[f32]) -> f64 {
    vector
        .iter()
        .map(|&x| f64::from(x) * f64::from(x))
        .sum::<f64>()
        .sqrt()
}

/// Returns the Euclidean norm of a vector.
#[must_use]
pub fn l2_norm(vector: &[f32]) -> f32 {
    norm_f64(vector) as f32
}

/// Scales a vector to unit length in place. Zero vectors are left untouched.
pub fn normalize_in_place(vector: &mut [f32]) {
    let norm = norm_f64(vector);
    if norm > 0.0 {
        for value in vector.iter_mut() {
            *value = (f64::from(*value) / norm) as f32;
        }
    }
}

/// Copies `vector` into a new buffer of exactly `target` components,
/// zero-extending or truncating as needed.
#[must_use]
pub fn pad_or_truncate(vector: &[f32], target: usize) -> Vec<f32> {
    let mut padded = vec![0.0; target];
    let n = vector.len().min(target);
    padded[..n].copy_from_slice(&vector[..n]);
    padded
}

/// Resizes `values` to `dimension` and re-normalizes it.
///
/// This always re-normalizes, even when the length already matches.
pub fn conform(values: &mut Vec<f32>, dimension: VectorDimension) {
    values.resize(dimension.get(), 0.0);
    normalize_in_place(values);
}

/// Owned variant of [`conform`] for borrowed input such as query vectors.
#[must_use]
pub fn conformed(values: &[f32], dimension: VectorDimension) -> Vec<f32> {
    let mut padded = pad_or_truncate(values, dimension.get());
    normalize_in_place(&mut padded);
    padded
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-6;

    #[test]
    fn test_cosine_similarity_identity_and_opposite() {
        let v = [0.3f32, -1.2, 4.0, 0.0];
        let neg: Vec<f32> = v.iter().map(|x| -x).collect();

        assert!((cosine_similarity(&v, &v).unwrap() - 1.0).abs() < EPS);
        assert!((cosine_similarity(&v, &neg).unwrap() + 1.0).abs() < EPS);
    }

    #[test]
    fn test_cosine_similarity_zero_norm_is_zero() {
        let zero = [0.0f32; 3];
        let v = [1.0f32, 2.0, 3.0];
        assert_eq!(cosine_similarity(&zero, &v).unwrap(), 0.0);
        assert_eq!(cosine_similarity(&zero, &zero).unwrap(), 0.0);
    }

    #[test]
    fn test_cosine_similarity_rejects_length_mismatch() {
        let result = cosine_similarity(&[1.0, 0.0], &[1.0, 0.0, 0.0]);
        assert_eq!(
            result,
            Err(ValidationError::LengthMismatch {
                expected: 2,
                actual: 3
            })
        );
    }

    #[test]
    fn test_normalize_in_place() {
        let mut v = vec![3.0f32, 4.0];
        normalize_in_place(&mut v);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);

        let mut zero = vec![0.0f32; 4];
        normalize_in_place(&mut zero);
        assert!(zero.iter().all(|&x| x == 0.0));
    }

    #[test]
    fn test_normalize_extreme_magnitudes() {
        let dim = VectorDimension::new(4).unwrap();

        let large = conformed(&[1e20, 0.0, 0.0, 0.0], dim);
        assert_eq!(large, vec![1.0, 0.0, 0.0, 0.0]);

        let tiny = conformed(&[1e-25, 0.0, 0.0, 0.0], dim);
        assert_eq!(tiny, vec![1.0, 0.0, 0.0, 0.0]);

        let mixed = conformed(&[3e30, 4e30], dim);
        assert!((mixed[0] - 0.6).abs() < 1e-6);
        assert!((mixed[1] - 0.8).abs() < 1e-6);
        assert!((l2_norm(&mixed) - 1.0).abs() < 1e-6);

        let mut saturated = vec![f32::MAX, f32::MAX];
        normalize_in_place(&mut saturated);
        assert!((saturated[0] - std::f32::consts::FRAC_1_SQRT_2).abs() < 1e-6);
    }

    #[test]
    fn test_pad_or_truncate() {
        assert_eq!(pad_or_truncate(&[1.0, 2.0], 4), vec![1.0, 2.0, 0.0, 0.0]);
        assert_eq!(pad_or_truncate(&[1.0, 2.0, 3.0], 2), vec![1.0, 2.0]);
        assert_eq!(pad_or_truncate(&[], 2), vec![0.0, 0.0]);
    }

    #[test]
    fn test_conform_pads_and_normalizes() {
        let dim = VectorDimension::new(6).unwrap();
        let mut v = vec![2.0f32, 0.0, 0.0];
        conform(&mut v, dim);

        assert_eq!(v.len(), 6);
        assert!((v[0] - 1.0).abs() < 1e-6);
        assert!(v[3..].iter().all(|&x| x == 0.0));
        assert!((l2_norm(&v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_conform_renormalizes_at_target_length() {
        let dim = VectorDimension::new(2).unwrap();
        let mut v = vec![3.0f32, 4.0];
        conform(&mut v, dim);
        assert!((l2_norm(&v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_conformed_truncates_long_queries() {
        let dim = VectorDimension::new(2).unwrap();
        let q = conformed(&[0.0, 5.0, 100.0], dim);
        assert_eq!(q, vec![0.0, 1.0]);
    }
}
