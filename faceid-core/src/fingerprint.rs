//! Face fingerprints.
//!
//! A fingerprint is the fixed-length, unit-normalized embedding that represents
//! one face's identity signature. Because every fingerprint has unit length,
//! the inner product of two fingerprints equals their cosine similarity.

use serde::{Deserialize, Serialize};

use crate::error::{FaceIdError, Result};

/// Dimension of every fingerprint produced and stored by this crate.
pub const FINGERPRINT_DIM: usize = 512;

/// Tolerance used when checking that a fingerprint has unit length.
pub const NORM_EPSILON: f32 = 1e-3;

/// Unit-length face embedding of exactly [`FINGERPRINT_DIM`] elements.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Fingerprint(Vec<f32>);

impl Fingerprint {
    /// Build a fingerprint from a raw embedding, L2-normalizing it.
    ///
    /// Fails if the embedding has the wrong dimension or zero magnitude.
    pub fn from_embedding(mut values: Vec<f32>) -> Result<Self> {
        if values.len() != FINGERPRINT_DIM {
            return Err(FaceIdError::DimensionMismatch {
                expected: FINGERPRINT_DIM,
                actual: values.len(),
            });
        }

        let norm = l2_norm(&values);
        if !norm.is_finite() || norm <= f32::EPSILON {
            return Err(FaceIdError::InferenceError(
                "embedding has zero or non-finite magnitude".into(),
            ));
        }

        for v in values.iter_mut() {
            *v /= norm;
        }

        Ok(Self(values))
    }

    /// Wrap values that are already unit length (e.g. read back from the store).
    pub fn from_normalized(values: Vec<f32>) -> Result<Self> {
        if values.len() != FINGERPRINT_DIM {
            return Err(FaceIdError::DimensionMismatch {
                expected: FINGERPRINT_DIM,
                actual: values.len(),
            });
        }
        Ok(Self(values))
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    pub fn into_vec(self) -> Vec<f32> {
        self.0
    }

    pub fn dimension(&self) -> usize {
        self.0.len()
    }

    pub fn norm(&self) -> f32 {
        l2_norm(&self.0)
    }

    /// Inner product with another fingerprint (cosine similarity for unit vectors).
    pub fn similarity(&self, other: &Fingerprint) -> f32 {
        inner_product(&self.0, &other.0)
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let values = Vec::<f32>::deserialize(deserializer)?;
        Fingerprint::from_embedding(values).map_err(serde::de::Error::custom)
    }
}

/// Axis-aligned face bounding box in source image pixels: `[x1, y1, x2, y2]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BoundingBox(pub [f32; 4]);

impl BoundingBox {
    pub fn width(&self) -> f32 {
        (self.0[2] - self.0[0]).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.0[3] - self.0[1]).max(0.0)
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    /// Intersection over union with another box.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let x1 = self.0[0].max(other.0[0]);
        let y1 = self.0[1].max(other.0[1]);
        let x2 = self.0[2].min(other.0[2]);
        let y2 = self.0[3].min(other.0[3]);

        let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }
}

pub fn inner_product(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

fn l2_norm(values: &[f32]) -> f32 {
    values.iter().map(|v| v * v).sum::<f32>().sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn basis(index: usize) -> Vec<f32> {
        let mut v = vec![0.0; FINGERPRINT_DIM];
        v[index] = 3.0;
        v
    }

    #[test]
    fn test_from_embedding_normalizes() {
        let fp = Fingerprint::from_embedding(basis(7)).unwrap();
        assert_eq!(fp.dimension(), FINGERPRINT_DIM);
        assert!((fp.norm() - 1.0).abs() < NORM_EPSILON);
        assert!((fp.as_slice()[7] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_wrong_dimension_rejected() {
        let err = Fingerprint::from_embedding(vec![1.0; 128]).unwrap_err();
        assert!(matches!(
            err,
            FaceIdError::DimensionMismatch {
                expected: FINGERPRINT_DIM,
                actual: 128
            }
        ));
    }

    #[test]
    fn test_zero_vector_rejected() {
        assert!(Fingerprint::from_embedding(vec![0.0; FINGERPRINT_DIM]).is_err());
    }

    #[test]
    fn test_similarity_is_cosine() {
        let a = Fingerprint::from_embedding(basis(0)).unwrap();
        let b = Fingerprint::from_embedding(basis(1)).unwrap();
        assert!((a.similarity(&a) - 1.0).abs() < 1e-6);
        assert!(a.similarity(&b).abs() < 1e-6);
    }

    #[test]
    fn test_deserialize_renormalizes() {
        let json = serde_json::to_string(&basis(3)).unwrap();
        let fp: Fingerprint = serde_json::from_str(&json).unwrap();
        assert!((fp.norm() - 1.0).abs() < NORM_EPSILON);
    }

    #[test]
    fn test_iou() {
        let a = BoundingBox([0.0, 0.0, 10.0, 10.0]);
        let b = BoundingBox([5.0, 0.0, 15.0, 10.0]);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
        assert!((a.iou(&b) - 50.0 / 150.0).abs() < 1e-6);
        assert_eq!(a.iou(&BoundingBox([20.0, 20.0, 30.0, 30.0])), 0.0);
    }
}
