//! Mock face analyzer for testing.

use image::RgbImage;
use sha3::{Digest, Sha3_256};

use super::{DetectedFace, FaceAnalyzer};
use crate::error::Result;
use crate::fingerprint::{BoundingBox, FINGERPRINT_DIM};

/// Pixel value the mock treats as "a face is here".
pub const FACE_MARKER: [u8; 3] = [255, 0, 0];

/// Seed used by [`MockFaceAnalyzer::default_test`].
pub const DEFAULT_SEED: u64 = 0xFACE_1D00_CAFE_BABE;

/// Deterministic face analyzer.
///
/// Every pixel exactly equal to [`FACE_MARKER`] counts as one face. The
/// embedding is a SHA3 expansion of the seed, the full pixel buffer and the
/// face index, so identical images always yield identical fingerprints and
/// different images yield nearly orthogonal ones.
///
/// WARNING: Do not use in production - there is no biometric signal here!
pub struct MockFaceAnalyzer {
    seed: u64,
}

impl MockFaceAnalyzer {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    /// Create a mock with default seed for simple tests.
    pub fn default_test() -> Self {
        Self::new(DEFAULT_SEED)
    }

    fn embedding_for(&self, image_digest: &[u8], face_index: u32) -> Vec<f32> {
        let mut values = Vec::with_capacity(FINGERPRINT_DIM);
        let mut counter: u32 = 0;
        while values.len() < FINGERPRINT_DIM {
            let mut hasher = Sha3_256::new();
            hasher.update(self.seed.to_le_bytes());
            hasher.update(image_digest);
            hasher.update(face_index.to_le_bytes());
            hasher.update(counter.to_le_bytes());
            let block = hasher.finalize();

            for pair in block.chunks_exact(2) {
                if values.len() == FINGERPRINT_DIM {
                    break;
                }
                let raw = u16::from_le_bytes([pair[0], pair[1]]);
                values.push(raw as f32 / u16::MAX as f32 * 2.0 - 1.0);
            }
            counter += 1;
        }
        values
    }
}

impl Default for MockFaceAnalyzer {
    fn default() -> Self {
        Self::default_test()
    }
}

impl FaceAnalyzer for MockFaceAnalyzer {
    fn analyze(&self, image: &RgbImage) -> Result<Vec<DetectedFace>> {
        let markers: Vec<(u32, u32)> = image
            .enumerate_pixels()
            .filter(|(_, _, p)| p.0 == FACE_MARKER)
            .map(|(x, y, _)| (x, y))
            .collect();

        if markers.is_empty() {
            return Ok(Vec::new());
        }

        let image_digest = Sha3_256::digest(image.as_raw());

        Ok(markers
            .into_iter()
            .enumerate()
            .map(|(index, (x, y))| {
                let (x, y) = (x as f32, y as f32);
                DetectedFace {
                    bounding_box: BoundingBox([x, y, x + 1.0, y + 1.0]),
                    embedding: self.embedding_for(&image_digest, index as u32),
                    score: 0.99,
                }
            })
            .collect())
    }

    fn name(&self) -> String {
        format!("mock:{:x}", self.seed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::Fingerprint;
    use image::Rgb;

    fn portrait(background: [u8; 3], faces: &[(u32, u32)]) -> RgbImage {
        let mut img = RgbImage::from_pixel(16, 16, Rgb(background));
        for &(x, y) in faces {
            img.put_pixel(x, y, Rgb(FACE_MARKER));
        }
        img
    }

    #[test]
    fn test_counts_marker_pixels() {
        let analyzer = MockFaceAnalyzer::default();
        assert!(analyzer.analyze(&portrait([10, 10, 10], &[])).unwrap().is_empty());
        assert_eq!(
            analyzer
                .analyze(&portrait([10, 10, 10], &[(1, 1)]))
                .unwrap()
                .len(),
            1
        );
        assert_eq!(
            analyzer
                .analyze(&portrait([10, 10, 10], &[(1, 1), (8, 8)]))
                .unwrap()
                .len(),
            2
        );
    }

    #[test]
    fn test_mock_deterministic() {
        let a = MockFaceAnalyzer::new(42);
        let b = MockFaceAnalyzer::new(42);
        let img = portrait([20, 30, 40], &[(3, 3)]);

        let fa = a.analyze(&img).unwrap();
        let fb = b.analyze(&img).unwrap();
        assert_eq!(fa[0].embedding, fb[0].embedding, "Same image should produce same embedding");
        assert_eq!(fa[0].bounding_box, BoundingBox([3.0, 3.0, 4.0, 4.0]));
    }

    #[test]
    fn test_different_images_are_dissimilar() {
        let analyzer = MockFaceAnalyzer::default();
        let alice = analyzer.analyze(&portrait([200, 180, 160], &[(4, 4)])).unwrap();
        let bob = analyzer.analyze(&portrait([60, 80, 100], &[(4, 4)])).unwrap();

        let alice = Fingerprint::from_embedding(alice[0].embedding.clone()).unwrap();
        let bob = Fingerprint::from_embedding(bob[0].embedding.clone()).unwrap();
        assert!(alice.similarity(&bob) < 0.3);
    }
}
