//! Fingerprint extraction under the single-face policy.

use std::sync::Arc;

use tracing::{debug, instrument};

use crate::analyzer::FaceAnalyzer;
use crate::error::Result;
use crate::fingerprint::{BoundingBox, Fingerprint};

/// Result of running the extractor on one image.
#[derive(Debug, Clone)]
pub enum DetectionOutcome {
    /// Exactly one face was found.
    Success {
        fingerprint: Fingerprint,
        bounding_box: BoundingBox,
        detection_confidence: f32,
    },
    NoFaceFound,
    /// More than one face was found; the extractor refuses to pick one.
    MultipleFacesFound { count: usize },
    /// The bytes could not be decoded into an image.
    DecodeFailed,
}

impl DetectionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, DetectionOutcome::Success { .. })
    }
}

/// Turns raw image bytes into a [`DetectionOutcome`].
#[derive(Clone)]
pub struct FingerprintExtractor {
    analyzer: Arc<dyn FaceAnalyzer>,
}

impl FingerprintExtractor {
    pub fn new(analyzer: Arc<dyn FaceAnalyzer>) -> Self {
        Self { analyzer }
    }

    pub fn analyzer_name(&self) -> String {
        self.analyzer.name()
    }

    /// Decode `image_bytes`, detect faces and apply the single-face policy.
    ///
    /// Only analyzer runtime failures are returned as `Err`; every
    /// input-related condition is a [`DetectionOutcome`] variant.
    #[instrument(skip_all, fields(bytes = image_bytes.len()))]
    pub fn extract(&self, image_bytes: &[u8]) -> Result<DetectionOutcome> {
        let image = match image::load_from_memory(image_bytes) {
            Ok(img) => img.to_rgb8(),
            Err(e) => {
                debug!(error = %e, "Image decode failed");
                return Ok(DetectionOutcome::DecodeFailed);
            }
        };
        if image.width() == 0 || image.height() == 0 {
            return Ok(DetectionOutcome::DecodeFailed);
        }

        let mut faces = self.analyzer.analyze(&image)?;
        debug!(faces = faces.len(), "Face analysis complete");

        match faces.len() {
            0 => Ok(DetectionOutcome::NoFaceFound),
            1 => {
                let face = faces.remove(0);
                let fingerprint = Fingerprint::from_embedding(face.embedding)?;
                Ok(DetectionOutcome::Success {
                    fingerprint,
                    bounding_box: face.bounding_box,
                    detection_confidence: face.score.clamp(0.0, 1.0),
                })
            }
            count => Ok(DetectionOutcome::MultipleFacesFound { count }),
        }
    }

    /// Prime the analyzer with one throwaway inference. The result is discarded.
    pub fn warmup(&self) -> Result<()> {
        self.analyzer.warmup()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::{MockFaceAnalyzer, FACE_MARKER};
    use crate::fingerprint::{FINGERPRINT_DIM, NORM_EPSILON};
    use image::{ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;

    fn png_with_faces(faces: &[(u32, u32)]) -> Vec<u8> {
        let mut img = RgbImage::from_pixel(32, 32, Rgb([90, 120, 150]));
        for &(x, y) in faces {
            img.put_pixel(x, y, Rgb(FACE_MARKER));
        }
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, ImageFormat::Png).unwrap();
        buf.into_inner()
    }

    fn extractor() -> FingerprintExtractor {
        FingerprintExtractor::new(Arc::new(MockFaceAnalyzer::default()))
    }

    #[test]
    fn test_single_face_success() {
        let outcome = extractor().extract(&png_with_faces(&[(10, 12)])).unwrap();
        match outcome {
            DetectionOutcome::Success {
                fingerprint,
                bounding_box,
                detection_confidence,
            } => {
                assert_eq!(fingerprint.dimension(), FINGERPRINT_DIM);
                assert!((fingerprint.norm() - 1.0).abs() < NORM_EPSILON);
                assert_eq!(bounding_box.0[0], 10.0);
                assert!((0.0..=1.0).contains(&detection_confidence));
            }
            other => panic!("expected success, got {other:?}"),
        }
    }

    #[test]
    fn test_no_face() {
        let outcome = extractor().extract(&png_with_faces(&[])).unwrap();
        assert!(matches!(outcome, DetectionOutcome::NoFaceFound));
    }

    #[test]
    fn test_multiple_faces_rejected() {
        let outcome = extractor()
            .extract(&png_with_faces(&[(1, 1), (20, 20), (30, 5)]))
            .unwrap();
        assert!(matches!(
            outcome,
            DetectionOutcome::MultipleFacesFound { count: 3 }
        ));
        assert!(!outcome.is_success());
    }

    #[test]
    fn test_garbage_bytes() {
        let outcome = extractor().extract(b"definitely not an image").unwrap();
        assert!(matches!(outcome, DetectionOutcome::DecodeFailed));

        let outcome = extractor().extract(&[]).unwrap();
        assert!(matches!(outcome, DetectionOutcome::DecodeFailed));
    }

    #[test]
    fn test_same_image_same_fingerprint() {
        let bytes = png_with_faces(&[(4, 4)]);
        let ex = extractor();
        let (a, b) = match (ex.extract(&bytes).unwrap(), ex.extract(&bytes).unwrap()) {
            (
                DetectionOutcome::Success { fingerprint: a, .. },
                DetectionOutcome::Success { fingerprint: b, .. },
            ) => (a, b),
            _ => panic!("expected two successes"),
        };
        assert!((a.similarity(&b) - 1.0).abs() < 1e-5);
    }
}
