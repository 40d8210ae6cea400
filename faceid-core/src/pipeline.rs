//! Pipeline orchestrator.
//!
//! Composes admission control, fingerprint extraction, the identity store and
//! match decision logic into the per-request operations: enroll, verify,
//! delete, extract-only and list.

use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::admission::AdmissionGate;
use crate::error::FaceIdError;
use crate::extractor::{DetectionOutcome, FingerprintExtractor};
use crate::fingerprint::{BoundingBox, Fingerprint};
use crate::matching::{decide, threshold_in_range, MatchResult};
use crate::store::{validate_label, IdentityStore, StoreError};

/// Failure taxonomy for pipeline operations.
#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    #[error("Image could not be decoded")]
    DecodeFailed,

    #[error("No face detected in image")]
    NoFaceDetected,

    #[error("Multiple faces detected ({count}); exactly one face is required")]
    MultipleFacesDetected { count: usize },

    #[error("Invalid identity label: {0}")]
    InvalidLabel(String),

    #[error("Threshold must be within [0, 1], got {0}")]
    InvalidThreshold(f32),

    #[error("Identity store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("No identity enrolled under label '{0}'")]
    NotFound(String),

    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

impl From<StoreError> for PipelineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotConnected
            | StoreError::Connection(_)
            | StoreError::CollectionMissing(_) => PipelineError::StoreUnavailable(err.to_string()),
            StoreError::NotFound(label) => PipelineError::NotFound(label),
            StoreError::InvalidLabel(msg) => PipelineError::InvalidLabel(msg),
            StoreError::SchemaMismatch { .. } | StoreError::Query(_) => {
                PipelineError::Unexpected(err.to_string())
            }
        }
    }
}

impl From<FaceIdError> for PipelineError {
    fn from(err: FaceIdError) -> Self {
        PipelineError::Unexpected(err.to_string())
    }
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

/// A successful single-face extraction.
#[derive(Debug, Clone)]
pub struct Extraction {
    pub fingerprint: Fingerprint,
    pub bounding_box: BoundingBox,
    pub detection_confidence: f32,
}

#[derive(Debug, Clone)]
pub struct EnrollOutcome {
    pub identity_label: String,
    pub detection_confidence: f32,
    pub inserted: u64,
    pub internal_id: i64,
}

#[derive(Debug, Clone)]
pub struct VerifyOutcome {
    pub verdict: MatchResult,
    pub detection_confidence: f32,
    /// Set when there was nothing to compare against.
    pub message: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DeleteOutcome {
    pub identity_label: String,
    pub deleted: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct Readiness {
    pub ready: bool,
    pub store_connected: bool,
}

/// Message returned by verify when the collection is empty.
pub const NO_RECORDS_MESSAGE: &str = "No records enrolled";

/// The identity-matching service. Built once at startup and shared.
pub struct IdentityPipeline {
    extractor: FingerprintExtractor,
    store: Arc<IdentityStore>,
    gate: AdmissionGate,
    default_threshold: f32,
}

impl IdentityPipeline {
    pub fn new(
        extractor: FingerprintExtractor,
        store: Arc<IdentityStore>,
        gate: AdmissionGate,
        default_threshold: f32,
    ) -> PipelineResult<Self> {
        if !threshold_in_range(default_threshold) {
            return Err(PipelineError::InvalidThreshold(default_threshold));
        }
        Ok(Self {
            extractor,
            store,
            gate,
            default_threshold,
        })
    }

    pub fn store(&self) -> &Arc<IdentityStore> {
        &self.store
    }

    pub fn gate(&self) -> &AdmissionGate {
        &self.gate
    }

    pub fn default_threshold(&self) -> f32 {
        self.default_threshold
    }

    pub fn analyzer_name(&self) -> String {
        self.extractor.analyzer_name()
    }

    /// Run the extractor behind the admission gate and require a single face.
    async fn extract(&self, image_bytes: Vec<u8>) -> PipelineResult<Extraction> {
        let extractor = self.extractor.clone();
        let started = Instant::now();
        let outcome = self
            .gate
            .run(move || extractor.extract(&image_bytes))
            .await??;

        let latency_ms = started.elapsed().as_millis() as u64;
        match outcome {
            DetectionOutcome::Success {
                fingerprint,
                bounding_box,
                detection_confidence,
            } => {
                info!(latency_ms, detection_confidence, "Fingerprint extracted");
                Ok(Extraction {
                    fingerprint,
                    bounding_box,
                    detection_confidence,
                })
            }
            DetectionOutcome::NoFaceFound => Err(PipelineError::NoFaceDetected),
            DetectionOutcome::MultipleFacesFound { count } => {
                Err(PipelineError::MultipleFacesDetected { count })
            }
            DetectionOutcome::DecodeFailed => Err(PipelineError::DecodeFailed),
        }
    }

    /// Bind the face in `image_bytes` to `identity_label`.
    ///
    /// Re-enrolling a label adds another record for it.
    #[instrument(skip(self, image_bytes), fields(bytes = image_bytes.len()))]
    pub async fn enroll(
        &self,
        identity_label: &str,
        image_bytes: Vec<u8>,
    ) -> PipelineResult<EnrollOutcome> {
        let label = validate_label(identity_label)?.to_string();
        let extraction = self.extract(image_bytes).await?;

        let inserted = self.store.insert(&label, &extraction.fingerprint).await?;
        info!(
            label = %label,
            detection_confidence = extraction.detection_confidence,
            "Identity enrolled"
        );

        Ok(EnrollOutcome {
            identity_label: label,
            detection_confidence: extraction.detection_confidence,
            inserted: inserted.inserted,
            internal_id: inserted.internal_id,
        })
    }

    /// Find the enrolled identity that best matches the face in `image_bytes`.
    #[instrument(skip(self, image_bytes), fields(bytes = image_bytes.len()))]
    pub async fn verify(
        &self,
        image_bytes: Vec<u8>,
        threshold: Option<f32>,
    ) -> PipelineResult<VerifyOutcome> {
        let threshold = threshold.unwrap_or(self.default_threshold);
        if !threshold_in_range(threshold) {
            return Err(PipelineError::InvalidThreshold(threshold));
        }

        let extraction = self.extract(image_bytes).await?;
        let hits = self.store.search(&extraction.fingerprint, 1).await?;

        let Some(best) = hits.first() else {
            info!(threshold, "Verification against empty collection");
            return Ok(VerifyOutcome {
                verdict: MatchResult {
                    matched: false,
                    identity_label: None,
                    similarity: 0.0,
                    threshold,
                },
                detection_confidence: extraction.detection_confidence,
                message: Some(NO_RECORDS_MESSAGE.to_string()),
            });
        };

        let verdict = decide(best.similarity, threshold, Some(&best.identity_label));
        info!(
            matched = verdict.matched,
            similarity = verdict.similarity,
            threshold,
            "Verification complete"
        );

        Ok(VerifyOutcome {
            verdict,
            detection_confidence: extraction.detection_confidence,
            message: None,
        })
    }

    /// Remove every record for `identity_label`.
    #[instrument(skip(self))]
    pub async fn delete(&self, identity_label: &str) -> PipelineResult<DeleteOutcome> {
        let label = validate_label(identity_label)?.to_string();
        let deleted = self.store.delete(&label).await.map_err(|e| {
            if !matches!(e, StoreError::NotFound(_)) {
                warn!(error = %e, "Delete failed");
            }
            PipelineError::from(e)
        })?;
        Ok(DeleteOutcome {
            identity_label: label,
            deleted,
        })
    }

    /// Extract a fingerprint without touching the store.
    #[instrument(skip(self, image_bytes), fields(bytes = image_bytes.len()))]
    pub async fn extract_only(&self, image_bytes: Vec<u8>) -> PipelineResult<Extraction> {
        self.extract(image_bytes).await
    }

    pub async fn list_identities(&self) -> PipelineResult<Vec<String>> {
        Ok(self.store.list_labels().await?)
    }

    /// Readiness: the store is connected and the collection is reachable.
    pub async fn readiness(&self) -> Readiness {
        let healthy = self.store.health().await;
        Readiness {
            ready: healthy,
            store_connected: self.store.is_connected(),
        }
    }
}
