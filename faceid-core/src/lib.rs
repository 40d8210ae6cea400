//! FaceID Core - face identity matching pipeline
//!
//! This crate turns face images into fingerprints and matches them against a
//! store of enrolled identities.
//!
//! # Features
//!
//! - Single-face fingerprint extraction (512-d, unit-normalized)
//! - ONNX Runtime SCRFD + ArcFace analyzer with a compute backend fallback chain
//! - Identity store client with connect retry and single-flight lazy reconnect
//! - pgvector (Postgres) and in-memory store backends
//! - Bounded-concurrency admission gate around inference
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use faceid_core::{
//!     AdmissionGate, AnalyzerFactory, FingerprintExtractor, IdentityPipeline, IdentityStore,
//!     MemoryBackend, StoreEndpoint,
//! };
//!
//! # async fn example(image: Vec<u8>) -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(IdentityStore::new(Arc::new(MemoryBackend::new()), "face_embeddings"));
//! store.connect(StoreEndpoint::default()).await?;
//! store.ensure_schema().await?;
//!
//! let extractor = FingerprintExtractor::new(AnalyzerFactory::create_mock());
//! let pipeline = IdentityPipeline::new(extractor, store, AdmissionGate::new(6)?, 0.6)?;
//!
//! pipeline.enroll("alice", image.clone()).await?;
//! let outcome = pipeline.verify(image, None).await?;
//! assert!(outcome.verdict.matched);
//! # Ok(())
//! # }
//! ```

pub mod admission;
pub mod analyzer;
pub mod error;
pub mod extractor;
pub mod fingerprint;
pub mod matching;
pub mod pipeline;
pub mod store;

// Re-export main types for convenience
pub use admission::AdmissionGate;
pub use analyzer::{
    parse_backend_list, AnalyzerConfig, AnalyzerFactory, ComputeBackend, DetectedFace,
    FaceAnalyzer, MockFaceAnalyzer, OnnxAnalyzerConfig,
};
pub use error::{FaceIdError, Result};
pub use extractor::{DetectionOutcome, FingerprintExtractor};
pub use fingerprint::{BoundingBox, Fingerprint, FINGERPRINT_DIM};
pub use matching::{decide, MatchResult, DEFAULT_THRESHOLD};
pub use pipeline::{
    DeleteOutcome, EnrollOutcome, Extraction, IdentityPipeline, PipelineError, Readiness,
    VerifyOutcome,
};
pub use store::{
    ConnectionState, IdentityStore, MemoryBackend, RetryPolicy, StoreEndpoint, StoreError,
    VectorBackend,
};

#[cfg(feature = "onnx")]
pub use analyzer::OnnxFaceAnalyzer;
#[cfg(feature = "postgres")]
pub use store::{PgVectorBackend, VectorIndex};
