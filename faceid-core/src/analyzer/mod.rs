//! Face analysis capability.
//!
//! The extractor depends only on the [`FaceAnalyzer`] contract: given decoded
//! pixels, return zero or more detected faces, each with a bounding box, a
//! fingerprint-sized embedding and a detection score.
//!
//! ## Providers
//!
//! - **ONNX Runtime** (`onnx` feature) - SCRFD detector + ArcFace recognizer
//! - **Mock** - Deterministic analyzer for tests and local development
//!
//! ## Compute backends
//!
//! The ONNX provider is built against a ranked list of [`ComputeBackend`]s.
//! Each backend is tried in order at startup and the first one that
//! initializes is bound for the lifetime of the process. `Cpu` is always the
//! last resort, so provider creation only fails if the models cannot be loaded.

mod mock;
#[cfg(feature = "onnx")]
mod onnx;

pub use mock::{MockFaceAnalyzer, DEFAULT_SEED, FACE_MARKER};
#[cfg(feature = "onnx")]
pub use onnx::OnnxFaceAnalyzer;

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use image::RgbImage;

use crate::error::{FaceIdError, Result};
use crate::fingerprint::BoundingBox;

/// One face found by an analyzer.
#[derive(Debug, Clone)]
pub struct DetectedFace {
    /// Face location in source image pixels.
    pub bounding_box: BoundingBox,
    /// Raw identity embedding (normalized by the extractor).
    pub embedding: Vec<f32>,
    /// Detection confidence in `[0, 1]`.
    pub score: f32,
}

/// Detect faces and compute their embeddings.
///
/// Implementations are CPU/GPU bound and synchronous; callers are expected to
/// run them on a blocking thread behind the admission gate.
pub trait FaceAnalyzer: Send + Sync {
    /// Detect every face in `image`.
    fn analyze(&self, image: &RgbImage) -> Result<Vec<DetectedFace>>;

    /// Run one throwaway inference so the first real request does not pay
    /// graph initialization latency.
    fn warmup(&self) -> Result<()> {
        let blank = RgbImage::new(112, 112);
        self.analyze(&blank).map(|_| ())
    }

    /// Provider identifier for logs and diagnostics.
    fn name(&self) -> String;
}

/// Compute backend for the ONNX provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComputeBackend {
    Cuda,
    TensorRt,
    CoreMl,
    DirectMl,
    /// Baseline backend, always available.
    Cpu,
}

impl ComputeBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cuda => "cuda",
            Self::TensorRt => "tensorrt",
            Self::CoreMl => "coreml",
            Self::DirectMl => "directml",
            Self::Cpu => "cpu",
        }
    }
}

impl std::fmt::Display for ComputeBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ComputeBackend {
    type Err = FaceIdError;

    /// Accepts short names (`cuda`) and ONNX Runtime provider names
    /// (`CUDAExecutionProvider`), case-insensitively.
    fn from_str(s: &str) -> Result<Self> {
        let lower = s.trim().to_ascii_lowercase();
        let short = lower.strip_suffix("executionprovider").unwrap_or(&lower);
        match short {
            "cuda" => Ok(Self::Cuda),
            "tensorrt" => Ok(Self::TensorRt),
            "coreml" => Ok(Self::CoreMl),
            "directml" | "dml" => Ok(Self::DirectMl),
            "cpu" => Ok(Self::Cpu),
            other => Err(FaceIdError::InvalidConfig(format!(
                "unknown compute backend '{other}'"
            ))),
        }
    }
}

/// Parse a comma-separated, ranked backend list.
///
/// Duplicates are dropped and `cpu` is appended if missing, so the result is
/// never empty and always ends with the baseline backend.
pub fn parse_backend_list(list: &str) -> Result<Vec<ComputeBackend>> {
    let mut backends = Vec::new();
    for item in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let backend: ComputeBackend = item.parse()?;
        if !backends.contains(&backend) {
            backends.push(backend);
        }
    }
    backends.retain(|b| *b != ComputeBackend::Cpu);
    backends.push(ComputeBackend::Cpu);
    Ok(backends)
}

/// Configuration for the ONNX Runtime provider.
#[derive(Debug, Clone)]
pub struct OnnxAnalyzerConfig {
    /// Root directory that holds model packs.
    pub model_dir: PathBuf,
    /// Model pack name (subdirectory of `model_dir`), e.g. `buffalo_l`.
    pub model_name: String,
    /// Detector input resolution `(width, height)`.
    pub det_size: (u32, u32),
    /// Ranked compute backends, first available wins.
    pub backends: Vec<ComputeBackend>,
    /// Minimum detection score for a face to count.
    pub det_threshold: f32,
    /// IoU above which overlapping detections are suppressed.
    pub nms_threshold: f32,
}

impl Default for OnnxAnalyzerConfig {
    fn default() -> Self {
        Self {
            model_dir: PathBuf::from("./models"),
            model_name: "buffalo_l".to_string(),
            det_size: (640, 640),
            backends: vec![ComputeBackend::Cuda, ComputeBackend::Cpu],
            det_threshold: 0.5,
            nms_threshold: 0.4,
        }
    }
}

impl OnnxAnalyzerConfig {
    pub fn pack_dir(&self) -> PathBuf {
        self.model_dir.join(&self.model_name)
    }
}

/// Which analyzer to build.
#[derive(Debug, Clone)]
pub enum AnalyzerConfig {
    /// ONNX Runtime SCRFD + ArcFace.
    Onnx(OnnxAnalyzerConfig),
    /// Deterministic mock (testing only).
    Mock { seed: u64 },
}

/// Factory for face analyzers.
pub struct AnalyzerFactory;

impl AnalyzerFactory {
    /// Build the analyzer described by `config`.
    pub fn create(config: AnalyzerConfig) -> Result<Arc<dyn FaceAnalyzer>> {
        match config {
            #[cfg(feature = "onnx")]
            AnalyzerConfig::Onnx(onnx_config) => {
                let analyzer = OnnxFaceAnalyzer::new(onnx_config)?;
                Ok(Arc::new(analyzer))
            }
            #[cfg(not(feature = "onnx"))]
            AnalyzerConfig::Onnx(_) => Err(FaceIdError::InvalidConfig(
                "built without the `onnx` feature".into(),
            )),
            AnalyzerConfig::Mock { seed } => {
                tracing::warn!("Using mock face analyzer - fingerprints are NOT biometric");
                Ok(Arc::new(MockFaceAnalyzer::new(seed)))
            }
        }
    }

    /// Create a mock analyzer for testing.
    pub fn create_mock() -> Arc<dyn FaceAnalyzer> {
        Arc::new(MockFaceAnalyzer::default())
    }
}
