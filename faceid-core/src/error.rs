use thiserror::Error;

#[derive(Error, Debug)]
pub enum FaceIdError {
    #[error("Model error: {0}")]
    ModelError(String),

    #[error("Inference error: {0}")]
    InferenceError(String),

    #[error("No compute backend could be initialized: {0}")]
    BackendUnavailable(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Fingerprint dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Inference task failed: {0}")]
    TaskFailed(String),
}

#[cfg(feature = "onnx")]
impl From<ort::Error> for FaceIdError {
    fn from(err: ort::Error) -> Self {
        FaceIdError::InferenceError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, FaceIdError>;
