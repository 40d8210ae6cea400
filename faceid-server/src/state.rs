//! Application state module
//!
//! Defines shared state accessible across all request handlers, and how it is
//! assembled at startup.

use std::sync::Arc;

use faceid_core::{
    AdmissionGate, AnalyzerFactory, FaceIdError, FingerprintExtractor, IdentityPipeline,
    IdentityStore, MemoryBackend, PipelineError, StoreError, VectorBackend,
};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::{Config, StoreBackendKind};
use crate::error::ApiError;
use crate::image_fetch::ImageFetcher;

/// Fatal startup failures. A store that cannot be reached is not one of them.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("Initialization failed: {0}")]
    Core(#[from] FaceIdError),

    #[error("Identity store setup failed: {0}")]
    Store(#[from] StoreError),

    #[error("Pipeline setup failed: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("HTTP client setup failed: {0}")]
    Http(#[from] ApiError),
}

/// Application state containing shared resources.
#[derive(Clone)]
pub struct AppState {
    /// Identity-matching pipeline (extractor, store client, admission gate)
    pub pipeline: Arc<IdentityPipeline>,
    /// Client for `image_url` downloads
    pub fetcher: ImageFetcher,
    /// Upload ceiling in bytes
    pub max_image_bytes: usize,
}

impl AppState {
    pub fn new(pipeline: Arc<IdentityPipeline>, fetcher: ImageFetcher) -> Self {
        let max_image_bytes = fetcher.max_bytes();
        Self {
            pipeline,
            fetcher,
            max_image_bytes,
        }
    }

    /// Build everything the handlers need from `config`.
    ///
    /// The analyzer is loaded and warmed up first. The store is then connected
    /// with the configured retry policy; if that fails the server still starts
    /// and the store reconnects lazily on first use.
    pub async fn from_config(config: &Config) -> Result<Self, StartupError> {
        let extractor = build_extractor(config).await?;

        let backend = build_backend(config)?;
        let store = Arc::new(
            IdentityStore::new(backend, config.store_collection.clone())
                .with_retry_policy(config.retry_policy()),
        );

        match store.connect(config.store_endpoint.clone()).await {
            Ok(()) => match store.ensure_schema().await {
                Ok(status) => info!(
                    collection = %config.store_collection,
                    status = ?status,
                    "Identity collection ready"
                ),
                Err(e) => warn!(error = %e, "Identity collection setup failed, will retry lazily"),
            },
            Err(e) => warn!(
                error = %e,
                endpoint = %config.store_endpoint,
                "Identity store unreachable at startup, continuing in degraded mode"
            ),
        }

        let gate = AdmissionGate::new(config.max_concurrent_inference)?;
        let pipeline = IdentityPipeline::new(extractor, store, gate, config.similarity_threshold)?;
        let fetcher = ImageFetcher::from_config(config)?;

        Ok(Self::new(Arc::new(pipeline), fetcher))
    }
}

/// Load and warm up the analyzer off the async runtime.
async fn build_extractor(config: &Config) -> Result<FingerprintExtractor, StartupError> {
    let analyzer_config = config.analyzer_config();
    let extractor = tokio::task::spawn_blocking(move || {
        let analyzer = AnalyzerFactory::create(analyzer_config)?;
        let extractor = FingerprintExtractor::new(analyzer);
        extractor.warmup()?;
        Ok::<_, FaceIdError>(extractor)
    })
    .await
    .map_err(|e| FaceIdError::TaskFailed(e.to_string()))??;

    info!(analyzer = %extractor.analyzer_name(), "Face analyzer ready");
    Ok(extractor)
}

fn build_backend(config: &Config) -> Result<Arc<dyn VectorBackend>, StartupError> {
    match config.store_backend {
        StoreBackendKind::Memory => {
            warn!("Using in-memory identity store - enrollments are lost on restart");
            Ok(Arc::new(MemoryBackend::new()))
        }
        #[cfg(feature = "postgres")]
        StoreBackendKind::Postgres => {
            let index: faceid_core::VectorIndex = config.store_index.parse()?;
            Ok(Arc::new(
                faceid_core::PgVectorBackend::new(index)
                    .with_max_connections(config.store_max_connections),
            ))
        }
        #[cfg(not(feature = "postgres"))]
        StoreBackendKind::Postgres => Err(StartupError::Core(FaceIdError::InvalidConfig(
            "STORE_BACKEND=postgres requires the `postgres` feature".into(),
        ))),
    }
}
