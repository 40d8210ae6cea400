//! FaceID Server Library - REST API components for face enrollment and verification
//!
//! This library exposes the server components for use in integration tests.
//! The main binary uses these same components.

pub mod config;
pub mod error;
pub mod handlers;
pub mod image_fetch;
pub mod multipart;
pub mod openapi;
pub mod routes;
pub mod state;
pub mod validation;

pub use config::{AnalyzerKind, Config, ConfigError, StoreBackendKind};
pub use error::ApiError;
pub use image_fetch::ImageFetcher;
pub use openapi::ApiDoc;
pub use routes::{create_router, create_router_with_config};
pub use state::{AppState, StartupError};
