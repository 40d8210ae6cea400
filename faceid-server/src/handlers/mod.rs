//! HTTP request handlers
//!
//! This module contains all the request handlers for the API endpoints.

pub mod enroll;
pub mod extract;
pub mod health;
pub mod identities;
pub mod verify;

pub use crate::state::AppState;
pub use enroll::{enroll_handler, EnrollResponse};
pub use extract::{extract_handler, ExtractResponse};
pub use health::{health, ready, HealthResponse, ReadyResponse};
pub use identities::{
    delete_identity_handler, list_identities_handler, DeleteResponse, ListIdentitiesResponse,
};
pub use verify::{verify_handler, VerifyResponse};
