//! Face verification handler
//!
//! Handles POST /verify requests to find the enrolled identity matching a face.

use axum::{
    extract::{Multipart, State},
    Json,
};
use faceid_core::{matching::threshold_in_range, PipelineError};
use serde::Serialize;
use utoipa::ToSchema;

use crate::error::ApiError;
use crate::multipart::MultipartFields;
use crate::state::AppState;
use crate::validation::parse_threshold;

const NO_MATCH_MESSAGE: &str = "No match found";

/// Response for verification
#[derive(Serialize, ToSchema)]
pub struct VerifyResponse {
    /// Whether the best candidate reached the threshold
    #[schema(example = true)]
    pub matched: bool,
    /// Matched identity; absent when `matched` is false
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(example = "E-1042")]
    pub identity_label: Option<String>,
    /// Cosine similarity of the best candidate (0 when nothing is enrolled)
    #[schema(example = 0.82)]
    pub similarity: f32,
    /// Threshold the decision was made against
    #[schema(example = 0.6)]
    pub threshold: f32,
    #[schema(example = 0.91)]
    pub detection_confidence: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(example = "No match found")]
    pub message: Option<String>,
}

/// Verify a face against enrolled identities
///
/// Accepts multipart/form-data with:
/// - **image** (file) or **image_url** (text): exactly one face must be visible
/// - **threshold** (optional): match threshold in [0, 1], defaults to SIMILARITY_THRESHOLD
///
/// A similarity equal to the threshold counts as a match.
#[utoipa::path(
    post,
    path = "/verify",
    tag = "Verification",
    request_body(
        content_type = "multipart/form-data",
        description = "Image upload or image_url, optional threshold"
    ),
    responses(
        (status = 200, description = "Verification completed", body = VerifyResponse),
        (status = 400, description = "Invalid threshold or undecodable image"),
        (status = 408, description = "Timed out downloading image_url"),
        (status = 413, description = "Image exceeds MAX_IMAGE_BYTES"),
        (status = 422, description = "No face or more than one face detected"),
        (status = 503, description = "Identity store unavailable")
    )
)]
pub async fn verify_handler(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<VerifyResponse>, ApiError> {
    let mut fields = MultipartFields::parse(&mut multipart, state.max_image_bytes).await?;

    // Reject a bad threshold before paying for a download
    let threshold = parse_threshold(fields.get_text("threshold"))?;
    if let Some(t) = threshold.filter(|t| !threshold_in_range(*t)) {
        return Err(PipelineError::InvalidThreshold(t).into());
    }

    let image = fields.take_image()?.into_bytes(&state.fetcher).await?;
    let outcome = state.pipeline.verify(image, threshold).await?;

    let verdict = outcome.verdict;
    let message = outcome
        .message
        .or_else(|| (!verdict.matched).then(|| NO_MATCH_MESSAGE.to_string()));

    Ok(Json(VerifyResponse {
        matched: verdict.matched,
        identity_label: verdict.identity_label,
        similarity: verdict.similarity,
        threshold: verdict.threshold,
        detection_confidence: outcome.detection_confidence,
        message,
    }))
}
