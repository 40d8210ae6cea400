//! Enrollment handler
//!
//! Handles POST /enroll requests to bind a face to an identity label.

use axum::{
    extract::{Multipart, State},
    http::StatusCode,
    Json,
};
use serde::Serialize;
use faceid_core::store::validate_label;
use faceid_core::PipelineError;
use utoipa::ToSchema;

use crate::error::ApiError;
use crate::multipart::MultipartFields;
use crate::state::AppState;

/// Form fields accepted for the identity label, in priority order.
const LABEL_FIELDS: &[&str] = &["identity_label", "employee_id"];

/// Response for successful enrollment
#[derive(Serialize, ToSchema)]
pub struct EnrollResponse {
    #[schema(example = true)]
    pub success: bool,
    /// Label the fingerprint was stored under (trimmed)
    #[schema(example = "E-1042")]
    pub identity_label: String,
    /// Detector confidence for the enrolled face, in [0, 1]
    #[schema(example = 0.87)]
    pub detection_confidence: f32,
    /// Records written; re-enrolling a label adds another record
    #[schema(example = 1)]
    pub inserted: u64,
    #[schema(example = "Identity enrolled successfully")]
    pub message: String,
}

/// Enroll a face under an identity label
///
/// Accepts multipart/form-data with:
/// - **identity_label** (required, alias `employee_id`): 1 to 100 characters
/// - **image** (file) or **image_url** (text): exactly one face must be visible
#[utoipa::path(
    post,
    path = "/enroll",
    tag = "Enrollment",
    request_body(
        content_type = "multipart/form-data",
        description = "Identity label plus an image upload or image_url"
    ),
    responses(
        (status = 201, description = "Identity enrolled", body = EnrollResponse),
        (status = 400, description = "Missing label, invalid label, or undecodable image"),
        (status = 408, description = "Timed out downloading image_url"),
        (status = 413, description = "Image exceeds MAX_IMAGE_BYTES"),
        (status = 422, description = "No face or more than one face detected"),
        (status = 503, description = "Identity store unavailable")
    )
)]
pub async fn enroll_handler(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<EnrollResponse>), ApiError> {
    let mut fields = MultipartFields::parse(&mut multipart, state.max_image_bytes).await?;

    let raw_label = fields
        .get_text_any(LABEL_FIELDS)
        .ok_or_else(|| ApiError::bad_request("No identity_label provided."))?;
    // Reject a bad label before spending a download on image_url.
    let label = validate_label(raw_label)
        .map_err(PipelineError::from)?
        .to_string();

    let image = fields.take_image()?.into_bytes(&state.fetcher).await?;
    let outcome = state.pipeline.enroll(&label, image).await?;

    Ok((
        StatusCode::CREATED,
        Json(EnrollResponse {
            success: true,
            identity_label: outcome.identity_label,
            detection_confidence: outcome.detection_confidence,
            inserted: outcome.inserted,
            message: "Identity enrolled successfully".to_string(),
        }),
    ))
}
