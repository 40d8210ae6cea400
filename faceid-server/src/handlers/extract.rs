//! Fingerprint extraction handler
//!
//! Handles POST /extract, a diagnostic endpoint that never touches the store.

use axum::{
    extract::{Multipart, State},
    Json,
};
use serde::Serialize;
use utoipa::ToSchema;

use crate::error::ApiError;
use crate::multipart::MultipartFields;
use crate::state::AppState;

/// Response for fingerprint extraction
#[derive(Serialize, ToSchema)]
pub struct ExtractResponse {
    /// Unit-norm face fingerprint
    pub fingerprint: Vec<f32>,
    /// Face box as `[x1, y1, x2, y2]` in source pixels
    #[schema(example = json!([120.0, 80.0, 260.0, 250.0]))]
    pub bounding_box: Vec<f32>,
    #[schema(example = 0.93)]
    pub detection_confidence: f32,
    #[schema(example = 512)]
    pub dimension: usize,
}

/// Extract a face fingerprint
///
/// Accepts multipart/form-data with **image** (file) or **image_url** (text).
/// Runs the same single-face policy as enrollment.
#[utoipa::path(
    post,
    path = "/extract",
    tag = "Extraction",
    request_body(
        content_type = "multipart/form-data",
        description = "Image upload or image_url"
    ),
    responses(
        (status = 200, description = "Fingerprint extracted", body = ExtractResponse),
        (status = 400, description = "Undecodable image"),
        (status = 413, description = "Image exceeds MAX_IMAGE_BYTES"),
        (status = 422, description = "No face or more than one face detected")
    )
)]
pub async fn extract_handler(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<ExtractResponse>, ApiError> {
    let mut fields = MultipartFields::parse(&mut multipart, state.max_image_bytes).await?;
    let image = fields.take_image()?.into_bytes(&state.fetcher).await?;

    let extraction = state.pipeline.extract_only(image).await?;
    let dimension = extraction.fingerprint.dimension();

    Ok(Json(ExtractResponse {
        fingerprint: extraction.fingerprint.into_vec(),
        bounding_box: extraction.bounding_box.0.to_vec(),
        detection_confidence: extraction.detection_confidence,
        dimension,
    }))
}
