//! Identity management handlers
//!
//! GET /identities and DELETE /identities/{label}.

use axum::{
    extract::{Path, State},
    Json,
};
use serde::Serialize;
use utoipa::ToSchema;

use crate::error::ApiError;
use crate::state::AppState;

/// Response listing enrolled labels
#[derive(Serialize, ToSchema)]
pub struct ListIdentitiesResponse {
    /// Distinct labels, sorted
    #[schema(example = json!(["E-1042", "E-2001"]))]
    pub identity_labels: Vec<String>,
    #[schema(example = 2)]
    pub count: usize,
}

/// Response for a successful delete
#[derive(Serialize, ToSchema)]
pub struct DeleteResponse {
    #[schema(example = true)]
    pub success: bool,
    #[schema(example = "E-1042")]
    pub identity_label: String,
    /// Records removed for the label
    #[schema(example = 1)]
    pub deleted: u64,
    #[schema(example = "Identity deleted successfully")]
    pub message: String,
}

/// List enrolled identity labels
#[utoipa::path(
    get,
    path = "/identities",
    tag = "Identities",
    responses(
        (status = 200, description = "Enrolled labels", body = ListIdentitiesResponse),
        (status = 503, description = "Identity store unavailable")
    )
)]
pub async fn list_identities_handler(
    State(state): State<AppState>,
) -> Result<Json<ListIdentitiesResponse>, ApiError> {
    let identity_labels = state.pipeline.list_identities().await?;
    Ok(Json(ListIdentitiesResponse {
        count: identity_labels.len(),
        identity_labels,
    }))
}

/// Delete every record enrolled under a label
///
/// Deleting a label that has no records is a 404, not a silent success.
#[utoipa::path(
    delete,
    path = "/identities/{label}",
    tag = "Identities",
    params(("label" = String, Path, description = "Identity label to delete")),
    responses(
        (status = 200, description = "Identity deleted", body = DeleteResponse),
        (status = 400, description = "Invalid label"),
        (status = 404, description = "No records for this label"),
        (status = 503, description = "Identity store unavailable")
    )
)]
pub async fn delete_identity_handler(
    State(state): State<AppState>,
    Path(label): Path<String>,
) -> Result<Json<DeleteResponse>, ApiError> {
    let outcome = state.pipeline.delete(&label).await?;
    Ok(Json(DeleteResponse {
        success: true,
        identity_label: outcome.identity_label,
        deleted: outcome.deleted,
        message: "Identity deleted successfully".to_string(),
    }))
}
