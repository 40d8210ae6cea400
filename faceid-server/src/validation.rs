//! Upload validation module
//!
//! Provides validation utilities for multipart image uploads.

use crate::error::ApiError;

/// Allowed MIME type categories for face images
const ALLOWED_MIME_PREFIXES: &[&str] = &["image/", "application/octet-stream"];

/// Validates the Content-Type of an uploaded file
///
/// Accepts:
/// - image/* (image/jpeg, image/png, image/webp, etc.)
/// - application/octet-stream (binary data)
///
/// Returns an error if the Content-Type is not supported.
pub fn validate_content_type(content_type: Option<&str>) -> Result<(), ApiError> {
    match content_type {
        Some(ct) => {
            let ct_lower = ct.to_lowercase();
            if ALLOWED_MIME_PREFIXES
                .iter()
                .any(|prefix| ct_lower.starts_with(prefix))
            {
                Ok(())
            } else {
                Err(ApiError::bad_request(format!(
                    "Unsupported Content-Type: '{}'. Allowed types: image/*, application/octet-stream",
                    ct
                )))
            }
        }
        // Allow missing Content-Type (treat as binary)
        None => Ok(()),
    }
}

/// Validates the size of an uploaded image against `MAX_IMAGE_BYTES`.
pub fn validate_image_size(size: usize, max_size: usize) -> Result<(), ApiError> {
    if size > max_size {
        Err(ApiError::payload_too_large(format!(
            "Image payload too large: {} bytes exceeds maximum of {} bytes",
            size, max_size
        )))
    } else {
        Ok(())
    }
}

/// Appends `chunk` to `buffer` unless the total would exceed `max_size`.
///
/// Streaming readers call this per chunk so an oversized image is rejected
/// before it is held in memory whole.
pub fn append_within_limit(
    buffer: &mut Vec<u8>,
    chunk: &[u8],
    max_size: usize,
) -> Result<(), ApiError> {
    if buffer.len() + chunk.len() > max_size {
        return Err(ApiError::payload_too_large(format!(
            "Image payload too large: exceeds maximum of {} bytes",
            max_size
        )));
    }
    buffer.extend_from_slice(chunk);
    Ok(())
}

/// Parses the optional `threshold` form field.
pub fn parse_threshold(raw: Option<&str>) -> Result<Option<f32>, ApiError> {
    match raw.map(str::trim) {
        None | Some("") => Ok(None),
        Some(value) => value
            .parse::<f32>()
            .map(Some)
            .map_err(|_| ApiError::bad_request(format!("Invalid threshold: '{}'", value))),
    }
}
