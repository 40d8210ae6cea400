//! Multipart form parsing helpers
//!
//! Every face endpoint takes the image either as an uploaded file or as an
//! `image_url` text field; this module parses both shapes once.

use std::collections::HashMap;

use axum::extract::Multipart;

use crate::error::ApiError;
use crate::image_fetch::ImageFetcher;
use crate::validation::{append_within_limit, validate_content_type};

/// Field names accepted for the uploaded image.
const FILE_FIELDS: &[&str] = &["image", "file"];

/// Text field naming a remote image.
pub const IMAGE_URL_FIELD: &str = "image_url";

/// Where the request's image comes from.
#[derive(Debug, Clone)]
pub enum ImageSource {
    /// Bytes of an uploaded file, already checked against the ceiling
    Upload(Vec<u8>),
    Url(String),
}

impl ImageSource {
    /// Produce the raw image bytes, downloading when needed.
    pub async fn into_bytes(self, fetcher: &ImageFetcher) -> Result<Vec<u8>, ApiError> {
        match self {
            ImageSource::Upload(data) => Ok(data),
            ImageSource::Url(url) => fetcher.fetch(&url).await,
        }
    }
}

/// Parsed multipart form fields
///
/// Provides structured access to file and text fields from a multipart/form-data request.
#[derive(Debug)]
pub struct MultipartFields {
    /// Uploaded image bytes, if any
    file: Option<Vec<u8>>,
    /// Text fields indexed by name
    text_fields: HashMap<String, String>,
}

impl MultipartFields {
    /// Parse all fields from a multipart request
    ///
    /// The uploaded image is checked for content type before it is read, then
    /// read chunk by chunk against `max_image_bytes`; oversize uploads fail
    /// with 413 as soon as the ceiling is crossed.
    pub async fn parse(multipart: &mut Multipart, max_image_bytes: usize) -> Result<Self, ApiError> {
        let mut file: Option<Vec<u8>> = None;
        let mut text_fields = HashMap::new();

        while let Some(mut field) = multipart
            .next_field()
            .await
            .map_err(|e| ApiError::bad_request(format!("Failed to parse multipart: {}", e)))?
        {
            let name = field.name().unwrap_or("").to_string();

            if FILE_FIELDS.contains(&name.as_str()) {
                validate_content_type(field.content_type())?;

                let mut data = Vec::new();
                while let Some(chunk) = field
                    .chunk()
                    .await
                    .map_err(|e| ApiError::bad_request(format!("Failed to read image: {}", e)))?
                {
                    append_within_limit(&mut data, &chunk, max_image_bytes)?;
                }

                file = Some(data);
            } else {
                let value = field.text().await.map_err(|e| {
                    ApiError::bad_request(format!("Failed to read field '{}': {}", name, e))
                })?;
                text_fields.insert(name, value);
            }
        }

        Ok(Self { file, text_fields })
    }

    /// Get a text field value
    ///
    /// Returns `None` if the field is not present.
    pub fn get_text(&self, name: &str) -> Option<&str> {
        self.text_fields.get(name).map(|s| s.as_str())
    }

    /// First present, non-blank value among `names`.
    pub fn get_text_any(&self, names: &[&str]) -> Option<&str> {
        names
            .iter()
            .filter_map(|name| self.get_text(name))
            .find(|value| !value.trim().is_empty())
    }

    /// The image to process: the upload wins over `image_url`.
    pub fn take_image(&mut self) -> Result<ImageSource, ApiError> {
        if let Some(file) = self.file.take() {
            return Ok(ImageSource::Upload(file));
        }
        match self.get_text(IMAGE_URL_FIELD).map(str::trim) {
            Some(url) if !url.is_empty() => Ok(ImageSource::Url(url.to_string())),
            _ => Err(ApiError::bad_request(
                "No image provided. Use the 'image' file field or 'image_url'.",
            )),
        }
    }
}
