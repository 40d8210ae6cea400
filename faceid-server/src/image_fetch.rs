//! Remote image acquisition for `image_url` form fields.
//!
//! Downloads are bounded three ways: a connect timeout, a per-read timeout and a
//! byte ceiling checked chunk by chunk, so an oversized or stalled download is
//! abandoned without buffering it whole.

use std::time::{Duration, Instant};

use reqwest::{header, Client};
use tracing::{debug, instrument, warn};
use url::Url;

use crate::config::Config;
use crate::error::ApiError;
use crate::validation::{append_within_limit, validate_image_size};

/// Redirect hops followed before giving up.
const MAX_REDIRECTS: usize = 10;

/// HTTP client for fetching images referenced by URL.
#[derive(Debug, Clone)]
pub struct ImageFetcher {
    client: Client,
    max_bytes: usize,
}

impl ImageFetcher {
    pub fn new(
        connect_timeout: Duration,
        read_timeout: Duration,
        max_bytes: usize,
    ) -> Result<Self, ApiError> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .read_timeout(read_timeout)
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .build()
            .map_err(|e| {
                warn!(error = %e, "Failed to create HTTP client");
                ApiError::internal(format!("Failed to create HTTP client: {e}"))
            })?;
        Ok(Self { client, max_bytes })
    }

    pub fn from_config(config: &Config) -> Result<Self, ApiError> {
        Self::new(
            Duration::from_secs(config.download_connect_timeout_secs),
            Duration::from_secs(config.download_read_timeout_secs),
            config.max_image_bytes,
        )
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    /// Download the image at `raw_url`.
    ///
    /// Errors: timeout → 408, over the byte ceiling → 413, anything else
    /// (bad URL, transport, non-2xx status, non-image content) → 400.
    #[instrument(skip(self), fields(max_bytes = self.max_bytes))]
    pub async fn fetch(&self, raw_url: &str) -> Result<Vec<u8>, ApiError> {
        let url = resolve_url(raw_url)?;
        let start = Instant::now();

        let mut response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(download_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(ApiError::bad_request(format!(
                "Failed to download image: HTTP {}",
                status.as_u16()
            )));
        }

        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_ascii_lowercase();
        if !content_type.starts_with("image/") {
            return Err(ApiError::bad_request("URL does not point to a valid image"));
        }

        if let Some(length) = response.content_length() {
            validate_image_size(usize::try_from(length).unwrap_or(usize::MAX), self.max_bytes)?;
        }

        let mut data = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(download_error)? {
            append_within_limit(&mut data, &chunk, self.max_bytes)?;
        }

        debug!(
            url = %url,
            bytes = data.len(),
            latency_ms = start.elapsed().as_millis() as u64,
            "Image downloaded"
        );
        Ok(data)
    }
}

fn download_error(e: reqwest::Error) -> ApiError {
    if e.is_timeout() {
        ApiError::timeout("Timeout while downloading image")
    } else {
        ApiError::bad_request(format!("Failed to download image: {e}"))
    }
}

/// Parse `raw_url`, accepting only http(s), and turn Google Drive share
/// links into direct downloads.
pub fn resolve_url(raw_url: &str) -> Result<Url, ApiError> {
    let url = Url::parse(raw_url.trim())
        .map_err(|e| ApiError::bad_request(format!("Invalid image_url: {e}")))?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(ApiError::bad_request(format!(
            "Unsupported image_url scheme '{}'",
            url.scheme()
        )));
    }

    if url.host_str() == Some("drive.google.com") {
        if let Some(file_id) = drive_file_id(&url) {
            let mut direct = Url::parse("https://drive.google.com/uc")
                .map_err(|e| ApiError::internal(e.to_string()))?;
            direct.query_pairs_mut().append_pair("id", &file_id);
            return Ok(direct);
        }
    }

    Ok(url)
}

/// `https://drive.google.com/file/d/<id>/view` → `<id>`
fn drive_file_id(url: &Url) -> Option<String> {
    let mut segments = url.path_segments()?;
    segments.find(|s| *s == "d")?;
    segments
        .next()
        .filter(|id| !id.is_empty())
        .map(str::to_string)
}
