//! Server configuration module
//!
//! Loads configuration from environment variables once at startup. Every value
//! is validated; a malformed variable stops the server instead of silently
//! falling back to a default.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use faceid_core::{
    parse_backend_list, AnalyzerConfig, ComputeBackend, OnnxAnalyzerConfig, RetryPolicy,
    StoreEndpoint, DEFAULT_THRESHOLD,
};
use thiserror::Error;

/// Configuration errors, reported before the server binds.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("Invalid value for {var}: '{value}' ({reason})")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

impl ConfigError {
    fn invalid(var: &'static str, value: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            var,
            value: value.into(),
            reason: reason.into(),
        }
    }
}

/// Which store engine backs the identity collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackendKind {
    Postgres,
    /// In-process store, lost on restart.
    Memory,
}

impl FromStr for StoreBackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "postgres" | "pgvector" => Ok(Self::Postgres),
            "memory" => Ok(Self::Memory),
            _ => Err("expected 'postgres' or 'memory'".to_string()),
        }
    }
}

/// Which face analyzer produces fingerprints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalyzerKind {
    Onnx,
    Mock,
}

impl FromStr for AnalyzerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "onnx" => Ok(Self::Onnx),
            "mock" => Ok(Self::Mock),
            _ => Err("expected 'onnx' or 'mock'".to_string()),
        }
    }
}

/// Server configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host (default: 127.0.0.1)
    pub host: IpAddr,
    /// Server port (default: 8000)
    pub port: u16,
    /// Allowed CORS origins, comma-separated (default: allow all in dev)
    pub allowed_origins: Option<Vec<String>>,
    /// Request body limit in MB (default: 50)
    pub body_limit_mb: usize,
    /// Request timeout in seconds (default: 30)
    pub timeout_secs: u64,
    /// Enable rate limiting (default: false for tests, true when loaded from env)
    pub rate_limit_enabled: bool,
    /// Rate limit: requests per second (default: 10)
    pub rate_limit_per_sec: u64,
    /// Rate limit: burst size (default: 20)
    pub rate_limit_burst: u32,

    pub store_backend: StoreBackendKind,
    pub store_endpoint: StoreEndpoint,
    /// Identity collection (table) name
    pub store_collection: String,
    /// pgvector index kind: "hnsw" or "ivfflat"
    pub store_index: String,
    pub store_max_connections: u32,
    /// Initial connect attempts before startup gives up on the store
    pub store_connect_attempts: u32,
    pub store_connect_delay_secs: u64,

    /// Default match threshold, within [0, 1]
    pub similarity_threshold: f32,
    /// Upload and download ceiling in bytes
    pub max_image_bytes: usize,
    /// Admission gate capacity
    pub max_concurrent_inference: usize,

    pub face_analyzer: AnalyzerKind,
    pub model_dir: PathBuf,
    pub model_name: String,
    pub det_size: (u32, u32),
    /// Ranked compute backends, `cpu` last
    pub face_providers: Vec<ComputeBackend>,

    pub download_connect_timeout_secs: u64,
    pub download_read_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 8000,
            allowed_origins: None, // None = allow all (dev mode)
            body_limit_mb: 50,
            timeout_secs: 30,
            rate_limit_enabled: false, // Disabled by default (for tests)
            rate_limit_per_sec: 10,
            rate_limit_burst: 20,
            // Tests run without a database or model files
            store_backend: StoreBackendKind::Memory,
            store_endpoint: StoreEndpoint::default(),
            store_collection: faceid_core::store::DEFAULT_COLLECTION.to_string(),
            store_index: "hnsw".to_string(),
            store_max_connections: 10,
            store_connect_attempts: 3,
            store_connect_delay_secs: 2,
            similarity_threshold: DEFAULT_THRESHOLD,
            max_image_bytes: 5_000_000,
            max_concurrent_inference: faceid_core::admission::DEFAULT_CAPACITY,
            face_analyzer: AnalyzerKind::Mock,
            model_dir: PathBuf::from("./models"),
            model_name: "buffalo_l".to_string(),
            det_size: (640, 640),
            face_providers: vec![ComputeBackend::Cuda, ComputeBackend::Cpu],
            download_connect_timeout_secs: 2,
            download_read_timeout_secs: 5,
        }
    }
}

/// Read `var` and parse it, or return `default` when unset or blank.
fn parse_var<T, F>(lookup: &F, var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(var) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::invalid(var, raw.clone(), e.to_string())),
        _ => Ok(default),
    }
}

fn string_var<F>(lookup: &F, var: &'static str, default: &str) -> String
where
    F: Fn(&str) -> Option<String>,
{
    lookup(var)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn positive<T: PartialOrd + Default + ToString>(
    var: &'static str,
    value: T,
) -> Result<T, ConfigError> {
    if value > T::default() {
        Ok(value)
    } else {
        Err(ConfigError::invalid(
            var,
            value.to_string(),
            "must be greater than zero",
        ))
    }
}

fn parse_det_size(raw: &str) -> Result<(u32, u32), ConfigError> {
    let parts: Vec<&str> = raw.split(',').map(str::trim).collect();
    let parsed = match parts.as_slice() {
        [w, h] => w.parse::<u32>().ok().zip(h.parse::<u32>().ok()),
        _ => None,
    };
    match parsed {
        Some((w, h)) if w > 0 && h > 0 => Ok((w, h)),
        _ => Err(ConfigError::invalid(
            "DET_SIZE",
            raw,
            "expected two positive integers, e.g. 640,640",
        )),
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let host = parse_var(&lookup, "HOST", defaults.host)?;
        let port = parse_var(&lookup, "PORT", defaults.port)?;

        let allowed_origins = lookup("ALLOWED_ORIGINS").map(|origins| {
            origins
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        });

        let body_limit_mb = positive(
            "BODY_LIMIT_MB",
            parse_var(&lookup, "BODY_LIMIT_MB", defaults.body_limit_mb)?,
        )?;
        let timeout_secs = positive(
            "REQUEST_TIMEOUT_SECS",
            parse_var(&lookup, "REQUEST_TIMEOUT_SECS", defaults.timeout_secs)?,
        )?;
        let rate_limit_per_sec = positive(
            "RATE_LIMIT_PER_SEC",
            parse_var(&lookup, "RATE_LIMIT_PER_SEC", defaults.rate_limit_per_sec)?,
        )?;
        let rate_limit_burst = positive(
            "RATE_LIMIT_BURST",
            parse_var(&lookup, "RATE_LIMIT_BURST", defaults.rate_limit_burst)?,
        )?;

        // Rate limiting enabled by default in production, can be disabled with RATE_LIMIT_ENABLED=false
        let rate_limit_enabled = lookup("RATE_LIMIT_ENABLED")
            .map(|v| v.trim().to_lowercase() != "false")
            .unwrap_or(true);

        // The deployed default is the real stack; Default is the test stack
        let store_backend = parse_var(&lookup, "STORE_BACKEND", StoreBackendKind::Postgres)?;
        let store_endpoint = StoreEndpoint {
            host: string_var(&lookup, "STORE_HOST", &defaults.store_endpoint.host),
            port: parse_var(&lookup, "STORE_PORT", defaults.store_endpoint.port)?,
            database: string_var(&lookup, "STORE_DATABASE", &defaults.store_endpoint.database),
            user: string_var(&lookup, "STORE_USER", &defaults.store_endpoint.user),
            password: lookup("STORE_PASSWORD").unwrap_or_default(),
        };
        let store_collection =
            string_var(&lookup, "STORE_COLLECTION", &defaults.store_collection);

        let store_index = string_var(&lookup, "STORE_INDEX", &defaults.store_index).to_lowercase();
        if !matches!(store_index.as_str(), "hnsw" | "ivfflat") {
            return Err(ConfigError::invalid(
                "STORE_INDEX",
                store_index,
                "expected 'hnsw' or 'ivfflat'",
            ));
        }

        let store_max_connections = positive(
            "STORE_MAX_CONNECTIONS",
            parse_var(&lookup, "STORE_MAX_CONNECTIONS", defaults.store_max_connections)?,
        )?;
        let store_connect_attempts = positive(
            "STORE_CONNECT_ATTEMPTS",
            parse_var(&lookup, "STORE_CONNECT_ATTEMPTS", defaults.store_connect_attempts)?,
        )?;
        let store_connect_delay_secs = parse_var(
            &lookup,
            "STORE_CONNECT_DELAY_SECS",
            defaults.store_connect_delay_secs,
        )?;

        let similarity_threshold: f32 =
            parse_var(&lookup, "SIMILARITY_THRESHOLD", defaults.similarity_threshold)?;
        if !(0.0..=1.0).contains(&similarity_threshold) {
            return Err(ConfigError::invalid(
                "SIMILARITY_THRESHOLD",
                similarity_threshold.to_string(),
                "must be within [0, 1]",
            ));
        }

        let max_image_bytes = positive(
            "MAX_IMAGE_BYTES",
            parse_var(&lookup, "MAX_IMAGE_BYTES", defaults.max_image_bytes)?,
        )?;
        let max_concurrent_inference = positive(
            "MAX_CONCURRENT_INFERENCE",
            parse_var(
                &lookup,
                "MAX_CONCURRENT_INFERENCE",
                defaults.max_concurrent_inference,
            )?,
        )?;

        let face_analyzer = parse_var(&lookup, "FACE_ANALYZER", AnalyzerKind::Onnx)?;
        let model_dir = PathBuf::from(string_var(&lookup, "MODEL_DIR", "./models"));
        let model_name = string_var(&lookup, "MODEL_NAME", &defaults.model_name);

        let det_size = match lookup("DET_SIZE") {
            Some(raw) if !raw.trim().is_empty() => parse_det_size(&raw)?,
            _ => defaults.det_size,
        };

        let face_providers = match lookup("FACE_PROVIDERS") {
            Some(raw) if !raw.trim().is_empty() => parse_backend_list(&raw)
                .map_err(|e| ConfigError::invalid("FACE_PROVIDERS", raw.clone(), e.to_string()))?,
            _ => defaults.face_providers,
        };

        let download_connect_timeout_secs = positive(
            "DOWNLOAD_CONNECT_TIMEOUT_SECS",
            parse_var(
                &lookup,
                "DOWNLOAD_CONNECT_TIMEOUT_SECS",
                defaults.download_connect_timeout_secs,
            )?,
        )?;
        let download_read_timeout_secs = positive(
            "DOWNLOAD_READ_TIMEOUT_SECS",
            parse_var(
                &lookup,
                "DOWNLOAD_READ_TIMEOUT_SECS",
                defaults.download_read_timeout_secs,
            )?,
        )?;

        Ok(Self {
            host,
            port,
            allowed_origins,
            body_limit_mb,
            timeout_secs,
            rate_limit_enabled,
            rate_limit_per_sec,
            rate_limit_burst,
            store_backend,
            store_endpoint,
            store_collection,
            store_index,
            store_max_connections,
            store_connect_attempts,
            store_connect_delay_secs,
            similarity_threshold,
            max_image_bytes,
            max_concurrent_inference,
            face_analyzer,
            model_dir,
            model_name,
            det_size,
            face_providers,
            download_connect_timeout_secs,
            download_read_timeout_secs,
        })
    }

    /// Get socket address from config
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    /// Retry policy for the initial store connection.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.store_connect_attempts,
            delay: Duration::from_secs(self.store_connect_delay_secs),
        }
    }

    /// Analyzer selection derived from `FACE_ANALYZER` and the model settings.
    pub fn analyzer_config(&self) -> AnalyzerConfig {
        match self.face_analyzer {
            AnalyzerKind::Onnx => AnalyzerConfig::Onnx(OnnxAnalyzerConfig {
                model_dir: self.model_dir.clone(),
                model_name: self.model_name.clone(),
                det_size: self.det_size,
                backends: self.face_providers.clone(),
                ..OnnxAnalyzerConfig::default()
            }),
            AnalyzerKind::Mock => AnalyzerConfig::Mock {
                seed: faceid_core::analyzer::DEFAULT_SEED,
            },
        }
    }
}
