//! Identity store client.
//!
//! [`IdentityStore`] owns the connection lifecycle to a vector-indexed store,
//! provisions the identity collection, and exposes the data operations used by
//! the pipeline (insert, nearest-neighbor search, delete, list).
//!
//! ## Backends
//!
//! - **pgvector** (`postgres` feature) - PostgreSQL with the `vector` extension
//! - **Memory** - `DashMap`-backed store for development and tests
//!
//! ## Connection handling
//!
//! - [`IdentityStore::connect`] retries a fixed number of times with a fixed
//!   delay between attempts.
//! - Every data operation checks the connection state first. When the store
//!   is disconnected, one reconnect to the last-known endpoint is attempted.
//!   Concurrent callers share a single in-flight reconnect and its result.
//! - Errors classified as connectivity failures downgrade the state to
//!   disconnected; query-level errors leave it untouched. Failures raised by
//!   a connection that a later connect has already replaced are ignored.

pub mod error;
pub mod memory;
#[cfg(feature = "postgres")]
pub mod pgvector;

pub use error::StoreError;
pub use memory::MemoryBackend;
#[cfg(feature = "postgres")]
pub use pgvector::{PgVectorBackend, VectorIndex};

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backoff::future::retry_notify;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, instrument, warn};

use crate::fingerprint::{Fingerprint, FINGERPRINT_DIM};

/// Default identity collection name.
pub const DEFAULT_COLLECTION: &str = "face_embeddings";

/// Maximum length of an identity label.
pub const MAX_LABEL_LEN: usize = 100;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Where the store lives.
#[derive(Clone, PartialEq, Eq)]
pub struct StoreEndpoint {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
}

impl Default for StoreEndpoint {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            database: "faceid".to_string(),
            user: "postgres".to_string(),
            password: String::new(),
        }
    }
}

impl std::fmt::Debug for StoreEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreEndpoint")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

impl std::fmt::Display for StoreEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}/{}", self.host, self.port, self.database)
    }
}

/// Process-wide connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connected,
}

/// Shape of a provisioned collection, as reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionInfo {
    pub name: String,
    pub dimension: usize,
    /// Backend-specific description of the vector index, if any.
    pub index: Option<String>,
}

/// One persisted identity.
#[derive(Debug, Clone)]
pub struct IdentityRecord {
    pub internal_id: i64,
    pub identity_label: String,
    pub fingerprint: Fingerprint,
}

/// One nearest-neighbor candidate.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub internal_id: i64,
    pub identity_label: String,
    /// Inner product with the query fingerprint.
    pub similarity: f32,
}

/// Outcome of `ensure_schema`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaStatus {
    Created,
    Existing,
}

/// Outcome of an insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InsertOutcome {
    pub internal_id: i64,
    pub inserted: u64,
}

/// Store engine contract.
///
/// Backends report failures as [`StoreError`] and classify them; the
/// [`IdentityStore`] client owns connection state and retry policy.
#[async_trait]
pub trait VectorBackend: Send + Sync {
    async fn connect(&self, endpoint: &StoreEndpoint) -> StoreResult<()>;

    async fn disconnect(&self);

    async fn has_collection(&self, collection: &str) -> StoreResult<bool>;

    async fn create_collection(&self, collection: &str, dimension: usize) -> StoreResult<()>;

    /// Make an existing collection queryable.
    async fn load_collection(&self, collection: &str) -> StoreResult<()>;

    async fn describe_collection(&self, collection: &str) -> StoreResult<CollectionInfo>;

    /// Append one record and make it visible to subsequent searches.
    async fn insert(
        &self,
        collection: &str,
        label: &str,
        fingerprint: &Fingerprint,
    ) -> StoreResult<i64>;

    /// Up to `top_k` records ranked by descending inner product.
    async fn search(
        &self,
        collection: &str,
        fingerprint: &Fingerprint,
        top_k: usize,
    ) -> StoreResult<Vec<SearchHit>>;

    async fn count_label(&self, collection: &str, label: &str) -> StoreResult<u64>;

    /// Delete every record carrying `label`, returning how many were removed.
    async fn delete_label(&self, collection: &str, label: &str) -> StoreResult<u64>;

    /// Distinct labels in the collection.
    async fn labels(&self, collection: &str) -> StoreResult<Vec<String>>;

    /// Backend identifier for logs.
    fn kind(&self) -> &'static str;
}

/// Retry policy for the explicit `connect` call.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_secs(2),
        }
    }
}

/// Fixed delay between a fixed number of attempts.
#[derive(Debug, Clone)]
struct FixedBackoff {
    retries: u32,
    remaining: u32,
    delay: Duration,
}

impl FixedBackoff {
    fn new(policy: RetryPolicy) -> Self {
        let retries = policy.attempts.saturating_sub(1);
        Self {
            retries,
            remaining: retries,
            delay: policy.delay,
        }
    }
}

impl backoff::backoff::Backoff for FixedBackoff {
    fn reset(&mut self) {
        self.remaining = self.retries;
    }

    fn next_backoff(&mut self) -> Option<Duration> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        Some(self.delay)
    }
}

/// Validate an identity label, returning it trimmed.
pub fn validate_label(label: &str) -> StoreResult<&str> {
    let trimmed = label.trim();
    if trimmed.is_empty() {
        return Err(StoreError::InvalidLabel("label must not be empty".into()));
    }
    if trimmed.chars().count() > MAX_LABEL_LEN {
        return Err(StoreError::InvalidLabel(format!(
            "label must be at most {MAX_LABEL_LEN} characters"
        )));
    }
    Ok(trimmed)
}

/// Client for the identity collection.
///
/// Constructed once at startup and shared by handle across request tasks.
pub struct IdentityStore {
    backend: Arc<dyn VectorBackend>,
    collection: String,
    dimension: usize,
    retry: RetryPolicy,
    connected: AtomicBool,
    endpoint: RwLock<Option<StoreEndpoint>>,
    /// Held while a reconnect is in flight.
    reconnect_lock: Mutex<()>,
    /// Bumped by every completed connect attempt.
    reconnect_generation: AtomicU64,
}

impl IdentityStore {
    pub fn new(backend: Arc<dyn VectorBackend>, collection: impl Into<String>) -> Self {
        Self {
            backend,
            collection: collection.into(),
            dimension: FINGERPRINT_DIM,
            retry: RetryPolicy::default(),
            connected: AtomicBool::new(false),
            endpoint: RwLock::new(None),
            reconnect_lock: Mutex::new(()),
            reconnect_generation: AtomicU64::new(0),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn backend_kind(&self) -> &'static str {
        self.backend.kind()
    }

    pub fn state(&self) -> ConnectionState {
        if self.connected.load(Ordering::Acquire) {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Connect to `endpoint`, retrying per the configured policy.
    ///
    /// The endpoint is remembered even when every attempt fails, so later
    /// operations can reconnect lazily.
    #[instrument(skip_all, fields(backend = self.backend.kind(), endpoint = %endpoint))]
    pub async fn connect(&self, endpoint: StoreEndpoint) -> StoreResult<()> {
        *self.endpoint.write().await = Some(endpoint.clone());

        let attempt = AtomicU32::new(0);
        let result = retry_notify(
            FixedBackoff::new(self.retry),
            || {
                let (backend, endpoint, attempt) = (&self.backend, &endpoint, &attempt);
                async move {
                    let n = attempt.fetch_add(1, Ordering::Relaxed) + 1;
                    debug!(attempt = n, "Connecting to identity store");
                    backend.connect(endpoint).await.map_err(|e| {
                        if e.is_connectivity() {
                            backoff::Error::transient(e)
                        } else {
                            backoff::Error::permanent(e)
                        }
                    })
                }
            },
            |err: StoreError, retry_in: Duration| {
                warn!(
                    error = %err,
                    retry_in_ms = retry_in.as_millis() as u64,
                    "Identity store connection failed, retrying"
                );
            },
        )
        .await;

        match result {
            Ok(()) => {
                self.reconnect_generation.fetch_add(1, Ordering::AcqRel);
                self.connected.store(true, Ordering::Release);
                info!(
                    attempts = attempt.load(Ordering::Relaxed),
                    "Connected to identity store"
                );
                Ok(())
            }
            Err(e) => {
                self.connected.store(false, Ordering::Release);
                warn!(
                    error = %e,
                    attempts = attempt.load(Ordering::Relaxed),
                    "Identity store connection failed"
                );
                Err(e)
            }
        }
    }

    /// Release the connection. Used on shutdown.
    pub async fn disconnect(&self) {
        self.backend.disconnect().await;
        self.connected.store(false, Ordering::Release);
        info!("Disconnected from identity store");
    }

    /// Create the identity collection if missing, otherwise load it.
    ///
    /// Safe to call repeatedly. Fails with [`StoreError::NotConnected`] rather
    /// than connecting on its own.
    #[instrument(skip(self), fields(collection = %self.collection))]
    pub async fn ensure_schema(&self) -> StoreResult<SchemaStatus> {
        if !self.is_connected() {
            return Err(StoreError::NotConnected);
        }
        let generation = self.generation();
        let result = self.provision().await;
        self.observe(generation, &result);
        result
    }

    async fn provision(&self) -> StoreResult<SchemaStatus> {
        if self.backend.has_collection(&self.collection).await? {
            self.backend.load_collection(&self.collection).await?;
            let info = self.backend.describe_collection(&self.collection).await?;
            if info.dimension != self.dimension {
                return Err(StoreError::SchemaMismatch {
                    expected: self.dimension,
                    found: info.dimension,
                });
            }
            debug!(index = ?info.index, "Reusing existing identity collection");
            Ok(SchemaStatus::Existing)
        } else {
            self.backend
                .create_collection(&self.collection, self.dimension)
                .await?;
            self.backend.load_collection(&self.collection).await?;
            info!(dimension = self.dimension, "Created identity collection");
            Ok(SchemaStatus::Created)
        }
    }

    pub async fn describe(&self) -> StoreResult<CollectionInfo> {
        let generation = self.ensure_connected().await?;
        let result = self.backend.describe_collection(&self.collection).await;
        self.observe(generation, &result);
        result
    }

    /// Append one record for `label`.
    #[instrument(skip(self, fingerprint), fields(collection = %self.collection))]
    pub async fn insert(&self, label: &str, fingerprint: &Fingerprint) -> StoreResult<InsertOutcome> {
        let label = validate_label(label)?;
        debug_assert_eq!(fingerprint.dimension(), self.dimension);
        let generation = self.ensure_connected().await?;

        let result = self
            .backend
            .insert(&self.collection, label, fingerprint)
            .await;
        self.observe(generation, &result);

        let internal_id = result?;
        debug!(label, internal_id, "Inserted identity record");
        Ok(InsertOutcome {
            internal_id,
            inserted: 1,
        })
    }

    /// Nearest neighbors of `fingerprint`, best first.
    ///
    /// No threshold is applied here; callers decide what counts as a match.
    #[instrument(skip(self, fingerprint), fields(collection = %self.collection))]
    pub async fn search(&self, fingerprint: &Fingerprint, top_k: usize) -> StoreResult<Vec<SearchHit>> {
        let generation = self.ensure_connected().await?;
        let result = self
            .backend
            .search(&self.collection, fingerprint, top_k.max(1))
            .await;
        self.observe(generation, &result);
        result
    }

    /// Delete every record for `label`. A label with no records is an error.
    #[instrument(skip(self), fields(collection = %self.collection))]
    pub async fn delete(&self, label: &str) -> StoreResult<u64> {
        let label = validate_label(label)?;
        let generation = self.ensure_connected().await?;

        let existing = self.backend.count_label(&self.collection, label).await;
        self.observe(generation, &existing);
        if existing? == 0 {
            return Err(StoreError::NotFound(label.to_string()));
        }

        let result = self.backend.delete_label(&self.collection, label).await;
        self.observe(generation, &result);
        let deleted = result?;
        info!(label, deleted, "Deleted identity records");
        Ok(deleted)
    }

    /// Distinct labels, sorted.
    pub async fn list_labels(&self) -> StoreResult<Vec<String>> {
        let generation = self.ensure_connected().await?;
        let result = self.backend.labels(&self.collection).await;
        self.observe(generation, &result);
        let mut labels = result?;
        labels.sort();
        labels.dedup();
        Ok(labels)
    }

    /// True only if connected and the identity collection is reachable.
    pub async fn health(&self) -> bool {
        let generation = match self.ensure_connected().await {
            Ok(generation) => generation,
            Err(_) => return false,
        };
        let result = self.backend.has_collection(&self.collection).await;
        self.observe(generation, &result);
        matches!(result, Ok(true))
    }

    fn generation(&self) -> u64 {
        self.reconnect_generation.load(Ordering::Acquire)
    }

    /// Downgrade to disconnected on a connectivity error, unless the error
    /// came from a connection that has since been replaced.
    fn observe<T>(&self, generation: u64, result: &StoreResult<T>) {
        if let Err(e) = result {
            if !e.is_connectivity() {
                return;
            }
            if self.generation() != generation {
                debug!(error = %e, "Ignoring failure from a superseded connection");
                return;
            }
            if self.connected.swap(false, Ordering::AcqRel) {
                warn!(error = %e, "Identity store connection lost");
            }
        }
    }

    /// Reconnect once if disconnected, returning the connection generation
    /// the caller runs under. Concurrent callers wait for the in-flight
    /// attempt and share its result.
    async fn ensure_connected(&self) -> StoreResult<u64> {
        if self.is_connected() {
            return Ok(self.generation());
        }

        let observed = self.generation();
        let _guard = self.reconnect_lock.lock().await;

        if self.generation() != observed {
            // Another task finished an attempt while we waited.
            return if self.is_connected() {
                Ok(self.generation())
            } else {
                Err(StoreError::Connection("reconnect attempt failed".into()))
            };
        }
        if self.is_connected() {
            return Ok(self.generation());
        }

        let endpoint = self
            .endpoint
            .read()
            .await
            .clone()
            .ok_or(StoreError::NotConnected)?;

        debug!(endpoint = %endpoint, "Attempting lazy reconnect");
        let result = self.backend.connect(&endpoint).await;
        let generation = self.reconnect_generation.fetch_add(1, Ordering::AcqRel) + 1;
        match result {
            Ok(()) => {
                self.connected.store(true, Ordering::Release);
                info!(generation, "Reconnected to identity store");
                if let Err(e) = self.provision().await {
                    warn!(error = %e, "Schema check after reconnect failed");
                }
                Ok(generation)
            }
            Err(e) => {
                warn!(error = %e, "Lazy reconnect failed");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use backoff::backoff::Backoff;

    fn unit(index: usize) -> Fingerprint {
        let mut v = vec![0.0; FINGERPRINT_DIM];
        v[index] = 1.0;
        Fingerprint::from_embedding(v).unwrap()
    }

    fn fast_retry(attempts: u32) -> RetryPolicy {
        RetryPolicy {
            attempts,
            delay: Duration::from_millis(5),
        }
    }

    async fn connected_store() -> (Arc<MemoryBackend>, IdentityStore) {
        let backend = Arc::new(MemoryBackend::new());
        let store = IdentityStore::new(backend.clone(), DEFAULT_COLLECTION)
            .with_retry_policy(fast_retry(3));
        store.connect(StoreEndpoint::default()).await.unwrap();
        store.ensure_schema().await.unwrap();
        (backend, store)
    }

    #[test]
    fn test_fixed_backoff() {
        let mut b = FixedBackoff::new(fast_retry(3));
        assert_eq!(b.next_backoff(), Some(Duration::from_millis(5)));
        assert_eq!(b.next_backoff(), Some(Duration::from_millis(5)));
        assert_eq!(b.next_backoff(), None);
        b.reset();
        assert!(b.next_backoff().is_some());
    }

    #[test]
    fn test_label_validation() {
        assert_eq!(validate_label("  alice ").unwrap(), "alice");
        assert!(validate_label("   ").is_err());
        assert!(validate_label(&"x".repeat(MAX_LABEL_LEN)).is_ok());
        assert!(validate_label(&"x".repeat(MAX_LABEL_LEN + 1)).is_err());
    }

    #[test]
    fn test_endpoint_debug_redacts_password() {
        let endpoint = StoreEndpoint {
            password: "hunter2".into(),
            ..Default::default()
        };
        let debug = format!("{endpoint:?}");
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("REDACTED"));
    }

    #[tokio::test]
    async fn test_connect_retries_then_fails() {
        let backend = Arc::new(MemoryBackend::new());
        backend.set_available(false);
        let store = IdentityStore::new(backend.clone(), DEFAULT_COLLECTION)
            .with_retry_policy(fast_retry(3));

        assert!(store.connect(StoreEndpoint::default()).await.is_err());
        assert_eq!(backend.connect_calls(), 3);
        assert_eq!(store.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_ensure_schema_requires_connection() {
        let store = IdentityStore::new(Arc::new(MemoryBackend::new()), DEFAULT_COLLECTION);
        assert!(matches!(
            store.ensure_schema().await,
            Err(StoreError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_ensure_schema_idempotent() {
        let (_backend, store) = connected_store().await;
        let before = store.describe().await.unwrap();
        assert_eq!(store.ensure_schema().await.unwrap(), SchemaStatus::Existing);
        assert_eq!(store.ensure_schema().await.unwrap(), SchemaStatus::Existing);
        assert_eq!(store.describe().await.unwrap(), before);
        assert_eq!(before.dimension, FINGERPRINT_DIM);
    }

    #[tokio::test]
    async fn test_schema_dimension_mismatch() {
        let backend = Arc::new(MemoryBackend::new());
        backend.connect(&StoreEndpoint::default()).await.unwrap();
        backend.create_collection("legacy", 128).await.unwrap();

        let store = IdentityStore::new(backend, "legacy");
        store.connect(StoreEndpoint::default()).await.unwrap();
        assert!(matches!(
            store.ensure_schema().await,
            Err(StoreError::SchemaMismatch {
                expected: FINGERPRINT_DIM,
                found: 128
            })
        ));
    }

    #[tokio::test]
    async fn test_insert_search_delete() {
        let (_backend, store) = connected_store().await;

        let outcome = store.insert("alice", &unit(0)).await.unwrap();
        assert_eq!(outcome.inserted, 1);
        store.insert("bob", &unit(1)).await.unwrap();

        let hits = store.search(&unit(0), 1).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].identity_label, "alice");
        assert!((hits[0].similarity - 1.0).abs() < 1e-6);

        assert_eq!(store.list_labels().await.unwrap(), vec!["alice", "bob"]);
        assert_eq!(store.delete("alice").await.unwrap(), 1);
        assert!(matches!(
            store.delete("alice").await,
            Err(StoreError::NotFound(label)) if label == "alice"
        ));
    }

    #[tokio::test]
    async fn test_duplicate_label_creates_second_record() {
        let (_backend, store) = connected_store().await;
        store.insert("alice", &unit(0)).await.unwrap();
        store.insert("alice", &unit(2)).await.unwrap();
        assert_eq!(store.list_labels().await.unwrap(), vec!["alice"]);
        assert_eq!(store.delete("alice").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_outage_downgrades_and_lazy_reconnect_recovers() {
        let (backend, store) = connected_store().await;
        store.insert("alice", &unit(0)).await.unwrap();

        backend.set_available(false);
        let err = store.search(&unit(0), 1).await.unwrap_err();
        assert!(err.is_connectivity());
        assert_eq!(store.state(), ConnectionState::Disconnected);
        assert!(!store.health().await);

        let calls_before = backend.connect_calls();
        backend.set_available(true);
        let hits = store.search(&unit(0), 1).await.unwrap();
        assert_eq!(hits[0].identity_label, "alice");
        assert_eq!(store.state(), ConnectionState::Connected);
        assert_eq!(backend.connect_calls(), calls_before + 1);
        assert!(store.health().await);
    }

    #[tokio::test]
    async fn test_lazy_reconnect_is_single_attempt() {
        let (backend, store) = connected_store().await;
        backend.set_available(false);
        let _ = store.list_labels().await;

        let calls_before = backend.connect_calls();
        assert!(store.list_labels().await.is_err());
        assert_eq!(backend.connect_calls(), calls_before + 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_reconnect_is_single_flight() {
        let (backend, store) = connected_store().await;
        let store = Arc::new(store);
        backend.set_available(false);
        let _ = store.list_labels().await;
        assert!(!store.is_connected());

        backend.set_connect_delay(Duration::from_millis(50));
        backend.set_available(true);
        let calls_before = backend.connect_calls();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move { store.list_labels().await }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(backend.connect_calls(), calls_before + 1);
    }

    #[tokio::test]
    async fn test_superseded_connection_failure_is_ignored() {
        let (backend, store) = connected_store().await;
        let stale = store.generation();

        backend.set_available(false);
        assert!(store.list_labels().await.is_err());
        backend.set_available(true);
        store.list_labels().await.unwrap();
        assert!(store.generation() > stale);

        // A query that started on the replaced pool fails after the reconnect.
        let late: StoreResult<()> = Err(StoreError::Connection("pool closed".into()));
        store.observe(stale, &late);
        assert_eq!(store.state(), ConnectionState::Connected);

        store.observe(store.generation(), &late);
        assert_eq!(store.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_query_errors_keep_connection() {
        let (_backend, store) = connected_store().await;
        let failed: StoreResult<()> = Err(StoreError::Query("syntax error".into()));
        store.observe(store.generation(), &failed);
        assert!(store.is_connected());
    }

    #[tokio::test]
    async fn test_operations_without_endpoint_fail() {
        let store = IdentityStore::new(Arc::new(MemoryBackend::new()), DEFAULT_COLLECTION);
        assert!(matches!(
            store.list_labels().await,
            Err(StoreError::NotConnected)
        ));
        assert!(!store.health().await);
    }
}
