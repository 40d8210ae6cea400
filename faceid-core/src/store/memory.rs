//! In-memory identity store backend.
//!
//! Records live in a `DashMap` keyed by collection name and are lost on
//! restart. The backend can be switched "offline" to simulate an outage.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;

use super::{
    CollectionInfo, IdentityRecord, SearchHit, StoreEndpoint, StoreError, StoreResult,
    VectorBackend,
};
use crate::fingerprint::Fingerprint;

struct MemoryCollection {
    dimension: usize,
    loaded: bool,
    records: Vec<IdentityRecord>,
}

/// `DashMap`-backed store for development and tests.
pub struct MemoryBackend {
    collections: DashMap<String, MemoryCollection>,
    connected: AtomicBool,
    available: AtomicBool,
    next_id: AtomicI64,
    connect_calls: AtomicUsize,
    connect_delay_ms: AtomicU64,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            collections: DashMap::new(),
            connected: AtomicBool::new(false),
            available: AtomicBool::new(true),
            next_id: AtomicI64::new(1),
            connect_calls: AtomicUsize::new(0),
            connect_delay_ms: AtomicU64::new(0),
        }
    }

    /// Simulate the store going away (`false`) or coming back (`true`).
    ///
    /// Going offline drops the current connection; data is kept.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
        if !available {
            self.connected.store(false, Ordering::SeqCst);
        }
    }

    /// Delay applied to every connect call.
    pub fn set_connect_delay(&self, delay: Duration) {
        self.connect_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Number of connect calls received so far.
    pub fn connect_calls(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }

    pub fn record_count(&self, collection: &str) -> usize {
        self.collections
            .get(collection)
            .map(|c| c.records.len())
            .unwrap_or(0)
    }

    fn check(&self) -> StoreResult<()> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(StoreError::Connection("memory store offline".into()));
        }
        if !self.connected.load(Ordering::SeqCst) {
            return Err(StoreError::NotConnected);
        }
        Ok(())
    }

    fn with_collection<T>(
        &self,
        collection: &str,
        f: impl FnOnce(&mut MemoryCollection) -> StoreResult<T>,
    ) -> StoreResult<T> {
        self.check()?;
        let mut entry = self
            .collections
            .get_mut(collection)
            .ok_or_else(|| StoreError::CollectionMissing(collection.to_string()))?;
        if !entry.loaded {
            return Err(StoreError::Query(format!(
                "collection '{collection}' is not loaded"
            )));
        }
        f(&mut entry)
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VectorBackend for MemoryBackend {
    async fn connect(&self, _endpoint: &StoreEndpoint) -> StoreResult<()> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.connect_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if !self.available.load(Ordering::SeqCst) {
            return Err(StoreError::Connection("connection refused".into()));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    async fn has_collection(&self, collection: &str) -> StoreResult<bool> {
        self.check()?;
        Ok(self.collections.contains_key(collection))
    }

    async fn create_collection(&self, collection: &str, dimension: usize) -> StoreResult<()> {
        self.check()?;
        self.collections
            .entry(collection.to_string())
            .or_insert_with(|| MemoryCollection {
                dimension,
                loaded: false,
                records: Vec::new(),
            });
        Ok(())
    }

    async fn load_collection(&self, collection: &str) -> StoreResult<()> {
        self.check()?;
        let mut entry = self
            .collections
            .get_mut(collection)
            .ok_or_else(|| StoreError::CollectionMissing(collection.to_string()))?;
        entry.loaded = true;
        Ok(())
    }

    async fn describe_collection(&self, collection: &str) -> StoreResult<CollectionInfo> {
        self.check()?;
        let entry = self
            .collections
            .get(collection)
            .ok_or_else(|| StoreError::CollectionMissing(collection.to_string()))?;
        Ok(CollectionInfo {
            name: collection.to_string(),
            dimension: entry.dimension,
            index: Some("flat (exact inner product)".to_string()),
        })
    }

    async fn insert(
        &self,
        collection: &str,
        label: &str,
        fingerprint: &Fingerprint,
    ) -> StoreResult<i64> {
        let internal_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.with_collection(collection, |c| {
            if fingerprint.dimension() != c.dimension {
                return Err(StoreError::SchemaMismatch {
                    expected: c.dimension,
                    found: fingerprint.dimension(),
                });
            }
            c.records.push(IdentityRecord {
                internal_id,
                identity_label: label.to_string(),
                fingerprint: fingerprint.clone(),
            });
            Ok(internal_id)
        })
    }

    async fn search(
        &self,
        collection: &str,
        fingerprint: &Fingerprint,
        top_k: usize,
    ) -> StoreResult<Vec<SearchHit>> {
        self.with_collection(collection, |c| {
            let mut hits: Vec<SearchHit> = c
                .records
                .iter()
                .map(|r| SearchHit {
                    internal_id: r.internal_id,
                    identity_label: r.identity_label.clone(),
                    similarity: r.fingerprint.similarity(fingerprint),
                })
                .collect();
            hits.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
            hits.truncate(top_k);
            Ok(hits)
        })
    }

    async fn count_label(&self, collection: &str, label: &str) -> StoreResult<u64> {
        self.with_collection(collection, |c| {
            Ok(c.records
                .iter()
                .filter(|r| r.identity_label == label)
                .count() as u64)
        })
    }

    async fn delete_label(&self, collection: &str, label: &str) -> StoreResult<u64> {
        self.with_collection(collection, |c| {
            let before = c.records.len();
            c.records.retain(|r| r.identity_label != label);
            Ok((before - c.records.len()) as u64)
        })
    }

    async fn labels(&self, collection: &str) -> StoreResult<Vec<String>> {
        self.with_collection(collection, |c| {
            let mut labels: Vec<String> =
                c.records.iter().map(|r| r.identity_label.clone()).collect();
            labels.sort();
            labels.dedup();
            Ok(labels)
        })
    }

    fn kind(&self) -> &'static str {
        "memory"
    }
}
