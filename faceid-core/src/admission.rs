//! Inference admission control.
//!
//! A process-wide counting gate that bounds how many fingerprint extractions
//! run at once. Waiting callers are suspended cooperatively; the extraction
//! itself runs on tokio's blocking pool and keeps its slot until the model
//! call returns, even if the awaiting request has gone away.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::error::{FaceIdError, Result};

/// Default number of concurrent extractions.
pub const DEFAULT_CAPACITY: usize = 6;

/// Bounded-concurrency gate around the compute resource.
#[derive(Clone)]
pub struct AdmissionGate {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

/// A held slot. Dropping it releases the slot.
pub struct AdmissionPermit {
    _permit: OwnedSemaphorePermit,
}

impl AdmissionGate {
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(FaceIdError::InvalidConfig(
                "admission capacity must be at least 1".into(),
            ));
        }
        Ok(Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of slots currently held.
    pub fn in_flight(&self) -> usize {
        self.capacity - self.semaphore.available_permits()
    }

    /// Wait until a slot is free and take it.
    pub async fn acquire(&self) -> Result<AdmissionPermit> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| FaceIdError::TaskFailed("admission gate closed".into()))?;
        Ok(AdmissionPermit { _permit: permit })
    }

    /// Run `work` on the blocking pool while holding one slot.
    ///
    /// The slot moves into the blocking task, so it is released only when
    /// `work` has finished, not when the returned future is dropped.
    pub async fn run<F, T>(&self, work: F) -> Result<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let permit = self.acquire().await?;
        debug!(in_flight = self.in_flight(), capacity = self.capacity, "Admission slot acquired");

        tokio::task::spawn_blocking(move || {
            let _slot = permit;
            work()
        })
        .await
        .map_err(|e| FaceIdError::TaskFailed(format!("extraction task join error: {e}")))
    }
}
