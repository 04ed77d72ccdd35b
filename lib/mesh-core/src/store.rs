//! Registry store contract
//!
//! Every piece of mesh state lives behind this trait. Components never
//! share in-memory state directly; they read and write through a
//! [`StoreHandle`], which bounds each call with the configured timeout.

use crate::error::StoreError;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Shared key-value store backing the mesh
///
/// Per-key operations must be atomic. `incr` in particular must never hand
/// out the same value twice, even across processes.
#[async_trait]
pub trait RegistryStore: Send + Sync {
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Set a value, optionally expiring after `ttl`
    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> StoreResult<()>;

    /// Delete a key, returning whether it existed
    async fn delete(&self, key: &str) -> StoreResult<bool>;

    /// Add a member to a set, returning whether it was newly added
    async fn sadd(&self, key: &str, member: &str) -> StoreResult<bool>;

    /// Remove a member from a set, returning whether it was present
    async fn srem(&self, key: &str, member: &str) -> StoreResult<bool>;

    async fn smembers(&self, key: &str) -> StoreResult<Vec<String>>;

    /// Atomically increment a counter and return the new value
    async fn incr(&self, key: &str) -> StoreResult<i64>;

    /// Enumerate keys starting with `prefix`
    async fn keys(&self, prefix: &str) -> StoreResult<Vec<String>>;
}

/// Timeout-bounded handle to a registry store
#[derive(Clone)]
pub struct StoreHandle {
    store: Arc<dyn RegistryStore>,
    timeout: Duration,
}

impl StoreHandle {
    pub fn new(store: Arc<dyn RegistryStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn bounded<T, F>(&self, fut: F) -> StoreResult<T>
    where
        F: Future<Output = StoreResult<T>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(self.timeout.as_millis() as u64)),
        }
    }

    pub async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.bounded(self.store.get(key)).await
    }

    pub async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> StoreResult<()> {
        self.bounded(self.store.set(key, value, ttl)).await
    }

    pub async fn delete(&self, key: &str) -> StoreResult<bool> {
        self.bounded(self.store.delete(key)).await
    }

    pub async fn sadd(&self, key: &str, member: &str) -> StoreResult<bool> {
        self.bounded(self.store.sadd(key, member)).await
    }

    pub async fn srem(&self, key: &str, member: &str) -> StoreResult<bool> {
        self.bounded(self.store.srem(key, member)).await
    }

    pub async fn smembers(&self, key: &str) -> StoreResult<Vec<String>> {
        self.bounded(self.store.smembers(key)).await
    }

    pub async fn incr(&self, key: &str) -> StoreResult<i64> {
        self.bounded(self.store.incr(key)).await
    }

    pub async fn keys(&self, prefix: &str) -> StoreResult<Vec<String>> {
        self.bounded(self.store.keys(prefix)).await
    }
}
