//! In-process registry store
//!
//! Backs single-process deployments and tests. TTLs are evaluated lazily
//! against the injected [`Clock`], so expiry is deterministic under a
//! [`ManualClock`](crate::ManualClock).

use crate::clock::{Clock, SystemClock};
use crate::error::StoreError;
use crate::store::{RegistryStore, StoreResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Clone, Debug)]
enum Value {
    Text(String),
    Set(BTreeSet<String>),
}

#[derive(Clone, Debug)]
struct Entry {
    value: Value,
    expires_at: Option<DateTime<Utc>>,
}

impl Entry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| now >= at).unwrap_or(false)
    }
}

/// MemoryStore keeps every key in a single locked map
pub struct MemoryStore {
    entries: Arc<RwLock<HashMap<String, Entry>>>,
    clock: Arc<dyn Clock>,
    available: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            clock,
            available: AtomicBool::new(true),
        }
    }

    /// Simulate an outage: every call fails with `StoreError::Unavailable`
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store marked unavailable".to_string()))
        }
    }

    fn expiry(&self, ttl: Option<Duration>) -> Option<DateTime<Utc>> {
        ttl.and_then(|ttl| chrono::Duration::from_std(ttl).ok())
            .map(|ttl| self.clock.now() + ttl)
    }

    fn wrong_type(key: &str) -> StoreError {
        StoreError::Unavailable(format!("wrong value type at key {}", key))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RegistryStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.check_available()?;
        let now = self.clock.now();
        let entries = self.entries.read().await;
        match entries.get(key) {
            Some(entry) if !entry.is_expired(now) => match &entry.value {
                Value::Text(text) => Ok(Some(text.clone())),
                Value::Set(_) => Err(Self::wrong_type(key)),
            },
            _ => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> StoreResult<()> {
        self.check_available()?;
        let expires_at = self.expiry(ttl);
        let mut entries = self.entries.write().await;
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::Text(value),
                expires_at,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        self.check_available()?;
        let now = self.clock.now();
        let mut entries = self.entries.write().await;
        Ok(entries
            .remove(key)
            .map(|entry| !entry.is_expired(now))
            .unwrap_or(false))
    }

    async fn sadd(&self, key: &str, member: &str) -> StoreResult<bool> {
        self.check_available()?;
        let now = self.clock.now();
        let mut entries = self.entries.write().await;
        let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::Set(BTreeSet::new()),
            expires_at: None,
        });
        if entry.is_expired(now) {
            *entry = Entry {
                value: Value::Set(BTreeSet::new()),
                expires_at: None,
            };
        }
        match &mut entry.value {
            Value::Set(members) => Ok(members.insert(member.to_string())),
            Value::Text(_) => Err(Self::wrong_type(key)),
        }
    }

    async fn srem(&self, key: &str, member: &str) -> StoreResult<bool> {
        self.check_available()?;
        let mut entries = self.entries.write().await;
        let (removed, now_empty) = match entries.get_mut(key) {
            Some(Entry {
                value: Value::Set(members),
                ..
            }) => (members.remove(member), members.is_empty()),
            Some(_) => return Err(Self::wrong_type(key)),
            None => (false, false),
        };
        // Empty sets disappear, as they do in Redis
        if now_empty {
            entries.remove(key);
        }
        Ok(removed)
    }

    async fn smembers(&self, key: &str) -> StoreResult<Vec<String>> {
        self.check_available()?;
        let now = self.clock.now();
        let entries = self.entries.read().await;
        match entries.get(key) {
            Some(entry) if !entry.is_expired(now) => match &entry.value {
                Value::Set(members) => Ok(members.iter().cloned().collect()),
                Value::Text(_) => Err(Self::wrong_type(key)),
            },
            _ => Ok(Vec::new()),
        }
    }

    async fn incr(&self, key: &str) -> StoreResult<i64> {
        self.check_available()?;
        let now = self.clock.now();
        let mut entries = self.entries.write().await;
        let current = match entries.get(key) {
            Some(entry) if !entry.is_expired(now) => match &entry.value {
                Value::Text(text) => text.parse::<i64>().map_err(|_| Self::wrong_type(key))?,
                Value::Set(_) => return Err(Self::wrong_type(key)),
            },
            _ => 0,
        };
        let next = current.wrapping_add(1);
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::Text(next.to_string()),
                expires_at: None,
            },
        );
        Ok(next)
    }

    async fn keys(&self, prefix: &str) -> StoreResult<Vec<String>> {
        self.check_available()?;
        let now = self.clock.now();
        let mut entries = self.entries.write().await;
        // Enumeration doubles as the purge point for expired keys
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        if entries.len() != before {
            debug!("Purged {} expired keys", before - entries.len());
        }
        let mut keys: Vec<String> = entries
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }
}
