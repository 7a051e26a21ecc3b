//! In-process attempt store with timer-based eviction.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::trace;

use super::{AtomicIncrement, AttemptStore, StoreError, TransitionFn};
use crate::guard::policy::Transition;
use crate::guard::record::AttemptRecord;

/// A stored record and the timer that will evict it.
struct Slot {
    /// JSON-encoded [`AttemptRecord`]
    value: String,
    generation: u64,
    expiry: Option<JoinHandle<()>>,
}

impl Drop for Slot {
    fn drop(&mut self) {
        if let Some(expiry) = self.expiry.take() {
            expiry.abort();
        }
    }
}

/// Attempt store backed by a concurrent map in this process.
///
/// Each `set` arms a tokio timer that evicts the entry after its TTL and
/// cancels the timer of any earlier value. Nothing is shared across
/// processes. Implements [`AtomicIncrement`] using the map's per-key entry
/// lock. Must be used from within a tokio runtime.
pub struct MemoryStore {
    prefix: String,
    entries: Arc<DashMap<String, Slot>>,
    generations: AtomicU64,
}

impl MemoryStore {
    /// An empty store with no key prefix.
    pub fn new() -> Self {
        Self::with_prefix("")
    }

    /// A store that prepends `prefix` to every key.
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            entries: Arc::new(DashMap::new()),
            generations: AtomicU64::new(0),
        }
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    fn slot(&self, key: &str, record: &AttemptRecord, ttl_secs: u64) -> Result<Slot, StoreError> {
        let value = serde_json::to_string(record)?;
        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        let expiry = (ttl_secs > 0).then(|| {
            spawn_expiry(
                Arc::downgrade(&self.entries),
                key.to_string(),
                generation,
                Duration::from_secs(ttl_secs),
            )
        });

        Ok(Slot {
            value,
            generation,
            expiry,
        })
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn spawn_expiry(
    entries: Weak<DashMap<String, Slot>>,
    key: String,
    generation: u64,
    ttl: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(ttl).await;
        if let Some(entries) = entries.upgrade() {
            // Detach our own handle first so dropping the slot doesn't abort this task
            if let Some(mut slot) = entries.get_mut(&key) {
                if slot.generation == generation {
                    slot.expiry = None;
                }
            }
            if entries
                .remove_if(&key, |_, slot| slot.generation == generation)
                .is_some()
            {
                trace!(key = %key, "Attempt record expired");
            }
        }
    })
}

fn decode(slot: &Slot) -> Result<AttemptRecord, StoreError> {
    Ok(serde_json::from_str(&slot.value)?)
}

#[async_trait]
impl AttemptStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<AttemptRecord>, StoreError> {
        let key = self.full_key(key);
        let record = self.entries.get(&key).map(|slot| decode(&slot)).transpose();
        record
    }

    async fn set(&self, key: &str, record: &AttemptRecord, ttl_secs: u64) -> Result<(), StoreError> {
        let key = self.full_key(key);
        let slot = self.slot(&key, record, ttl_secs)?;
        // The displaced slot aborts its own timer when dropped
        self.entries.insert(key, slot);
        Ok(())
    }

    async fn reset(&self, key: &str) -> Result<(), StoreError> {
        let key = self.full_key(key);
        self.entries.remove(&key);
        Ok(())
    }

    fn as_atomic(&self) -> Option<&dyn AtomicIncrement> {
        Some(self)
    }
}

#[async_trait]
impl AtomicIncrement for MemoryStore {
    async fn increment(
        &self,
        key: &str,
        transition: &TransitionFn<'_>,
    ) -> Result<Transition, StoreError> {
        let key = self.full_key(key);

        match self.entries.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                let prior = decode(occupied.get())?;
                let outcome = transition(Some(&prior));
                if let Transition::Admit { record, ttl_secs, .. } = &outcome {
                    let slot = self.slot(&key, record, *ttl_secs)?;
                    occupied.insert(slot);
                }
                Ok(outcome)
            }
            Entry::Vacant(vacant) => {
                let outcome = transition(None);
                if let Transition::Admit { record, ttl_secs, .. } = &outcome {
                    let slot = self.slot(&key, record, *ttl_secs)?;
                    vacant.insert(slot);
                }
                Ok(outcome)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use tokio_test::{assert_err, assert_ok};

    fn record(count: u64) -> AttemptRecord {
        AttemptRecord {
            count,
            first_attempt: Utc.timestamp_millis_opt(1_000).unwrap(),
            last_attempt: Utc.timestamp_millis_opt(2_000).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_get_missing_key() {
        let store = MemoryStore::new();
        assert_eq!(store.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_set_then_get() {
        let store = MemoryStore::new();
        store.set("key", &record(3), 60).await.unwrap();

        assert_eq!(store.get("key").await.unwrap(), Some(record(3)));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_set_overwrites() {
        let store = MemoryStore::new();
        store.set("key", &record(1), 0).await.unwrap();
        store.set("key", &record(2), 0).await.unwrap();

        assert_eq!(store.get("key").await.unwrap(), Some(record(2)));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_reset_is_idempotent() {
        let store = MemoryStore::new();
        store.set("key", &record(1), 60).await.unwrap();

        assert_ok!(store.reset("key").await);
        assert_ok!(store.reset("key").await);
        assert_eq!(store.get("key").await.unwrap(), None);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_prefix_isolates_stores() {
        let store = MemoryStore::with_prefix("login:");
        store.set("key", &record(1), 0).await.unwrap();

        assert_eq!(store.get("key").await.unwrap(), Some(record(1)));
        assert!(store.entries.contains_key("login:key"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_evicts_record() {
        let store = MemoryStore::new();
        store.set("key", &record(1), 5).await.unwrap();

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(store.get("key").await.unwrap().is_some());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(store.get("key").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_rearms_expiry() {
        let store = MemoryStore::new();
        store.set("key", &record(1), 5).await.unwrap();

        tokio::time::sleep(Duration::from_secs(4)).await;
        store.set("key", &record(2), 5).await.unwrap();

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(store.get("key").await.unwrap(), Some(record(2)));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(store.get("key").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_ttl_never_expires() {
        let store = MemoryStore::new();
        store.set("key", &record(1), 5).await.unwrap();
        store.set("key", &record(2), 0).await.unwrap();

        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert_eq!(store.get("key").await.unwrap(), Some(record(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_cancels_expiry() {
        let store = MemoryStore::new();
        store.set("key", &record(1), 5).await.unwrap();
        store.reset("key").await.unwrap();
        store.set("key", &record(2), 0).await.unwrap();

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(store.get("key").await.unwrap(), Some(record(2)));
    }

    #[tokio::test]
    async fn test_increment_writes_only_admitted() {
        let store = MemoryStore::new();
        let now = Utc.timestamp_millis_opt(5_000).unwrap();

        let admitted = store
            .increment("key", &|prior| {
                assert!(prior.is_none());
                Transition::Admit {
                    record: AttemptRecord::first(now),
                    ttl_secs: 0,
                    window_expired: false,
                }
            })
            .await
            .unwrap();
        assert!(matches!(admitted, Transition::Admit { .. }));

        let denied = store
            .increment("key", &|prior| {
                assert_eq!(prior.map(|r| r.count), Some(1));
                Transition::Deny {
                    retry_after: now,
                    count: 1,
                }
            })
            .await
            .unwrap();
        assert!(matches!(denied, Transition::Deny { .. }));
        assert_eq!(store.get("key").await.unwrap(), Some(AttemptRecord::first(now)));
    }

    #[tokio::test]
    async fn test_corrupt_value_is_codec_error() {
        let store = MemoryStore::new();
        store.set("key", &record(1), 0).await.unwrap();
        if let Some(mut slot) = store.entries.get_mut("key") {
            slot.value = "not json".to_string();
        }

        let err = assert_err!(store.get("key").await);
        assert!(matches!(err, StoreError::Codec(_)));
    }

    #[tokio::test]
    async fn test_advertises_atomic_capability() {
        let store = MemoryStore::new();
        assert!(store.as_atomic().is_some());
    }
}
