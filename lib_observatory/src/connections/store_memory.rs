//! # In-Memory Subscription Store
//!
//! A process-local store with the same semantics as the Redis one. Used by
//! tests and when the server runs without a Redis URL (nothing survives a
//! restart).

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::store::{Subscription, SubscriptionDetail, SubscriptionId, SubscriptionStore, StoreError};

#[derive(Debug, Default)]
struct Inner {
    next_id: SubscriptionId,
    records: BTreeMap<SubscriptionId, Subscription>,
}

/// A `SubscriptionStore` kept in a mutex-guarded map.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    /// Creates an empty store. Ids start at 1.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>, StoreError> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".to_string()))
    }
}

#[async_trait]
impl SubscriptionStore for MemoryStore {
    async fn create(&self, detail: SubscriptionDetail) -> Result<SubscriptionId, StoreError> {
        let mut inner = self.lock()?;
        inner.next_id += 1;
        let id = inner.next_id;
        inner.records.insert(id, Subscription::new(id, detail, Utc::now()));
        Ok(id)
    }

    async fn get(&self, id: SubscriptionId) -> Result<Subscription, StoreError> {
        self.lock()?
            .records
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    async fn list_all(&self) -> Result<Vec<Subscription>, StoreError> {
        Ok(self.lock()?.records.values().cloned().collect())
    }

    async fn invalidate(&self, id: SubscriptionId) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        let record = inner.records.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        record.valid = false;
        Ok(())
    }

    async fn record_activation(&self, id: SubscriptionId, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        let record = inner.records.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        record.activate_count += 1;
        record.last_activate_time = Some(at);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detail() -> SubscriptionDetail {
        SubscriptionDetail {
            filter: Default::default(),
            hook_url: "http://127.0.0.1:1/hook".to_string(),
            comment: "test".to_string(),
        }
    }

    #[tokio::test]
    async fn test_create_get_activate() {
        let store = MemoryStore::new();
        let id = store.create(detail()).await.unwrap();
        assert_ne!(id, 0);

        let sub = store.get(id).await.unwrap();
        assert_eq!(sub.activate_count, 0);
        assert!(sub.last_activate_time.is_none());
        assert!(sub.valid);

        let now = Utc::now();
        store.record_activation(id, now).await.unwrap();
        let sub = store.get(id).await.unwrap();
        assert_eq!(sub.activate_count, 1);
        assert_eq!(sub.last_activate_time, Some(now));
    }

    #[tokio::test]
    async fn test_list_all_and_invalidate() {
        let store = MemoryStore::new();
        let a = store.create(detail()).await.unwrap();
        let b = store.create(detail()).await.unwrap();
        store.invalidate(a).await.unwrap();

        let all = store.list_all().await.unwrap();
        assert_eq!(all.len(), 2);
        assert!(!all.iter().find(|s| s.id == a).unwrap().valid);
        assert!(all.iter().find(|s| s.id == b).unwrap().valid);
    }

    #[tokio::test]
    async fn test_missing_ids_are_not_found() {
        let store = MemoryStore::new();
        assert!(matches!(store.get(7).await, Err(StoreError::NotFound(7))));
        assert!(matches!(store.invalidate(7).await, Err(StoreError::NotFound(7))));
        assert!(matches!(store.record_activation(7, Utc::now()).await, Err(StoreError::NotFound(7))));
    }
}
