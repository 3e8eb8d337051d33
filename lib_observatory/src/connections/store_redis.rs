//! # Redis Subscription Store
//!
//! Persists each subscription as a hash at `subscribe:{id}`; ids come from the
//! `subscribe_id_index` counter. Hash fields:
//!
//! | field                | content                                 |
//! |----------------------|-----------------------------------------|
//! | `detail`             | JSON `{filter, hook_url, comment}`      |
//! | `created_time`       | RFC 3339                                |
//! | `last_activate_time` | RFC 3339, empty until the first match   |
//! | `activate_count`     | integer                                 |
//! | `valid`              | `1` or `0`                              |
//!
//! The store is an explicit handle built once at startup and passed to the
//! registry and the API; it wraps a multiplexed `ConnectionManager` that
//! reconnects on its own.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};

use super::store::{Subscription, SubscriptionDetail, SubscriptionId, SubscriptionStore, StoreError};

const SUBSCRIBE_KEY_PREFIX: &str = "subscribe:";
const ID_KEY: &str = "subscribe_id_index";

impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        StoreError::Backend(e.to_string())
    }
}

/// A `SubscriptionStore` backed by Redis hashes.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    /// Opens a managed connection to the redis server.
    ///
    /// # Arguments
    /// * `url` - The redis URL (e.g., "redis://127.0.0.1:6379/0").
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        tracing::info!(target: "store", "connected to redis at {}", url);
        Ok(Self { conn })
    }

    async fn load(&self, id: SubscriptionId) -> Result<Subscription, StoreError> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn.hgetall(key_for(id)).await?;
        if fields.is_empty() {
            return Err(StoreError::NotFound(id));
        }
        decode_record(id, &fields)
    }

    async fn ensure_exists(&self, id: SubscriptionId) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let exists: bool = conn.exists(key_for(id)).await?;
        if exists {
            Ok(())
        } else {
            Err(StoreError::NotFound(id))
        }
    }
}

#[async_trait]
impl SubscriptionStore for RedisStore {
    async fn create(&self, detail: SubscriptionDetail) -> Result<SubscriptionId, StoreError> {
        let mut conn = self.conn.clone();
        let id: SubscriptionId = conn.incr(ID_KEY, 1).await?;
        let raw_detail = serde_json::to_string(&detail).map_err(|e| StoreError::Corrupt {
            id,
            reason: e.to_string(),
        })?;
        let created_time = Utc::now().to_rfc3339();
        let _: () = conn
            .hset_multiple(
                key_for(id),
                &[
                    ("detail", raw_detail.as_str()),
                    ("created_time", created_time.as_str()),
                    ("activate_count", "0"),
                    ("last_activate_time", ""),
                    ("valid", "1"),
                ],
            )
            .await?;
        tracing::debug!(target: "store", "created subscription {}", id);
        Ok(id)
    }

    async fn get(&self, id: SubscriptionId) -> Result<Subscription, StoreError> {
        self.load(id).await
    }

    async fn list_all(&self) -> Result<Vec<Subscription>, StoreError> {
        let mut conn = self.conn.clone();
        let keys: Vec<String> = conn.keys(format!("{}*", SUBSCRIBE_KEY_PREFIX)).await?;

        let mut subscriptions = Vec::with_capacity(keys.len());
        for key in keys {
            let id = parse_key(&key).ok_or_else(|| StoreError::Backend(format!("unexpected key {}", key)))?;
            match self.load(id).await {
                Ok(sub) => subscriptions.push(sub),
                // Deleted between KEYS and HGETALL.
                Err(StoreError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        subscriptions.sort_by_key(|s| s.id);
        Ok(subscriptions)
    }

    async fn invalidate(&self, id: SubscriptionId) -> Result<(), StoreError> {
        self.ensure_exists(id).await?;
        let mut conn = self.conn.clone();
        let _: () = conn.hset(key_for(id), "valid", "0").await?;
        Ok(())
    }

    async fn record_activation(&self, id: SubscriptionId, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.ensure_exists(id).await?;
        let mut conn = self.conn.clone();
        let key = key_for(id);
        let _: () = redis::pipe()
            .atomic()
            .hset(&key, "last_activate_time", at.to_rfc3339())
            .hincr(&key, "activate_count", 1)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}

fn key_for(id: SubscriptionId) -> String {
    format!("{}{}", SUBSCRIBE_KEY_PREFIX, id)
}

fn parse_key(key: &str) -> Option<SubscriptionId> {
    key.strip_prefix(SUBSCRIBE_KEY_PREFIX)?.parse().ok()
}

fn decode_record(id: SubscriptionId, fields: &HashMap<String, String>) -> Result<Subscription, StoreError> {
    let corrupt = |reason: String| StoreError::Corrupt { id, reason };
    let field = |name: &str| fields.get(name).map(String::as_str).unwrap_or("");

    let detail: SubscriptionDetail =
        serde_json::from_str(field("detail")).map_err(|e| corrupt(format!("detail: {}", e)))?;
    let created_time = parse_time(field("created_time"))
        .map_err(|e| corrupt(format!("created_time: {}", e)))?
        .ok_or_else(|| corrupt("created_time is empty".to_string()))?;
    let last_activate_time =
        parse_time(field("last_activate_time")).map_err(|e| corrupt(format!("last_activate_time: {}", e)))?;
    let activate_count = match field("activate_count") {
        "" => 0,
        raw => raw.parse().map_err(|e| corrupt(format!("activate_count: {}", e)))?,
    };
    let valid = matches!(field("valid"), "1" | "true");

    Ok(Subscription {
        id,
        detail,
        created_time,
        last_activate_time,
        activate_count,
        valid,
    })
}

fn parse_time(raw: &str) -> Result<Option<DateTime<Utc>>, chrono::ParseError> {
    if raw.is_empty() {
        return Ok(None);
    }
    Ok(Some(DateTime::parse_from_rfc3339(raw)?.with_timezone(&Utc)))
}
