//! # Subscription Store Interface
//!
//! The durable record of subscriptions lives outside the engine. The engine
//! reads a snapshot when it starts an agent and writes back only two things:
//! the invalidation performed by a removal and the activation bookkeeping of a
//! matched event.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Unique handle of a subscription, allocated by the store.
pub type SubscriptionId = i64;

/// Errors surfaced by a subscription store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No subscription with this id exists.
    #[error("subscription {0} not found")]
    NotFound(SubscriptionId),

    /// The backing service failed (connection, protocol, command).
    #[error("store backend failure: {0}")]
    Backend(String),

    /// A persisted record could not be decoded.
    #[error("subscription {id} is corrupt: {reason}")]
    Corrupt {
        /// Id of the unreadable record.
        id: SubscriptionId,
        /// What was wrong with it.
        reason: String,
    },
}

/// The user-supplied part of a subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionDetail {
    /// Raw filter spec, compiled when the agent is built.
    #[serde(default)]
    pub filter: Map<String, Value>,
    /// Webhook receiving matched events.
    pub hook_url: String,
    /// Free text describing what the subscription is for.
    #[serde(default)]
    pub comment: String,
}

/// A persisted subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    /// Store-allocated handle.
    pub id: SubscriptionId,
    /// Filter, hook and comment.
    pub detail: SubscriptionDetail,
    /// When the subscription was created.
    pub created_time: DateTime<Utc>,
    /// When an event last matched, if ever.
    pub last_activate_time: Option<DateTime<Utc>>,
    /// How many events have matched.
    pub activate_count: u64,
    /// False once the subscription has been removed.
    pub valid: bool,
}

impl Subscription {
    /// A fresh, valid subscription that has never matched.
    pub fn new(id: SubscriptionId, detail: SubscriptionDetail, created_time: DateTime<Utc>) -> Self {
        Self {
            id,
            detail,
            created_time,
            last_activate_time: None,
            activate_count: 0,
            valid: true,
        }
    }
}

/// Operations the engine and the admin API need from the durable store.
///
/// Implementations serialize their own per-key operations; callers treat each
/// method as atomic.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// Persists a new subscription and returns its id.
    async fn create(&self, detail: SubscriptionDetail) -> Result<SubscriptionId, StoreError>;

    /// Reads one subscription.
    async fn get(&self, id: SubscriptionId) -> Result<Subscription, StoreError>;

    /// Reads every persisted subscription, valid or not.
    async fn list_all(&self) -> Result<Vec<Subscription>, StoreError>;

    /// Marks a subscription invalid.
    async fn invalidate(&self, id: SubscriptionId) -> Result<(), StoreError>;

    /// Increments the activation count and stamps the activation time.
    async fn record_activation(&self, id: SubscriptionId, at: DateTime<Utc>) -> Result<(), StoreError>;
}
