//! # Dispatch Registry
//!
//! The authoritative set of live subscriber agents, keyed by subscription id.
//! The registry is the only writer of its map: `add` inserts, `remove` erases,
//! and agents learn they must stop solely from their inbox closing. A
//! `tokio::sync::Mutex` guards the map so `remove` can hold it across the store
//! invalidation; `dispatch` holds it for the fan-out, so once `remove` returns no
//! later event can reach the removed agent.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, Mutex};

use super::agent::{AgentReport, SubscriberAgent};
use crate::connections::store::{StoreError, Subscription, SubscriptionId, SubscriptionStore};
use crate::document::{event_type, SharedEvent};
use crate::filter::{compile, FilterError};
use crate::retrieve::webhook::{DeliveryError, WebhookClient};

/// Default bound of every agent inbox.
pub const DEFAULT_INBOX_CAPACITY: usize = 100;
/// Default per-request webhook timeout.
pub const DEFAULT_POST_TIMEOUT: Duration = Duration::from_secs(60);

/// Registry tuning.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Events an agent may have queued before new ones are dropped for it.
    pub inbox_capacity: usize,
    /// Per-request timeout of webhook POSTs.
    pub post_timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            inbox_capacity: DEFAULT_INBOX_CAPACITY,
            post_timeout: DEFAULT_POST_TIMEOUT,
        }
    }
}

/// Failures of registry operations. None of them changes registry state.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// An agent for this id is already registered.
    #[error("subscription {0} is already registered")]
    DuplicateId(SubscriptionId),

    /// No agent is registered for this id.
    #[error("subscription {0} is not registered")]
    NotFound(SubscriptionId),

    /// The registered subscription is already invalid.
    #[error("subscription {0} is already invalid")]
    AlreadyInvalid(SubscriptionId),

    /// The store refused the invalidation; the entry is kept.
    #[error("store failure: {0}")]
    Store(#[from] StoreError),

    /// The subscription's filter does not compile.
    #[error("subscription {id} has an invalid filter: {source}")]
    Filter {
        /// Offending subscription.
        id: SubscriptionId,
        /// Compiler error.
        #[source]
        source: FilterError,
    },

    /// The shared webhook client could not be built.
    #[error("cannot build webhook client: {0}")]
    HttpClient(#[from] DeliveryError),
}

/// Outcome of fanning one event out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Agents whose inbox accepted the event.
    pub delivered: usize,
    /// Agents that missed it because their inbox was full or gone.
    pub dropped: usize,
}

/// Outcome of a startup restore.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreReport {
    /// Subscriptions whose agent is now running.
    pub restored: usize,
    /// Subscriptions already invalid in the store.
    pub inactive: usize,
    /// Valid subscriptions that could not be registered (bad filter, duplicate id).
    pub skipped: usize,
}

/// Completion handle of a removed agent.
///
/// The agent keeps draining events already in its inbox, so the report arrives
/// once those are processed (in-flight POSTs run to completion or time out).
#[derive(Debug)]
pub struct AgentExit {
    id: SubscriptionId,
    done: oneshot::Receiver<AgentReport>,
}

impl AgentExit {
    /// Id of the removed subscription.
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Waits for the agent to finish. `None` if its task died without reporting.
    pub async fn wait(self) -> Option<AgentReport> {
        self.done.await.ok()
    }
}

struct Entry {
    inbox: mpsc::Sender<SharedEvent>,
    valid: bool,
    done: oneshot::Receiver<AgentReport>,
}

/// The set of live subscriber agents.
pub struct Registry {
    entries: Mutex<HashMap<SubscriptionId, Entry>>,
    store: Arc<dyn SubscriptionStore>,
    webhook: WebhookClient,
    config: RegistryConfig,
}

impl Registry {
    /// Creates an empty registry writing bookkeeping to `store`.
    pub fn new(store: Arc<dyn SubscriptionStore>, config: RegistryConfig) -> Result<Self, RegistryError> {
        let webhook = WebhookClient::new(config.post_timeout)?;
        Ok(Self {
            entries: Mutex::new(HashMap::new()),
            store,
            webhook,
            config,
        })
    }

    /// Compiles the subscription's filter and starts its agent.
    pub async fn add(&self, subscription: Subscription) -> Result<(), RegistryError> {
        let id = subscription.id;
        let mut entries = self.entries.lock().await;
        if entries.contains_key(&id) {
            return Err(RegistryError::DuplicateId(id));
        }

        let filter = compile(&subscription.detail.filter).map_err(|source| RegistryError::Filter { id, source })?;
        let (inbox, rx) = mpsc::channel(self.config.inbox_capacity.max(1));
        let (done_tx, done) = oneshot::channel();
        let valid = subscription.valid;
        let agent = SubscriberAgent::new(
            subscription,
            filter,
            rx,
            self.webhook.clone(),
            Arc::clone(&self.store),
            done_tx,
        );
        tokio::spawn(agent.run());

        entries.insert(id, Entry { inbox, valid, done });
        tracing::info!(target: "registry", "registered subscription {} ({} active)", id, entries.len());
        Ok(())
    }

    /// Invalidates the subscription in the store, then erases its entry and
    /// closes the agent's inbox.
    pub async fn remove(&self, id: SubscriptionId) -> Result<AgentExit, RegistryError> {
        let mut entries = self.entries.lock().await;
        match entries.get(&id) {
            None => return Err(RegistryError::NotFound(id)),
            Some(entry) if !entry.valid => return Err(RegistryError::AlreadyInvalid(id)),
            Some(_) => {}
        }

        // Held lock: nobody sees the entry between these two steps.
        if let Err(e) = self.store.invalidate(id).await {
            tracing::warn!(target: "registry", "removal of subscription {} aborted: {}", id, e);
            return Err(e.into());
        }

        let Some(entry) = entries.remove(&id) else {
            return Err(RegistryError::NotFound(id));
        };
        // Dropping the only sender closes the inbox.
        drop(entry.inbox);
        tracing::info!(target: "registry", "removed subscription {} ({} active)", id, entries.len());
        Ok(AgentExit { id, done: entry.done })
    }

    /// Offers `event` to every valid agent without waiting on any of them.
    pub async fn dispatch(&self, event: SharedEvent) -> DispatchReport {
        let entries = self.entries.lock().await;
        let mut report = DispatchReport::default();

        for (id, entry) in entries.iter().filter(|(_, e)| e.valid) {
            match entry.inbox.try_send(Arc::clone(&event)) {
                Ok(()) => report.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    report.dropped += 1;
                    tracing::warn!(
                        target: "registry",
                        "inbox of subscription {} is full, dropping {} event",
                        id,
                        event_type(&event).unwrap_or("<none>")
                    );
                }
                Err(TrySendError::Closed(_)) => {
                    report.dropped += 1;
                    tracing::warn!(target: "registry", "agent of subscription {} is gone", id);
                }
            }
        }
        report
    }

    /// Registers every valid subscription from a startup listing.
    ///
    /// A subscription that cannot be registered is logged and skipped; the rest
    /// are still restored.
    pub async fn restore(&self, subscriptions: Vec<Subscription>) -> RestoreReport {
        let mut report = RestoreReport::default();
        for subscription in subscriptions {
            let id = subscription.id;
            if !subscription.valid {
                tracing::debug!(target: "registry", "skipping invalid subscription {}", id);
                report.inactive += 1;
                continue;
            }
            match self.add(subscription).await {
                Ok(()) => report.restored += 1,
                Err(e) => {
                    tracing::error!(target: "registry", "cannot restore subscription {}: {}", id, e);
                    report.skipped += 1;
                }
            }
        }
        tracing::info!(
            target: "registry",
            "restored {} subscriptions ({} inactive, {} skipped)",
            report.restored,
            report.inactive,
            report.skipped
        );
        report
    }

    /// Registered ids, ascending.
    pub async fn ids(&self) -> Vec<SubscriptionId> {
        let mut ids: Vec<_> = self.entries.lock().await.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Number of registered agents.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// True when no agent is registered.
    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// The subscription store the registry writes to.
    pub fn store(&self) -> &Arc<dyn SubscriptionStore> {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connections::store::SubscriptionDetail;
    use crate::connections::store_memory::MemoryStore;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::Semaphore;

    /// Memory store whose invalidation can be made to fail and whose
    /// activation recording can be held back.
    struct FlakyStore {
        inner: MemoryStore,
        fail_invalidate: AtomicBool,
        activation_gate: Semaphore,
    }

    impl FlakyStore {
        fn new(open: bool) -> Self {
            Self {
                inner: MemoryStore::new(),
                fail_invalidate: AtomicBool::new(false),
                activation_gate: Semaphore::new(if open { Semaphore::MAX_PERMITS } else { 0 }),
            }
        }
    }

    #[async_trait]
    impl SubscriptionStore for FlakyStore {
        async fn create(&self, detail: SubscriptionDetail) -> Result<SubscriptionId, StoreError> {
            self.inner.create(detail).await
        }

        async fn get(&self, id: SubscriptionId) -> Result<Subscription, StoreError> {
            self.inner.get(id).await
        }

        async fn list_all(&self) -> Result<Vec<Subscription>, StoreError> {
            self.inner.list_all().await
        }

        async fn invalidate(&self, id: SubscriptionId) -> Result<(), StoreError> {
            if self.fail_invalidate.load(Ordering::SeqCst) {
                return Err(StoreError::Backend("connection refused".to_string()));
            }
            self.inner.invalidate(id).await
        }

        async fn record_activation(&self, id: SubscriptionId, at: DateTime<Utc>) -> Result<(), StoreError> {
            self.activation_gate.acquire().await.unwrap().forget();
            self.inner.record_activation(id, at).await
        }
    }

    const DEAD_HOOK: &str = "http://127.0.0.1:1/hook";

    async fn subscription(store: &FlakyStore, filter: serde_json::Value) -> Subscription {
        let detail = SubscriptionDetail {
            filter: filter.as_object().cloned().unwrap(),
            hook_url: DEAD_HOOK.to_string(),
            comment: String::new(),
        };
        let id = store.create(detail).await.unwrap();
        store.get(id).await.unwrap()
    }

    fn registry(store: Arc<FlakyStore>, inbox_capacity: usize) -> Registry {
        let config = RegistryConfig {
            inbox_capacity,
            post_timeout: Duration::from_secs(2),
        };
        Registry::new(store, config).unwrap()
    }

    fn event(kind: &str) -> SharedEvent {
        Arc::new(json!({"type": kind}))
    }

    #[tokio::test]
    async fn test_duplicate_add_keeps_existing_entry() {
        let store = Arc::new(FlakyStore::new(true));
        let registry = registry(Arc::clone(&store), 10);
        let sub = subscription(&store, json!({})).await;

        registry.add(sub.clone()).await.unwrap();
        let err = registry.add(sub.clone()).await.unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateId(id) if id == sub.id));
        assert_eq!(registry.ids().await, vec![sub.id]);
        assert_eq!(registry.dispatch(event("x")).await.delivered, 1);
    }

    #[tokio::test]
    async fn test_invalid_filter_is_rejected() {
        let store = Arc::new(FlakyStore::new(true));
        let registry = registry(Arc::clone(&store), 10);
        let sub = subscription(&store, json!({"branch": "release-(.+"})).await;

        assert!(matches!(registry.add(sub).await, Err(RegistryError::Filter { .. })));
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_remove_missing_and_already_invalid() {
        let store = Arc::new(FlakyStore::new(true));
        let registry = registry(Arc::clone(&store), 10);
        assert!(matches!(registry.remove(42).await, Err(RegistryError::NotFound(42))));

        let mut sub = subscription(&store, json!({})).await;
        sub.valid = false;
        let id = sub.id;
        registry.add(sub).await.unwrap();

        assert!(matches!(registry.remove(id).await, Err(RegistryError::AlreadyInvalid(_))));
        assert_eq!(registry.len().await, 1);
        // Invalid entries receive nothing.
        assert_eq!(registry.dispatch(event("x")).await, DispatchReport::default());
    }

    #[tokio::test]
    async fn test_store_failure_keeps_entry() {
        let store = Arc::new(FlakyStore::new(true));
        let registry = registry(Arc::clone(&store), 10);
        let sub = subscription(&store, json!({})).await;
        let id = sub.id;
        registry.add(sub).await.unwrap();

        store.fail_invalidate.store(true, Ordering::SeqCst);
        assert!(matches!(registry.remove(id).await, Err(RegistryError::Store(_))));
        assert_eq!(registry.ids().await, vec![id]);
        assert!(store.get(id).await.unwrap().valid);
        assert_eq!(registry.dispatch(event("x")).await.delivered, 1);

        store.fail_invalidate.store(false, Ordering::SeqCst);
        registry.remove(id).await.unwrap();
        assert!(!store.get(id).await.unwrap().valid);
    }

    #[tokio::test]
    async fn test_removed_agent_gets_nothing_more() {
        let store = Arc::new(FlakyStore::new(true));
        let registry = registry(Arc::clone(&store), 10);
        let kept = subscription(&store, json!({"type": "never"})).await;
        let removed = subscription(&store, json!({"type": "never"})).await;
        registry.add(kept.clone()).await.unwrap();
        registry.add(removed.clone()).await.unwrap();

        assert_eq!(registry.dispatch(event("a")).await.delivered, 2);
        let exit = registry.remove(removed.id).await.unwrap();
        assert_eq!(exit.id(), removed.id);

        let report = registry.dispatch(event("b")).await;
        assert_eq!(report, DispatchReport { delivered: 1, dropped: 0 });
        assert_eq!(registry.ids().await, vec![kept.id]);

        // The removed agent saw exactly the one event dispatched before removal.
        assert_eq!(exit.wait().await.unwrap().processed, 1);
        assert!(matches!(registry.remove(removed.id).await, Err(RegistryError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_full_inbox_drops_for_that_agent_only() {
        let store = Arc::new(FlakyStore::new(false));
        let registry = registry(Arc::clone(&store), 1);
        // Matches everything, then parks on the closed activation gate.
        let stuck = subscription(&store, json!({})).await;
        // Never matches, so it never touches the gate.
        let idle = subscription(&store, json!({"type": "never"})).await;
        registry.add(stuck.clone()).await.unwrap();
        registry.add(idle.clone()).await.unwrap();

        let settle = || tokio::time::sleep(Duration::from_millis(200));

        assert_eq!(registry.dispatch(event("e1")).await.delivered, 2);
        settle().await;
        // `stuck` holds e1; its inbox slot is free again.
        assert_eq!(registry.dispatch(event("e2")).await.delivered, 2);
        settle().await;
        assert_eq!(registry.dispatch(event("e3")).await, DispatchReport { delivered: 1, dropped: 1 });

        store.activation_gate.add_permits(10);
        let stuck_report = registry.remove(stuck.id).await.unwrap().wait().await.unwrap();
        let idle_report = registry.remove(idle.id).await.unwrap().wait().await.unwrap();
        assert_eq!(stuck_report.processed, 2);
        assert_eq!(stuck_report.matched, 2);
        assert_eq!(idle_report.processed, 3);
        assert_eq!(idle_report.matched, 0);
        assert_eq!(store.get(stuck.id).await.unwrap().activate_count, 2);
    }

    #[tokio::test]
    async fn test_restore_skips_invalid() {
        let store = Arc::new(FlakyStore::new(true));
        let registry = registry(Arc::clone(&store), 10);
        let a = subscription(&store, json!({})).await;
        let b = subscription(&store, json!({})).await;
        store.invalidate(b.id).await.unwrap();

        let report = registry.restore(store.list_all().await.unwrap()).await;
        assert_eq!(report, RestoreReport { restored: 1, inactive: 1, skipped: 0 });
        assert_eq!(registry.ids().await, vec![a.id]);
    }

    #[tokio::test]
    async fn test_restore_continues_past_bad_filter() {
        let store = Arc::new(FlakyStore::new(true));
        let registry = registry(Arc::clone(&store), 10);
        let first = subscription(&store, json!({"type": "ok"})).await;
        let broken = subscription(&store, json!({"branch": "release-("})).await;
        let third = subscription(&store, json!({"type": "ok2"})).await;

        let report = registry.restore(store.list_all().await.unwrap()).await;
        assert_eq!(report, RestoreReport { restored: 2, inactive: 0, skipped: 1 });
        assert_eq!(registry.ids().await, vec![first.id, third.id]);
        // Left untouched in the store so it can still be inspected and deleted.
        assert!(store.get(broken.id).await.unwrap().valid);
    }

    #[tokio::test]
    async fn test_restore_skips_duplicate_ids() {
        let store = Arc::new(FlakyStore::new(true));
        let registry = registry(Arc::clone(&store), 10);
        let sub = subscription(&store, json!({})).await;

        let report = registry.restore(vec![sub.clone(), sub.clone()]).await;
        assert_eq!(report, RestoreReport { restored: 1, inactive: 0, skipped: 1 });
        assert_eq!(registry.ids().await, vec![sub.id]);
    }
}
