//! # Subscriber Agent
//!
//! One task per subscription. It drains its private inbox in order, matches
//! each event against the compiled filter and POSTs matches to the hook. The
//! inbox closing is its only stop signal; once the remaining events are drained
//! the agent reports its counters through a one-shot channel and exits. It never
//! touches the registry.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};

use crate::connections::store::{Subscription, SubscriptionStore};
use crate::document::{event_type, SharedEvent};
use crate::filter::CompiledFilter;
use crate::retrieve::webhook::WebhookClient;

/// Counters an agent reports when it stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AgentReport {
    /// Events taken from the inbox.
    pub processed: u64,
    /// Events that matched the filter.
    pub matched: u64,
    /// Matched events the hook accepted.
    pub delivered: u64,
}

/// The consuming side of one registry entry.
pub struct SubscriberAgent {
    subscription: Subscription,
    filter: CompiledFilter,
    inbox: mpsc::Receiver<SharedEvent>,
    webhook: WebhookClient,
    store: Arc<dyn SubscriptionStore>,
    done: oneshot::Sender<AgentReport>,
}

impl SubscriberAgent {
    /// Assembles an agent; nothing runs until [`SubscriberAgent::run`].
    pub fn new(
        subscription: Subscription,
        filter: CompiledFilter,
        inbox: mpsc::Receiver<SharedEvent>,
        webhook: WebhookClient,
        store: Arc<dyn SubscriptionStore>,
        done: oneshot::Sender<AgentReport>,
    ) -> Self {
        Self {
            subscription,
            filter,
            inbox,
            webhook,
            store,
            done,
        }
    }

    /// Consumes the inbox until it is closed and drained.
    pub async fn run(mut self) {
        let id = self.subscription.id;
        let mut report = AgentReport::default();
        tracing::info!(target: "agent", "subscriber {} started, hook {}", id, self.subscription.detail.hook_url);

        while let Some(event) = self.inbox.recv().await {
            report.processed += 1;
            let kind = event_type(&event).unwrap_or("<none>");

            if !self.filter.matches(&event) {
                tracing::debug!(target: "agent", "subscriber {}: event {} does not match", id, kind);
                continue;
            }
            report.matched += 1;

            let hook = self.subscription.detail.hook_url.as_str();
            match self.webhook.deliver(hook, &event).await {
                Ok(status) => {
                    report.delivered += 1;
                    tracing::info!(target: "agent", "subscriber {}: delivered {} to {} ({})", id, kind, hook, status);
                }
                Err(e) => {
                    tracing::warn!(target: "agent", "subscriber {}: delivery of {} to {} failed: {}", id, kind, hook, e);
                }
            }

            // Bookkeeping follows every match, delivered or not.
            let now = Utc::now();
            self.subscription.activate_count += 1;
            self.subscription.last_activate_time = Some(now);
            if let Err(e) = self.store.record_activation(id, now).await {
                tracing::warn!(target: "agent", "subscriber {}: failed to record activation: {}", id, e);
            }
        }

        tracing::info!(
            target: "agent",
            "subscriber {} stopped after {} events ({} matched, {} delivered)",
            id,
            report.processed,
            report.matched,
            report.delivered
        );
        // Nobody may be waiting on the exit handle.
        let _ = self.done.send(report);
    }
}
