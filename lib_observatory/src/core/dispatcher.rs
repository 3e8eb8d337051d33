//! # Event Dispatcher
//!
//! The single reader of the inbound event queue. Each decoded document is
//! wrapped in an `Arc` once and handed to [`Registry::dispatch`], which offers
//! the same allocation to every agent. Since there is exactly one reader, agents
//! see events in the order they were decoded from the stream.

use std::sync::Arc;

use tokio::sync::mpsc;

use super::registry::Registry;
use crate::document::Document;

/// Running totals kept by the dispatcher.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchTotals {
    /// Events read from the queue.
    pub events: u64,
    /// Inbox pushes that succeeded, summed over agents.
    pub delivered: u64,
    /// Inbox pushes dropped because an inbox was full or gone.
    pub dropped: u64,
}

/// Drains the inbound queue into the registry.
pub struct Dispatcher {
    registry: Arc<Registry>,
    events: mpsc::Receiver<Document>,
}

impl Dispatcher {
    /// Creates a dispatcher reading `events`.
    pub fn new(registry: Arc<Registry>, events: mpsc::Receiver<Document>) -> Self {
        Self { registry, events }
    }

    /// Runs until every sender of the queue is gone.
    pub async fn run(mut self) -> DispatchTotals {
        let mut totals = DispatchTotals::default();
        tracing::info!(target: "dispatch", "dispatcher started");

        while let Some(doc) = self.events.recv().await {
            let report = self.registry.dispatch(Arc::new(doc)).await;
            totals.events += 1;
            totals.delivered += report.delivered as u64;
            totals.dropped += report.dropped as u64;
        }

        tracing::info!(
            target: "dispatch",
            "event queue closed after {} events ({} inbox pushes, {} dropped)",
            totals.events,
            totals.delivered,
            totals.dropped
        );
        totals
    }
}
