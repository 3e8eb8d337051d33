//! # Gerrit Observatory Engine
//!
//! Ingests the `gerrit stream-events` feed, matches every event against the
//! filters of independently registered subscriptions and forwards matches to
//! webhook endpoints. Delivery is best-effort: one slow subscriber never stalls
//! ingestion or the other subscribers.
//!
//! Data flow: `ingestors` -> bounded event queue -> `core::Dispatcher` ->
//! `core::Registry` -> per-agent bounded inbox -> `core::SubscriberAgent` ->
//! `retrieve::WebhookClient`.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

// Declare the modules to re-export
pub mod connections;
pub mod core;
pub mod document;
pub mod filter;
pub mod ingestors;
pub mod retrieve;

// Re-export the types the server wires together
pub use connections::store::{
    Subscription, SubscriptionDetail, SubscriptionId, SubscriptionStore, StoreError,
};
pub use connections::store_memory::MemoryStore;
pub use crate::core::{
    AgentExit, AgentReport, DispatchReport, Dispatcher, Registry, RegistryConfig, RegistryError, RestoreReport,
};
pub use document::{Document, SharedEvent};
pub use filter::{compile, compile_value, matches, CompiledFilter, FilterError};
pub use ingestors::{EventStream, EventStreamConfig, IngestError};
pub use retrieve::webhook::{DeliveryError, WebhookClient};
