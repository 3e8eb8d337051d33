//! # Core Engine Module
//!
//! Fan-out of ingested events to subscriber agents.
//!
//! ## Core Components:
//!
//! - **`dispatcher`**: the single task reading the inbound event queue. It wraps
//!   every event in an `Arc` once, so all agents share one allocation.
//!
//! - **`registry`**: the set of live agents keyed by subscription id. Pushes into
//!   agent inboxes never wait: an agent with a full inbox misses the event and
//!   nobody else notices.
//!
//! - **`agent`**: one task per subscription, matching its filter and POSTing
//!   matches to the webhook.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Per-subscription consuming task.
pub mod agent;
/// The inbound queue reader.
pub mod dispatcher;
/// Live agents keyed by subscription id.
pub mod registry;

// --- Public API Re-exports ---
pub use agent::{AgentReport, SubscriberAgent};
pub use dispatcher::{DispatchTotals, Dispatcher};
pub use registry::{AgentExit, DispatchReport, Registry, RegistryConfig, RegistryError, RestoreReport};
