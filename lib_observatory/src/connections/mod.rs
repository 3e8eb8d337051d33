//! # Connections Module
//!
//! The subscription store collaborator: the interface the engine depends on and
//! its implementations.

/// The `SubscriptionStore` trait and the subscription record types.
pub mod store;

/// Process-local store used by tests and Redis-less deployments.
pub mod store_memory;

/// Redis-backed store: `subscribe:{id}` hashes plus an id counter.
#[cfg(feature = "connections")]
pub mod store_redis;
