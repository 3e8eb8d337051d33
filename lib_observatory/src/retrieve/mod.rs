//! # Delivery Module
//!
//! Outbound HTTP used by subscriber agents. Kept apart from the agents so the
//! request shape (method, headers, success range) is defined in one place.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Fire-and-forget webhook POST client.
pub mod webhook;
