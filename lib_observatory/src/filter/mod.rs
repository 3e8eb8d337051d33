//! # Subscription Filters
//!
//! A filter spec mirrors the shape of the events it selects. Every key it lists
//! is a constraint on the same key of the event; keys it does not list are
//! ignored. Leaves are interpreted as follows:
//!
//! - **object**: matched recursively against the event's sub-object.
//! - **string**: a regular expression, searched (unanchored) in a string leaf.
//! - **anything else**: a literal compared by type and value.
//!
//! ```json
//! {
//!   "type": "(patchset-created|ref-updated)",
//!   "change": { "branch": "release-.+", "project": "loki" }
//! }
//! ```
//!
//! Compilation happens once, when the subscription is registered; an invalid
//! pattern fails the whole spec before any event is matched.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Turns a raw spec into a `CompiledFilter`.
pub mod compiler;
/// Evaluates a `CompiledFilter` against an event.
pub mod matcher;

pub use compiler::{compile, compile_value, FilterError};
pub use matcher::matches;

use regex::Regex;
use serde_json::Value;

/// One compiled constraint on a single key.
#[derive(Debug, Clone)]
pub enum Constraint {
    /// The event value must be an object satisfying the nested filter.
    Nested(CompiledFilter),
    /// The event value must be a string containing a match of the pattern.
    Pattern(Regex),
    /// The event value must equal this value exactly.
    Literal(Value),
}

/// A conjunction of per-key constraints. The empty filter matches everything.
#[derive(Debug, Clone, Default)]
pub struct CompiledFilter {
    constraints: Vec<(String, Constraint)>,
}

impl CompiledFilter {
    /// Number of keys constrained at this level.
    pub fn len(&self) -> usize {
        self.constraints.len()
    }

    /// True when this level imposes no constraint.
    pub fn is_empty(&self) -> bool {
        self.constraints.is_empty()
    }

    /// Iterates the constraints at this level.
    pub fn constraints(&self) -> impl Iterator<Item = (&str, &Constraint)> {
        self.constraints.iter().map(|(k, c)| (k.as_str(), c))
    }

    pub(crate) fn push(&mut self, key: String, constraint: Constraint) {
        self.constraints.push((key, constraint));
    }
}
