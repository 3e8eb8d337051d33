//! # Event Documents
//!
//! One decoded message from the review-event stream. The tree is
//! `serde_json::Value` built with `arbitrary_precision`, so `Number` leaves keep
//! their decimal text: change numbers and timestamps compare exactly against
//! filter literals and are re-serialized byte for byte when delivered.

use std::sync::Arc;

/// A decoded event or filter tree.
pub type Document = serde_json::Value;

/// An immutable event shared by reference between every agent that receives it.
pub type SharedEvent = Arc<Document>;

/// Returns the `type` discriminator Gerrit puts on every event, if present.
pub fn event_type(doc: &Document) -> Option<&str> {
    doc.get("type").and_then(|v| v.as_str())
}
