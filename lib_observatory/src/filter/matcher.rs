use serde_json::Value;

use super::{CompiledFilter, Constraint};
use crate::document::Document;

/// Returns true when every constraint of `filter` holds on `doc`.
///
/// Pure and deterministic. A missing key, a type mismatch or a failed pattern
/// search is simply a non-match, never an error.
pub fn matches(filter: &CompiledFilter, doc: &Document) -> bool {
    filter.matches(doc)
}

impl CompiledFilter {
    /// Evaluates this filter against `doc`, short-circuiting on the first miss.
    pub fn matches(&self, doc: &Document) -> bool {
        if self.is_empty() {
            return true;
        }
        let Value::Object(fields) = doc else {
            return false;
        };
        self.constraints().all(|(key, constraint)| match fields.get(key) {
            None => false,
            Some(value) => constraint.holds(value),
        })
    }
}

impl Constraint {
    fn holds(&self, value: &Value) -> bool {
        match self {
            Constraint::Nested(inner) => value.is_object() && inner.matches(value),
            Constraint::Pattern(re) => value.as_str().is_some_and(|s| re.is_match(s)),
            Constraint::Literal(expected) => expected == value,
        }
    }
}
