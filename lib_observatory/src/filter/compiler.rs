use regex::Regex;
use serde_json::{Map, Value};
use thiserror::Error;

use super::{CompiledFilter, Constraint};

/// Errors raised while compiling a filter spec.
#[derive(Debug, Error)]
pub enum FilterError {
    /// A string leaf is not a valid regular expression.
    #[error("invalid pattern at '{path}': {source}")]
    InvalidPattern {
        /// Dotted key path of the offending leaf.
        path: String,
        /// The regex parser's complaint.
        #[source]
        source: regex::Error,
    },

    /// The spec itself is not an object.
    #[error("filter must be a JSON object, got {0}")]
    NotAnObject(&'static str),
}

/// Compiles a raw spec. All-or-nothing: the first bad pattern fails the call.
pub fn compile(spec: &Map<String, Value>) -> Result<CompiledFilter, FilterError> {
    compile_at(spec, "")
}

/// Like [`compile`], but accepts any value and rejects non-objects.
pub fn compile_value(spec: &Value) -> Result<CompiledFilter, FilterError> {
    match spec {
        Value::Object(map) => compile(map),
        other => Err(FilterError::NotAnObject(kind_of(other))),
    }
}

fn compile_at(spec: &Map<String, Value>, prefix: &str) -> Result<CompiledFilter, FilterError> {
    let mut filter = CompiledFilter::default();
    for (key, value) in spec {
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{}.{}", prefix, key)
        };
        let constraint = match value {
            Value::Object(nested) => Constraint::Nested(compile_at(nested, &path)?),
            Value::String(pattern) => {
                let re = Regex::new(pattern)
                    .map_err(|source| FilterError::InvalidPattern { path, source })?;
                Constraint::Pattern(re)
            }
            literal => Constraint::Literal(literal.clone()),
        };
        filter.push(key.clone(), constraint);
    }
    Ok(filter)
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
