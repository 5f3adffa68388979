//! 5e rules data: normalization, merging, table reading, search, and class
//! export over a local copy of the 5etools `data/` folder.
//!
//! Raw records stay as `serde_json::Value` because the source files are
//! heterogeneous; [`normalize::NormalizedRecord`] is the uniform typed view.

pub mod class_export;
pub mod merge;
pub mod normalize;
pub mod search;
pub mod table;

use serde_json::Value;

/// JavaScript-style truthiness of a JSON value (absent counts as false).
pub(crate) fn truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().map(|f| f != 0.0 && !f.is_nan()).unwrap_or(true),
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Array(_)) | Some(Value::Object(_)) => true,
    }
}

/// Lowercase and drop everything but `a-z0-9`.
pub fn compact(text: &str) -> String {
    text.chars()
        .flat_map(char::to_lowercase)
        .filter(|c| c.is_ascii_alphanumeric())
        .collect()
}

/// Lowercase alphanumeric tokens of a text.
pub fn tokens(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// Render a value for search and display: strings as-is, arrays of
/// strings space-joined, everything else as JSON.
pub(crate) fn field_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Array(items) => items
            .iter()
            .map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join(" "),
        Value::Object(_) => value.to_string(),
    }
}
