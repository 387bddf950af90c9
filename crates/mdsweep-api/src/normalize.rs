// Response key normalization.
//
// Controller responses use human-oriented record keys ("IP Address",
// "Profile Status") that are awkward to address from path expressions.
// Every run of non-alphanumeric characters becomes a single underscore
// and trailing underscores are dropped; leading underscores are kept
// because the API itself uses them ("_data", "_global_result").
// Applied exactly once, right after decoding, before any filter runs.

use serde_json::Value;

/// Rewrite all record keys in `value`, recursively.
pub fn normalize_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (normalize_key(&k), normalize_keys(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(normalize_keys).collect()),
        other => other,
    }
}

/// Normalize a single key.
///
/// Separator runs collapse lazily: a run only becomes an underscore when
/// another alphanumeric follows it, so trailing runs never materialize.
fn normalize_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    let mut gap = false;
    for ch in key.chars() {
        if ch.is_ascii_alphanumeric() {
            if gap {
                out.push('_');
                gap = false;
            }
            out.push(ch);
        } else {
            gap = true;
        }
    }
    out
}
