// Attribute projection.
//
// Turns an arbitrary response tree into an ordered sequence of display
// lines. Line-filter stages use the attribute-free form; the `> a,b,c`
// task suffix uses the attribute form, which renders one `;`-joined line
// per record so output pastes straight into a spreadsheet.

use serde_json::Value;

use crate::error::CoreError;

/// Placeholder emitted for attribute values that are themselves records
/// or sequences.
const OPAQUE: &str = "{Object}";

/// Project a tree into lines.
///
/// With `attrs`, each record renders as exactly one line: the named
/// fields' string forms joined by `;` in the requested order, a missing
/// field contributing an empty segment. Without `attrs`, records fall
/// back to a pretty-printed dump.
pub fn project(value: &Value, attrs: Option<&[String]>) -> Result<Vec<String>, CoreError> {
    match value {
        Value::String(s) => Ok(s.split('\n').map(ToOwned::to_owned).collect()),
        Value::Array(items) => {
            let mut lines = Vec::with_capacity(items.len());
            for item in items {
                lines.extend(project(item, attrs)?);
            }
            Ok(lines)
        }
        Value::Object(map) => {
            // A single-field "_" record is the transparent wrap around a
            // top-level sequence; unwrap it before projecting.
            if map.len() == 1 {
                if let Some(inner) = map.get("_") {
                    return project(inner, attrs);
                }
            }
            match attrs {
                Some(attrs) => {
                    let segments: Vec<String> = attrs
                        .iter()
                        .map(|attr| attr_segment(map.get(attr)))
                        .collect();
                    Ok(vec![segments.join(";")])
                }
                None => {
                    let dump = serde_json::to_string_pretty(value)
                        .map_err(|e| CoreError::Internal(format!("record dump failed: {e}")))?;
                    Ok(dump.split('\n').map(ToOwned::to_owned).collect())
                }
            }
        }
        Value::Bool(b) => Ok(vec![b.to_string()]),
        Value::Number(n) => Ok(vec![n.to_string()]),
        Value::Null => Ok(vec!["null".to_owned()]),
    }
}

fn attr_segment(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        Some(Value::Array(_) | Value::Object(_)) => OPAQUE.to_owned(),
    }
}
