//! JSON-pointer extraction helpers used by the offset state machine,
//! the record extractor, and the chaining engine. Thin wrappers over
//! `serde_json::Value::pointer` that turn "missing" into the
//! `ConnectError::Parse` class `spec.md` §7 requires.

use serde_json::Value;

use crate::error::ConnectError;

/// Extract the array of records at `pointer` from a response body.
/// Returns an empty slice (not an error) when the pointer resolves to
/// an empty array, but a `Parse` error when it resolves to nothing or
/// to something that isn't an array — a parse failure on the page
/// itself never advances the offset (`spec.md` §4.3).
pub fn extract_records<'a>(
    body: &'a Value,
    pointer: &str,
    endpoint_id: &str,
) -> Result<&'a [Value], ConnectError> {
    match body.pointer(pointer) {
        Some(Value::Array(items)) => Ok(items.as_slice()),
        Some(_) => Err(ConnectError::Parse {
            endpoint_id: endpoint_id.to_string(),
            message: format!("{pointer} did not resolve to an array"),
        }),
        None => Err(ConnectError::Parse {
            endpoint_id: endpoint_id.to_string(),
            message: format!("{pointer} not found in response body"),
        }),
    }
}

/// Look up an optional string field by pointer (used for next-page
/// cursors, OData links, chaining values). Missing or non-string
/// values are both treated as "absent", matching the pagination
/// table's "null/missing -> exhausted" rule.
pub fn extract_optional_str(body: &Value, pointer: &str) -> Option<String> {
    body.pointer(pointer).and_then(|v| match v {
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    })
}

pub fn extract_optional_u64(body: &Value, pointer: &str) -> Option<u64> {
    body.pointer(pointer).and_then(|v| v.as_u64())
}
