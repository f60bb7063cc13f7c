use serde_json::{json, Value};

/// Canonical identity of a query + variables pair, used to deduplicate
/// request-response exchanges and to identify subscriptions on the wire.
///
/// The three components are serialized as a JSON array, so no delimiter can
/// collide with content, and canonicalization (RFC 8785) makes the key
/// independent of variable-map insertion order. Total: falls back to plain
/// serialization, then to a debug rendering, rather than failing.
pub fn request_key(query: &str, variables: &Value, operation_name: Option<&str>) -> String {
    let envelope = json!([query, variables, operation_name]);
    serde_jcs::to_string(&envelope)
        .or_else(|_| serde_json::to_string(&envelope))
        .unwrap_or_else(|_| format!("{query}\u{1f}{variables}\u{1f}{operation_name:?}"))
}
