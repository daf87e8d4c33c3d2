//! Metadata extraction with legacy fallback probes
//!
//! Envelope metadata is a nested tree. The global routing fields live under
//! one of three branches, probed in order:
//! 1. `global_context` (current)
//! 2. `service_specific.global_context` (nested)
//! 3. `service_specific.global` (legacy)
//!
//! The first branch that is a non-empty object wins. Missing fields fall back
//! to `campaign_id = "0"` and `source = "unknown"`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Campaign id assigned when no branch carries one
pub const DEFAULT_CAMPAIGN_ID: &str = "0";

/// Source assigned when no branch carries one
pub const DEFAULT_SOURCE: &str = "unknown";

/// The global routing fields carried in envelope metadata
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalContext {
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub campaign_id: String,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub device_id: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub correlation_id: String,
}

/// Walk a path of object keys, returning the value at the end if every hop
/// exists.
pub fn get_path<'a>(root: &'a Value, path: &[&str]) -> Option<&'a Value> {
    let mut current = root;
    for key in path {
        current = current.as_object()?.get(*key)?;
    }
    Some(current)
}

/// Read a non-empty string at a path.
pub fn get_string(root: &Value, path: &[&str]) -> Option<String> {
    match get_path(root, path)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}

/// Walk (and create) a path of object keys, returning the object at the end.
/// Non-object values along the way are replaced.
pub fn ensure_object_mut<'a>(root: &'a mut Value, path: &[&str]) -> &'a mut Map<String, Value> {
    if !root.is_object() {
        *root = Value::Object(Map::new());
    }
    let mut current = root;
    for key in path {
        let obj = current.as_object_mut().unwrap();
        let entry = obj
            .entry(key.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        current = entry;
    }
    current.as_object_mut().unwrap()
}

fn non_empty_object<'a>(value: Option<&'a Value>) -> Option<&'a Map<String, Value>> {
    match value {
        Some(Value::Object(map)) if !map.is_empty() => Some(map),
        _ => None,
    }
}

/// Locate the global-context branch, probing current then legacy locations.
/// A bare top-level `global` object is accepted as a last resort for old
/// subscription filters.
pub fn global_branch(metadata: &Value) -> Option<&Map<String, Value>> {
    non_empty_object(get_path(metadata, &["global_context"]))
        .or_else(|| non_empty_object(get_path(metadata, &["service_specific", "global_context"])))
        .or_else(|| non_empty_object(get_path(metadata, &["service_specific", "global"])))
        .or_else(|| non_empty_object(get_path(metadata, &["global"])))
}

fn branch_string(branch: Option<&Map<String, Value>>, key: &str) -> String {
    branch
        .and_then(|map| map.get(key))
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

/// Extract the global routing fields from envelope metadata, applying the
/// default campaign id and source on miss.
pub fn extract_global(metadata: &Value) -> GlobalContext {
    let branch = global_branch(metadata);

    let mut ctx = GlobalContext {
        user_id: branch_string(branch, "user_id"),
        campaign_id: branch_string(branch, "campaign_id"),
        session_id: branch_string(branch, "session_id"),
        device_id: branch_string(branch, "device_id"),
        source: branch_string(branch, "source"),
        correlation_id: branch_string(branch, "correlation_id"),
    };
    if ctx.campaign_id.is_empty() {
        ctx.campaign_id = DEFAULT_CAMPAIGN_ID.to_string();
    }
    if ctx.source.is_empty() {
        ctx.source = DEFAULT_SOURCE.to_string();
    }
    ctx
}

/// Extract the raw user id, without defaults. `None` when no branch carries a
/// non-empty value.
pub fn extract_user_id(metadata: &Value) -> Option<String> {
    let value = branch_string(global_branch(metadata), "user_id");
    (!value.is_empty()).then_some(value)
}

/// Extract the raw campaign id, without defaults.
pub fn extract_campaign_id(metadata: &Value) -> Option<String> {
    let value = branch_string(global_branch(metadata), "campaign_id");
    (!value.is_empty()).then_some(value)
}

/// Locate a correlation id for a stateful request. Probes
/// `metadata.global_context.correlation_id`, then
/// `metadata.service_specific.correlation_id`, then
/// `payload.data.correlationId`.
pub fn extract_correlation(metadata: &Value, payload: &Value) -> Option<String> {
    get_string(metadata, &["global_context", "correlation_id"])
        .or_else(|| get_string(metadata, &["service_specific", "correlation_id"]))
        .or_else(|| get_string(payload, &["data", "correlationId"]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_extract_direct_global_context() {
        let metadata = json!({
            "global_context": {
                "user_id": "u1",
                "campaign_id": "acme",
                "source": "mobile"
            }
        });

        let ctx = extract_global(&metadata);
        assert_eq!(ctx.user_id, "u1");
        assert_eq!(ctx.campaign_id, "acme");
        assert_eq!(ctx.source, "mobile");
    }

    #[test]
    fn test_probe_order_prefers_direct_branch() {
        let metadata = json!({
            "global_context": {"user_id": "direct"},
            "service_specific": {
                "global_context": {"user_id": "nested"},
                "global": {"user_id": "legacy"}
            }
        });

        assert_eq!(extract_global(&metadata).user_id, "direct");
    }

    #[test]
    fn test_legacy_global_fallback() {
        let metadata = json!({
            "service_specific": {
                "global": {"user_id": "legacy", "campaign_id": "c2"}
            }
        });

        let ctx = extract_global(&metadata);
        assert_eq!(ctx.user_id, "legacy");
        assert_eq!(ctx.campaign_id, "c2");
    }

    #[test]
    fn test_empty_branch_is_skipped() {
        let metadata = json!({
            "global_context": {},
            "service_specific": {"global": {"user_id": "legacy"}}
        });

        assert_eq!(extract_global(&metadata).user_id, "legacy");
    }

    #[test]
    fn test_bare_global_fallback() {
        let metadata = json!({"global": {"user_id": "u1"}});
        assert_eq!(extract_user_id(&metadata), Some("u1".to_string()));
    }

    #[test]
    fn test_defaults_on_miss() {
        let ctx = extract_global(&json!({}));
        assert_eq!(ctx.user_id, "");
        assert_eq!(ctx.campaign_id, DEFAULT_CAMPAIGN_ID);
        assert_eq!(ctx.source, DEFAULT_SOURCE);

        assert_eq!(extract_user_id(&json!({})), None);
        assert_eq!(extract_campaign_id(&json!({})), None);
    }

    #[test]
    fn test_extract_correlation_probe_order() {
        let metadata = json!({
            "global_context": {"correlation_id": "C1"},
            "service_specific": {"correlation_id": "C2"}
        });
        let payload = json!({"data": {"correlationId": "C3"}});

        assert_eq!(
            extract_correlation(&metadata, &payload),
            Some("C1".to_string())
        );
        assert_eq!(
            extract_correlation(&json!({"service_specific": {"correlation_id": "C2"}}), &payload),
            Some("C2".to_string())
        );
        assert_eq!(
            extract_correlation(&json!({}), &payload),
            Some("C3".to_string())
        );
        assert_eq!(extract_correlation(&json!({}), &json!({})), None);
    }

    #[test]
    fn test_ensure_object_mut_creates_branches() {
        let mut metadata = Value::Null;
        {
            let global = ensure_object_mut(&mut metadata, &["service_specific", "global"]);
            global.insert("user_id".to_string(), json!("u1"));
        }

        assert_eq!(
            get_string(&metadata, &["service_specific", "global", "user_id"]),
            Some("u1".to_string())
        );
    }

    #[test]
    fn test_ensure_object_mut_replaces_string_branch() {
        let mut metadata = json!({"service_specific": "not an object"});
        ensure_object_mut(&mut metadata, &["service_specific", "global"])
            .insert("campaign_id".to_string(), json!("acme"));

        assert_eq!(
            get_string(&metadata, &["service_specific", "global", "campaign_id"]),
            Some("acme".to_string())
        );
    }
}
