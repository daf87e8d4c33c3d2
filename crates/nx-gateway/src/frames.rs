//! WebSocket frame shapes and payload normalization
//!
//! Incoming frames are `{type, payload, metadata}`; outgoing frames are
//! `{type, payload}`. Before a frame is forwarded to Nexus its payload is
//! cleaned: empty and null leaves are deleted and the gateway-loop marker is
//! stripped so a frame that came back out cannot re-enter.

use serde::Serialize;
use serde_json::{Map, Value};

/// Key stamped by the gateway on frames it emitted; stripped on ingest to
/// break feedback loops.
pub const GATEWAY_LOOP_MARKER: &str = "emitted_by_gateway";

/// One frame written to a client socket
#[derive(Debug, Clone, Serialize)]
pub struct OutgoingFrame {
    #[serde(rename = "type")]
    pub event_type: String,
    pub payload: Value,
}

impl OutgoingFrame {
    pub fn new(event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
        }
    }
}

/// One decoded client frame
#[derive(Debug, Clone)]
pub struct IncomingFrame {
    pub event_type: String,
    pub payload: Value,
    pub metadata: Value,
}

/// Why an incoming frame was rejected
#[derive(Debug, PartialEq, Eq)]
pub enum FrameRejection {
    /// Not a JSON object
    NotJson,
    /// Missing or empty `type`
    MissingType,
    /// `metadata` was a string rather than an object
    StringMetadata,
}

/// Decode a client text frame. String metadata is rejected outright; missing
/// payload and metadata default to empty objects.
pub fn decode_frame(text: &str) -> Result<IncomingFrame, FrameRejection> {
    let value: Value = serde_json::from_str(text).map_err(|_| FrameRejection::NotJson)?;
    if !value.is_object() {
        return Err(FrameRejection::NotJson);
    }

    let event_type = value
        .get("type")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .ok_or(FrameRejection::MissingType)?
        .to_string();

    if value.get("metadata").map(Value::is_string).unwrap_or(false) {
        return Err(FrameRejection::StringMetadata);
    }

    Ok(IncomingFrame {
        event_type,
        payload: value
            .get("payload")
            .cloned()
            .unwrap_or_else(|| Value::Object(Map::new())),
        metadata: value
            .get("metadata")
            .cloned()
            .unwrap_or_else(|| Value::Object(Map::new())),
    })
}

fn is_empty_leaf(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

/// Delete empty/null leaves and the gateway-loop marker, recursively.
pub fn clean_payload(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut cleaned = Map::new();
            for (key, child) in map {
                if key == GATEWAY_LOOP_MARKER {
                    continue;
                }
                let child = clean_payload(child);
                if is_empty_leaf(&child) {
                    continue;
                }
                cleaned.insert(key, child);
            }
            Value::Object(cleaned)
        }
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(clean_payload)
                .filter(|item| !is_empty_leaf(item))
                .collect(),
        ),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_valid_frame() {
        let frame = decode_frame(
            r#"{"type": "user:create:v1:requested", "payload": {"name": "ada"}, "metadata": {"service_specific": {"global": {"correlation_id": "C1"}}}}"#,
        )
        .unwrap();

        assert_eq!(frame.event_type, "user:create:v1:requested");
        assert_eq!(frame.payload, json!({"name": "ada"}));
    }

    #[test]
    fn test_decode_defaults_missing_trees() {
        let frame = decode_frame(r#"{"type": "echo"}"#).unwrap();
        assert_eq!(frame.payload, json!({}));
        assert_eq!(frame.metadata, json!({}));
    }

    #[test]
    fn test_decode_rejects_string_metadata() {
        let err = decode_frame(r#"{"type": "echo", "metadata": "not an object"}"#).unwrap_err();
        assert_eq!(err, FrameRejection::StringMetadata);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert_eq!(decode_frame("{oops").unwrap_err(), FrameRejection::NotJson);
        assert_eq!(decode_frame("[1,2]").unwrap_err(), FrameRejection::NotJson);
        assert_eq!(
            decode_frame(r#"{"payload": {}}"#).unwrap_err(),
            FrameRejection::MissingType
        );
    }

    #[test]
    fn test_clean_payload_removes_empty_leaves() {
        let cleaned = clean_payload(json!({
            "name": "ada",
            "empty": "",
            "nothing": null,
            "hollow": {},
            "bare": [],
            "nested": {"keep": 1, "drop": null},
        }));

        assert_eq!(cleaned, json!({"name": "ada", "nested": {"keep": 1}}));
    }

    #[test]
    fn test_clean_payload_strips_loop_marker() {
        let cleaned = clean_payload(json!({
            "emitted_by_gateway": true,
            "data": {"emitted_by_gateway": true, "value": 7},
        }));

        assert_eq!(cleaned, json!({"data": {"value": 7}}));
    }

    #[test]
    fn test_clean_payload_collapses_emptied_branches() {
        let cleaned = clean_payload(json!({"branch": {"only": null}}));
        assert_eq!(cleaned, json!({}));
    }

    #[test]
    fn test_outgoing_frame_shape() {
        let frame = OutgoingFrame::new("user:create:v1:success", json!({"id": 1}));
        let text = serde_json::to_string(&frame).unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();

        assert_eq!(value["type"], json!("user:create:v1:success"));
        assert_eq!(value["payload"], json!({"id": 1}));
        assert!(value.get("metadata").is_none());
    }
}
