//! The event envelope carried on every bus channel
//!
//! Wire format is the JSON-serialized envelope:
//! `{success, event_id, event_type, message, metadata, payload}` with
//! metadata and payload as nested JSON objects. Envelopes are immutable once
//! published.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::errors::DomainError;

/// Message label carried by the synthetic envelope emitted to a subscriber
/// whose queue overflowed.
pub const EVENT_DROPPED_MESSAGE: &str = "event_dropped";

/// One event on the bus
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub success: bool,
    pub event_id: String,
    pub event_type: String,
    pub message: String,
    #[serde(default)]
    pub metadata: Value,
    #[serde(default)]
    pub payload: Value,
}

impl EventEnvelope {
    pub fn new(
        event_id: impl Into<String>,
        event_type: impl Into<String>,
        message: impl Into<String>,
        metadata: Value,
        payload: Value,
    ) -> Self {
        Self {
            success: true,
            event_id: event_id.into(),
            event_type: event_type.into(),
            message: message.into(),
            metadata,
            payload,
        }
    }

    /// A failure envelope carrying the reason as its message, with the
    /// original metadata preserved for routing.
    pub fn failure(
        event_id: impl Into<String>,
        event_type: impl Into<String>,
        message: impl Into<String>,
        metadata: Value,
        payload: Value,
    ) -> Self {
        Self {
            success: false,
            event_id: event_id.into(),
            event_type: event_type.into(),
            message: message.into(),
            metadata,
            payload,
        }
    }

    /// The synthetic envelope delivered in place of a frame that overflowed a
    /// subscriber queue: same id and type, `success = false`, no payload.
    pub fn dropped(original: &EventEnvelope) -> Self {
        Self {
            success: false,
            event_id: original.event_id.clone(),
            event_type: original.event_type.clone(),
            message: EVENT_DROPPED_MESSAGE.to_string(),
            metadata: original.metadata.clone(),
            payload: Value::Object(serde_json::Map::new()),
        }
    }

    pub fn generate_event_id() -> String {
        Uuid::new_v4().to_string()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, DomainError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DomainError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
