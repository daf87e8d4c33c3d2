//! Nexus RPC contract: the event bus mapped onto gRPC.
//!
//! Uses tonic for the transport and prost for message serialization
//! (standard protobuf wire format, no `.proto` file). Metadata and payload
//! trees travel as JSON strings on the wire and are parsed back into
//! `serde_json::Value` at the edges.
//!
//! ## RPCs
//!
//! - `EmitEvent`: ingress. Validate, dedup, and route one event.
//! - `SubscribeEvents`: egress. Server-stream of envelopes filtered by
//!   event types and optional user/campaign metadata.
//! - `RegisterPattern`: best-effort durable registration of a service's
//!   event-type pattern; the response confirms queue acceptance only.

use nx_domain::EventEnvelope;

// ---------------------------------------------------------------------------
// Message types (prost, standard protobuf wire format)
// ---------------------------------------------------------------------------

#[derive(Clone, prost::Message)]
pub struct EventRequest {
    /// Assigned by the router when empty
    #[prost(string, tag = "1")]
    pub event_id: String,
    #[prost(string, tag = "2")]
    pub event_type: String,
    #[prost(string, tag = "3")]
    pub entity_id: String,
    #[prost(string, tag = "4")]
    pub campaign_id: String,
    /// JSON object
    #[prost(string, tag = "5")]
    pub metadata: String,
    /// JSON object
    #[prost(string, tag = "6")]
    pub payload: String,
}

#[derive(Clone, prost::Message)]
pub struct EventResponse {
    #[prost(bool, tag = "1")]
    pub success: bool,
    #[prost(string, tag = "2")]
    pub message: String,
    /// JSON object (the enriched metadata)
    #[prost(string, tag = "3")]
    pub metadata: String,
}

#[derive(Clone, prost::Message)]
pub struct SubscribeRequest {
    /// Empty subscribes to the default channel only
    #[prost(string, repeated, tag = "1")]
    pub event_types: Vec<String>,
    /// JSON object; optional `user_id` / `campaign_id` filters
    #[prost(string, tag = "2")]
    pub metadata: String,
}

#[derive(Clone, prost::Message)]
pub struct WireEnvelope {
    #[prost(bool, tag = "1")]
    pub success: bool,
    #[prost(string, tag = "2")]
    pub event_id: String,
    #[prost(string, tag = "3")]
    pub event_type: String,
    #[prost(string, tag = "4")]
    pub message: String,
    /// JSON object
    #[prost(string, tag = "5")]
    pub metadata: String,
    /// JSON object
    #[prost(string, tag = "6")]
    pub payload: String,
}

#[derive(Clone, prost::Message)]
pub struct PatternRequest {
    #[prost(string, tag = "1")]
    pub service: String,
    #[prost(string, tag = "2")]
    pub pattern: String,
}

#[derive(Clone, prost::Message)]
pub struct PatternResponse {
    #[prost(bool, tag = "1")]
    pub success: bool,
    #[prost(string, tag = "2")]
    pub message: String,
}

// ---------------------------------------------------------------------------
// Generated service trait + server/client
// ---------------------------------------------------------------------------

include!(concat!(env!("OUT_DIR"), "/nexus.bus.NexusService.rs"));

pub use nexus_service_client::NexusServiceClient;
pub use nexus_service_server::{NexusService, NexusServiceServer};

// ---------------------------------------------------------------------------
// Envelope conversions
// ---------------------------------------------------------------------------

/// Parse a wire JSON string into a tree; empty strings become `null`.
pub fn parse_json_tree(raw: &str) -> serde_json::Value {
    if raw.is_empty() {
        return serde_json::Value::Null;
    }
    serde_json::from_str(raw).unwrap_or(serde_json::Value::Null)
}

fn render_json_tree(value: &serde_json::Value) -> String {
    if value.is_null() {
        return String::new();
    }
    value.to_string()
}

impl From<&EventEnvelope> for WireEnvelope {
    fn from(envelope: &EventEnvelope) -> Self {
        Self {
            success: envelope.success,
            event_id: envelope.event_id.clone(),
            event_type: envelope.event_type.clone(),
            message: envelope.message.clone(),
            metadata: render_json_tree(&envelope.metadata),
            payload: render_json_tree(&envelope.payload),
        }
    }
}

impl From<&WireEnvelope> for EventEnvelope {
    fn from(wire: &WireEnvelope) -> Self {
        Self {
            success: wire.success,
            event_id: wire.event_id.clone(),
            event_type: wire.event_type.clone(),
            message: wire.message.clone(),
            metadata: parse_json_tree(&wire.metadata),
            payload: parse_json_tree(&wire.payload),
        }
    }
}
