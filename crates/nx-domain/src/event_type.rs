//! Canonical event type grammar and validator
//!
//! Every event on the bus is identified by a string in one of three shapes:
//! - Canonical: `service:action:vN:state` with a closed state vocabulary
//! - Health: `service:health:vN:state` with the extra `heartbeat` state
//! - Literal: `echo` (test) and the `campaign:*` namespace (legacy passthrough)
//!
//! The grammar is authoritative: ingress rejects anything the validator
//! classifies as invalid.

use serde::{Deserialize, Serialize};

use crate::errors::DomainError;

/// Category assigned to an event type string by the validator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    /// Four-part `service:action:vN:state` with a canonical state
    Canonical,
    /// Four-part `service:health:vN:state`, heartbeat allowed
    Health,
    /// `campaign:*` strings that are not themselves canonical (legacy passthrough)
    Campaign,
    /// The `echo` literal used by round-trip tests
    Test,
    /// Everything else; rejected at ingress
    Invalid,
}

/// Lifecycle state carried in the fourth part of a canonical or health type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventState {
    Requested,
    Started,
    Success,
    Failed,
    Completed,
    Heartbeat,
}

impl EventState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventState::Requested => "requested",
            EventState::Started => "started",
            EventState::Success => "success",
            EventState::Failed => "failed",
            EventState::Completed => "completed",
            EventState::Heartbeat => "heartbeat",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "requested" => Some(EventState::Requested),
            "started" => Some(EventState::Started),
            "success" => Some(EventState::Success),
            "failed" => Some(EventState::Failed),
            "completed" => Some(EventState::Completed),
            "heartbeat" => Some(EventState::Heartbeat),
            _ => None,
        }
    }
}

/// States accepted for ordinary canonical events
const CANONICAL_STATES: [EventState; 5] = [
    EventState::Requested,
    EventState::Started,
    EventState::Success,
    EventState::Failed,
    EventState::Completed,
];

/// States accepted for health events (`action == "health"`)
const HEALTH_STATES: [EventState; 4] = [
    EventState::Requested,
    EventState::Success,
    EventState::Failed,
    EventState::Heartbeat,
];

/// The reserved action marking a health event
pub const HEALTH_ACTION: &str = "health";

/// The echo literal accepted for round-trip tests
pub const ECHO_EVENT_TYPE: &str = "echo";

/// Prefixes that route an event to the campaign state manager instead of the bus
pub const STATEFUL_CAMPAIGN_PREFIXES: [&str; 6] = [
    "campaign:state:",
    "campaign:list:",
    "campaign:switch:",
    "campaign:feature:",
    "campaign:config:",
    "campaign:update:",
];

/// A parsed canonical or health event type
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ParsedEventType {
    pub service: String,
    pub action: String,
    pub version: u32,
    pub state: EventState,
}

impl ParsedEventType {
    /// Render back to the wire string. Inverse of [`parse`] on valid inputs.
    pub fn format(&self) -> String {
        format!(
            "{}:{}:v{}:{}",
            self.service,
            self.action,
            self.version,
            self.state.as_str()
        )
    }

    /// The `service:action` routing key used by the multi-bus channel map
    pub fn action_key(&self) -> String {
        format!("{}:{}", self.service, self.action)
    }

    pub fn is_health(&self) -> bool {
        self.action == HEALTH_ACTION
    }
}

/// Parse a canonical or health event type.
///
/// Splits on `:`, requires exactly four parts, a non-empty service and
/// action, a version of the form `vN` with `N >= 1`, and a state allowed for
/// the detected category.
pub fn parse(event_type: &str) -> Result<ParsedEventType, DomainError> {
    let invalid = |reason: &str| DomainError::InvalidEventType {
        event_type: event_type.to_string(),
        reason: reason.to_string(),
    };

    let parts: Vec<&str> = event_type.split(':').collect();
    if parts.len() != 4 {
        return Err(invalid("expected four colon-separated parts"));
    }

    let (service, action, version, state) = (parts[0], parts[1], parts[2], parts[3]);

    if service.is_empty() {
        return Err(invalid("empty service"));
    }
    if action.is_empty() {
        return Err(invalid("empty action"));
    }

    if version.len() < 2 || !version.starts_with('v') {
        return Err(invalid("version must be of the form vN"));
    }
    let version: u32 = version[1..]
        .parse()
        .map_err(|_| invalid("version must be of the form vN"))?;
    if version < 1 {
        return Err(invalid("version must be >= 1"));
    }

    let state = EventState::parse(state).ok_or_else(|| invalid("unknown state"))?;

    let allowed: &[EventState] = if action == HEALTH_ACTION {
        &HEALTH_STATES
    } else {
        &CANONICAL_STATES
    };
    if !allowed.contains(&state) {
        return Err(invalid("state not allowed for this category"));
    }

    Ok(ParsedEventType {
        service: service.to_string(),
        action: action.to_string(),
        version,
        state,
    })
}

/// Classify an event type string.
pub fn category(event_type: &str) -> EventCategory {
    if event_type == ECHO_EVENT_TYPE {
        return EventCategory::Test;
    }
    match parse(event_type) {
        Ok(parsed) if parsed.is_health() => EventCategory::Health,
        Ok(_) => EventCategory::Canonical,
        Err(_) if event_type.starts_with("campaign:") => EventCategory::Campaign,
        Err(_) => EventCategory::Invalid,
    }
}

/// Whether ingress accepts this event type at all
pub fn is_valid(event_type: &str) -> bool {
    category(event_type) != EventCategory::Invalid
}

/// Whether the event must be delegated to the campaign state manager
pub fn is_stateful_campaign(event_type: &str) -> bool {
    STATEFUL_CAMPAIGN_PREFIXES
        .iter()
        .any(|prefix| event_type.starts_with(prefix))
}

/// Derive the terminal reply type for a request by replacing the trailing
/// `:requested` suffix with `:success`. Types without the suffix map to
/// themselves.
pub fn expected_reply_type(event_type: &str) -> String {
    match event_type.strip_suffix(":requested") {
        Some(prefix) => format!("{}:success", prefix),
        None => event_type.to_string(),
    }
}
