//! Durable event record model and delivery status transitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use crate::envelope::EventEnvelope;
use crate::errors::DomainError;

/// Redelivery attempts before a record is declared dead
pub const MAX_DELIVERY_RETRIES: u32 = 3;

/// Base delay for redelivery backoff; doubles per retry
pub const RETRY_BACKOFF_BASE: Duration = Duration::from_secs(10);

/// Delivery status of a durable event record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Delivered,
    Failed,
    Dead,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Failed => "failed",
            DeliveryStatus::Dead => "dead",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(DeliveryStatus::Pending),
            "delivered" => Some(DeliveryStatus::Delivered),
            "failed" => Some(DeliveryStatus::Failed),
            "dead" => Some(DeliveryStatus::Dead),
            _ => None,
        }
    }

    /// Allowed transitions: pending -> delivered, pending -> failed,
    /// failed -> delivered (a later retry succeeded), failed -> dead.
    pub fn can_transition(self, next: DeliveryStatus) -> bool {
        matches!(
            (self, next),
            (DeliveryStatus::Pending, DeliveryStatus::Delivered)
                | (DeliveryStatus::Pending, DeliveryStatus::Failed)
                | (DeliveryStatus::Failed, DeliveryStatus::Delivered)
                | (DeliveryStatus::Failed, DeliveryStatus::Failed)
                | (DeliveryStatus::Failed, DeliveryStatus::Dead)
        )
    }

    pub fn transition(self, next: DeliveryStatus) -> Result<DeliveryStatus, DomainError> {
        if self.can_transition(next) {
            Ok(next)
        } else {
            Err(DomainError::InvalidStatusTransition {
                from: self.as_str().to_string(),
                to: next.as_str().to_string(),
            })
        }
    }
}

/// One durable event row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub event_id: String,
    pub event_type: String,
    pub metadata: Value,
    pub payload: Value,
    pub status: DeliveryStatus,
    pub retries: u32,
    pub nexus_sequence: u64,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl EventRecord {
    pub fn from_envelope(envelope: &EventEnvelope, nexus_sequence: u64, now: DateTime<Utc>) -> Self {
        Self {
            event_id: envelope.event_id.clone(),
            event_type: envelope.event_type.clone(),
            metadata: envelope.metadata.clone(),
            payload: envelope.payload.clone(),
            status: DeliveryStatus::Pending,
            retries: 0,
            nexus_sequence,
            created_at: now,
            error_message: None,
        }
    }

    /// Rebuild the wire envelope for redelivery.
    pub fn to_envelope(&self) -> EventEnvelope {
        EventEnvelope::new(
            self.event_id.clone(),
            self.event_type.clone(),
            "redelivery",
            self.metadata.clone(),
            self.payload.clone(),
        )
    }

    /// Backoff before the next redelivery attempt: 10s doubled per retry.
    pub fn next_retry_delay(&self) -> Duration {
        RETRY_BACKOFF_BASE * 2u32.saturating_pow(self.retries)
    }

    /// Whether the retry budget is exhausted.
    pub fn is_exhausted(&self) -> bool {
        self.retries >= MAX_DELIVERY_RETRIES
    }
}
