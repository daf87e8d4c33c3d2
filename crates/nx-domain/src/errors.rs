//! Domain errors

use thiserror::Error;

/// Domain errors for Nexus
#[derive(Debug, Error)]
pub enum DomainError {
    #[error("Invalid event type '{event_type}': {reason}")]
    InvalidEventType { event_type: String, reason: String },

    #[error("Invalid status transition: {from} -> {to}")]
    InvalidStatusTransition { from: String, to: String },

    #[error("Campaign not found: {slug}")]
    CampaignNotFound { slug: String },

    #[error("Invalid feature action: {action}")]
    InvalidFeatureAction { action: String },

    #[error("Serialization error: {message}")]
    Serialization { message: String },
}

impl From<serde_json::Error> for DomainError {
    fn from(e: serde_json::Error) -> Self {
        DomainError::Serialization {
            message: e.to_string(),
        }
    }
}
