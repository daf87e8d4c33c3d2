//! Subscription multiplexer
//!
//! One caller's `SubscribeEvents` stream fans in from every channel its
//! requested event types route to. Envelopes pass a type filter (empty set =
//! all) and optional user/campaign metadata filters before forwarding.
//! Dropping the returned receiver cancels the forwarders and releases every
//! channel subscription. Order is preserved within a channel; nothing is
//! guaranteed across channels.

use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

use crate::bus::MultiBus;
use nx_domain::{extract_campaign_id, extract_user_id, EventEnvelope};

/// Frames buffered toward one subscriber stream
const STREAM_BUFFER: usize = 64;

/// One decoded subscription request
#[derive(Debug, Clone, Default)]
pub struct SubscribeSpec {
    /// Requested event types; empty means the default channel, unfiltered
    pub event_types: Vec<String>,
    /// Forward only envelopes whose extracted user id matches
    pub user_id: Option<String>,
    /// Forward only envelopes whose extracted campaign id matches
    pub campaign_id: Option<String>,
}

impl SubscribeSpec {
    /// Build a spec from the request's event types and filter metadata.
    pub fn from_request(event_types: Vec<String>, metadata: &Value) -> Self {
        Self {
            event_types,
            user_id: extract_user_id(metadata),
            campaign_id: extract_campaign_id(metadata),
        }
    }
}

/// Fans channel subscriptions into per-caller streams
pub struct EventMultiplexer {
    bus: Arc<MultiBus>,
}

impl EventMultiplexer {
    pub fn new(bus: Arc<MultiBus>) -> Self {
        Self { bus }
    }

    /// Open a filtered stream. The forwarder tasks exit when the returned
    /// receiver is dropped, releasing their channel subscriptions.
    pub fn open(&self, spec: SubscribeSpec) -> mpsc::Receiver<EventEnvelope> {
        let subscriptions = self.bus.subscribe(&spec.event_types);
        let filter: Arc<HashSet<String>> = Arc::new(spec.event_types.iter().cloned().collect());
        let user_id = spec.user_id.clone();
        let campaign_id = spec.campaign_id.clone();

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);

        for mut subscription in subscriptions {
            let tx = tx.clone();
            let filter = filter.clone();
            let user_id = user_id.clone();
            let campaign_id = campaign_id.clone();

            tokio::spawn(async move {
                while let Some(envelope) = subscription.recv().await {
                    if !matches(&filter, &user_id, &campaign_id, &envelope) {
                        continue;
                    }
                    if tx.send(envelope).await.is_err() {
                        // caller cancelled; dropping the subscription
                        // releases the channel slot
                        break;
                    }
                }
                debug!(
                    channel = subscription.channel(),
                    "Subscription forwarder stopped"
                );
            });
        }

        rx
    }
}

/// The user id an envelope is addressed to: metadata probes first, then the
/// payload's own `user_id` field.
fn envelope_user_id(envelope: &EventEnvelope) -> Option<String> {
    extract_user_id(&envelope.metadata).or_else(|| {
        envelope
            .payload
            .get("user_id")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
    })
}

fn envelope_campaign_id(envelope: &EventEnvelope) -> Option<String> {
    extract_campaign_id(&envelope.metadata).or_else(|| {
        envelope
            .payload
            .get("campaign_id")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
    })
}

fn matches(
    filter: &HashSet<String>,
    user_id: &Option<String>,
    campaign_id: &Option<String>,
    envelope: &EventEnvelope,
) -> bool {
    if !filter.is_empty() && !filter.contains(&envelope.event_type) {
        return false;
    }
    // a set filter with no extractable id drops the envelope
    if let Some(wanted) = user_id {
        match envelope_user_id(envelope) {
            Some(actual) if actual == *wanted => {}
            _ => return false,
        }
    }
    if let Some(wanted) = campaign_id {
        match envelope_campaign_id(envelope) {
            Some(actual) if actual == *wanted => {}
            _ => return false,
        }
    }
    true
}
