//! Egress: the single Nexus subscription and per-envelope routing
//!
//! One long-lived stream carries every envelope the gateway cares about,
//! filtered upstream by the relevant-types set. Routing order per envelope:
//! pending-correlation match, canonical per-user delivery, the
//! `campaign:state:v1:*` legacy passthrough, then scope broadcast. On stream
//! failure the loop reconnects with jittered exponential backoff and
//! resubscribes with the accumulated type set; growth of the set triggers an
//! immediate resubscribe instead.

use std::time::Duration;
use tracing::{debug, info, warn};

use crate::correlation::ClientKey;
use crate::frames::{OutgoingFrame, GATEWAY_LOOP_MARKER};
use crate::state::SharedState;
use nx_domain::{event_type, get_string, EventEnvelope};
use nx_proto::SubscribeRequest;

/// Reconnect backoff: 1s base, 30s cap, doubling
pub const RECONNECT_BASE: Duration = Duration::from_secs(1);
pub const RECONNECT_MAX: Duration = Duration::from_secs(30);

/// Jitter applied to each reconnect delay
const RECONNECT_JITTER: f64 = 0.2;

/// Jittered exponential backoff
struct Backoff {
    current: Duration,
}

impl Backoff {
    fn new() -> Self {
        Self {
            current: RECONNECT_BASE,
        }
    }

    fn reset(&mut self) {
        self.current = RECONNECT_BASE;
    }

    fn next_delay(&mut self) -> Duration {
        let jitter = 1.0 + (rand::random::<f64>() * 2.0 - 1.0) * RECONNECT_JITTER;
        let delay = self.current.mul_f64(jitter.max(0.0));
        self.current = (self.current * 2).min(RECONNECT_MAX);
        delay
    }
}

enum StreamExit {
    Failed,
    Resubscribe,
}

/// The egress loop. Never returns; the process owns its lifetime.
pub async fn run_egress(state: SharedState) {
    let mut backoff = Backoff::new();

    loop {
        let types = state.relevant.snapshot();
        let request = SubscribeRequest {
            event_types: types.clone(),
            metadata: String::new(),
        };

        let mut client = state.nexus.clone();
        match client.subscribe_events(tonic::Request::new(request)).await {
            Ok(response) => {
                info!(types = types.len(), "Egress subscription established");
                backoff.reset();
                let mut stream = response.into_inner();

                let exit = loop {
                    tokio::select! {
                        item = stream.message() => match item {
                            Ok(Some(wire)) => {
                                route_envelope(&state, &EventEnvelope::from(&wire));
                            }
                            Ok(None) => {
                                warn!("Egress stream ended");
                                break StreamExit::Failed;
                            }
                            Err(e) => {
                                warn!(error = %e, "Egress stream error");
                                break StreamExit::Failed;
                            }
                        },
                        _ = state.resubscribe.notified() => break StreamExit::Resubscribe,
                    }
                };

                if matches!(exit, StreamExit::Resubscribe) {
                    info!(
                        types = state.relevant.len(),
                        "Relevant types grew, resubscribing"
                    );
                    continue;
                }
            }
            Err(e) => {
                warn!(error = %e, "Nexus subscription failed");
            }
        }

        let delay = backoff.next_delay();
        debug!(delay_ms = delay.as_millis() as u64, "Reconnecting to Nexus");
        tokio::time::sleep(delay).await;
    }
}

/// Where an envelope should go, after the pending-correlation check
#[derive(Debug, Clone, PartialEq, Eq)]
enum Route {
    Client(ClientKey),
    Broadcast,
    Campaign(String),
    User(String),
    Drop,
}

/// The `(user, campaign)` an envelope is addressed to: payload fields first,
/// then the legacy metadata branch.
fn target_of(envelope: &EventEnvelope) -> (Option<String>, Option<String>) {
    let user_id = get_string(&envelope.payload, &["user_id"]).or_else(|| {
        get_string(
            &envelope.metadata,
            &["service_specific", "global", "user_id"],
        )
    });
    let campaign_id = get_string(&envelope.payload, &["campaign_id"]).or_else(|| {
        get_string(
            &envelope.metadata,
            &["service_specific", "global", "campaign_id"],
        )
    });
    (user_id, campaign_id)
}

fn scope_route(envelope: &EventEnvelope) -> Route {
    let (user_id, campaign_id) = target_of(envelope);

    // canonical events and the campaign-state legacy namespace route to the
    // addressed (campaign, user) pair when one is carried
    let addressable = event_type::parse(&envelope.event_type).is_ok()
        || envelope.event_type.starts_with("campaign:state:v1:");
    if addressable {
        if let (Some(user_id), Some(campaign_id)) = (&user_id, &campaign_id) {
            return Route::Client(ClientKey {
                campaign_id: campaign_id.clone(),
                user_id: user_id.clone(),
            });
        }
        if let Some(user_id) = &user_id {
            return Route::User(user_id.clone());
        }
    }

    // scope broadcast for everything else
    if envelope.event_type.starts_with("system") {
        return Route::Broadcast;
    }
    if let Some(campaign_id) = campaign_id {
        if campaign_id != nx_domain::DEFAULT_CAMPAIGN_ID {
            return Route::Campaign(campaign_id);
        }
    }
    if let Some(user_id) = user_id {
        return Route::User(user_id);
    }
    Route::Drop
}

fn outgoing(envelope: &EventEnvelope) -> OutgoingFrame {
    let mut payload = envelope.payload.clone();
    if let Some(map) = payload.as_object_mut() {
        // stamped so a frame echoed back by a client is stripped on ingest
        map.insert(GATEWAY_LOOP_MARKER.to_string(), serde_json::Value::Bool(true));
    }
    OutgoingFrame::new(envelope.event_type.clone(), payload)
}

/// Route one envelope from the Nexus stream to client connections.
pub fn route_envelope(state: &SharedState, envelope: &EventEnvelope) {
    // 1. a pending request gets its reply, and only it
    if let Some(entry) = state
        .pending
        .match_reply(&envelope.event_id, &envelope.event_type)
    {
        debug!(
            event_id = %envelope.event_id,
            event_type = %envelope.event_type,
            user_id = %entry.client.user_id,
            "Correlated reply delivered"
        );
        state.send_to_client(&entry.client, outgoing(envelope));
        return;
    }

    match scope_route(envelope) {
        Route::Client(key) => {
            if !state.send_to_client(&key, outgoing(envelope)) {
                debug!(
                    event_id = %envelope.event_id,
                    event_type = %envelope.event_type,
                    user_id = %key.user_id,
                    campaign_id = %key.campaign_id,
                    "No matching client, frame dropped"
                );
            }
        }
        Route::Broadcast => {
            state.broadcast(&outgoing(envelope));
        }
        Route::Campaign(campaign_id) => {
            state.send_to_campaign(&campaign_id, &outgoing(envelope));
        }
        Route::User(user_id) => {
            state.send_to_user(&user_id, &outgoing(envelope));
        }
        Route::Drop => {
            debug!(
                event_id = %envelope.event_id,
                event_type = %envelope.event_type,
                "Unroutable envelope dropped"
            );
        }
    }
}
