//! Per-connection WebSocket handling
//!
//! Each connection runs a read pump (this task) and a write pump (spawned).
//! The read pump decodes frames, registers correlations, merges the gateway
//! identity into metadata, cleans payloads, and forwards to Nexus ingress.
//! The write pump drains the client's bounded queue with a write deadline
//! and keeps the socket alive with periodic pings.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::stream::{SplitSink, StreamExt};
use futures::SinkExt;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::correlation::ClientKey;
use crate::frames::{clean_payload, decode_frame, OutgoingFrame};
use crate::state::SharedState;
use nx_domain::{ensure_object_mut, event_type, get_string};
use nx_proto::EventRequest;

/// WebSocket frame size limit
pub const MAX_FRAME_BYTES: usize = 2 * 1024 * 1024;

/// Socket write deadline
const WRITE_DEADLINE: Duration = Duration::from_secs(10);

/// Keepalive ping cadence (must stay under the 45s contract)
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Read deadline, refreshed by every inbound frame including pongs
const READ_DEADLINE: Duration = Duration::from_secs(75);

/// EmitEvent deadline toward Nexus
const EMIT_DEADLINE: Duration = Duration::from_secs(5);

/// Unsolicited state request sent for every new connection
pub const HANDSHAKE_EVENT_TYPE: &str = "campaign:state:request";

/// `GET /ws/{campaign_id}/{user_id}`
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path((campaign_id, user_id)): Path<(String, String)>,
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> Response {
    let origin = headers
        .get(header::ORIGIN)
        .and_then(|value| value.to_str().ok());
    if !state.config.origin_allowed(origin) {
        warn!(origin = origin.unwrap_or("<none>"), "WebSocket origin rejected");
        return StatusCode::FORBIDDEN.into_response();
    }

    let key = ClientKey::normalize(&campaign_id, &user_id);
    ws.max_message_size(MAX_FRAME_BYTES)
        .on_upgrade(move |socket| handle_connection(socket, key, state))
        .into_response()
}

async fn handle_connection(socket: WebSocket, key: ClientKey, state: SharedState) {
    info!(
        user_id = %key.user_id,
        campaign_id = %key.campaign_id,
        "WebSocket connected"
    );

    let (connection_id, rx) = state.register_client(&key);
    let (sender, mut receiver) = socket.split();
    let write_task = tokio::spawn(write_pump(sender, rx, key.clone()));

    // every new connection announces itself with a state request
    send_handshake(&state, &key).await;

    loop {
        match tokio::time::timeout(READ_DEADLINE, receiver.next()).await {
            Err(_) => {
                warn!(user_id = %key.user_id, "Read deadline exceeded, closing");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                debug!(user_id = %key.user_id, error = %e, "Socket read error");
                break;
            }
            Ok(Some(Ok(Message::Text(text)))) => {
                handle_text_frame(&state, &key, &text).await;
            }
            Ok(Some(Ok(Message::Close(_)))) => break,
            // pings and pongs refresh the deadline simply by arriving
            Ok(Some(Ok(_))) => {}
        }
    }

    state.unregister_client(&key, connection_id);
    write_task.abort();
    info!(
        user_id = %key.user_id,
        campaign_id = %key.campaign_id,
        "WebSocket disconnected"
    );
}

async fn write_pump(
    mut sender: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<OutgoingFrame>,
    key: ClientKey,
) {
    let mut ping = tokio::time::interval(PING_INTERVAL);

    loop {
        tokio::select! {
            frame = rx.recv() => {
                let Some(frame) = frame else { break };
                let text = match serde_json::to_string(&frame) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(error = %e, "Failed to encode outgoing frame");
                        continue;
                    }
                };
                match tokio::time::timeout(WRITE_DEADLINE, sender.send(Message::Text(text))).await {
                    Ok(Ok(())) => {}
                    _ => {
                        debug!(user_id = %key.user_id, "Socket write failed, closing");
                        break;
                    }
                }
            }
            _ = ping.tick() => {
                match tokio::time::timeout(WRITE_DEADLINE, sender.send(Message::Ping(Vec::new()))).await {
                    Ok(Ok(())) => {}
                    _ => {
                        debug!(user_id = %key.user_id, "Ping failed, closing");
                        break;
                    }
                }
            }
        }
    }
}

async fn handle_text_frame(state: &SharedState, key: &ClientKey, text: &str) {
    let frame = match decode_frame(text) {
        Ok(frame) => frame,
        Err(rejection) => {
            warn!(
                user_id = %key.user_id,
                rejection = ?rejection,
                "Client frame rejected"
            );
            return;
        }
    };

    let correlation_id = get_string(
        &frame.metadata,
        &["service_specific", "global", "correlation_id"],
    )
    .unwrap_or_else(|| Uuid::new_v4().to_string());

    // register the correlation and grow the subscription list with both the
    // request type and its expected reply
    let expected = event_type::expected_reply_type(&frame.event_type);
    state
        .pending
        .register(correlation_id.clone(), expected.clone(), key.clone());
    if state.relevant.extend([frame.event_type.clone(), expected]) {
        state.resubscribe.notify_one();
    }

    let mut metadata = frame.metadata;
    merge_gateway_context(&mut metadata, key, &correlation_id);
    let payload = clean_payload(frame.payload);

    debug!(
        user_id = %key.user_id,
        event_type = %frame.event_type,
        correlation_id = %correlation_id,
        "Forwarding client frame to Nexus"
    );

    emit_to_nexus(
        state,
        EventRequest {
            event_id: correlation_id,
            event_type: frame.event_type,
            entity_id: String::new(),
            campaign_id: key.campaign_id.clone(),
            metadata: metadata.to_string(),
            payload: payload.to_string(),
        },
    )
    .await;
}

/// Write the gateway's identity into both global branches, clobbering
/// whatever the client claimed.
fn merge_gateway_context(metadata: &mut Value, key: &ClientKey, correlation_id: &str) {
    for path in [&["global_context"][..], &["service_specific", "global"][..]] {
        let branch = ensure_object_mut(metadata, path);
        branch.insert("user_id".to_string(), json!(key.user_id));
        branch.insert("campaign_id".to_string(), json!(key.campaign_id));
        branch.insert("correlation_id".to_string(), json!(correlation_id));
    }
}

async fn emit_to_nexus(state: &SharedState, request: EventRequest) {
    let event_type = request.event_type.clone();
    let mut grpc_request = tonic::Request::new(request);
    grpc_request.set_timeout(EMIT_DEADLINE);

    let mut client = state.nexus.clone();
    match client.emit_event(grpc_request).await {
        Ok(response) => {
            let response = response.into_inner();
            if !response.success {
                warn!(
                    event_type = %event_type,
                    message = %response.message,
                    "Nexus rejected event"
                );
            }
        }
        Err(e) => {
            warn!(event_type = %event_type, error = %e, "EmitEvent failed");
        }
    }
}

/// The unsolicited campaign handshake carrying the connection identity.
pub async fn send_handshake(state: &SharedState, key: &ClientKey) {
    let correlation_id = Uuid::new_v4().to_string();
    let mut metadata = Value::Null;
    merge_gateway_context(&mut metadata, key, &correlation_id);

    emit_to_nexus(
        state,
        EventRequest {
            event_id: correlation_id,
            event_type: HANDSHAKE_EVENT_TYPE.to_string(),
            entity_id: String::new(),
            campaign_id: key.campaign_id.clone(),
            metadata: metadata.to_string(),
            payload: json!({}).to_string(),
        },
    )
    .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_gateway_context_clobbers_client_claims() {
        let key = ClientKey {
            campaign_id: "acme".to_string(),
            user_id: "u1".to_string(),
        };
        let mut metadata = json!({
            "global_context": {"user_id": "forged", "session_id": "s1"},
            "service_specific": {"global": {"campaign_id": "forged"}}
        });

        merge_gateway_context(&mut metadata, &key, "C1");

        assert_eq!(metadata["global_context"]["user_id"], json!("u1"));
        assert_eq!(metadata["global_context"]["campaign_id"], json!("acme"));
        assert_eq!(metadata["global_context"]["correlation_id"], json!("C1"));
        // unrelated fields survive
        assert_eq!(metadata["global_context"]["session_id"], json!("s1"));
        assert_eq!(
            metadata["service_specific"]["global"]["campaign_id"],
            json!("acme")
        );
        assert_eq!(
            metadata["service_specific"]["global"]["user_id"],
            json!("u1")
        );
    }

    #[test]
    fn test_merge_creates_branches_from_nothing() {
        let key = ClientKey {
            campaign_id: "0".to_string(),
            user_id: "guest_x".to_string(),
        };
        let mut metadata = Value::Null;

        merge_gateway_context(&mut metadata, &key, "C2");

        assert_eq!(
            metadata["service_specific"]["global"]["correlation_id"],
            json!("C2")
        );
    }
}
