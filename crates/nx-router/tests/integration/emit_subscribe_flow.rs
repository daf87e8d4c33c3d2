//! End-to-end emit -> publish -> subscribe flows on the in-memory adapters

use std::io::Write;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;

use nx_adapters::channel::ChannelConfig;
use nx_adapters::memory::{MemoryBroker, MemoryEventRepository, MemoryLock};
use nx_adapters::registry::{ServiceEndpoint, ServiceRegistration};
use nx_adapters::retry::{AlertFn, DeliverFn, RetryConfig, RetryWorker};
use nx_domain::{DeliveryStatus, EventEnvelope};
use nx_ports::MessageBroker;
use nx_router::bus::MultiBus;
use nx_router::campaign::{CampaignManager, CampaignManagerConfig};
use nx_router::ingress::{EmitRequest, EventIngress};
use nx_router::multiplexer::{EventMultiplexer, SubscribeSpec};

struct Harness {
    bus: Arc<MultiBus>,
    ingress: Arc<EventIngress>,
    multiplexer: EventMultiplexer,
    repository: Arc<MemoryEventRepository>,
    _default_campaign: tempfile::NamedTempFile,
}

async fn harness() -> Harness {
    let registrations = vec![ServiceRegistration {
        name: "user".to_string(),
        version: "v1".to_string(),
        endpoints: vec![ServiceEndpoint {
            path: "/api/user".to_string(),
            method: "POST".to_string(),
            actions: vec!["create".to_string()],
        }],
    }];

    let broker: Arc<dyn MessageBroker> = Arc::new(MemoryBroker::new());
    let bus = Arc::new(
        MultiBus::open(broker, &registrations, ChannelConfig::default())
            .await
            .unwrap(),
    );

    let mut default_campaign = tempfile::NamedTempFile::new().unwrap();
    default_campaign
        .write_all(br#"{"slug": "ovasabi_website"}"#)
        .unwrap();
    let campaigns = CampaignManager::start(
        bus.clone(),
        None,
        CampaignManagerConfig {
            default_campaign_path: default_campaign.path().to_path_buf(),
            campaigns_seed_path: None,
        },
    )
    .await
    .unwrap();

    let repository = Arc::new(MemoryEventRepository::new());
    let ingress = Arc::new(EventIngress::new(
        bus.clone(),
        Arc::new(MemoryLock::new()),
        Some(repository.clone()),
        campaigns,
    ));
    let multiplexer = EventMultiplexer::new(bus.clone());

    Harness {
        bus,
        ingress,
        multiplexer,
        repository,
        _default_campaign: default_campaign,
    }
}

fn emit(event_id: &str, event_type: &str, payload: serde_json::Value) -> EmitRequest {
    EmitRequest {
        event_id: event_id.to_string(),
        event_type: event_type.to_string(),
        entity_id: String::new(),
        campaign_id: String::new(),
        metadata: json!({}),
        payload,
    }
}

async fn recv(
    rx: &mut tokio::sync::mpsc::Receiver<EventEnvelope>,
) -> Option<EventEnvelope> {
    tokio::time::timeout(Duration::from_millis(500), rx.recv())
        .await
        .ok()
        .flatten()
}

#[tokio::test]
async fn echo_round_trip_preserves_id_and_payload() {
    let harness = harness().await;

    // subscriber registered before emit, default channel
    let mut rx = harness.multiplexer.open(SubscribeSpec::default());

    let outcome = harness
        .ingress
        .emit_event(emit("ECHO-1", "echo", json!({"ping": "pong"})))
        .await;
    assert!(outcome.success);

    let received = recv(&mut rx).await.expect("echo not delivered");
    assert_eq!(received.event_id, "ECHO-1");
    assert_eq!(received.event_type, "echo");
    assert_eq!(received.payload, json!({"ping": "pong"}));
}

#[tokio::test]
async fn registered_action_routes_and_dedups_by_event_id() {
    let harness = harness().await;

    let mut rx = harness.multiplexer.open(SubscribeSpec {
        event_types: vec!["user:create:v1:requested".to_string()],
        ..Default::default()
    });

    harness
        .ingress
        .emit_event(emit("E1", "user:create:v1:requested", json!({"name": "ada"})))
        .await;

    let received = recv(&mut rx).await.expect("event not delivered");
    assert_eq!(received.event_id, "E1");
    assert_eq!(received.event_type, "user:create:v1:requested");

    // immediate re-emit with the same id inside the 3s lock window
    let second = harness
        .ingress
        .emit_event(emit("E1", "user:create:v1:requested", json!({"name": "ada"})))
        .await;
    assert!(second.success);
    assert!(recv(&mut rx).await.is_none(), "duplicate reached the broker");
}

#[tokio::test]
async fn user_filter_selects_matching_envelopes_only() {
    let harness = harness().await;

    let mut rx = harness.multiplexer.open(SubscribeSpec {
        event_types: vec!["user:create:v1:success".to_string()],
        user_id: Some("u1".to_string()),
        campaign_id: None,
    });

    for (id, user) in [("A", "u1"), ("B", "u2")] {
        let mut request = emit(id, "user:create:v1:success", json!({"user_id": user}));
        request.metadata = json!({"global_context": {"user_id": user}});
        harness.ingress.emit_event(request).await;
    }

    let only = recv(&mut rx).await.expect("filtered envelope not delivered");
    assert_eq!(only.event_id, "A");
    assert!(recv(&mut rx).await.is_none());
}

#[tokio::test]
async fn unsubscribed_event_stays_pending_until_retry_delivers() {
    let harness = harness().await;

    // no subscribers yet: the publish lands nowhere but the record persists
    harness
        .ingress
        .emit_event(emit("R1", "user:create:v1:requested", json!({})))
        .await;
    assert_eq!(
        harness.repository.all().await[0].status,
        DeliveryStatus::Pending
    );

    // a subscriber appears; the retry worker re-offers the pending record
    let mut rx = harness.multiplexer.open(SubscribeSpec {
        event_types: vec!["user:create:v1:requested".to_string()],
        ..Default::default()
    });

    let deliver_bus = harness.bus.clone();
    let deliver: DeliverFn = Arc::new(move |envelope| deliver_bus.deliver_local(envelope));
    let alert: AlertFn = Arc::new(|_| {});
    let worker = RetryWorker::new(
        harness.repository.clone(),
        deliver,
        alert,
        RetryConfig::default(),
        Arc::new(AtomicBool::new(true)),
    );
    worker.process_batch(Utc::now()).await.unwrap();

    let redelivered = recv(&mut rx).await.expect("redelivery not observed");
    assert_eq!(redelivered.event_id, "R1");
    assert_eq!(
        harness.repository.all().await[0].status,
        DeliveryStatus::Delivered
    );
}

#[tokio::test]
async fn sequences_survive_concurrent_emitters() {
    let harness = harness().await;

    let mut handles = Vec::new();
    for i in 0..20 {
        let ingress = harness.ingress.clone();
        handles.push(tokio::spawn(async move {
            ingress
                .emit_event(emit(
                    &format!("C{}", i),
                    "user:create:v1:requested",
                    json!({}),
                ))
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let mut sequences: Vec<u64> = harness
        .repository
        .all()
        .await
        .iter()
        .map(|r| r.nexus_sequence)
        .collect();
    sequences.sort_unstable();
    let expected: Vec<u64> = (1..=20).collect();
    assert_eq!(sequences, expected);
}
