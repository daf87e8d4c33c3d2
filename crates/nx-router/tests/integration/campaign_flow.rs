//! Stateful campaign flows through ingress and the feedback bus

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use nx_adapters::channel::ChannelConfig;
use nx_adapters::memory::{MemoryBroker, MemoryCampaignRepository, MemoryLock};
use nx_domain::EventEnvelope;
use nx_ports::{CampaignRepository, CampaignRow, MessageBroker};
use nx_router::bus::MultiBus;
use nx_router::campaign::{CampaignManager, CampaignManagerConfig};
use nx_router::ingress::{EmitRequest, EventIngress};
use nx_router::multiplexer::{EventMultiplexer, SubscribeSpec};

struct Harness {
    ingress: Arc<EventIngress>,
    multiplexer: EventMultiplexer,
    campaigns: Arc<CampaignManager>,
    repository: Arc<MemoryCampaignRepository>,
    _default_campaign: tempfile::NamedTempFile,
}

async fn harness() -> Harness {
    let broker: Arc<dyn MessageBroker> = Arc::new(MemoryBroker::new());
    let bus = Arc::new(
        MultiBus::open(broker, &[], ChannelConfig::default())
            .await
            .unwrap(),
    );

    let repository = Arc::new(MemoryCampaignRepository::new());
    repository
        .insert(CampaignRow {
            slug: "acme".to_string(),
            title: "Acme".to_string(),
            metadata: json!({"features": ["search"]}),
        })
        .await;

    let mut default_campaign = tempfile::NamedTempFile::new().unwrap();
    default_campaign
        .write_all(br#"{"slug": "ovasabi_website", "title": "Ovasabi Website"}"#)
        .unwrap();

    let campaigns = CampaignManager::start(
        bus.clone(),
        Some(repository.clone() as Arc<dyn CampaignRepository>),
        CampaignManagerConfig {
            default_campaign_path: default_campaign.path().to_path_buf(),
            campaigns_seed_path: None,
        },
    )
    .await
    .unwrap();

    let ingress = Arc::new(EventIngress::new(
        bus.clone(),
        Arc::new(MemoryLock::new()),
        None,
        campaigns.clone(),
    ));
    let multiplexer = EventMultiplexer::new(bus);

    Harness {
        ingress,
        multiplexer,
        campaigns,
        repository,
        _default_campaign: default_campaign,
    }
}

fn campaign_request(
    event_type: &str,
    user_id: &str,
    correlation: &str,
    payload: serde_json::Value,
) -> EmitRequest {
    EmitRequest {
        event_id: String::new(),
        event_type: event_type.to_string(),
        entity_id: String::new(),
        campaign_id: String::new(),
        metadata: json!({"global_context": {"user_id": user_id, "correlation_id": correlation}}),
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
async fn list_request_produces_correlated_success() {
    let harness = harness().await;
    let mut rx = harness.multiplexer.open(SubscribeSpec::default());

    let outcome = harness
        .ingress
        .emit_event(campaign_request(
            "campaign:list:v1:requested",
            "u1",
            "C9",
            json!({"data": {"correlationId": "C9"}}),
        ))
        .await;
    assert!(outcome.success);

    let reply = recv(&mut rx).await.expect("no list reply");
    assert_eq!(reply.event_type, "campaign:list:v1:success");
    assert_eq!(reply.event_id, "C9");
    assert_eq!(reply.payload["correlationId"], json!("C9"));
    assert_eq!(reply.payload["user_id"], json!("u1"));

    let slugs: Vec<&str> = reply.payload["campaigns"]
        .as_array()
        .unwrap()
        .iter()
        .map(|c| c["slug"].as_str().unwrap())
        .collect();
    assert!(slugs.contains(&"ovasabi_website"));
    assert!(slugs.contains(&"acme"));
}

#[tokio::test]
async fn update_of_missing_slug_fails_and_leaves_state_alone() {
    let harness = harness().await;
    let mut rx = harness.multiplexer.open(SubscribeSpec::default());
    let campaigns_before = harness.campaigns.campaign_count().await;

    harness
        .ingress
        .emit_event(campaign_request(
            "campaign:update:v1:requested",
            "u1",
            "C3",
            json!({"data": {"campaignId": "ghost", "updates": {"title": "x"}}}),
        ))
        .await;

    let reply = recv(&mut rx).await.expect("no failure reply");
    assert_eq!(reply.event_type, "campaign:state:v1:failed");
    assert!(!reply.success);
    assert_eq!(reply.message, "Campaign not found");

    assert_eq!(harness.campaigns.campaign_count().await, campaigns_before);
    assert!(harness.campaigns.get_state("ghost").await.is_none());
}

#[tokio::test]
async fn update_flows_through_repository_into_state() {
    let harness = harness().await;
    let mut rx = harness.multiplexer.open(SubscribeSpec::default());

    harness
        .ingress
        .emit_event(campaign_request(
            "campaign:update:v1:requested",
            "u1",
            "C4",
            json!({"data": {"campaignId": "acme", "updates": {"headline": "Hello"}}}),
        ))
        .await;

    let reply = recv(&mut rx).await.expect("no update reply");
    assert_eq!(reply.event_type, "campaign:state:v1:success");
    assert_eq!(reply.payload["headline"], json!("Hello"));

    let row = harness.repository.get_by_slug("acme").await.unwrap().unwrap();
    assert_eq!(
        row.metadata["service_specific"]["campaign"]["headline"],
        json!("Hello")
    );
}

#[tokio::test]
async fn switch_reply_arrives_before_any_close() {
    let harness = harness().await;
    let mut rx = harness.multiplexer.open(SubscribeSpec::default());

    let outcome = harness
        .ingress
        .emit_event(campaign_request(
            "campaign:switch:v1:requested",
            "u1",
            "C5",
            json!({}),
        ))
        .await;

    // the emit returns only after the switch success is on the bus
    assert!(outcome.success);
    let reply = recv(&mut rx).await.expect("no switch reply");
    assert_eq!(reply.event_type, "campaign:switch:v1:success");
    assert_eq!(reply.payload["status"], json!("active"));
}

#[tokio::test]
async fn legacy_handshake_form_is_answered() {
    let harness = harness().await;
    let mut rx = harness.multiplexer.open(SubscribeSpec::default());

    harness
        .ingress
        .emit_event(campaign_request(
            "campaign:state:request",
            "u1",
            "H1",
            json!({}),
        ))
        .await;

    let reply = recv(&mut rx).await.expect("no handshake reply");
    assert_eq!(reply.event_type, "campaign:state:v1:success");
    assert_eq!(reply.event_id, "H1");
    assert_eq!(reply.payload["user_id"], json!("u1"));
}

#[tokio::test]
async fn godot_requests_mirror_to_godot_stream() {
    let harness = harness().await;
    let mut rx = harness.multiplexer.open(SubscribeSpec::default());
    let mut godot = harness
        .campaigns
        .subscribe("ovasabi_website", "godot")
        .await;

    harness
        .ingress
        .emit_event(campaign_request(
            "campaign:state:v1:requested",
            "godot",
            "G1",
            json!({}),
        ))
        .await;

    let reply = recv(&mut rx).await.expect("no godot reply");
    assert_eq!(reply.event_type, "campaign:state:v1:godot_update");

    let mirrored = tokio::time::timeout(Duration::from_millis(500), godot.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(mirrored.event_id, "G1");
}
