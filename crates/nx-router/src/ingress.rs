//! Event ingress
//!
//! The emit pipeline: validate the event type, assign an id, enrich metadata
//! with the node sequence, then either delegate stateful campaign events to
//! the campaign manager or deduplicate via the distributed lock and publish
//! through the multi-bus. The durable store is appended on the publish path
//! regardless of the dedup outcome; broker failures leave the record pending
//! for the retry worker.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::bus::MultiBus;
use crate::campaign::CampaignManager;
use nx_domain::{ensure_object_mut, event_type, EventEnvelope, EventRecord};
use nx_ports::{EventLock, EventRepository};

/// Dedup lock key prefix
pub const EVENT_LOCK_PREFIX: &str = "nexus:event_lock:";

/// Dedup window per event id, per node
pub const EVENT_LOCK_TTL: Duration = Duration::from_secs(3);

/// One decoded emit request
#[derive(Debug, Clone)]
pub struct EmitRequest {
    pub event_id: String,
    pub event_type: String,
    pub entity_id: String,
    pub campaign_id: String,
    pub metadata: Value,
    pub payload: Value,
}

/// The caller-visible outcome of an emit
#[derive(Debug, Clone)]
pub struct EmitOutcome {
    pub success: bool,
    pub message: String,
    pub metadata: Value,
}

/// The emit pipeline
pub struct EventIngress {
    bus: Arc<MultiBus>,
    lock: Arc<dyn EventLock>,
    repository: Option<Arc<dyn EventRepository>>,
    campaigns: Arc<CampaignManager>,
    sequence: AtomicU64,
    node_id: String,
    last_emitted_at: std::sync::Mutex<Option<DateTime<Utc>>>,
}

impl EventIngress {
    pub fn new(
        bus: Arc<MultiBus>,
        lock: Arc<dyn EventLock>,
        repository: Option<Arc<dyn EventRepository>>,
        campaigns: Arc<CampaignManager>,
    ) -> Self {
        Self {
            bus,
            lock,
            repository,
            campaigns,
            sequence: AtomicU64::new(0),
            node_id: format!("nexus_{}", ulid::Ulid::new()),
            last_emitted_at: std::sync::Mutex::new(None),
        }
    }

    /// The sequence most recently assigned by this instance.
    pub fn current_sequence(&self) -> u64 {
        self.sequence.load(Ordering::Relaxed)
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Run one event through the pipeline.
    pub async fn emit_event(&self, request: EmitRequest) -> EmitOutcome {
        // grammar is authoritative: invalid types never publish
        if !event_type::is_valid(&request.event_type) {
            warn!(event_type = %request.event_type, "Rejected invalid event type");
            return EmitOutcome {
                success: false,
                message: format!("invalid event type '{}'", request.event_type),
                metadata: request.metadata,
            };
        }

        let event_id = if request.event_id.is_empty() {
            EventEnvelope::generate_event_id()
        } else {
            request.event_id.clone()
        };

        let (metadata, sequence, emitted_at) = self.enrich_metadata(&request);

        let envelope = EventEnvelope {
            success: !request.event_type.ends_with(":failed"),
            event_id: event_id.clone(),
            event_type: request.event_type.clone(),
            message: String::new(),
            metadata,
            payload: request.payload.clone(),
        };

        // stateful campaign events never hit the broker from here; the
        // campaign manager owns the reply envelope
        if event_type::is_stateful_campaign(&envelope.event_type) {
            if let Err(e) = self.campaigns.handle_event(&envelope).await {
                error!(
                    event_id = %envelope.event_id,
                    event_type = %envelope.event_type,
                    error = %e,
                    "Campaign manager failed to process event"
                );
            }
            return EmitOutcome {
                success: true,
                message: "campaign event delegated".to_string(),
                metadata: envelope.metadata,
            };
        }

        // durable first: a broker failure must leave a pending record behind
        if let Some(repository) = &self.repository {
            let record = EventRecord::from_envelope(&envelope, sequence, emitted_at);
            if let Err(e) = repository.save_event(&record).await {
                error!(event_id = %envelope.event_id, error = %e, "Durable append failed");
            }
        }

        let deduped = !self.acquire_dedup_lock(&event_id).await;
        if deduped {
            debug!(event_id = %event_id, "Duplicate emit suppressed within lock window");
        } else if let Err(e) = self.bus.publish(&envelope).await {
            // the durable record stays pending; the retry worker redelivers
            error!(
                event_id = %envelope.event_id,
                event_type = %envelope.event_type,
                error = %e,
                "Broker publish failed, record remains pending"
            );
        }

        let success = !envelope.event_type.ends_with(":failed");
        EmitOutcome {
            success,
            message: if deduped {
                "duplicate event deduplicated".to_string()
            } else {
                "event emitted".to_string()
            },
            metadata: envelope.metadata,
        }
    }

    /// Assign the node sequence and emitter timestamp into `metadata.nexus`,
    /// folding the request's entity/campaign hints into the global context
    /// when it does not carry them yet.
    fn enrich_metadata(&self, request: &EmitRequest) -> (Value, u64, DateTime<Utc>) {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let now = Utc::now();

        // sequence never rewinds with the clock; skew is only observed
        {
            let mut last = self.last_emitted_at.lock().expect("emit clock poisoned");
            match *last {
                Some(previous) if now < previous => {
                    warn!(
                        previous = %previous.to_rfc3339(),
                        observed = %now.to_rfc3339(),
                        sequence = sequence,
                        "Clock rewind observed at ingress"
                    );
                }
                _ => *last = Some(now),
            }
        }

        let mut metadata = request.metadata.clone();
        {
            let nexus = ensure_object_mut(&mut metadata, &["nexus"]);
            nexus.insert("sequence".to_string(), json!(sequence));
            nexus.insert("node_id".to_string(), json!(self.node_id));
            nexus.insert(
                "emitted_at".to_string(),
                json!(now.to_rfc3339_opts(SecondsFormat::Nanos, true)),
            );
            if !request.entity_id.is_empty() {
                nexus.insert("entity_id".to_string(), json!(request.entity_id));
            }
        }
        if !request.campaign_id.is_empty() {
            let global = ensure_object_mut(&mut metadata, &["global_context"]);
            global
                .entry("campaign_id".to_string())
                .or_insert_with(|| json!(request.campaign_id));
        }

        (metadata, sequence, now)
    }

    async fn acquire_dedup_lock(&self, event_id: &str) -> bool {
        let key = format!("{}{}", EVENT_LOCK_PREFIX, event_id);
        match self.lock.acquire(&key, EVENT_LOCK_TTL).await {
            Ok(acquired) => acquired,
            Err(e) => {
                // lock loss degrades to at-least-once within the window
                warn!(event_id = %event_id, error = %e, "Dedup lock unavailable, publishing anyway");
                true
            }
        }
    }
}
