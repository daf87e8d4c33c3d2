//! Campaign State Manager
//!
//! An in-memory, per-campaign aggregate with subscriber fan-out. Campaigns
//! are seeded at startup from the default-campaign file (required), the
//! campaign repository when configured, and otherwise the campaigns seed
//! file. Stateful `campaign:*` requests are handled here and answered with
//! exactly one envelope on the feedback bus per successful handler
//! invocation; the reply's `event_id` is the caller's correlation id.

use chrono::Utc;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use crate::bus::MultiBus;
use nx_adapters::config::{load_campaigns_seed, load_default_campaign, ConfigError};
use nx_domain::{
    ensure_object_mut, extract_campaign_id, extract_correlation, extract_global, get_path,
    get_string, CampaignState, EventEnvelope, FeatureAction,
};
use nx_ports::CampaignRepository;

/// Reserved user id whose state requests are mirrored onto the godot stream
pub const GODOT_USER_ID: &str = "godot";

/// Reply type used instead of the state success for the godot user
pub const GODOT_UPDATE_TYPE: &str = "campaign:state:v1:godot_update";

/// Legacy three-part handshake form accepted as an alias
pub const STATE_REQUEST_ALIAS: &str = "campaign:state:request";

const STATE_REQUESTED: &str = "campaign:state:v1:requested";
const STATE_SUCCESS: &str = "campaign:state:v1:success";
const STATE_FAILED: &str = "campaign:state:v1:failed";
const LIST_SUCCESS: &str = "campaign:list:v1:success";
const SWITCH_SUCCESS: &str = "campaign:switch:v1:success";

/// Depth of each campaign subscriber queue
pub const SUBSCRIBER_QUEUE_CAPACITY: usize = 32;

/// Campaigns loaded from the repository at startup and per list request
pub const REPOSITORY_LIST_LIMIT: usize = 1000;

/// Duplicate requests within this window are suppressed
const DEDUP_WINDOW: Duration = Duration::from_secs(2);

/// Processed-event entries older than this are swept
const DEDUP_SWEEP_AGE: Duration = Duration::from_secs(30);

/// Synthetic drop markers buffered per subscriber
const DROP_BUFFER_CAPACITY: usize = 32;

/// Campaign manager errors
#[derive(Debug, thiserror::Error)]
pub enum CampaignManagerError {
    #[error("Startup error: {0}")]
    Startup(#[from] ConfigError),

    #[error("Feedback publish failed: {message}")]
    Feedback { message: String },
}

/// Campaign manager configuration
#[derive(Debug, Clone)]
pub struct CampaignManagerConfig {
    /// The default campaign file; startup aborts when it cannot be loaded
    pub default_campaign_path: PathBuf,
    /// Fallback seed consulted when neither memory nor the repository has
    /// campaigns beyond the default
    pub campaigns_seed_path: Option<PathBuf>,
}

struct SubscriberHandle {
    tx: mpsc::Sender<EventEnvelope>,
    pending_drops: Arc<std::sync::Mutex<VecDeque<EventEnvelope>>>,
}

/// Consumer side of one campaign subscription
pub struct CampaignSubscription {
    rx: mpsc::Receiver<EventEnvelope>,
    pending_drops: Arc<std::sync::Mutex<VecDeque<EventEnvelope>>>,
}

impl CampaignSubscription {
    /// Receive the next update; drop markers surface before queued frames.
    pub async fn recv(&mut self) -> Option<EventEnvelope> {
        if let Some(dropped) = self.take_pending_drop() {
            return Some(dropped);
        }
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<EventEnvelope> {
        if let Some(dropped) = self.take_pending_drop() {
            return Some(dropped);
        }
        self.rx.try_recv().ok()
    }

    fn take_pending_drop(&self) -> Option<EventEnvelope> {
        self.pending_drops
            .lock()
            .expect("drop buffer poisoned")
            .pop_front()
    }
}

/// The per-campaign aggregate store
pub struct CampaignManager {
    bus: Arc<MultiBus>,
    repository: Option<Arc<dyn CampaignRepository>>,
    default_slug: String,
    campaigns: RwLock<HashMap<String, CampaignState>>,
    subscribers: RwLock<HashMap<String, HashMap<String, SubscriberHandle>>>,
    processed: std::sync::Mutex<HashMap<String, Instant>>,
    update_counter: AtomicU64,
}

impl CampaignManager {
    /// Load seed state and return the running manager. A missing or invalid
    /// default campaign file aborts startup.
    pub async fn start(
        bus: Arc<MultiBus>,
        repository: Option<Arc<dyn CampaignRepository>>,
        config: CampaignManagerConfig,
    ) -> Result<Arc<Self>, CampaignManagerError> {
        let (default_slug, default_object) = load_default_campaign(&config.default_campaign_path)?;

        let mut campaigns = HashMap::new();
        campaigns.insert(
            default_slug.clone(),
            CampaignState::from_config_object(&default_slug, &default_object, Utc::now()),
        );

        let mut db_campaigns = 0;
        if let Some(repo) = &repository {
            match repo.list(REPOSITORY_LIST_LIMIT).await {
                Ok(rows) => {
                    db_campaigns = rows.len();
                    for row in rows {
                        campaigns.insert(
                            row.slug.clone(),
                            CampaignState::from_repository_metadata(
                                &row.slug,
                                &row.metadata,
                                Utc::now(),
                            ),
                        );
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Campaign repository unavailable at startup");
                }
            }
        }

        if db_campaigns == 0 {
            if let Some(seed_path) = &config.campaigns_seed_path {
                match load_campaigns_seed(seed_path) {
                    Ok(seeded) => {
                        for (slug, object) in seeded {
                            campaigns.entry(slug.clone()).or_insert_with(|| {
                                CampaignState::from_config_object(&slug, &object, Utc::now())
                            });
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "Campaigns seed not loaded");
                    }
                }
            }
        }

        info!(
            default_slug = %default_slug,
            campaigns = campaigns.len(),
            db_campaigns = db_campaigns,
            "Campaign manager started"
        );

        Ok(Arc::new(Self {
            bus,
            repository,
            default_slug,
            campaigns: RwLock::new(campaigns),
            subscribers: RwLock::new(HashMap::new()),
            processed: std::sync::Mutex::new(HashMap::new()),
            update_counter: AtomicU64::new(0),
        }))
    }

    pub fn default_slug(&self) -> &str {
        &self.default_slug
    }

    /// Shallow state snapshot for a campaign.
    pub async fn get_state(&self, slug: &str) -> Option<Map<String, Value>> {
        let campaigns = self.campaigns.read().await;
        campaigns.get(slug).map(|c| c.snapshot())
    }

    pub async fn campaign_count(&self) -> usize {
        self.campaigns.read().await.len()
    }

    // ------------------------------------------------------------------
    // Event handling
    // ------------------------------------------------------------------

    /// Handle one stateful campaign event. Only `:requested` / `:started`
    /// events are processed; everything else is ignored. Handler failures
    /// surface as `campaign:state:v1:failed` envelopes, not errors.
    pub async fn handle_event(&self, envelope: &EventEnvelope) -> Result<(), CampaignManagerError> {
        let event_type = normalize_alias(&envelope.event_type);

        if !(event_type.ends_with(":requested") || event_type.ends_with(":started")) {
            debug!(event_type = %event_type, "Non-request campaign event ignored");
            return Ok(());
        }

        let correlation = self.correlation_for(envelope);
        let identity = self.event_identity(&event_type, envelope, &correlation);
        if self.already_processed(&identity) {
            debug!(
                event_type = %event_type,
                correlation_id = %correlation,
                "Duplicate campaign request suppressed"
            );
            return Ok(());
        }

        match event_type.split(':').nth(1).unwrap_or_default() {
            "state" => self.handle_state(envelope, &correlation).await,
            "list" => self.handle_list(envelope, &correlation).await,
            "update" => self.handle_update(envelope, &correlation).await,
            "switch" => self.handle_switch(envelope, &correlation).await,
            "feature" => self.handle_feature(envelope, &correlation).await,
            "config" => self.handle_config(envelope, &correlation).await,
            other => {
                debug!(action = %other, "Campaign event without a handler ignored");
                Ok(())
            }
        }
    }

    async fn handle_state(
        &self,
        envelope: &EventEnvelope,
        correlation: &str,
    ) -> Result<(), CampaignManagerError> {
        let global = extract_global(&envelope.metadata);
        let slug = self.campaign_key(envelope);
        let user_id = global.user_id.clone();

        let decorated = self
            .with_campaign_mut(&slug, |campaign| {
                campaign.decorated(&user_id, &slug, correlation)
            })
            .await;

        let reply_type = if user_id == GODOT_USER_ID {
            GODOT_UPDATE_TYPE
        } else {
            STATE_SUCCESS
        };
        let reply = self.reply_envelope(envelope, reply_type, correlation, decorated, "campaign state");

        if user_id == GODOT_USER_ID {
            self.offer_subscriber(&slug, GODOT_USER_ID, &reply).await;
        }
        self.publish_feedback(reply).await
    }

    async fn handle_list(
        &self,
        envelope: &EventEnvelope,
        correlation: &str,
    ) -> Result<(), CampaignManagerError> {
        let global = extract_global(&envelope.metadata);

        let mut seen = HashSet::new();
        let mut entries = Vec::new();

        // repository campaigns take precedence by slug
        if let Some(repo) = &self.repository {
            match repo.list(REPOSITORY_LIST_LIMIT).await {
                Ok(rows) => {
                    for row in rows {
                        let mut campaign = CampaignState::from_repository_metadata(
                            &row.slug,
                            &row.metadata,
                            Utc::now(),
                        );
                        if !row.title.is_empty() && !campaign.state.contains_key("title") {
                            campaign
                                .state
                                .insert("title".to_string(), Value::String(row.title.clone()));
                        }
                        if seen.insert(row.slug.clone()) {
                            entries.push(campaign.list_entry());
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Campaign repository list failed, serving memory only");
                }
            }
        }

        {
            let campaigns = self.campaigns.read().await;
            for (slug, campaign) in campaigns.iter() {
                if seen.insert(slug.clone()) {
                    entries.push(campaign.list_entry());
                }
            }
        }

        // the default campaign slug is an invariant of every listing
        if !seen.contains(&self.default_slug) {
            entries.push(CampaignState::new(&self.default_slug, Utc::now()).list_entry());
        }

        let total = entries.len();
        let payload = json!({
            "campaigns": entries,
            "total": total,
            "limit": REPOSITORY_LIST_LIMIT,
            "offset": 0,
            "user_id": global.user_id,
            "campaign_id": global.campaign_id,
            "correlationId": correlation,
            "source": global.source,
        });

        let reply = self.reply_envelope(envelope, LIST_SUCCESS, correlation, payload, "campaign list");
        self.publish_feedback(reply).await
    }

    async fn handle_update(
        &self,
        envelope: &EventEnvelope,
        correlation: &str,
    ) -> Result<(), CampaignManagerError> {
        let global = extract_global(&envelope.metadata);
        let slug = get_string(&envelope.payload, &["data", "campaignId"])
            .or_else(|| get_string(&envelope.payload, &["data", "slug"]))
            .unwrap_or_default();
        let updates = update_tree(&envelope.payload);

        if slug.is_empty() {
            return self
                .emit_state_failed(envelope, correlation, "Campaign not found")
                .await;
        }

        // the repository write gates both the state mutation and the success
        if let Some(repo) = &self.repository {
            match repo.get_by_slug(&slug).await {
                Ok(Some(row)) => {
                    let mut metadata = row.metadata.clone();
                    {
                        let branch =
                            ensure_object_mut(&mut metadata, &["service_specific", "campaign"]);
                        for (key, value) in &updates {
                            branch.insert(key.clone(), value.clone());
                        }
                    }
                    if let Err(e) = repo.update_metadata(&slug, &metadata).await {
                        warn!(slug = %slug, error = %e, "Campaign update write failed");
                        return self
                            .emit_state_failed(
                                envelope,
                                correlation,
                                &format!("Campaign update failed: {}", e),
                            )
                            .await;
                    }
                }
                Ok(None) => {
                    return self
                        .emit_state_failed(envelope, correlation, "Campaign not found")
                        .await;
                }
                Err(e) => {
                    warn!(slug = %slug, error = %e, "Campaign lookup failed");
                    return self
                        .emit_state_failed(
                            envelope,
                            correlation,
                            &format!("Campaign lookup failed: {}", e),
                        )
                        .await;
                }
            }
        } else {
            let known = self.campaigns.read().await.contains_key(&slug);
            if !known {
                return self
                    .emit_state_failed(envelope, correlation, "Campaign not found")
                    .await;
            }
        }

        let user_id = global.user_id.clone();
        let decorated = self
            .with_campaign_mut(&slug, |campaign| {
                campaign.apply_updates(&updates, Utc::now());
                campaign.decorated(&user_id, &slug, correlation)
            })
            .await;

        let reply =
            self.reply_envelope(envelope, STATE_SUCCESS, correlation, decorated, "campaign updated");
        self.publish_feedback(reply).await
    }

    async fn handle_switch(
        &self,
        envelope: &EventEnvelope,
        correlation: &str,
    ) -> Result<(), CampaignManagerError> {
        let global = extract_global(&envelope.metadata);
        let slug = self.campaign_key(envelope);
        let user_id = global.user_id.clone();

        // session-level update only; nothing is persisted for a switch
        let decorated = self
            .with_campaign_mut(&slug, |campaign| {
                campaign.apply_switch(Utc::now());
                campaign.decorated(&user_id, &slug, correlation)
            })
            .await;

        let reply =
            self.reply_envelope(envelope, SWITCH_SUCCESS, correlation, decorated, "campaign switched");
        self.publish_feedback(reply).await
    }

    async fn handle_feature(
        &self,
        envelope: &EventEnvelope,
        correlation: &str,
    ) -> Result<(), CampaignManagerError> {
        let global = extract_global(&envelope.metadata);
        let slug = self.campaign_key(envelope);

        let action_name =
            get_string(&envelope.payload, &["data", "action"]).unwrap_or_default();
        let action = match FeatureAction::parse(&action_name) {
            Ok(action) => action,
            Err(e) => {
                return self
                    .emit_state_failed(envelope, correlation, &e.to_string())
                    .await;
            }
        };

        let features = feature_list(&envelope.payload);
        let user_id = global.user_id.clone();
        let decorated = self
            .with_campaign_mut(&slug, |campaign| {
                campaign.mutate_features(action, &features, Utc::now());
                campaign.decorated(&user_id, &slug, correlation)
            })
            .await;

        let reply =
            self.reply_envelope(envelope, STATE_SUCCESS, correlation, decorated, "campaign features");
        self.publish_feedback(reply).await
    }

    async fn handle_config(
        &self,
        envelope: &EventEnvelope,
        correlation: &str,
    ) -> Result<(), CampaignManagerError> {
        let global = extract_global(&envelope.metadata);
        let slug = self.campaign_key(envelope);

        let config_type = get_string(&envelope.payload, &["data", "config_type"])
            .or_else(|| get_string(&envelope.payload, &["data", "configType"]));
        let config_type = match config_type {
            Some(config_type) => config_type,
            None => {
                return self
                    .emit_state_failed(envelope, correlation, "Missing config_type")
                    .await;
            }
        };
        let config = get_path(&envelope.payload, &["data", "config"])
            .cloned()
            .unwrap_or_else(|| Value::Object(Map::new()));

        let user_id = global.user_id.clone();
        let decorated = self
            .with_campaign_mut(&slug, |campaign| {
                campaign.set_config(&config_type, config, Utc::now());
                campaign.decorated(&user_id, &slug, correlation)
            })
            .await;

        let reply =
            self.reply_envelope(envelope, STATE_SUCCESS, correlation, decorated, "campaign config");
        self.publish_feedback(reply).await
    }

    // ------------------------------------------------------------------
    // Subscribers
    // ------------------------------------------------------------------

    /// Open a bounded subscription for `(campaign, user)`. An existing
    /// subscription for the same pair is closed first.
    pub async fn subscribe(&self, campaign_id: &str, user_id: &str) -> CampaignSubscription {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_CAPACITY);
        let pending_drops = Arc::new(std::sync::Mutex::new(VecDeque::new()));

        let mut subscribers = self.subscribers.write().await;
        let users = subscribers.entry(campaign_id.to_string()).or_default();
        if users
            .insert(
                user_id.to_string(),
                SubscriberHandle {
                    tx,
                    pending_drops: pending_drops.clone(),
                },
            )
            .is_some()
        {
            debug!(
                campaign_id = %campaign_id,
                user_id = %user_id,
                "Replaced existing campaign subscription"
            );
        }

        CampaignSubscription { rx, pending_drops }
    }

    /// Close the `(campaign, user)` subscription; buffered frames drain
    /// before the receiver observes the close.
    pub async fn unsubscribe(&self, campaign_id: &str, user_id: &str) {
        let mut subscribers = self.subscribers.write().await;
        if let Some(users) = subscribers.get_mut(campaign_id) {
            users.remove(user_id);
            if users.is_empty() {
                subscribers.remove(campaign_id);
            }
        }
    }

    async fn offer_subscriber(&self, campaign_id: &str, user_id: &str, envelope: &EventEnvelope) {
        let subscribers = self.subscribers.read().await;
        let Some(handle) = subscribers
            .get(campaign_id)
            .and_then(|users| users.get(user_id))
        else {
            return;
        };

        match handle.tx.try_send(envelope.clone()) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    campaign_id = %campaign_id,
                    user_id = %user_id,
                    event_id = %envelope.event_id,
                    "Campaign subscriber queue full, dropping frame"
                );
                let mut drops = handle.pending_drops.lock().expect("drop buffer poisoned");
                if drops.len() < DROP_BUFFER_CAPACITY {
                    drops.push_back(EventEnvelope::dropped(envelope));
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(
                    campaign_id = %campaign_id,
                    user_id = %user_id,
                    "Campaign subscriber gone"
                );
            }
        }
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    async fn with_campaign_mut<F, T>(&self, slug: &str, f: F) -> T
    where
        F: FnOnce(&mut CampaignState) -> T,
    {
        let mut campaigns = self.campaigns.write().await;
        let campaign = campaigns
            .entry(slug.to_string())
            .or_insert_with(|| CampaignState::new(slug, Utc::now()));
        f(campaign)
    }

    /// The campaign a request addresses: explicit payload target, then the
    /// metadata campaign id, then the default campaign. The placeholder id
    /// `"0"` also resolves to the default.
    fn campaign_key(&self, envelope: &EventEnvelope) -> String {
        let key = get_string(&envelope.payload, &["data", "campaignId"])
            .or_else(|| extract_campaign_id(&envelope.metadata))
            .unwrap_or_default();
        if key.is_empty() || key == nx_domain::DEFAULT_CAMPAIGN_ID {
            self.default_slug.clone()
        } else {
            key
        }
    }

    fn correlation_for(&self, envelope: &EventEnvelope) -> String {
        match extract_correlation(&envelope.metadata, &envelope.payload) {
            Some(correlation) => correlation,
            None => {
                warn!(
                    event_id = %envelope.event_id,
                    event_type = %envelope.event_type,
                    "No correlation id on campaign request, synthesizing"
                );
                format!(
                    "corr_{}",
                    Utc::now().timestamp_nanos_opt().unwrap_or_default()
                )
            }
        }
    }

    /// Composite identity for the processed-events map. State updates get a
    /// monotonic counter appended so concurrent callers are never collapsed.
    fn event_identity(&self, event_type: &str, envelope: &EventEnvelope, correlation: &str) -> String {
        let global = extract_global(&envelope.metadata);
        let mut composite = format!(
            "{}|{}|{}|{}",
            event_type, global.user_id, global.campaign_id, correlation
        );
        if event_type.starts_with("campaign:state:") {
            composite.push('|');
            composite.push_str(
                &self
                    .update_counter
                    .fetch_add(1, Ordering::Relaxed)
                    .to_string(),
            );
        }

        let mut hasher = Sha256::new();
        hasher.update(composite.as_bytes());
        hex::encode(hasher.finalize())
    }

    fn already_processed(&self, identity: &str) -> bool {
        let now = Instant::now();
        let mut processed = self.processed.lock().expect("processed map poisoned");
        processed.retain(|_, at| now.duration_since(*at) < DEDUP_SWEEP_AGE);

        if let Some(at) = processed.get(identity) {
            if now.duration_since(*at) < DEDUP_WINDOW {
                return true;
            }
        }
        processed.insert(identity.to_string(), now);
        false
    }

    fn reply_envelope(
        &self,
        request: &EventEnvelope,
        event_type: &str,
        correlation: &str,
        payload: Value,
        message: &str,
    ) -> EventEnvelope {
        // the reply's event id IS the correlation id; that is how the
        // gateway matches it back to the pending request
        EventEnvelope::new(
            correlation,
            event_type,
            message,
            request.metadata.clone(),
            payload,
        )
    }

    async fn emit_state_failed(
        &self,
        request: &EventEnvelope,
        correlation: &str,
        reason: &str,
    ) -> Result<(), CampaignManagerError> {
        let payload = json!({"error": reason, "correlationId": correlation});
        let reply = EventEnvelope::failure(
            correlation,
            STATE_FAILED,
            reason,
            request.metadata.clone(),
            payload,
        );
        self.publish_feedback(reply).await
    }

    async fn publish_feedback(&self, envelope: EventEnvelope) -> Result<(), CampaignManagerError> {
        debug!(
            event_id = %envelope.event_id,
            event_type = %envelope.event_type,
            "Campaign feedback emitted"
        );
        self.bus
            .publish(&envelope)
            .await
            .map_err(|e| CampaignManagerError::Feedback {
                message: e.to_string(),
            })
    }
}

/// Normalize the legacy three-part handshake form to the canonical request.
pub fn normalize_alias(event_type: &str) -> String {
    if event_type == STATE_REQUEST_ALIAS {
        STATE_REQUESTED.to_string()
    } else {
        event_type.to_string()
    }
}

/// The updates tree for a `campaign:update` request: `payload.data.updates`
/// with `payload.updates` as a fallback.
fn update_tree(payload: &Value) -> Map<String, Value> {
    for path in [&["data", "updates"][..], &["updates"][..]] {
        if let Some(Value::Object(updates)) = get_path(payload, path) {
            return updates.clone();
        }
    }
    Map::new()
}

/// The feature list for a `campaign:feature` request: `payload.data.features`
/// (array) or the single `payload.data.feature`.
fn feature_list(payload: &Value) -> Vec<String> {
    if let Some(Value::Array(items)) = get_path(payload, &["data", "features"]) {
        return items
            .iter()
            .filter_map(|v| v.as_str().map(|s| s.to_string()))
            .collect();
    }
    get_string(payload, &["data", "feature"])
        .map(|f| vec![f])
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use nx_adapters::channel::ChannelConfig;
    use nx_adapters::memory::{MemoryBroker, MemoryCampaignRepository};
    use nx_ports::{CampaignRow, MessageBroker};
    use std::io::Write;

    fn default_campaign_file() -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(
            br#"{"slug": "ovasabi_website", "title": "Main Site", "features": ["search"]}"#,
        )
        .unwrap();
        file
    }

    async fn manager_with_repo(
        repository: Option<Arc<dyn CampaignRepository>>,
    ) -> (Arc<CampaignManager>, Arc<MultiBus>, tempfile::NamedTempFile) {
        let broker: Arc<dyn MessageBroker> = Arc::new(MemoryBroker::new());
        let bus = Arc::new(
            MultiBus::open(broker, &[], ChannelConfig::default())
                .await
                .unwrap(),
        );
        let file = default_campaign_file();
        let manager = CampaignManager::start(
            bus.clone(),
            repository,
            CampaignManagerConfig {
                default_campaign_path: file.path().to_path_buf(),
                campaigns_seed_path: None,
            },
        )
        .await
        .unwrap();
        (manager, bus, file)
    }

    fn request(event_type: &str, user_id: &str, correlation: &str, payload: Value) -> EventEnvelope {
        EventEnvelope::new(
            "REQ1",
            event_type,
            "",
            json!({"global_context": {"user_id": user_id, "correlation_id": correlation}}),
            payload,
        )
    }

    async fn next_feedback(
        sub: &mut nx_adapters::channel::ChannelSubscription,
    ) -> EventEnvelope {
        tokio::time::timeout(Duration::from_secs(1), sub.recv())
            .await
            .expect("no feedback envelope")
            .expect("feedback channel closed")
    }

    #[tokio::test]
    async fn test_startup_requires_default_campaign() {
        let broker: Arc<dyn MessageBroker> = Arc::new(MemoryBroker::new());
        let bus = Arc::new(
            MultiBus::open(broker, &[], ChannelConfig::default())
                .await
                .unwrap(),
        );

        let result = CampaignManager::start(
            bus,
            None,
            CampaignManagerConfig {
                default_campaign_path: PathBuf::from("/nonexistent/default.json"),
                campaigns_seed_path: None,
            },
        )
        .await;

        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_state_request_emits_decorated_success() {
        let (manager, bus, _file) = manager_with_repo(None).await;
        let mut sub = bus.subscribe(&[]).remove(0);

        manager
            .handle_event(&request("campaign:state:v1:requested", "u1", "C9", json!({})))
            .await
            .unwrap();

        let reply = next_feedback(&mut sub).await;
        assert_eq!(reply.event_type, "campaign:state:v1:success");
        assert_eq!(reply.event_id, "C9");
        assert!(reply.success);
        assert_eq!(reply.payload["user_id"], json!("u1"));
        assert_eq!(reply.payload["campaign_id"], json!("ovasabi_website"));
        assert_eq!(reply.payload["correlationId"], json!("C9"));
        assert_eq!(reply.payload["title"], json!("Main Site"));
    }

    #[tokio::test]
    async fn test_legacy_state_request_alias() {
        let (manager, bus, _file) = manager_with_repo(None).await;
        let mut sub = bus.subscribe(&[]).remove(0);

        manager
            .handle_event(&request(STATE_REQUEST_ALIAS, "u1", "C1", json!({})))
            .await
            .unwrap();

        let reply = next_feedback(&mut sub).await;
        assert_eq!(reply.event_type, "campaign:state:v1:success");
    }

    #[tokio::test]
    async fn test_godot_user_gets_godot_update_and_mirror() {
        let (manager, bus, _file) = manager_with_repo(None).await;
        let mut bus_sub = bus.subscribe(&[]).remove(0);
        let mut godot_sub = manager.subscribe("ovasabi_website", GODOT_USER_ID).await;

        manager
            .handle_event(&request("campaign:state:v1:requested", GODOT_USER_ID, "G1", json!({})))
            .await
            .unwrap();

        let reply = next_feedback(&mut bus_sub).await;
        assert_eq!(reply.event_type, GODOT_UPDATE_TYPE);

        let mirrored = tokio::time::timeout(Duration::from_secs(1), godot_sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(mirrored.event_type, GODOT_UPDATE_TYPE);
        assert_eq!(mirrored.event_id, "G1");
    }

    #[tokio::test]
    async fn test_list_includes_default_and_backfills_titles() {
        let repo = Arc::new(MemoryCampaignRepository::new());
        repo.insert(CampaignRow {
            slug: "summer_sale".to_string(),
            title: String::new(),
            metadata: json!({"features": ["banner"]}),
        })
        .await;

        let (manager, bus, _file) = manager_with_repo(Some(repo)).await;
        let mut sub = bus.subscribe(&[]).remove(0);

        manager
            .handle_event(&request(
                "campaign:list:v1:requested",
                "u1",
                "C9",
                json!({"data": {"correlationId": "ignored-late-probe"}}),
            ))
            .await
            .unwrap();

        let reply = next_feedback(&mut sub).await;
        assert_eq!(reply.event_type, "campaign:list:v1:success");
        assert_eq!(reply.payload["correlationId"], json!("C9"));
        assert_eq!(reply.payload["user_id"], json!("u1"));
        assert_eq!(reply.payload["total"], json!(2));

        let campaigns = reply.payload["campaigns"].as_array().unwrap();
        let slugs: Vec<&str> = campaigns
            .iter()
            .map(|c| c["slug"].as_str().unwrap())
            .collect();
        assert!(slugs.contains(&"ovasabi_website"));
        assert!(slugs.contains(&"summer_sale"));

        let summer = campaigns
            .iter()
            .find(|c| c["slug"] == json!("summer_sale"))
            .unwrap();
        assert_eq!(summer["title"], json!("Summer Sale"));
        assert_eq!(summer["name"], json!("Summer Sale"));
    }

    #[tokio::test]
    async fn test_update_unknown_campaign_fails_without_mutation() {
        let repo = Arc::new(MemoryCampaignRepository::new());
        let (manager, bus, _file) = manager_with_repo(Some(repo)).await;
        let mut sub = bus.subscribe(&[]).remove(0);
        let before = manager.campaign_count().await;

        manager
            .handle_event(&request(
                "campaign:update:v1:requested",
                "u1",
                "C3",
                json!({"data": {"campaignId": "ghost", "updates": {"title": "x"}}}),
            ))
            .await
            .unwrap();

        let reply = next_feedback(&mut sub).await;
        assert_eq!(reply.event_type, "campaign:state:v1:failed");
        assert!(!reply.success);
        assert_eq!(reply.message, "Campaign not found");
        assert_eq!(reply.payload["error"], json!("Campaign not found"));

        assert_eq!(manager.campaign_count().await, before);
        assert!(manager.get_state("ghost").await.is_none());
    }

    #[tokio::test]
    async fn test_update_persists_then_mutates() {
        let repo = Arc::new(MemoryCampaignRepository::new());
        repo.insert(CampaignRow {
            slug: "acme".to_string(),
            title: "Acme".to_string(),
            metadata: json!({}),
        })
        .await;

        let (manager, bus, _file) = manager_with_repo(Some(repo.clone())).await;
        let mut sub = bus.subscribe(&[]).remove(0);

        manager
            .handle_event(&request(
                "campaign:update:v1:requested",
                "u1",
                "C4",
                json!({"data": {"campaignId": "acme", "updates": {"title": "New Title"}}}),
            ))
            .await
            .unwrap();

        let reply = next_feedback(&mut sub).await;
        assert_eq!(reply.event_type, "campaign:state:v1:success");
        assert_eq!(reply.payload["title"], json!("New Title"));

        // the write landed under service_specific.campaign
        let row = repo.get_by_slug("acme").await.unwrap().unwrap();
        assert_eq!(
            row.metadata["service_specific"]["campaign"]["title"],
            json!("New Title")
        );

        let state = manager.get_state("acme").await.unwrap();
        assert_eq!(state.get("title"), Some(&json!("New Title")));
    }

    #[tokio::test]
    async fn test_switch_emits_switch_success_without_persistence() {
        let repo = Arc::new(MemoryCampaignRepository::new());
        let (manager, bus, _file) = manager_with_repo(Some(repo.clone())).await;
        let mut sub = bus.subscribe(&[]).remove(0);

        manager
            .handle_event(&request("campaign:switch:v1:requested", "u1", "C5", json!({})))
            .await
            .unwrap();

        let reply = next_feedback(&mut sub).await;
        assert_eq!(reply.event_type, "campaign:switch:v1:success");
        assert_eq!(reply.payload["status"], json!("active"));
        assert_eq!(reply.payload["switch_reason"], json!("user_initiated"));

        // no repository write for switches
        assert!(repo.get_by_slug("ovasabi_website").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_feature_and_config_requests() {
        let (manager, bus, _file) = manager_with_repo(None).await;
        let mut sub = bus.subscribe(&[]).remove(0);

        manager
            .handle_event(&request(
                "campaign:feature:v1:requested",
                "u1",
                "C6",
                json!({"data": {"action": "add", "features": ["chat"]}}),
            ))
            .await
            .unwrap();
        let reply = next_feedback(&mut sub).await;
        assert_eq!(reply.payload["features"], json!(["search", "chat"]));

        manager
            .handle_event(&request(
                "campaign:config:v1:requested",
                "u1",
                "C7",
                json!({"data": {"config_type": "email", "config": {"sender": "x@y.z"}}}),
            ))
            .await
            .unwrap();
        let reply = next_feedback(&mut sub).await;
        assert_eq!(reply.payload["email"], json!({"sender": "x@y.z"}));
    }

    #[tokio::test]
    async fn test_duplicate_list_request_suppressed() {
        let (manager, bus, _file) = manager_with_repo(None).await;
        let mut sub = bus.subscribe(&[]).remove(0);

        let envelope = request("campaign:list:v1:requested", "u1", "C8", json!({}));
        manager.handle_event(&envelope).await.unwrap();
        manager.handle_event(&envelope).await.unwrap();

        let _first = next_feedback(&mut sub).await;
        // the duplicate within the 2s window produced nothing
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_state_requests_are_never_deduplicated() {
        let (manager, bus, _file) = manager_with_repo(None).await;
        let mut sub = bus.subscribe(&[]).remove(0);

        let envelope = request("campaign:state:v1:requested", "u1", "C9", json!({}));
        manager.handle_event(&envelope).await.unwrap();
        manager.handle_event(&envelope).await.unwrap();

        let _first = next_feedback(&mut sub).await;
        let _second = next_feedback(&mut sub).await;
    }

    #[tokio::test]
    async fn test_resubscribe_closes_previous_queue() {
        let (manager, _bus, _file) = manager_with_repo(None).await;

        let mut first = manager.subscribe("acme", "u1").await;
        let _second = manager.subscribe("acme", "u1").await;

        // the replaced queue is closed
        assert!(first.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_non_request_events_ignored() {
        let (manager, bus, _file) = manager_with_repo(None).await;
        let mut sub = bus.subscribe(&[]).remove(0);

        manager
            .handle_event(&request("campaign:state:v1:success", "u1", "CX", json!({})))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(sub.try_recv().is_none());
    }
}
