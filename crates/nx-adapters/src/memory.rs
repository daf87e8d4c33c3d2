//! In-memory adapters for dev mode and tests
//!
//! The router runs against these when no NATS url or database url is
//! configured: a process-local broker, a TTL lock, and map-backed
//! repositories. Semantics match the real backends closely enough for every
//! single-instance contract (per-channel ordering, lock windows, status
//! transitions).

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::debug;

use nx_domain::{DeliveryStatus, EventRecord};
use nx_ports::{
    BrokerError, BrokerSubscription, CampaignRepository, CampaignRepositoryError, CampaignRow,
    EventLock, EventRepository, EventRepositoryError, LockError, MessageBroker,
};

/// Queue depth for in-memory broker subscriptions
const SUBSCRIPTION_CAPACITY: usize = 256;

// ============================================================================
// Broker
// ============================================================================

/// Process-local pub/sub broker
#[derive(Default)]
pub struct MemoryBroker {
    channels: RwLock<HashMap<String, Vec<mpsc::Sender<Vec<u8>>>>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MessageBroker for MemoryBroker {
    fn publish<'a>(
        &'a self,
        channel: &'a str,
        payload: Vec<u8>,
    ) -> BoxFuture<'a, Result<(), BrokerError>> {
        Box::pin(async move {
            let senders: Vec<mpsc::Sender<Vec<u8>>> = {
                let channels = self.channels.read().await;
                match channels.get(channel) {
                    Some(senders) => senders.clone(),
                    None => return Ok(()),
                }
            };

            let mut any_closed = false;
            for sender in &senders {
                if sender.send(payload.clone()).await.is_err() {
                    any_closed = true;
                }
            }

            if any_closed {
                let mut channels = self.channels.write().await;
                if let Some(senders) = channels.get_mut(channel) {
                    senders.retain(|s| !s.is_closed());
                }
            }

            Ok(())
        })
    }

    fn subscribe<'a>(
        &'a self,
        channel: &'a str,
    ) -> BoxFuture<'a, Result<BrokerSubscription, BrokerError>> {
        Box::pin(async move {
            let (tx, rx) = mpsc::channel(SUBSCRIPTION_CAPACITY);
            let mut channels = self.channels.write().await;
            channels.entry(channel.to_string()).or_default().push(tx);
            debug!(channel = %channel, "In-memory subscription opened");
            Ok(BrokerSubscription::new(channel, rx))
        })
    }
}

// ============================================================================
// Lock
// ============================================================================

/// TTL set-if-absent lock backed by a process-local map
#[derive(Default)]
pub struct MemoryLock {
    held: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl MemoryLock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EventLock for MemoryLock {
    fn acquire<'a>(
        &'a self,
        key: &'a str,
        ttl: Duration,
    ) -> BoxFuture<'a, Result<bool, LockError>> {
        Box::pin(async move {
            let now = Utc::now();
            let mut held = self.held.lock().await;
            held.retain(|_, expires| *expires > now);

            if held.contains_key(key) {
                return Ok(false);
            }
            let expires = now
                + ChronoDuration::from_std(ttl).map_err(|e| LockError::BackendError {
                    message: e.to_string(),
                })?;
            held.insert(key.to_string(), expires);
            Ok(true)
        })
    }
}

// ============================================================================
// Event repository
// ============================================================================

/// Map-backed durable event store
#[derive(Default)]
pub struct MemoryEventRepository {
    records: Mutex<Vec<EventRecord>>,
    patterns: Mutex<Vec<(String, String)>>,
}

impl MemoryEventRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every stored record, in append order.
    pub async fn all(&self) -> Vec<EventRecord> {
        self.records.lock().await.clone()
    }

    /// Snapshot of registered patterns.
    pub async fn patterns(&self) -> Vec<(String, String)> {
        self.patterns.lock().await.clone()
    }
}

/// Translate a `*`-wildcard pattern into a matcher over event types.
fn pattern_matches(pattern: &str, event_type: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == event_type;
    }

    let mut pos = 0usize;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if i == 0 {
            if !event_type.starts_with(part) {
                return false;
            }
            pos = part.len();
        } else if i == parts.len() - 1 {
            let tail = &event_type[pos..];
            if !tail.ends_with(part) {
                return false;
            }
            pos = event_type.len();
        } else {
            match event_type[pos..].find(part) {
                Some(found) => pos += found + part.len(),
                None => return false,
            }
        }
    }
    true
}

impl EventRepository for MemoryEventRepository {
    fn save_event<'a>(
        &'a self,
        record: &'a EventRecord,
    ) -> BoxFuture<'a, Result<(), EventRepositoryError>> {
        Box::pin(async move {
            let mut records = self.records.lock().await;
            if records.iter().any(|r| r.event_id == record.event_id) {
                return Ok(());
            }
            records.push(record.clone());
            Ok(())
        })
    }

    fn update_status<'a>(
        &'a self,
        event_id: &'a str,
        status: DeliveryStatus,
        retries: u32,
        error_message: Option<&'a str>,
    ) -> BoxFuture<'a, Result<(), EventRepositoryError>> {
        Box::pin(async move {
            let mut records = self.records.lock().await;
            let record = records
                .iter_mut()
                .find(|r| r.event_id == event_id)
                .ok_or_else(|| EventRepositoryError::NotFound {
                    event_id: event_id.to_string(),
                })?;
            record.status = status;
            record.retries = retries;
            record.error_message = error_message.map(|s| s.to_string());
            Ok(())
        })
    }

    fn list_pending<'a>(
        &'a self,
        limit: usize,
    ) -> BoxFuture<'a, Result<Vec<EventRecord>, EventRepositoryError>> {
        Box::pin(async move {
            let records = self.records.lock().await;
            Ok(records
                .iter()
                .filter(|r| {
                    matches!(r.status, DeliveryStatus::Pending | DeliveryStatus::Failed)
                })
                .take(limit)
                .cloned()
                .collect())
        })
    }

    fn list_by_pattern<'a>(
        &'a self,
        pattern: &'a str,
        limit: usize,
    ) -> BoxFuture<'a, Result<Vec<EventRecord>, EventRepositoryError>> {
        Box::pin(async move {
            let records = self.records.lock().await;
            Ok(records
                .iter()
                .filter(|r| pattern_matches(pattern, &r.event_type))
                .take(limit)
                .cloned()
                .collect())
        })
    }

    fn save_pattern<'a>(
        &'a self,
        service: &'a str,
        pattern: &'a str,
    ) -> BoxFuture<'a, Result<(), EventRepositoryError>> {
        Box::pin(async move {
            let mut patterns = self.patterns.lock().await;
            let entry = (service.to_string(), pattern.to_string());
            if !patterns.contains(&entry) {
                patterns.push(entry);
            }
            Ok(())
        })
    }
}

// ============================================================================
// Campaign repository
// ============================================================================

/// Map-backed campaign repository
#[derive(Default)]
pub struct MemoryCampaignRepository {
    campaigns: RwLock<Vec<CampaignRow>>,
}

impl MemoryCampaignRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_campaigns(campaigns: Vec<CampaignRow>) -> Self {
        Self {
            campaigns: RwLock::new(campaigns),
        }
    }

    pub async fn insert(&self, row: CampaignRow) {
        let mut campaigns = self.campaigns.write().await;
        campaigns.retain(|c| c.slug != row.slug);
        campaigns.push(row);
    }
}

impl CampaignRepository for MemoryCampaignRepository {
    fn list<'a>(
        &'a self,
        limit: usize,
    ) -> BoxFuture<'a, Result<Vec<CampaignRow>, CampaignRepositoryError>> {
        Box::pin(async move {
            let campaigns = self.campaigns.read().await;
            Ok(campaigns.iter().take(limit).cloned().collect())
        })
    }

    fn get_by_slug<'a>(
        &'a self,
        slug: &'a str,
    ) -> BoxFuture<'a, Result<Option<CampaignRow>, CampaignRepositoryError>> {
        Box::pin(async move {
            let campaigns = self.campaigns.read().await;
            Ok(campaigns.iter().find(|c| c.slug == slug).cloned())
        })
    }

    fn update_metadata<'a>(
        &'a self,
        slug: &'a str,
        metadata: &'a Value,
    ) -> BoxFuture<'a, Result<(), CampaignRepositoryError>> {
        Box::pin(async move {
            let mut campaigns = self.campaigns.write().await;
            if let Some(row) = campaigns.iter_mut().find(|c| c.slug == slug) {
                row.metadata = metadata.clone();
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nx_domain::EventEnvelope;
    use serde_json::json;

    #[tokio::test]
    async fn test_broker_publish_subscribe() {
        let broker = MemoryBroker::new();
        let mut sub = broker.subscribe("nexus:events").await.unwrap();

        broker
            .publish("nexus:events", b"hello".to_vec())
            .await
            .unwrap();

        assert_eq!(sub.recv().await, Some(b"hello".to_vec()));
    }

    #[tokio::test]
    async fn test_broker_channel_isolation() {
        let broker = MemoryBroker::new();
        let mut a = broker.subscribe("nexus:events:user:create").await.unwrap();
        let _b = broker.subscribe("nexus:events").await.unwrap();

        broker
            .publish("nexus:events:user:create", b"x".to_vec())
            .await
            .unwrap();

        assert_eq!(a.recv().await, Some(b"x".to_vec()));
    }

    #[tokio::test]
    async fn test_lock_set_if_absent() {
        let lock = MemoryLock::new();
        let ttl = Duration::from_secs(3);

        assert!(lock.acquire("nexus:event_lock:E1", ttl).await.unwrap());
        assert!(!lock.acquire("nexus:event_lock:E1", ttl).await.unwrap());
        assert!(lock.acquire("nexus:event_lock:E2", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_lock_expires() {
        let lock = MemoryLock::new();

        assert!(lock
            .acquire("k", Duration::from_millis(10))
            .await
            .unwrap());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(lock
            .acquire("k", Duration::from_secs(3))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_repository_save_is_idempotent() {
        let repo = MemoryEventRepository::new();
        let envelope = EventEnvelope::new("E1", "echo", "", json!({}), json!({}));
        let record = EventRecord::from_envelope(&envelope, 1, Utc::now());

        repo.save_event(&record).await.unwrap();
        repo.save_event(&record).await.unwrap();

        assert_eq!(repo.all().await.len(), 1);
    }

    #[tokio::test]
    async fn test_repository_status_update() {
        let repo = MemoryEventRepository::new();
        let envelope = EventEnvelope::new("E1", "echo", "", json!({}), json!({}));
        let record = EventRecord::from_envelope(&envelope, 1, Utc::now());
        repo.save_event(&record).await.unwrap();

        repo.update_status("E1", DeliveryStatus::Delivered, 0, None)
            .await
            .unwrap();

        let all = repo.all().await;
        assert_eq!(all[0].status, DeliveryStatus::Delivered);
        assert!(repo.list_pending(10).await.unwrap().is_empty());

        assert!(repo
            .update_status("missing", DeliveryStatus::Failed, 1, Some("boom"))
            .await
            .is_err());
    }

    #[test]
    fn test_pattern_matching() {
        assert!(pattern_matches("user:create:v1:success", "user:create:v1:success"));
        assert!(pattern_matches("user:*", "user:create:v1:success"));
        assert!(pattern_matches("*:success", "user:create:v1:success"));
        assert!(pattern_matches("user:*:v1:*", "user:create:v1:failed"));
        assert!(!pattern_matches("user:*", "commerce:checkout:v1:success"));
        assert!(!pattern_matches("*:failed", "user:create:v1:success"));
    }

    #[tokio::test]
    async fn test_campaign_repository() {
        let repo = MemoryCampaignRepository::new();
        repo.insert(CampaignRow {
            slug: "acme".to_string(),
            title: "Acme".to_string(),
            metadata: json!({"features": ["a"]}),
        })
        .await;

        let found = repo.get_by_slug("acme").await.unwrap().unwrap();
        assert_eq!(found.title, "Acme");
        assert!(repo.get_by_slug("ghost").await.unwrap().is_none());

        repo.update_metadata("acme", &json!({"features": ["b"]}))
            .await
            .unwrap();
        let found = repo.get_by_slug("acme").await.unwrap().unwrap();
        assert_eq!(found.metadata, json!({"features": ["b"]}));
    }
}
