//! Nexus Port Traits
//!
//! This crate defines the port interfaces (traits) that adapters must
//! implement:
//! - MessageBroker
//! - EventLock
//! - EventRepository
//! - CampaignRepository
//! - Clock
//!
//! All async ports return boxed futures so the service wiring can hold them
//! as trait objects and swap in-memory adapters for the real backends.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::mpsc;

use nx_domain::{DeliveryStatus, EventRecord};

/// Pub/sub broker port
///
/// A broker carries raw JSON-envelope bytes per named channel. Delivery is
/// reliable within one broker instance; cross-instance redelivery belongs to
/// the durable event store.
pub trait MessageBroker: Send + Sync {
    /// Publish a serialized envelope to a channel.
    fn publish<'a>(
        &'a self,
        channel: &'a str,
        payload: Vec<u8>,
    ) -> BoxFuture<'a, Result<(), BrokerError>>;

    /// Open a subscription to a channel.
    fn subscribe<'a>(
        &'a self,
        channel: &'a str,
    ) -> BoxFuture<'a, Result<BrokerSubscription, BrokerError>>;
}

/// One broker subscription: a bounded receive queue of raw payloads.
///
/// Adapters pump broker deliveries into the queue; the owner drains it and
/// drops the subscription to release it.
pub struct BrokerSubscription {
    channel: String,
    rx: mpsc::Receiver<Vec<u8>>,
}

impl BrokerSubscription {
    pub fn new(channel: impl Into<String>, rx: mpsc::Receiver<Vec<u8>>) -> Self {
        Self {
            channel: channel.into(),
            rx,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Receive the next payload; `None` once the adapter side is gone.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }
}

/// Broker errors
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Connection error: {message}")]
    ConnectionError { message: String },

    #[error("Publish error on {channel}: {message}")]
    PublishError { channel: String, message: String },

    #[error("Subscribe error on {channel}: {message}")]
    SubscribeError { channel: String, message: String },
}

/// Distributed lock port used for cross-instance event deduplication.
///
/// Locks never protect in-memory state; they only gate duplicate publishes
/// within the TTL window.
pub trait EventLock: Send + Sync {
    /// Atomic set-if-absent with TTL. Returns true when this caller acquired
    /// the key, false when another holder beat it within the window.
    fn acquire<'a>(
        &'a self,
        key: &'a str,
        ttl: Duration,
    ) -> BoxFuture<'a, Result<bool, LockError>>;
}

/// Lock errors
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("Lock backend error: {message}")]
    BackendError { message: String },
}

/// Durable event store port
pub trait EventRepository: Send + Sync {
    /// Append a record; the caller has already assigned `nexus_sequence`.
    fn save_event<'a>(
        &'a self,
        record: &'a EventRecord,
    ) -> BoxFuture<'a, Result<(), EventRepositoryError>>;

    /// Transition a record's status, recording the retry count and, for
    /// failures, the error message.
    fn update_status<'a>(
        &'a self,
        event_id: &'a str,
        status: DeliveryStatus,
        retries: u32,
        error_message: Option<&'a str>,
    ) -> BoxFuture<'a, Result<(), EventRepositoryError>>;

    /// Records still awaiting delivery, oldest first.
    fn list_pending<'a>(
        &'a self,
        limit: usize,
    ) -> BoxFuture<'a, Result<Vec<EventRecord>, EventRepositoryError>>;

    /// Records whose event type matches a `*`-wildcard pattern.
    fn list_by_pattern<'a>(
        &'a self,
        pattern: &'a str,
        limit: usize,
    ) -> BoxFuture<'a, Result<Vec<EventRecord>, EventRepositoryError>>;

    /// Durable registration of a service's event-type pattern.
    fn save_pattern<'a>(
        &'a self,
        service: &'a str,
        pattern: &'a str,
    ) -> BoxFuture<'a, Result<(), EventRepositoryError>>;
}

/// Event repository errors
#[derive(Debug, thiserror::Error)]
pub enum EventRepositoryError {
    #[error("Database error: {message}")]
    DatabaseError { message: String },

    #[error("Serialization error: {message}")]
    SerializationError { message: String },

    #[error("Event not found: {event_id}")]
    NotFound { event_id: String },
}

/// One campaign row as stored by the repository
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignRow {
    pub slug: String,
    pub title: String,
    pub metadata: Value,
}

/// Campaign metadata repository port
pub trait CampaignRepository: Send + Sync {
    /// List up to `limit` campaigns.
    fn list<'a>(
        &'a self,
        limit: usize,
    ) -> BoxFuture<'a, Result<Vec<CampaignRow>, CampaignRepositoryError>>;

    /// Look up a campaign by slug.
    fn get_by_slug<'a>(
        &'a self,
        slug: &'a str,
    ) -> BoxFuture<'a, Result<Option<CampaignRow>, CampaignRepositoryError>>;

    /// Persist a campaign's metadata tree.
    fn update_metadata<'a>(
        &'a self,
        slug: &'a str,
        metadata: &'a Value,
    ) -> BoxFuture<'a, Result<(), CampaignRepositoryError>>;
}

/// Campaign repository errors
#[derive(Debug, thiserror::Error)]
pub enum CampaignRepositoryError {
    #[error("Database error: {message}")]
    DatabaseError { message: String },

    #[error("Serialization error: {message}")]
    SerializationError { message: String },
}

/// Clock port for deterministic time handling
pub trait Clock: Send + Sync {
    /// Get the current UTC time
    fn now(&self) -> DateTime<Utc>;
}

/// System clock implementation
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
