//! NATS Message Broker Adapter
//!
//! Implements the MessageBroker port over core NATS pub/sub. Channels map
//! one-to-one to NATS subjects; delivery ordering within a subject is the
//! broker's. Durability across broker failure is not this adapter's job;
//! the event store and retry worker own that.

use futures::future::BoxFuture;
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use nx_ports::{BrokerError, BrokerSubscription, MessageBroker};

/// NATS broker configuration
#[derive(Debug, Clone)]
pub struct NatsConfig {
    /// NATS server URL (e.g., "nats://localhost:4222")
    pub url: String,
    /// Queue depth of each subscription's receive buffer
    pub subscription_capacity: usize,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".to_string(),
            subscription_capacity: 256,
        }
    }
}

impl NatsConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Self {
        Self {
            url: std::env::var("NEXUS_NATS_URL")
                .unwrap_or_else(|_| "nats://localhost:4222".to_string()),
            subscription_capacity: std::env::var("NEXUS_NATS_SUBSCRIPTION_CAPACITY")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(256),
        }
    }
}

/// NATS pub/sub broker implementation
pub struct NatsBroker {
    client: async_nats::Client,
    config: NatsConfig,
}

impl NatsBroker {
    /// Connect to NATS
    pub async fn connect(config: NatsConfig) -> Result<Self, BrokerError> {
        info!(url = %config.url, "Connecting to NATS");

        let client =
            async_nats::connect(&config.url)
                .await
                .map_err(|e| BrokerError::ConnectionError {
                    message: format!("Failed to connect to NATS: {}", e),
                })?;

        info!("NATS message broker initialized");
        Ok(Self { client, config })
    }
}

impl MessageBroker for NatsBroker {
    fn publish<'a>(
        &'a self,
        channel: &'a str,
        payload: Vec<u8>,
    ) -> BoxFuture<'a, Result<(), BrokerError>> {
        Box::pin(async move {
            self.client
                .publish(channel.to_string(), payload.into())
                .await
                .map_err(|e| BrokerError::PublishError {
                    channel: channel.to_string(),
                    message: e.to_string(),
                })?;
            debug!(channel = %channel, "Message published");
            Ok(())
        })
    }

    fn subscribe<'a>(
        &'a self,
        channel: &'a str,
    ) -> BoxFuture<'a, Result<BrokerSubscription, BrokerError>> {
        Box::pin(async move {
            let mut subscriber = self
                .client
                .subscribe(channel.to_string())
                .await
                .map_err(|e| BrokerError::SubscribeError {
                    channel: channel.to_string(),
                    message: e.to_string(),
                })?;

            let (tx, rx) = mpsc::channel(self.config.subscription_capacity);
            let subject = channel.to_string();
            let pump_id = format!("nats-pump-{}", ulid::Ulid::new());

            tokio::spawn(async move {
                while let Some(message) = subscriber.next().await {
                    if tx.send(message.payload.to_vec()).await.is_err() {
                        // receiver dropped; release the NATS subscription
                        break;
                    }
                }
                if let Err(e) = subscriber.unsubscribe().await {
                    warn!(subject = %subject, pump = %pump_id, error = %e, "Failed to unsubscribe");
                }
                debug!(subject = %subject, pump = %pump_id, "Subscription pump stopped");
            });

            Ok(BrokerSubscription::new(channel, rx))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = NatsConfig::default();
        assert_eq!(config.url, "nats://localhost:4222");
        assert_eq!(config.subscription_capacity, 256);
    }
}
