//! Multi-bus channel routing
//!
//! One broker channel per registered `service:action` pair plus the default
//! channel. The map is built from the service-registration file at startup
//! and frozen structurally; only per-channel subscriber sets mutate
//! afterwards.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info};

use nx_adapters::channel::{ChannelConfig, ChannelSubscription, EventChannel};
use nx_adapters::registry::{action_keys, ServiceRegistration};
use nx_domain::{event_type, EventEnvelope};
use nx_ports::{BrokerError, MessageBroker};

/// The fallback channel carrying everything without a per-action channel
pub const DEFAULT_CHANNEL: &str = "nexus:events";

/// Broker channel name for one `service:action` pair
pub fn channel_name(service: &str, action: &str) -> String {
    format!("nexus:events:{}:{}", service, action)
}

/// The frozen channel map
pub struct MultiBus {
    default_channel: Arc<EventChannel>,
    channels: HashMap<String, Arc<EventChannel>>,
}

impl MultiBus {
    /// Open the default channel and one channel per registered action.
    pub async fn open(
        broker: Arc<dyn MessageBroker>,
        registrations: &[ServiceRegistration],
        config: ChannelConfig,
    ) -> Result<Self, BrokerError> {
        let default_channel =
            EventChannel::open(broker.clone(), DEFAULT_CHANNEL, config.clone()).await?;

        let mut channels = HashMap::new();
        for (service, action) in action_keys(registrations) {
            let channel = EventChannel::open(
                broker.clone(),
                channel_name(&service, &action),
                config.clone(),
            )
            .await?;
            channels.insert(format!("{}:{}", service, action), channel);
        }

        info!(
            action_channels = channels.len(),
            "Multi-bus initialized"
        );
        Ok(Self {
            default_channel,
            channels,
        })
    }

    /// The channel an event type routes to: the per-action channel when the
    /// type parses and its `service:action` is registered, else the default.
    pub fn channel_for(&self, event_type: &str) -> &Arc<EventChannel> {
        match event_type::parse(event_type) {
            Ok(parsed) => self
                .channels
                .get(&parsed.action_key())
                .unwrap_or(&self.default_channel),
            Err(_) => &self.default_channel,
        }
    }

    /// Publish through the routed channel.
    pub async fn publish(&self, envelope: &EventEnvelope) -> Result<(), BrokerError> {
        let channel = self.channel_for(&envelope.event_type);
        debug!(
            event_id = %envelope.event_id,
            event_type = %envelope.event_type,
            channel = %channel.name(),
            "Routing publish"
        );
        channel.publish(envelope).await
    }

    /// Local subscriptions covering the requested event types, each distinct
    /// channel joined at most once. An empty list subscribes to the default
    /// channel only.
    pub fn subscribe(&self, event_types: &[String]) -> Vec<ChannelSubscription> {
        if event_types.is_empty() {
            return vec![self.default_channel.subscribe()];
        }

        let mut joined = HashSet::new();
        let mut subscriptions = Vec::new();
        for requested in event_types {
            let channel = self.channel_for(requested);
            if joined.insert(channel.name().to_string()) {
                subscriptions.push(channel.subscribe());
            }
        }
        subscriptions
    }

    /// Offer an envelope straight to the routed channel's local subscribers,
    /// bypassing the broker. Used by the retry worker.
    pub fn deliver_local(&self, envelope: &EventEnvelope) -> usize {
        self.channel_for(&envelope.event_type).deliver_local(envelope)
    }

    /// Channels carried by this bus, the default included.
    pub fn channel_count(&self) -> usize {
        self.channels.len() + 1
    }
}
