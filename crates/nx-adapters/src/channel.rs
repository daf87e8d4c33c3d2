//! Per-channel fan-out engine
//!
//! One `EventChannel` wraps a broker channel:
//! - `publish` serializes the envelope and hands it to the broker
//! - a background listener deserializes broker deliveries onto a bounded
//!   delivery queue
//! - a worker pool drains the delivery queue and fans out to every local
//!   subscription with a non-blocking offer
//!
//! A busy subscriber never stalls the listener: on a full subscriber queue
//! the frame is replaced by a synthetic `event_dropped` envelope. Listener
//! and worker tasks are supervised; a panicked task is logged and restarted.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, error, info, warn};

use nx_domain::EventEnvelope;
use nx_ports::{BrokerError, BrokerSubscription, MessageBroker};

/// Frames buffered between the broker listener and the worker pool
pub const DELIVERY_QUEUE_CAPACITY: usize = 256;

/// Workers draining the delivery queue
pub const DELIVERY_WORKER_COUNT: usize = 8;

/// Default depth of each local subscriber queue
pub const SUBSCRIBER_QUEUE_CAPACITY: usize = 64;

/// Synthetic drop markers buffered per subscriber
const DROP_BUFFER_CAPACITY: usize = 32;

/// Fan-out engine tuning
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub delivery_capacity: usize,
    pub worker_count: usize,
    pub subscriber_capacity: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            delivery_capacity: DELIVERY_QUEUE_CAPACITY,
            worker_count: DELIVERY_WORKER_COUNT,
            subscriber_capacity: SUBSCRIBER_QUEUE_CAPACITY,
        }
    }
}

type SubscriberMap = Arc<std::sync::RwLock<HashMap<u64, LocalSubscriber>>>;
type SharedDeliveryQueue = Arc<tokio::sync::Mutex<mpsc::Receiver<EventEnvelope>>>;

/// Producer side of one local subscription
struct LocalSubscriber {
    tx: mpsc::Sender<EventEnvelope>,
    pending_drops: Arc<std::sync::Mutex<VecDeque<EventEnvelope>>>,
}

/// Consumer side of one local subscription
pub struct ChannelSubscription {
    channel: String,
    rx: mpsc::Receiver<EventEnvelope>,
    pending_drops: Arc<std::sync::Mutex<VecDeque<EventEnvelope>>>,
}

impl ChannelSubscription {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Receive the next envelope. Synthetic drop markers are surfaced before
    /// queued frames so the subscriber learns about the overflow promptly.
    pub async fn recv(&mut self) -> Option<EventEnvelope> {
        if let Some(dropped) = self.take_pending_drop() {
            return Some(dropped);
        }
        self.rx.recv().await
    }

    /// Non-blocking variant of [`recv`].
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

/// One broker channel with local fan-out
pub struct EventChannel {
    name: String,
    broker: Arc<dyn MessageBroker>,
    config: ChannelConfig,
    subscribers: SubscriberMap,
    next_subscriber_id: AtomicU64,
}

impl EventChannel {
    /// Subscribe to the broker channel and start the listener and worker
    /// pool. The broker subscription is established before this returns, so
    /// a publish issued afterwards is observed.
    pub async fn open(
        broker: Arc<dyn MessageBroker>,
        name: impl Into<String>,
        config: ChannelConfig,
    ) -> Result<Arc<Self>, BrokerError> {
        let name = name.into();
        let initial = broker.subscribe(&name).await?;

        let channel = Arc::new(Self {
            name: name.clone(),
            broker: broker.clone(),
            config: config.clone(),
            subscribers: Arc::new(std::sync::RwLock::new(HashMap::new())),
            next_subscriber_id: AtomicU64::new(0),
        });

        let (delivery_tx, delivery_rx) = mpsc::channel(config.delivery_capacity);
        let shared_rx: SharedDeliveryQueue = Arc::new(tokio::sync::Mutex::new(delivery_rx));

        // Listener supervisor: decode broker frames onto the delivery queue,
        // resubscribing after broker loss and restarting after a panic.
        {
            let broker = broker.clone();
            let name = name.clone();
            let delivery_tx = delivery_tx.clone();
            tokio::spawn(async move {
                let mut subscription = Some(initial);
                loop {
                    let sub = match subscription.take() {
                        Some(sub) => sub,
                        None => match broker.subscribe(&name).await {
                            Ok(sub) => sub,
                            Err(e) => {
                                error!(channel = %name, error = %e, "Failed to resubscribe, retrying");
                                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                                continue;
                            }
                        },
                    };

                    let handle =
                        tokio::spawn(listener_loop(sub, delivery_tx.clone(), name.clone()));
                    match handle.await {
                        Ok(ListenerExit::QueueClosed) => {
                            debug!(channel = %name, "Delivery queue closed, listener stopping");
                            break;
                        }
                        Ok(ListenerExit::BrokerClosed) => {
                            warn!(channel = %name, "Broker subscription closed, resubscribing");
                            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                        }
                        Err(e) => {
                            error!(channel = %name, error = %e, "Listener panicked, restarting");
                        }
                    }
                }
            });
        }

        // Worker pool: each worker is wrapped in a supervisor that restarts
        // it if it panics; a worker exits cleanly once the queue closes.
        for worker_id in 0..config.worker_count {
            let shared_rx = shared_rx.clone();
            let subscribers = channel.subscribers.clone();
            let name = name.clone();
            tokio::spawn(async move {
                loop {
                    let handle = tokio::spawn(worker_loop(
                        worker_id,
                        shared_rx.clone(),
                        subscribers.clone(),
                        name.clone(),
                    ));
                    match handle.await {
                        Ok(()) => break,
                        Err(e) => {
                            error!(
                                channel = %name,
                                worker = worker_id,
                                error = %e,
                                "Delivery worker panicked, restarting"
                            );
                        }
                    }
                }
            });
        }

        info!(
            channel = %channel.name,
            workers = config.worker_count,
            "Event channel opened"
        );
        Ok(channel)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Serialize and hand the envelope to the broker. Non-blocking from the
    /// caller's perspective beyond the broker write itself.
    pub async fn publish(&self, envelope: &EventEnvelope) -> Result<(), BrokerError> {
        let bytes = envelope
            .to_bytes()
            .map_err(|e| BrokerError::PublishError {
                channel: self.name.clone(),
                message: e.to_string(),
            })?;
        self.broker.publish(&self.name, bytes).await
    }

    /// Open a local subscription fed by the worker pool.
    pub fn subscribe(&self) -> ChannelSubscription {
        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.config.subscriber_capacity);
        let pending_drops = Arc::new(std::sync::Mutex::new(VecDeque::new()));

        self.subscribers
            .write()
            .expect("subscriber map poisoned")
            .insert(
                id,
                LocalSubscriber {
                    tx,
                    pending_drops: pending_drops.clone(),
                },
            );

        debug!(channel = %self.name, subscriber = id, "Local subscription opened");
        ChannelSubscription {
            channel: self.name.clone(),
            rx,
            pending_drops,
        }
    }

    /// Fan an envelope out to local subscribers without touching the broker.
    /// Used by the retry worker for redelivery. Returns the number of
    /// subscribers that accepted the frame.
    pub fn deliver_local(&self, envelope: &EventEnvelope) -> usize {
        fan_out(&self.subscribers, envelope, &self.name)
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .read()
            .expect("subscriber map poisoned")
            .len()
    }
}

enum ListenerExit {
    BrokerClosed,
    QueueClosed,
}

async fn listener_loop(
    mut subscription: BrokerSubscription,
    delivery_tx: mpsc::Sender<EventEnvelope>,
    channel: String,
) -> ListenerExit {
    while let Some(bytes) = subscription.recv().await {
        match EventEnvelope::from_bytes(&bytes) {
            Ok(envelope) => {
                if delivery_tx.send(envelope).await.is_err() {
                    return ListenerExit::QueueClosed;
                }
            }
            Err(e) => {
                warn!(channel = %channel, error = %e, "Failed to decode broker frame");
            }
        }
    }
    ListenerExit::BrokerClosed
}

async fn worker_loop(
    worker_id: usize,
    shared_rx: SharedDeliveryQueue,
    subscribers: SubscriberMap,
    channel: String,
) {
    loop {
        let envelope = {
            let mut rx = shared_rx.lock().await;
            rx.recv().await
        };
        match envelope {
            Some(envelope) => {
                fan_out(&subscribers, &envelope, &channel);
            }
            None => {
                debug!(channel = %channel, worker = worker_id, "Delivery queue drained, worker stopping");
                break;
            }
        }
    }
}

/// Offer the envelope to every local subscriber. Full queues get a synthetic
/// drop marker instead of backpressure; closed queues are pruned.
fn fan_out(subscribers: &SubscriberMap, envelope: &EventEnvelope, channel: &str) -> usize {
    let mut accepted = 0;
    let mut closed = Vec::new();

    {
        let subs = subscribers.read().expect("subscriber map poisoned");
        for (id, subscriber) in subs.iter() {
            match subscriber.tx.try_send(envelope.clone()) {
                Ok(()) => accepted += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(
                        channel = %channel,
                        subscriber = id,
                        event_id = %envelope.event_id,
                        event_type = %envelope.event_type,
                        "Subscriber queue full, dropping frame"
                    );
                    let mut drops = subscriber
                        .pending_drops
                        .lock()
                        .expect("drop buffer poisoned");
                    if drops.len() < DROP_BUFFER_CAPACITY {
                        drops.push_back(EventEnvelope::dropped(envelope));
                    }
                }
                Err(TrySendError::Closed(_)) => closed.push(*id),
            }
        }
    }

    if !closed.is_empty() {
        let mut subs = subscribers.write().expect("subscriber map poisoned");
        for id in closed {
            subs.remove(&id);
            debug!(channel = %channel, subscriber = id, "Closed subscription pruned");
        }
    }

    accepted
}
