//! Shared gateway state: the client registry and upstream handles
//!
//! One `ClientHandle` per connected `(campaign, user)` pair, each with a
//! bounded outbound queue drained by that connection's write pump. Sends are
//! non-blocking offers; a full queue drops the frame rather than stalling
//! the egress loop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, Notify};
use tonic::transport::Channel;
use tracing::{debug, warn};

use crate::config::GatewayConfig;
use crate::correlation::{ClientKey, PendingRequests, RelevantTypes};
use crate::frames::OutgoingFrame;
use nx_proto::NexusServiceClient;

/// Depth of each client's outbound frame queue
pub const CLIENT_QUEUE_CAPACITY: usize = 2048;

/// One connected client's producer side
pub struct ClientHandle {
    pub connection_id: u64,
    pub tx: mpsc::Sender<OutgoingFrame>,
}

/// Process-wide gateway state
pub struct GatewayState {
    pub config: GatewayConfig,
    pub pending: PendingRequests,
    pub relevant: RelevantTypes,
    pub nexus: NexusServiceClient<Channel>,
    /// Signalled when the relevant-types set grows and the egress loop
    /// should resubscribe
    pub resubscribe: Notify,
    clients: std::sync::RwLock<HashMap<ClientKey, ClientHandle>>,
    next_connection_id: AtomicU64,
}

pub type SharedState = std::sync::Arc<GatewayState>;

impl GatewayState {
    pub fn new(config: GatewayConfig, nexus: NexusServiceClient<Channel>) -> Self {
        Self {
            config,
            pending: PendingRequests::new(),
            relevant: RelevantTypes::new(),
            nexus,
            resubscribe: Notify::new(),
            clients: std::sync::RwLock::new(HashMap::new()),
            next_connection_id: AtomicU64::new(0),
        }
    }

    /// Register a connection, replacing any previous one for the same key.
    /// Returns the connection id and the queue the write pump drains.
    pub fn register_client(&self, key: &ClientKey) -> (u64, mpsc::Receiver<OutgoingFrame>) {
        let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(CLIENT_QUEUE_CAPACITY);

        let mut clients = self.clients.write().expect("client map poisoned");
        if clients
            .insert(key.clone(), ClientHandle { connection_id, tx })
            .is_some()
        {
            debug!(
                user_id = %key.user_id,
                campaign_id = %key.campaign_id,
                "Replaced existing connection"
            );
        }
        (connection_id, rx)
    }

    /// Drop a connection's registration and its pending correlations. A
    /// newer connection under the same key is left alone.
    pub fn unregister_client(&self, key: &ClientKey, connection_id: u64) {
        {
            let mut clients = self.clients.write().expect("client map poisoned");
            if clients
                .get(key)
                .map(|handle| handle.connection_id == connection_id)
                .unwrap_or(false)
            {
                clients.remove(key);
            }
        }
        self.pending.remove_client(key);
    }

    /// Offer a frame to one client. Returns false when the client is absent
    /// or its connection has gone away; a full queue drops the frame.
    pub fn send_to_client(&self, key: &ClientKey, frame: OutgoingFrame) -> bool {
        let clients = self.clients.read().expect("client map poisoned");
        let Some(handle) = clients.get(key) else {
            return false;
        };
        offer(handle, key, frame)
    }

    /// Offer a frame to every connection. Returns the number of accepting
    /// clients.
    pub fn broadcast(&self, frame: &OutgoingFrame) -> usize {
        let clients = self.clients.read().expect("client map poisoned");
        let mut accepted = 0;
        for (key, handle) in clients.iter() {
            if offer(handle, key, frame.clone()) {
                accepted += 1;
            }
        }
        accepted
    }

    /// Offer a frame to every connection in a campaign.
    pub fn send_to_campaign(&self, campaign_id: &str, frame: &OutgoingFrame) -> usize {
        let clients = self.clients.read().expect("client map poisoned");
        let mut accepted = 0;
        for (key, handle) in clients.iter() {
            if key.campaign_id == campaign_id && offer(handle, key, frame.clone()) {
                accepted += 1;
            }
        }
        accepted
    }

    /// Offer a frame to a user across campaigns.
    pub fn send_to_user(&self, user_id: &str, frame: &OutgoingFrame) -> usize {
        let clients = self.clients.read().expect("client map poisoned");
        let mut accepted = 0;
        for (key, handle) in clients.iter() {
            if key.user_id == user_id && offer(handle, key, frame.clone()) {
                accepted += 1;
            }
        }
        accepted
    }

    pub fn client_count(&self) -> usize {
        self.clients.read().expect("client map poisoned").len()
    }
}

fn offer(handle: &ClientHandle, key: &ClientKey, frame: OutgoingFrame) -> bool {
    match handle.tx.try_send(frame) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(frame)) => {
            warn!(
                user_id = %key.user_id,
                campaign_id = %key.campaign_id,
                event_type = %frame.event_type,
                "Client queue full, frame dropped"
            );
            false
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    }
}
