//! Request/response correlation and the relevant-types set
//!
//! Each outbound client request registers `correlation_id -> (expected reply
//! type, client)`. The first envelope whose id and type match removes the
//! entry and routes only to the originating client. The relevant-types set
//! is the gateway's dynamic subscription list: seeded from the service
//! registration file, grown monotonically by every client request, never
//! shrunk.

use std::collections::{HashMap, HashSet};
use std::time::Instant;
use tracing::debug;

/// A connected client, keyed by its URL path identity
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientKey {
    pub campaign_id: String,
    pub user_id: String,
}

impl ClientKey {
    /// Normalize path segments: an empty user becomes a guest id, an empty
    /// campaign becomes the placeholder `"0"`.
    pub fn normalize(campaign_id: &str, user_id: &str) -> Self {
        Self {
            campaign_id: if campaign_id.is_empty() {
                nx_domain::DEFAULT_CAMPAIGN_ID.to_string()
            } else {
                campaign_id.to_string()
            },
            user_id: if user_id.is_empty() {
                format!("guest_{}", uuid::Uuid::new_v4())
            } else {
                user_id.to_string()
            },
        }
    }
}

/// One registered correlation entry
#[derive(Debug, Clone)]
pub struct PendingEntry {
    pub expected_event_type: String,
    pub client: ClientKey,
    pub created_at: Instant,
}

/// The pending-requests map
#[derive(Default)]
pub struct PendingRequests {
    entries: std::sync::RwLock<HashMap<String, PendingEntry>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        correlation_id: impl Into<String>,
        expected_event_type: impl Into<String>,
        client: ClientKey,
    ) {
        let correlation_id = correlation_id.into();
        let entry = PendingEntry {
            expected_event_type: expected_event_type.into(),
            client,
            created_at: Instant::now(),
        };
        self.entries
            .write()
            .expect("pending map poisoned")
            .insert(correlation_id, entry);
    }

    /// Remove and return the entry for `event_id` when the reply type is the
    /// one it expects. A mismatched type leaves the entry for the real
    /// reply.
    pub fn match_reply(&self, event_id: &str, event_type: &str) -> Option<PendingEntry> {
        let mut entries = self.entries.write().expect("pending map poisoned");
        match entries.get(event_id) {
            Some(entry) if entry.expected_event_type == event_type => entries.remove(event_id),
            _ => None,
        }
    }

    /// Drop every entry registered by a disconnecting client.
    pub fn remove_client(&self, client: &ClientKey) {
        let mut entries = self.entries.write().expect("pending map poisoned");
        let before = entries.len();
        entries.retain(|_, entry| entry.client != *client);
        let removed = before - entries.len();
        if removed > 0 {
            debug!(
                user_id = %client.user_id,
                campaign_id = %client.campaign_id,
                removed = removed,
                "Pending correlations cleaned up on disconnect"
            );
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().expect("pending map poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The gateway's dynamic subscription list. Grows monotonically; readers
/// take snapshots for resubscription.
#[derive(Default)]
pub struct RelevantTypes {
    types: std::sync::RwLock<HashSet<String>>,
}

impl RelevantTypes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add types; returns true when the set grew.
    pub fn extend<I, S>(&self, types: I) -> bool
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut set = self.types.write().expect("relevant types poisoned");
        let mut grew = false;
        for event_type in types {
            grew |= set.insert(event_type.into());
        }
        grew
    }

    pub fn contains(&self, event_type: &str) -> bool {
        self.types
            .read()
            .expect("relevant types poisoned")
            .contains(event_type)
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.types
            .read()
            .expect("relevant types poisoned")
            .iter()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.types.read().expect("relevant types poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(user: &str) -> ClientKey {
        ClientKey {
            campaign_id: "acme".to_string(),
            user_id: user.to_string(),
        }
    }

    #[test]
    fn test_client_key_normalization() {
        let key = ClientKey::normalize("acme", "u1");
        assert_eq!(key.campaign_id, "acme");
        assert_eq!(key.user_id, "u1");

        let key = ClientKey::normalize("", "");
        assert_eq!(key.campaign_id, "0");
        assert!(key.user_id.starts_with("guest_"));
        assert_eq!(key.user_id.len(), "guest_".len() + 36);
    }

    #[test]
    fn test_match_reply_requires_expected_type() {
        let pending = PendingRequests::new();
        pending.register("C1", "user:create:v1:success", client("u1"));

        // wrong type leaves the entry in place
        assert!(pending.match_reply("C1", "user:create:v1:failed").is_none());
        assert_eq!(pending.len(), 1);

        let entry = pending.match_reply("C1", "user:create:v1:success").unwrap();
        assert_eq!(entry.client.user_id, "u1");

        // removed atomically on first match
        assert!(pending.match_reply("C1", "user:create:v1:success").is_none());
        assert!(pending.is_empty());
    }

    #[test]
    fn test_remove_client_drops_only_theirs() {
        let pending = PendingRequests::new();
        pending.register("C1", "user:create:v1:success", client("u1"));
        pending.register("C2", "user:update:v1:success", client("u2"));

        pending.remove_client(&client("u1"));

        assert!(pending.match_reply("C1", "user:create:v1:success").is_none());
        assert!(pending.match_reply("C2", "user:update:v1:success").is_some());
    }

    #[test]
    fn test_relevant_types_grow_monotonically() {
        let relevant = RelevantTypes::new();
        assert!(relevant.extend(["user:create:v1:requested", "user:create:v1:success"]));
        assert!(!relevant.extend(["user:create:v1:success"]));
        assert_eq!(relevant.len(), 2);
        assert!(relevant.contains("user:create:v1:requested"));

        let mut snapshot = relevant.snapshot();
        snapshot.sort();
        assert_eq!(
            snapshot,
            vec![
                "user:create:v1:requested".to_string(),
                "user:create:v1:success".to_string()
            ]
        );
    }
}
