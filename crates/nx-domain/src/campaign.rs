//! Campaign state: the per-campaign aggregate mutated by stateful events
//!
//! A campaign is keyed by slug and carries a flat state map seeded from the
//! default-campaign file, the campaign repository, or the campaigns seed
//! file. Mutation rules here are pure; the state manager owns locking,
//! subscribers, and the feedback bus.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::DomainError;
use crate::metadata::get_path;

/// Metadata branches flattened into campaign state when seeding from the
/// repository or a config file.
pub const FLATTENED_BRANCHES: [&str; 6] = [
    "features",
    "tags",
    "scheduling",
    "audit",
    "versioning",
    "custom_rules",
];

/// Feature mutation verb for `campaign:feature` requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureAction {
    Add,
    Remove,
    Set,
}

impl FeatureAction {
    pub fn parse(s: &str) -> Result<Self, DomainError> {
        match s {
            "add" => Ok(FeatureAction::Add),
            "remove" => Ok(FeatureAction::Remove),
            "set" => Ok(FeatureAction::Set),
            _ => Err(DomainError::InvalidFeatureAction {
                action: s.to_string(),
            }),
        }
    }
}

/// In-memory state for one campaign
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignState {
    pub slug: String,
    pub state: Map<String, Value>,
    pub last_updated: DateTime<Utc>,
}

impl CampaignState {
    pub fn new(slug: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            slug: slug.into(),
            state: Map::new(),
            last_updated: now,
        }
    }

    /// Seed from a campaign config object (default-campaign file or seed
    /// file entry): every key except `slug` and `service_specific` lands in
    /// state as-is, then the `service_specific.campaign` sub-tree is
    /// flattened on top.
    pub fn from_config_object(slug: impl Into<String>, object: &Map<String, Value>, now: DateTime<Utc>) -> Self {
        let mut campaign = Self::new(slug, now);
        for (key, value) in object {
            if key == "slug" || key == "service_specific" {
                continue;
            }
            campaign.state.insert(key.clone(), value.clone());
        }
        campaign.flatten_service_specific(&Value::Object(object.clone()));
        campaign
    }

    /// Seed from repository metadata: only the recognized branches plus the
    /// `service_specific.campaign` sub-tree are flattened in.
    pub fn from_repository_metadata(slug: impl Into<String>, metadata: &Value, now: DateTime<Utc>) -> Self {
        let mut campaign = Self::new(slug, now);
        for branch in FLATTENED_BRANCHES {
            if let Some(value) = get_path(metadata, &[branch]) {
                campaign.state.insert(branch.to_string(), value.clone());
            }
        }
        campaign.flatten_service_specific(metadata);
        campaign
    }

    fn flatten_service_specific(&mut self, source: &Value) {
        if let Some(Value::Object(sub)) = get_path(source, &["service_specific", "campaign"]) {
            for (key, value) in sub {
                self.state.insert(key.clone(), value.clone());
            }
        }
    }

    /// Shallow snapshot of the state map; callers never observe in-place
    /// mutation.
    pub fn snapshot(&self) -> Map<String, Value> {
        self.state.clone()
    }

    /// Routing-decorated copy of state: injects the requesting user and
    /// campaign, and preserves the correlation id for reply matching.
    pub fn decorated(&self, user_id: &str, campaign_id: &str, correlation_id: &str) -> Value {
        let mut state = self.snapshot();
        state.insert("user_id".to_string(), Value::String(user_id.to_string()));
        state.insert(
            "campaign_id".to_string(),
            Value::String(campaign_id.to_string()),
        );
        state.insert(
            "correlationId".to_string(),
            Value::String(correlation_id.to_string()),
        );
        Value::Object(state)
    }

    /// Merge arbitrary updates into state.
    pub fn apply_updates(&mut self, updates: &Map<String, Value>, now: DateTime<Utc>) {
        for (key, value) in updates {
            self.state.insert(key.clone(), value.clone());
        }
        self.last_updated = now;
    }

    /// Session-level switch update. Never persisted.
    pub fn apply_switch(&mut self, now: DateTime<Utc>) {
        self.state
            .insert("status".to_string(), Value::String("active".to_string()));
        self.state.insert(
            "last_switched".to_string(),
            Value::String(now.to_rfc3339()),
        );
        self.state.insert(
            "switch_reason".to_string(),
            Value::String("user_initiated".to_string()),
        );
        self.last_updated = now;
    }

    /// Mutate the `features` list with set semantics.
    pub fn mutate_features(
        &mut self,
        action: FeatureAction,
        features: &[String],
        now: DateTime<Utc>,
    ) {
        let mut current: Vec<String> = match self.state.get("features") {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(|s| s.to_string()))
                .collect(),
            _ => Vec::new(),
        };

        match action {
            FeatureAction::Add => {
                for feature in features {
                    if !current.contains(feature) {
                        current.push(feature.clone());
                    }
                }
            }
            FeatureAction::Remove => {
                current.retain(|existing| !features.contains(existing));
            }
            FeatureAction::Set => {
                current.clear();
                for feature in features {
                    if !current.contains(feature) {
                        current.push(feature.clone());
                    }
                }
            }
        }

        self.state.insert(
            "features".to_string(),
            Value::Array(current.into_iter().map(Value::String).collect()),
        );
        self.last_updated = now;
    }

    /// Place a config sub-tree under the key named by `config_type`.
    pub fn set_config(&mut self, config_type: &str, config: Value, now: DateTime<Utc>) {
        self.state.insert(config_type.to_string(), config);
        self.last_updated = now;
    }

    /// Listing entry with `title`, `name`, `slug`, and `id` backfilled from
    /// the slug where the state does not already carry them.
    pub fn list_entry(&self) -> Value {
        let mut entry = self.snapshot();
        let title = title_from_slug(&self.slug);

        entry
            .entry("slug".to_string())
            .or_insert_with(|| Value::String(self.slug.clone()));
        entry
            .entry("id".to_string())
            .or_insert_with(|| Value::String(self.slug.clone()));
        entry
            .entry("title".to_string())
            .or_insert_with(|| Value::String(title.clone()));
        entry
            .entry("name".to_string())
            .or_insert_with(|| Value::String(title));

        Value::Object(entry)
    }
}

/// Title-case a slug: underscores become spaces, each word capitalized.
pub fn title_from_slug(slug: &str) -> String {
    slug.split('_')
        .filter(|word| !word.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    #[test]
    fn test_title_from_slug() {
        assert_eq!(title_from_slug("summer_sale"), "Summer Sale");
        assert_eq!(title_from_slug("acme"), "Acme");
        assert_eq!(title_from_slug("black_friday_2026"), "Black Friday 2026");
    }

    #[test]
    fn test_from_config_object_flattens_campaign_subtree() {
        let object = json!({
            "slug": "acme",
            "title": "Acme",
            "features": ["search"],
            "service_specific": {
                "campaign": {"theme": "dark", "features": ["search", "chat"]},
                "user": {"ignored": true}
            }
        });

        let campaign =
            CampaignState::from_config_object("acme", object.as_object().unwrap(), now());

        assert_eq!(campaign.state.get("title"), Some(&json!("Acme")));
        // the service_specific.campaign sub-tree wins over the top-level key
        assert_eq!(
            campaign.state.get("features"),
            Some(&json!(["search", "chat"]))
        );
        assert_eq!(campaign.state.get("theme"), Some(&json!("dark")));
        assert!(!campaign.state.contains_key("slug"));
        assert!(!campaign.state.contains_key("service_specific"));
    }

    #[test]
    fn test_from_repository_metadata_only_known_branches() {
        let metadata = json!({
            "features": ["a"],
            "tags": {"tier": "gold"},
            "scheduling": {"cron": "daily"},
            "unrelated": "dropped",
            "service_specific": {"campaign": {"budget": 100}}
        });

        let campaign = CampaignState::from_repository_metadata("acme", &metadata, now());

        assert_eq!(campaign.state.get("features"), Some(&json!(["a"])));
        assert_eq!(campaign.state.get("tags"), Some(&json!({"tier": "gold"})));
        assert_eq!(campaign.state.get("budget"), Some(&json!(100)));
        assert!(!campaign.state.contains_key("unrelated"));
    }

    #[test]
    fn test_decorated_injects_routing_fields() {
        let mut campaign = CampaignState::new("acme", now());
        campaign.state.insert("theme".to_string(), json!("dark"));

        let decorated = campaign.decorated("u1", "acme", "C9");

        assert_eq!(decorated["theme"], json!("dark"));
        assert_eq!(decorated["user_id"], json!("u1"));
        assert_eq!(decorated["campaign_id"], json!("acme"));
        assert_eq!(decorated["correlationId"], json!("C9"));
        // the original state is untouched
        assert!(!campaign.state.contains_key("user_id"));
    }

    #[test]
    fn test_mutate_features_set_semantics() {
        let mut campaign = CampaignState::new("acme", now());

        campaign.mutate_features(
            FeatureAction::Add,
            &["search".to_string(), "chat".to_string()],
            now(),
        );
        campaign.mutate_features(FeatureAction::Add, &["search".to_string()], now());
        assert_eq!(campaign.state.get("features"), Some(&json!(["search", "chat"])));

        campaign.mutate_features(FeatureAction::Remove, &["search".to_string()], now());
        assert_eq!(campaign.state.get("features"), Some(&json!(["chat"])));

        campaign.mutate_features(
            FeatureAction::Set,
            &["alpha".to_string(), "alpha".to_string(), "beta".to_string()],
            now(),
        );
        assert_eq!(campaign.state.get("features"), Some(&json!(["alpha", "beta"])));
    }

    #[test]
    fn test_apply_switch() {
        let mut campaign = CampaignState::new("acme", now());
        campaign.apply_switch(now());

        assert_eq!(campaign.state.get("status"), Some(&json!("active")));
        assert_eq!(
            campaign.state.get("switch_reason"),
            Some(&json!("user_initiated"))
        );
        assert!(campaign.state.contains_key("last_switched"));
    }

    #[test]
    fn test_set_config_places_subtree() {
        let mut campaign = CampaignState::new("acme", now());
        campaign.set_config("email", json!({"sender": "noreply@acme.io"}), now());

        assert_eq!(
            campaign.state.get("email"),
            Some(&json!({"sender": "noreply@acme.io"}))
        );
    }

    #[test]
    fn test_list_entry_backfill() {
        let campaign = CampaignState::new("summer_sale", now());
        let entry = campaign.list_entry();

        assert_eq!(entry["slug"], json!("summer_sale"));
        assert_eq!(entry["id"], json!("summer_sale"));
        assert_eq!(entry["title"], json!("Summer Sale"));
        assert_eq!(entry["name"], json!("Summer Sale"));
    }

    #[test]
    fn test_list_entry_keeps_existing_fields() {
        let mut campaign = CampaignState::new("acme", now());
        campaign.state.insert("title".to_string(), json!("ACME Corp"));

        let entry = campaign.list_entry();
        assert_eq!(entry["title"], json!("ACME Corp"));
        assert_eq!(entry["name"], json!("Acme"));
    }

    #[test]
    fn test_feature_action_parse() {
        assert_eq!(FeatureAction::parse("add").unwrap(), FeatureAction::Add);
        assert_eq!(FeatureAction::parse("remove").unwrap(), FeatureAction::Remove);
        assert_eq!(FeatureAction::parse("set").unwrap(), FeatureAction::Set);
        assert!(FeatureAction::parse("toggle").is_err());
    }
}
