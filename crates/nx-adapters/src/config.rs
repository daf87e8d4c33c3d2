//! Campaign config file loading
//!
//! Two files seed the campaign state manager:
//! - the default campaign: a single JSON object with a required `slug`; the
//!   router refuses to start without it
//! - the campaigns seed: a JSON array of campaign objects, consulted only
//!   when neither memory nor the repository has entries

use serde_json::{Map, Value};
use std::path::Path;
use tracing::info;

/// Config file errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {message}")]
    Io { path: String, message: String },

    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: String, message: String },

    #[error("Invalid config file {path}: {reason}")]
    Invalid { path: String, reason: String },
}

fn read_json(path: &Path) -> Result<Value, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;
    serde_json::from_str(&contents).map_err(|e| ConfigError::Parse {
        path: path.display().to_string(),
        message: e.to_string(),
    })
}

fn slug_of(object: &Map<String, Value>) -> Option<String> {
    object
        .get("slug")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

/// Load the default campaign file. Returns `(slug, object)`.
pub fn load_default_campaign(path: &Path) -> Result<(String, Map<String, Value>), ConfigError> {
    let value = read_json(path)?;
    let object = value.as_object().ok_or_else(|| ConfigError::Invalid {
        path: path.display().to_string(),
        reason: "expected a JSON object".to_string(),
    })?;

    let slug = slug_of(object).ok_or_else(|| ConfigError::Invalid {
        path: path.display().to_string(),
        reason: "missing non-empty 'slug'".to_string(),
    })?;

    info!(path = %path.display(), slug = %slug, "Default campaign loaded");
    Ok((slug, object.clone()))
}

/// Load the campaigns seed file. Entries without a slug are skipped.
pub fn load_campaigns_seed(path: &Path) -> Result<Vec<(String, Map<String, Value>)>, ConfigError> {
    let value = read_json(path)?;
    let entries = value.as_array().ok_or_else(|| ConfigError::Invalid {
        path: path.display().to_string(),
        reason: "expected a JSON array".to_string(),
    })?;

    let mut campaigns = Vec::new();
    for entry in entries {
        if let Some(object) = entry.as_object() {
            if let Some(slug) = slug_of(object) {
                campaigns.push((slug, object.clone()));
            }
        }
    }

    info!(
        path = %path.display(),
        campaigns = campaigns.len(),
        "Campaigns seed loaded"
    );
    Ok(campaigns)
}
