//! Service-registration file loading
//!
//! The registration file enumerates every backend service with its endpoints
//! and actions. The router derives the per-action channel map from it; the
//! gateway derives its initial relevant-event-types set.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

/// One endpoint within a service registration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceEndpoint {
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub actions: Vec<String>,
}

/// One registered service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceRegistration {
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub endpoints: Vec<ServiceEndpoint>,
}

fn default_version() -> String {
    "v1".to_string()
}

impl ServiceRegistration {
    /// The version normalized to the `vN` wire form.
    pub fn wire_version(&self) -> String {
        if self.version.starts_with('v') {
            self.version.clone()
        } else {
            format!("v{}", self.version)
        }
    }
}

/// Registry errors
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Failed to read registration file {path}: {message}")]
    Io { path: String, message: String },

    #[error("Failed to parse registration file {path}: {message}")]
    Parse { path: String, message: String },
}

/// Load the registration file: a JSON array of service objects.
pub fn load_registrations(path: &Path) -> Result<Vec<ServiceRegistration>, RegistryError> {
    let contents = std::fs::read_to_string(path).map_err(|e| RegistryError::Io {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;

    let registrations: Vec<ServiceRegistration> =
        serde_json::from_str(&contents).map_err(|e| RegistryError::Parse {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;

    info!(
        path = %path.display(),
        services = registrations.len(),
        "Service registrations loaded"
    );
    Ok(registrations)
}

/// Every distinct `(service, action)` pair, in file order.
pub fn action_keys(registrations: &[ServiceRegistration]) -> Vec<(String, String)> {
    let mut seen = std::collections::HashSet::new();
    let mut keys = Vec::new();
    for registration in registrations {
        for endpoint in &registration.endpoints {
            for action in &endpoint.actions {
                if action.is_empty() {
                    continue;
                }
                let key = (registration.name.clone(), action.clone());
                if seen.insert(key.clone()) {
                    keys.push(key);
                }
            }
        }
    }
    keys
}

/// Every `service:action:vN:success` permutation, used to seed the gateway's
/// relevant-event-types set.
pub fn success_event_types(registrations: &[ServiceRegistration]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut types = Vec::new();
    for registration in registrations {
        let version = registration.wire_version();
        for endpoint in &registration.endpoints {
            for action in &endpoint.actions {
                if action.is_empty() {
                    continue;
                }
                let event_type =
                    format!("{}:{}:{}:success", registration.name, action, version);
                if seen.insert(event_type.clone()) {
                    types.push(event_type);
                }
            }
        }
    }
    types
}
