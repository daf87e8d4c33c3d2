//! Router Service Configuration
//!
//! Configuration for the Nexus router service.
//! All values can be set via environment variables.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Router service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// gRPC listen port for EmitEvent / SubscribeEvents / RegisterPattern
    pub grpc_port: u16,

    /// Health check HTTP port
    pub health_port: u16,

    /// NATS URL; unset runs the in-memory broker
    pub nats_url: Option<String>,

    /// Service-registration file enumerating per-action channels
    pub service_registry_path: PathBuf,

    /// Default campaign file; startup aborts when missing
    pub default_campaign_path: PathBuf,

    /// Campaigns seed file consulted when neither memory nor DB has entries
    pub campaigns_seed_path: PathBuf,

    /// Deployment environment; anything but local/dev logs JSON
    pub log_env: String,

    /// Log level fallback when RUST_LOG is unset
    pub log_level: String,

    /// Service name for tracing
    pub service_name: String,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            grpc_port: 50051,
            health_port: 8091,
            nats_url: None,
            service_registry_path: PathBuf::from("config/service_registration.json"),
            default_campaign_path: PathBuf::from("config/default_campaign.json"),
            campaigns_seed_path: PathBuf::from("config/campaigns_seed.json"),
            log_env: "local".to_string(),
            log_level: "info".to_string(),
            service_name: "nx-router".to_string(),
        }
    }
}

impl RouterConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Self {
        Self {
            grpc_port: std::env::var("NEXUS_GRPC_PORT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(50051),
            health_port: std::env::var("NEXUS_HEALTH_PORT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(8091),
            nats_url: std::env::var("NEXUS_NATS_URL").ok().filter(|s| !s.is_empty()),
            service_registry_path: std::env::var("NEXUS_SERVICE_REGISTRY")
                .map(PathBuf::from)
                .unwrap_or_else(|_| Self::default().service_registry_path),
            default_campaign_path: std::env::var("NEXUS_DEFAULT_CAMPAIGN")
                .map(PathBuf::from)
                .unwrap_or_else(|_| Self::default().default_campaign_path),
            campaigns_seed_path: std::env::var("NEXUS_CAMPAIGNS_SEED")
                .map(PathBuf::from)
                .unwrap_or_else(|_| Self::default().campaigns_seed_path),
            log_env: std::env::var("LOG_ENV").unwrap_or_else(|_| "local".to_string()),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            service_name: std::env::var("NEXUS_SERVICE_NAME")
                .unwrap_or_else(|_| "nx-router".to_string()),
        }
    }

    /// Whether logs should be emitted as JSON
    pub fn json_logs(&self) -> bool {
        !matches!(self.log_env.as_str(), "local" | "dev" | "development")
    }
}
