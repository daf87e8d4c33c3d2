//! Gateway Service Configuration
//!
//! Configuration for the WebSocket gateway.
//! All values can be set via environment variables.

use std::path::PathBuf;

/// Gateway configuration
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// HTTP/WebSocket listen port (`HTTP_PORT`, falling back to `WS_PORT`)
    pub http_port: u16,

    /// Nexus gRPC upstream address
    pub nexus_grpc_addr: String,

    /// Allowed WebSocket origins; `*` allows all
    pub allowed_origins: Vec<String>,

    /// Service-registration file used to seed the relevant-types set
    pub service_registry_path: PathBuf,

    /// Deployment environment; anything but local/dev logs JSON
    pub log_env: String,

    /// Log level fallback when RUST_LOG is unset
    pub log_level: String,

    /// Service name for tracing
    pub service_name: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            http_port: 8090,
            nexus_grpc_addr: "http://127.0.0.1:50051".to_string(),
            allowed_origins: vec!["*".to_string()],
            service_registry_path: PathBuf::from("config/service_registration.json"),
            log_env: "local".to_string(),
            log_level: "info".to_string(),
            service_name: "nx-gateway".to_string(),
        }
    }
}

impl GatewayConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Self {
        let http_port = std::env::var("HTTP_PORT")
            .or_else(|_| std::env::var("WS_PORT"))
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(8090);

        let allowed_origins = std::env::var("ALLOWED_ORIGINS")
            .unwrap_or_else(|_| "*".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Self {
            http_port,
            nexus_grpc_addr: std::env::var("NEXUS_GRPC_ADDR")
                .unwrap_or_else(|_| "http://127.0.0.1:50051".to_string()),
            allowed_origins,
            service_registry_path: std::env::var("NEXUS_SERVICE_REGISTRY")
                .map(PathBuf::from)
                .unwrap_or_else(|_| Self::default().service_registry_path),
            log_env: std::env::var("LOG_ENV").unwrap_or_else(|_| "local".to_string()),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            service_name: std::env::var("NEXUS_SERVICE_NAME")
                .unwrap_or_else(|_| "nx-gateway".to_string()),
        }
    }

    /// Whether a WebSocket `Origin` header is acceptable. Requests without
    /// an origin (non-browser clients) are always allowed.
    pub fn origin_allowed(&self, origin: Option<&str>) -> bool {
        let Some(origin) = origin else {
            return true;
        };
        self.allowed_origins
            .iter()
            .any(|allowed| allowed == "*" || allowed == origin)
    }

    /// Whether logs should be emitted as JSON
    pub fn json_logs(&self) -> bool {
        !matches!(self.log_env.as_str(), "local" | "dev" | "development")
    }
}
