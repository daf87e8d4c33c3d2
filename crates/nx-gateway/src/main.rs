//! Nexus WebSocket Gateway
//!
//! Bridges long-lived client WebSocket sessions onto the Nexus event bus:
//! frames go in through EmitEvent, envelopes come back on one subscription
//! stream and are routed by correlation id, addressed user, or scope.
//!
//! The relevant-types subscription list is seeded from the service
//! registration file and grows with every client request.

mod config;
mod connection;
mod correlation;
mod egress;
mod frames;
mod state;

use axum::http::HeaderValue;
use axum::{routing::get, Json, Router};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use config::GatewayConfig;
use nx_adapters::registry;
use nx_proto::NexusServiceClient;
use state::{GatewayState, SharedState};

/// Campaign reply types every gateway instance is always subscribed to
const CAMPAIGN_RELEVANT_TYPES: [&str; 5] = [
    "campaign:state:v1:success",
    "campaign:state:v1:failed",
    "campaign:state:v1:godot_update",
    "campaign:list:v1:success",
    "campaign:switch:v1:success",
];

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = GatewayConfig::from_env();
    init_tracing(&config);

    info!(
        service = %config.service_name,
        http_port = config.http_port,
        nexus = %config.nexus_grpc_addr,
        "Starting Nexus gateway"
    );

    // lazy channel: emits reconnect on demand, the egress loop handles the
    // subscription lifecycle itself
    let endpoint = tonic::transport::Endpoint::from_shared(config.nexus_grpc_addr.clone())?;
    let nexus = NexusServiceClient::new(endpoint.connect_lazy());

    let state: SharedState = Arc::new(GatewayState::new(config.clone(), nexus));

    // seed relevant types: every registered service:action:vN:success
    // permutation plus the campaign reply types
    match registry::load_registrations(&config.service_registry_path) {
        Ok(registrations) => {
            let seeded = registry::success_event_types(&registrations);
            info!(seeded = seeded.len(), "Relevant types seeded from registrations");
            state.relevant.extend(seeded);
        }
        Err(e) => {
            warn!(error = %e, "Service registrations not loaded, campaign types only");
        }
    }
    state.relevant.extend(CAMPAIGN_RELEVANT_TYPES);

    // the single upstream subscription
    let egress_state = state.clone();
    tokio::spawn(async move { egress::run_egress(egress_state).await });

    let cors = if config.allowed_origins.iter().any(|origin| origin == "*") {
        CorsLayer::permissive()
    } else {
        let origins: Vec<HeaderValue> = config
            .allowed_origins
            .iter()
            .filter_map(|origin| origin.parse().ok())
            .collect();
        CorsLayer::new().allow_origin(origins)
    };

    let ready_state = state.clone();
    let app = Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(move || ready_handler(ready_state.clone())))
        .route("/ws/:campaign_id/:user_id", get(connection::ws_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.http_port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "Gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Gateway shutdown complete");
    Ok(())
}

fn init_tracing(config: &GatewayConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));

    if config.json_logs() {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// Health/readiness check handler
async fn ready_handler(state: SharedState) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ready",
        "service": state.config.service_name,
        "connections": state.client_count(),
        "pending_requests": state.pending.len(),
        "relevant_types": state.relevant.len(),
    }))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
