//! Nexus Router Service
//!
//! The event routing core: validates, deduplicates, and fans out canonical
//! events over per-action broker channels, hosts the campaign state manager,
//! and exposes the EmitEvent / SubscribeEvents / RegisterPattern RPCs.
//!
//! Degrades gracefully: without NATS it runs the in-memory broker; without
//! Postgres it runs the in-memory dedup lock and skips durable persistence.
//! The default campaign file is the one hard startup requirement.

use axum::{routing::get, Json, Router};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::signal;
use tracing::{error, info, warn};

use nx_adapters::channel::ChannelConfig;
use nx_adapters::memory::{MemoryBroker, MemoryLock};
use nx_adapters::nats::{NatsBroker, NatsConfig};
use nx_adapters::postgres::{
    self, PgCampaignRepository, PgEventLock, PgEventRepository, PostgresConfig,
};
use nx_adapters::registry;
use nx_adapters::retry::{AlertFn, DeliverFn, RetryConfig, RetryWorker};
use nx_ports::{CampaignRepository, EventLock, EventRepository, MessageBroker};
use nx_proto::NexusServiceServer;
use nx_router::bus::MultiBus;
use nx_router::campaign::{CampaignManager, CampaignManagerConfig};
use nx_router::config::RouterConfig;
use nx_router::grpc::NexusGrpcService;
use nx_router::ingress::EventIngress;
use nx_router::multiplexer::EventMultiplexer;

/// Shared state for the health endpoints
struct RouterState {
    config: RouterConfig,
    started_at: Instant,
    ingress: Arc<EventIngress>,
    bus: Arc<MultiBus>,
    campaigns: Arc<CampaignManager>,
    running: Arc<AtomicBool>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = RouterConfig::from_env();
    init_tracing(&config);

    info!(
        service = %config.service_name,
        grpc_port = config.grpc_port,
        health_port = config.health_port,
        "Starting Nexus router"
    );

    // Per-action channel topology comes from the registration file; without
    // it only the default channel exists.
    let registrations = match registry::load_registrations(&config.service_registry_path) {
        Ok(registrations) => registrations,
        Err(e) => {
            warn!(error = %e, "Service registrations not loaded, default channel only");
            Vec::new()
        }
    };

    // Broker: NATS when configured, in-memory otherwise.
    let broker: Arc<dyn MessageBroker> = match &config.nats_url {
        Some(url) => {
            let nats_config = NatsConfig {
                url: url.clone(),
                ..NatsConfig::from_env()
            };
            match NatsBroker::connect(nats_config).await {
                Ok(broker) => Arc::new(broker),
                Err(e) => {
                    warn!(error = %e, "NATS unavailable, using in-memory broker");
                    Arc::new(MemoryBroker::new())
                }
            }
        }
        None => {
            info!("No NATS url configured, using in-memory broker");
            Arc::new(MemoryBroker::new())
        }
    };

    // Persistence: Postgres when configured, memory lock otherwise.
    let mut repository: Option<Arc<dyn EventRepository>> = None;
    let mut campaign_repository: Option<Arc<dyn CampaignRepository>> = None;
    let mut lock: Arc<dyn EventLock> = Arc::new(MemoryLock::new());
    match PostgresConfig::from_env() {
        Some(pg_config) => match postgres::connect(&pg_config).await {
            Ok(pool) => {
                repository = Some(Arc::new(PgEventRepository::new(pool.clone())));
                campaign_repository = Some(Arc::new(PgCampaignRepository::new(pool.clone())));
                lock = Arc::new(PgEventLock::new(pool));
            }
            Err(e) => {
                warn!(error = %e, "Postgres unavailable, running without durable store");
            }
        },
        None => {
            info!("No database url configured, running without durable store");
        }
    }

    let bus = Arc::new(MultiBus::open(broker, &registrations, ChannelConfig::default()).await?);

    // The default campaign is a hard invariant; a load failure aborts here.
    let campaigns = CampaignManager::start(
        bus.clone(),
        campaign_repository,
        CampaignManagerConfig {
            default_campaign_path: config.default_campaign_path.clone(),
            campaigns_seed_path: Some(config.campaigns_seed_path.clone()),
        },
    )
    .await?;

    let ingress = Arc::new(EventIngress::new(
        bus.clone(),
        lock,
        repository.clone(),
        campaigns.clone(),
    ));
    let multiplexer = Arc::new(EventMultiplexer::new(bus.clone()));

    let running = Arc::new(AtomicBool::new(true));

    // Redelivery worker: re-offers pending durable events to the local
    // subscriber tables, bypassing the dedup lock.
    let retry_worker = repository.clone().map(|repository| {
        let deliver_bus = bus.clone();
        let deliver: DeliverFn = Arc::new(move |envelope| deliver_bus.deliver_local(envelope));
        let alert: AlertFn = Arc::new(|record| {
            error!(
                event_id = %record.event_id,
                event_type = %record.event_type,
                retries = record.retries,
                "Durable event dead lettered"
            );
        });
        let worker = RetryWorker::new(
            repository,
            deliver,
            alert,
            RetryConfig::from_env(),
            running.clone(),
        );
        tokio::spawn(async move { worker.run().await })
    });

    // gRPC transport
    let grpc_addr = SocketAddr::from(([0, 0, 0, 0], config.grpc_port));
    let grpc_service = NexusGrpcService::new(ingress.clone(), multiplexer, repository.clone());
    let grpc_server = tokio::spawn(async move {
        info!(addr = %grpc_addr, "Nexus gRPC listening");
        if let Err(e) = tonic::transport::Server::builder()
            .add_service(NexusServiceServer::new(grpc_service))
            .serve(grpc_addr)
            .await
        {
            error!(error = %e, "gRPC server error");
        }
    });

    // Health endpoints
    let state = Arc::new(RouterState {
        config: config.clone(),
        started_at: Instant::now(),
        ingress,
        bus,
        campaigns,
        running: running.clone(),
    });
    let health_addr = SocketAddr::from(([0, 0, 0, 0], config.health_port));
    let ready_state = state.clone();
    let health_app = Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route(
            "/readyz",
            get(move || ready_handler(ready_state.clone())),
        );
    let health_server = tokio::spawn(async move {
        info!(addr = %health_addr, "Health server listening");
        match tokio::net::TcpListener::bind(health_addr).await {
            Ok(listener) => {
                if let Err(e) = axum::serve(listener, health_app).await {
                    error!(error = %e, "Health server error");
                }
            }
            Err(e) => error!(error = %e, "Failed to bind health listener"),
        }
    });

    shutdown_signal().await;
    info!("Shutdown signal received, stopping Nexus router");
    running.store(false, Ordering::Relaxed);

    if let Some(worker) = retry_worker {
        let _ = tokio::time::timeout(std::time::Duration::from_secs(5), worker).await;
    }
    grpc_server.abort();
    health_server.abort();

    info!("Nexus router shutdown complete");
    Ok(())
}

fn init_tracing(config: &RouterConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));

    if config.json_logs() {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// Health/readiness check handler
async fn ready_handler(state: Arc<RouterState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": if state.running.load(Ordering::Relaxed) { "ready" } else { "stopping" },
        "service": state.config.service_name,
        "node_id": state.ingress.node_id(),
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "sequence": state.ingress.current_sequence(),
        "channels": state.bus.channel_count(),
        "campaigns": state.campaigns.campaign_count().await,
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
