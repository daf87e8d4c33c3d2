//! gRPC transport for the router
//!
//! Implements the generated `NexusService` trait over the ingress, the
//! multiplexer, and the event repository. Trees cross the wire as JSON
//! strings; everything else is the domain's problem.

use futures::{Stream, StreamExt};
use once_cell::sync::Lazy;
use regex::Regex;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};
use tracing::{debug, error, info, warn};

use crate::ingress::{EmitRequest, EventIngress};
use crate::multiplexer::{EventMultiplexer, SubscribeSpec};
use nx_ports::EventRepository;
use nx_proto::{
    parse_json_tree, EventRequest, EventResponse, NexusService, PatternRequest, PatternResponse,
    SubscribeRequest, WireEnvelope,
};

/// Background attempts for the durable pattern write
const MAX_PATTERN_WRITE_ATTEMPTS: u32 = 5;

/// Event-type patterns: colon-separated segments of word characters, dots,
/// dashes, with `*` wildcards
static PATTERN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z0-9_.\-]+(:[a-z0-9_.\-*]+)*$").expect("pattern regex")
});

/// The tonic service backing `NexusServiceServer`
pub struct NexusGrpcService {
    ingress: Arc<EventIngress>,
    multiplexer: Arc<EventMultiplexer>,
    repository: Option<Arc<dyn EventRepository>>,
}

impl NexusGrpcService {
    pub fn new(
        ingress: Arc<EventIngress>,
        multiplexer: Arc<EventMultiplexer>,
        repository: Option<Arc<dyn EventRepository>>,
    ) -> Self {
        Self {
            ingress,
            multiplexer,
            repository,
        }
    }
}

#[tonic::async_trait]
impl NexusService for NexusGrpcService {
    async fn emit_event(
        &self,
        request: Request<EventRequest>,
    ) -> Result<Response<EventResponse>, Status> {
        let req = request.into_inner();
        let outcome = self
            .ingress
            .emit_event(EmitRequest {
                event_id: req.event_id,
                event_type: req.event_type,
                entity_id: req.entity_id,
                campaign_id: req.campaign_id,
                metadata: parse_json_tree(&req.metadata),
                payload: parse_json_tree(&req.payload),
            })
            .await;

        Ok(Response::new(EventResponse {
            success: outcome.success,
            message: outcome.message,
            metadata: if outcome.metadata.is_null() {
                String::new()
            } else {
                outcome.metadata.to_string()
            },
        }))
    }

    type SubscribeEventsStream =
        Pin<Box<dyn Stream<Item = Result<WireEnvelope, Status>> + Send + 'static>>;

    /// Empty `event_types` subscribes to the default channel only (the
    /// legacy-compatible reading of an empty request).
    async fn subscribe_events(
        &self,
        request: Request<SubscribeRequest>,
    ) -> Result<Response<Self::SubscribeEventsStream>, Status> {
        let req = request.into_inner();
        let metadata = parse_json_tree(&req.metadata);
        let spec = SubscribeSpec::from_request(req.event_types, &metadata);

        info!(
            event_types = spec.event_types.len(),
            user_filter = spec.user_id.is_some(),
            campaign_filter = spec.campaign_id.is_some(),
            "Subscription stream opened"
        );

        let rx = self.multiplexer.open(spec);
        let stream: Self::SubscribeEventsStream = Box::pin(
            ReceiverStream::new(rx).map(|envelope| Ok(WireEnvelope::from(&envelope))),
        );
        Ok(Response::new(stream))
    }

    /// Best-effort durable write: the response confirms queue acceptance;
    /// the repository write retries in the background.
    async fn register_pattern(
        &self,
        request: Request<PatternRequest>,
    ) -> Result<Response<PatternResponse>, Status> {
        let req = request.into_inner();

        if req.pattern.is_empty() || !PATTERN_RE.is_match(&req.pattern) {
            return Ok(Response::new(PatternResponse {
                success: false,
                message: format!("invalid pattern '{}'", req.pattern),
            }));
        }

        if let Some(repository) = self.repository.clone() {
            let service = req.service.clone();
            let pattern = req.pattern.clone();
            tokio::spawn(async move {
                let mut delay = Duration::from_millis(500);
                for attempt in 1..=MAX_PATTERN_WRITE_ATTEMPTS {
                    match repository.save_pattern(&service, &pattern).await {
                        Ok(()) => {
                            debug!(service = %service, pattern = %pattern, "Pattern persisted");
                            return;
                        }
                        Err(e) => {
                            warn!(
                                service = %service,
                                pattern = %pattern,
                                attempt = attempt,
                                error = %e,
                                "Pattern write failed"
                            );
                            tokio::time::sleep(delay).await;
                            delay *= 2;
                        }
                    }
                }
                error!(service = %service, pattern = %pattern, "Giving up on pattern write");
            });
        }

        Ok(Response::new(PatternResponse {
            success: true,
            message: "pattern accepted".to_string(),
        }))
    }
}
