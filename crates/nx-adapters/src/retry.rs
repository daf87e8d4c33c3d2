//! Redelivery worker for durable events
//!
//! Periodically scans records still awaiting delivery and re-offers them to
//! the local subscriber table. Redelivery bypasses the ingress dedup lock
//! entirely: by the time a record is retried the lock window has long
//! expired, and re-checking it would suppress legitimate redelivery.
//!
//! Backoff doubles per retry from a 10s base; after the retry budget is
//! exhausted the record transitions to dead and the alert hook fires.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use nx_domain::{DeliveryStatus, EventEnvelope, EventRecord, MAX_DELIVERY_RETRIES};
use nx_ports::{EventRepository, EventRepositoryError};

/// Offers an envelope to the local subscriber table; returns how many
/// subscribers accepted it.
pub type DeliverFn = Arc<dyn Fn(&EventEnvelope) -> usize + Send + Sync>;

/// Fired once when a record transitions to dead.
pub type AlertFn = Arc<dyn Fn(&EventRecord) + Send + Sync>;

/// Retry worker tuning
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Interval between pending scans; never below one minute in production
    pub scan_interval: Duration,
    /// Records examined per scan
    pub batch_size: usize,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(60),
            batch_size: 100,
        }
    }
}

impl RetryConfig {
    pub fn from_env() -> Self {
        Self {
            scan_interval: Duration::from_secs(
                std::env::var("NEXUS_RETRY_SCAN_INTERVAL_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(60),
            ),
            batch_size: std::env::var("NEXUS_RETRY_BATCH_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(100),
        }
    }
}

/// Background redelivery worker
pub struct RetryWorker {
    repository: Arc<dyn EventRepository>,
    deliver: DeliverFn,
    alert: AlertFn,
    config: RetryConfig,
    running: Arc<AtomicBool>,
}

impl RetryWorker {
    pub fn new(
        repository: Arc<dyn EventRepository>,
        deliver: DeliverFn,
        alert: AlertFn,
        config: RetryConfig,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self {
            repository,
            deliver,
            alert,
            config,
            running,
        }
    }

    /// Scan loop; observes the shutdown flag between scans.
    pub async fn run(&self) {
        info!(
            interval_secs = self.config.scan_interval.as_secs(),
            "Retry worker started"
        );

        while self.running.load(Ordering::Relaxed) {
            match self.process_batch(Utc::now()).await {
                Ok(count) if count > 0 => {
                    debug!(processed = count, "Retry batch processed");
                }
                Ok(_) => {}
                Err(e) => {
                    error!(error = %e, "Error in retry scan");
                }
            }
            tokio::time::sleep(self.config.scan_interval).await;
        }

        info!("Retry worker stopped");
    }

    /// One scan: redeliver every due record, advancing its status.
    pub async fn process_batch(&self, now: DateTime<Utc>) -> Result<usize, EventRepositoryError> {
        let pending = self.repository.list_pending(self.config.batch_size).await?;
        let mut processed = 0;

        for record in pending {
            if !is_due(&record, now) {
                continue;
            }

            let envelope = record.to_envelope();
            let accepted = (self.deliver)(&envelope);

            if accepted > 0 {
                self.repository
                    .update_status(&record.event_id, DeliveryStatus::Delivered, record.retries, None)
                    .await?;
                debug!(
                    event_id = %record.event_id,
                    subscribers = accepted,
                    "Event redelivered"
                );
            } else {
                let retries = record.retries + 1;
                if retries >= MAX_DELIVERY_RETRIES {
                    self.repository
                        .update_status(
                            &record.event_id,
                            DeliveryStatus::Dead,
                            retries,
                            Some("no subscribers after max retries"),
                        )
                        .await?;
                    warn!(
                        event_id = %record.event_id,
                        event_type = %record.event_type,
                        retries = retries,
                        "Event declared dead"
                    );
                    (self.alert)(&record);
                } else {
                    self.repository
                        .update_status(
                            &record.event_id,
                            DeliveryStatus::Failed,
                            retries,
                            Some("no subscribers accepted delivery"),
                        )
                        .await?;
                }
            }
            processed += 1;
        }

        Ok(processed)
    }
}

/// Whether a record's backoff window has elapsed. First attempts are always
/// due; retried records wait out 10s doubled per prior retry, measured
/// against record age.
fn is_due(record: &EventRecord, now: DateTime<Utc>) -> bool {
    if record.retries == 0 {
        return true;
    }
    let delay = match ChronoDuration::from_std(record.next_retry_delay()) {
        Ok(delay) => delay,
        Err(_) => return true,
    };
    now - record.created_at >= delay
}
