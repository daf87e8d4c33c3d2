//! PostgreSQL adapters: durable event store, event lock, campaign repository
//!
//! Schema is bootstrapped on connect (`ensure_schema`), mirroring how the
//! broker adapter ensures its channels. The durable event table carries the
//! status lifecycle pending -> delivered/failed -> dead driven by the retry
//! worker.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::future::BoxFuture;
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;
use tracing::{debug, info};

use nx_domain::{DeliveryStatus, EventRecord};
use nx_ports::{
    CampaignRepository, CampaignRepositoryError, CampaignRow, EventLock, EventRepository,
    EventRepositoryError, LockError,
};

/// Postgres configuration
#[derive(Debug, Clone)]
pub struct PostgresConfig {
    pub database_url: String,
    pub max_connections: u32,
}

impl PostgresConfig {
    pub fn from_env() -> Option<Self> {
        let database_url = std::env::var("NEXUS_DATABASE_URL").ok()?;
        Some(Self {
            database_url,
            max_connections: std::env::var("NEXUS_DATABASE_MAX_CONNECTIONS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(5),
        })
    }
}

/// Connect a pool and bootstrap the schema.
pub async fn connect(config: &PostgresConfig) -> Result<PgPool, EventRepositoryError> {
    info!("Connecting to Postgres");
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.database_url)
        .await
        .map_err(|e| EventRepositoryError::DatabaseError {
            message: e.to_string(),
        })?;

    ensure_schema(&pool).await?;
    info!("Postgres connection established");
    Ok(pool)
}

/// Create the Nexus tables when they do not exist yet.
pub async fn ensure_schema(pool: &PgPool) -> Result<(), EventRepositoryError> {
    let statements = [
        r#"
        CREATE TABLE IF NOT EXISTS nexus_events (
            event_id        TEXT PRIMARY KEY,
            event_type      TEXT NOT NULL,
            metadata        JSONB NOT NULL DEFAULT '{}'::jsonb,
            payload         JSONB NOT NULL DEFAULT '{}'::jsonb,
            status          TEXT NOT NULL DEFAULT 'pending',
            retries         INT NOT NULL DEFAULT 0,
            nexus_sequence  BIGINT NOT NULL,
            created_at      TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            error_message   TEXT
        )
        "#,
        r#"
        CREATE INDEX IF NOT EXISTS idx_nexus_events_status
            ON nexus_events (status, nexus_sequence)
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS nexus_event_locks (
            lock_key    TEXT PRIMARY KEY,
            expires_at  TIMESTAMPTZ NOT NULL
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS nexus_patterns (
            service     TEXT NOT NULL,
            pattern     TEXT NOT NULL,
            created_at  TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            PRIMARY KEY (service, pattern)
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS nexus_campaigns (
            slug        TEXT PRIMARY KEY,
            title       TEXT NOT NULL DEFAULT '',
            metadata    JSONB NOT NULL DEFAULT '{}'::jsonb,
            updated_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    ];

    for statement in statements {
        sqlx::query(statement).execute(pool).await.map_err(|e| {
            EventRepositoryError::DatabaseError {
                message: e.to_string(),
            }
        })?;
    }

    Ok(())
}

// ============================================================================
// Event repository
// ============================================================================

type EventRow = (
    String,
    String,
    Value,
    Value,
    String,
    i32,
    i64,
    DateTime<Utc>,
    Option<String>,
);

fn row_to_record(row: EventRow) -> Result<EventRecord, EventRepositoryError> {
    let (event_id, event_type, metadata, payload, status, retries, nexus_sequence, created_at, error_message) =
        row;
    let status =
        DeliveryStatus::parse(&status).ok_or_else(|| EventRepositoryError::SerializationError {
            message: format!("unknown delivery status '{}'", status),
        })?;
    Ok(EventRecord {
        event_id,
        event_type,
        metadata,
        payload,
        status,
        retries: retries.max(0) as u32,
        nexus_sequence: nexus_sequence.max(0) as u64,
        created_at,
        error_message,
    })
}

/// Translate a `*`-wildcard event-type pattern into a SQL LIKE pattern.
fn like_pattern(pattern: &str) -> String {
    pattern
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
        .replace('*', "%")
}

/// Durable event store on Postgres
pub struct PgEventRepository {
    pool: PgPool,
}

impl PgEventRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl EventRepository for PgEventRepository {
    fn save_event<'a>(
        &'a self,
        record: &'a EventRecord,
    ) -> BoxFuture<'a, Result<(), EventRepositoryError>> {
        Box::pin(async move {
            sqlx::query(
                r#"
                INSERT INTO nexus_events
                    (event_id, event_type, metadata, payload, status, retries, nexus_sequence, created_at, error_message)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                ON CONFLICT (event_id) DO NOTHING
                "#,
            )
            .bind(&record.event_id)
            .bind(&record.event_type)
            .bind(&record.metadata)
            .bind(&record.payload)
            .bind(record.status.as_str())
            .bind(record.retries as i32)
            .bind(record.nexus_sequence as i64)
            .bind(record.created_at)
            .bind(&record.error_message)
            .execute(&self.pool)
            .await
            .map_err(|e| EventRepositoryError::DatabaseError {
                message: e.to_string(),
            })?;

            debug!(event_id = %record.event_id, sequence = record.nexus_sequence, "Event saved");
            Ok(())
        })
    }

    fn update_status<'a>(
        &'a self,
        event_id: &'a str,
        status: DeliveryStatus,
        retries: u32,
        error_message: Option<&'a str>,
    ) -> BoxFuture<'a, Result<(), EventRepositoryError>> {
        Box::pin(async move {
            let result = sqlx::query(
                r#"
                UPDATE nexus_events
                SET status = $2, retries = $3, error_message = $4
                WHERE event_id = $1
                "#,
            )
            .bind(event_id)
            .bind(status.as_str())
            .bind(retries as i32)
            .bind(error_message)
            .execute(&self.pool)
            .await
            .map_err(|e| EventRepositoryError::DatabaseError {
                message: e.to_string(),
            })?;

            if result.rows_affected() == 0 {
                return Err(EventRepositoryError::NotFound {
                    event_id: event_id.to_string(),
                });
            }
            Ok(())
        })
    }

    fn list_pending<'a>(
        &'a self,
        limit: usize,
    ) -> BoxFuture<'a, Result<Vec<EventRecord>, EventRepositoryError>> {
        Box::pin(async move {
            let rows = sqlx::query_as::<_, EventRow>(
                r#"
                SELECT event_id, event_type, metadata, payload, status, retries, nexus_sequence, created_at, error_message
                FROM nexus_events
                WHERE status IN ('pending', 'failed')
                ORDER BY nexus_sequence ASC
                LIMIT $1
                "#,
            )
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| EventRepositoryError::DatabaseError {
                message: e.to_string(),
            })?;

            rows.into_iter().map(row_to_record).collect()
        })
    }

    fn list_by_pattern<'a>(
        &'a self,
        pattern: &'a str,
        limit: usize,
    ) -> BoxFuture<'a, Result<Vec<EventRecord>, EventRepositoryError>> {
        Box::pin(async move {
            let rows = sqlx::query_as::<_, EventRow>(
                r#"
                SELECT event_id, event_type, metadata, payload, status, retries, nexus_sequence, created_at, error_message
                FROM nexus_events
                WHERE event_type LIKE $1
                ORDER BY nexus_sequence ASC
                LIMIT $2
                "#,
            )
            .bind(like_pattern(pattern))
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| EventRepositoryError::DatabaseError {
                message: e.to_string(),
            })?;

            rows.into_iter().map(row_to_record).collect()
        })
    }

    fn save_pattern<'a>(
        &'a self,
        service: &'a str,
        pattern: &'a str,
    ) -> BoxFuture<'a, Result<(), EventRepositoryError>> {
        Box::pin(async move {
            sqlx::query(
                r#"
                INSERT INTO nexus_patterns (service, pattern)
                VALUES ($1, $2)
                ON CONFLICT (service, pattern) DO NOTHING
                "#,
            )
            .bind(service)
            .bind(pattern)
            .execute(&self.pool)
            .await
            .map_err(|e| EventRepositoryError::DatabaseError {
                message: e.to_string(),
            })?;
            Ok(())
        })
    }
}

// ============================================================================
// Event lock
// ============================================================================

/// Set-if-absent TTL lock on Postgres
pub struct PgEventLock {
    pool: PgPool,
}

impl PgEventLock {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl EventLock for PgEventLock {
    fn acquire<'a>(
        &'a self,
        key: &'a str,
        ttl: Duration,
    ) -> BoxFuture<'a, Result<bool, LockError>> {
        Box::pin(async move {
            let expires_at = Utc::now()
                + ChronoDuration::from_std(ttl).map_err(|e| LockError::BackendError {
                    message: e.to_string(),
                })?;

            // expired holders are swept opportunistically before the insert
            sqlx::query(r#"DELETE FROM nexus_event_locks WHERE expires_at < NOW()"#)
                .execute(&self.pool)
                .await
                .map_err(|e| LockError::BackendError {
                    message: e.to_string(),
                })?;

            let result = sqlx::query(
                r#"
                INSERT INTO nexus_event_locks (lock_key, expires_at)
                VALUES ($1, $2)
                ON CONFLICT (lock_key) DO NOTHING
                "#,
            )
            .bind(key)
            .bind(expires_at)
            .execute(&self.pool)
            .await
            .map_err(|e| LockError::BackendError {
                message: e.to_string(),
            })?;

            Ok(result.rows_affected() == 1)
        })
    }
}

// ============================================================================
// Campaign repository
// ============================================================================

/// Campaign metadata repository on Postgres
pub struct PgCampaignRepository {
    pool: PgPool,
}

impl PgCampaignRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl CampaignRepository for PgCampaignRepository {
    fn list<'a>(
        &'a self,
        limit: usize,
    ) -> BoxFuture<'a, Result<Vec<CampaignRow>, CampaignRepositoryError>> {
        Box::pin(async move {
            let rows = sqlx::query_as::<_, (String, String, Value)>(
                r#"
                SELECT slug, title, metadata
                FROM nexus_campaigns
                ORDER BY slug ASC
                LIMIT $1
                "#,
            )
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| CampaignRepositoryError::DatabaseError {
                message: e.to_string(),
            })?;

            Ok(rows
                .into_iter()
                .map(|(slug, title, metadata)| CampaignRow {
                    slug,
                    title,
                    metadata,
                })
                .collect())
        })
    }

    fn get_by_slug<'a>(
        &'a self,
        slug: &'a str,
    ) -> BoxFuture<'a, Result<Option<CampaignRow>, CampaignRepositoryError>> {
        Box::pin(async move {
            let row = sqlx::query_as::<_, (String, String, Value)>(
                r#"
                SELECT slug, title, metadata
                FROM nexus_campaigns
                WHERE slug = $1
                "#,
            )
            .bind(slug)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| CampaignRepositoryError::DatabaseError {
                message: e.to_string(),
            })?;

            Ok(row.map(|(slug, title, metadata)| CampaignRow {
                slug,
                title,
                metadata,
            }))
        })
    }

    fn update_metadata<'a>(
        &'a self,
        slug: &'a str,
        metadata: &'a Value,
    ) -> BoxFuture<'a, Result<(), CampaignRepositoryError>> {
        Box::pin(async move {
            sqlx::query(
                r#"
                UPDATE nexus_campaigns
                SET metadata = $2, updated_at = NOW()
                WHERE slug = $1
                "#,
            )
            .bind(slug)
            .bind(metadata)
            .execute(&self.pool)
            .await
            .map_err(|e| CampaignRepositoryError::DatabaseError {
                message: e.to_string(),
            })?;

            debug!(slug = %slug, "Campaign metadata updated");
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_like_pattern_translation() {
        assert_eq!(like_pattern("user:*"), "user:%");
        assert_eq!(like_pattern("*:success"), "%:success");
        assert_eq!(like_pattern("user:create:v1:success"), "user:create:v1:success");
        // literal SQL wildcards are escaped
        assert_eq!(like_pattern("a_b%c*"), "a\\_b\\%c%");
    }
}
