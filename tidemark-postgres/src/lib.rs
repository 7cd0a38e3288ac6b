//! PostgreSQL [`EventStore`](tidemark::EventStore) adapter.
//!
//! Maps the store contract onto five tables and one sequence: events,
//! streams, projection progression, dead letters, and snapshots, all driven
//! through a single connection pool. Optimistic concurrency rides on a
//! guarded `UPDATE` of the stream row; exclusive stream locks use session
//! advisory locks so a crashed holder releases them automatically.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod schema;
mod store;

pub use schema::SCHEMA_STATEMENTS;

use nutype::nutype;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Pool, Postgres};
use std::time::Duration;
use thiserror::Error;
use tidemark::errors::StoreError;
use tidemark::serialization::PayloadFormat;
use tracing::info;

/// Failed to set up the adapter itself, before any store operation ran.
#[derive(Debug, Error)]
pub enum PostgresStoreError {
    /// The connection pool could not be created.
    #[error("failed to create postgres connection pool")]
    ConnectionFailed(#[source] sqlx::Error),

    /// The schema statements could not be applied.
    #[error("failed to apply schema")]
    SchemaFailed(#[source] sqlx::Error),
}

/// Maximum number of database connections in the pool. At least 1, enforced
/// by the underlying `NonZeroU32`.
#[nutype(derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRef, Into))]
pub struct MaxConnections(std::num::NonZeroU32);

/// Connection pool and payload tuning.
#[derive(Debug, Clone)]
pub struct PostgresConfig {
    /// Maximum number of connections in the pool (default: 10).
    pub max_connections: MaxConnections,
    /// Timeout for acquiring a connection from the pool (default: 30s).
    pub acquire_timeout: Duration,
    /// Idle timeout for pooled connections (default: 10 minutes).
    pub idle_timeout: Duration,
    /// Wire format for event payloads (default: JSON).
    pub payload_format: PayloadFormat,
    /// Identifier reported in loader errors and log lines.
    pub database_name: String,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        const DEFAULT_MAX_CONNECTIONS: std::num::NonZeroU32 =
            match std::num::NonZeroU32::new(10) {
                Some(v) => v,
                None => unreachable!(),
            };
        Self {
            max_connections: MaxConnections::new(DEFAULT_MAX_CONNECTIONS),
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600),
            payload_format: PayloadFormat::Json,
            database_name: "postgres".to_string(),
        }
    }
}

/// Event store backed by PostgreSQL.
#[derive(Debug, Clone)]
pub struct PostgresStore<E> {
    pool: Pool<Postgres>,
    format: PayloadFormat,
    name: String,
    _event: std::marker::PhantomData<fn() -> E>,
}

impl<E> PostgresStore<E> {
    /// Connects with the default configuration.
    pub async fn connect(connection_string: &str) -> Result<Self, PostgresStoreError> {
        Self::with_config(connection_string, PostgresConfig::default()).await
    }

    /// Connects with an explicit configuration.
    pub async fn with_config(
        connection_string: &str,
        config: PostgresConfig,
    ) -> Result<Self, PostgresStoreError> {
        let max_connections: std::num::NonZeroU32 = config.max_connections.into();
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.get())
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(config.idle_timeout)
            .connect(connection_string)
            .await
            .map_err(PostgresStoreError::ConnectionFailed)?;
        Ok(Self::from_pool_with(pool, config))
    }

    /// Wraps an existing pool, for callers that manage pooling themselves.
    pub fn from_pool(pool: Pool<Postgres>) -> Self {
        Self::from_pool_with(pool, PostgresConfig::default())
    }

    fn from_pool_with(pool: Pool<Postgres>, config: PostgresConfig) -> Self {
        Self {
            pool,
            format: config.payload_format,
            name: config.database_name,
            _event: std::marker::PhantomData,
        }
    }

    /// The underlying pool.
    pub fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }

    /// Creates the sequence and tables if they do not exist. Idempotent.
    pub async fn apply_schema(&self) -> Result<(), PostgresStoreError> {
        for statement in schema::SCHEMA_STATEMENTS {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(PostgresStoreError::SchemaFailed)?;
        }
        info!(database = %self.name, "schema applied");
        Ok(())
    }
}

/// Maps an sqlx failure into the store error taxonomy.
///
/// Conflicts never reach this path; the adapter detects them from row counts
/// before sqlx would surface anything. What is left is infrastructure.
fn map_sqlx_error(error: sqlx::Error) -> StoreError {
    match &error {
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::Tls(_) => StoreError::Connection(error.to_string()),
        _ => StoreError::TransactionRollback(error.to_string()),
    }
}
