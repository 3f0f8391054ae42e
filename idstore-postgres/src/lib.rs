//! PostgreSQL adapters for `idstore`
//!
//! - [`Database`]: pool wrapper with transaction options, health checks and migrations
//! - [`PostgresEventStore`]: the [`idstore::EventLog`] over `eventstore.events`
//! - [`PostgresProjectionStore`]: read models, progress rows, failed events and
//!   the dispatch queue
//!
//! The schema lives in `migrations/` and is applied by [`Database::migrate`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod event_store;
mod projection;
pub mod query;

use std::time::Duration;

use idstore::config::{env_millis, env_parse, env_required, ConfigError};
use idstore::{EventstoreError, EventstoreResult, Operation};
use nutype::nutype;
use sqlx::postgres::PgPoolOptions;
use sqlx::{query as sqlx_query, PgPool, Postgres, Transaction};
use thiserror::Error;
use tracing::{error, info, instrument, warn};

pub use event_store::PostgresEventStore;
pub use projection::{PostgresProjectionStore, PostgresProjectionTx};

/// Errors raised while setting up the database.
#[derive(Debug, Error)]
pub enum PostgresError {
    /// The connection pool could not be created.
    #[error("failed to create postgres connection pool")]
    ConnectionFailed(#[source] sqlx::Error),
    /// Applying the migrations failed.
    #[error("failed to apply postgres migrations")]
    MigrationFailed(#[source] sqlx::migrate::MigrateError),
    /// The environment holds an unusable value.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Maximum number of database connections in the pool.
///
/// Zero connections cannot be expressed.
#[nutype(derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRef, Into))]
pub struct MaxConnections(std::num::NonZeroU32);

/// Connection pool configuration.
#[derive(Debug, Clone)]
pub struct PostgresConfig {
    /// Maximum number of connections in the pool (default: 10)
    pub max_connections: MaxConnections,
    /// Timeout for acquiring a connection from the pool (default: 30 seconds)
    pub acquire_timeout: Duration,
    /// Idle timeout for connections in the pool (default: 10 minutes)
    pub idle_timeout: Duration,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        const DEFAULT_MAX_CONNECTIONS: std::num::NonZeroU32 = match std::num::NonZeroU32::new(10) {
            Some(v) => v,
            None => unreachable!(),
        };

        Self {
            max_connections: MaxConnections::new(DEFAULT_MAX_CONNECTIONS),
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600),
        }
    }
}

impl PostgresConfig {
    /// Reads `IDSTORE_PG_MAX_CONNECTIONS`, `IDSTORE_PG_ACQUIRE_TIMEOUT_MS` and
    /// `IDSTORE_PG_IDLE_TIMEOUT_MS`, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            max_connections: env_parse("IDSTORE_PG_MAX_CONNECTIONS")?
                .map_or(defaults.max_connections, MaxConnections::new),
            acquire_timeout: env_millis("IDSTORE_PG_ACQUIRE_TIMEOUT_MS")?
                .unwrap_or(defaults.acquire_timeout),
            idle_timeout: env_millis("IDSTORE_PG_IDLE_TIMEOUT_MS")?
                .unwrap_or(defaults.idle_timeout),
        })
    }
}

/// Transaction isolation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    /// `SERIALIZABLE`
    #[default]
    Serializable,
    /// `READ COMMITTED`
    ReadCommitted,
}

/// Transaction access mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessMode {
    /// `READ WRITE`
    #[default]
    ReadWrite,
    /// `READ ONLY`
    ReadOnly,
}

/// Options of [`Database::begin`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TxOptions {
    /// Isolation level (default: serializable).
    pub isolation: IsolationLevel,
    /// Access mode (default: read-write).
    pub access_mode: AccessMode,
}

impl TxOptions {
    /// Read committed isolation.
    #[must_use]
    pub const fn read_committed(mut self) -> Self {
        self.isolation = IsolationLevel::ReadCommitted;
        self
    }

    /// Read-only access.
    #[must_use]
    pub const fn read_only(mut self) -> Self {
        self.access_mode = AccessMode::ReadOnly;
        self
    }

    fn statement(self) -> &'static str {
        match (self.isolation, self.access_mode) {
            (IsolationLevel::Serializable, AccessMode::ReadWrite) => {
                "SET TRANSACTION ISOLATION LEVEL SERIALIZABLE, READ WRITE"
            }
            (IsolationLevel::Serializable, AccessMode::ReadOnly) => {
                "SET TRANSACTION ISOLATION LEVEL SERIALIZABLE, READ ONLY"
            }
            (IsolationLevel::ReadCommitted, AccessMode::ReadWrite) => {
                "SET TRANSACTION ISOLATION LEVEL READ COMMITTED, READ WRITE"
            }
            (IsolationLevel::ReadCommitted, AccessMode::ReadOnly) => {
                "SET TRANSACTION ISOLATION LEVEL READ COMMITTED, READ ONLY"
            }
        }
    }
}

/// The storage adapter: a shared Postgres connection pool.
///
/// Nested transactions are savepoints: call `begin` on an open
/// [`Transaction`]. Dropping an uncommitted transaction rolls it back.
#[derive(Debug, Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Connects with the given configuration.
    pub async fn connect(
        connection_string: &str,
        config: &PostgresConfig,
    ) -> Result<Self, PostgresError> {
        let max_connections: std::num::NonZeroU32 = config.max_connections.into();
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.get())
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(config.idle_timeout)
            .connect(connection_string)
            .await
            .map_err(PostgresError::ConnectionFailed)?;
        Ok(Self { pool })
    }

    /// Connects to `IDSTORE_DATABASE_URL` using [`PostgresConfig::from_env`].
    pub async fn from_env() -> Result<Self, PostgresError> {
        let url = env_required("IDSTORE_DATABASE_URL")?;
        Self::connect(&url, &PostgresConfig::from_env()?).await
    }

    /// Wraps an existing pool.
    pub const fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying pool.
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Opens a transaction with the requested isolation level and access mode.
    pub async fn begin(&self, options: TxOptions) -> EventstoreResult<Transaction<'static, Postgres>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|error| map_sqlx_error(error, Operation::BeginTransaction))?;
        sqlx_query(options.statement())
            .execute(&mut *tx)
            .await
            .map_err(|error| map_sqlx_error(error, Operation::BeginTransaction))?;
        Ok(tx)
    }

    /// Checks that the database answers.
    #[instrument(name = "postgres.ping", skip(self))]
    pub async fn ping(&self) -> EventstoreResult<()> {
        sqlx_query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|error| map_sqlx_error(error, Operation::Ping))?;
        Ok(())
    }

    /// Applies pending migrations.
    ///
    /// Applied versions are recorded in `_sqlx_migrations`; concurrent
    /// callers serialise on sqlx's advisory lock.
    #[instrument(name = "postgres.migrate", skip(self))]
    pub async fn migrate(&self) -> Result<(), PostgresError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(PostgresError::MigrationFailed)?;
        info!("[postgres.migrate] schema up to date");
        Ok(())
    }

    /// Closes every connection of the pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

pub(crate) const SERIALIZATION_FAILURE: &str = "40001";
pub(crate) const DEADLOCK_DETECTED: &str = "40P01";
pub(crate) const UNIQUE_VIOLATION: &str = "23505";
pub(crate) const LOCK_NOT_AVAILABLE: &str = "55P03";

/// SQLSTATE of a database error, if any.
pub(crate) fn sql_state(error: &sqlx::Error) -> Option<String> {
    match error {
        sqlx::Error::Database(db_error) => db_error.code().map(|code| code.into_owned()),
        _ => None,
    }
}

pub(crate) fn map_sqlx_error(error: sqlx::Error, operation: Operation) -> EventstoreError {
    if let sqlx::Error::Database(db_error) = &error {
        let code = db_error.code();
        match code.as_deref() {
            Some(UNIQUE_VIOLATION | SERIALIZATION_FAILURE | DEADLOCK_DETECTED) => {
                warn!(
                    error = %db_error,
                    operation = %operation,
                    "[postgres.concurrency_conflict] concurrent write detected"
                );
                return EventstoreError::ConcurrencyConflict {
                    code: "POSTG-Conc1",
                    aggregate: db_error
                        .constraint()
                        .unwrap_or("unknown")
                        .to_string(),
                    expected: None,
                    current: None,
                };
            }
            _ => {}
        }
    }
    if matches!(error, sqlx::Error::RowNotFound) {
        return EventstoreError::not_found("POSTG-NotF1", operation.to_string());
    }

    error!(
        error = %error,
        operation = %operation,
        "[postgres.database_error] database operation failed"
    );
    EventstoreError::internal("POSTG-Intl1", operation, error)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_transaction_is_serializable_read_write() {
        assert_eq!(
            TxOptions::default().statement(),
            "SET TRANSACTION ISOLATION LEVEL SERIALIZABLE, READ WRITE"
        );
        assert_eq!(
            TxOptions::default().read_committed().read_only().statement(),
            "SET TRANSACTION ISOLATION LEVEL READ COMMITTED, READ ONLY"
        );
    }

    #[test]
    fn default_pool_has_ten_connections() {
        let config = PostgresConfig::default();
        assert_eq!(config.max_connections.to_string(), "10");
        assert_eq!(config.acquire_timeout, Duration::from_secs(30));
    }

    #[test]
    fn missing_rows_map_to_not_found() {
        let error = map_sqlx_error(sqlx::Error::RowNotFound, Operation::LockProjection);
        assert_eq!(error.kind(), idstore::ErrorKind::NotFound);
    }

    #[test]
    fn transport_errors_map_to_internal() {
        let error = map_sqlx_error(sqlx::Error::PoolTimedOut, Operation::Push);
        assert_eq!(error.kind(), idstore::ErrorKind::Internal);
        assert_eq!(error.code(), "POSTG-Intl1");
    }
}
