//! Database abstraction layer.
//!
//! Provides a trait-based interface for running the served query, allowing
//! different database backends to be used interchangeably.

mod mock;
mod mysql;
mod postgres;
mod types;

pub use mock::{FailingDatabaseClient, MockDatabaseClient};
pub use mysql::MySqlClient;
pub use postgres::PostgresClient;
pub use types::{Cell, FieldDescriptor, ResultSet, Row, RowSource};

use crate::config::{ConnectionConfig, QueryConfig};
use crate::error::{GatewayError, Result};
use async_trait::async_trait;
use futures::{Stream, TryStreamExt};
use sqlx::{Column as SqlxColumn, Row as SqlxRow, TypeInfo};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Maximum number of connection retry attempts.
const MAX_RETRY_ATTEMPTS: u32 = 3;

/// Base delay between retry attempts (doubles each retry).
const RETRY_BASE_DELAY_MS: u64 = 500;

/// Connections kept by each pool.
const POOL_SIZE: u32 = 5;

/// How long a request waits for a pooled connection.
const ACQUIRE_TIMEOUT_SECS: u64 = 10;

/// Supported database backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseBackend {
    #[default]
    MySql,
    Postgres,
}

impl DatabaseBackend {
    /// Returns the backend as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MySql => "mysql",
            Self::Postgres => "postgres",
        }
    }

    /// Parses a backend from a string.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "mysql" | "mariadb" => Some(Self::MySql),
            "postgres" | "postgresql" => Some(Self::Postgres),
            _ => None,
        }
    }

    /// Returns the default port for this backend.
    pub fn default_port(&self) -> u16 {
        match self {
            Self::MySql => 3306,
            Self::Postgres => 5432,
        }
    }

    /// Returns the URL scheme for this backend.
    pub fn url_scheme(&self) -> &'static str {
        match self {
            Self::MySql => "mysql",
            Self::Postgres => "postgres",
        }
    }

    /// Client environment variables for host, port, database, user and password.
    pub fn env_vars(&self) -> [&'static str; 5] {
        match self {
            Self::MySql => [
                "MYSQL_HOST",
                "MYSQL_TCP_PORT",
                "MYSQL_DATABASE",
                "MYSQL_USER",
                "MYSQL_PWD",
            ],
            Self::Postgres => ["PGHOST", "PGPORT", "PGDATABASE", "PGUSER", "PGPASSWORD"],
        }
    }
}

/// Connects to the database, retrying transient failures.
pub async fn connect(config: &ConnectionConfig) -> Result<Box<dyn DatabaseClient>> {
    match config.backend {
        DatabaseBackend::MySql => Ok(Box::new(MySqlClient::connect(config).await?)),
        DatabaseBackend::Postgres => Ok(Box::new(PostgresClient::connect(config).await?)),
    }
}

/// Creates a client whose pool opens connections on first use.
///
/// An unreachable database then fails individual queries instead of startup.
pub fn connect_lazy(config: &ConnectionConfig) -> Result<Box<dyn DatabaseClient>> {
    match config.backend {
        DatabaseBackend::MySql => Ok(Box::new(MySqlClient::connect_lazy(config)?)),
        DatabaseBackend::Postgres => Ok(Box::new(PostgresClient::connect_lazy(config)?)),
    }
}

/// Trait defining the interface for database clients.
#[async_trait]
pub trait DatabaseClient: Send + Sync {
    /// Executes the query and returns its buffered result.
    async fn execute_query(&self, query: &QueryConfig) -> Result<ResultSet>;

    /// Closes the database connection.
    async fn close(&self) -> Result<()>;
}

/// Runs `attempt` until it succeeds, a non-transient error occurs, or the
/// attempts run out. The delay doubles after each transient failure.
pub(crate) async fn connect_with_retry<T, F, Fut>(mut attempt: F) -> sqlx::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = sqlx::Result<T>>,
{
    let mut delay = Duration::from_millis(RETRY_BASE_DELAY_MS);
    let mut n = 1;

    loop {
        debug!("Connection attempt {} of {}", n, MAX_RETRY_ATTEMPTS);
        match attempt().await {
            Ok(value) => {
                debug!("Successfully connected to database");
                return Ok(value);
            }
            Err(e) if n < MAX_RETRY_ATTEMPTS && is_transient_error(&e) => {
                warn!(
                    "Connection attempt {} failed (transient error), retrying in {:?}",
                    n, delay
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
                n += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Drains a row stream into a `ResultSet`.
///
/// Column metadata is taken from the first row. Reading stops after
/// `max_rows` rows, marking the result as truncated.
pub(crate) async fn collect_rows<R, S, F>(
    mut stream: S,
    max_rows: Option<usize>,
    convert: F,
) -> sqlx::Result<ResultSet>
where
    R: SqlxRow,
    S: Stream<Item = sqlx::Result<R>> + Unpin,
    F: Fn(&R) -> sqlx::Result<Row>,
{
    let mut fields = Vec::new();
    let mut rows = Vec::new();
    let mut truncated = false;

    while let Some(row) = stream.try_next().await? {
        if rows.is_empty() {
            fields = describe_columns(&row);
        }
        if max_rows.is_some_and(|limit| rows.len() >= limit) {
            truncated = true;
            break;
        }
        rows.push(convert(&row)?);
    }

    if truncated {
        warn!("Query returned more than {} rows, truncating", rows.len());
    }

    Ok(ResultSet::new(fields, rows).truncated(truncated))
}

fn describe_columns<R: SqlxRow>(row: &R) -> Vec<FieldDescriptor> {
    row.columns()
        .iter()
        .map(|col| FieldDescriptor::new(col.name(), col.type_info().name()))
        .collect()
}

/// Determines if an error is transient and worth retrying.
fn is_transient_error(error: &sqlx::Error) -> bool {
    if matches!(error, sqlx::Error::PoolTimedOut | sqlx::Error::Io(_)) {
        return true;
    }

    let error_str = error.to_string().to_lowercase();

    // Authentication and unknown-database errors are never transient
    if error_str.contains("access denied")
        || error_str.contains("authentication failed")
        || error_str.contains("does not exist")
        || error_str.contains("unknown database")
    {
        return false;
    }

    error_str.contains("connection refused")
        || error_str.contains("timed out")
        || error_str.contains("temporarily unavailable")
        || error_str.contains("connection reset")
        || error_str.contains("broken pipe")
}

/// Maps sqlx connection errors to operator-friendly messages.
pub(crate) fn map_connection_error(error: sqlx::Error, config: &ConnectionConfig) -> GatewayError {
    let host = config.host.as_deref().unwrap_or("localhost");
    let port = config.effective_port();
    let user = config.user.as_deref().unwrap_or("unknown");
    let database = config.database.as_deref().unwrap_or("unknown");

    let error_str = error.to_string().to_lowercase();

    if error_str.contains("connection refused") || error_str.contains("could not connect") {
        GatewayError::connection(format!(
            "Cannot connect to {host}:{port}. Check that the server is running."
        ))
    } else if error_str.contains("access denied")
        || error_str.contains("password authentication failed")
        || error_str.contains("authentication failed")
    {
        GatewayError::connection(format!(
            "Authentication failed for user '{user}'. Check your credentials."
        ))
    } else if error_str.contains("unknown database")
        || (error_str.contains("does not exist") && error_str.contains("database"))
    {
        GatewayError::connection(format!("Database '{database}' does not exist."))
    } else if matches!(error, sqlx::Error::PoolTimedOut)
        || error_str.contains("timed out")
        || error_str.contains("timeout")
    {
        GatewayError::connection(format!(
            "Connection to {host}:{port} timed out. The server may be overloaded or unreachable."
        ))
    } else {
        GatewayError::connection(error.to_string())
    }
}

/// Formats a query error, keeping the server's error code when present.
pub(crate) fn format_query_error(error: sqlx::Error) -> String {
    match error.as_database_error() {
        Some(db_error) => match db_error.code() {
            Some(code) => format!("ERROR {code}: {}", db_error.message()),
            None => format!("ERROR: {}", db_error.message()),
        },
        None => error.to_string(),
    }
}

/// Runs a query future under the configured timeout.
pub(crate) async fn with_query_timeout<T>(
    query: &QueryConfig,
    fut: impl Future<Output = sqlx::Result<T>>,
) -> Result<T> {
    tokio::time::timeout(Duration::from_secs(query.timeout_secs), fut)
        .await
        .map_err(|_| {
            GatewayError::query(format!(
                "Query timed out after {} seconds",
                query.timeout_secs
            ))
        })?
        .map_err(|e| GatewayError::query(format_query_error(e)))
}
