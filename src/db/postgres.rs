//! PostgreSQL database client implementation.
//!
//! Provides the `PostgresClient` struct that implements the `DatabaseClient` trait
//! for PostgreSQL databases using sqlx.

use crate::config::{ConnectionConfig, QueryConfig};
use crate::db::{
    collect_rows, connect_with_retry, map_connection_error, with_query_timeout, DatabaseClient,
    ResultSet, Row, ACQUIRE_TIMEOUT_SECS, POOL_SIZE,
};
use crate::error::Result;
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row as SqlxRow;
use std::time::{Duration, Instant};
use tracing::debug;

/// PostgreSQL database client.
#[derive(Debug)]
pub struct PostgresClient {
    pool: PgPool,
    config: ConnectionConfig,
}

impl PostgresClient {
    /// Creates a new PostgresClient from an existing connection pool.
    ///
    /// This is primarily useful for testing.
    pub fn from_pool(pool: PgPool, config: ConnectionConfig) -> Self {
        Self { pool, config }
    }

    /// Connects eagerly, retrying transient failures.
    pub async fn connect(config: &ConnectionConfig) -> Result<Self> {
        let conn_str = config.to_connection_string()?;

        let pool = connect_with_retry(|| pool_options().connect(&conn_str))
            .await
            .map_err(|e| map_connection_error(e, config))?;

        Ok(Self::from_pool(pool, config.clone()))
    }

    /// Builds the pool without opening a connection.
    pub fn connect_lazy(config: &ConnectionConfig) -> Result<Self> {
        let conn_str = config.to_connection_string()?;

        let pool = pool_options()
            .connect_lazy(&conn_str)
            .map_err(|e| map_connection_error(e, config))?;

        Ok(Self::from_pool(pool, config.clone()))
    }
}

fn pool_options() -> PgPoolOptions {
    PgPoolOptions::new()
        .max_connections(POOL_SIZE)
        .acquire_timeout(Duration::from_secs(ACQUIRE_TIMEOUT_SECS))
}

#[async_trait]
impl DatabaseClient for PostgresClient {
    async fn execute_query(&self, query: &QueryConfig) -> Result<ResultSet> {
        let start = Instant::now();

        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| map_connection_error(e, &self.config))?;

        // Simple query protocol, so every column comes back in text format
        let result = with_query_timeout(query, async {
            let stream = sqlx::raw_sql(&query.sql).fetch(&mut *conn);
            collect_rows(stream, query.max_rows, convert_row).await
        })
        .await?;

        let execution_time = start.elapsed();
        debug!(
            "Fetched {} rows in {:?}",
            result.row_count(),
            execution_time
        );

        Ok(result.with_execution_time(execution_time))
    }

    async fn close(&self) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }
}

/// Reads every column of a text-format row. Text values from the server are
/// always valid UTF-8.
fn convert_row(row: &PgRow) -> sqlx::Result<Row> {
    (0..row.len())
        .map(|i| {
            row.try_get_unchecked::<Option<String>, _>(i)
                .map(|value| value.map(String::into_bytes))
        })
        .collect()
}
