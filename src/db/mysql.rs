//! MySQL database client implementation.
//!
//! Provides the `MySqlClient` struct that implements the `DatabaseClient` trait
//! for MySQL and MariaDB databases using sqlx.

use crate::config::{ConnectionConfig, QueryConfig};
use crate::db::{
    collect_rows, connect_with_retry, map_connection_error, with_query_timeout, DatabaseClient,
    ResultSet, Row, ACQUIRE_TIMEOUT_SECS, POOL_SIZE,
};
use crate::error::Result;
use async_trait::async_trait;
use sqlx::mysql::{MySqlPool, MySqlPoolOptions, MySqlRow};
use sqlx::Row as SqlxRow;
use std::time::{Duration, Instant};
use tracing::debug;

/// MySQL database client.
#[derive(Debug)]
pub struct MySqlClient {
    pool: MySqlPool,
    config: ConnectionConfig,
}

impl MySqlClient {
    /// Creates a new MySqlClient from an existing connection pool.
    ///
    /// This is primarily useful for testing.
    pub fn from_pool(pool: MySqlPool, config: ConnectionConfig) -> Self {
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

fn pool_options() -> MySqlPoolOptions {
    MySqlPoolOptions::new()
        .max_connections(POOL_SIZE)
        .acquire_timeout(Duration::from_secs(ACQUIRE_TIMEOUT_SECS))
}

#[async_trait]
impl DatabaseClient for MySqlClient {
    async fn execute_query(&self, query: &QueryConfig) -> Result<ResultSet> {
        let start = Instant::now();

        // Released back to the pool when dropped, on every path out of here
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| map_connection_error(e, &self.config))?;

        // Text protocol: every value arrives as the server's string rendering
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

/// Reads every column of a text-protocol row as raw bytes.
fn convert_row(row: &MySqlRow) -> sqlx::Result<Row> {
    (0..row.len())
        .map(|i| row.try_get_unchecked::<Option<Vec<u8>>, _>(i))
        .collect()
}
