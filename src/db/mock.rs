//! Mock database clients for testing.
//!
//! Provides in-memory implementations for exercising the gateway without a
//! database server.

use super::{DatabaseClient, ResultSet};
use crate::config::QueryConfig;
use crate::error::{GatewayError, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A mock database client that returns a predefined result for every query.
#[derive(Debug, Default)]
pub struct MockDatabaseClient {
    result: ResultSet,
    executed: AtomicUsize,
}

impl MockDatabaseClient {
    /// Creates a mock that answers every query with `result`.
    pub fn new(result: ResultSet) -> Self {
        Self {
            result,
            executed: AtomicUsize::new(0),
        }
    }

    /// Number of queries executed so far.
    pub fn executed(&self) -> usize {
        self.executed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DatabaseClient for MockDatabaseClient {
    async fn execute_query(&self, query: &QueryConfig) -> Result<ResultSet> {
        self.executed.fetch_add(1, Ordering::SeqCst);

        let mut result = self.result.clone();
        result.rewind();
        if let Some(limit) = query.max_rows {
            result.truncate_rows(limit);
        }
        Ok(result)
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// A mock database client whose queries always fail.
#[derive(Debug)]
pub struct FailingDatabaseClient {
    message: String,
}

impl FailingDatabaseClient {
    /// Creates a client that fails every query with a connection error.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[async_trait]
impl DatabaseClient for FailingDatabaseClient {
    async fn execute_query(&self, _query: &QueryConfig) -> Result<ResultSet> {
        Err(GatewayError::connection(self.message.clone()))
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
