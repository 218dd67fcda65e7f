//! The request handler: run the configured query and answer with its rows as
//! a JSON document.

use std::time::Instant;

use async_trait::async_trait;
use tracing::{error, info};

use crate::config::QueryConfig;
use crate::db::DatabaseClient;
use crate::encode::{encode, JsonDocument};
use crate::error::Result;
use crate::fcgi::{Handler, Request, Response};

/// Serves the configured query on every request.
pub struct Gateway {
    db: Box<dyn DatabaseClient>,
    query: QueryConfig,
    content_type: String,
}

impl Gateway {
    pub fn new(
        db: Box<dyn DatabaseClient>,
        query: QueryConfig,
        content_type: impl Into<String>,
    ) -> Self {
        Self {
            db,
            query,
            content_type: content_type.into(),
        }
    }

    /// Executes the query and encodes its rows. Truncation is logged where
    /// the rows are collected.
    pub async fn render(&self) -> Result<JsonDocument> {
        let mut result = self.db.execute_query(&self.query).await?;
        Ok(encode(&mut result)?)
    }

    /// Renders a full response, turning failures into a 500.
    pub async fn respond(&self) -> Response {
        match self.render().await {
            Ok(document) => Response::ok(self.content_type.as_str(), document.into_string()),
            Err(e) => {
                error!("{}: {}", e.category(), e);
                Response::error(500, e.to_string())
            }
        }
    }

    /// Releases the database pool.
    pub async fn close(&self) -> Result<()> {
        self.db.close().await
    }
}

#[async_trait]
impl Handler for Gateway {
    async fn handle(&self, request: Request) -> Response {
        let start = Instant::now();
        let response = self.respond().await;

        info!(
            "{} {} -> {} ({} bytes, {:?})",
            request.param("REQUEST_METHOD").unwrap_or("-"),
            request
                .param("REQUEST_URI")
                .or_else(|| request.param("SCRIPT_NAME"))
                .unwrap_or("-"),
            response.status,
            response.body.len(),
            start.elapsed()
        );
        response
    }
}
