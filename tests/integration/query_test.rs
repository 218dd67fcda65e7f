//! Query execution against a live database.
//!
//! Works with either backend; the scheme of DATABASE_URL picks it.

use pretty_assertions::assert_eq;
use serde_json::Value;
use sqljson_gateway::config::{ConnectionConfig, QueryConfig};
use sqljson_gateway::db::{self, DatabaseClient, RowSource};
use sqljson_gateway::gateway::Gateway;

/// Helper to create a test client.
async fn get_test_client() -> Option<Box<dyn DatabaseClient>> {
    let url = std::env::var("DATABASE_URL").ok()?;
    let config = ConnectionConfig::from_connection_string(&url).ok()?;
    db::connect(&config).await.ok()
}

fn query(sql: &str) -> QueryConfig {
    QueryConfig {
        sql: sql.to_string(),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_rows_arrive_as_text() {
    let Some(client) = get_test_client().await else {
        eprintln!("Skipping test: DATABASE_URL not set");
        return;
    };

    let mut result = client
        .execute_query(&query("SELECT 42 AS answer, 'it''s' AS quote, NULL AS nothing"))
        .await
        .unwrap();

    assert_eq!(result.num_fields(), 3);
    let row = result.next_row().unwrap();
    assert_eq!(row[0], Some(b"42".to_vec()));
    assert_eq!(row[1], Some(b"it's".to_vec()));
    assert_eq!(row[2], None);
    assert!(result.next_row().is_none());

    client.close().await.unwrap();
}

#[tokio::test]
async fn test_gateway_renders_live_rows() {
    let Some(client) = get_test_client().await else {
        eprintln!("Skipping test: DATABASE_URL not set");
        return;
    };

    let gateway = Gateway::new(
        client,
        query("SELECT 1 AS id, 'Home' AS title UNION ALL SELECT 2, 'About'"),
        "application/json",
    );
    let document = gateway.render().await.unwrap();
    assert_eq!(document.rows(), 2);

    let parsed: Value = serde_json::from_str(document.as_str()).unwrap();
    assert_eq!(parsed[0]["id"], "1");
    assert_eq!(parsed[1]["title"], "About");

    gateway.close().await.unwrap();
}

#[tokio::test]
async fn test_empty_result_renders_empty_array() {
    let Some(client) = get_test_client().await else {
        eprintln!("Skipping test: DATABASE_URL not set");
        return;
    };

    let gateway = Gateway::new(client, query("SELECT 1 AS id WHERE 1 = 0"), "application/json");
    let document = gateway.render().await.unwrap();
    assert_eq!(document.as_str(), "[]");

    gateway.close().await.unwrap();
}

#[tokio::test]
async fn test_max_rows_truncates() {
    let Some(client) = get_test_client().await else {
        eprintln!("Skipping test: DATABASE_URL not set");
        return;
    };

    let config = QueryConfig {
        max_rows: Some(2),
        ..query("SELECT 1 AS n UNION ALL SELECT 2 UNION ALL SELECT 3")
    };
    let result = client.execute_query(&config).await.unwrap();
    assert_eq!(result.row_count(), 2);
    assert!(result.was_truncated);

    client.close().await.unwrap();
}
