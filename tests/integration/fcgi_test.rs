//! FastCGI round-trips against the gateway with in-memory database clients.

use std::sync::Arc;

use pretty_assertions::assert_eq;
use sqljson_gateway::config::QueryConfig;
use sqljson_gateway::db::{FailingDatabaseClient, FieldDescriptor, MockDatabaseClient, ResultSet};
use sqljson_gateway::fcgi::protocol::{
    encode_pairs, read_record, write_record, write_stream, BeginRequest, EndRequest,
    ProtocolStatus, Record, RecordType, Role,
};
use sqljson_gateway::fcgi::{handle_connection, serve, Handler, ServerOptions};
use sqljson_gateway::gateway::Gateway;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

fn pages_gateway() -> Gateway {
    let result = ResultSet::new(
        vec![
            FieldDescriptor::new("id", "INT"),
            FieldDescriptor::new("title", "VARCHAR"),
        ],
        vec![
            vec![Some(b"1".to_vec()), Some(b"Home".to_vec())],
            vec![Some(b"2".to_vec()), Some(b"Say \"hi\"".to_vec())],
            vec![Some(b"3".to_vec()), None],
        ],
    );
    Gateway::new(
        Box::new(MockDatabaseClient::new(result)),
        QueryConfig::default(),
        "application/json",
    )
}

fn request_bytes(id: u16, keep_conn: bool) -> Vec<u8> {
    let mut out = Vec::new();
    let begin = BeginRequest::new(Role::Responder, keep_conn).to_bytes();
    write_record(&mut out, RecordType::BeginRequest, id, &begin);

    let mut params = Vec::new();
    encode_pairs(
        [
            ("REQUEST_METHOD", "GET"),
            ("REQUEST_URI", "/pages.json"),
            ("SERVER_PROTOCOL", "HTTP/1.1"),
        ],
        &mut params,
    );
    write_stream(&mut out, RecordType::Params, id, &params);
    write_stream(&mut out, RecordType::Stdin, id, &[]);
    out
}

async fn parse_records(bytes: &[u8]) -> Vec<Record> {
    let mut reader = bytes;
    let mut records = Vec::new();
    while let Some(record) = read_record(&mut reader).await.unwrap() {
        records.push(record);
    }
    records
}

/// Concatenates one stream's content for `request_id`.
fn stream_content(records: &[Record], kind: RecordType, request_id: u16) -> Vec<u8> {
    records
        .iter()
        .filter(|r| r.kind() == Some(kind) && r.request_id == request_id)
        .flat_map(|r| r.content.iter().copied())
        .collect()
}

fn split_cgi(stdout: &[u8]) -> (String, String) {
    let text = String::from_utf8(stdout.to_vec()).unwrap();
    let (head, body) = text.split_once("\r\n\r\n").unwrap();
    (head.to_string(), body.to_string())
}

fn options(max_connections: usize) -> ServerOptions {
    ServerOptions {
        max_connections,
        ..Default::default()
    }
}

async fn exchange(handler: Arc<dyn Handler>, input: Vec<u8>) -> Vec<Record> {
    let (mut client, server) = tokio::io::duplex(1 << 16);
    let server_task = tokio::spawn(handle_connection(
        server,
        handler,
        options(8),
        CancellationToken::new(),
    ));

    client.write_all(&input).await.unwrap();
    let mut output = Vec::new();
    client.read_to_end(&mut output).await.unwrap();
    server_task.await.unwrap().unwrap();

    parse_records(&output).await
}

#[tokio::test]
async fn test_gateway_serves_json_document() {
    let records = exchange(Arc::new(pages_gateway()), request_bytes(1, false)).await;

    let (head, body) = split_cgi(&stream_content(&records, RecordType::Stdout, 1));
    assert!(head.starts_with("Status: 200 OK"));
    assert!(head.contains("Content-Type: application/json"));
    assert_eq!(
        body,
        r#"[{"id": "1", "title": "Home"}, {"id": "2", "title": "Say \"hi\""}, {"id": "3", "title": null}]"#
    );

    let parsed: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(parsed[1]["title"], "Say \"hi\"");

    assert!(stream_content(&records, RecordType::Stderr, 1).is_empty());
    let end = records.last().unwrap();
    assert_eq!(end.kind(), Some(RecordType::EndRequest));
    assert_eq!(
        EndRequest::parse(&end.content).unwrap(),
        EndRequest::new(0, ProtocolStatus::RequestComplete)
    );
}

#[tokio::test]
async fn test_database_failure_is_500_with_stderr() {
    let gateway = Gateway::new(
        Box::new(FailingDatabaseClient::new("Cannot connect to localhost:3306")),
        QueryConfig::default(),
        "application/json",
    );
    let records = exchange(Arc::new(gateway), request_bytes(1, false)).await;

    let (head, body) = split_cgi(&stream_content(&records, RecordType::Stdout, 1));
    assert!(head.starts_with("Status: 500 Internal Server Error"));
    assert_eq!(body, "Internal Server Error\n");
    assert!(!head.contains("localhost:3306"));

    let stderr = String::from_utf8(stream_content(&records, RecordType::Stderr, 1)).unwrap();
    assert_eq!(stderr, "Connection error: Cannot connect to localhost:3306");

    let end = EndRequest::parse(&records.last().unwrap().content).unwrap();
    assert_eq!(end.app_status, 1);
}

#[tokio::test]
async fn test_keep_conn_requests_get_fresh_documents() {
    let mut input = request_bytes(1, true);
    input.extend(request_bytes(2, false));

    let records = exchange(Arc::new(pages_gateway()), input).await;

    let (_, first) = split_cgi(&stream_content(&records, RecordType::Stdout, 1));
    let (_, second) = split_cgi(&stream_content(&records, RecordType::Stdout, 2));
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_serve_over_tcp_until_shutdown() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();

    let handler: Arc<dyn Handler> = Arc::new(pages_gateway());
    let server = tokio::spawn(serve(listener, handler, options(4), shutdown.clone()));

    for _ in 0..2 {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(&request_bytes(1, false)).await.unwrap();
        let mut output = Vec::new();
        stream.read_to_end(&mut output).await.unwrap();

        let records = parse_records(&output).await;
        let (head, _) = split_cgi(&stream_content(&records, RecordType::Stdout, 1));
        assert!(head.starts_with("Status: 200 OK"));
    }

    shutdown.cancel();
    server.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_shutdown_closes_idle_keep_conn_connection() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();

    let handler: Arc<dyn Handler> = Arc::new(pages_gateway());
    let server = tokio::spawn(serve(listener, handler, options(4), shutdown.clone()));

    // One finished request, then the connection sits idle
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(&request_bytes(1, true)).await.unwrap();
    let mut header = [0u8; 8];
    stream.read_exact(&mut header).await.unwrap();

    shutdown.cancel();
    tokio::time::timeout(std::time::Duration::from_secs(3), server)
        .await
        .expect("serve did not return with an idle connection open")
        .unwrap()
        .unwrap();
}
