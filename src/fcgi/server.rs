//! Accept loop and per-connection request handling.
//!
//! Each connection runs in its own task and serves one request at a time.
//! Records for any other request id while a request is active are refused
//! with CANT_MPX_CONN.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::protocol::{
    decode_pairs, encode_pairs, read_record, write_record, write_stream, write_unknown_type,
    BeginRequest, EndRequest, ProtocolStatus, Record, RecordType, Role, MANAGEMENT_REQUEST_ID,
    MAX_CONNS, MAX_REQS, MPXS_CONNS,
};
use super::{Handler, Request, Response};
use crate::error::{GatewayError, Result};

/// Upper bound for the PARAMS and STDIN streams of a single request.
pub const MAX_STREAM_LEN: usize = 1024 * 1024;

/// Connection limits shared by the accept loop and every connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerOptions {
    /// Connections served at once; also reported as FCGI_MAX_CONNS.
    pub max_connections: usize,

    /// A connection that sends nothing for this long is closed.
    pub idle_timeout: Duration,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            max_connections: 64,
            idle_timeout: Duration::from_secs(60),
        }
    }
}

/// Accepts FastCGI connections until `shutdown` is cancelled, then waits for
/// in-flight requests to finish. Idle connections close as soon as shutdown
/// starts.
pub async fn serve(
    listener: TcpListener,
    handler: Arc<dyn Handler>,
    options: ServerOptions,
    shutdown: CancellationToken,
) -> Result<()> {
    let max_connections = options.max_connections;
    let permits = Arc::new(Semaphore::new(max_connections));

    if let Ok(addr) = listener.local_addr() {
        info!("Listening for FastCGI connections on {}", addr);
    }

    loop {
        let permit = tokio::select! {
            _ = shutdown.cancelled() => break,
            permit = permits.clone().acquire_owned() => permit
                .map_err(|_| GatewayError::internal("connection limiter closed"))?,
        };

        let (socket, peer_addr) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Failed to accept connection: {}", e);
                    continue;
                }
            },
        };
        debug!("New FastCGI connection from {}", peer_addr);

        let handler = handler.clone();
        let conn_shutdown = shutdown.child_token();
        tokio::spawn(async move {
            let _permit = permit;
            match handle_connection(socket, handler, options, conn_shutdown).await {
                Ok(()) => debug!("FastCGI connection from {} closed", peer_addr),
                Err(GatewayError::Io(e)) => debug!("Client {} disconnected: {}", peer_addr, e),
                Err(e) => warn!("Error on FastCGI connection from {}: {}", peer_addr, e),
            }
        });
    }

    info!("Shutting down, waiting for open connections");
    let all = u32::try_from(max_connections).unwrap_or(u32::MAX);
    let _drained = permits
        .acquire_many(all)
        .await
        .map_err(|_| GatewayError::internal("connection limiter closed"))?;
    info!("All connections closed");
    Ok(())
}

/// Request being assembled from its PARAMS and STDIN streams.
#[derive(Debug)]
struct PendingRequest {
    id: u16,
    keep_conn: bool,
    params: Vec<u8>,
    params_done: bool,
    stdin: Vec<u8>,
}

impl PendingRequest {
    fn new(id: u16, keep_conn: bool) -> Self {
        Self {
            id,
            keep_conn,
            params: Vec::new(),
            params_done: false,
            stdin: Vec::new(),
        }
    }

    fn push_params(&mut self, content: &[u8]) -> Result<()> {
        if content.is_empty() {
            self.params_done = true;
            return Ok(());
        }
        append_capped(&mut self.params, content, "PARAMS")
    }

    fn push_stdin(&mut self, content: &[u8]) -> Result<()> {
        append_capped(&mut self.stdin, content, "STDIN")
    }

    fn into_request(self) -> Result<Request> {
        if !self.params_done {
            debug!("Request {} dispatched before its PARAMS stream ended", self.id);
        }
        let params: HashMap<String, String> = decode_pairs(&self.params)?.into_iter().collect();
        Ok(Request {
            request_id: self.id,
            params,
            stdin: self.stdin,
        })
    }
}

fn append_capped(buffer: &mut Vec<u8>, content: &[u8], stream: &str) -> Result<()> {
    if buffer.len() + content.len() > MAX_STREAM_LEN {
        return Err(GatewayError::protocol(format!(
            "{stream} stream exceeds {MAX_STREAM_LEN} bytes"
        )));
    }
    buffer.extend_from_slice(content);
    Ok(())
}

/// Serves FastCGI records on one connection until the peer closes it, a
/// request without FCGI_KEEP_CONN completes, the peer stays silent for
/// `options.idle_timeout`, or `shutdown` is cancelled between requests.
pub async fn handle_connection<S>(
    stream: S,
    handler: Arc<dyn Handler>,
    options: ServerOptions,
    shutdown: CancellationToken,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (reader, writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(reader);
    let mut writer = BufWriter::new(writer);
    let mut active: Option<PendingRequest> = None;

    loop {
        // A request that is being received is allowed to finish
        let next = tokio::select! {
            _ = shutdown.cancelled(), if active.is_none() => {
                debug!("Closing idle FastCGI connection for shutdown");
                return Ok(());
            }
            next = tokio::time::timeout(options.idle_timeout, read_record(&mut reader)) => next,
        };

        let record = match next {
            Ok(record) => record?,
            Err(_) => {
                debug!(
                    "Closing FastCGI connection idle for {:?}",
                    options.idle_timeout
                );
                return Ok(());
            }
        };
        let Some(record) = record else {
            break;
        };

        debug!(
            "FastCGI record type={} id={} len={}",
            record.record_type,
            record.request_id,
            record.content.len()
        );

        if record.request_id == MANAGEMENT_REQUEST_ID {
            let reply = management_reply(&record, options.max_connections)?;
            send(&mut writer, &reply).await?;
            continue;
        }

        match record.kind() {
            Some(RecordType::BeginRequest) => {
                let begin = BeginRequest::parse(&record.content)?;

                if active.is_some() {
                    let reply = end_request(record.request_id, 0, ProtocolStatus::CantMpxConn);
                    send(&mut writer, &reply).await?;
                    continue;
                }

                if begin.role() != Some(Role::Responder) {
                    warn!("Refusing FastCGI role {}", begin.role);
                    let reply = end_request(record.request_id, 0, ProtocolStatus::UnknownRole);
                    send(&mut writer, &reply).await?;
                    if !begin.keep_conn() {
                        return Ok(());
                    }
                    continue;
                }

                active = Some(PendingRequest::new(record.request_id, begin.keep_conn()));
            }

            Some(RecordType::Params) => match active.as_mut() {
                Some(pending) if pending.id == record.request_id => {
                    pending.push_params(&record.content)?;
                }
                _ => debug!("Ignoring PARAMS for inactive request {}", record.request_id),
            },

            Some(RecordType::Stdin) => {
                let Some(pending) = active.as_mut().filter(|p| p.id == record.request_id) else {
                    debug!("Ignoring STDIN for inactive request {}", record.request_id);
                    continue;
                };

                if !record.content.is_empty() {
                    pending.push_stdin(&record.content)?;
                    continue;
                }

                let Some(pending) = active.take() else {
                    continue;
                };
                let keep_conn = pending.keep_conn;
                let request = pending.into_request()?;
                let request_id = request.request_id;

                let response = handler.handle(request).await;
                send(&mut writer, &response_records(request_id, &response)).await?;

                if !keep_conn {
                    return Ok(());
                }
            }

            Some(RecordType::AbortRequest) => {
                if active.as_ref().map(|p| p.id) != Some(record.request_id) {
                    continue;
                }
                let Some(pending) = active.take() else {
                    continue;
                };
                info!("Request {} aborted by the web server", pending.id);
                let reply = end_request(pending.id, 1, ProtocolStatus::RequestComplete);
                send(&mut writer, &reply).await?;
                if !pending.keep_conn {
                    return Ok(());
                }
            }

            _ => debug!(
                "Ignoring FastCGI record type {} for request {}",
                record.record_type, record.request_id
            ),
        }
    }

    Ok(())
}

/// Encodes a response as STDOUT, optional STDERR, then END_REQUEST.
fn response_records(request_id: u16, response: &Response) -> Vec<u8> {
    let mut out = Vec::new();
    write_stream(
        &mut out,
        RecordType::Stdout,
        request_id,
        &response.to_cgi_bytes(),
    );
    if let Some(message) = &response.stderr {
        write_stream(&mut out, RecordType::Stderr, request_id, message.as_bytes());
    }
    let end = EndRequest::new(response.app_status(), ProtocolStatus::RequestComplete);
    write_record(&mut out, RecordType::EndRequest, request_id, &end.to_bytes());
    out
}

fn end_request(request_id: u16, app_status: u32, status: ProtocolStatus) -> Vec<u8> {
    let mut out = Vec::new();
    let end = EndRequest::new(app_status, status);
    write_record(&mut out, RecordType::EndRequest, request_id, &end.to_bytes());
    out
}

fn management_reply(record: &Record, max_connections: usize) -> Result<Vec<u8>> {
    let mut out = Vec::new();

    if record.kind() != Some(RecordType::GetValues) {
        write_unknown_type(&mut out, record.record_type);
        return Ok(out);
    }

    let max = max_connections.to_string();
    let mut values: Vec<(&str, &str)> = Vec::new();
    for (name, _) in decode_pairs(&record.content)? {
        match name.as_str() {
            MAX_CONNS => values.push((MAX_CONNS, max.as_str())),
            MAX_REQS => values.push((MAX_REQS, max.as_str())),
            MPXS_CONNS => values.push((MPXS_CONNS, "0")),
            other => debug!("Unknown FastCGI variable {} requested", other),
        }
    }

    let mut body = Vec::new();
    encode_pairs(values, &mut body);
    write_record(
        &mut out,
        RecordType::GetValuesResult,
        MANAGEMENT_REQUEST_ID,
        &body,
    );
    Ok(out)
}

async fn send<W>(writer: &mut W, bytes: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(bytes).await?;
    writer.flush().await?;
    Ok(())
}
