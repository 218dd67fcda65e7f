//! FastCGI responder.
//!
//! `protocol` holds the record codec, `server` the accept loop and the
//! per-connection state machine. Applications plug in through `Handler`.

pub mod protocol;
pub mod server;

pub use server::{handle_connection, serve, ServerOptions};

use async_trait::async_trait;
use std::collections::HashMap;

/// A complete request: its CGI parameters and the request body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Request {
    pub request_id: u16,
    pub params: HashMap<String, String>,
    pub stdin: Vec<u8>,
}

impl Request {
    /// Looks up a CGI parameter such as `REQUEST_METHOD`.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }
}

/// Response sent back on FCGI_STDOUT as a CGI document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub content_type: String,
    pub body: Vec<u8>,

    /// Diagnostic text written to FCGI_STDERR.
    pub stderr: Option<String>,
}

impl Response {
    /// A 200 response carrying `body`.
    pub fn ok(content_type: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status: 200,
            content_type: content_type.into(),
            body: body.into(),
            stderr: None,
        }
    }

    /// A plain-text error response. The body only carries the status line
    /// text; `message` goes to stderr.
    pub fn error(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            content_type: "text/plain; charset=utf-8".to_string(),
            body: format!("{}\n", reason_phrase(status)).into_bytes(),
            stderr: Some(message.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Application status reported in END_REQUEST.
    pub fn app_status(&self) -> u32 {
        if self.is_success() {
            0
        } else {
            1
        }
    }

    /// Serializes the response as CGI output: headers, blank line, body.
    pub fn to_cgi_bytes(&self) -> Vec<u8> {
        let head = format!(
            "Status: {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\n\r\n",
            self.status,
            reason_phrase(self.status),
            self.content_type,
            self.body.len()
        );

        let mut out = Vec::with_capacity(head.len() + self.body.len());
        out.extend_from_slice(head.as_bytes());
        out.extend_from_slice(&self.body);
        out
    }
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Unknown",
    }
}

/// Produces a response for each complete request.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, request: Request) -> Response;
}
