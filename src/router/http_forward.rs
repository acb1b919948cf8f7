//! Direct HTTP forwarding for HTTP backends.
//!
//! Every call is a bounded POST of the caller's JSON-RPC body to the
//! backend's URL. Responses may be plain JSON or a single-event
//! `text/event-stream` body, as streamable-HTTP MCP servers send.

use std::time::Duration;

use reqwest::{Client as HttpClient, StatusCode};

use super::errors::RouterError;
use super::types::{JsonRpcResponse, RpcCall};

// ─── Constants ───────────────────────────────────────────────────────────────

/// TCP connection timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound for a reachability probe, regardless of the call timeout.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Longest response body quoted back in an error message.
const ERROR_BODY_MAX: usize = 500;

// ─── HttpForwarder ───────────────────────────────────────────────────────────

/// Shared HTTP client for forwarding calls and probing reachability.
#[derive(Debug, Clone)]
pub struct HttpForwarder {
    http: HttpClient,
    timeout: Duration,
}

impl HttpForwarder {
    pub fn new(timeout: Duration) -> Result<Self, RouterError> {
        let http = HttpClient::builder()
            .connect_timeout(CONNECT_TIMEOUT.min(timeout))
            .timeout(timeout)
            .build()
            .map_err(|e| RouterError::ConfigInvalid {
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self { http, timeout })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// POST `call` to `base_url` + `path`.
    ///
    /// Returns `None` when the backend accepted the message without a body
    /// (notifications). JSON-RPC error bodies come back as `Ok`; deciding
    /// what they mean is the dispatcher's job.
    pub async fn forward(
        &self,
        server: &str,
        base_url: &str,
        path: &str,
        call: &RpcCall,
    ) -> Result<Option<JsonRpcResponse>, RouterError> {
        let url = join_url(base_url, path);
        tracing::debug!(server, %url, method = %call.method, "forwarding over http");

        let exchange = async {
            let response = self
                .http
                .post(&url)
                .header(reqwest::header::ACCEPT, "application/json, text/event-stream")
                .json(call)
                .send()
                .await
                .map_err(|e| self.request_error(server, e))?;

            let status = response.status();
            let is_event_stream = response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .is_some_and(|v| v.starts_with("text/event-stream"));
            let body = response
                .text()
                .await
                .map_err(|e| self.request_error(server, e))?;

            Ok::<_, RouterError>((status, is_event_stream, body))
        };

        let (status, is_event_stream, body) = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| self.timeout_error(server))??;

        if !status.is_success() {
            return Err(RouterError::TransportError {
                server: server.to_string(),
                reason: format!("HTTP {status}: {}", truncate(&body)),
            });
        }

        if status == StatusCode::ACCEPTED || body.trim().is_empty() {
            return Ok(None);
        }

        let payload = if is_event_stream {
            first_event_data(&body).ok_or_else(|| RouterError::TransportError {
                server: server.to_string(),
                reason: "event stream carried no data".into(),
            })?
        } else {
            body
        };

        serde_json::from_str(&payload)
            .map(Some)
            .map_err(|e| RouterError::TransportError {
                server: server.to_string(),
                reason: format!("invalid JSON-RPC response: {e}"),
            })
    }

    /// Lightweight reachability check: any HTTP answer counts as reachable.
    pub async fn probe(&self, server: &str, base_url: &str) -> Result<(), RouterError> {
        let limit = self.timeout.min(PROBE_TIMEOUT);
        let response = tokio::time::timeout(limit, self.http.get(base_url).timeout(limit).send())
            .await
            .map_err(|_| RouterError::Timeout {
                server: server.to_string(),
                timeout_ms: limit.as_millis() as u64,
            })?;

        match response {
            Ok(resp) => {
                tracing::debug!(server, status = %resp.status(), "http backend reachable");
                Ok(())
            }
            Err(e) => Err(self.request_error(server, e)),
        }
    }

    fn request_error(&self, server: &str, e: reqwest::Error) -> RouterError {
        if e.is_timeout() {
            self.timeout_error(server)
        } else {
            RouterError::TransportError {
                server: server.to_string(),
                reason: e.to_string(),
            }
        }
    }

    fn timeout_error(&self, server: &str) -> RouterError {
        RouterError::Timeout {
            server: server.to_string(),
            timeout_ms: self.timeout.as_millis() as u64,
        }
    }
}

/// Append `path` to `base` with exactly one slash between them.
fn join_url(base: &str, path: &str) -> String {
    let path = path.trim_start_matches('/');
    if path.is_empty() {
        base.to_string()
    } else {
        format!("{}/{path}", base.trim_end_matches('/'))
    }
}

/// The `data:` payload of the first event in an SSE body.
fn first_event_data(body: &str) -> Option<String> {
    let mut data = Vec::new();
    for line in body.lines() {
        if let Some(rest) = line.strip_prefix("data:") {
            data.push(rest.strip_prefix(' ').unwrap_or(rest));
        } else if line.is_empty() && !data.is_empty() {
            break;
        }
    }
    (!data.is_empty()).then(|| data.join("\n"))
}

fn truncate(body: &str) -> &str {
    if body.len() <= ERROR_BODY_MAX {
        return body;
    }
    let mut cut = ERROR_BODY_MAX;
    while !body.is_char_boundary(cut) {
        cut -= 1;
    }
    &body[..cut]
}

// ─── Tests ───────────────────────────────────────────────────────────────────
