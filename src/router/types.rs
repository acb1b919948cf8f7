//! Shared types for the router core.
//!
//! JSON-RPC 2.0 envelopes, server descriptors and runtime snapshots.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ─── JSON-RPC 2.0 ───────────────────────────────────────────────────────────

/// JSON-RPC 2.0 request as written to a backend's stdin.
///
/// The id is always allocated by the bridge, never taken from the caller.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcRequest {
    /// Create a new JSON-RPC request.
    pub fn new(id: u64, method: &str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 notification (a request without an id).
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcNotification {
    pub fn new(method: &str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 response message (success or error).
///
/// `id` is kept as a raw value: backends occasionally answer with ids we did
/// not issue, and those must be discarded rather than fail parsing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default = "default_jsonrpc")]
    pub jsonrpc: String,
    #[serde(default)]
    pub id: serde_json::Value,
    /// `Some(Value::Null)` for an explicit `"result": null`; `None` only when
    /// the member is absent.
    #[serde(
        default,
        deserialize_with = "present_value",
        skip_serializing_if = "Option::is_none"
    )]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
    /// Present when the backend sent us a request or notification instead.
    #[serde(default, skip_serializing)]
    pub method: Option<String>,
}

fn default_jsonrpc() -> String {
    "2.0".to_string()
}

fn present_value<'de, D>(deserializer: D) -> Result<Option<serde_json::Value>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    serde_json::Value::deserialize(deserializer).map(Some)
}

impl JsonRpcResponse {
    /// A success response carrying `result`.
    pub fn success(id: serde_json::Value, result: serde_json::Value) -> Self {
        Self {
            jsonrpc: default_jsonrpc(),
            id,
            result: Some(result),
            error: None,
            method: None,
        }
    }

    /// An error response carrying `error`.
    pub fn failure(id: serde_json::Value, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: default_jsonrpc(),
            id,
            result: None,
            error: Some(error),
            method: None,
        }
    }

    /// The numeric id, if the backend sent one we could have issued.
    pub fn numeric_id(&self) -> Option<u64> {
        self.id.as_u64()
    }
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// An inbound call as received by the front door.
///
/// `id` is the caller's own id (any JSON value); `None` marks a notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcCall {
    #[serde(default = "default_jsonrpc")]
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<serde_json::Value>,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl RpcCall {
    /// Build a request with the given caller id.
    pub fn request(
        id: impl Into<serde_json::Value>,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Self {
        Self {
            jsonrpc: default_jsonrpc(),
            id: Some(id.into()),
            method: method.to_string(),
            params,
        }
    }

    /// Whether the caller expects no response.
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

// ─── Server Descriptors ──────────────────────────────────────────────────────

/// How the router reaches a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Stdio,
    Http,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Stdio => f.write_str("stdio"),
            TransportKind::Http => f.write_str("http"),
        }
    }
}

/// Transport-specific launch or connection settings.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "transport", rename_all = "lowercase")]
pub enum TransportSpec {
    Stdio {
        command: String,
        args: Vec<String>,
        /// Literal environment variables.
        env: HashMap<String, String>,
        /// Environment variable → secret reference, resolved just before spawn.
        credentials: HashMap<String, String>,
        cwd: Option<String>,
    },
    Http {
        url: String,
    },
}

/// A validated, configured backend server.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerDescriptor {
    pub name: String,
    #[serde(flatten)]
    pub transport: TransportSpec,
    pub auto_start: bool,
    pub restart_on_failure: bool,
    pub max_restarts: u32,
    #[serde(with = "duration_secs")]
    pub health_check_interval: Duration,
    pub description: Option<String>,
}

impl ServerDescriptor {
    pub fn transport_kind(&self) -> TransportKind {
        match self.transport {
            TransportSpec::Stdio { .. } => TransportKind::Stdio,
            TransportSpec::Http { .. } => TransportKind::Http,
        }
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }
}

// ─── Runtime State ───────────────────────────────────────────────────────────

/// Lifecycle status of a server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerStatus {
    #[default]
    Stopped,
    Starting,
    Running,
    Failed,
    Stopping,
}

impl ServerStatus {
    /// Whether a start or stop is currently in progress.
    pub fn is_transitional(self) -> bool {
        matches!(self, ServerStatus::Starting | ServerStatus::Stopping)
    }
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServerStatus::Stopped => "stopped",
            ServerStatus::Starting => "starting",
            ServerStatus::Running => "running",
            ServerStatus::Failed => "failed",
            ServerStatus::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

/// Read-only copy of a server's runtime state.
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeSnapshot {
    pub status: ServerStatus,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub restart_count: u32,
    pub last_error: Option<String>,
}

/// One row of `list_servers()`.
#[derive(Debug, Clone, Serialize)]
pub struct ServerSummary {
    pub name: String,
    pub transport: TransportKind,
    pub status: ServerStatus,
    pub auto_start: bool,
    pub restart_count: u32,
}

// ─── Standard MCP Error Codes ────────────────────────────────────────────────

/// Well-known JSON-RPC codes plus the router's own range.
pub mod error_codes {
    /// Invalid JSON was received.
    pub const PARSE_ERROR: i32 = -32700;
    /// The JSON sent is not a valid Request object.
    pub const INVALID_REQUEST: i32 = -32600;
    /// The method does not exist or is not available.
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i32 = -32603;

    pub const SERVER_NOT_FOUND: i32 = -32001;
    pub const SERVER_UNAVAILABLE: i32 = -32002;
    pub const CIRCUIT_OPEN: i32 = -32003;
    pub const START_FAILED: i32 = -32004;
    pub const TIMEOUT: i32 = -32005;
    pub const PROCESS_TERMINATED: i32 = -32006;
    pub const TRANSPORT_ERROR: i32 = -32007;
    pub const CONFIG_INVALID: i32 = -32008;
    pub const INVALID_STATE: i32 = -32009;
}

// ─── Tests ───────────────────────────────────────────────────────────────────
