//! Router error types.
//!
//! Every failure the core can produce is one `RouterError` variant. Variants
//! carry the server name so the caller can log or render them without extra
//! context, and `class()` tells the caller whether retrying makes sense.

use thiserror::Error;

use super::types::{error_codes, JsonRpcError};

/// Errors that can occur while managing or dispatching to backend servers.
#[derive(Debug, Clone, Error)]
pub enum RouterError {
    /// Raw configuration could not be turned into a server descriptor.
    #[error("invalid configuration: {reason}")]
    ConfigInvalid {
        reason: String,
    },

    /// A server with this name is already registered.
    #[error("server '{name}' is already registered")]
    DuplicateName {
        name: String,
    },

    /// No server with this name is registered.
    #[error("unknown server: '{name}'")]
    NotFound {
        name: String,
    },

    /// The operation is not allowed in the server's current state.
    #[error("server '{name}' is {status}: {reason}")]
    InvalidState {
        name: String,
        status: String,
        reason: String,
    },

    /// Spawning, credential resolution, or the reachability probe failed.
    #[error("failed to start server '{name}': {reason}")]
    StartFailed {
        name: String,
        reason: String,
    },

    /// The server is not running and will not be started for this call.
    #[error("server '{name}' is unavailable ({status})")]
    ServerUnavailable {
        name: String,
        status: String,
    },

    /// The circuit breaker rejected the call without touching the transport.
    #[error("circuit open for server '{name}'")]
    CircuitOpen {
        name: String,
    },

    /// The backend did not answer within the bounded wait.
    #[error("call to server '{server}' timed out after {timeout_ms}ms")]
    Timeout {
        server: String,
        timeout_ms: u64,
    },

    /// The backend process exited (or was stopped) while the call was pending.
    #[error("server '{server}' process terminated")]
    ProcessTerminated {
        server: String,
    },

    /// I/O or protocol failure talking to the backend.
    #[error("transport error for server '{server}': {reason}")]
    TransportError {
        server: String,
        reason: String,
    },

    /// The backend answered with a JSON-RPC error object.
    #[error("server error [{code}]: {message}")]
    Backend {
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },
}

/// How a caller should react to a [`RouterError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Transient: the same call may succeed later (circuit open, timeout, restart window).
    RetryLater,
    /// Needs operator action (bad config, binary missing, credentials).
    BrokenUntilFixed,
    /// The named server does not exist.
    DoesNotExist,
    /// The backend itself rejected the call; retrying will not change the answer.
    Backend,
}

impl RouterError {
    /// Classify this error for caller-side retry decisions.
    pub fn class(&self) -> ErrorClass {
        match self {
            RouterError::CircuitOpen { .. }
            | RouterError::Timeout { .. }
            | RouterError::ServerUnavailable { .. }
            | RouterError::ProcessTerminated { .. }
            | RouterError::TransportError { .. } => ErrorClass::RetryLater,
            RouterError::ConfigInvalid { .. }
            | RouterError::StartFailed { .. }
            | RouterError::DuplicateName { .. }
            | RouterError::InvalidState { .. } => ErrorClass::BrokenUntilFixed,
            RouterError::NotFound { .. } => ErrorClass::DoesNotExist,
            RouterError::Backend { .. } => ErrorClass::Backend,
        }
    }

    /// Whether the caller may reasonably retry the same call later.
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::RetryLater
    }

    /// Render this error as a JSON-RPC error object for the front door.
    ///
    /// Backend errors keep the backend's own code, message and data.
    pub fn to_rpc_error(&self) -> JsonRpcError {
        if let RouterError::Backend {
            code,
            message,
            data,
        } = self
        {
            return JsonRpcError {
                code: *code,
                message: message.clone(),
                data: data.clone(),
            };
        }

        let code = match self {
            RouterError::NotFound { .. } => error_codes::SERVER_NOT_FOUND,
            RouterError::ServerUnavailable { .. } => error_codes::SERVER_UNAVAILABLE,
            RouterError::CircuitOpen { .. } => error_codes::CIRCUIT_OPEN,
            RouterError::StartFailed { .. } => error_codes::START_FAILED,
            RouterError::Timeout { .. } => error_codes::TIMEOUT,
            RouterError::ProcessTerminated { .. } => error_codes::PROCESS_TERMINATED,
            RouterError::TransportError { .. } => error_codes::TRANSPORT_ERROR,
            RouterError::ConfigInvalid { .. } => error_codes::CONFIG_INVALID,
            RouterError::DuplicateName { .. } | RouterError::InvalidState { .. } => {
                error_codes::INVALID_STATE
            }
            RouterError::Backend { .. } => error_codes::INTERNAL_ERROR,
        };

        JsonRpcError {
            code,
            message: self.to_string(),
            data: Some(serde_json::json!({
                "retryable": self.is_retryable(),
            })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let open = RouterError::CircuitOpen { name: "echo".into() };
        assert_eq!(open.class(), ErrorClass::RetryLater);
        assert!(open.is_retryable());

        let start = RouterError::StartFailed {
            name: "echo".into(),
            reason: "No such file or directory".into(),
        };
        assert_eq!(start.class(), ErrorClass::BrokenUntilFixed);
        assert!(!start.is_retryable());

        let missing = RouterError::NotFound { name: "nope".into() };
        assert_eq!(missing.class(), ErrorClass::DoesNotExist);
    }

    #[test]
    fn test_backend_error_keeps_its_code() {
        let err = RouterError::Backend {
            code: -32601,
            message: "Method not found".into(),
            data: None,
        };
        let rpc = err.to_rpc_error();
        assert_eq!(rpc.code, -32601);
        assert_eq!(rpc.message, "Method not found");
        assert!(rpc.data.is_none());
    }

    #[test]
    fn test_router_error_maps_to_router_code() {
        let err = RouterError::Timeout {
            server: "slow".into(),
            timeout_ms: 2000,
        };
        let rpc = err.to_rpc_error();
        assert_eq!(rpc.code, error_codes::TIMEOUT);
        assert!(rpc.message.contains("2000ms"));
        assert_eq!(rpc.data.unwrap()["retryable"], true);
    }
}
