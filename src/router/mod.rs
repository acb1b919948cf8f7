//! Router core: one front door for many MCP backends.
//!
//! This module handles:
//! - The server registry (configured backends and their runtime state)
//! - Process supervision for stdio backends (spawn, stop, health checks)
//! - JSON-RPC 2.0 correlation over process stdio
//! - Per-server circuit breaking
//! - Call dispatch to stdio and HTTP backends

pub mod breaker;
pub mod client;
pub mod credentials;
pub mod dispatcher;
pub mod errors;
pub mod http_forward;
pub mod lifecycle;
pub mod registry;
pub mod supervisor;
pub mod transport;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports for convenience
pub use breaker::{BreakerConfig, BreakerRegistry, BreakerSnapshot, BreakerState, CircuitBreaker};
pub use client::{McpRouter, ServerDetails};
pub use credentials::{CredentialResolver, EnvCredentialResolver};
pub use dispatcher::ProxyDispatcher;
pub use errors::{ErrorClass, RouterError};
pub use registry::{ReloadReport, ServerInfo, ServerRegistry};
pub use supervisor::{HealthOutcome, Supervisor, SupervisorSettings};
pub use types::{
    JsonRpcError, JsonRpcResponse, RpcCall, RuntimeSnapshot, ServerDescriptor, ServerStatus,
    ServerSummary, TransportKind, TransportSpec,
};
