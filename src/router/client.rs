//! MCP Router: high-level interface over the router core.
//!
//! Owns the registry, supervisor, breakers and dispatcher, and exposes the
//! operations the front door and the operator surface need. Every method
//! takes `&self`; per-server exclusion lives further down.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;

use super::breaker::{BreakerRegistry, BreakerSnapshot};
use super::credentials::{CredentialResolver, EnvCredentialResolver};
use super::dispatcher::ProxyDispatcher;
use super::errors::RouterError;
use super::http_forward::HttpForwarder;
use super::registry::{ReloadReport, ServerRegistry};
use super::supervisor::{Supervisor, SupervisorSettings};
use super::types::{
    JsonRpcResponse, RpcCall, RuntimeSnapshot, ServerDescriptor, ServerSummary,
};
use crate::config::{RouterConfig, RouterSettings};

/// Full view of one server for status endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct ServerDetails {
    pub descriptor: ServerDescriptor,
    pub runtime: RuntimeSnapshot,
    /// `None` until the first call reaches the breaker.
    pub breaker: Option<BreakerSnapshot>,
}

// ─── McpRouter ───────────────────────────────────────────────────────────────

pub struct McpRouter {
    registry: Arc<ServerRegistry>,
    supervisor: Arc<Supervisor>,
    dispatcher: ProxyDispatcher,
    health_checks: AtomicBool,
}

impl McpRouter {
    /// Build a router around an existing registry.
    pub fn new(
        registry: Arc<ServerRegistry>,
        credentials: Arc<dyn CredentialResolver>,
        settings: &RouterSettings,
    ) -> Result<Self, RouterError> {
        let http = HttpForwarder::new(settings.http_timeout())?;
        let supervisor = Arc::new(Supervisor::new(
            Arc::clone(&registry),
            credentials,
            http.clone(),
            SupervisorSettings {
                call_timeout: settings.call_timeout(),
                shutdown_grace: settings.shutdown_grace(),
            },
        ));
        let dispatcher = ProxyDispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&supervisor),
            Arc::new(BreakerRegistry::new(settings.breaker())),
            http,
        );

        Ok(Self {
            registry,
            supervisor,
            dispatcher,
            health_checks: AtomicBool::new(false),
        })
    }

    /// Build a router from a loaded configuration file, resolving credentials
    /// from the environment.
    pub fn from_config(config: RouterConfig) -> Result<Self, RouterError> {
        let registry = Arc::new(ServerRegistry::from_raw(config.servers)?);
        Self::new(registry, Arc::new(EnvCredentialResolver), &config.router)
    }

    pub fn registry(&self) -> &Arc<ServerRegistry> {
        &self.registry
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    // ─── Registry ────────────────────────────────────────────────────────

    pub fn list_servers(&self) -> Vec<ServerSummary> {
        self.registry.list()
    }

    pub fn get_server(&self, name: &str) -> Result<ServerDetails, RouterError> {
        let info = self.registry.get(name)?;
        Ok(ServerDetails {
            descriptor: info.descriptor,
            runtime: info.runtime,
            breaker: self.dispatcher.breakers().snapshot(name),
        })
    }

    /// Register a server; it gets a health check if health checks are on.
    pub fn add_server(&self, descriptor: ServerDescriptor) -> Result<(), RouterError> {
        let name = descriptor.name.clone();
        self.registry.add(descriptor)?;
        if self.health_checks.load(Ordering::Acquire) {
            self.supervisor.spawn_health_check(&name);
        }
        Ok(())
    }

    pub fn update_server(&self, name: &str, descriptor: ServerDescriptor) -> Result<(), RouterError> {
        self.registry.update(name, descriptor)
    }

    /// Unregister a stopped server.
    pub async fn remove_server(&self, name: &str) -> Result<ServerDescriptor, RouterError> {
        let descriptor = self.registry.remove(name).await?;
        self.supervisor.stop_health_check(name);
        Ok(descriptor)
    }

    /// Apply a freshly loaded server set.
    ///
    /// Servers absent from the new set are stopped and removed; the report
    /// still lists them under `missing`. Adds and updates are already applied
    /// when teardown starts, so a server that cannot be stopped or removed
    /// lands in `failed` and the rest of the reload goes on (partial reload
    /// is OK).
    pub async fn reload(&self, descriptors: Vec<ServerDescriptor>) -> Result<ReloadReport, RouterError> {
        let mut report = self.registry.reload(descriptors)?;

        if self.health_checks.load(Ordering::Acquire) {
            for name in &report.added {
                self.supervisor.spawn_health_check(name);
            }
        }
        report.failed = self.retire(&report.missing).await;
        Ok(report)
    }

    /// Stop and unregister each named server, collecting failures.
    async fn retire(&self, names: &[String]) -> Vec<(String, String)> {
        let mut failures = Vec::new();
        for name in names {
            let result = match self.supervisor.stop(name).await {
                Ok(_) => self.remove_server(name).await.map(|_| ()),
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                tracing::warn!(server = %name, error = %e, "failed to retire server on reload");
                failures.push((name.clone(), e.to_string()));
            }
        }
        failures
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    pub async fn start_server(&self, name: &str) -> Result<RuntimeSnapshot, RouterError> {
        self.supervisor.start(name).await
    }

    pub async fn stop_server(&self, name: &str) -> Result<RuntimeSnapshot, RouterError> {
        self.supervisor.stop(name).await
    }

    pub async fn restart_server(&self, name: &str) -> Result<RuntimeSnapshot, RouterError> {
        self.supervisor.restart(name).await
    }

    /// Start every `auto_start` server.
    ///
    /// Returns a list of servers that failed to start (partial startup is OK).
    pub async fn start_all(&self) -> Vec<(String, RouterError)> {
        let failures = self.supervisor.start_all().await;
        for (name, e) in &failures {
            tracing::warn!(server = %name, error = %e, "auto-start failed");
        }
        failures
    }

    /// Run a health-check loop for every registered server, and for servers
    /// added later.
    pub fn start_health_checks(&self) {
        self.health_checks.store(true, Ordering::Release);
        self.supervisor.start_health_checks();
    }

    /// Stop health checks and every server.
    pub async fn shutdown_all(&self) {
        self.health_checks.store(false, Ordering::Release);
        self.supervisor.shutdown_all().await;
    }

    // ─── Dispatch ────────────────────────────────────────────────────────

    /// Route one inbound call. See [`ProxyDispatcher::dispatch`].
    pub async fn dispatch(
        &self,
        name: &str,
        path: &str,
        call: RpcCall,
    ) -> Result<Option<JsonRpcResponse>, RouterError> {
        self.dispatcher.dispatch(name, path, call).await
    }

    /// Like `dispatch`, but always produces a JSON-RPC envelope for requests:
    /// router failures become error responses under the caller's id.
    pub async fn handle(&self, name: &str, path: &str, call: RpcCall) -> Option<JsonRpcResponse> {
        let id = call.id.clone();
        match self.dispatch(name, path, call).await {
            Ok(response) => response,
            Err(e) => id.map(|id| JsonRpcResponse::failure(id, e.to_rpc_error())),
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(all(test, unix))]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::config::parse_config;
    use crate::router::testing::{stdio_server, ECHO_SCRIPT};
    use crate::router::types::{error_codes, ServerStatus};

    fn router(yaml: &str) -> McpRouter {
        McpRouter::from_config(parse_config(yaml).unwrap()).unwrap()
    }

    /// Three servers: `echo` (auto-start), `broken` (auto-start, missing
    /// binary) and `idle` (manual).
    fn config() -> String {
        let script: String = ECHO_SCRIPT
            .lines()
            .map(|line| format!("        {line}\n"))
            .collect();
        format!(
            r#"
router:
  shutdown_grace_ms: 500
servers:
  - name: echo
    command: sh
    args:
      - -c
      - |
{script}    auto_start: true
  - name: broken
    command: /no/such/binary
    args: []
    auto_start: true
  - name: idle
    command: sh
    args: ["-c", "sleep 60"]
"#
        )
    }

    #[tokio::test]
    async fn test_from_config_lists_in_order() {
        let router = router(&config());
        let names: Vec<_> = router.list_servers().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["echo", "broken", "idle"]);
        assert!(matches!(
            router.get_server("nope"),
            Err(RouterError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_start_all_reports_partial_failures() {
        let router = router(&config());
        let failures = router.start_all().await;
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, "broken");

        assert_eq!(router.get_server("echo").unwrap().runtime.status, ServerStatus::Running);
        assert_eq!(router.get_server("broken").unwrap().runtime.status, ServerStatus::Failed);
        assert_eq!(router.get_server("idle").unwrap().runtime.status, ServerStatus::Stopped);

        router.shutdown_all().await;
        for summary in router.list_servers() {
            assert_ne!(summary.status, ServerStatus::Running);
        }
    }

    #[tokio::test]
    async fn test_get_server_includes_breaker_after_first_call() {
        let router = router(&config());
        assert!(router.get_server("echo").unwrap().breaker.is_none());

        let response = router
            .dispatch("echo", "/", RpcCall::request(3, "ping", None))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response.result, Some(json!({"echo": true})));

        let details = router.get_server("echo").unwrap();
        assert_eq!(details.breaker.unwrap().consecutive_failures, 0);
        router.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_handle_renders_router_errors() {
        let router = router(&config());
        let response = router
            .handle("idle", "/", RpcCall::request("abc", "ping", None))
            .await
            .unwrap();
        assert_eq!(response.id, json!("abc"));
        let error = response.error.unwrap();
        assert_eq!(error.code, error_codes::SERVER_UNAVAILABLE);
        assert_eq!(error.data, Some(json!({"retryable": true})));
    }

    #[tokio::test]
    async fn test_reload_stops_and_removes_missing_servers() {
        let router = router(&config());
        router.start_server("idle").await.unwrap();

        let report = router
            .reload(vec![
                stdio_server("echo", ECHO_SCRIPT),
                stdio_server("fresh", ECHO_SCRIPT),
            ])
            .await
            .unwrap();
        assert_eq!(report.added, vec!["fresh"]);
        assert_eq!(report.updated, vec!["echo"]);
        assert_eq!(report.missing, vec!["broken", "idle"]);
        assert!(report.failed.is_empty());

        let names: Vec<_> = router.list_servers().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["echo", "fresh"]);
    }

    #[tokio::test]
    async fn test_retire_continues_past_failures() {
        let router = router(&config());
        router.start_server("idle").await.unwrap();

        let names = vec!["gone".to_string(), "idle".to_string(), "broken".to_string()];
        let failures = router.retire(&names).await;
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, "gone");
        assert!(failures[0].1.contains("gone"));

        let names: Vec<_> = router.list_servers().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["echo"]);
    }

    #[tokio::test]
    async fn test_add_and_remove_server() {
        let router = router("servers: []");
        router.start_health_checks();
        router.add_server(stdio_server("echo", ECHO_SCRIPT)).unwrap();
        assert_eq!(router.supervisor().health_check_count(), 1);

        router.start_server("echo").await.unwrap();
        assert!(matches!(
            router.remove_server("echo").await,
            Err(RouterError::InvalidState { .. })
        ));

        router.stop_server("echo").await.unwrap();
        router.remove_server("echo").await.unwrap();
        assert!(router.list_servers().is_empty());
        assert_eq!(router.supervisor().health_check_count(), 0);
    }
}
