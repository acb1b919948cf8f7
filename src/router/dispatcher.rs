//! Proxy dispatcher.
//!
//! Entry point for every inbound call:
//!
//! ```text
//! registry lookup → auto-start? → breaker.allow() → forward → record outcome
//! ```
//!
//! The dispatcher never retries and never turns a backend error into a
//! success. It also never waits on a server's lifecycle guard unless it is
//! auto-starting that server itself.

use std::sync::Arc;

use super::breaker::{BreakerRegistry, CircuitBreaker};
use super::errors::RouterError;
use super::http_forward::HttpForwarder;
use super::registry::{ServerEntry, ServerRegistry};
use super::supervisor::Supervisor;
use super::transport::extract_result;
use super::types::{JsonRpcResponse, RpcCall, ServerDescriptor, ServerStatus, TransportSpec};

pub struct ProxyDispatcher {
    registry: Arc<ServerRegistry>,
    supervisor: Arc<Supervisor>,
    breakers: Arc<BreakerRegistry>,
    http: HttpForwarder,
}

impl ProxyDispatcher {
    pub fn new(
        registry: Arc<ServerRegistry>,
        supervisor: Arc<Supervisor>,
        breakers: Arc<BreakerRegistry>,
        http: HttpForwarder,
    ) -> Self {
        Self {
            registry,
            supervisor,
            breakers,
            http,
        }
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    /// Route one call to server `name`.
    ///
    /// `path` is appended to an HTTP backend's base URL and ignored for stdio
    /// backends. Returns `Ok(None)` for notifications. A successful response
    /// always carries the caller's own id.
    pub async fn dispatch(
        &self,
        name: &str,
        path: &str,
        call: RpcCall,
    ) -> Result<Option<JsonRpcResponse>, RouterError> {
        let entry = self.registry.entry(name)?;
        let descriptor = entry.descriptor();
        self.ensure_running(&entry, &descriptor).await?;

        let breaker = self.breakers.get(name);
        if !breaker.allow() {
            tracing::debug!(server = name, method = %call.method, "rejected by open circuit");
            return Err(RouterError::CircuitOpen {
                name: name.to_string(),
            });
        }

        // Settles the breaker even if this future is dropped mid-call.
        let mut outcome = OutcomeGuard::new(breaker);

        let result = match &descriptor.transport {
            TransportSpec::Stdio { .. } => self.forward_stdio(&entry, name, &call).await,
            TransportSpec::Http { url } => self.forward_http(name, url, path, &call).await,
        };

        match &result {
            Ok(_) => outcome.success(),
            Err(e) => {
                outcome.failure();
                tracing::debug!(server = name, method = %call.method, error = %e, "call failed");
            }
        }
        result
    }

    /// Make sure the server is RUNNING, auto-starting a STOPPED one if allowed.
    ///
    /// FAILED and transitional servers are unavailable; auto-start never
    /// revives a server that exhausted its restarts.
    async fn ensure_running(
        &self,
        entry: &ServerEntry,
        descriptor: &ServerDescriptor,
    ) -> Result<(), RouterError> {
        let name = descriptor.name.as_str();
        match entry.status() {
            ServerStatus::Running => Ok(()),
            ServerStatus::Stopped if descriptor.auto_start => {
                tracing::info!(server = name, "auto-starting server for call");
                match self.supervisor.start(name).await {
                    Ok(_) => Ok(()),
                    Err(e @ (RouterError::StartFailed { .. } | RouterError::NotFound { .. })) => {
                        Err(e)
                    }
                    Err(e) => Err(RouterError::StartFailed {
                        name: name.to_string(),
                        reason: e.to_string(),
                    }),
                }
            }
            status => Err(RouterError::ServerUnavailable {
                name: name.to_string(),
                status: status.to_string(),
            }),
        }
    }

    async fn forward_stdio(
        &self,
        entry: &ServerEntry,
        name: &str,
        call: &RpcCall,
    ) -> Result<Option<JsonRpcResponse>, RouterError> {
        let bridge = {
            let rt = entry.runtime();
            match rt.process.as_ref() {
                Some(process) => process.bridge(),
                None => {
                    return Err(RouterError::ServerUnavailable {
                        name: name.to_string(),
                        status: rt.status.to_string(),
                    })
                }
            }
        };

        match &call.id {
            None => {
                bridge.notify(&call.method, call.params.clone()).await?;
                Ok(None)
            }
            Some(id) => {
                let result = bridge.send(&call.method, call.params.clone()).await?;
                Ok(Some(JsonRpcResponse::success(id.clone(), result)))
            }
        }
    }

    async fn forward_http(
        &self,
        name: &str,
        url: &str,
        path: &str,
        call: &RpcCall,
    ) -> Result<Option<JsonRpcResponse>, RouterError> {
        let response = self.http.forward(name, url, path, call).await?;

        let Some(id) = &call.id else {
            return Ok(None);
        };
        let response = response.ok_or_else(|| RouterError::TransportError {
            server: name.to_string(),
            reason: "backend sent no response to a request".into(),
        })?;

        let result = extract_result(response)?;
        Ok(Some(JsonRpcResponse::success(id.clone(), result)))
    }
}

/// Records a breaker outcome exactly once; a dropped call counts as a failure.
struct OutcomeGuard {
    breaker: Arc<CircuitBreaker>,
    settled: bool,
}

impl OutcomeGuard {
    fn new(breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            breaker,
            settled: false,
        }
    }

    fn success(&mut self) {
        self.settled = true;
        self.breaker.record_success();
    }

    fn failure(&mut self) {
        self.settled = true;
        self.breaker.record_failure();
    }
}

impl Drop for OutcomeGuard {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.record_failure();
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(all(test, unix))]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::router::breaker::{BreakerConfig, BreakerState};
    use crate::router::http_forward::tests::{serve, serve_counting, Canned};
    use crate::router::testing::{
        http_server, stdio_server, supervisor_for, wait_for, ECHO_SCRIPT, ERROR_SCRIPT,
        SILENT_SCRIPT,
    };
    use crate::router::types::TransportSpec;

    struct Harness {
        registry: Arc<ServerRegistry>,
        supervisor: Arc<Supervisor>,
        dispatcher: Arc<ProxyDispatcher>,
    }

    fn harness(servers: Vec<ServerDescriptor>, breaker: BreakerConfig) -> Harness {
        let registry = Arc::new(ServerRegistry::new());
        for server in servers {
            registry.add(server).unwrap();
        }
        let supervisor = supervisor_for(&registry);
        let dispatcher = Arc::new(ProxyDispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&supervisor),
            Arc::new(BreakerRegistry::new(breaker)),
            HttpForwarder::new(Duration::from_secs(2)).unwrap(),
        ));
        Harness {
            registry,
            supervisor,
            dispatcher,
        }
    }

    fn breaker(threshold: u32, recovery: Duration) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: threshold,
            recovery_timeout: recovery,
        }
    }

    #[tokio::test]
    async fn test_unknown_server() {
        let h = harness(vec![], BreakerConfig::default());
        let err = h
            .dispatcher
            .dispatch("ghost", "/", RpcCall::request(1, "ping", None))
            .await
            .unwrap_err();
        assert!(matches!(err, RouterError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_stopped_server_without_auto_start_is_unavailable() {
        let h = harness(vec![stdio_server("echo", ECHO_SCRIPT)], BreakerConfig::default());
        let err = h
            .dispatcher
            .dispatch("echo", "/", RpcCall::request(1, "ping", None))
            .await
            .unwrap_err();
        assert!(matches!(err, RouterError::ServerUnavailable { .. }));
        assert_eq!(h.registry.get("echo").unwrap().runtime.status, ServerStatus::Stopped);
        assert!(h.dispatcher.breakers().snapshot("echo").is_none());
    }

    #[tokio::test]
    async fn test_auto_start_and_caller_id_restored() {
        let mut server = stdio_server("echo", ECHO_SCRIPT);
        server.auto_start = true;
        let h = harness(vec![server], BreakerConfig::default());

        let response = h
            .dispatcher
            .dispatch("echo", "/", RpcCall::request("caller-7", "tools/list", None))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response.id, json!("caller-7"));
        assert_eq!(response.result, Some(json!({"echo": true})));
        assert_eq!(h.registry.get("echo").unwrap().runtime.status, ServerStatus::Running);

        h.supervisor.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_auto_start_failure_is_start_failed() {
        let mut server = stdio_server("broken", ECHO_SCRIPT);
        server.auto_start = true;
        if let TransportSpec::Stdio { command, .. } = &mut server.transport {
            *command = "/no/such/binary".into();
        }
        let h = harness(vec![server], BreakerConfig::default());

        let err = h
            .dispatcher
            .dispatch("broken", "/", RpcCall::request(1, "ping", None))
            .await
            .unwrap_err();
        assert!(matches!(err, RouterError::StartFailed { .. }));

        // FAILED is unavailable; auto-start does not retry it.
        let err = h
            .dispatcher
            .dispatch("broken", "/", RpcCall::request(2, "ping", None))
            .await
            .unwrap_err();
        assert!(matches!(err, RouterError::ServerUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_backend_error_propagates_and_counts_as_failure() {
        let h = harness(vec![stdio_server("bad", ERROR_SCRIPT)], BreakerConfig::default());
        h.supervisor.start("bad").await.unwrap();

        let err = h
            .dispatcher
            .dispatch("bad", "/", RpcCall::request(1, "tools/call", None))
            .await
            .unwrap_err();
        match err {
            RouterError::Backend { code, message, .. } => {
                assert_eq!(code, -32000);
                assert_eq!(message, "boom");
            }
            other => panic!("expected backend error, got {other:?}"),
        }
        assert_eq!(
            h.dispatcher.breakers().snapshot("bad").unwrap().consecutive_failures,
            1
        );
        h.supervisor.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_breaker_opens_without_touching_transport() {
        let (url, hits) = serve_counting(Canned {
            status: "500 Internal Server Error",
            content_type: "text/plain",
            body: "kaput".into(),
            delay: Duration::ZERO,
        })
        .await;
        let h = harness(
            vec![http_server("web", &url)],
            breaker(3, Duration::from_secs(60)),
        );
        h.supervisor.start("web").await.unwrap();
        let after_probe = hits.load(std::sync::atomic::Ordering::SeqCst);

        for id in 0..3 {
            let err = h
                .dispatcher
                .dispatch("web", "/mcp", RpcCall::request(id, "tools/call", None))
                .await
                .unwrap_err();
            assert!(matches!(err, RouterError::TransportError { .. }));
        }
        assert_eq!(hits.load(std::sync::atomic::Ordering::SeqCst), after_probe + 3);
        assert_eq!(h.dispatcher.breakers().get("web").state(), BreakerState::Open);

        let err = h
            .dispatcher
            .dispatch("web", "/mcp", RpcCall::request(4, "tools/call", None))
            .await
            .unwrap_err();
        assert!(matches!(err, RouterError::CircuitOpen { .. }));
        assert_eq!(hits.load(std::sync::atomic::Ordering::SeqCst), after_probe + 3);
    }

    #[tokio::test]
    async fn test_half_open_probe_closes_circuit() {
        let h = harness(
            vec![stdio_server("echo", ECHO_SCRIPT)],
            breaker(1, Duration::from_millis(200)),
        );
        h.supervisor.start("echo").await.unwrap();

        h.dispatcher.breakers().get("echo").record_failure();
        let err = h
            .dispatcher
            .dispatch("echo", "/", RpcCall::request(1, "ping", None))
            .await
            .unwrap_err();
        assert!(matches!(err, RouterError::CircuitOpen { .. }));

        tokio::time::sleep(Duration::from_millis(250)).await;
        let response = h
            .dispatcher
            .dispatch("echo", "/", RpcCall::request(2, "ping", None))
            .await
            .unwrap();
        assert!(response.is_some());
        assert_eq!(h.dispatcher.breakers().get("echo").state(), BreakerState::Closed);

        h.supervisor.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_http_response_gets_caller_id() {
        let url = serve(Canned::json(
            json!({"jsonrpc": "2.0", "id": 99, "result": {"tools": []}}),
        ))
        .await;
        let h = harness(vec![http_server("web", &url)], BreakerConfig::default());
        h.supervisor.start("web").await.unwrap();

        let response = h
            .dispatcher
            .dispatch("web", "/mcp", RpcCall::request("req-1", "tools/list", None))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response.id, json!("req-1"));
        assert_eq!(response.result, Some(json!({"tools": []})));
        assert_eq!(
            h.dispatcher.breakers().snapshot("web").unwrap().state,
            BreakerState::Closed
        );
    }

    #[tokio::test]
    async fn test_notification_returns_nothing() {
        let h = harness(vec![stdio_server("echo", ECHO_SCRIPT)], BreakerConfig::default());
        h.supervisor.start("echo").await.unwrap();

        let call = RpcCall {
            id: None,
            ..RpcCall::request(0, "notifications/initialized", None)
        };
        assert!(h.dispatcher.dispatch("echo", "/", call).await.unwrap().is_none());
        h.supervisor.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_abandoned_call_counts_as_failure() {
        let h = harness(vec![stdio_server("silent", SILENT_SCRIPT)], BreakerConfig::default());
        h.supervisor.start("silent").await.unwrap();
        let bridge = h
            .registry
            .entry("silent")
            .unwrap()
            .runtime()
            .process
            .as_ref()
            .unwrap()
            .bridge();

        let dispatcher = Arc::clone(&h.dispatcher);
        let call = tokio::spawn(async move {
            dispatcher
                .dispatch("silent", "/", RpcCall::request(1, "work", None))
                .await
        });
        wait_for(|| bridge.pending_count() == 1).await;

        call.abort();
        let _ = call.await;
        assert_eq!(bridge.pending_count(), 0);
        assert_eq!(
            h.dispatcher.breakers().snapshot("silent").unwrap().consecutive_failures,
            1
        );
        h.supervisor.shutdown_all().await;
    }
}
