//! Fixtures shared by the router's unit tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use super::credentials::EnvCredentialResolver;
use super::http_forward::HttpForwarder;
use super::registry::ServerRegistry;
use super::supervisor::{Supervisor, SupervisorSettings};
use super::types::{ServerDescriptor, TransportSpec};

/// Answers every request line with `{"echo":true}` under the same id.
pub(crate) const ECHO_SCRIPT: &str = r#"while IFS= read -r line; do
  id=$(printf '%s\n' "$line" | sed -n 's/.*"id":\([0-9][0-9]*\).*/\1/p')
  [ -n "$id" ] && printf '{"jsonrpc":"2.0","id":%s,"result":{"echo":true}}\n' "$id"
done"#;

/// Answers every request line with a JSON-RPC error under the same id.
pub(crate) const ERROR_SCRIPT: &str = r#"while IFS= read -r line; do
  id=$(printf '%s\n' "$line" | sed -n 's/.*"id":\([0-9][0-9]*\).*/\1/p')
  [ -n "$id" ] && printf '{"jsonrpc":"2.0","id":%s,"error":{"code":-32000,"message":"boom"}}\n' "$id"
done"#;

/// Reads requests forever and never answers.
pub(crate) const SILENT_SCRIPT: &str = "while IFS= read -r line; do :; done";

/// Exits right away.
pub(crate) const EXIT_SCRIPT: &str = "exit 1";

pub(crate) fn stdio_server(name: &str, script: &str) -> ServerDescriptor {
    ServerDescriptor {
        name: name.into(),
        transport: TransportSpec::Stdio {
            command: "sh".into(),
            args: vec!["-c".into(), script.into()],
            env: HashMap::new(),
            credentials: HashMap::new(),
            cwd: None,
        },
        auto_start: false,
        restart_on_failure: true,
        max_restarts: 3,
        health_check_interval: Duration::from_secs(30),
        description: None,
    }
}

pub(crate) fn http_server(name: &str, url: &str) -> ServerDescriptor {
    ServerDescriptor {
        name: name.into(),
        transport: TransportSpec::Http { url: url.into() },
        auto_start: false,
        restart_on_failure: true,
        max_restarts: 3,
        health_check_interval: Duration::from_secs(30),
        description: None,
    }
}

pub(crate) fn supervisor_for(registry: &Arc<ServerRegistry>) -> Arc<Supervisor> {
    Arc::new(Supervisor::new(
        Arc::clone(registry),
        Arc::new(EnvCredentialResolver),
        HttpForwarder::new(Duration::from_secs(2)).unwrap(),
        SupervisorSettings {
            call_timeout: Duration::from_secs(5),
            shutdown_grace: Duration::from_millis(500),
        },
    ))
}

/// Poll `condition` until it holds, panicking after five seconds.
pub(crate) async fn wait_for(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
