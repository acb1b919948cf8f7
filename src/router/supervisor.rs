//! Process supervisor.
//!
//! Owns start / stop / restart for every server and runs one health-check
//! task per server. Operations on the same server are serialized by that
//! server's lifecycle guard; nothing here takes a lock shared between
//! servers for longer than a map lookup, and the dispatch path never waits
//! on a lifecycle guard.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;

use super::credentials::CredentialResolver;
use super::errors::RouterError;
use super::http_forward::HttpForwarder;
use super::lifecycle::{self, format_stderr_suffix, ManagedProcess, SpawnRequest};
use super::registry::{ServerEntry, ServerRegistry};
use super::types::{RuntimeSnapshot, ServerDescriptor, ServerStatus, TransportSpec};

/// Timing knobs for the supervisor.
#[derive(Debug, Clone, Copy)]
pub struct SupervisorSettings {
    /// Default bound for calls sent through a spawned process's bridge.
    pub call_timeout: Duration,
    /// Wait after the terminate signal before force-killing.
    pub shutdown_grace: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

/// What a single health check did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthOutcome {
    /// The server is alive.
    Healthy,
    /// Nothing to check (stopped, settled in FAILED, or mid-transition).
    Skipped,
    /// The server was dead and has been restarted.
    Restarted,
    /// The server was dead and the restart attempt failed; retried next tick.
    RestartFailed,
    /// The server was dead and has no restart budget left; settled in FAILED.
    GaveUp,
}

pub struct Supervisor {
    registry: Arc<ServerRegistry>,
    credentials: Arc<dyn CredentialResolver>,
    http: HttpForwarder,
    settings: SupervisorSettings,
    health_tasks: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl Supervisor {
    pub fn new(
        registry: Arc<ServerRegistry>,
        credentials: Arc<dyn CredentialResolver>,
        http: HttpForwarder,
        settings: SupervisorSettings,
    ) -> Self {
        Self {
            registry,
            credentials,
            http,
            settings,
            health_tasks: Mutex::new(HashMap::new()),
        }
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Start a server. A no-op if it is already running.
    ///
    /// An explicit start also resets the restart counter, which is how an
    /// operator revives a server that exhausted its restarts.
    pub async fn start(&self, name: &str) -> Result<RuntimeSnapshot, RouterError> {
        let entry = self.registry.entry(name)?;
        let _guard = entry.lock_lifecycle().await;
        ensure_registered(&entry, name)?;
        self.start_locked(&entry, name, true).await
    }

    /// Stop a server. A no-op if it is already stopped.
    pub async fn stop(&self, name: &str) -> Result<RuntimeSnapshot, RouterError> {
        let entry = self.registry.entry(name)?;
        let _guard = entry.lock_lifecycle().await;
        ensure_registered(&entry, name)?;
        self.stop_locked(&entry, name).await;
        Ok(entry.snapshot())
    }

    /// Stop then start a server, counting one restart.
    pub async fn restart(&self, name: &str) -> Result<RuntimeSnapshot, RouterError> {
        let entry = self.registry.entry(name)?;
        let _guard = entry.lock_lifecycle().await;
        ensure_registered(&entry, name)?;
        self.restart_locked(&entry, name).await
    }

    /// Start every `auto_start` server concurrently.
    ///
    /// Returns the servers that failed to start (partial startup is OK).
    pub async fn start_all(&self) -> Vec<(String, RouterError)> {
        let names: Vec<String> = self
            .registry
            .entries()
            .into_iter()
            .map(|entry| entry.descriptor())
            .filter(|descriptor| descriptor.auto_start)
            .map(|descriptor| descriptor.name)
            .collect();

        let results = futures::future::join_all(names.iter().map(|name| self.start(name))).await;

        names
            .into_iter()
            .zip(results)
            .filter_map(|(name, result)| result.err().map(|e| (name, e)))
            .collect()
    }

    /// Stop health checks and every server.
    pub async fn shutdown_all(&self) {
        self.stop_health_checks();
        let names = self.registry.names();
        futures::future::join_all(names.iter().map(|name| self.stop(name))).await;
        tracing::info!(servers = names.len(), "all servers stopped");
    }

    async fn start_locked(
        &self,
        entry: &ServerEntry,
        name: &str,
        reset_restarts: bool,
    ) -> Result<RuntimeSnapshot, RouterError> {
        let stale = {
            let mut rt = entry.runtime();
            let alive = rt.process.as_ref().map_or(true, |p| p.is_alive());
            if rt.status == ServerStatus::Running && alive {
                None
            } else {
                rt.status = ServerStatus::Starting;
                rt.awaiting_restart = false;
                if reset_restarts {
                    rt.restart_count = 0;
                }
                Some(rt.process.take())
            }
        };

        let Some(stale) = stale else {
            tracing::debug!(server = name, "start requested but already running");
            return Ok(entry.snapshot());
        };
        if let Some(process) = stale {
            process.shutdown(self.settings.shutdown_grace).await;
        }

        let descriptor = entry.descriptor();
        tracing::info!(server = name, transport = %descriptor.transport_kind(), "starting server");

        match self.launch(&descriptor).await {
            Ok(process) => {
                let mut rt = entry.runtime();
                rt.status = ServerStatus::Running;
                rt.process = process;
                rt.started_at = Some(Utc::now());
                rt.last_error = None;
                tracing::info!(server = name, restarts = rt.restart_count, "server running");
            }
            Err(e) => {
                let mut rt = entry.runtime();
                rt.status = ServerStatus::Failed;
                rt.started_at = None;
                rt.last_error = Some(e.to_string());
                tracing::warn!(server = name, error = %e, "server failed to start");
                return Err(e);
            }
        }

        Ok(entry.snapshot())
    }

    async fn stop_locked(&self, entry: &ServerEntry, name: &str) {
        let process = {
            let mut rt = entry.runtime();
            rt.awaiting_restart = false;
            if rt.status == ServerStatus::Stopped {
                return;
            }
            rt.status = ServerStatus::Stopping;
            rt.process.take()
        };

        tracing::info!(server = name, "stopping server");
        if let Some(process) = process {
            process.shutdown(self.settings.shutdown_grace).await;
        }

        let mut rt = entry.runtime();
        rt.status = ServerStatus::Stopped;
        rt.started_at = None;
    }

    async fn restart_locked(
        &self,
        entry: &ServerEntry,
        name: &str,
    ) -> Result<RuntimeSnapshot, RouterError> {
        self.stop_locked(entry, name).await;
        {
            let mut rt = entry.runtime();
            rt.restart_count = rt.restart_count.saturating_add(1);
        }
        self.start_locked(entry, name, false).await
    }

    /// Bring a backend up: spawn a stdio process or probe an HTTP endpoint.
    async fn launch(
        &self,
        descriptor: &ServerDescriptor,
    ) -> Result<Option<Arc<ManagedProcess>>, RouterError> {
        let name = descriptor.name.as_str();
        match &descriptor.transport {
            TransportSpec::Http { url } => {
                self.http
                    .probe(name, url)
                    .await
                    .map_err(|e| RouterError::StartFailed {
                        name: name.to_string(),
                        reason: format!("{url} is unreachable: {e}"),
                    })?;
                Ok(None)
            }
            TransportSpec::Stdio {
                command,
                args,
                env,
                credentials,
                cwd,
            } => {
                let mut env = env.clone();
                if !credentials.is_empty() {
                    let resolved = self
                        .credentials
                        .resolve(name, credentials)
                        .await
                        .map_err(|reason| RouterError::StartFailed {
                            name: name.to_string(),
                            reason: format!("credential resolution failed: {reason}"),
                        })?;
                    env.extend(resolved);
                }

                let process = lifecycle::spawn_process(
                    name,
                    SpawnRequest {
                        command,
                        args,
                        env: &env,
                        cwd: cwd.as_deref(),
                        call_timeout: self.settings.call_timeout,
                    },
                )?;
                Ok(Some(Arc::new(process)))
            }
        }
    }

    // ─── Health Checks ───────────────────────────────────────────────────

    /// Run one health check for `name`.
    ///
    /// Probes a RUNNING server (process liveness for stdio, reachability for
    /// HTTP). A dead server is restarted while it has budget, otherwise it
    /// settles in FAILED and later checks skip it until an explicit start.
    pub async fn check_health(&self, name: &str) -> Result<HealthOutcome, RouterError> {
        let entry = self.registry.entry(name)?;
        let descriptor = entry.descriptor();

        let (status, process, awaiting_restart) = {
            let rt = entry.runtime();
            (rt.status, rt.process.clone(), rt.awaiting_restart)
        };

        let alive = match status {
            ServerStatus::Running => match &descriptor.transport {
                TransportSpec::Stdio { .. } => process.as_ref().is_some_and(|p| p.is_alive()),
                TransportSpec::Http { url } => self.http.probe(name, url).await.is_ok(),
            },
            ServerStatus::Failed if awaiting_restart => false,
            _ => return Ok(HealthOutcome::Skipped),
        };
        if alive {
            return Ok(HealthOutcome::Healthy);
        }

        let _guard = entry.lock_lifecycle().await;

        // Someone else may have started or stopped the server meanwhile.
        let (restart_count, unchanged) = {
            let rt = entry.runtime();
            let same_process = match (&rt.process, &process) {
                (Some(now), Some(seen)) => Arc::ptr_eq(now, seen),
                (None, None) => true,
                _ => false,
            };
            (
                rt.restart_count,
                rt.status == status && rt.awaiting_restart == awaiting_restart && same_process,
            )
        };
        if !unchanged || entry.is_removed() {
            return Ok(HealthOutcome::Skipped);
        }

        let detail = process
            .as_ref()
            .map(|p| format_stderr_suffix(&p.stderr_tail()))
            .unwrap_or_default();
        tracing::warn!(server = name, restart_count, "health check failed{detail}");

        if !descriptor.restart_on_failure || restart_count >= descriptor.max_restarts {
            let process = {
                let mut rt = entry.runtime();
                rt.status = ServerStatus::Failed;
                rt.awaiting_restart = false;
                rt.started_at = None;
                rt.last_error = Some(format!(
                    "server died after {restart_count} restarts{detail}"
                ));
                rt.process.take()
            };
            if let Some(process) = process {
                process.shutdown(self.settings.shutdown_grace).await;
            }
            tracing::error!(server = name, restart_count, "server failed, giving up on restarts");
            return Ok(HealthOutcome::GaveUp);
        }

        match self.restart_locked(&entry, name).await {
            Ok(_) => Ok(HealthOutcome::Restarted),
            Err(_) => {
                entry.runtime().awaiting_restart = true;
                Ok(HealthOutcome::RestartFailed)
            }
        }
    }

    /// Start (or replace) the periodic health-check task for `name`.
    pub fn spawn_health_check(self: &Arc<Self>, name: &str) {
        let weak = Arc::downgrade(self);
        let task = tokio::spawn(health_loop(weak, name.to_string()));

        let previous = self
            .health_tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), task);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Start health-check tasks for every registered server.
    pub fn start_health_checks(self: &Arc<Self>) {
        for name in self.registry.names() {
            self.spawn_health_check(&name);
        }
    }

    /// Abort the health-check task for one server.
    pub fn stop_health_check(&self, name: &str) {
        if let Some(task) = self
            .health_tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
        {
            task.abort();
        }
    }

    /// Abort every health-check task.
    pub fn stop_health_checks(&self) {
        let tasks: Vec<_> = self
            .health_tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        for (_, task) in tasks {
            task.abort();
        }
    }

    /// Number of running health-check tasks.
    pub fn health_check_count(&self) -> usize {
        self.health_tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|task| !task.is_finished())
            .count()
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.stop_health_checks();
    }
}

fn ensure_registered(entry: &ServerEntry, name: &str) -> Result<(), RouterError> {
    if entry.is_removed() {
        return Err(RouterError::NotFound {
            name: name.to_string(),
        });
    }
    Ok(())
}

/// Periodic health check for one server. Ends when the server is removed
/// or the supervisor is dropped; individual failures never end it.
async fn health_loop(supervisor: Weak<Supervisor>, name: String) {
    loop {
        let interval = {
            let Some(supervisor) = supervisor.upgrade() else {
                return;
            };
            match supervisor.registry.entry(&name) {
                Ok(entry) => entry.descriptor().health_check_interval,
                Err(_) => return,
            }
        };

        tokio::time::sleep(interval).await;

        let Some(supervisor) = supervisor.upgrade() else {
            return;
        };
        match supervisor.check_health(&name).await {
            Ok(HealthOutcome::Healthy | HealthOutcome::Skipped) => {}
            Ok(outcome) => tracing::info!(server = %name, ?outcome, "health check acted"),
            Err(RouterError::NotFound { .. }) => return,
            Err(e) => tracing::warn!(server = %name, error = %e, "health check error"),
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
