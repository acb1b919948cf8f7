//! Server registry, the source of truth for configured backends.
//!
//! Provides:
//! - Validation of raw configuration into `ServerDescriptor`s
//! - Insertion-ordered add / get / list / update / remove / reload
//! - Per-server runtime state, each behind its own locks
//!
//! The name → entry map sits behind one short-lived lock that is never held
//! across an await. Everything about a single server (runtime state, the
//! lifecycle guard) lives in its `ServerEntry`, so work on one server never
//! blocks another.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::RawServerConfig;

use super::errors::RouterError;
use super::lifecycle::ManagedProcess;
use super::types::{
    RuntimeSnapshot, ServerDescriptor, ServerStatus, ServerSummary, TransportSpec,
};

// ─── Defaults ────────────────────────────────────────────────────────────────

const DEFAULT_MAX_RESTARTS: u32 = 3;
const DEFAULT_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);

// ─── Descriptor Construction ─────────────────────────────────────────────────

impl ServerDescriptor {
    /// Validate a raw configuration entry.
    ///
    /// Missing fields for the selected transport are rejected here so that
    /// they never surface at request time.
    pub fn from_raw(raw: RawServerConfig) -> Result<Self, RouterError> {
        let name = raw
            .name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .ok_or_else(|| RouterError::ConfigInvalid {
                reason: "server entry is missing 'name'".into(),
            })?
            .to_string();

        let invalid = |reason: String| RouterError::ConfigInvalid {
            reason: format!("server '{name}': {reason}"),
        };

        let kind = match raw.transport.as_deref().map(str::to_ascii_lowercase) {
            Some(kind) if kind == "stdio" || kind == "http" => kind,
            Some(other) => return Err(invalid(format!("unknown transport '{other}'"))),
            None if raw.command.is_some() => "stdio".to_string(),
            None if raw.url.is_some() => "http".to_string(),
            None => return Err(invalid("needs either 'command' or 'url'".into())),
        };

        let transport = if kind == "stdio" {
            let command = raw
                .command
                .filter(|c| !c.trim().is_empty())
                .ok_or_else(|| invalid("stdio transport requires 'command'".into()))?;
            let args = raw
                .args
                .ok_or_else(|| invalid("stdio transport requires 'args'".into()))?;
            TransportSpec::Stdio {
                command,
                args,
                env: raw.env,
                credentials: raw.credentials,
                cwd: raw.cwd,
            }
        } else {
            let url = raw
                .url
                .ok_or_else(|| invalid("http transport requires 'url'".into()))?;
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(invalid(format!("url '{url}' is not an http(s) URL")));
            }
            TransportSpec::Http {
                url: url.trim_end_matches('/').to_string(),
            }
        };

        let health_check_interval = match raw.health_check_interval_secs {
            Some(0) => return Err(invalid("health_check_interval_secs must be positive".into())),
            Some(secs) => Duration::from_secs(secs),
            None => DEFAULT_HEALTH_CHECK_INTERVAL,
        };

        Ok(Self {
            name,
            transport,
            auto_start: raw.auto_start.unwrap_or(false),
            restart_on_failure: raw.restart_on_failure.unwrap_or(true),
            max_restarts: raw.max_restarts.unwrap_or(DEFAULT_MAX_RESTARTS),
            health_check_interval,
            description: raw.description,
        })
    }
}

// ─── Runtime State ───────────────────────────────────────────────────────────

/// Mutable per-server runtime record.
///
/// Only the supervisor writes to it; everyone else reads snapshots.
#[derive(Default)]
pub(crate) struct ProcessRuntimeState {
    pub status: ServerStatus,
    pub process: Option<Arc<ManagedProcess>>,
    pub started_at: Option<DateTime<Utc>>,
    pub restart_count: u32,
    pub last_error: Option<String>,
    /// Set by the health check when it found the server dead and still has
    /// restart budget; cleared by any explicit start or stop.
    pub awaiting_restart: bool,
}

impl ProcessRuntimeState {
    fn snapshot(&self) -> RuntimeSnapshot {
        RuntimeSnapshot {
            status: self.status,
            pid: self.process.as_ref().and_then(|p| p.pid()),
            started_at: self.started_at,
            restart_count: self.restart_count,
            last_error: self.last_error.clone(),
        }
    }
}

/// A registered server: its descriptor plus runtime state.
pub struct ServerEntry {
    descriptor: RwLock<ServerDescriptor>,
    runtime: Mutex<ProcessRuntimeState>,
    /// Serializes start / stop / restart for this server only.
    lifecycle: tokio::sync::Mutex<()>,
    removed: AtomicBool,
}

impl ServerEntry {
    fn new(descriptor: ServerDescriptor) -> Self {
        Self {
            descriptor: RwLock::new(descriptor),
            runtime: Mutex::new(ProcessRuntimeState::default()),
            lifecycle: tokio::sync::Mutex::new(()),
            removed: AtomicBool::new(false),
        }
    }

    /// A copy of the current descriptor.
    pub fn descriptor(&self) -> ServerDescriptor {
        self.descriptor
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn snapshot(&self) -> RuntimeSnapshot {
        self.runtime().snapshot()
    }

    pub fn status(&self) -> ServerStatus {
        self.runtime().status
    }

    pub(crate) fn runtime(&self) -> MutexGuard<'_, ProcessRuntimeState> {
        self.runtime.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) async fn lock_lifecycle(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.lifecycle.lock().await
    }

    pub(crate) fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }

    fn set_descriptor(&self, descriptor: ServerDescriptor) {
        *self
            .descriptor
            .write()
            .unwrap_or_else(PoisonError::into_inner) = descriptor;
    }
}

/// Descriptor plus runtime state, as returned by `get()`.
#[derive(Debug, Clone, Serialize)]
pub struct ServerInfo {
    pub descriptor: ServerDescriptor,
    pub runtime: RuntimeSnapshot,
}

/// Outcome of `reload()`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReloadReport {
    pub added: Vec<String>,
    pub updated: Vec<String>,
    /// Registered servers absent from the new set. Left in place; the caller
    /// decides whether to stop and remove them.
    pub missing: Vec<String>,
    /// Missing servers that could not be stopped or removed, with the reason.
    /// Never filled by the registry itself.
    pub failed: Vec<(String, String)>,
}

// ─── ServerRegistry ──────────────────────────────────────────────────────────

#[derive(Default)]
struct RegistryInner {
    order: Vec<String>,
    entries: HashMap<String, Arc<ServerEntry>>,
}

/// All configured servers, in insertion order.
#[derive(Default)]
pub struct ServerRegistry {
    inner: RwLock<RegistryInner>,
}

impl ServerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from raw configuration entries.
    pub fn from_raw(raw: Vec<RawServerConfig>) -> Result<Self, RouterError> {
        let registry = Self::new();
        for entry in raw {
            registry.add(ServerDescriptor::from_raw(entry)?)?;
        }
        Ok(registry)
    }

    /// Register a new server.
    pub fn add(&self, descriptor: ServerDescriptor) -> Result<(), RouterError> {
        let mut inner = self.write();
        if inner.entries.contains_key(&descriptor.name) {
            return Err(RouterError::DuplicateName {
                name: descriptor.name,
            });
        }

        let name = descriptor.name.clone();
        tracing::info!(server = %name, transport = %descriptor.transport_kind(), "registered server");
        inner.order.push(name.clone());
        inner.entries.insert(name, Arc::new(ServerEntry::new(descriptor)));
        Ok(())
    }

    /// Descriptor and runtime state for one server.
    pub fn get(&self, name: &str) -> Result<ServerInfo, RouterError> {
        let entry = self.entry(name)?;
        Ok(ServerInfo {
            descriptor: entry.descriptor(),
            runtime: entry.snapshot(),
        })
    }

    /// Summaries of every server, in insertion order.
    pub fn list(&self) -> Vec<ServerSummary> {
        self.entries()
            .into_iter()
            .map(|entry| {
                let descriptor = entry.descriptor();
                let runtime = entry.snapshot();
                ServerSummary {
                    transport: descriptor.transport_kind(),
                    name: descriptor.name,
                    status: runtime.status,
                    auto_start: descriptor.auto_start,
                    restart_count: runtime.restart_count,
                }
            })
            .collect()
    }

    /// Registered server names, in insertion order.
    pub fn names(&self) -> Vec<String> {
        self.read().order.clone()
    }

    /// Replace a server's configuration. Takes effect on its next (re)start.
    pub fn update(&self, name: &str, descriptor: ServerDescriptor) -> Result<(), RouterError> {
        if descriptor.name != name {
            return Err(RouterError::ConfigInvalid {
                reason: format!(
                    "cannot rename server '{name}' to '{}' via update",
                    descriptor.name
                ),
            });
        }
        self.entry(name)?.set_descriptor(descriptor);
        tracing::info!(server = name, "updated server configuration");
        Ok(())
    }

    /// Unregister a stopped server.
    ///
    /// Takes the server's lifecycle guard so a concurrent start cannot slip in
    /// between the status check and the removal.
    pub async fn remove(&self, name: &str) -> Result<ServerDescriptor, RouterError> {
        let entry = self.entry(name)?;
        let _guard = entry.lock_lifecycle().await;

        let status = entry.status();
        if status != ServerStatus::Stopped {
            return Err(RouterError::InvalidState {
                name: name.to_string(),
                status: status.to_string(),
                reason: "stop the server before removing it".into(),
            });
        }

        let mut inner = self.write();
        inner.order.retain(|n| n != name);
        inner.entries.remove(name);
        entry.removed.store(true, Ordering::Release);
        tracing::info!(server = name, "removed server");
        Ok(entry.descriptor())
    }

    /// Apply a freshly loaded descriptor set.
    ///
    /// New names are added, existing ones updated. The whole set is checked
    /// for duplicate names before anything changes.
    pub fn reload(&self, descriptors: Vec<ServerDescriptor>) -> Result<ReloadReport, RouterError> {
        let mut seen = HashSet::new();
        for descriptor in &descriptors {
            if !seen.insert(descriptor.name.clone()) {
                return Err(RouterError::DuplicateName {
                    name: descriptor.name.clone(),
                });
            }
        }

        let mut report = ReloadReport::default();
        for descriptor in descriptors {
            let name = descriptor.name.clone();
            match self.entry(&name) {
                Ok(entry) => {
                    if entry.descriptor() != descriptor {
                        entry.set_descriptor(descriptor);
                        report.updated.push(name);
                    }
                }
                Err(_) => {
                    self.add(descriptor)?;
                    report.added.push(name);
                }
            }
        }

        report.missing = self
            .names()
            .into_iter()
            .filter(|name| !seen.contains(name))
            .collect();

        tracing::info!(
            added = report.added.len(),
            updated = report.updated.len(),
            missing = report.missing.len(),
            "reloaded server configuration"
        );
        Ok(report)
    }

    /// Number of registered servers.
    pub fn len(&self) -> usize {
        self.read().order.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The live entry for a server.
    pub(crate) fn entry(&self, name: &str) -> Result<Arc<ServerEntry>, RouterError> {
        self.read()
            .entries
            .get(name)
            .cloned()
            .ok_or_else(|| RouterError::NotFound {
                name: name.to_string(),
            })
    }

    /// All live entries, in insertion order.
    pub(crate) fn entries(&self) -> Vec<Arc<ServerEntry>> {
        let inner = self.read();
        inner
            .order
            .iter()
            .filter_map(|name| inner.entries.get(name).cloned())
            .collect()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, RegistryInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, RegistryInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
