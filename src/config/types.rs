//! Configuration file shapes.
//!
//! These mirror the YAML file exactly. Only the `router:` block is checked
//! here (`RouterSettings::validate`); turning a `RawServerConfig` into a
//! usable descriptor is the registry's job (`ServerDescriptor::from_raw`).

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

use crate::router::breaker::BreakerConfig;
use crate::router::errors::RouterError;

/// One entry of the `servers:` list.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawServerConfig {
    #[serde(default)]
    pub name: Option<String>,
    /// `stdio` or `http`; inferred from `command` / `url` when absent.
    #[serde(default)]
    pub transport: Option<String>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Option<Vec<String>>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Environment variable name → secret reference.
    #[serde(default)]
    pub credentials: HashMap<String, String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub auto_start: Option<bool>,
    #[serde(default)]
    pub restart_on_failure: Option<bool>,
    #[serde(default)]
    pub max_restarts: Option<u32>,
    #[serde(default)]
    pub health_check_interval_secs: Option<u64>,
    #[serde(default)]
    pub description: Option<String>,
}

/// The `router:` block.
#[derive(Debug, Clone, Deserialize)]
pub struct RouterSettings {
    /// Bound on every stdio `send()`.
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    /// Bound on every HTTP forward and reachability probe.
    #[serde(default = "default_http_timeout_ms")]
    pub http_timeout_ms: u64,
    /// Wait after the terminate signal before force-killing.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
    /// Consecutive failures that open a server's breaker.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Time an open breaker waits before letting one probe through.
    #[serde(default = "default_recovery_timeout_ms")]
    pub recovery_timeout_ms: u64,
    /// Write logs here instead of stderr.
    #[serde(default)]
    pub log_file: Option<String>,
}

fn default_call_timeout_ms() -> u64 {
    30_000
}
fn default_http_timeout_ms() -> u64 {
    30_000
}
fn default_shutdown_grace_ms() -> u64 {
    5_000
}
fn default_failure_threshold() -> u32 {
    5
}
fn default_recovery_timeout_ms() -> u64 {
    30_000
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            call_timeout_ms: default_call_timeout_ms(),
            http_timeout_ms: default_http_timeout_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            failure_threshold: default_failure_threshold(),
            recovery_timeout_ms: default_recovery_timeout_ms(),
            log_file: None,
        }
    }
}

impl RouterSettings {
    /// Reject settings that would make every call fail or keep a breaker
    /// flapping. A zero `shutdown_grace_ms` is allowed and means kill at once.
    pub fn validate(&self) -> Result<(), RouterError> {
        let durations = [
            ("call_timeout_ms", self.call_timeout_ms),
            ("http_timeout_ms", self.http_timeout_ms),
            ("recovery_timeout_ms", self.recovery_timeout_ms),
        ];
        for (field, value) in durations {
            if value == 0 {
                return Err(RouterError::ConfigInvalid {
                    reason: format!("router.{field} must be greater than zero"),
                });
            }
        }
        Ok(())
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn breaker(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.failure_threshold,
            recovery_timeout: Duration::from_millis(self.recovery_timeout_ms),
        }
    }
}

/// Top-level configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RouterConfig {
    #[serde(default)]
    pub router: RouterSettings,
    #[serde(default)]
    pub servers: Vec<RawServerConfig>,
}
