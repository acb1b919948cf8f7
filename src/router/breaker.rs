//! Per-server circuit breaker.
//!
//! ```text
//! CLOSED    --failure_threshold consecutive failures-->  OPEN
//! OPEN      --first allow() after recovery_timeout---->  HALF_OPEN (one probe)
//! HALF_OPEN --probe succeeds-------------------------->  CLOSED
//! HALF_OPEN --probe fails----------------------------->  OPEN (window restarts)
//! ```
//!
//! Breakers only see call outcomes. Process liveness is the supervisor's
//! business, so a RUNNING server can sit behind an OPEN breaker.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

/// Breaker thresholds, shared by every server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// How long the circuit stays open before one probe is allowed.
    pub recovery_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Read-only view of a breaker, for status endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub consecutive_failures: u32,
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

/// Circuit breaker for a single server.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: &str, config: BreakerConfig) -> Self {
        Self {
            name: name.to_string(),
            config,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    /// Whether a call may go through right now.
    ///
    /// In OPEN this is also where the move to HALF_OPEN happens: the first
    /// caller after the recovery window becomes the probe.
    pub fn allow(&self) -> bool {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    false
                } else {
                    inner.probe_in_flight = true;
                    true
                }
            }
            BreakerState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or(Duration::MAX);
                if elapsed < self.config.recovery_timeout {
                    return false;
                }
                inner.state = BreakerState::HalfOpen;
                inner.probe_in_flight = true;
                tracing::info!(server = %self.name, "circuit half-open, letting one probe through");
                true
            }
        }
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => inner.consecutive_failures = 0,
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Closed;
                inner.consecutive_failures = 0;
                inner.opened_at = None;
                inner.probe_in_flight = false;
                tracing::info!(server = %self.name, "circuit closed after successful probe");
            }
            // A straggler admitted before the circuit opened; the probe decides.
            BreakerState::Open => {}
        }
    }

    /// Record a failed call.
    pub fn record_failure(&self) {
        let mut inner = self.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        match inner.state {
            BreakerState::Closed => {
                if inner.consecutive_failures >= self.config.failure_threshold.max(1) {
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(Instant::now());
                    tracing::warn!(
                        server = %self.name,
                        failures = inner.consecutive_failures,
                        "circuit opened"
                    );
                }
            }
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
                inner.probe_in_flight = false;
                tracing::warn!(server = %self.name, "probe failed, circuit re-opened");
            }
            BreakerState::Open => {}
        }
    }

    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.lock();
        BreakerSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ─── BreakerRegistry ─────────────────────────────────────────────────────────

/// Lazily created breakers, one per server name, living as long as the router.
#[derive(Debug, Default)]
pub struct BreakerRegistry {
    config: BreakerConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// The breaker for `name`, created CLOSED on first use.
    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            breakers
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(name, self.config))),
        )
    }

    /// Snapshot of an existing breaker; `None` if no call was ever made.
    pub fn snapshot(&self, name: &str) -> Option<BreakerSnapshot> {
        self.breakers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .map(|breaker| breaker.snapshot())
    }

    pub fn config(&self) -> BreakerConfig {
        self.config
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, recovery_secs: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            BreakerConfig {
                failure_threshold: threshold,
                recovery_timeout: Duration::from_secs(recovery_secs),
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold_failures() {
        let b = breaker(3, 30);
        b.record_failure();
        b.record_failure();
        assert!(b.allow());
        assert_eq!(b.state(), BreakerState::Closed);

        b.record_failure();
        assert_eq!(b.state(), BreakerState::Open);
        assert!(!b.allow());
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_counter() {
        let b = breaker(3, 30);
        b.record_failure();
        b.record_failure();
        b.record_success();
        b.record_failure();
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Closed);
        assert_eq!(b.snapshot().consecutive_failures, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_window_then_single_probe() {
        let b = breaker(1, 30);
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Open);

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(!b.allow());
        assert_eq!(b.state(), BreakerState::Open);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(b.allow());
        assert_eq!(b.state(), BreakerState::HalfOpen);
        // Concurrent callers are rejected while the probe is in flight.
        assert!(!b.allow());
        assert!(!b.allow());
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_success_closes() {
        let b = breaker(2, 10);
        b.record_failure();
        b.record_failure();
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(b.allow());

        b.record_success();
        assert_eq!(b.state(), BreakerState::Closed);
        assert_eq!(b.snapshot().consecutive_failures, 0);
        assert!(b.allow());
        assert!(b.allow());
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_failure_reopens_with_fresh_window() {
        let b = breaker(1, 10);
        b.record_failure();
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(b.allow());

        b.record_failure();
        assert_eq!(b.state(), BreakerState::Open);
        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(!b.allow());
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(b.allow());
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_success_does_not_close_open_circuit() {
        let b = breaker(1, 10);
        b.record_failure();
        b.record_success();
        assert_eq!(b.state(), BreakerState::Open);
    }

    #[tokio::test]
    async fn test_registry_isolates_servers() {
        let registry = BreakerRegistry::new(BreakerConfig {
            failure_threshold: 1,
            recovery_timeout: Duration::from_secs(60),
        });
        assert!(registry.snapshot("a").is_none());

        registry.get("a").record_failure();
        assert_eq!(registry.get("a").state(), BreakerState::Open);
        assert_eq!(registry.get("b").state(), BreakerState::Closed);
        assert!(registry.get("b").allow());
        assert!(Arc::ptr_eq(&registry.get("a"), &registry.get("a")));
    }
}
