//! Bridge health monitoring.
//!
//! This module provides:
//! - [`BridgeHealth`] for tracking overall bridge health metrics
//! - [`ControllerLiveness`] for tracking per-controller availability

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Consecutive failures after which a controller is reported offline.
pub const OFFLINE_AFTER_FAILURES: u32 = 3;

/// Bridge health metrics.
///
/// Tracks controller availability, error counts and poll timing. Shared
/// between pollers behind an `Arc`; all methods take `&self`.
#[derive(Debug)]
pub struct BridgeHealth {
    /// Bridge name.
    bridge_name: String,
    /// Start time for uptime calculation.
    start_time: Instant,
    /// Total controllers configured.
    controllers_total: AtomicU64,
    /// Total values pushed to the hub.
    values_published: AtomicU64,
    /// Total failed reads and writes since start.
    errors_total: AtomicU64,
    /// Last poll cycle duration in milliseconds.
    last_poll_duration_ms: AtomicU64,
    /// Per-controller liveness tracking.
    controllers: RwLock<HashMap<String, ControllerState>>,
}

#[derive(Debug, Clone)]
struct ControllerState {
    status: ControllerStatus,
    /// Last successful contact (millis since epoch).
    last_seen: i64,
    consecutive_failures: u32,
    last_error: Option<String>,
}

impl Default for ControllerState {
    fn default() -> Self {
        Self {
            status: ControllerStatus::Unknown,
            last_seen: 0,
            consecutive_failures: 0,
            last_error: None,
        }
    }
}

/// Controller availability status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControllerStatus {
    /// Controller is responding normally.
    Online,
    /// Controller is not responding.
    Offline,
    /// Controller answered some requests but failed recently.
    Degraded,
    /// Controller has not been contacted yet.
    #[default]
    Unknown,
}

impl std::fmt::Display for ControllerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControllerStatus::Online => write!(f, "online"),
            ControllerStatus::Offline => write!(f, "offline"),
            ControllerStatus::Degraded => write!(f, "degraded"),
            ControllerStatus::Unknown => write!(f, "unknown"),
        }
    }
}

/// Health snapshot for serialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSnapshot {
    /// Bridge name.
    pub bridge: String,
    /// Overall health status: "healthy", "degraded" or "error".
    pub status: String,
    /// Uptime in seconds.
    pub uptime_secs: u64,
    /// Total controllers configured.
    pub controllers_total: u64,
    /// Controllers currently responding.
    pub controllers_responding: u64,
    /// Controllers currently offline.
    pub controllers_failed: u64,
    /// Last poll duration in milliseconds.
    pub last_poll_duration_ms: u64,
    /// Failed reads and writes since start.
    pub errors_total: u64,
    /// Values pushed to subscribers' tags.
    pub values_published: u64,
}

/// Controller liveness information for serialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerLiveness {
    /// Controller identifier.
    pub controller: String,
    /// Current status.
    pub status: ControllerStatus,
    /// Last seen timestamp (millis since epoch).
    pub last_seen: i64,
    /// Consecutive failures count.
    pub consecutive_failures: u32,
    /// Last error message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl BridgeHealth {
    /// Create a new health tracker.
    pub fn new(bridge_name: impl Into<String>) -> Self {
        Self {
            bridge_name: bridge_name.into(),
            start_time: Instant::now(),
            controllers_total: AtomicU64::new(0),
            values_published: AtomicU64::new(0),
            errors_total: AtomicU64::new(0),
            last_poll_duration_ms: AtomicU64::new(0),
            controllers: RwLock::new(HashMap::new()),
        }
    }

    /// Register the configured controllers so they show up as `unknown`
    /// before their first poll.
    pub fn register_controllers<'a>(&self, ids: impl IntoIterator<Item = &'a str>) {
        let mut controllers = self
            .controllers
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        for id in ids {
            controllers.entry(id.to_string()).or_default();
        }

        self.controllers_total
            .store(controllers.len() as u64, Ordering::SeqCst);
    }

    /// Record a successful exchange with a controller.
    pub fn record_success(&self, controller: &str) {
        let now = chrono::Utc::now().timestamp_millis();

        let mut controllers = self
            .controllers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let state = controllers.entry(controller.to_string()).or_default();

        state.status = ControllerStatus::Online;
        state.last_seen = now;
        state.consecutive_failures = 0;
        state.last_error = None;
    }

    /// Record a failed exchange with a controller.
    ///
    /// Returns the resulting status so callers can log transitions.
    pub fn record_failure(&self, controller: &str, error: &str) -> ControllerStatus {
        self.errors_total.fetch_add(1, Ordering::SeqCst);

        let mut controllers = self
            .controllers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let state = controllers.entry(controller.to_string()).or_default();

        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        state.last_error = Some(error.to_string());

        state.status = if state.consecutive_failures >= OFFLINE_AFTER_FAILURES {
            ControllerStatus::Offline
        } else {
            ControllerStatus::Degraded
        };

        state.status
    }

    /// Record values pushed to the hub.
    pub fn record_values_published(&self, count: u64) {
        self.values_published.fetch_add(count, Ordering::SeqCst);
    }

    /// Record poll cycle duration.
    pub fn record_poll_duration(&self, duration_ms: u64) {
        self.last_poll_duration_ms
            .store(duration_ms, Ordering::SeqCst);
    }

    /// Get a snapshot of current health metrics.
    pub fn snapshot(&self) -> HealthSnapshot {
        let (responding, failed) = {
            let controllers = self
                .controllers
                .read()
                .unwrap_or_else(PoisonError::into_inner);

            let mut responding = 0u64;
            let mut failed = 0u64;
            for state in controllers.values() {
                match state.status {
                    ControllerStatus::Online | ControllerStatus::Degraded => responding += 1,
                    ControllerStatus::Offline => failed += 1,
                    ControllerStatus::Unknown => {}
                }
            }
            (responding, failed)
        };

        let total = self.controllers_total.load(Ordering::SeqCst);

        let status = if failed == 0 {
            "healthy"
        } else if responding > 0 {
            "degraded"
        } else {
            "error"
        };

        HealthSnapshot {
            bridge: self.bridge_name.clone(),
            status: status.to_string(),
            uptime_secs: self.start_time.elapsed().as_secs(),
            controllers_total: total,
            controllers_responding: responding,
            controllers_failed: failed,
            last_poll_duration_ms: self.last_poll_duration_ms.load(Ordering::SeqCst),
            errors_total: self.errors_total.load(Ordering::SeqCst),
            values_published: self.values_published.load(Ordering::SeqCst),
        }
    }

    /// Get liveness info for a specific controller.
    pub fn controller_liveness(&self, controller: &str) -> Option<ControllerLiveness> {
        let controllers = self
            .controllers
            .read()
            .unwrap_or_else(PoisonError::into_inner);

        controllers
            .get(controller)
            .map(|state| liveness(controller, state))
    }

    /// Get liveness info for all controllers, ordered by id.
    pub fn all_controller_liveness(&self) -> Vec<ControllerLiveness> {
        let controllers = self
            .controllers
            .read()
            .unwrap_or_else(PoisonError::into_inner);

        let mut all: Vec<_> = controllers
            .iter()
            .map(|(id, state)| liveness(id, state))
            .collect();
        all.sort_by(|a, b| a.controller.cmp(&b.controller));
        all
    }
}

fn liveness(controller: &str, state: &ControllerState) -> ControllerLiveness {
    ControllerLiveness {
        controller: controller.to_string(),
        status: state.status,
        last_seen: state.last_seen,
        consecutive_failures: state.consecutive_failures,
        last_error: state.last_error.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_new() {
        let health = BridgeHealth::new("test");
        assert_eq!(health.bridge_name, "test");

        let snapshot = health.snapshot();
        assert_eq!(snapshot.bridge, "test");
        assert_eq!(snapshot.status, "healthy");
        assert_eq!(snapshot.controllers_total, 0);
    }

    #[test]
    fn test_registered_controllers_start_unknown() {
        let health = BridgeHealth::new("test");
        health.register_controllers(["20", "21"]);

        assert_eq!(health.snapshot().controllers_total, 2);
        let liveness = health.controller_liveness("21").unwrap();
        assert_eq!(liveness.status, ControllerStatus::Unknown);
        assert_eq!(liveness.last_seen, 0);
    }

    #[test]
    fn test_controller_success() {
        let health = BridgeHealth::new("test");
        health.register_controllers(["20"]);

        health.record_success("20");

        let liveness = health.controller_liveness("20").unwrap();
        assert_eq!(liveness.status, ControllerStatus::Online);
        assert_eq!(liveness.consecutive_failures, 0);
        assert!(liveness.last_error.is_none());
        assert!(liveness.last_seen > 0);
    }

    #[test]
    fn test_controller_failure() {
        let health = BridgeHealth::new("test");

        assert_eq!(
            health.record_failure("20", "timed out"),
            ControllerStatus::Degraded
        );
        assert_eq!(
            health.record_failure("20", "timed out"),
            ControllerStatus::Degraded
        );
        assert_eq!(
            health.record_failure("20", "timed out"),
            ControllerStatus::Offline
        );

        let liveness = health.controller_liveness("20").unwrap();
        assert_eq!(liveness.consecutive_failures, 3);
        assert_eq!(liveness.last_error.as_deref(), Some("timed out"));
        assert_eq!(health.snapshot().errors_total, 3);
    }

    #[test]
    fn test_recovery() {
        let health = BridgeHealth::new("test");

        for _ in 0..OFFLINE_AFTER_FAILURES {
            health.record_failure("20", "connection reset");
        }
        assert_eq!(
            health.controller_liveness("20").unwrap().status,
            ControllerStatus::Offline
        );

        health.record_success("20");

        let liveness = health.controller_liveness("20").unwrap();
        assert_eq!(liveness.status, ControllerStatus::Online);
        assert_eq!(liveness.consecutive_failures, 0);
    }

    #[test]
    fn test_health_status() {
        let health = BridgeHealth::new("test");
        health.register_controllers(["20", "21"]);

        health.record_success("20");
        health.record_success("21");
        assert_eq!(health.snapshot().status, "healthy");

        for _ in 0..OFFLINE_AFTER_FAILURES {
            health.record_failure("20", "error");
        }
        assert_eq!(health.snapshot().status, "degraded");

        for _ in 0..OFFLINE_AFTER_FAILURES {
            health.record_failure("21", "error");
        }
        assert_eq!(health.snapshot().status, "error");
    }

    #[test]
    fn test_all_liveness_sorted() {
        let health = BridgeHealth::new("test");
        health.register_controllers(["21", "20", "3"]);

        let ids: Vec<_> = health
            .all_controller_liveness()
            .into_iter()
            .map(|l| l.controller)
            .collect();
        assert_eq!(ids, vec!["20", "21", "3"]);
    }

    #[test]
    fn test_counters() {
        let health = BridgeHealth::new("test");

        health.record_values_published(10);
        health.record_values_published(5);
        health.record_poll_duration(42);

        let snapshot = health.snapshot();
        assert_eq!(snapshot.values_published, 15);
        assert_eq!(snapshot.last_poll_duration_ms, 42);
    }
}
