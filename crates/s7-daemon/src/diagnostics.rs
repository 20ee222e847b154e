//! Health summary for the adapter daemon.
//!
//! Combines the link status and counters with the daemon's own result
//! counts into a snapshot that is logged as JSON on SIGHUP and on the
//! periodic status tick.

use s7_common::state::LinkStatus;
use s7_link::LinkStats;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Health of the PLC link as seen by the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Connected and polls are mostly good.
    Healthy,
    /// Connected but polls keep reporting bad quality.
    Degraded,
    /// Link lost; a reconnect is pending.
    Unhealthy,
    /// No link has been established yet.
    Starting,
    /// Daemon is closing the link.
    ShuttingDown,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
            HealthStatus::Starting => write!(f, "starting"),
            HealthStatus::ShuttingDown => write!(f, "shutting_down"),
        }
    }
}

/// Point-in-time diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticsSnapshot {
    /// Derived health.
    pub health: HealthStatus,
    /// Coarse link status.
    pub status: LinkStatus,
    /// PLC the daemon talks to.
    pub target: String,
    /// Seconds since the daemon started.
    pub uptime_secs: u64,
    /// Results delivered to the log.
    pub results: u64,
    /// Delivered results that carried bad quality.
    pub failed_results: u64,
    /// Link counters.
    pub link: LinkStats,
}

/// Counters updated by the result forwarding tasks.
#[derive(Debug)]
pub struct DiagnosticsState {
    results: AtomicU64,
    failed_results: AtomicU64,
    shutting_down: AtomicBool,
    start_time: Instant,
}

impl Default for DiagnosticsState {
    fn default() -> Self {
        Self::new()
    }
}

impl DiagnosticsState {
    /// Create new diagnostics state.
    pub fn new() -> Self {
        Self {
            results: AtomicU64::new(0),
            failed_results: AtomicU64::new(0),
            shutting_down: AtomicBool::new(false),
            start_time: Instant::now(),
        }
    }

    /// Count one delivered result.
    pub fn record_result(&self, ok: bool) {
        self.results.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.failed_results.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Mark the daemon as shutting down.
    pub fn set_shutting_down(&self) {
        self.shutting_down.store(true, Ordering::Relaxed);
    }

    /// Results delivered so far.
    pub fn results(&self) -> u64 {
        self.results.load(Ordering::Relaxed)
    }

    /// Bad-quality results delivered so far.
    pub fn failed_results(&self) -> u64 {
        self.failed_results.load(Ordering::Relaxed)
    }

    /// Time since the daemon started.
    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Relaxed)
    }
}

/// Builds snapshots from shared state and link counters.
#[derive(Debug, Clone)]
pub struct DiagnosticsCollector {
    state: Arc<DiagnosticsState>,
}

impl DiagnosticsCollector {
    /// Create a new diagnostics collector.
    pub fn new(state: Arc<DiagnosticsState>) -> Self {
        Self { state }
    }

    /// Derive health from the link status and counters.
    pub fn health(&self, status: LinkStatus, stats: &LinkStats) -> HealthStatus {
        if self.state.is_shutting_down() {
            return HealthStatus::ShuttingDown;
        }
        match status {
            LinkStatus::Connected => {
                // More than 1% bad polls
                if stats.polls > 0 && stats.bad_polls * 100 > stats.polls {
                    HealthStatus::Degraded
                } else {
                    HealthStatus::Healthy
                }
            }
            LinkStatus::Error => HealthStatus::Unhealthy,
            LinkStatus::Connecting | LinkStatus::Disconnected => {
                if stats.connects == 0 {
                    HealthStatus::Starting
                } else {
                    HealthStatus::Unhealthy
                }
            }
        }
    }

    /// Create a snapshot of current diagnostics.
    pub fn snapshot(
        &self,
        status: LinkStatus,
        target: impl std::fmt::Display,
        stats: LinkStats,
    ) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            health: self.health(status, &stats),
            status,
            target: target.to_string(),
            uptime_secs: self.state.uptime().as_secs(),
            results: self.state.results(),
            failed_results: self.state.failed_results(),
            link: stats,
        }
    }

    /// Get the underlying state for updates.
    pub fn state(&self) -> &Arc<DiagnosticsState> {
        &self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collector() -> DiagnosticsCollector {
        DiagnosticsCollector::new(Arc::new(DiagnosticsState::new()))
    }

    #[test]
    fn test_result_counters() {
        let state = DiagnosticsState::new();
        state.record_result(true);
        state.record_result(false);
        state.record_result(true);
        assert_eq!(state.results(), 3);
        assert_eq!(state.failed_results(), 1);
    }

    #[test]
    fn test_health_status_display() {
        assert_eq!(format!("{}", HealthStatus::Healthy), "healthy");
        assert_eq!(format!("{}", HealthStatus::Degraded), "degraded");
        assert_eq!(format!("{}", HealthStatus::ShuttingDown), "shutting_down");
    }

    #[test]
    fn test_health_from_link() {
        let collector = collector();
        let fresh = LinkStats::default();
        assert_eq!(
            collector.health(LinkStatus::Connecting, &fresh),
            HealthStatus::Starting
        );
        assert_eq!(collector.health(LinkStatus::Error, &fresh), HealthStatus::Unhealthy);

        let up = LinkStats {
            connects: 1,
            polls: 10,
            ..LinkStats::default()
        };
        assert_eq!(collector.health(LinkStatus::Connected, &up), HealthStatus::Healthy);
        assert_eq!(
            collector.health(LinkStatus::Connecting, &up),
            HealthStatus::Unhealthy
        );
    }

    #[test]
    fn test_degraded_health_on_bad_polls() {
        let collector = collector();
        let stats = LinkStats {
            connects: 1,
            polls: 100,
            bad_polls: 2,
            ..LinkStats::default()
        };
        assert_eq!(
            collector.health(LinkStatus::Connected, &stats),
            HealthStatus::Degraded
        );
    }

    #[test]
    fn test_shutting_down_overrides_link() {
        let collector = collector();
        collector.state().set_shutting_down();
        assert_eq!(
            collector.health(LinkStatus::Connected, &LinkStats::default()),
            HealthStatus::ShuttingDown
        );
    }

    #[test]
    fn test_snapshot_serializes() {
        let collector = collector();
        collector.state().record_result(false);
        let snapshot = collector.snapshot(
            LinkStatus::Error,
            "127.0.0.1:102 (rack 0, slot 2)",
            LinkStats::default(),
        );
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["health"], "unhealthy");
        assert_eq!(json["status"], "error");
        assert_eq!(json["failed_results"], 1);
        assert_eq!(json["link"]["connects"], 0);
    }
}
