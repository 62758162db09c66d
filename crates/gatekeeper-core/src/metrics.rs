//! The metrics provider collaborator: a pure, read-only source of host and
//! API-layer statistics for the busy-rating evaluator.
//!
//! Real OS/API sampling is out of scope for this crate (see SPEC_FULL.md
//! §1) — [`InMemoryMetricsProvider`] is a settable reference implementation
//! used by demos and tests; a production deployment supplies its own
//! `MetricsProvider` backed by whatever collector it already runs.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::busy_rating::{api_stats_from_json, host_stats_from_json};

/// Host-level resource usage at a point in time.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostStats {
    pub sampled_at: Option<DateTime<Utc>>,
    pub cpu_percent: Option<f64>,
    pub memory_percent: Option<f64>,
}

/// API-layer health signals, aggregated over some recent window.
#[derive(Debug, Clone, Copy, Default)]
pub struct ApiStats {
    pub p95_latency_ms: Option<f64>,
    pub error_rate: Option<f64>,
    pub in_flight_requests: Option<f64>,
}

/// A pure, read-only source of metrics snapshots. Implementations must not
/// block or perform I/O on the calling thread in a way that could stall the
/// engine's critical section (busy-rating evaluation happens under the
/// engine lock).
pub trait MetricsProvider: Send + Sync {
    fn snapshot(&self) -> (Option<HostStats>, Option<ApiStats>);
}

/// Reference `MetricsProvider`: snapshot set externally (by a test or a demo
/// poller), read back verbatim. Not a real OS/API collector.
#[derive(Default)]
pub struct InMemoryMetricsProvider {
    state: Mutex<(Option<HostStats>, Option<ApiStats>)>,
}

impl InMemoryMetricsProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the current snapshot. `None` for either side means "absent"
    /// as far as the busy-rating evaluator is concerned.
    pub fn set(&self, host: Option<HostStats>, api: Option<ApiStats>) {
        let mut guard = self.state.lock().expect("metrics provider lock poisoned");
        *guard = (host, api);
    }

    /// Replace the current snapshot from loosely-typed JSON, e.g. a metrics
    /// push from an external collector whose field names haven't settled on
    /// this crate's schema yet. Decodes each side through the busy-rating
    /// evaluator's alias table (see [`crate::busy_rating`]).
    pub fn set_from_json(&self, host: Option<&Value>, api: Option<&Value>) {
        let host = host.map(host_stats_from_json);
        let api = api.map(api_stats_from_json);
        self.set(host, api);
    }
}

impl MetricsProvider for InMemoryMetricsProvider {
    fn snapshot(&self) -> (Option<HostStats>, Option<ApiStats>) {
        *self.state.lock().expect("metrics provider lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_from_json_tolerates_aliases_and_updates_snapshot() {
        let provider = InMemoryMetricsProvider::new();
        let host = serde_json::json!({ "cpu_pct": 90.0, "mem_percent": 10.0 });
        let api = serde_json::json!({ "latency_ms_p95": 500.0, "inflight": 12.0 });

        provider.set_from_json(Some(&host), Some(&api));

        let (host, api) = provider.snapshot();
        assert_eq!(host.unwrap().cpu_percent, Some(90.0));
        let api = api.unwrap();
        assert_eq!(api.p95_latency_ms, Some(500.0));
        assert_eq!(api.in_flight_requests, Some(12.0));
    }

    #[test]
    fn set_from_json_leaves_absent_side_none() {
        let provider = InMemoryMetricsProvider::new();
        provider.set_from_json(Some(&serde_json::json!({ "cpu": 10.0 })), None);
        let (host, api) = provider.snapshot();
        assert!(host.is_some());
        assert!(api.is_none());
    }
}
