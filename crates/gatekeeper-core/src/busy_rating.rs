//! Busy-rating evaluator: maps a metrics snapshot to an integer 0–10 load
//! indicator. Fails closed whenever inputs are missing or stale.

use chrono::Utc;
use serde_json::Value;

use crate::metrics::{ApiStats, HostStats, MetricsProvider};

/// Host metrics older than this are treated as absent.
const STALE_AFTER_SECS: i64 = 30;

/// Canonical field name → accepted aliases. Used only by [`host_stats_from_json`]
/// and [`api_stats_from_json`], the two entry points that tolerate a
/// metrics-schema that hasn't settled on one name per field yet. Callers that
/// already hold a typed [`HostStats`]/[`ApiStats`] skip aliasing entirely.
const CPU_ALIASES: &[&str] = &["cpu_percent", "cpu_pct", "cpu"];
const MEMORY_ALIASES: &[&str] = &["memory_percent", "mem_percent", "mem_pct", "memory"];
const P95_ALIASES: &[&str] = &["p95_latency_ms", "latency_ms_p95", "api_p95_ms"];
const ERROR_RATE_ALIASES: &[&str] = &["error_rate", "err_rate", "api_error_rate"];
const IN_FLIGHT_ALIASES: &[&str] = &["in_flight_requests", "inflight", "in_flight"];
const SAMPLED_AT_ALIASES: &[&str] = &["sampled_at", "timestamp", "ts"];

fn lookup_f64(value: &Value, aliases: &[&str]) -> Option<f64> {
    aliases.iter().find_map(|key| value.get(key)).and_then(Value::as_f64)
}

/// Build a [`HostStats`] from a loosely-typed JSON blob, tolerating the
/// alias set above. For providers that source metrics from an upstream
/// collector whose field names aren't pinned to this crate's schema.
pub fn host_stats_from_json(value: &Value) -> HostStats {
    let sampled_at = SAMPLED_AT_ALIASES
        .iter()
        .find_map(|key| value.get(key))
        .and_then(Value::as_str)
        .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc));
    HostStats {
        sampled_at,
        cpu_percent: lookup_f64(value, CPU_ALIASES),
        memory_percent: lookup_f64(value, MEMORY_ALIASES),
    }
}

/// Build an [`ApiStats`] from a loosely-typed JSON blob. `error_rate` is
/// passed through verbatim here; normalization (a value `>1` is assumed to
/// be a percentage, e.g. `3.5` meaning 3.5%, and divided by 100) happens
/// exactly once, in [`score`], regardless of whether the `ApiStats` came
/// through this JSON path or a typed `MetricsProvider`.
pub fn api_stats_from_json(value: &Value) -> ApiStats {
    ApiStats {
        p95_latency_ms: lookup_f64(value, P95_ALIASES),
        error_rate: lookup_f64(value, ERROR_RATE_ALIASES),
        in_flight_requests: lookup_f64(value, IN_FLIGHT_ALIASES),
    }
}

/// Computes the 0–10 busy rating from an injected [`MetricsProvider`].
pub struct BusyRatingEvaluator {
    provider: std::sync::Arc<dyn MetricsProvider>,
    failclosed_default: u8,
}

impl BusyRatingEvaluator {
    pub fn new(provider: std::sync::Arc<dyn MetricsProvider>, failclosed_default: u8) -> Self {
        Self {
            provider,
            failclosed_default: failclosed_default.min(10),
        }
    }

    /// Synchronous by design: the engine calls this from inside its critical
    /// section, and a `MetricsProvider` must only read an already-materialized
    /// snapshot (no I/O).
    pub fn compute(&self) -> u8 {
        let (host, api) = self.provider.snapshot();
        score(host, api, self.failclosed_default)
    }
}

fn score(host: Option<HostStats>, api: Option<ApiStats>, failclosed_default: u8) -> u8 {
    if host.is_none() && api.is_none() {
        return failclosed_default;
    }

    let host = host.filter(|h| match h.sampled_at {
        Some(ts) => (Utc::now() - ts).num_seconds() < STALE_AFTER_SECS,
        None => true,
    });

    // Staleness can demote host from Some to None; re-check fail-closed so a
    // stale host plus an absent api still fails closed rather than scoring 0.
    if host.is_none() && api.is_none() {
        return failclosed_default;
    }

    let mut total: i32 = 0;

    if let Some(h) = host {
        if let Some(cpu) = h.cpu_percent {
            total += match cpu {
                c if c >= 95.0 => 4,
                c if c >= 85.0 => 3,
                c if c >= 70.0 => 2,
                c if c >= 50.0 => 1,
                _ => 0,
            };
        }
        if let Some(mem) = h.memory_percent {
            total += match mem {
                m if m >= 95.0 => 3,
                m if m >= 85.0 => 2,
                m if m >= 70.0 => 1,
                _ => 0,
            };
        }
    }

    if let Some(a) = api {
        if let Some(p95) = a.p95_latency_ms {
            total += match p95 {
                p if p >= 1500.0 => 3,
                p if p >= 800.0 => 2,
                p if p >= 400.0 => 1,
                _ => 0,
            };
        }
        if let Some(raw_err) = a.error_rate {
            let err = if raw_err > 1.0 { raw_err / 100.0 } else { raw_err };
            total += match err {
                e if e >= 0.10 => 3,
                e if e >= 0.03 => 2,
                e if e >= 0.01 => 1,
                _ => 0,
            };
        }
        if let Some(inflight) = a.in_flight_requests {
            total += match inflight {
                i if i >= 100.0 => 2,
                i if i >= 50.0 => 1,
                _ => 0,
            };
        }
    }

    total.clamp(0, 10) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::sync::Arc;

    #[test]
    fn both_absent_fails_closed_to_default() {
        assert_eq!(score(None, None, 8), 8);
        assert_eq!(score(None, None, 3), 3);
    }

    #[test]
    fn stale_host_stats_treated_as_absent() {
        let stale = HostStats {
            sampled_at: Some(Utc::now() - Duration::seconds(31)),
            cpu_percent: Some(99.0),
            memory_percent: None,
        };
        // CPU would contribute +4 if fresh; stale means it's dropped, and
        // with api also None we fail closed.
        assert_eq!(score(Some(stale), None, 8), 8);
    }

    #[test]
    fn accumulates_and_clamps_to_ten() {
        let host = HostStats {
            sampled_at: Some(Utc::now()),
            cpu_percent: Some(96.0),
            memory_percent: Some(96.0),
        };
        let api = ApiStats {
            p95_latency_ms: Some(2000.0),
            error_rate: Some(0.5),
            in_flight_requests: Some(200.0),
        };
        // 4 + 3 + 3 + 3 + 2 = 15, clamped to 10
        assert_eq!(score(Some(host), Some(api), 8), 10);
    }

    #[test]
    fn error_rate_normalized_when_expressed_as_percent() {
        let api = ApiStats {
            p95_latency_ms: None,
            error_rate: Some(15.0), // 15%, not 0.15
            in_flight_requests: None,
        };
        assert_eq!(score(None, Some(api), 8), 3);
    }

    #[test]
    fn json_aliases_are_tolerated() {
        let raw = serde_json::json!({ "cpu_pct": 90.0, "mem_percent": 10.0 });
        let host = host_stats_from_json(&raw);
        assert_eq!(host.cpu_percent, Some(90.0));
        assert_eq!(host.memory_percent, Some(10.0));
    }

    #[test]
    fn evaluator_delegates_to_provider() {
        use crate::metrics::InMemoryMetricsProvider;
        let provider = Arc::new(InMemoryMetricsProvider::new());
        let eval = BusyRatingEvaluator::new(provider.clone(), 8);
        assert_eq!(eval.compute(), 8);
        provider.set(
            Some(HostStats { sampled_at: Some(Utc::now()), cpu_percent: Some(96.0), memory_percent: None }),
            None,
        );
        assert_eq!(eval.compute(), 4);
    }
}
