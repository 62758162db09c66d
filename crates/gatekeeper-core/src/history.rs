//! History sink: the trait contract for durable terminal-outcome recording.
//! Concrete storage (SQLite via `gatekeeper-history-sqlite`) lives outside
//! this crate; the engine only depends on this trait.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::job::Job;
use crate::lease::Lease;

/// Per-owner aggregate derived from history rows.
#[derive(Debug, Clone, serde::Serialize)]
pub struct OwnerStats {
    pub owner: String,
    pub count: u64,
    pub states: HashMap<String, u64>,
    pub avg_runtime_s: Option<f64>,
    pub p95_runtime_s: Option<f64>,
    pub avg_queue_wait_s: Option<f64>,
}

/// Aggregate query result for `stats(days)`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct HistoryStats {
    pub range_start: DateTime<Utc>,
    pub range_end: DateTime<Utc>,
    pub total: u64,
    pub totals_by_state: HashMap<String, u64>,
    pub success_rate: Option<f64>,
    pub avg_queue_wait_s: Option<f64>,
    pub per_owner: Vec<OwnerStats>,
}

/// Durable record of job outcomes. The sink is advisory: its failures are
/// logged but never roll back or block engine state transitions (spec.md
/// §7, "History sink failure").
///
/// All methods are called *after* the engine's lock has been released,
/// using values captured while it was held.
#[async_trait]
pub trait HistorySink: Send + Sync {
    /// Upsert a row at grant time: owner, priority, units, lease/worker id,
    /// creation and lease-issue timestamps.
    async fn record_lease(&self, job: &Job, lease: &Lease) -> anyhow::Result<()>;

    /// Upsert the same row with the latest transition or terminal state.
    /// Implementations must never clobber an existing `leased_at` or
    /// `finished_at` with null (spec.md §6 upsert semantics).
    async fn update_state(&self, job: &Job, lease: Option<&Lease>, finished_at: Option<DateTime<Utc>>) -> anyhow::Result<()>;

    /// Bulk terminal write for a batch of leases reclaimed by one expiry tick.
    async fn record_expired(&self, expired: &[(Lease, Job)]) -> anyhow::Result<()>;

    /// Aggregate stats over the last `days` days.
    async fn stats(&self, days: i64) -> anyhow::Result<HistoryStats>;

    /// Remove rows whose last-known `finished_at ?? updated_at` predates
    /// `days` ago. Returns the number of rows removed.
    async fn cleanup(&self, days: i64) -> anyhow::Result<u64>;
}

/// No-op sink for engines run without persistent history (e.g. unit tests
/// that only care about live-store behavior).
#[derive(Debug, Default)]
pub struct NullHistorySink;

#[async_trait]
impl HistorySink for NullHistorySink {
    async fn record_lease(&self, _job: &Job, _lease: &Lease) -> anyhow::Result<()> {
        Ok(())
    }

    async fn update_state(&self, _job: &Job, _lease: Option<&Lease>, _finished_at: Option<DateTime<Utc>>) -> anyhow::Result<()> {
        Ok(())
    }

    async fn record_expired(&self, _expired: &[(Lease, Job)]) -> anyhow::Result<()> {
        Ok(())
    }

    async fn stats(&self, days: i64) -> anyhow::Result<HistoryStats> {
        let now = Utc::now();
        Ok(HistoryStats {
            range_start: now - chrono::Duration::days(days),
            range_end: now,
            total: 0,
            totals_by_state: HashMap::new(),
            success_rate: None,
            avg_queue_wait_s: None,
            per_owner: Vec::new(),
        })
    }

    async fn cleanup(&self, _days: i64) -> anyhow::Result<u64> {
        Ok(0)
    }
}
