//! SQLite-backed [`HistorySink`]. Keeps one upserted row per job, covering
//! everything from lease grant through terminal state, plus the aggregate
//! queries the maintenance API exposes.
//!
//! Schema and upsert semantics (in particular: never let a later write null
//! out an already-recorded `leased_at`/`finished_at`) are carried over from
//! the scheduler's original SQLite history store.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use gatekeeper_core::{HistorySink, HistoryStats, Job, Lease, OwnerStats};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};

/// Opens (creating if needed) a SQLite-backed history store at `path` and
/// ensures the `job_history` table and its indexes exist.
pub struct SqliteHistorySink {
    pool: SqlitePool,
}

impl SqliteHistorySink {
    pub async fn connect(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::new().filename(path).create_if_missing(true);
        let pool = SqlitePoolOptions::new().max_connections(1).connect_with(options).await?;
        let sink = Self { pool };
        sink.init_schema().await?;
        Ok(sink)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn init_schema(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS job_history (
                job_id TEXT PRIMARY KEY,
                job_type TEXT NOT NULL,
                priority TEXT NOT NULL,
                requested_units INTEGER NOT NULL,
                unique_flag INTEGER NOT NULL,
                state TEXT NOT NULL,
                payload_json TEXT NOT NULL,
                tags_json TEXT NOT NULL,
                owner_id TEXT,
                idempotency_key TEXT,
                lease_id TEXT,
                worker_id TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                leased_at TEXT,
                finished_at TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_job_history_updated ON job_history(updated_at)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_job_history_owner ON job_history(owner_id)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_job_history_state ON job_history(state)")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn upsert(
        &self,
        job: &Job,
        lease_id: Option<uuid::Uuid>,
        worker_id: Option<&str>,
        leased_at: Option<DateTime<Utc>>,
        finished_at: Option<DateTime<Utc>>,
    ) -> anyhow::Result<()> {
        let owner_id = job.owner().map(str::to_string);
        let priority = serde_json::to_value(job.priority)?.as_str().unwrap_or_default().to_string();
        let state = serde_json::to_value(job.state)?.as_str().unwrap_or_default().to_string();
        let payload_json = job.payload.to_string();
        let tags_json = serde_json::to_string(&job.tags)?;

        sqlx::query(
            r#"
            INSERT INTO job_history (
                job_id, job_type, priority, requested_units, unique_flag, state,
                payload_json, tags_json, owner_id, idempotency_key,
                lease_id, worker_id, created_at, updated_at, leased_at, finished_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(job_id) DO UPDATE SET
                job_type = excluded.job_type,
                priority = excluded.priority,
                requested_units = excluded.requested_units,
                unique_flag = excluded.unique_flag,
                state = excluded.state,
                payload_json = excluded.payload_json,
                tags_json = excluded.tags_json,
                owner_id = excluded.owner_id,
                idempotency_key = excluded.idempotency_key,
                lease_id = COALESCE(excluded.lease_id, job_history.lease_id),
                worker_id = COALESCE(excluded.worker_id, job_history.worker_id),
                created_at = excluded.created_at,
                updated_at = excluded.updated_at,
                leased_at = COALESCE(job_history.leased_at, excluded.leased_at),
                finished_at = COALESCE(job_history.finished_at, excluded.finished_at)
            "#,
        )
        .bind(job.job_id.to_string())
        .bind(&job.job_type)
        .bind(priority)
        .bind(job.requested_units)
        .bind(job.unique as i64)
        .bind(state)
        .bind(payload_json)
        .bind(tags_json)
        .bind(owner_id)
        .bind(&job.idempotency_key)
        .bind(lease_id.map(|id| id.to_string()))
        .bind(worker_id)
        .bind(job.created_at.to_rfc3339())
        .bind(job.updated_at.to_rfc3339())
        .bind(leased_at.map(|dt| dt.to_rfc3339()))
        .bind(finished_at.map(|dt| dt.to_rfc3339()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl HistorySink for SqliteHistorySink {
    async fn record_lease(&self, job: &Job, lease: &Lease) -> anyhow::Result<()> {
        self.upsert(job, Some(lease.lease_id), Some(&lease.worker_id), Some(lease.issued_at), None)
            .await
    }

    async fn update_state(&self, job: &Job, lease: Option<&Lease>, finished_at: Option<DateTime<Utc>>) -> anyhow::Result<()> {
        let (lease_id, worker_id, leased_at) = match lease {
            Some(lease) => (Some(lease.lease_id), Some(lease.worker_id.as_str()), Some(lease.issued_at)),
            None => (job.lease_id, None, None),
        };
        self.upsert(job, lease_id, worker_id, leased_at, finished_at).await
    }

    async fn record_expired(&self, expired: &[(Lease, Job)]) -> anyhow::Result<()> {
        let now = Utc::now();
        for (lease, job) in expired {
            self.update_state(job, Some(lease), Some(now)).await?;
        }
        Ok(())
    }

    async fn stats(&self, days: i64) -> anyhow::Result<HistoryStats> {
        let now = Utc::now();
        let start = now - Duration::days(days);

        let rows = sqlx::query(
            r#"
            SELECT state, owner_id, created_at, updated_at, leased_at, finished_at
            FROM job_history
            WHERE COALESCE(finished_at, updated_at) >= ?
            "#,
        )
        .bind(start.to_rfc3339())
        .fetch_all(&self.pool)
        .await?;

        let mut totals_by_state: HashMap<String, u64> = HashMap::new();
        let mut per_owner: HashMap<String, OwnerBucket> = HashMap::new();
        let mut queue_waits: Vec<f64> = Vec::new();
        let total = rows.len() as u64;

        for row in &rows {
            let state: String = row.try_get("state").unwrap_or_default();
            *totals_by_state.entry(state.clone()).or_insert(0) += 1;

            let owner_id: String = row.try_get::<Option<String>, _>("owner_id").ok().flatten().unwrap_or_else(|| "unknown".to_string());
            let bucket = per_owner.entry(owner_id).or_default();
            bucket.count += 1;
            *bucket.states.entry(state).or_insert(0) += 1;

            let created_at = parse_rfc3339(row.try_get::<Option<String>, _>("created_at").ok().flatten());
            let leased_at = parse_rfc3339(row.try_get::<Option<String>, _>("leased_at").ok().flatten());
            let finished_at = parse_rfc3339(row.try_get::<Option<String>, _>("finished_at").ok().flatten());

            if let (Some(leased_at), Some(finished_at)) = (leased_at, finished_at) {
                bucket.durations_s.push((finished_at - leased_at).num_milliseconds() as f64 / 1000.0);
            }
            if let (Some(created_at), Some(leased_at)) = (created_at, leased_at) {
                let wait_s = (leased_at - created_at).num_milliseconds() as f64 / 1000.0;
                queue_waits.push(wait_s);
                bucket.queue_waits_s.push(wait_s);
            }
        }

        let mut owners: Vec<String> = per_owner.keys().cloned().collect();
        owners.sort();
        let per_owner_stats = owners
            .into_iter()
            .map(|owner| {
                let bucket = per_owner.remove(&owner).unwrap_or_default();
                OwnerStats {
                    owner,
                    count: bucket.count,
                    states: bucket.states,
                    avg_runtime_s: average(&bucket.durations_s),
                    p95_runtime_s: percentile_95(&bucket.durations_s),
                    avg_queue_wait_s: average(&bucket.queue_waits_s),
                }
            })
            .collect();

        let completed = totals_by_state.get("completed").copied().unwrap_or(0);
        let failed = totals_by_state.get("failed").copied().unwrap_or(0);
        let expired = totals_by_state.get("expired").copied().unwrap_or(0);
        let denom = completed + failed + expired;
        let success_rate = if denom > 0 { Some(completed as f64 / denom as f64) } else { None };

        Ok(HistoryStats {
            range_start: start,
            range_end: now,
            total,
            totals_by_state,
            success_rate,
            avg_queue_wait_s: average(&queue_waits),
            per_owner: per_owner_stats,
        })
    }

    async fn cleanup(&self, days: i64) -> anyhow::Result<u64> {
        let cutoff = Utc::now() - Duration::days(days);
        let result = sqlx::query("DELETE FROM job_history WHERE COALESCE(finished_at, updated_at) < ?")
            .bind(cutoff.to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[derive(Default)]
struct OwnerBucket {
    count: u64,
    states: HashMap<String, u64>,
    durations_s: Vec<f64>,
    queue_waits_s: Vec<f64>,
}

fn parse_rfc3339(value: Option<String>) -> Option<DateTime<Utc>> {
    value.and_then(|s| DateTime::parse_from_rfc3339(&s).ok()).map(|dt| dt.with_timezone(&Utc))
}

fn average(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

fn percentile_95(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let idx = ((sorted.len() as f64) * 0.95).floor().max(1.0) as usize - 1;
    sorted.get(idx.min(sorted.len() - 1)).copied()
}

#[cfg(test)]
mod tests {
    use super::*;
    use gatekeeper_core::{JobState, Priority};
    use uuid::Uuid;

    fn job(owner: &str, units: i64) -> Job {
        let now = Utc::now();
        Job {
            job_id: Uuid::new_v4(),
            idempotency_key: None,
            job_type: "demo.task".to_string(),
            priority: Priority::Normal,
            tags: vec![format!("owner:{owner}")],
            unique: false,
            requested_units: units,
            state: JobState::Leased,
            payload: serde_json::json!({}),
            created_at: now,
            updated_at: now,
            lease_id: None,
        }
    }

    fn lease(job_id: Uuid, worker: &str) -> Lease {
        let now = Utc::now();
        Lease {
            lease_id: Uuid::new_v4(),
            job_id,
            worker_id: worker.to_string(),
            capacity_units: 5,
            issued_at: now,
            last_heartbeat: now,
            expires_at: now + Duration::seconds(60),
        }
    }

    #[tokio::test]
    async fn record_lease_then_complete_round_trips_through_stats() {
        let sink = SqliteHistorySink::connect(":memory:").await.unwrap();
        let mut j = job("acme", 5);
        let l = lease(j.job_id, "w1");

        sink.record_lease(&j, &l).await.unwrap();
        j.state = JobState::Completed;
        sink.update_state(&j, Some(&l), Some(Utc::now())).await.unwrap();

        let stats = sink.stats(30).await.unwrap();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.totals_by_state.get("completed"), Some(&1));
        assert_eq!(stats.per_owner.len(), 1);
        assert_eq!(stats.per_owner[0].owner, "acme");
        assert_eq!(stats.success_rate, Some(1.0));
    }

    #[tokio::test]
    async fn cleanup_removes_rows_older_than_retention() {
        let sink = SqliteHistorySink::connect(":memory:").await.unwrap();
        let mut j = job("acme", 5);
        j.updated_at = Utc::now() - Duration::days(90);
        let l = lease(j.job_id, "w1");
        sink.record_lease(&j, &l).await.unwrap();
        j.state = JobState::Completed;
        sink.update_state(&j, Some(&l), Some(Utc::now() - Duration::days(90))).await.unwrap();

        let removed = sink.cleanup(30).await.unwrap();
        assert_eq!(removed, 1);

        let stats = sink.stats(365).await.unwrap();
        assert_eq!(stats.total, 0);
    }

    #[tokio::test]
    async fn leased_at_is_never_clobbered_by_a_later_update() {
        let sink = SqliteHistorySink::connect(":memory:").await.unwrap();
        let j = job("acme", 5);
        let l = lease(j.job_id, "w1");
        sink.record_lease(&j, &l).await.unwrap();

        // A later update without a lease must not null out leased_at.
        let mut j2 = j.clone();
        j2.state = JobState::Running;
        sink.update_state(&j2, None, None).await.unwrap();

        let row = sqlx::query("SELECT leased_at FROM job_history WHERE job_id = ?")
            .bind(j.job_id.to_string())
            .fetch_one(sink.pool())
            .await
            .unwrap();
        let leased_at: Option<String> = row.try_get("leased_at").unwrap();
        assert!(leased_at.is_some());
    }
}
