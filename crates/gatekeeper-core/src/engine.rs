//! The scheduling engine: the single coordination point for submit, lease
//! request, heartbeat, complete, and expiry. All mutation of [`Store`]
//! happens inside one `std::sync::Mutex` critical section; history-sink
//! writes and any other I/O happen strictly after the guard drops, using
//! values captured while it was held (spec.md §5 forbids suspension points
//! inside the critical section).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use uuid::Uuid;

use crate::busy_rating::BusyRatingEvaluator;
use crate::capacity;
use crate::config::GatekeeperConfig;
use crate::error::EngineError;
use crate::history::HistorySink;
use crate::job::{Job, JobSpec, JobState, Priority};
use crate::lease::{Lease, SchedulerSnapshot};
use crate::metrics::MetricsProvider;
use crate::store::Store;

/// Completion status a worker reports via `Complete`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStatus {
    Completed,
    Failed,
}

/// Result of `RequestLease`: a tagged union, not an error — capacity
/// starvation and head-of-line denial are normal flow (spec.md §9).
#[derive(Debug, Clone)]
pub enum LeaseOutcome {
    Granted { lease: Lease, job: Job },
    Denied { reason: String, retry_after_ms: i64 },
}

struct EngineState {
    store: Store,
}

/// Constructor-injected, process-lifetime engine value (spec.md §9: replace
/// module-level globals with one value built at startup and threaded to
/// every caller).
pub struct SchedulingEngine {
    state: Mutex<EngineState>,
    config: GatekeeperConfig,
    busy_rating: BusyRatingEvaluator,
    history: Arc<dyn HistorySink>,
}

impl SchedulingEngine {
    pub fn builder(config: GatekeeperConfig) -> EngineBuilder {
        EngineBuilder {
            config,
            metrics: None,
            history: None,
        }
    }

    /// Submit(job) → Job. Idempotent on `idempotency_key`.
    pub async fn submit(&self, spec: JobSpec) -> Job {
        let mut guard = self.state.lock().expect("engine lock poisoned");
        if let Some(key) = &spec.idempotency_key {
            if let Some(existing) = guard.store.job_by_idempotency_key(key) {
                return existing.clone();
            }
        }

        let now = Utc::now();
        let job = Job {
            job_id: Uuid::new_v4(),
            idempotency_key: spec.idempotency_key,
            job_type: spec.job_type,
            priority: spec.priority,
            tags: spec.tags,
            unique: spec.unique,
            requested_units: spec.requested_units,
            state: JobState::Queued,
            payload: spec.payload,
            created_at: now,
            updated_at: now,
            lease_id: None,
        };

        guard.store.insert_job(job.clone());
        guard.store.enqueue(job.priority, job.job_id);
        job
    }

    /// RequestLease(worker_id, max_units?) → Granted | Denied.
    pub async fn request_lease(&self, worker_id: &str, max_units: Option<i64>) -> LeaseOutcome {
        let granted = {
            let mut guard = self.state.lock().expect("engine lock poisoned");
            self.expire_locked(&mut guard);
            self.try_grant_locked(&mut guard, worker_id, max_units)
        };

        if let LeaseOutcome::Granted { lease, job } = &granted {
            if let Err(err) = self.history.record_lease(job, lease).await {
                tracing::error!(job_id = %job.job_id, lease_id = %lease.lease_id, error = %err, "history record_lease failed");
            }
        }
        granted
    }

    fn try_grant_locked(&self, guard: &mut EngineState, worker_id: &str, max_units: Option<i64>) -> LeaseOutcome {
        if let Some(cap) = self.config.max_active_leases {
            if guard.store.active_lease_count() >= cap {
                return LeaseOutcome::Denied {
                    reason: "max_active_leases reached".to_string(),
                    retry_after_ms: self.config.request_lease_retry_after_ms,
                };
            }
        }

        let busy = self.busy_rating.compute();
        let usable = capacity::usable_units(
            self.config.total_capacity_units,
            busy,
            self.config.headroom_pct,
            self.config.reserve_units,
        );
        let leased = guard.store.sum_leased_units();
        let available = capacity::available_units(usable, leased);
        if available <= 0 {
            return LeaseOutcome::Denied {
                reason: format!("no capacity (busy={busy}, usable={usable}, leased={leased})"),
                retry_after_ms: self.config.request_lease_retry_after_ms,
            };
        }

        let worker_has_lease = guard.store.leases_for_worker(worker_id).next().is_some();
        let owner_counts = if self.config.max_active_leases_per_owner.is_some() {
            Some(guard.store.active_leases_per_owner())
        } else {
            None
        };

        let max_scan = guard.store.total_queued();
        for _ in 0..max_scan {
            let Some((priority, job_id)) = guard.store.dequeue_next() else {
                return LeaseOutcome::Denied {
                    reason: "no queued jobs".to_string(),
                    retry_after_ms: self.config.request_lease_retry_after_ms,
                };
            };

            let Some(job) = guard.store.job(job_id).cloned() else {
                continue;
            };
            if job.state != JobState::Queued {
                continue;
            }

            if job.unique && worker_has_lease {
                guard.store.requeue_tail(priority, job_id);
                continue;
            }

            if let (Some(cap), Some(counts)) = (self.config.max_active_leases_per_owner, &owner_counts) {
                if let Some(owner) = job.owner() {
                    if counts.get(owner).copied().unwrap_or(0) >= cap {
                        guard.store.requeue_tail(priority, job_id);
                        continue;
                    }
                }
            }

            if job.requested_units <= 0 {
                if let Some(job_mut) = guard.store.job_mut(job_id) {
                    job_mut.state = JobState::Failed;
                    job_mut.updated_at = Utc::now();
                }
                continue;
            }

            let need = max_units.map(|m| job.requested_units.min(m)).unwrap_or(job.requested_units);
            if need > available {
                guard.store.requeue_tail(priority, job_id);
                return LeaseOutcome::Denied {
                    reason: format!("next job needs {need}u but only {available}u available"),
                    retry_after_ms: self.config.request_lease_retry_after_ms,
                };
            }

            let now = Utc::now();
            let lease = Lease {
                lease_id: Uuid::new_v4(),
                job_id,
                worker_id: worker_id.to_string(),
                capacity_units: need,
                issued_at: now,
                last_heartbeat: now,
                expires_at: now + chrono::Duration::seconds(self.config.lease_ttl_s + self.config.heartbeat_grace_s),
            };
            guard.store.insert_lease(lease.clone());

            let job = {
                let job_mut = guard.store.job_mut(job_id).expect("job vanished mid-grant");
                job_mut.state = JobState::Leased;
                job_mut.lease_id = Some(lease.lease_id);
                job_mut.updated_at = now;
                job_mut.clone()
            };

            return LeaseOutcome::Granted { lease, job };
        }

        LeaseOutcome::Denied {
            reason: "no eligible job found".to_string(),
            retry_after_ms: self.config.request_lease_retry_after_ms,
        }
    }

    /// Heartbeat(lease_id, worker_id) → Lease with extended `expires_at`.
    pub async fn heartbeat(&self, lease_id: Uuid, worker_id: &str) -> Result<Lease, EngineError> {
        let (lease, job, became_running) = {
            let mut guard = self.state.lock().expect("engine lock poisoned");
            self.expire_locked(&mut guard);

            let owner_matches = match guard.store.lease(lease_id) {
                None => return Err(EngineError::NotFound { lease_id }),
                Some(lease) => lease.worker_id == worker_id,
            };
            if !owner_matches {
                return Err(EngineError::PermissionDenied { lease_id, worker_id: worker_id.to_string() });
            }

            let now = Utc::now();
            let lease = {
                let lease_mut = guard.store.lease_mut(lease_id).expect("checked above");
                lease_mut.last_heartbeat = now;
                lease_mut.expires_at = now + chrono::Duration::seconds(self.config.lease_ttl_s + self.config.heartbeat_grace_s);
                lease_mut.clone()
            };

            let mut became_running = false;
            let job = match guard.store.job_mut(lease.job_id) {
                Some(job_mut) if job_mut.state == JobState::Leased => {
                    job_mut.state = JobState::Running;
                    job_mut.updated_at = now;
                    became_running = true;
                    Some(job_mut.clone())
                }
                Some(job_mut) if job_mut.state == JobState::Running => Some(job_mut.clone()),
                _ => None,
            };

            (lease, job, became_running)
        };

        if became_running {
            if let Some(job) = job {
                if let Err(err) = self.history.update_state(&job, Some(&lease), None).await {
                    tracing::error!(job_id = %job.job_id, error = %err, "history update_state failed");
                }
            }
        }

        Ok(lease)
    }

    /// Complete(lease_id, worker_id, status) → (). Idempotent on a
    /// lease that's already gone (late-complete succeeds silently).
    pub async fn complete(&self, lease_id: Uuid, worker_id: &str, status: CompletionStatus) -> Result<(), EngineError> {
        let finished = {
            let mut guard = self.state.lock().expect("engine lock poisoned");
            self.expire_locked(&mut guard);

            let Some(lease) = guard.store.lease(lease_id).cloned() else {
                return Ok(());
            };
            if lease.worker_id != worker_id {
                return Err(EngineError::PermissionDenied { lease_id, worker_id: worker_id.to_string() });
            }

            let now = Utc::now();
            let job = guard.store.job_mut(lease.job_id).map(|job_mut| {
                job_mut.state = match status {
                    CompletionStatus::Completed => JobState::Completed,
                    CompletionStatus::Failed => JobState::Failed,
                };
                job_mut.lease_id = None;
                job_mut.updated_at = now;
                job_mut.clone()
            });
            guard.store.remove_lease(lease_id);

            job.map(|job| (job, lease, now))
        };

        if let Some((job, lease, now)) = finished {
            if let Err(err) = self.history.update_state(&job, Some(&lease), Some(now)).await {
                tracing::error!(job_id = %job.job_id, error = %err, "history update_state failed");
            }
        }
        Ok(())
    }

    /// `_expireLocked()` as a public tick entry point for the expiry ticker.
    /// Acquires the lock, reclaims stale leases, releases the lock, then
    /// writes the batch to history.
    pub async fn expire_tick(&self) {
        let expired = {
            let mut guard = self.state.lock().expect("engine lock poisoned");
            self.expire_locked(&mut guard)
        };
        if expired.is_empty() {
            return;
        }
        if let Err(err) = self.history.record_expired(&expired).await {
            tracing::error!(count = expired.len(), error = %err, "history record_expired failed");
        }
    }

    /// Scan leases; any with `expires_at <= now` is removed and its Job (if
    /// `{leased, running}`) transitioned to `expired`. Must run under the
    /// engine lock. Returns the reclaimed (Lease, Job) pairs for out-of-lock
    /// history writing.
    fn expire_locked(&self, guard: &mut EngineState) -> Vec<(Lease, Job)> {
        let now = Utc::now();
        let expired_ids: Vec<Uuid> = guard
            .store
            .leases()
            .filter(|l| l.expires_at <= now)
            .map(|l| l.lease_id)
            .collect();

        let mut out = Vec::with_capacity(expired_ids.len());
        for lease_id in expired_ids {
            let Some(lease) = guard.store.remove_lease(lease_id) else {
                continue;
            };
            if let Some(job_mut) = guard.store.job_mut(lease.job_id) {
                if matches!(job_mut.state, JobState::Leased | JobState::Running) {
                    job_mut.state = JobState::Expired;
                    job_mut.lease_id = None;
                    job_mut.updated_at = now;
                    out.push((lease, job_mut.clone()));
                    continue;
                }
            }
            // Job missing or already in a non-{leased,running} state: lease
            // is still reclaimed, but there's nothing terminal to record.
        }
        out
    }

    /// Snapshot → read-only observation of engine state.
    pub async fn snapshot(&self) -> SchedulerSnapshot {
        let guard = self.state.lock().expect("engine lock poisoned");
        let busy = self.busy_rating.compute();
        let usable = capacity::usable_units(
            self.config.total_capacity_units,
            busy,
            self.config.headroom_pct,
            self.config.reserve_units,
        );
        let leased = guard.store.sum_leased_units();
        let available = capacity::available_units(usable, leased);
        SchedulerSnapshot {
            busy_rating: busy,
            total_units: self.config.total_capacity_units,
            usable_units: usable,
            leased_units: leased,
            available_units: available,
            queue_depths: guard.store.queue_depths(),
            active_leases: guard.store.active_lease_count(),
        }
    }

    pub fn history(&self) -> &Arc<dyn HistorySink> {
        &self.history
    }
}

/// Builds a [`SchedulingEngine`] with constructor-injected collaborators.
pub struct EngineBuilder {
    config: GatekeeperConfig,
    metrics: Option<Arc<dyn MetricsProvider>>,
    history: Option<Arc<dyn HistorySink>>,
}

impl EngineBuilder {
    pub fn metrics(mut self, provider: Arc<dyn MetricsProvider>) -> Self {
        self.metrics = Some(provider);
        self
    }

    pub fn history(mut self, sink: Arc<dyn HistorySink>) -> Self {
        self.history = Some(sink);
        self
    }

    pub fn build(self) -> SchedulingEngine {
        let metrics = self
            .metrics
            .unwrap_or_else(|| Arc::new(crate::metrics::InMemoryMetricsProvider::new()));
        let history = self
            .history
            .unwrap_or_else(|| Arc::new(crate::history::NullHistorySink));
        let busy_rating = BusyRatingEvaluator::new(metrics, self.config.failclosed_busy_default);
        SchedulingEngine {
            state: Mutex::new(EngineState { store: Store::new() }),
            config: self.config,
            busy_rating,
            history,
        }
    }
}

#[allow(dead_code)]
fn _priority_order_assertion() -> [Priority; 4] {
    Priority::ORDER
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{ApiStats, HostStats, InMemoryMetricsProvider};

    fn spec(units: i64, priority: Priority) -> JobSpec {
        JobSpec::new("demo.task", priority, units)
    }

    fn force_busy(provider: &Arc<InMemoryMetricsProvider>, busy: u8) {
        // busy=0 via host stats that clamp every signal below threshold.
        let _ = busy;
        provider.set(
            Some(HostStats { sampled_at: Some(Utc::now()), cpu_percent: Some(0.0), memory_percent: Some(0.0) }),
            Some(ApiStats { p95_latency_ms: Some(0.0), error_rate: Some(0.0), in_flight_requests: Some(0.0) }),
        );
    }

    fn engine_with_capacity(total: i64, reserve: i64) -> (SchedulingEngine, Arc<InMemoryMetricsProvider>) {
        let provider = Arc::new(InMemoryMetricsProvider::new());
        force_busy(&provider, 0);
        let config = GatekeeperConfig::builder()
            .total_capacity_units(total)
            .reserve_units(reserve)
            .headroom_pct(0.0)
            .build();
        let engine = SchedulingEngine::builder(config).metrics(provider.clone()).build();
        (engine, provider)
    }

    // S1 — simple happy path.
    #[tokio::test]
    async fn s1_happy_path() {
        let (engine, _p) = engine_with_capacity(100, 5);
        let job = engine.submit(spec(10, Priority::Normal)).await;
        assert_eq!(job.state, JobState::Queued);

        let outcome = engine.request_lease("w1", None).await;
        let (lease, job) = match outcome {
            LeaseOutcome::Granted { lease, job } => (lease, job),
            other => panic!("expected grant, got {other:?}"),
        };
        assert_eq!(lease.capacity_units, 10);
        assert_eq!(job.state, JobState::Leased);

        let snap = engine.snapshot().await;
        assert_eq!(snap.usable_units, 95);
        assert_eq!(snap.leased_units, 10);
        assert_eq!(snap.available_units, 85);

        engine.heartbeat(lease.lease_id, "w1").await.unwrap();
        engine.complete(lease.lease_id, "w1", CompletionStatus::Completed).await.unwrap();

        let snap = engine.snapshot().await;
        assert_eq!(snap.leased_units, 0);
    }

    // S2 — capacity denial with retry, oversized job doesn't block smaller
    // higher-priority job.
    #[tokio::test]
    async fn s2_oversized_head_of_line_does_not_block() {
        let (engine, _p) = engine_with_capacity(100, 5);
        engine.submit(spec(200, Priority::Normal)).await;

        let denied = engine.request_lease("w1", None).await;
        match denied {
            LeaseOutcome::Denied { reason, retry_after_ms } => {
                assert!(reason.contains("200"));
                assert_eq!(retry_after_ms, 2000);
            }
            other => panic!("expected denial, got {other:?}"),
        }

        engine.submit(spec(20, Priority::High)).await;
        let granted = engine.request_lease("w1", None).await;
        match granted {
            LeaseOutcome::Granted { job, .. } => assert_eq!(job.priority, Priority::High),
            other => panic!("expected grant, got {other:?}"),
        }
    }

    // S3 — expiry.
    #[tokio::test]
    async fn s3_expiry_reclaims_capacity() {
        let provider = Arc::new(InMemoryMetricsProvider::new());
        force_busy(&provider, 0);
        let config = GatekeeperConfig::builder()
            .total_capacity_units(100)
            .reserve_units(5)
            .lease_ttl_s(0)
            .heartbeat_grace_s(0)
            .build();
        let engine = SchedulingEngine::builder(config).metrics(provider).build();

        engine.submit(spec(10, Priority::Normal)).await;
        let granted = engine.request_lease("w1", None).await;
        let lease_id = match granted {
            LeaseOutcome::Granted { lease, .. } => lease.lease_id,
            other => panic!("expected grant, got {other:?}"),
        };

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        engine.expire_tick().await;

        let snap = engine.snapshot().await;
        assert_eq!(snap.active_leases, 0);

        // Further heartbeats against the expired lease are NotFound.
        let err = engine.heartbeat(lease_id, "w1").await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound { .. }));
    }

    // S4 — idempotency.
    #[tokio::test]
    async fn s4_idempotent_submit() {
        let (engine, _p) = engine_with_capacity(100, 5);
        let mut spec_a = spec(5, Priority::Normal);
        spec_a.idempotency_key = Some("k1".to_string());
        let mut spec_b = spec(5, Priority::Normal);
        spec_b.idempotency_key = Some("k1".to_string());

        let job_a = engine.submit(spec_a).await;
        let job_b = engine.submit(spec_b).await;
        assert_eq!(job_a.job_id, job_b.job_id);

        let snap = engine.snapshot().await;
        let total_queued: usize = snap.queue_depths.values().sum();
        assert_eq!(total_queued, 1);

        let granted = engine.request_lease("w1", None).await;
        assert!(matches!(granted, LeaseOutcome::Granted { .. }));
        let snap = engine.snapshot().await;
        let total_queued: usize = snap.queue_depths.values().sum();
        assert_eq!(total_queued, 0);
    }

    // S5 — fail-closed.
    #[tokio::test]
    async fn s5_fail_closed_when_metrics_absent() {
        let provider = Arc::new(InMemoryMetricsProvider::new());
        // No snapshot set: both host and api are None -> fail closed to 8.
        let config = GatekeeperConfig::builder().total_capacity_units(100).reserve_units(5).build();
        let engine = SchedulingEngine::builder(config).metrics(provider).build();

        let snap = engine.snapshot().await;
        assert_eq!(snap.busy_rating, 8);
        assert_eq!(snap.usable_units, 10);

        engine.submit(spec(20, Priority::Normal)).await;
        let denied = engine.request_lease("w1", None).await;
        assert!(matches!(denied, LeaseOutcome::Denied { .. }));

        engine.submit(spec(5, Priority::High)).await;
        let granted = engine.request_lease("w1", None).await;
        assert!(matches!(granted, LeaseOutcome::Granted { .. }));
    }

    // S6 — per-owner cap.
    #[tokio::test]
    async fn s6_per_owner_cap() {
        let provider = Arc::new(InMemoryMetricsProvider::new());
        force_busy(&provider, 0);
        let config = GatekeeperConfig::builder()
            .total_capacity_units(100)
            .reserve_units(0)
            .max_active_leases_per_owner(Some(1))
            .build();
        let engine = SchedulingEngine::builder(config).metrics(provider).build();

        let mut a1 = spec(5, Priority::Normal);
        a1.tags = vec!["owner:a".to_string()];
        let mut a2 = spec(5, Priority::Normal);
        a2.tags = vec!["owner:a".to_string()];
        let mut b1 = spec(5, Priority::Normal);
        b1.tags = vec!["owner:b".to_string()];

        engine.submit(a1).await;
        engine.submit(a2).await;
        engine.submit(b1).await;

        let first = engine.request_lease("w1", None).await;
        let first_job = match first {
            LeaseOutcome::Granted { job, .. } => job,
            other => panic!("expected grant, got {other:?}"),
        };
        assert_eq!(first_job.owner(), Some("a"));

        // Second request should skip the second `a` job (cap reached) and
        // grant the `b` job instead.
        let second = engine.request_lease("w2", None).await;
        let second_job = match second {
            LeaseOutcome::Granted { job, .. } => job,
            other => panic!("expected grant, got {other:?}"),
        };
        assert_eq!(second_job.owner(), Some("b"));

        let snap = engine.snapshot().await;
        assert_eq!(snap.active_leases, 2);
    }

    #[tokio::test]
    async fn zero_units_job_fails_on_first_scan() {
        let (engine, _p) = engine_with_capacity(100, 5);
        let job = engine.submit(spec(0, Priority::Normal)).await;
        let outcome = engine.request_lease("w1", None).await;
        assert!(matches!(outcome, LeaseOutcome::Denied { .. }));

        // The job itself should now be failed, not requeued forever.
        let snap = engine.snapshot().await;
        let total_queued: usize = snap.queue_depths.values().sum();
        assert_eq!(total_queued, 0);
        let _ = job;
    }

    #[tokio::test]
    async fn unique_flag_prevents_second_concurrent_lease_to_same_worker() {
        let (engine, _p) = engine_with_capacity(100, 0);
        let mut a = spec(5, Priority::Normal);
        a.unique = true;
        let mut b = spec(5, Priority::Normal);
        b.unique = true;

        engine.submit(a).await;
        engine.submit(b).await;

        let first = engine.request_lease("w1", None).await;
        assert!(matches!(first, LeaseOutcome::Granted { .. }));

        // w1 already holds a unique lease; the second unique job should be
        // skipped for w1 specifically, but still grantable to w2.
        let second = engine.request_lease("w2", None).await;
        assert!(matches!(second, LeaseOutcome::Granted { .. }));
    }

    #[tokio::test]
    async fn heartbeat_rejects_worker_mismatch() {
        let (engine, _p) = engine_with_capacity(100, 5);
        engine.submit(spec(10, Priority::Normal)).await;
        let granted = engine.request_lease("w1", None).await;
        let lease_id = match granted {
            LeaseOutcome::Granted { lease, .. } => lease.lease_id,
            other => panic!("expected grant, got {other:?}"),
        };

        let err = engine.heartbeat(lease_id, "w2").await.unwrap_err();
        assert!(matches!(err, EngineError::PermissionDenied { .. }));
    }

    #[tokio::test]
    async fn complete_on_missing_lease_is_idempotent_success() {
        let (engine, _p) = engine_with_capacity(100, 5);
        let random_lease = Uuid::new_v4();
        let result = engine.complete(random_lease, "w1", CompletionStatus::Completed).await;
        assert!(result.is_ok());
    }
}
