//! In-memory authoritative state: jobs, leases, idempotency index, four
//! priority queues, and a deduplication set.
//!
//! The store performs no locking of its own. All mutation happens under the
//! single mutex held by [`crate::engine::SchedulingEngine`]; `Store` is a
//! plain value type operated on only from inside that critical section.

use std::collections::{HashMap, HashSet, VecDeque};

use uuid::Uuid;

use crate::job::{Job, Priority};
use crate::lease::Lease;

#[derive(Debug, Default)]
struct Queues {
    high: VecDeque<Uuid>,
    normal: VecDeque<Uuid>,
    low: VecDeque<Uuid>,
    background: VecDeque<Uuid>,
}

impl Queues {
    fn bucket_mut(&mut self, priority: Priority) -> &mut VecDeque<Uuid> {
        match priority {
            Priority::High => &mut self.high,
            Priority::Normal => &mut self.normal,
            Priority::Low => &mut self.low,
            Priority::Background => &mut self.background,
        }
    }

    fn bucket(&self, priority: Priority) -> &VecDeque<Uuid> {
        match priority {
            Priority::High => &self.high,
            Priority::Normal => &self.normal,
            Priority::Low => &self.low,
            Priority::Background => &self.background,
        }
    }
}

/// The engine's authoritative in-memory state.
#[derive(Debug, Default)]
pub struct Store {
    queues: Queues,
    queued_ids: HashSet<Uuid>,
    jobs: HashMap<Uuid, Job>,
    leases: HashMap<Uuid, Lease>,
    idempotency: HashMap<String, Uuid>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent: a no-op if `job_id` is already in the dedup set.
    pub fn enqueue(&mut self, priority: Priority, job_id: Uuid) {
        if self.queued_ids.insert(job_id) {
            self.queues.bucket_mut(priority).push_back(job_id);
        }
    }

    /// Re-queue at the tail of the same priority bucket. Unlike `enqueue`
    /// this bypasses the dedup-set `insert` check since the job never left
    /// the set while it was popped-but-not-yet-committed.
    pub fn requeue_tail(&mut self, priority: Priority, job_id: Uuid) {
        self.queues.bucket_mut(priority).push_back(job_id);
        self.queued_ids.insert(job_id);
    }

    /// Pop the next candidate in strict priority order, oldest-first within
    /// a bucket. The dedup set is cleared for the popped id; callers that
    /// decide to skip it must call [`Store::requeue_tail`] to re-admit it.
    pub fn dequeue_next(&mut self) -> Option<(Priority, Uuid)> {
        for priority in Priority::ORDER {
            if let Some(job_id) = self.queues.bucket_mut(priority).pop_front() {
                self.queued_ids.remove(&job_id);
                return Some((priority, job_id));
            }
        }
        None
    }

    pub fn queue_depths(&self) -> HashMap<Priority, usize> {
        Priority::ORDER
            .into_iter()
            .map(|p| (p, self.queues.bucket(p).len()))
            .collect()
    }

    pub fn total_queued(&self) -> usize {
        Priority::ORDER.into_iter().map(|p| self.queues.bucket(p).len()).sum()
    }

    pub fn insert_job(&mut self, job: Job) {
        if let Some(key) = &job.idempotency_key {
            self.idempotency.insert(key.clone(), job.job_id);
        }
        self.jobs.insert(job.job_id, job);
    }

    pub fn job_by_idempotency_key(&self, key: &str) -> Option<&Job> {
        self.idempotency.get(key).and_then(|id| self.jobs.get(id))
    }

    pub fn job(&self, job_id: Uuid) -> Option<&Job> {
        self.jobs.get(&job_id)
    }

    pub fn job_mut(&mut self, job_id: Uuid) -> Option<&mut Job> {
        self.jobs.get_mut(&job_id)
    }

    pub fn insert_lease(&mut self, lease: Lease) {
        self.leases.insert(lease.lease_id, lease);
    }

    pub fn lease(&self, lease_id: Uuid) -> Option<&Lease> {
        self.leases.get(&lease_id)
    }

    pub fn lease_mut(&mut self, lease_id: Uuid) -> Option<&mut Lease> {
        self.leases.get_mut(&lease_id)
    }

    pub fn remove_lease(&mut self, lease_id: Uuid) -> Option<Lease> {
        self.leases.remove(&lease_id)
    }

    pub fn leases(&self) -> impl Iterator<Item = &Lease> {
        self.leases.values()
    }

    pub fn active_lease_count(&self) -> usize {
        self.leases.len()
    }

    pub fn leases_for_worker(&self, worker_id: &str) -> impl Iterator<Item = &Lease> {
        self.leases.values().filter(move |l| l.worker_id == worker_id)
    }

    /// Active lease count per `owner:<id>` tag, keyed by owner id. Jobs
    /// without an owner tag are not counted toward any cap.
    pub fn active_leases_per_owner(&self) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for lease in self.leases.values() {
            if let Some(job) = self.jobs.get(&lease.job_id) {
                if let Some(owner) = job.owner() {
                    *counts.entry(owner.to_string()).or_insert(0) += 1;
                }
            }
        }
        counts
    }

    pub fn sum_leased_units(&self) -> i64 {
        self.leases.values().map(|l| l.capacity_units).sum()
    }
}
