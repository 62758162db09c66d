//! Lease entity and the read-only scheduler snapshot.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::job::Priority;

/// An exclusive, time-bounded right to execute one job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lease {
    pub lease_id: Uuid,
    pub job_id: Uuid,
    pub worker_id: String,
    pub capacity_units: i64,
    pub issued_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// A read-only observation of engine state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSnapshot {
    pub busy_rating: u8,
    pub total_units: i64,
    pub usable_units: i64,
    pub leased_units: i64,
    pub available_units: i64,
    pub queue_depths: HashMap<Priority, usize>,
    pub active_leases: usize,
}
