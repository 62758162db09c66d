//! Structured error types for the scheduling engine's public operations.
//!
//! [`LeaseOutcome::Denied`] is deliberately *not* part of this enum: capacity
//! starvation and head-of-line denial are normal flow, not errors (see
//! `engine::RequestLease`). `EngineError` covers only the two failure modes
//! that heartbeat/complete can raise.

use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by [`crate::engine::SchedulingEngine`] operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Heartbeat against a lease that no longer exists (expired or never
    /// existed). The worker should treat this as abandonment.
    #[error("lease {lease_id} not found")]
    NotFound { lease_id: Uuid },

    /// The caller's `worker_id` does not match the lease's owner.
    #[error("worker {worker_id} does not hold lease {lease_id}")]
    PermissionDenied { lease_id: Uuid, worker_id: String },
}
