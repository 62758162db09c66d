//! Job entity and the terminal/non-terminal state machine.
//!
//! A [`Job`] is a submitted unit of work. It moves through exactly one of
//! the paths described in [`JobState`]; terminal states are absorbing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Dispatch priority. Ordered high to low for queue selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    Normal,
    Low,
    Background,
}

impl Priority {
    /// All priorities in scan order, highest first.
    pub const ORDER: [Priority; 4] = [
        Priority::High,
        Priority::Normal,
        Priority::Low,
        Priority::Background,
    ];
}

/// Position in the job lifecycle. See the state diagram in the scheduling
/// engine module docs: `queued -> leased -> running -> {completed|failed}`,
/// plus `{leased,running} -> expired`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Leased,
    Running,
    Completed,
    Failed,
    Expired,
}

impl JobState {
    /// Terminal states are absorbing; no transition ever leaves them.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed | JobState::Expired)
    }
}

/// A submitted unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: Uuid,
    pub idempotency_key: Option<String>,
    pub job_type: String,
    pub priority: Priority,
    pub tags: Vec<String>,
    pub unique: bool,
    pub requested_units: i64,
    pub state: JobState,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub lease_id: Option<Uuid>,
}

impl Job {
    /// The `owner:<id>` tag value, if present. Used for per-owner lease
    /// caps and history aggregation.
    pub fn owner(&self) -> Option<&str> {
        self.tags.iter().find_map(|t| t.strip_prefix("owner:"))
    }
}

/// Caller-supplied description of a job to submit. Mirrors the Submit
/// operation's input shape (type, priority, units, payload, optional
/// idempotency key, tags, unique flag).
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub idempotency_key: Option<String>,
    pub job_type: String,
    pub priority: Priority,
    pub tags: Vec<String>,
    pub unique: bool,
    pub requested_units: i64,
    pub payload: Value,
}

impl JobSpec {
    pub fn new(job_type: impl Into<String>, priority: Priority, requested_units: i64) -> Self {
        Self {
            idempotency_key: None,
            job_type: job_type.into(),
            priority,
            tags: Vec::new(),
            unique: false,
            requested_units,
            payload: Value::Null,
        }
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_unique(mut self, unique: bool) -> Self {
        self.unique = unique;
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owner_tag_is_parsed() {
        let job = Job {
            job_id: Uuid::nil(),
            idempotency_key: None,
            job_type: "t".into(),
            priority: Priority::Normal,
            tags: vec!["owner:acme".into(), "misc".into()],
            unique: false,
            requested_units: 1,
            state: JobState::Queued,
            payload: Value::Null,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            lease_id: None,
        };
        assert_eq!(job.owner(), Some("acme"));
    }

    #[test]
    fn terminal_states() {
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(JobState::Expired.is_terminal());
        assert!(!JobState::Queued.is_terminal());
        assert!(!JobState::Leased.is_terminal());
        assert!(!JobState::Running.is_terminal());
    }
}
