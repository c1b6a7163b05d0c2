//! Job records and the in-memory store.
//!
//! A job is visible from the moment it is enqueued. Records are
//! mutated only through store methods (the owning worker after
//! dequeue, the service at creation/cancellation) and terminal
//! records are pruned lazily after a bounded TTL. Every mutation is
//! mirrored to `jobs/<job_id>.json` atomically by the caller.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;
use std::time::Duration;

use acore_core::{TaskSpec, Verdict};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a job (random, opaque, 32 hex chars).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    /// Creates a new random job id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parses a job id from its hex form.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        Uuid::parse_str(raw).ok().map(Self)
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Job lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Accepted, waiting for a worker.
    Queued,
    /// Owned by a worker, VM running.
    Running,
    /// Terminal: verdict passed.
    Done,
    /// Terminal: verdict failed or the run broke.
    Failed,
    /// Terminal: cancelled before or during execution.
    Cancelled,
}

impl JobStatus {
    /// True for terminal states.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Cancelled)
    }
}

/// One job record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    /// Job id.
    pub job_id: JobId,
    /// Caller-supplied task id, when present.
    pub task_id: Option<String>,
    /// Lifecycle state.
    pub status: JobStatus,
    /// Monotonic FIFO tie-break among equal enqueue timestamps.
    pub seq: u64,
    /// Enqueue timestamp.
    pub enqueued_at: DateTime<Utc>,
    /// Set when a worker takes ownership.
    pub started_at: Option<DateTime<Utc>>,
    /// Set on any terminal transition.
    pub finished_at: Option<DateTime<Utc>>,
    /// The immutable task spec.
    pub task_spec: TaskSpec,
    /// Stored submission archive.
    pub submission_path: PathBuf,
    /// Job log file.
    pub log_path: PathBuf,
    /// Final verdict, once terminal.
    pub result: Option<Verdict>,
    /// Error outside the verdict (setup failure, cancellation cause).
    pub error: Option<String>,
    /// Bounded tail of the job log.
    pub log_tail: Option<String>,
    /// TAP device, only while running.
    pub tap_device: Option<String>,
}

/// In-memory job store with TTL pruning and a task index.
#[derive(Debug, Default)]
pub struct JobStore {
    jobs: RwLock<HashMap<JobId, JobRecord>>,
    seq: std::sync::atomic::AtomicU64,
}

impl JobStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Next monotonic sequence number.
    pub fn next_seq(&self) -> u64 {
        self.seq
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
    }

    /// Inserts a freshly queued record.
    ///
    /// # Panics
    ///
    /// Panics if the lock is poisoned.
    pub fn insert(&self, record: JobRecord) {
        self.jobs
            .write()
            .expect("job store lock")
            .insert(record.job_id, record);
    }

    /// Removes a record outright (submission was rejected after the
    /// record was created).
    pub fn remove(&self, job_id: JobId) {
        self.jobs.write().expect("job store lock").remove(&job_id);
    }

    /// Clone-out read of one record.
    #[must_use]
    pub fn get(&self, job_id: JobId) -> Option<JobRecord> {
        self.jobs
            .read()
            .expect("job store lock")
            .get(&job_id)
            .cloned()
    }

    /// Applies a mutation to one record and returns the updated copy.
    pub fn update<F>(&self, job_id: JobId, mutate: F) -> Option<JobRecord>
    where
        F: FnOnce(&mut JobRecord),
    {
        let mut jobs = self.jobs.write().expect("job store lock");
        let record = jobs.get_mut(&job_id)?;
        mutate(record);
        Some(record.clone())
    }

    /// All records currently queued or running.
    #[must_use]
    pub fn active(&self) -> Vec<JobRecord> {
        let mut active: Vec<JobRecord> = self
            .jobs
            .read()
            .expect("job store lock")
            .values()
            .filter(|r| !r.status.is_terminal())
            .cloned()
            .collect();
        active.sort_by_key(|r| r.seq);
        active
    }

    /// All records filed under a task id, in submission order.
    #[must_use]
    pub fn by_task(&self, task_id: &str) -> Vec<JobRecord> {
        let mut matches: Vec<JobRecord> = self
            .jobs
            .read()
            .expect("job store lock")
            .values()
            .filter(|r| r.task_id.as_deref() == Some(task_id))
            .cloned()
            .collect();
        matches.sort_by_key(|r| r.seq);
        matches
    }

    /// Drops terminal records older than `ttl`.
    pub fn prune(&self, ttl: Duration) {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::hours(24));
        self.jobs.write().expect("job store lock").retain(|_, r| {
            !(r.status.is_terminal() && r.finished_at.is_some_and(|t| t < cutoff))
        });
    }
}
