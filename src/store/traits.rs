//! `JobStore` trait: the only shared mutable resource of the pool.
//!
//! Every method that mutates a job is a single conditional statement keyed on
//! the job's current status. Callers pass `now` explicitly; backends never
//! consult the clock for scheduling decisions.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::job::{Job, Outcome, Status};

/// Backend-agnostic persistence for job records.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Producers ───────────────────────────────────────────────────

    /// Insert a new job.
    async fn insert_job(&self, job: &Job) -> Result<(), DatabaseError>;

    /// Insert `job` unless a job with the same `(name, label)` exists that is
    /// unfinished or finished after `finished_after`. Returns whether the job
    /// was inserted.
    async fn insert_job_if_absent(
        &self,
        job: &Job,
        finished_after: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    // ── Workers ─────────────────────────────────────────────────────

    /// Atomically claim the oldest eligible `enqueued` job of `name`
    /// (`available <= now`, ordered by `available`, then `created`).
    ///
    /// The returned record is already `dequeued` with `attempts` incremented.
    async fn claim_job(&self, name: &str, now: DateTime<Utc>) -> Result<Option<Job>, DatabaseError>;

    /// Apply the outcome of attempt number `attempt`.
    ///
    /// Guarded on `status = dequeued AND attempts = attempt`; returns `false`
    /// when the guard lost (the job was reaped or re-claimed meanwhile).
    async fn finish_attempt(
        &self,
        id: Uuid,
        attempt: u32,
        outcome: &Outcome,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    // ── Reaper ──────────────────────────────────────────────────────

    /// Move `dequeued` jobs of `name` whose attempt started before
    /// `started_before` back to `enqueued`, available at `now`.
    /// Returns the ids of the requeued jobs.
    async fn requeue_stale_jobs(
        &self,
        name: &str,
        started_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, DatabaseError>;

    // ── Inspection and retention ────────────────────────────────────

    /// Get a job by ID.
    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, DatabaseError>;

    /// List jobs of `name`, optionally filtered by status, oldest first.
    async fn list_jobs(&self, name: &str, status: Option<Status>) -> Result<Vec<Job>, DatabaseError>;

    /// Delete a job. Returns whether a row was removed.
    async fn delete_job(&self, id: Uuid) -> Result<bool, DatabaseError>;

    /// Delete finished jobs whose `finished` is before `cutoff`.
    /// Returns the number of jobs deleted.
    async fn delete_finished_before(&self, cutoff: DateTime<Utc>) -> Result<usize, DatabaseError>;
}
