//! Worker loop: claims jobs of one task and runs them to an outcome.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, trace, warn};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::job::Outcome;
use crate::store::JobStore;
use crate::task::Task;

/// One polling loop. A task with `workers = n` gets `n` of these, each on its
/// own lane.
pub(crate) struct Worker {
    task: Arc<Task>,
    store: Arc<dyn JobStore>,
    lane: usize,
}

impl Worker {
    pub(crate) fn new(task: Arc<Task>, store: Arc<dyn JobStore>, lane: usize) -> Self {
        Self { task, store, lane }
    }

    /// Spawn the loop. It exits once `token` is cancelled and no handler is
    /// running.
    pub(crate) fn spawn(self, token: CancellationToken) -> JoinHandle<()> {
        let span = info_span!("worker", task = %self.task.name(), lane = self.lane);
        tokio::spawn(self.run(token).instrument(span))
    }

    async fn run(self, token: CancellationToken) {
        info!("Worker started");

        while !token.is_cancelled() {
            match self.step(&token).await {
                Ok(true) => continue,
                Ok(false) => trace!("No eligible job"),
                Err(e) => error!(error = %e, "Failed to claim job"),
            }

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.idle_delay()) => {}
            }
        }

        info!("Worker stopped");
    }

    /// Claim and process at most one job. Returns whether a job was claimed.
    async fn step(&self, token: &CancellationToken) -> Result<bool, DatabaseError> {
        let Some(job) = self.store.claim_job(self.task.name(), Utc::now()).await? else {
            return Ok(false);
        };

        let id = job.id;
        let attempt = job.attempts;
        let deadline = Instant::now().checked_add(self.task.lifetime_limit());
        debug!(job.id = %id, attempt, "Job claimed");

        let result = self.task.execute(job).await;
        let now = Utc::now();
        let outcome = Outcome::decide(
            result,
            attempt,
            self.task.max_attempt_count(),
            self.task.backoff_policy(),
            now,
        );

        match &outcome {
            Outcome::Completed { .. } => debug!(job.id = %id, attempt, "Job completed"),
            Outcome::Retry { error, available } => {
                warn!(job.id = %id, attempt, %available, error = %error, "Job failed, will retry")
            }
            Outcome::Failed { error } => {
                warn!(job.id = %id, attempt, error = %error, "Job failed, no attempts left")
            }
            Outcome::Cancelled { reason } => {
                debug!(job.id = %id, attempt, reason = %reason, "Job cancelled")
            }
        }

        self.record(id, attempt, &outcome, now, deadline, token).await;
        Ok(true)
    }

    /// Write the outcome of an attempt.
    ///
    /// Store errors are retried every poll interval until the write applies,
    /// the claim is lost, the worker is cancelled or the claim outlives the
    /// task lifetime. In the last two cases the job stays `dequeued` and the
    /// reaper requeues it.
    async fn record(
        &self,
        id: Uuid,
        attempt: u32,
        outcome: &Outcome,
        now: DateTime<Utc>,
        deadline: Option<Instant>,
        token: &CancellationToken,
    ) {
        loop {
            match self.store.finish_attempt(id, attempt, outcome, now).await {
                Ok(true) => return,
                Ok(false) => {
                    warn!(job.id = %id, attempt, "Job was reclaimed before it finished, outcome dropped");
                    return;
                }
                Err(e) => error!(job.id = %id, attempt, error = %e, "Failed to record job outcome"),
            }

            let expired = deadline.is_some_and(|d| Instant::now() >= d);
            if token.is_cancelled() || expired {
                error!(job.id = %id, attempt, "Giving up on job outcome, left for the reaper");
                return;
            }

            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(self.idle_delay()) => {}
            }
        }
    }

    fn idle_delay(&self) -> Duration {
        let jitter = u64::try_from(self.task.jitter_limit().as_millis()).unwrap_or(u64::MAX);
        let extra = if jitter == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter)
        };
        self.task
            .poll_delay()
            .saturating_add(Duration::from_millis(extra))
    }
}
