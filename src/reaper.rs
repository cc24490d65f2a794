//! Reaper: requeues jobs whose claim outlived the task lifetime and keeps
//! periodic jobs scheduled.
//!
//! Workers that crash or get aborted leave their job `dequeued`. Once the
//! attempt is older than the task's lifetime it is moved back to `enqueued`
//! so another worker can pick it up. The attempt still counts, but requeueing
//! ignores `max_attempts`, which only applies to outcomes a handler reports.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::job::model::before;
use crate::queue::Queue;
use crate::task::Task;

pub struct Reaper {
    queue: Queue,
    tasks: Vec<Arc<Task>>,
    interval: Duration,
}

impl Reaper {
    pub fn new(queue: Queue, tasks: Vec<Arc<Task>>, interval: Duration) -> Self {
        Self {
            queue,
            tasks,
            interval,
        }
    }

    /// Spawn the sweep loop. The first sweep runs immediately.
    pub fn spawn(self, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(interval = ?self.interval, "Reaper started");

            let mut tick = tokio::time::interval(self.interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tick.tick() => self.sweep(Utc::now()).await,
                }
            }

            info!("Reaper stopped");
        })
    }

    /// One pass over every task: recover stale claims, then insert due
    /// periodic jobs. Errors are logged and the next sweep tries again.
    pub async fn sweep(&self, now: DateTime<Utc>) {
        for task in &self.tasks {
            self.recover(task, now).await;
            self.schedule(task).await;
        }
    }

    async fn recover(&self, task: &Task, now: DateTime<Utc>) {
        let cutoff = before(now, task.lifetime_limit());
        match self
            .queue
            .store()
            .requeue_stale_jobs(task.name(), cutoff, now)
            .await
        {
            Ok(ids) if ids.is_empty() => {}
            Ok(ids) => {
                for id in &ids {
                    info!(job.id = %id, job.name = %task.name(), "Requeued job after lifetime exceeded");
                }
                info!(job.name = %task.name(), count = ids.len(), "Recovered stale jobs");
            }
            Err(e) => warn!(job.name = %task.name(), error = %e, "Failed to requeue stale jobs"),
        }
    }

    async fn schedule(&self, task: &Task) {
        let Some(periodic) = task.periodic_schedule() else {
            return;
        };

        match self
            .queue
            .enqueue_blueprint(task.name(), &periodic.blueprint, Some(periodic.every))
            .await
        {
            Ok(Some(job)) => debug!(job.id = %job.id, job.name = %task.name(), "Periodic job scheduled"),
            Ok(None) => {}
            Err(e) => warn!(job.name = %task.name(), error = %e, "Failed to schedule periodic job"),
        }
    }
}
