//! Queue: producer API for inserting jobs.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info};

use crate::codec;
use crate::error::{CodecError, EnqueueError};
use crate::job::Job;
use crate::job::model::{before, offset};
use crate::store::JobStore;

/// Template for a job: label, encoded payload and start delay.
///
/// Used for periodic jobs and for producers that enqueue the same kind of
/// job repeatedly under a stable `(name, label)` identity.
#[derive(Debug, Clone, PartialEq)]
pub struct Blueprint {
    pub label: String,
    pub data: serde_json::Value,
    pub delay: Duration,
}

impl Blueprint {
    /// Encode `payload` into a blueprint with the given label.
    pub fn new<M: Serialize>(label: impl Into<String>, payload: &M) -> Result<Self, CodecError> {
        Ok(Self {
            label: label.into(),
            data: codec::encode(payload)?,
            delay: Duration::ZERO,
        })
    }

    /// Delay the job's availability after insertion.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// Inserts jobs into the store. Cheap to clone.
#[derive(Clone)]
pub struct Queue {
    store: Arc<dyn JobStore>,
}

impl Queue {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Enqueue a job for the task `name`, claimable once `delay` has passed.
    ///
    /// Returns the stored record. Workers discover it by polling.
    pub async fn enqueue<M: Serialize>(
        &self,
        name: &str,
        payload: &M,
        delay: Duration,
    ) -> Result<Job, EnqueueError> {
        let blueprint = Blueprint::new("", payload)?.with_delay(delay);
        let job = self.build(name, &blueprint)?;
        self.store.insert_job(&job).await?;

        debug!(job.id = %job.id, job.name = %job.name, ?delay, "Job enqueued");
        Ok(job)
    }

    /// Enqueue a job from a blueprint.
    ///
    /// With `isolation`, the insert only happens if no job with the same
    /// name and label is pending or finished within `isolation`; `Ok(None)`
    /// means an existing job suppressed the insert.
    pub async fn enqueue_blueprint(
        &self,
        name: &str,
        blueprint: &Blueprint,
        isolation: Option<Duration>,
    ) -> Result<Option<Job>, EnqueueError> {
        let job = self.build(name, blueprint)?;

        match isolation {
            None => {
                self.store.insert_job(&job).await?;
            }
            Some(window) => {
                let inserted = self
                    .store
                    .insert_job_if_absent(&job, before(job.created, window))
                    .await?;
                if !inserted {
                    debug!(job.name = %name, label = %blueprint.label, "Blueprint job already present");
                    return Ok(None);
                }
            }
        }

        info!(job.id = %job.id, job.name = %job.name, label = %job.label, "Blueprint job enqueued");
        Ok(Some(job))
    }

    fn build(&self, name: &str, blueprint: &Blueprint) -> Result<Job, EnqueueError> {
        if name.is_empty() {
            return Err(EnqueueError::EmptyName);
        }

        let now = Utc::now();
        let available =
            offset(now, blueprint.delay).ok_or(EnqueueError::InvalidDelay(blueprint.delay))?;

        Ok(Job::new(
            name,
            blueprint.label.clone(),
            blueprint.data.clone(),
            now,
            available,
        ))
    }
}
