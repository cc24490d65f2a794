//! Task definitions: binding a job name to a payload type and a handler.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use uuid::Uuid;

use crate::codec;
use crate::error::{CodecError, ConfigError, HandlerError};
use crate::job::Job;
use crate::queue::Blueprint;

const DEFAULT_WORKERS: usize = 2;
const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_LIFETIME: Duration = Duration::from_secs(300);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_JITTER: Duration = Duration::from_millis(100);

/// What a handler sees for one attempt.
#[derive(Debug, Clone)]
pub struct Context<M> {
    /// The decoded payload.
    pub model: M,
    pub id: Uuid,
    pub name: String,
    pub label: String,
    /// 1-based attempt number.
    pub attempt: u32,
    /// When this attempt was claimed.
    pub started: DateTime<Utc>,
}

/// Delay policy for rescheduling retryable failures.
///
/// The delay after attempt `n` is `min * factor^(n-1)`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub min: Duration,
    pub max: Duration,
    pub factor: f64,
}

impl Backoff {
    /// The same delay after every attempt.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            min: delay,
            max: delay,
            factor: 1.0,
        }
    }

    pub fn exponential(min: Duration, max: Duration, factor: f64) -> Self {
        Self { min, max, factor }
    }

    /// Delay before the attempt following attempt number `attempt`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.min.as_secs_f64() * self.factor.powi(exp);
        if !secs.is_finite() || secs >= self.max.as_secs_f64() {
            return self.max;
        }
        Duration::from_secs_f64(secs).max(self.min)
    }

    fn validate(&self, task: &str) -> Result<(), ConfigError> {
        let invalid = |message: &str| ConfigError::InvalidValue {
            key: format!("{task}.backoff"),
            message: message.to_string(),
        };
        if self.min.is_zero() {
            return Err(invalid("minimum delay must be greater than zero"));
        }
        if self.max < self.min {
            return Err(invalid("maximum delay is below the minimum"));
        }
        if !self.factor.is_finite() || self.factor < 1.0 {
            return Err(invalid("factor must be a finite number >= 1"));
        }
        Ok(())
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::exponential(Duration::from_secs(1), Duration::from_secs(300), 2.0)
    }
}

/// Periodic scheduling: keep one job built from `blueprint` around, and
/// create the next one `every` after the previous one finished.
#[derive(Debug, Clone)]
pub struct Periodic {
    pub every: Duration,
    pub blueprint: Blueprint,
}

type BoxedHandler =
    Arc<dyn Fn(Job) -> BoxFuture<'static, Result<serde_json::Value, HandlerError>> + Send + Sync>;

type PayloadCheck = Arc<dyn Fn(&serde_json::Value) -> Result<(), CodecError> + Send + Sync>;

/// A named kind of job with its handler and execution settings.
pub struct Task {
    name: String,
    handler: BoxedHandler,
    check_payload: PayloadCheck,
    workers: usize,
    max_attempts: u32,
    lifetime: Duration,
    backoff: Backoff,
    poll_interval: Duration,
    jitter: Duration,
    periodic: Option<Periodic>,
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("workers", &self.workers)
            .field("max_attempts", &self.max_attempts)
            .field("lifetime", &self.lifetime)
            .field("backoff", &self.backoff)
            .field("periodic", &self.periodic)
            .finish_non_exhaustive()
    }
}

impl Task {
    /// Create a task whose jobs carry a payload of type `M`.
    ///
    /// The handler's `Ok` value is encoded and stored as the job result.
    pub fn new<M, R, F, Fut>(name: impl Into<String>, handler: F) -> Self
    where
        M: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(Context<M>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, HandlerError>> + Send + 'static,
    {
        let handler = Arc::new(handler);

        let boxed: BoxedHandler = Arc::new(
            move |job: Job| -> BoxFuture<'static, Result<serde_json::Value, HandlerError>> {
                let handler = Arc::clone(&handler);
                Box::pin(async move {
                    let model: M = codec::decode(&job.data)?;
                    let ctx = Context {
                        model,
                        id: job.id,
                        name: job.name,
                        label: job.label,
                        attempt: job.attempts,
                        started: job.started.unwrap_or_else(Utc::now),
                    };
                    let result = handler(ctx).await?;
                    Ok(codec::encode(&result)?)
                })
            },
        );

        Self {
            name: name.into(),
            handler: boxed,
            check_payload: Arc::new(|data: &serde_json::Value| codec::decode::<M>(data).map(|_| ())),
            workers: DEFAULT_WORKERS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            lifetime: DEFAULT_LIFETIME,
            backoff: Backoff::default(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            jitter: DEFAULT_JITTER,
            periodic: None,
        }
    }

    /// Number of concurrent worker loops.
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Total attempts before a retryable failure becomes `failed`.
    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// How long a claim may stay `dequeued` before the reaper requeues it.
    pub fn lifetime(mut self, lifetime: Duration) -> Self {
        self.lifetime = lifetime;
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// How long an idle worker waits before polling again.
    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Maximum random delay added to each idle wait, to spread out polls of
    /// workers that went idle together.
    pub fn jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Schedule a job from `blueprint` every `every`.
    pub fn periodic(mut self, every: Duration, blueprint: Blueprint) -> Self {
        self.periodic = Some(Periodic { every, blueprint });
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn worker_count(&self) -> usize {
        self.workers
    }

    pub fn max_attempt_count(&self) -> u32 {
        self.max_attempts
    }

    pub fn lifetime_limit(&self) -> Duration {
        self.lifetime
    }

    pub fn backoff_policy(&self) -> &Backoff {
        &self.backoff
    }

    pub fn poll_delay(&self) -> Duration {
        self.poll_interval
    }

    pub fn jitter_limit(&self) -> Duration {
        self.jitter
    }

    pub fn periodic_schedule(&self) -> Option<&Periodic> {
        self.periodic.as_ref()
    }

    /// Check the configuration before the task is started.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field: &str, message: &str| ConfigError::InvalidValue {
            key: format!("{}.{field}", self.name),
            message: message.to_string(),
        };

        if self.name.is_empty() {
            return Err(ConfigError::EmptyTaskName);
        }
        if self.workers == 0 {
            return Err(invalid("workers", "must be at least 1"));
        }
        if self.max_attempts == 0 {
            return Err(invalid("max_attempts", "must be at least 1"));
        }
        if self.lifetime.is_zero() {
            return Err(invalid("lifetime", "must be greater than zero"));
        }
        if self.poll_interval.is_zero() {
            return Err(invalid("poll_interval", "must be greater than zero"));
        }
        self.backoff.validate(&self.name)?;

        if let Some(periodic) = &self.periodic {
            if periodic.every.is_zero() {
                return Err(invalid("periodicity", "must be greater than zero"));
            }
            (self.check_payload)(&periodic.blueprint.data).map_err(|e| {
                ConfigError::InvalidBlueprint {
                    name: self.name.clone(),
                    reason: e.to_string(),
                }
            })?;
        }

        Ok(())
    }

    /// Run the handler for a claimed job.
    ///
    /// Decode and encode failures become `HandlerError::Cancel`; a panic in
    /// the handler becomes `HandlerError::Retry`.
    pub(crate) async fn execute(&self, job: Job) -> Result<serde_json::Value, HandlerError> {
        AssertUnwindSafe((self.handler)(job))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(HandlerError::Retry(panic_message(&*panic))))
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("handler panicked: {s}")
    } else {
        "handler panicked".to_string()
    }
}
