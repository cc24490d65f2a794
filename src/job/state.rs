//! Job state machine.

use chrono::{DateTime, Utc};

use super::model::{Event, Status, offset};
use crate::error::HandlerError;
use crate::task::Backoff;

/// How one execution attempt ended, as applied to the stored record.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// `dequeued → completed`.
    Completed { result: serde_json::Value },
    /// `dequeued → enqueued`, claimable again from `available`.
    Retry {
        error: String,
        available: DateTime<Utc>,
    },
    /// `dequeued → failed`, retry budget exhausted.
    Failed { error: String },
    /// `dequeued → cancelled`, non-retryable error.
    Cancelled { reason: String },
}

impl Outcome {
    /// Decide the transition for an attempt.
    ///
    /// `attempts` is the attempt count after the claim, so the first run
    /// sees `1`.
    pub fn decide(
        result: Result<serde_json::Value, HandlerError>,
        attempts: u32,
        max_attempts: u32,
        backoff: &Backoff,
        now: DateTime<Utc>,
    ) -> Self {
        match result {
            Ok(result) => Self::Completed { result },
            Err(HandlerError::Cancel(reason)) => Self::Cancelled { reason },
            Err(HandlerError::Retry(error)) if attempts >= max_attempts => Self::Failed { error },
            Err(HandlerError::Retry(error)) => Self::Retry {
                error,
                available: offset(now, backoff.delay(attempts))
                    .unwrap_or(DateTime::<Utc>::MAX_UTC),
            },
        }
    }

    /// Status the job enters.
    pub fn status(&self) -> Status {
        match self {
            Self::Completed { .. } => Status::Completed,
            Self::Retry { .. } => Status::Enqueued,
            Self::Failed { .. } => Status::Failed,
            Self::Cancelled { .. } => Status::Cancelled,
        }
    }

    /// Whether the job is done for good.
    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    /// Audit event for this transition.
    pub fn event(&self, now: DateTime<Utc>) -> Event {
        let reason = match self {
            Self::Completed { .. } => "",
            Self::Retry { error, .. } | Self::Failed { error } => error.as_str(),
            Self::Cancelled { reason } => reason.as_str(),
        };
        Event::new(now, self.status(), reason)
    }
}
