//! Persisted job record.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Waiting to be claimed once `available` has passed.
    Enqueued,
    /// Claimed by exactly one worker.
    Dequeued,
    /// Handler succeeded.
    Completed,
    /// Retry budget exhausted.
    Failed,
    /// Handler reported a non-retryable error.
    Cancelled,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Enqueued => "enqueued",
            Self::Dequeued => "dequeued",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Terminal statuses never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "enqueued" => Ok(Self::Enqueued),
            "dequeued" => Ok(Self::Dequeued),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// Audit entry appended on every state transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// When the transition happened.
    pub timestamp: DateTime<Utc>,
    /// The status entered.
    pub status: Status,
    /// Failure or cancellation reason, empty otherwise.
    #[serde(default)]
    pub reason: String,
}

impl Event {
    pub fn new(timestamp: DateTime<Utc>, status: Status, reason: impl Into<String>) -> Self {
        Self {
            timestamp,
            status,
            reason: reason.into(),
        }
    }
}

/// One unit of work as stored in the `jobs` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    /// Name of the task that handles this job.
    pub name: String,
    /// Informational grouping tag; together with `name` it identifies
    /// unique and periodic jobs.
    pub label: String,
    /// Encoded payload.
    pub data: serde_json::Value,
    pub status: Status,
    pub created: DateTime<Utc>,
    /// The job is not claimable before this instant.
    pub available: DateTime<Utc>,
    /// Start of the last or current attempt.
    pub started: Option<DateTime<Utc>>,
    /// End of the last attempt.
    pub ended: Option<DateTime<Utc>>,
    /// Set once when the job reaches a terminal status.
    pub finished: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub events: Vec<Event>,
    /// Encoded handler result, only for completed jobs.
    pub result: Option<serde_json::Value>,
    /// Last retryable failure.
    pub error: Option<String>,
    /// Cancellation reason.
    pub reason: Option<String>,
}

impl Job {
    /// Build a fresh `enqueued` job.
    pub fn new(
        name: impl Into<String>,
        label: impl Into<String>,
        data: serde_json::Value,
        created: DateTime<Utc>,
        available: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            label: label.into(),
            data,
            status: Status::Enqueued,
            created,
            available,
            started: None,
            ended: None,
            finished: None,
            attempts: 0,
            events: vec![Event::new(created, Status::Enqueued, "")],
            result: None,
            error: None,
            reason: None,
        }
    }

    /// Whether the job could be claimed at `now`.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.status == Status::Enqueued && self.available <= now
    }
}

/// `now + delay`, or `None` if the result is not representable.
pub fn offset(now: DateTime<Utc>, delay: Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
}

/// `now - age`, saturating at the earliest representable instant.
pub fn before(now: DateTime<Utc>, age: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|d| now.checked_sub_signed(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_job_is_enqueued_with_creation_event() {
        let now = Utc::now();
        let job = Job::new("mail", "", serde_json::json!({"to": "a"}), now, now);
        assert_eq!(job.status, Status::Enqueued);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.events.len(), 1);
        assert_eq!(job.events[0].status, Status::Enqueued);
        assert!(job.started.is_none());
        assert!(job.finished.is_none());
    }

    #[test]
    fn eligibility_respects_available() {
        let now = Utc::now();
        let later = offset(now, Duration::from_secs(10)).unwrap();
        let job = Job::new("mail", "", serde_json::Value::Null, now, later);
        assert!(!job.is_eligible(now));
        assert!(job.is_eligible(later));
    }

    #[test]
    fn status_roundtrip() {
        for status in [
            Status::Enqueued,
            Status::Dequeued,
            Status::Completed,
            Status::Failed,
            Status::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<Status>().unwrap(), status);
        }
        assert!("running".parse::<Status>().is_err());
    }

    #[test]
    fn status_serde_matches_db_strings() {
        let json = serde_json::to_string(&Status::Dequeued).unwrap();
        assert_eq!(json, "\"dequeued\"");
    }

    #[test]
    fn offset_overflow_is_none() {
        assert!(offset(Utc::now(), Duration::from_secs(u64::MAX)).is_none());
        assert_eq!(
            before(Utc::now(), Duration::from_secs(u64::MAX)),
            DateTime::<Utc>::MIN_UTC
        );
    }
}
