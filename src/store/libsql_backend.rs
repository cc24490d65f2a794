//! libSQL backend: async `JobStore` implementation.
//!
//! Supports local file and in-memory databases. Every mutation is a single
//! SQL statement, so SQLite's write serialization is what makes claims and
//! conditional updates atomic across tasks, connections and processes.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, SecondsFormat, Utc};
use libsql::params::Params;
use libsql::{Connection, Database as LibSqlDatabase, Value, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::job::{Event, Job, Outcome, Status};
use crate::store::migrations;
use crate::store::traits::JobStore;

/// How long a connection waits on a locked database file before failing.
const BUSY_TIMEOUT_MS: u64 = 5_000;

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        // Several processes may share the file; wait for the writer lock
        // instead of failing claims outright.
        pragma(&conn, &format!("PRAGMA busy_timeout = {BUSY_TIMEOUT_MS}")).await?;
        pragma(&conn, "PRAGMA journal_mode = WAL").await?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        info!(path = %path.display(), "Job database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Run a PRAGMA that may return a row.
async fn pragma(conn: &Connection, sql: &str) -> Result<(), DatabaseError> {
    let mut rows = conn
        .query(sql, ())
        .await
        .map_err(|e| DatabaseError::Pool(format!("{sql}: {e}")))?;
    while let Ok(Some(_)) = rows.next().await {}
    Ok(())
}

/// Canonical timestamp format. Fixed width, so text comparison in SQL
/// orders the same as time.
fn fmt_ts(dt: DateTime<Utc>) -> String {
    match dt.year() {
        y if y < 1 => "0001-01-01T00:00:00.000000Z".to_string(),
        y if y > 9999 => "9999-12-31T23:59:59.999999Z".to_string(),
        _ => dt.to_rfc3339_opts(SecondsFormat::Micros, true),
    }
}

/// Parse an RFC 3339 timestamp as written by `fmt_ts`.
fn parse_ts(s: &str) -> Result<DateTime<Utc>, DatabaseError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DatabaseError::Serialization(format!("bad timestamp {s:?}: {e}")))
}

fn parse_optional_ts(s: Option<String>) -> Result<Option<DateTime<Utc>>, DatabaseError> {
    s.as_deref().map(parse_ts).transpose()
}

fn parse_json(column: &str, s: &str) -> Result<serde_json::Value, DatabaseError> {
    serde_json::from_str(s)
        .map_err(|e| DatabaseError::Serialization(format!("bad {column} column: {e}")))
}

fn event_json(event: &Event) -> Result<String, DatabaseError> {
    serde_json::to_string(event).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

/// Convert `Option<String>` to libsql Value.
fn opt_text_owned(s: Option<String>) -> Value {
    match s {
        Some(s) => Value::Text(s),
        None => Value::Null,
    }
}

fn opt_ts(dt: Option<DateTime<Utc>>) -> Value {
    opt_text_owned(dt.map(fmt_ts))
}

/// Map a libsql Row to a Job.
///
/// Column order matches JOB_COLUMNS.
fn row_to_job(row: &libsql::Row) -> Result<Job, DatabaseError> {
    let get = |idx: i32| -> Result<String, DatabaseError> {
        row.get::<String>(idx)
            .map_err(|e| DatabaseError::Query(format!("job column {idx}: {e}")))
    };
    let get_opt = |idx: i32| -> Result<Option<String>, DatabaseError> {
        match row
            .get_value(idx)
            .map_err(|e| DatabaseError::Query(format!("job column {idx}: {e}")))?
        {
            Value::Null => Ok(None),
            Value::Text(s) => Ok(Some(s)),
            other => Err(DatabaseError::Serialization(format!(
                "job column {idx}: expected text or NULL, got {other:?}"
            ))),
        }
    };

    let id_str = get(0)?;
    let status_str = get(4)?;
    let attempts: i64 = row
        .get(10)
        .map_err(|e| DatabaseError::Query(format!("job column attempts: {e}")))?;
    let events: Vec<Event> = serde_json::from_str(&get(11)?)
        .map_err(|e| DatabaseError::Serialization(format!("bad events column: {e}")))?;

    Ok(Job {
        id: Uuid::parse_str(&id_str)
            .map_err(|e| DatabaseError::Serialization(format!("bad job id {id_str:?}: {e}")))?,
        name: get(1)?,
        label: get(2)?,
        data: parse_json("data", &get(3)?)?,
        status: status_str.parse().map_err(DatabaseError::Serialization)?,
        created: parse_ts(&get(5)?)?,
        available: parse_ts(&get(6)?)?,
        started: parse_optional_ts(get_opt(7)?)?,
        ended: parse_optional_ts(get_opt(8)?)?,
        finished: parse_optional_ts(get_opt(9)?)?,
        attempts: u32::try_from(attempts).map_err(|_| {
            DatabaseError::Serialization(format!("bad attempts column: {attempts}"))
        })?,
        events,
        result: get_opt(12)?.map(|s| parse_json("result", &s)).transpose()?,
        error: get_opt(13)?,
        reason: get_opt(14)?,
    })
}

/// Positional values for an insert, in JOB_COLUMNS order.
fn job_values(job: &Job) -> Result<Vec<Value>, DatabaseError> {
    let events = serde_json::to_string(&job.events)
        .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
    Ok(vec![
        Value::Text(job.id.to_string()),
        Value::Text(job.name.clone()),
        Value::Text(job.label.clone()),
        Value::Text(job.data.to_string()),
        Value::Text(job.status.as_str().to_string()),
        Value::Text(fmt_ts(job.created)),
        Value::Text(fmt_ts(job.available)),
        opt_ts(job.started),
        opt_ts(job.ended),
        opt_ts(job.finished),
        Value::Integer(i64::from(job.attempts)),
        Value::Text(events),
        opt_text_owned(job.result.as_ref().map(|r| r.to_string())),
        opt_text_owned(job.error.clone()),
        opt_text_owned(job.reason.clone()),
    ])
}

/// Collect all rows of a job query.
async fn collect_jobs(mut rows: libsql::Rows, op: &str) -> Result<Vec<Job>, DatabaseError> {
    let mut jobs = Vec::new();
    while let Some(row) = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?
    {
        jobs.push(row_to_job(&row)?);
    }
    Ok(jobs)
}

// ── Trait implementation ────────────────────────────────────────────

const JOB_COLUMNS: &str = "id, name, label, data, status, created, available, started, ended, finished, attempts, events, result, error, reason";

const JOB_PLACEHOLDERS: &str = "?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15";

/// Appends the JSON event bound at `?1` to the events array.
const APPEND_EVENT: &str = "events = json_insert(events, '$[#]', json(?1))";

#[async_trait]
impl JobStore for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Producers ───────────────────────────────────────────────────

    async fn insert_job(&self, job: &Job) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                &format!("INSERT INTO jobs ({JOB_COLUMNS}) VALUES ({JOB_PLACEHOLDERS})"),
                Params::Positional(job_values(job)?),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_job: {e}")))?;

        debug!(job.id = %job.id, job.name = %job.name, "Job inserted");
        Ok(())
    }

    async fn insert_job_if_absent(
        &self,
        job: &Job,
        finished_after: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let mut values = job_values(job)?;
        values.push(Value::Text(fmt_ts(finished_after)));

        // ?2 and ?3 are the job's name and label.
        let inserted = self
            .conn()
            .execute(
                &format!(
                    "INSERT INTO jobs ({JOB_COLUMNS}) SELECT {JOB_PLACEHOLDERS} \
                     WHERE NOT EXISTS ( \
                         SELECT 1 FROM jobs WHERE name = ?2 AND label = ?3 \
                         AND (finished IS NULL OR finished > ?16) \
                     )"
                ),
                Params::Positional(values),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_job_if_absent: {e}")))?;

        Ok(inserted > 0)
    }

    // ── Workers ─────────────────────────────────────────────────────

    async fn claim_job(&self, name: &str, now: DateTime<Utc>) -> Result<Option<Job>, DatabaseError> {
        let now_str = fmt_ts(now);
        let event = event_json(&Event::new(now, Status::Dequeued, ""))?;

        let mut rows = self
            .conn()
            .query(
                &format!(
                    "UPDATE jobs SET status = 'dequeued', started = ?2, ended = NULL, \
                     attempts = attempts + 1, {APPEND_EVENT} \
                     WHERE id = ( \
                         SELECT id FROM jobs \
                         WHERE name = ?3 AND status = 'enqueued' AND available <= ?2 \
                         ORDER BY available ASC, created ASC \
                         LIMIT 1 \
                     ) AND status = 'enqueued' \
                     RETURNING {JOB_COLUMNS}"
                ),
                params![event, now_str, name],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("claim_job: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_job(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("claim_job: {e}"))),
        }
    }

    async fn finish_attempt(
        &self,
        id: Uuid,
        attempt: u32,
        outcome: &Outcome,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let now_str = fmt_ts(now);
        let mut values = vec![
            Value::Text(event_json(&outcome.event(now))?),
            Value::Text(id.to_string()),
            Value::Integer(i64::from(attempt)),
            Value::Text(now_str),
        ];

        // ?1 event, ?2 id, ?3 attempt, ?4 now, ?5 outcome specific.
        let set = match outcome {
            Outcome::Completed { result } => {
                values.push(Value::Text(result.to_string()));
                "status = 'completed', ended = ?4, finished = ?4, result = ?5"
            }
            Outcome::Retry { error, available } => {
                values.push(Value::Text(error.clone()));
                values.push(Value::Text(fmt_ts(*available)));
                "status = 'enqueued', ended = ?4, error = ?5, available = ?6"
            }
            Outcome::Failed { error } => {
                values.push(Value::Text(error.clone()));
                "status = 'failed', ended = ?4, finished = ?4, error = ?5"
            }
            Outcome::Cancelled { reason } => {
                values.push(Value::Text(reason.clone()));
                "status = 'cancelled', ended = ?4, finished = ?4, reason = ?5"
            }
        };

        let updated = self
            .conn()
            .execute(
                &format!(
                    "UPDATE jobs SET {set}, {APPEND_EVENT} \
                     WHERE id = ?2 AND status = 'dequeued' AND attempts = ?3"
                ),
                Params::Positional(values),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("finish_attempt: {e}")))?;

        debug!(job.id = %id, attempt, status = %outcome.status(), applied = updated > 0, "Attempt finished");
        Ok(updated > 0)
    }

    // ── Reaper ──────────────────────────────────────────────────────

    async fn requeue_stale_jobs(
        &self,
        name: &str,
        started_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, DatabaseError> {
        let event = event_json(&Event::new(now, Status::Enqueued, "lifetime exceeded"))?;

        let mut rows = self
            .conn()
            .query(
                &format!(
                    "UPDATE jobs SET status = 'enqueued', available = ?2, {APPEND_EVENT} \
                     WHERE name = ?3 AND status = 'dequeued' AND started < ?4 \
                     RETURNING id"
                ),
                params![event, fmt_ts(now), name, fmt_ts(started_before)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("requeue_stale_jobs: {e}")))?;

        let mut ids = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("requeue_stale_jobs: {e}")))?
        {
            let id: String = row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("requeue_stale_jobs: {e}")))?;
            ids.push(
                Uuid::parse_str(&id)
                    .map_err(|e| DatabaseError::Serialization(format!("bad job id {id:?}: {e}")))?,
            );
        }
        Ok(ids)
    }

    // ── Inspection and retention ────────────────────────────────────

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_job: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_job(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_job: {e}"))),
        }
    }

    async fn list_jobs(&self, name: &str, status: Option<Status>) -> Result<Vec<Job>, DatabaseError> {
        let rows = match status {
            Some(status) => {
                self.conn()
                    .query(
                        &format!(
                            "SELECT {JOB_COLUMNS} FROM jobs WHERE name = ?1 AND status = ?2 \
                             ORDER BY created ASC"
                        ),
                        params![name, status.as_str()],
                    )
                    .await
            }
            None => {
                self.conn()
                    .query(
                        &format!(
                            "SELECT {JOB_COLUMNS} FROM jobs WHERE name = ?1 ORDER BY created ASC"
                        ),
                        params![name],
                    )
                    .await
            }
        }
        .map_err(|e| DatabaseError::Query(format!("list_jobs: {e}")))?;

        collect_jobs(rows, "list_jobs").await
    }

    async fn delete_job(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute("DELETE FROM jobs WHERE id = ?1", params![id.to_string()])
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_job: {e}")))?;
        Ok(count > 0)
    }

    async fn delete_finished_before(&self, cutoff: DateTime<Utc>) -> Result<usize, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "DELETE FROM jobs WHERE finished IS NOT NULL AND finished < ?1",
                params![fmt_ts(cutoff)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_finished_before: {e}")))?;
        Ok(count as usize)
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::SubsecRound;

    use super::*;
    use crate::job::model::{before, offset};

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    fn job_at(name: &str, created: DateTime<Utc>, available: DateTime<Utc>) -> Job {
        Job::new(name, "", serde_json::json!({"n": 1}), created, available)
    }

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[tokio::test]
    async fn insert_and_get_by_id() {
        let db = test_db().await;
        let now = Utc::now();
        let job = job_at("mail", now, now);
        db.insert_job(&job).await.unwrap();

        let loaded = db.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(loaded.name, "mail");
        assert_eq!(loaded.status, Status::Enqueued);
        assert_eq!(loaded.data, serde_json::json!({"n": 1}));
        assert_eq!(loaded.events.len(), 1);
        assert_eq!(loaded.attempts, 0);
        assert!(loaded.result.is_none());
    }

    #[tokio::test]
    async fn get_by_id_not_found() {
        let db = test_db().await;
        assert!(db.get_job(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claim_marks_dequeued() {
        let db = test_db().await;
        let now = Utc::now();
        let job = job_at("mail", now, now);
        db.insert_job(&job).await.unwrap();

        let claimed = db.claim_job("mail", now).await.unwrap().unwrap();
        assert_eq!(claimed.id, job.id);
        assert_eq!(claimed.status, Status::Dequeued);
        assert_eq!(claimed.attempts, 1);
        assert_eq!(claimed.started, Some(now.trunc_subsecs(6)));
        assert_eq!(claimed.events.last().unwrap().status, Status::Dequeued);

        // Nothing left to claim
        assert!(db.claim_job("mail", now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claim_skips_other_names_and_future_jobs() {
        let db = test_db().await;
        let now = Utc::now();
        db.insert_job(&job_at("other", now, now)).await.unwrap();
        db.insert_job(&job_at("mail", now, offset(now, secs(60)).unwrap()))
            .await
            .unwrap();

        assert!(db.claim_job("mail", now).await.unwrap().is_none());
        assert!(
            db.claim_job("mail", offset(now, secs(60)).unwrap())
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn claim_order_available_then_created() {
        let db = test_db().await;
        let base = Utc::now();
        let t = |s| offset(base, secs(s)).unwrap();

        let late = job_at("mail", t(0), t(5));
        let early_second = job_at("mail", t(2), t(1));
        let early_first = job_at("mail", t(1), t(1));
        for job in [&late, &early_second, &early_first] {
            db.insert_job(job).await.unwrap();
        }

        let now = t(10);
        let mut order = Vec::new();
        while let Some(job) = db.claim_job("mail", now).await.unwrap() {
            order.push(job.id);
        }
        assert_eq!(order, vec![early_first.id, early_second.id, late.id]);
    }

    #[tokio::test]
    async fn concurrent_claims_never_share_a_job() {
        let db = Arc::new(test_db().await);
        let now = Utc::now();
        for _ in 0..20 {
            db.insert_job(&job_at("mail", now, now)).await.unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..8 {
            let db = Arc::clone(&db);
            handles.push(tokio::spawn(async move {
                let mut mine = Vec::new();
                while let Some(job) = db.claim_job("mail", now).await.unwrap() {
                    mine.push(job.id);
                }
                mine
            }));
        }

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }
        let unique: std::collections::HashSet<_> = all.iter().collect();
        assert_eq!(all.len(), 20);
        assert_eq!(unique.len(), 20);
    }

    #[tokio::test]
    async fn finish_completed_sets_terminal_fields() {
        let db = test_db().await;
        let now = Utc::now();
        let job = job_at("mail", now, now);
        db.insert_job(&job).await.unwrap();
        db.claim_job("mail", now).await.unwrap().unwrap();

        let outcome = Outcome::Completed {
            result: serde_json::json!({"ok": true}),
        };
        assert!(db.finish_attempt(job.id, 1, &outcome, now).await.unwrap());

        let done = db.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(done.status, Status::Completed);
        assert_eq!(done.result, Some(serde_json::json!({"ok": true})));
        assert!(done.ended.is_some());
        assert_eq!(done.ended, done.finished);
        assert_eq!(done.events.len(), 3);
    }

    #[tokio::test]
    async fn finish_retry_requeues_with_backoff() {
        let db = test_db().await;
        let now = Utc::now();
        let job = job_at("mail", now, now);
        db.insert_job(&job).await.unwrap();
        db.claim_job("mail", now).await.unwrap().unwrap();

        let available = offset(now, secs(30)).unwrap();
        let outcome = Outcome::Retry {
            error: "flaky".into(),
            available,
        };
        assert!(db.finish_attempt(job.id, 1, &outcome, now).await.unwrap());

        let retried = db.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(retried.status, Status::Enqueued);
        assert_eq!(retried.error.as_deref(), Some("flaky"));
        assert!(retried.finished.is_none());
        assert_eq!(retried.available, available.trunc_subsecs(6));

        assert!(db.claim_job("mail", now).await.unwrap().is_none());
        let again = db.claim_job("mail", available).await.unwrap().unwrap();
        assert_eq!(again.attempts, 2);
        assert!(again.ended.is_none());
    }

    #[tokio::test]
    async fn finish_guard_rejects_stale_attempt() {
        let db = test_db().await;
        let now = Utc::now();
        let job = job_at("mail", now, now);
        db.insert_job(&job).await.unwrap();
        db.claim_job("mail", now).await.unwrap().unwrap();

        // Reaped and claimed again by someone else.
        let later = offset(now, secs(120)).unwrap();
        let requeued = db.requeue_stale_jobs("mail", later, later).await.unwrap();
        assert_eq!(requeued, vec![job.id]);
        db.claim_job("mail", later).await.unwrap().unwrap();

        let outcome = Outcome::Completed {
            result: serde_json::Value::Null,
        };
        assert!(!db.finish_attempt(job.id, 1, &outcome, later).await.unwrap());
        assert!(db.finish_attempt(job.id, 2, &outcome, later).await.unwrap());
        // Terminal jobs are never touched again.
        assert!(!db.finish_attempt(job.id, 2, &outcome, later).await.unwrap());
    }

    #[tokio::test]
    async fn requeue_only_touches_stale_dequeued_jobs() {
        let db = test_db().await;
        let now = Utc::now();
        let stale = job_at("mail", now, now);
        db.insert_job(&stale).await.unwrap();
        db.claim_job("mail", now).await.unwrap().unwrap();

        let fresh_start = offset(now, secs(50)).unwrap();
        let fresh = job_at("mail", now, fresh_start);
        db.insert_job(&fresh).await.unwrap();
        db.claim_job("mail", fresh_start).await.unwrap().unwrap();

        let idle = job_at("mail", now, now);
        db.insert_job(&idle).await.unwrap();

        let sweep = offset(now, secs(60)).unwrap();
        let cutoff = offset(now, secs(30)).unwrap();
        let ids = db.requeue_stale_jobs("mail", cutoff, sweep).await.unwrap();
        assert_eq!(ids, vec![stale.id]);

        let reaped = db.get_job(stale.id).await.unwrap().unwrap();
        assert_eq!(reaped.status, Status::Enqueued);
        assert_eq!(reaped.available, sweep.trunc_subsecs(6));
        assert_eq!(reaped.attempts, 1);
        assert_eq!(reaped.events.last().unwrap().reason, "lifetime exceeded");

        let untouched = db.get_job(fresh.id).await.unwrap().unwrap();
        assert_eq!(untouched.status, Status::Dequeued);
    }

    #[tokio::test]
    async fn insert_if_absent_respects_identity_and_isolation() {
        let db = test_db().await;
        let now = Utc::now();
        let blueprint = |at| Job::new("cleanup", "periodic", serde_json::Value::Null, at, at);

        let first = blueprint(now);
        assert!(db.insert_job_if_absent(&first, now).await.unwrap());
        // Pending instance blocks a second one.
        assert!(!db.insert_job_if_absent(&blueprint(now), now).await.unwrap());
        // Other labels are independent.
        let other = Job::new("cleanup", "manual", serde_json::Value::Null, now, now);
        assert!(db.insert_job_if_absent(&other, now).await.unwrap());

        db.claim_job("cleanup", now).await.unwrap().unwrap();
        let outcome = Outcome::Completed {
            result: serde_json::Value::Null,
        };
        db.finish_attempt(first.id, 1, &outcome, now).await.unwrap();

        // Finished too recently for a 10s period.
        let soon = offset(now, secs(5)).unwrap();
        assert!(
            !db.insert_job_if_absent(&blueprint(soon), before(soon, secs(10)))
                .await
                .unwrap()
        );

        // Finished long enough ago.
        let later = offset(now, secs(20)).unwrap();
        assert!(
            db.insert_job_if_absent(&blueprint(later), before(later, secs(10)))
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn list_by_status() {
        let db = test_db().await;
        let now = Utc::now();
        db.insert_job(&job_at("mail", now, now)).await.unwrap();
        db.insert_job(&job_at("mail", now, now)).await.unwrap();
        db.claim_job("mail", now).await.unwrap().unwrap();

        assert_eq!(db.list_jobs("mail", None).await.unwrap().len(), 2);
        assert_eq!(
            db.list_jobs("mail", Some(Status::Dequeued)).await.unwrap().len(),
            1
        );
        assert!(db.list_jobs("other", None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_finished_before_keeps_pending() {
        let db = test_db().await;
        let now = Utc::now();
        let done = job_at("mail", now, now);
        let pending = job_at("mail", now, offset(now, secs(3600)).unwrap());
        db.insert_job(&done).await.unwrap();
        db.insert_job(&pending).await.unwrap();
        db.claim_job("mail", now).await.unwrap().unwrap();
        let outcome = Outcome::Cancelled { reason: "x".into() };
        db.finish_attempt(done.id, 1, &outcome, now).await.unwrap();

        let cutoff = offset(now, secs(1)).unwrap();
        assert_eq!(db.delete_finished_before(cutoff).await.unwrap(), 1);
        assert!(db.get_job(done.id).await.unwrap().is_none());
        assert!(db.get_job(pending.id).await.unwrap().is_some());
        assert!(db.delete_job(pending.id).await.unwrap());
        assert!(!db.delete_job(pending.id).await.unwrap());
    }

    #[test]
    fn timestamps_sort_as_text() {
        let a = Utc::now();
        let b = offset(a, Duration::from_millis(1)).unwrap();
        assert!(fmt_ts(a) < fmt_ts(b));
        assert!(fmt_ts(DateTime::<Utc>::MIN_UTC) < fmt_ts(a));
        assert!(fmt_ts(DateTime::<Utc>::MAX_UTC) > fmt_ts(b));
        assert_eq!(parse_ts(&fmt_ts(a)).unwrap(), a.trunc_subsecs(6));
    }

    #[tokio::test]
    async fn open_creates_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let db_path = tmp.path().join("nested").join("dir").join("jobs.db");
        let db = LibSqlBackend::new_local(&db_path).await.unwrap();
        assert!(db_path.exists());
        drop(db);
    }

    #[tokio::test]
    async fn corrupt_columns_are_reported() {
        let db = test_db().await;
        let now = Utc::now();
        let job = job_at("mail", now, now);
        db.insert_job(&job).await.unwrap();

        db.conn()
            .execute("UPDATE jobs SET error = X'2A' WHERE id = ?1", params![job.id.to_string()])
            .await
            .unwrap();
        let err = db.get_job(job.id).await.unwrap_err();
        assert!(matches!(err, DatabaseError::Serialization(_)), "{err}");

        db.conn()
            .execute(
                "UPDATE jobs SET error = NULL, attempts = -1 WHERE id = ?1",
                params![job.id.to_string()],
            )
            .await
            .unwrap();
        let err = db.get_job(job.id).await.unwrap_err();
        assert!(matches!(err, DatabaseError::Serialization(_)), "{err}");
    }
}
