//! Built-in retention task that deletes old finished jobs.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::info;

use crate::error::HandlerError;
use crate::job::model::before;
use crate::queue::Blueprint;
use crate::store::JobStore;
use crate::task::{Context, Task};

/// Name the retention task is registered under.
pub const CLEANUP_TASK: &str = "job-pool.cleanup";

/// A periodic task that runs every `periodicity` and deletes jobs that
/// finished more than `retention` ago. The job result is the number of
/// deleted records.
pub fn cleanup_task(store: Arc<dyn JobStore>, periodicity: Duration, retention: Duration) -> Task {
    let blueprint = Blueprint {
        label: "periodic".to_string(),
        data: serde_json::Value::Null,
        delay: Duration::ZERO,
    };

    Task::new(CLEANUP_TASK, move |_: Context<()>| {
        let store = Arc::clone(&store);
        async move {
            let cutoff = before(Utc::now(), retention);
            let deleted = store
                .delete_finished_before(cutoff)
                .await
                .map_err(|e| HandlerError::retry(e.to_string()))?;
            info!(deleted, %cutoff, "Deleted finished jobs past retention");
            Ok::<_, HandlerError>(deleted)
        }
    })
    .workers(1)
    .max_attempts(1)
    .lifetime(periodicity)
    .periodic(periodicity, blueprint)
}
