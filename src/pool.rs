//! Pool: owns the registered tasks and runs their workers and the reaper.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::PoolConfig;
use crate::error::ConfigError;
use crate::queue::Queue;
use crate::reaper::Reaper;
use crate::store::JobStore;
use crate::task::Task;
use crate::worker::Worker;

/// A set of tasks sharing one store. Configure with [`Pool::add`], then
/// start with [`Pool::run`].
pub struct Pool {
    queue: Queue,
    config: PoolConfig,
    tasks: BTreeMap<String, Arc<Task>>,
}

impl Pool {
    pub fn new(store: Arc<dyn JobStore>, config: PoolConfig) -> Self {
        Self {
            queue: Queue::new(store),
            config,
            tasks: BTreeMap::new(),
        }
    }

    /// Producer handle for this pool's store.
    pub fn queue(&self) -> Queue {
        self.queue.clone()
    }

    /// Register a task. Names must be unique within the pool.
    pub fn add(&mut self, task: Task) -> Result<(), ConfigError> {
        task.validate()?;
        if self.tasks.contains_key(task.name()) {
            return Err(ConfigError::DuplicateTask {
                name: task.name().to_string(),
            });
        }
        self.tasks.insert(task.name().to_string(), Arc::new(task));
        Ok(())
    }

    /// Start every worker and the reaper.
    ///
    /// Must be called from within a tokio runtime.
    pub fn run(self) -> Result<RunningPool, ConfigError> {
        if self.tasks.is_empty() {
            return Err(ConfigError::NoTasks);
        }
        if self.config.reaper_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "reaper_interval".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }

        let token = CancellationToken::new();
        let mut handles = Vec::new();

        for task in self.tasks.values() {
            for lane in 0..task.worker_count() {
                let worker = Worker::new(Arc::clone(task), Arc::clone(self.queue.store()), lane);
                handles.push(worker.spawn(token.child_token()));
            }
        }

        let tasks: Vec<Arc<Task>> = self.tasks.values().cloned().collect();
        let longest_lifetime = tasks
            .iter()
            .map(|t| t.lifetime_limit())
            .max()
            .unwrap_or(Duration::ZERO);
        let grace = self.config.shutdown_grace.unwrap_or(longest_lifetime);

        let reaper = Reaper::new(self.queue.clone(), tasks, self.config.reaper_interval);
        handles.push(reaper.spawn(token.child_token()));

        info!(
            tasks = self.tasks.len(),
            workers = handles.len() - 1,
            "Pool started"
        );

        Ok(RunningPool {
            queue: self.queue,
            token,
            handles,
            grace,
        })
    }
}

/// A started pool. Dropping it leaves the workers running; call
/// [`RunningPool::close`] to stop them.
pub struct RunningPool {
    queue: Queue,
    token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
    grace: Duration,
}

impl RunningPool {
    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    /// Stop polling and wait for in-flight handlers.
    ///
    /// Handlers still running after the grace period are aborted; their jobs
    /// stay `dequeued` until a reaper requeues them.
    pub async fn close(self) {
        info!("Pool shutting down");
        self.token.cancel();

        let aborts: Vec<_> = self.handles.iter().map(|h| h.abort_handle()).collect();

        match tokio::time::timeout(self.grace, join_all(self.handles)).await {
            Ok(results) => {
                for result in results {
                    if let Err(e) = result {
                        error!(error = %e, "Pool task ended abnormally");
                    }
                }
            }
            Err(_) => {
                warn!(grace = ?self.grace, "Shutdown grace elapsed, aborting running handlers");
                for abort in aborts {
                    abort.abort();
                }
            }
        }

        info!("Pool stopped");
    }
}
