//! Job Pool: persistent job queue with polling workers.

pub mod cleanup;
pub mod codec;
pub mod config;
pub mod error;
pub mod job;
pub mod pool;
pub mod queue;
pub mod reaper;
pub mod store;
pub mod task;
mod worker;

pub use error::{Error, HandlerError, Result};
pub use job::{Job, Status};
pub use pool::{Pool, RunningPool};
pub use queue::{Blueprint, Queue};
pub use task::{Backoff, Context, Task};
