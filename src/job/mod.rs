//! Job records and their state machine.
//!
//! - `model`: the persisted `Job` record, `Status` and audit `Event`s
//! - `state`: transition rules and the `Outcome` of one execution attempt

pub mod model;
pub mod state;

pub use model::{Event, Job, Status};
pub use state::Outcome;
