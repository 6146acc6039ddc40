//! Thread orchestration for the self-calibrating estimator.
//!
//! `SelfCalSystem` processes keyframes on the caller's thread and spawns the
//! adaptive-conditioning worker plus one queue worker per sensor configured
//! for asynchronous aggregation. Shared state and the worker messages live
//! here too.

mod conditioning_worker;
pub mod messages;
mod queue_worker;
mod selfcal_system;
pub mod shared_state;

pub use conditioning_worker::ConditioningWorker;
pub use messages::QueueJob;
pub use queue_worker::QueueWorker;
pub use selfcal_system::{KeyframeOutcome, SelfCalSystem};
pub use shared_state::SharedState;
