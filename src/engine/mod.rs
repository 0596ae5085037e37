//! Goal scheduling: the suspension runtime, the goal records and the worker
//! that drives them.

mod goal;
mod task;
mod worker;

pub use crate::engine::goal::{BuildResult, ExitCode, GoalId, GoalKey, GoalKind, JobCategory};
pub use crate::engine::task::{Co, Step, Task};
pub use crate::engine::worker::{
    Context, DerivedPath, Diagnostics, GoalExecution, GoalOutcome, JobLimits, JobOutcome, RunReport,
    Worker, describe_status,
};
