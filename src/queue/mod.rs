//! Admission, prioritization and dispatch of extraction jobs
//!
//! # Flow
//!
//! ```text
//! add_job → cost estimate + priority → JobStore (pending) → PendingQueue
//!   tick → concurrency / reserve check → pop → processing
//!        → budget reservation (or fail: budget exceeded, no provider call)
//!        → spawned pipeline run → completed | failed, actual cost settled
//! ```
//!
//! The dispatch loop started by [`ExtractionScheduler::start`] calls `tick`
//! once per interval until shutdown.

mod budget;
mod cost;
mod job;
mod pending;
mod scheduler;
mod shutdown;
mod types;

pub use budget::{BudgetSnapshot, ResourceBudget, WindowMode};
pub use cost::CostModel;
pub use job::{
    mime_for_path, ExtractionJob, FailureKind, ImageRef, JobFailure, JobId, JobStatus,
    JobSubmission, JobUpdate, Priority, TransitionError,
};
pub use scheduler::ExtractionScheduler;
pub use shutdown::ShutdownSignal;
pub use types::{
    IdleReason, JobStatusView, QueueOverview, RecoveryReport, SchedulerConfig, SchedulerError,
    SchedulerResult, ShutdownReport, TickOutcome, DEFAULT_JOB_DURATION_MS,
};
