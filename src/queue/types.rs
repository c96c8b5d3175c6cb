//! Scheduler configuration, reports and errors

use super::budget::{BudgetSnapshot, WindowMode};
use super::cost::CostModel;
use super::job::{ExtractionJob, JobFailure, JobId, JobStatus, Priority};
use crate::pipeline::ExtractionOutcome;
use crate::store::{StatusCounts, StorageError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;

/// Used for wait estimates before any job has finished
pub const DEFAULT_JOB_DURATION_MS: u64 = 30_000;

/// Scheduler tunables. Every field has a default, so an empty YAML
/// section is valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub tick_interval_ms: u64,
    /// Jobs running at once
    pub max_concurrent: usize,
    /// Tokens per budget window
    pub token_limit: u64,
    pub window_secs: u64,
    pub window_mode: WindowMode,
    /// Dispatch pauses while remaining quota is below this
    pub safety_reserve: u64,
    /// Completed/failed jobs older than this are purged by cleanup
    pub retention_days: u64,
    /// How long shutdown waits for running jobs
    pub drain_timeout_secs: u64,
    pub cost: CostModel,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 2_000,
            max_concurrent: 3,
            token_limit: 100_000,
            window_secs: 3_600,
            window_mode: WindowMode::Fixed,
            safety_reserve: 1_000,
            retention_days: 7,
            drain_timeout_secs: 30,
            cost: CostModel::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.window_secs as i64)
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(self.retention_days as i64)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    /// Reject settings the scheduler cannot run with
    pub fn validate(&self) -> Result<(), String> {
        if self.tick_interval_ms == 0 {
            return Err("scheduler.tick_interval_ms must be positive".into());
        }
        if self.max_concurrent == 0 {
            return Err("scheduler.max_concurrent must be at least 1".into());
        }
        if self.token_limit == 0 {
            return Err("scheduler.token_limit must be positive".into());
        }
        if self.window_secs == 0 {
            return Err("scheduler.window_secs must be positive".into());
        }
        if self.safety_reserve >= self.token_limit {
            return Err("scheduler.safety_reserve must be below token_limit".into());
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("scheduler is shutting down")]
    ShuttingDown,
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Why a tick dispatched nothing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleReason {
    EmptyQueue,
    AtCapacity,
    /// Remaining quota is below the safety reserve
    BudgetLow,
    ShuttingDown,
}

/// What one dispatch tick did
#[derive(Debug)]
pub enum TickOutcome {
    /// A job was marked processing and is now running
    Dispatched {
        job_id: JobId,
        handle: JoinHandle<()>,
    },
    /// A job was popped but failed on the budget check without running
    Rejected { job_id: JobId, failure: JobFailure },
    /// A job was popped but the store no longer knows it or it already
    /// left pending; it is dropped from the queue
    Skipped { job_id: JobId },
    /// Marking the job processing failed transiently; it is back at the
    /// head of its tier for the next tick
    Deferred { job_id: JobId },
    Idle(IdleReason),
}

impl TickOutcome {
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            Self::Dispatched { job_id, .. }
            | Self::Rejected { job_id, .. }
            | Self::Skipped { job_id }
            | Self::Deferred { job_id } => Some(*job_id),
            Self::Idle(_) => None,
        }
    }
}

/// A job's status as seen by a polling caller
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusView {
    pub job_id: JobId,
    pub status: JobStatus,
    pub priority: Priority,
    pub estimated_cost: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ExtractionOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobFailure>,
    /// 1-based position among pending jobs
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_position: Option<usize>,
    /// Rough estimate from queue position and past durations
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_wait_ms: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_duration_ms: Option<u64>,
}

impl JobStatusView {
    pub(crate) fn from_job(job: ExtractionJob) -> Self {
        Self {
            job_id: job.id,
            status: job.status,
            priority: job.priority,
            estimated_cost: job.estimated_cost,
            result: job.result,
            error: job.error,
            queue_position: None,
            estimated_wait_ms: None,
            created_at: job.created_at,
            updated_at: job.updated_at,
            processing_duration_ms: job.processing_duration_ms,
        }
    }
}

/// Aggregate queue state
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueOverview {
    /// Stored jobs per status
    pub counts: StatusCounts,
    /// Jobs waiting in the in-memory queue
    pub queued: usize,
    pub active: usize,
    pub max_concurrent: usize,
    pub budget: BudgetSnapshot,
    /// Token budget used, as a percentage of the limit
    pub utilization_percent: f64,
    pub average_duration_ms: u64,
    /// Below the concurrency cap and above the safety reserve
    pub can_accept_jobs: bool,
}

/// Result of re-reading a durable store after a restart
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub requeued: Vec<JobId>,
    pub interrupted: Vec<JobId>,
    pub budget_used: u64,
}

/// Result of stopping the scheduler
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// Every running job finished before the drain timeout
    pub drained: bool,
    /// Jobs force-stopped and marked failed
    pub interrupted: Vec<JobId>,
    /// Jobs left pending
    pub pending: usize,
}
