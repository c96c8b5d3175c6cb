//! Job store trait definitions

use crate::queue::{ExtractionJob, JobId, JobStatus, JobUpdate, TransitionError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::Path;
use thiserror::Error;

/// Errors that can occur during job store operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    #[error(transparent)]
    InvalidTransition(#[from] TransitionError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Date parsing error: {0}")]
    DateParse(String),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Number of stored jobs in each status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
}

impl StatusCounts {
    pub fn get(&self, status: JobStatus) -> usize {
        match status {
            JobStatus::Pending => self.pending,
            JobStatus::Processing => self.processing,
            JobStatus::Completed => self.completed,
            JobStatus::Failed => self.failed,
        }
    }

    pub fn add(&mut self, status: JobStatus) {
        match status {
            JobStatus::Pending => self.pending += 1,
            JobStatus::Processing => self.processing += 1,
            JobStatus::Completed => self.completed += 1,
            JobStatus::Failed => self.failed += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.pending + self.processing + self.completed + self.failed
    }
}

/// Trait for job store backends
///
/// The scheduler owns the in-memory queue; the store is the record of job
/// lifecycle and token usage. Implementations must be thread-safe.
pub trait JobStore: Send + Sync {
    // === Job Operations ===

    /// Insert a new job
    fn create_job(&self, job: &ExtractionJob) -> StorageResult<()>;

    /// Load a job by ID
    fn get_job(&self, id: &JobId) -> StorageResult<Option<ExtractionJob>>;

    /// Apply a status update and return the updated job.
    ///
    /// Fails with `InvalidTransition` if the update would move the job
    /// backwards.
    fn update_job_status(
        &self,
        id: &JobId,
        update: JobUpdate,
        now: DateTime<Utc>,
    ) -> StorageResult<ExtractionJob>;

    /// Jobs in `status`, oldest first
    fn list_jobs_by_status(&self, status: JobStatus) -> StorageResult<Vec<ExtractionJob>>;

    /// Every job, oldest first
    fn list_jobs(&self) -> StorageResult<Vec<ExtractionJob>>;

    fn count_by_status(&self) -> StorageResult<StatusCounts>;

    /// Delete completed/failed jobs last updated before `cutoff`, along with
    /// usage entries recorded before it. Pending and processing jobs are
    /// never deleted.
    fn delete_terminal_before(&self, cutoff: DateTime<Utc>) -> StorageResult<usize>;

    // === Usage Ledger ===

    /// Record tokens spent by a job
    fn record_resource_usage(
        &self,
        job_id: &JobId,
        tokens: u64,
        at: DateTime<Utc>,
    ) -> StorageResult<()>;

    /// Total tokens recorded at or after `since`
    fn usage_since(&self, since: DateTime<Utc>) -> StorageResult<u64>;

    /// Ledger entries `(recorded_at, tokens)` at or after `since`, oldest first
    fn usage_entries_since(&self, since: DateTime<Utc>) -> StorageResult<Vec<(DateTime<Utc>, u64)>>;
}

/// Extension trait for opening stores from paths
pub trait OpenStore: JobStore + Sized {
    /// Open or create a store at the given path
    fn open(path: impl AsRef<Path>) -> StorageResult<Self>;

    /// Create an in-memory store (useful for testing)
    fn open_in_memory() -> StorageResult<Self>;
}
