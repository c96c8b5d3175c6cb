//! Shared fixtures for the integration tests

#![allow(dead_code)]

use attrex::provider::{ImagePayload, MockProvider};
use attrex::queue::{
    ExtractionJob, ExtractionScheduler, ImageRef, JobId, JobStatus, JobSubmission, JobUpdate,
    SchedulerConfig,
};
use attrex::schema::{AttributeDef, AttributeSchema};
use attrex::store::{StatusCounts, StorageError, StorageResult};
use attrex::{JobStore, MemoryJobStore, StagedPipeline};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A tiny PNG-typed payload; providers in these tests never decode it
pub fn image() -> ImagePayload {
    ImagePayload::new("image/png", vec![0x89, 0x50, 0x4e, 0x47])
}

/// color, fit, material: three select attributes
pub fn dress_schema() -> AttributeSchema {
    AttributeSchema::new(vec![
        AttributeDef::select("color", "Color", ["Red", "Blue", "Black"]),
        AttributeDef::select("fit", "Fit", ["Slim", "Regular", "Loose"]),
        AttributeDef::text("material", "Material"),
    ])
}

pub fn color_schema() -> AttributeSchema {
    AttributeSchema::new(vec![AttributeDef::select("color", "Color", ["Red", "Blue"])])
}

pub fn submission(schema: AttributeSchema) -> JobSubmission {
    JobSubmission::new(ImageRef::inline(&image()), schema)
}

/// Fast provider that answers every dress attribute confidently
pub fn confident_fast() -> MockProvider {
    MockProvider::new("fast")
        .with_answer("color", "Red", 95.0)
        .with_answer("fit", "Slim", 90.0)
        .with_answer("material", "Cotton", 85.0)
        .with_cost(300)
}

/// Scheduler config with a short tick so loop tests finish quickly
pub fn fast_ticking() -> SchedulerConfig {
    SchedulerConfig {
        tick_interval_ms: 10,
        ..SchedulerConfig::default()
    }
}

pub fn scheduler_with(
    config: SchedulerConfig,
    fast: Arc<MockProvider>,
    store: Arc<dyn JobStore>,
) -> Arc<ExtractionScheduler> {
    let pipeline = StagedPipeline::new().with_fast(fast);
    ExtractionScheduler::new(config, Arc::new(pipeline), store)
}

/// Poll `check` until it holds or a second passes
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

/// Memory store that stalls result writes and can refuse the next few
/// `Processing` updates with a transient error
#[derive(Default)]
pub struct StallingStore {
    inner: MemoryJobStore,
    result_delay: Duration,
    processing_failures: AtomicUsize,
}

impl StallingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block every terminal status write for `delay`
    pub fn with_result_delay(mut self, delay: Duration) -> Self {
        self.result_delay = delay;
        self
    }

    /// Fail the next `count` processing updates
    pub fn failing_processing(self, count: usize) -> Self {
        self.processing_failures.store(count, Ordering::SeqCst);
        self
    }
}

impl JobStore for StallingStore {
    fn create_job(&self, job: &ExtractionJob) -> StorageResult<()> {
        self.inner.create_job(job)
    }

    fn get_job(&self, id: &JobId) -> StorageResult<Option<ExtractionJob>> {
        self.inner.get_job(id)
    }

    fn update_job_status(
        &self,
        id: &JobId,
        update: JobUpdate,
        now: DateTime<Utc>,
    ) -> StorageResult<ExtractionJob> {
        match update {
            JobUpdate::Processing => {
                let refused = self
                    .processing_failures
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
                if refused {
                    return Err(StorageError::Io(std::io::Error::other("database is locked")));
                }
            }
            _ => std::thread::sleep(self.result_delay),
        }
        self.inner.update_job_status(id, update, now)
    }

    fn list_jobs_by_status(&self, status: JobStatus) -> StorageResult<Vec<ExtractionJob>> {
        self.inner.list_jobs_by_status(status)
    }

    fn list_jobs(&self) -> StorageResult<Vec<ExtractionJob>> {
        self.inner.list_jobs()
    }

    fn count_by_status(&self) -> StorageResult<StatusCounts> {
        self.inner.count_by_status()
    }

    fn delete_terminal_before(&self, cutoff: DateTime<Utc>) -> StorageResult<usize> {
        self.inner.delete_terminal_before(cutoff)
    }

    fn record_resource_usage(
        &self,
        job_id: &JobId,
        tokens: u64,
        at: DateTime<Utc>,
    ) -> StorageResult<()> {
        self.inner.record_resource_usage(job_id, tokens, at)
    }

    fn usage_since(&self, since: DateTime<Utc>) -> StorageResult<u64> {
        self.inner.usage_since(since)
    }

    fn usage_entries_since(&self, since: DateTime<Utc>) -> StorageResult<Vec<(DateTime<Utc>, u64)>> {
        self.inner.usage_entries_since(since)
    }
}
