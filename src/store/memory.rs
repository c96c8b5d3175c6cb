//! In-memory job store

use super::traits::{JobStore, StatusCounts, StorageError, StorageResult};
use crate::queue::{ExtractionJob, JobId, JobStatus, JobUpdate};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Mutex;

/// Job store held entirely in memory.
///
/// Nothing survives a restart; use `SqliteJobStore` when it must.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    jobs: DashMap<JobId, ExtractionJob>,
    usage: Mutex<Vec<(DateTime<Utc>, u64)>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn sorted(mut jobs: Vec<ExtractionJob>) -> Vec<ExtractionJob> {
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        jobs
    }
}

impl JobStore for MemoryJobStore {
    fn create_job(&self, job: &ExtractionJob) -> StorageResult<()> {
        self.jobs.insert(job.id, job.clone());
        Ok(())
    }

    fn get_job(&self, id: &JobId) -> StorageResult<Option<ExtractionJob>> {
        Ok(self.jobs.get(id).map(|entry| entry.value().clone()))
    }

    fn update_job_status(
        &self,
        id: &JobId,
        update: JobUpdate,
        now: DateTime<Utc>,
    ) -> StorageResult<ExtractionJob> {
        let mut entry = self
            .jobs
            .get_mut(id)
            .ok_or(StorageError::JobNotFound(*id))?;
        entry.apply(update, now)?;
        Ok(entry.value().clone())
    }

    fn list_jobs_by_status(&self, status: JobStatus) -> StorageResult<Vec<ExtractionJob>> {
        let jobs = self
            .jobs
            .iter()
            .filter(|entry| entry.status == status)
            .map(|entry| entry.value().clone())
            .collect();
        Ok(Self::sorted(jobs))
    }

    fn list_jobs(&self) -> StorageResult<Vec<ExtractionJob>> {
        let jobs = self.jobs.iter().map(|entry| entry.value().clone()).collect();
        Ok(Self::sorted(jobs))
    }

    fn count_by_status(&self) -> StorageResult<StatusCounts> {
        let mut counts = StatusCounts::default();
        for entry in self.jobs.iter() {
            counts.add(entry.status);
        }
        Ok(counts)
    }

    fn delete_terminal_before(&self, cutoff: DateTime<Utc>) -> StorageResult<usize> {
        let before = self.jobs.len();
        self.jobs
            .retain(|_, job| !(job.status.is_terminal() && job.updated_at < cutoff));
        self.usage
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .retain(|(at, _)| *at >= cutoff);
        Ok(before - self.jobs.len())
    }

    fn record_resource_usage(
        &self,
        _job_id: &JobId,
        tokens: u64,
        at: DateTime<Utc>,
    ) -> StorageResult<()> {
        self.usage
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((at, tokens));
        Ok(())
    }

    fn usage_since(&self, since: DateTime<Utc>) -> StorageResult<u64> {
        let usage = self.usage.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(usage
            .iter()
            .filter(|(at, _)| *at >= since)
            .map(|(_, tokens)| tokens)
            .sum())
    }

    fn usage_entries_since(&self, since: DateTime<Utc>) -> StorageResult<Vec<(DateTime<Utc>, u64)>> {
        let usage = self.usage.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut entries: Vec<(DateTime<Utc>, u64)> =
            usage.iter().filter(|(at, _)| *at >= since).copied().collect();
        entries.sort_by_key(|(at, _)| *at);
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ImagePayload;
    use crate::queue::{ImageRef, JobFailure, JobSubmission, Priority};
    use crate::schema::{AttributeDef, AttributeSchema};
    use chrono::Duration;

    fn job(now: DateTime<Utc>) -> ExtractionJob {
        let submission = JobSubmission::new(
            ImageRef::inline(&ImagePayload::new("image/png", vec![1])),
            AttributeSchema::new(vec![AttributeDef::text("color", "Color")]),
        );
        ExtractionJob::new(submission, Priority::Normal, 900, now)
    }

    #[test]
    fn update_enforces_monotonic_status() {
        let store = MemoryJobStore::new();
        let now = Utc::now();
        let job = job(now);
        store.create_job(&job).unwrap();

        store.update_job_status(&job.id, JobUpdate::Processing, now).unwrap();
        store
            .update_job_status(
                &job.id,
                JobUpdate::Failed(JobFailure::budget_exceeded(900, 0)),
                now,
            )
            .unwrap();

        let err = store
            .update_job_status(&job.id, JobUpdate::Processing, now)
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidTransition(_)));
        assert_eq!(store.get_job(&job.id).unwrap().unwrap().status, JobStatus::Failed);
    }

    #[test]
    fn missing_job_is_not_found() {
        let store = MemoryJobStore::new();
        let err = store
            .update_job_status(&JobId::new(), JobUpdate::Processing, Utc::now())
            .unwrap_err();
        assert!(matches!(err, StorageError::JobNotFound(_)));
    }

    #[test]
    fn cleanup_only_removes_old_terminal_jobs() {
        let store = MemoryJobStore::new();
        let old = Utc::now() - Duration::days(10);
        let done = job(old);
        let waiting = job(old);
        store.create_job(&done).unwrap();
        store.create_job(&waiting).unwrap();
        store.update_job_status(&done.id, JobUpdate::Processing, old).unwrap();
        store
            .update_job_status(
                &done.id,
                JobUpdate::Failed(JobFailure::budget_exceeded(1, 0)),
                old,
            )
            .unwrap();

        let removed = store
            .delete_terminal_before(Utc::now() - Duration::days(7))
            .unwrap();

        assert_eq!(removed, 1);
        assert!(store.get_job(&waiting.id).unwrap().is_some());
        assert_eq!(store.count_by_status().unwrap().pending, 1);
    }

    #[test]
    fn usage_since_sums_window() {
        let store = MemoryJobStore::new();
        let now = Utc::now();
        let id = JobId::new();
        store.record_resource_usage(&id, 500, now - Duration::hours(2)).unwrap();
        store.record_resource_usage(&id, 300, now).unwrap();

        assert_eq!(store.usage_since(now - Duration::hours(1)).unwrap(), 300);
        assert_eq!(store.usage_since(now - Duration::hours(3)).unwrap(), 800);
        assert_eq!(
            store.usage_entries_since(now - Duration::hours(3)).unwrap(),
            vec![(now - Duration::hours(2), 500), (now, 300)]
        );
    }

    #[test]
    fn cleanup_prunes_old_usage_entries() {
        let store = MemoryJobStore::new();
        let now = Utc::now();
        let id = JobId::new();
        store.record_resource_usage(&id, 400, now - Duration::days(9)).unwrap();
        store.record_resource_usage(&id, 100, now).unwrap();

        store.delete_terminal_before(now - Duration::days(7)).unwrap();

        assert_eq!(store.usage_entries_since(now - Duration::days(30)).unwrap(), vec![(now, 100)]);
        assert_eq!(store.usage.lock().unwrap().len(), 1);
    }
}
