//! Admission and dispatch
//!
//! `ExtractionScheduler` is an explicit object: construct one per process
//! (or per test) and share the `Arc`. All mutable queue state (pending
//! tiers, active set, budget, recent durations) sits behind one mutex that
//! is never held across an await.

use super::budget::{BudgetSnapshot, ResourceBudget};
use super::job::{
    ExtractionJob, FailureKind, JobFailure, JobId, JobStatus, JobSubmission, JobUpdate,
};
use super::pending::PendingQueue;
use super::shutdown::ShutdownSignal;
use super::types::{
    IdleReason, JobStatusView, QueueOverview, RecoveryReport, SchedulerConfig, SchedulerError,
    SchedulerResult, ShutdownReport, TickOutcome, DEFAULT_JOB_DURATION_MS,
};
use crate::pipeline::{ExtractionRequest, StagedPipeline};
use crate::store::{JobStore, StorageError};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn};

/// Finished-job durations kept for wait estimates
const DURATION_HISTORY: usize = 50;

/// Poll interval while draining on shutdown
const DRAIN_POLL: Duration = Duration::from_millis(25);

struct ActiveJob {
    reserved: u64,
    started_at: DateTime<Utc>,
    abort: Option<AbortHandle>,
}

struct SchedulerState {
    pending: PendingQueue,
    active: HashMap<JobId, ActiveJob>,
    budget: ResourceBudget,
    durations: VecDeque<u64>,
}

impl SchedulerState {
    fn average_duration_ms(&self) -> u64 {
        if self.durations.is_empty() {
            DEFAULT_JOB_DURATION_MS
        } else {
            self.durations.iter().sum::<u64>() / self.durations.len() as u64
        }
    }
}

pub struct ExtractionScheduler {
    config: SchedulerConfig,
    pipeline: Arc<StagedPipeline>,
    store: Arc<dyn JobStore>,
    state: Mutex<SchedulerState>,
    shutdown: ShutdownSignal,
    dispatch_loop: Mutex<Option<JoinHandle<()>>>,
}

impl ExtractionScheduler {
    pub fn new(
        config: SchedulerConfig,
        pipeline: Arc<StagedPipeline>,
        store: Arc<dyn JobStore>,
    ) -> Arc<Self> {
        let budget = ResourceBudget::new(
            config.token_limit,
            config.window(),
            config.window_mode,
            Utc::now(),
        );
        Arc::new(Self {
            config,
            pipeline,
            store,
            state: Mutex::new(SchedulerState {
                pending: PendingQueue::default(),
                active: HashMap::new(),
                budget,
                durations: VecDeque::new(),
            }),
            shutdown: ShutdownSignal::new(),
            dispatch_loop: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Admit a job: estimate its cost, settle its priority, persist it and
    /// queue it. Returns without waiting for dispatch.
    pub fn add_job(&self, submission: JobSubmission) -> SchedulerResult<JobId> {
        if self.shutdown.is_triggered() {
            return Err(SchedulerError::ShuttingDown);
        }

        let cost_model = &self.config.cost;
        let estimated_cost = cost_model.estimate(&submission.schema, &submission.context);
        let priority = cost_model.assign_priority(
            submission.priority,
            estimated_cost,
            submission.submitter.as_deref(),
        );
        if priority != submission.priority {
            debug!(
                requested = %submission.priority,
                assigned = %priority,
                estimated_cost,
                "priority overridden"
            );
        }

        let job = ExtractionJob::new(submission, priority, estimated_cost, Utc::now());
        let job_id = job.id;
        self.store.create_job(&job)?;
        self.lock().pending.push(job);

        info!(%job_id, %priority, estimated_cost, "job queued");
        Ok(job_id)
    }

    /// Run one dispatch step.
    ///
    /// Pops at most one job. Popping and marking it processing happen under
    /// the state lock, so concurrent ticks never take the same job.
    pub fn tick(self: &Arc<Self>) -> TickOutcome {
        if self.shutdown.is_triggered() {
            return TickOutcome::Idle(IdleReason::ShuttingDown);
        }

        let now = Utc::now();
        let mut state = self.lock();

        if state.active.len() >= self.config.max_concurrent {
            return TickOutcome::Idle(IdleReason::AtCapacity);
        }
        if state.budget.remaining(now) < self.config.safety_reserve {
            return TickOutcome::Idle(IdleReason::BudgetLow);
        }
        let Some(job) = state.pending.pop() else {
            return TickOutcome::Idle(IdleReason::EmptyQueue);
        };
        let job_id = job.id;

        if let Err(e) = self.store.update_job_status(&job_id, JobUpdate::Processing, now) {
            return match e {
                StorageError::JobNotFound(_) | StorageError::InvalidTransition(_) => {
                    warn!(%job_id, error = %e, "job no longer pending in store, dropping from queue");
                    TickOutcome::Skipped { job_id }
                }
                _ => {
                    warn!(%job_id, error = %e, "could not mark job processing, requeued");
                    state.pending.push_front(job);
                    TickOutcome::Deferred { job_id }
                }
            };
        }

        if let Err(remaining) = state.budget.try_reserve(job.estimated_cost, now) {
            let failure = JobFailure::budget_exceeded(job.estimated_cost, remaining);
            warn!(%job_id, estimated_cost = job.estimated_cost, remaining, "budget exceeded, failing job");
            drop(state);
            if let Err(e) = self
                .store
                .update_job_status(&job_id, JobUpdate::Failed(failure.clone()), now)
            {
                error!(%job_id, error = %e, "could not record budget failure");
            }
            return TickOutcome::Rejected { job_id, failure };
        }

        state.active.insert(
            job_id,
            ActiveJob {
                reserved: job.estimated_cost,
                started_at: now,
                abort: None,
            },
        );
        drop(state);

        info!(%job_id, priority = %job.priority, estimated_cost = job.estimated_cost, "job dispatched");
        let handle = tokio::spawn(Arc::clone(self).execute(job));

        if let Some(active) = self.lock().active.get_mut(&job_id) {
            active.abort = Some(handle.abort_handle());
        }

        TickOutcome::Dispatched { job_id, handle }
    }

    /// Run a dispatched job through the pipeline and record the result
    async fn execute(self: Arc<Self>, job: ExtractionJob) {
        let job_id = job.id;

        let image = match job.image.resolve().await {
            Ok(image) => image,
            Err(failure) => {
                self.finish(job_id, Err(failure), 0);
                return;
            }
        };

        let mut request = ExtractionRequest::new(image, job.schema)
            .with_context(job.context)
            .with_discovery(job.discovery);
        request.fusion = job.fusion;

        let (result, spent) = match self.pipeline.run(&request).await {
            Ok(outcome) => {
                let spent = outcome.resource_cost;
                (Ok(Box::new(outcome)), spent)
            }
            Err(e) => {
                let spent = e.resource_cost();
                let failure = JobFailure::new(FailureKind::AllProvidersFailed, e.to_string());
                (Err(failure), spent)
            }
        };
        self.finish(job_id, result, spent);
    }

    /// Persist a job's result, then release its slot.
    ///
    /// The store is written while the job still counts as active, so a
    /// caller that sees the scheduler idle also sees the terminal status.
    fn finish(
        &self,
        job_id: JobId,
        result: Result<Box<crate::pipeline::ExtractionOutcome>, JobFailure>,
        spent: u64,
    ) {
        let now = Utc::now();
        let still_active = self.lock().active.contains_key(&job_id);

        if spent > 0 {
            if let Err(e) = self.store.record_resource_usage(&job_id, spent, now) {
                error!(%job_id, error = %e, "could not record token usage");
            }
        }

        if still_active {
            let update = match result {
                Ok(outcome) => {
                    info!(%job_id, tokens = spent, confidence = outcome.confidence, "job completed");
                    JobUpdate::Completed(outcome)
                }
                Err(failure) => {
                    warn!(%job_id, kind = ?failure.kind, error = %failure.message, tokens = spent, "job failed");
                    JobUpdate::Failed(failure)
                }
            };
            if let Err(e) = self.store.update_job_status(&job_id, update, now) {
                error!(%job_id, error = %e, "could not record job result");
            }
        } else {
            debug!(%job_id, "job finished after shutdown interrupted it");
        }

        let mut state = self.lock();
        match state.active.remove(&job_id) {
            Some(active) => {
                state.budget.settle(active.reserved, spent, now);
                let elapsed = (now - active.started_at).num_milliseconds().max(0) as u64;
                state.durations.push_back(elapsed);
                if state.durations.len() > DURATION_HISTORY {
                    state.durations.pop_front();
                }
            }
            // Shutdown already released the reservation
            None => state.budget.record(spent, now),
        }
    }

    /// Start the dispatch loop: tick, sleep for the tick interval, repeat
    /// until shutdown.
    pub fn start(self: &Arc<Self>) {
        let mut slot = self
            .dispatch_loop
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if slot.is_some() {
            return;
        }

        let scheduler = Arc::clone(self);
        let interval = self.config.tick_interval();
        info!(interval_ms = interval.as_millis() as u64, "dispatch loop started");

        *slot = Some(tokio::spawn(async move {
            loop {
                match scheduler.tick() {
                    TickOutcome::Idle(IdleReason::ShuttingDown) => break,
                    TickOutcome::Idle(reason) => debug!(?reason, "tick idle"),
                    outcome => debug!(job_id = ?outcome.job_id(), "tick handled job"),
                }
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = scheduler.shutdown.triggered() => break,
                }
            }
            debug!("dispatch loop stopped");
        }));
    }

    /// Stop dispatching, wait up to `drain_timeout` for running jobs, then
    /// abort whatever is left and mark it failed.
    pub async fn shutdown(&self, drain_timeout: Duration) -> ShutdownReport {
        self.shutdown.trigger();

        let dispatch_loop = self
            .dispatch_loop
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = dispatch_loop {
            if let Err(e) = handle.await {
                warn!(error = %e, "dispatch loop ended abnormally");
            }
        }

        let deadline = tokio::time::Instant::now() + drain_timeout;
        while !self.lock().active.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(DRAIN_POLL).await;
        }

        let now = Utc::now();
        let (stopped, pending) = {
            let mut state = self.lock();
            let stopped: Vec<(JobId, ActiveJob)> = state.active.drain().collect();
            for (_, active) in &stopped {
                state.budget.release(active.reserved);
                if let Some(abort) = &active.abort {
                    abort.abort();
                }
            }
            (stopped, state.pending.len())
        };

        let mut interrupted = Vec::with_capacity(stopped.len());
        for (job_id, _) in stopped {
            let failure = JobFailure::new(
                FailureKind::Interrupted,
                "interrupted by shutdown before completion",
            );
            match self
                .store
                .update_job_status(&job_id, JobUpdate::Failed(failure), now)
            {
                Ok(_) => interrupted.push(job_id),
                Err(StorageError::InvalidTransition(_)) => {
                    debug!(%job_id, "job reached a terminal status during shutdown");
                }
                Err(e) => {
                    error!(%job_id, error = %e, "could not mark interrupted job");
                    interrupted.push(job_id);
                }
            }
        }

        info!(
            interrupted = interrupted.len(),
            pending, "scheduler shut down"
        );
        ShutdownReport {
            drained: interrupted.is_empty(),
            interrupted,
            pending,
        }
    }

    /// Status, result and (for pending jobs) queue position and wait estimate
    pub fn job_status(&self, job_id: &JobId) -> SchedulerResult<Option<JobStatusView>> {
        let Some(job) = self.store.get_job(job_id)? else {
            return Ok(None);
        };
        let is_pending = job.status == JobStatus::Pending;
        let mut view = JobStatusView::from_job(job);

        if is_pending {
            let state = self.lock();
            if let Some(position) = state.pending.position(job_id) {
                let slots = self.config.max_concurrent.max(1) as u64;
                let waves = (position as u64).div_ceil(slots);
                view.queue_position = Some(position);
                view.estimated_wait_ms = Some(waves * state.average_duration_ms());
            }
        }
        Ok(Some(view))
    }

    pub fn overview(&self) -> SchedulerResult<QueueOverview> {
        let counts = self.store.count_by_status()?;
        let now = Utc::now();
        let mut state = self.lock();
        let budget = state.budget.snapshot(now);
        let active = state.active.len();

        Ok(QueueOverview {
            counts,
            queued: state.pending.len(),
            active,
            max_concurrent: self.config.max_concurrent,
            utilization_percent: budget.utilization,
            budget,
            average_duration_ms: state.average_duration_ms(),
            can_accept_jobs: active < self.config.max_concurrent
                && budget.remaining > self.config.safety_reserve,
        })
    }

    pub fn budget(&self) -> BudgetSnapshot {
        self.lock().budget.snapshot(Utc::now())
    }

    /// Number of jobs waiting in the queue
    pub fn queued(&self) -> usize {
        self.lock().pending.len()
    }

    /// Number of jobs currently running
    pub fn active(&self) -> usize {
        self.lock().active.len()
    }

    /// Purge completed/failed jobs older than the retention window
    pub fn cleanup(&self) -> SchedulerResult<usize> {
        self.cleanup_before(Utc::now() - self.config.retention())
    }

    /// Purge completed/failed jobs last updated before `cutoff`
    pub fn cleanup_before(&self, cutoff: DateTime<Utc>) -> SchedulerResult<usize> {
        let removed = self.store.delete_terminal_before(cutoff)?;
        if removed > 0 {
            info!(removed, "cleaned up finished jobs");
        }
        Ok(removed)
    }

    /// Rebuild queue state from the store after a restart.
    ///
    /// Pending jobs are re-queued oldest first. Jobs stuck in processing
    /// belonged to a previous process and are failed as interrupted. Usage
    /// recorded within the last window is charged to the budget at the time
    /// it was spent, so a sliding window frees it on schedule.
    pub fn recover(&self) -> SchedulerResult<RecoveryReport> {
        let now = Utc::now();
        let mut report = RecoveryReport::default();

        for job in self.store.list_jobs_by_status(JobStatus::Processing)? {
            if self.lock().active.contains_key(&job.id) {
                continue;
            }
            let failure = JobFailure::new(FailureKind::Interrupted, "interrupted by restart");
            self.store
                .update_job_status(&job.id, JobUpdate::Failed(failure), now)?;
            report.interrupted.push(job.id);
        }

        let pending = self.store.list_jobs_by_status(JobStatus::Pending)?;
        let usage = self.store.usage_entries_since(now - self.config.window())?;
        let used: u64 = usage.iter().map(|(_, tokens)| tokens).sum();

        let mut state = self.lock();
        for job in pending {
            if state.pending.contains(&job.id) {
                continue;
            }
            report.requeued.push(job.id);
            state.pending.push(job);
        }
        for (at, tokens) in usage {
            state.budget.record(tokens, at);
        }
        report.budget_used = used;
        drop(state);

        info!(
            requeued = report.requeued.len(),
            interrupted = report.interrupted.len(),
            budget_used = used,
            "recovered job store"
        );
        Ok(report)
    }

    /// Wait until nothing is queued or running
    pub async fn wait_until_idle(&self, poll: Duration) {
        loop {
            {
                let state = self.lock();
                if state.pending.is_empty() && state.active.is_empty() {
                    return;
                }
            }
            tokio::time::sleep(poll).await;
        }
    }
}

impl std::fmt::Debug for ExtractionScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("ExtractionScheduler")
            .field("queued", &state.pending.len())
            .field("active", &state.active.len())
            .field("max_concurrent", &self.config.max_concurrent)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{ImagePayload, MockProvider};
    use crate::queue::{ImageRef, Priority};
    use crate::schema::{AttributeDef, AttributeSchema};
    use crate::store::MemoryJobStore;

    fn schema() -> AttributeSchema {
        AttributeSchema::new(vec![AttributeDef::select("color", "Color", ["Red", "Blue"])])
    }

    fn submission() -> JobSubmission {
        JobSubmission::new(
            ImageRef::inline(&ImagePayload::new("image/png", vec![1, 2])),
            schema(),
        )
    }

    fn scheduler(config: SchedulerConfig, provider: Arc<MockProvider>) -> Arc<ExtractionScheduler> {
        let pipeline = StagedPipeline::new().with_fast(provider);
        ExtractionScheduler::new(config, Arc::new(pipeline), Arc::new(MemoryJobStore::new()))
    }

    #[tokio::test]
    async fn dispatched_job_completes_and_charges_actual_cost() {
        let provider = Arc::new(MockProvider::new("fast").with_answer("color", "Red", 95.0).with_cost(250));
        let scheduler = scheduler(SchedulerConfig::default(), provider.clone());
        let job_id = scheduler.add_job(submission()).unwrap();

        let TickOutcome::Dispatched { handle, .. } = scheduler.tick() else {
            panic!("expected dispatch");
        };
        handle.await.unwrap();

        let status = scheduler.job_status(&job_id).unwrap().unwrap();
        assert_eq!(status.status, JobStatus::Completed);
        assert!(status.result.is_some());
        let budget = scheduler.budget();
        assert_eq!(budget.used, 250);
        assert_eq!(budget.reserved, 0);
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn job_over_budget_fails_without_provider_call() {
        let provider = Arc::new(MockProvider::new("fast"));
        let config = SchedulerConfig {
            token_limit: 1_000,
            safety_reserve: 100,
            ..SchedulerConfig::default()
        };
        let scheduler = scheduler(config, provider.clone());
        // 800 base + 120 per attribute
        let job_id = scheduler
            .add_job(JobSubmission::new(
                ImageRef::inline(&ImagePayload::new("image/png", vec![])),
                AttributeSchema::new(vec![
                    AttributeDef::text("color", "Color"),
                    AttributeDef::text("fit", "Fit"),
                ]),
            ))
            .unwrap();

        let outcome = scheduler.tick();

        assert!(matches!(outcome, TickOutcome::Rejected { .. }));
        assert_eq!(provider.calls(), 0);
        let status = scheduler.job_status(&job_id).unwrap().unwrap();
        assert_eq!(status.status, JobStatus::Failed);
        assert_eq!(status.error.unwrap().kind, FailureKind::BudgetExceeded);
    }

    #[tokio::test]
    async fn concurrency_cap_holds_back_dispatch() {
        let provider = Arc::new(MockProvider::new("fast").with_delay(Duration::from_millis(200)));
        let config = SchedulerConfig {
            max_concurrent: 1,
            ..SchedulerConfig::default()
        };
        let scheduler = scheduler(config, provider);
        scheduler.add_job(submission()).unwrap();
        let second = scheduler.add_job(submission()).unwrap();

        let TickOutcome::Dispatched { handle, .. } = scheduler.tick() else {
            panic!("expected dispatch");
        };
        assert!(matches!(scheduler.tick(), TickOutcome::Idle(IdleReason::AtCapacity)));
        assert!(!scheduler.overview().unwrap().can_accept_jobs);

        let waiting = scheduler.job_status(&second).unwrap().unwrap();
        assert_eq!(waiting.queue_position, Some(1));
        assert_eq!(waiting.estimated_wait_ms, Some(DEFAULT_JOB_DURATION_MS));

        handle.await.unwrap();
        assert!(matches!(scheduler.tick(), TickOutcome::Dispatched { .. }));
    }

    #[tokio::test]
    async fn high_priority_dispatches_first() {
        let provider = Arc::new(MockProvider::new("fast"));
        let scheduler = scheduler(SchedulerConfig::default(), provider);
        let normal = scheduler.add_job(submission()).unwrap();
        let high = scheduler
            .add_job(submission().with_priority(Priority::High))
            .unwrap();

        assert_eq!(scheduler.job_status(&high).unwrap().unwrap().queue_position, Some(1));
        assert_eq!(scheduler.tick().job_id(), Some(high));
        assert_eq!(scheduler.tick().job_id(), Some(normal));
    }

    #[tokio::test]
    async fn shutdown_rejects_new_jobs() {
        let provider = Arc::new(MockProvider::new("fast"));
        let scheduler = scheduler(SchedulerConfig::default(), provider);
        let report = scheduler.shutdown(Duration::from_millis(10)).await;

        assert!(report.drained);
        assert!(matches!(
            scheduler.add_job(submission()),
            Err(SchedulerError::ShuttingDown)
        ));
        assert!(matches!(scheduler.tick(), TickOutcome::Idle(IdleReason::ShuttingDown)));
    }
}
