//! Priority-ordered queue of jobs waiting for dispatch

use super::job::{ExtractionJob, JobId, Priority};
use std::collections::VecDeque;

/// One FIFO per priority tier. High drains before normal, normal before low.
#[derive(Debug, Default)]
pub(crate) struct PendingQueue {
    high: VecDeque<ExtractionJob>,
    normal: VecDeque<ExtractionJob>,
    low: VecDeque<ExtractionJob>,
}

impl PendingQueue {
    fn tier(&mut self, priority: Priority) -> &mut VecDeque<ExtractionJob> {
        match priority {
            Priority::High => &mut self.high,
            Priority::Normal => &mut self.normal,
            Priority::Low => &mut self.low,
        }
    }

    pub fn push(&mut self, job: ExtractionJob) {
        self.tier(job.priority).push_back(job);
    }

    /// Return a popped job to the head of its tier
    pub fn push_front(&mut self, job: ExtractionJob) {
        self.tier(job.priority).push_front(job);
    }

    pub fn pop(&mut self) -> Option<ExtractionJob> {
        self.high
            .pop_front()
            .or_else(|| self.normal.pop_front())
            .or_else(|| self.low.pop_front())
    }

    /// Jobs in dispatch order
    pub fn iter(&self) -> impl Iterator<Item = &ExtractionJob> {
        self.high.iter().chain(self.normal.iter()).chain(self.low.iter())
    }

    /// 1-based dispatch position of a queued job
    pub fn position(&self, id: &JobId) -> Option<usize> {
        self.iter().position(|job| job.id == *id).map(|p| p + 1)
    }

    pub fn contains(&self, id: &JobId) -> bool {
        self.iter().any(|job| job.id == *id)
    }

    pub fn len(&self) -> usize {
        self.high.len() + self.normal.len() + self.low.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ImagePayload;
    use crate::queue::{ImageRef, JobSubmission};
    use crate::schema::AttributeSchema;
    use chrono::Utc;

    fn job(priority: Priority) -> ExtractionJob {
        let submission = JobSubmission::new(
            ImageRef::inline(&ImagePayload::new("image/png", vec![])),
            AttributeSchema::default(),
        );
        ExtractionJob::new(submission, priority, 800, Utc::now())
    }

    #[test]
    fn high_before_normal_before_low_fifo_within_tier() {
        let mut queue = PendingQueue::default();
        let low = job(Priority::Low);
        let normal_a = job(Priority::Normal);
        let high = job(Priority::High);
        let normal_b = job(Priority::Normal);
        for j in [&low, &normal_a, &high, &normal_b] {
            queue.push(j.clone());
        }

        assert_eq!(queue.position(&high.id), Some(1));
        assert_eq!(queue.position(&low.id), Some(4));

        let order: Vec<JobId> = std::iter::from_fn(|| queue.pop()).map(|j| j.id).collect();
        assert_eq!(order, vec![high.id, normal_a.id, normal_b.id, low.id]);
        assert!(queue.is_empty());
    }
}
