//! Queue for jobs submitted but not yet being polled.

use std::collections::VecDeque;

use super::pending_job::{JobFuture, PendingJobInfo};

/// Entry in the submission queue.
pub(crate) struct QueuedJob {
    pub info: PendingJobInfo,
    pub future: JobFuture,
}

impl QueuedJob {
    pub fn new(info: PendingJobInfo, future: JobFuture) -> Self {
        Self { info, future }
    }
}

/// FIFO of submitted jobs, drained into the polling set by the driver.
///
/// Submissions happen while the engine is executing script (the dispatcher
/// cannot poll), so they are parked here until the drain loop next looks for
/// completions.
pub(crate) struct SubmissionQueue {
    queue: VecDeque<QueuedJob>,
}

impl SubmissionQueue {
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
        }
    }

    pub fn push(&mut self, job: QueuedJob) {
        self.queue.push_back(job);
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    pub fn drain(&mut self) -> impl Iterator<Item = QueuedJob> + '_ {
        self.queue.drain(..)
    }
}

impl Default for SubmissionQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::js_value::JsValue;

    fn queued(id: u64) -> QueuedJob {
        QueuedJob::new(
            PendingJobInfo::new(id),
            JobFuture::new(async { Ok(JsValue::Undefined) }),
        )
    }

    #[test]
    fn fifo_order_is_preserved() {
        let mut queue = SubmissionQueue::new();
        for id in 0..5 {
            queue.push(queued(id));
        }
        assert_eq!(queue.len(), 5);

        let drained: Vec<_> = queue.drain().collect();
        for (i, job) in drained.iter().enumerate() {
            assert_eq!(job.info.job_id, i as u64);
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn clear_empties_the_queue() {
        let mut queue = SubmissionQueue::new();
        queue.push(queued(1));
        queue.push(queued(2));
        queue.clear();
        assert!(queue.is_empty());
    }
}
