//! Driver for async host jobs started from script.
//!
//! When script calls an async-bound function, the dispatch path hands the
//! host future to the driver and the drain loop polls it here until it
//! completes. Jobs are cancelled by dropping their futures: a cancelled job
//! can never reach its settlement path.

mod futures_unordered_driver;
mod pending_job;
mod submission_queue;

pub(crate) use futures_unordered_driver::FuturesUnorderedDriver;
pub(crate) use pending_job::{CompletedJob, JobFuture, PendingJobInfo};
#[allow(unused_imports)]
pub(crate) use submission_queue::{QueuedJob, SubmissionQueue};

use std::future::Future;
use std::task::{Context, Poll};

use crate::runtime::error::Error;
use crate::runtime::js_value::JsValue;

/// Identifier of one in-flight job, unique per runtime.
pub type JobId = u64;

/// What a job produced: a value to resolve with or an error to reject with.
pub(crate) type JobOutcome = Result<JsValue, Error>;

/// Statistics about jobs handled by a driver.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct JobStats {
    /// Jobs currently queued or being polled
    pub pending: usize,
    /// Total jobs submitted over the driver's lifetime
    pub submitted: usize,
    /// Total jobs that ran to completion
    pub completed: usize,
}

/// Core trait for job drivers.
///
/// A driver owns the set of in-flight host jobs spawned by async bindings:
/// it accepts submissions, surfaces completions one at a time, and drops
/// everything on cancellation.
pub(crate) trait JobDriver: Default {
    /// Queue a job for polling. Ignored after shutdown.
    fn submit(&self, job_id: JobId, job: impl Future<Output = JobOutcome> + 'static);

    /// Poll for the next completed job.
    ///
    /// Returns `Poll::Pending` while every job is still running or none are
    /// in flight.
    fn poll_ready(&self, cx: &mut Context) -> Poll<CompletedJob>;

    /// Number of in-flight jobs.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every in-flight job without shutting the driver down.
    fn cancel_pending(&self);

    /// Drop every in-flight job and refuse further submissions.
    fn shutdown(&self);

    fn is_shutdown(&self) -> bool;

    fn stats(&self) -> JobStats;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_stats_default() {
        let stats = JobStats::default();
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.submitted, 0);
        assert_eq!(stats.completed, 0);
    }
}
