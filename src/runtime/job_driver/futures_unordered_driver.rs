//! FuturesUnordered-based job driver.

use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::stream::{FuturesUnordered, StreamExt};

use super::pending_job::{CompletedJob, JobFuture, PendingJobInfo};
use super::submission_queue::{QueuedJob, SubmissionQueue};
use super::{JobDriver, JobId, JobOutcome, JobStats};

/// Job future tagged with its identity for tracking in `FuturesUnordered`.
struct TaggedJob {
    info: PendingJobInfo,
    future: JobFuture,
}

impl Future for TaggedJob {
    type Output = CompletedJob;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.future).poll(cx) {
            Poll::Ready(outcome) => Poll::Ready(CompletedJob {
                job_id: self.info.job_id,
                outcome,
            }),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Drives in-flight host jobs concurrently with `FuturesUnordered`.
///
/// Submissions are parked in a queue (they arrive while script is executing)
/// and transferred to the polling set the next time the drain loop asks for a
/// completion. Dropping a job's future is its cancellation.
pub(crate) struct FuturesUnorderedDriver {
    queue: RefCell<SubmissionQueue>,
    futures: RefCell<FuturesUnordered<TaggedJob>>,
    total_submitted: RefCell<usize>,
    total_completed: RefCell<usize>,
    shutdown: RefCell<bool>,
}

impl Default for FuturesUnorderedDriver {
    fn default() -> Self {
        Self {
            queue: RefCell::new(SubmissionQueue::new()),
            futures: RefCell::new(FuturesUnordered::new()),
            total_submitted: RefCell::new(0),
            total_completed: RefCell::new(0),
            shutdown: RefCell::new(false),
        }
    }
}

impl FuturesUnorderedDriver {
    /// Transfer queued jobs into the polling set.
    fn drain_queue(&self) {
        let mut queue = self.queue.borrow_mut();
        let futures = self.futures.borrow_mut();

        for queued in queue.drain() {
            futures.push(TaggedJob {
                info: queued.info,
                future: queued.future,
            });
        }
    }
}

impl JobDriver for FuturesUnorderedDriver {
    fn submit(&self, job_id: JobId, job: impl Future<Output = JobOutcome> + 'static) {
        if *self.shutdown.borrow() {
            return;
        }

        *self.total_submitted.borrow_mut() += 1;

        let info = PendingJobInfo::new(job_id);
        self.queue
            .borrow_mut()
            .push(QueuedJob::new(info, JobFuture::new(job)));
    }

    fn poll_ready(&self, cx: &mut Context) -> Poll<CompletedJob> {
        if *self.shutdown.borrow() {
            return Poll::Pending;
        }

        self.drain_queue();

        let mut futures = self.futures.borrow_mut();
        match futures.poll_next_unpin(cx) {
            Poll::Ready(Some(completed)) => {
                *self.total_completed.borrow_mut() += 1;
                Poll::Ready(completed)
            }
            Poll::Ready(None) | Poll::Pending => Poll::Pending,
        }
    }

    fn len(&self) -> usize {
        self.queue.borrow().len() + self.futures.borrow().len()
    }

    fn cancel_pending(&self) {
        self.queue.borrow_mut().clear();
        self.futures.borrow_mut().clear();
    }

    fn shutdown(&self) {
        *self.shutdown.borrow_mut() = true;
        self.cancel_pending();
    }

    fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn stats(&self) -> JobStats {
        JobStats {
            pending: self.len(),
            submitted: *self.total_submitted.borrow(),
            completed: *self.total_completed.borrow(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::error::Error;
    use crate::runtime::js_value::JsValue;

    fn ready_ok(v: i64) -> impl Future<Output = JobOutcome> {
        std::future::ready(Ok(JsValue::Int(v)))
    }

    #[test]
    fn submissions_are_queued() {
        let driver = FuturesUnorderedDriver::default();
        driver.submit(1, ready_ok(42));

        assert_eq!(driver.len(), 1);
        let stats = driver.stats();
        assert_eq!(stats.submitted, 1);
        assert_eq!(stats.completed, 0);
    }

    #[tokio::test]
    async fn poll_ready_surfaces_completions() {
        let driver = FuturesUnorderedDriver::default();
        driver.submit(7, ready_ok(42));

        let completed = futures::future::poll_fn(|cx| driver.poll_ready(cx)).await;
        assert_eq!(completed.job_id, 7);
        assert_eq!(completed.outcome.unwrap(), JsValue::Int(42));

        assert!(driver.is_empty());
        assert_eq!(driver.stats().completed, 1);
    }

    #[tokio::test]
    async fn completions_arrive_per_job() {
        let driver = FuturesUnorderedDriver::default();
        driver.submit(1, ready_ok(1));
        driver.submit(2, ready_ok(2));
        driver.submit(3, ready_ok(3));
        assert_eq!(driver.len(), 3);

        let mut seen = Vec::new();
        for _ in 0..3 {
            let completed = futures::future::poll_fn(|cx| driver.poll_ready(cx)).await;
            seen.push(completed.job_id);
        }
        seen.sort_unstable();
        assert_eq!(seen, vec![1, 2, 3]);
        assert!(driver.is_empty());
    }

    #[tokio::test]
    async fn failed_jobs_deliver_their_error() {
        let driver = FuturesUnorderedDriver::default();
        driver.submit(9, std::future::ready(Err(Error::host("boom"))));

        let completed = futures::future::poll_fn(|cx| driver.poll_ready(cx)).await;
        assert_eq!(completed.job_id, 9);
        assert!(matches!(completed.outcome, Err(Error::Host(m)) if m == "boom"));
    }

    #[test]
    fn cancel_pending_drops_jobs_but_accepts_new_ones() {
        let driver = FuturesUnorderedDriver::default();
        driver.submit(1, ready_ok(1));
        driver.cancel_pending();
        assert!(driver.is_empty());

        driver.submit(2, ready_ok(2));
        assert_eq!(driver.len(), 1);
    }

    #[test]
    fn shutdown_refuses_new_submissions() {
        let driver = FuturesUnorderedDriver::default();
        driver.submit(1, ready_ok(1));
        driver.shutdown();

        assert!(driver.is_empty());
        assert!(driver.is_shutdown());

        driver.submit(2, ready_ok(2));
        assert!(driver.is_empty());
    }
}
