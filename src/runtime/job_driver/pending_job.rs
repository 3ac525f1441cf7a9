//! Pending job metadata and future wrapping.

use std::future::Future;
use std::pin::Pin;

use super::{JobId, JobOutcome};

/// Identity of a job submitted to the driver.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PendingJobInfo {
    pub job_id: JobId,
}

impl PendingJobInfo {
    pub fn new(job_id: JobId) -> Self {
        Self { job_id }
    }
}

/// A job that has run to completion, ready for settlement.
pub(crate) struct CompletedJob {
    pub job_id: JobId,
    pub outcome: JobOutcome,
}

/// Boxed host future as stored by the driver.
///
/// Futures are polled on the runtime thread only, so they need not be `Send`.
pub(crate) struct JobFuture {
    inner: Pin<Box<dyn Future<Output = JobOutcome> + 'static>>,
}

impl JobFuture {
    pub fn new(future: impl Future<Output = JobOutcome> + 'static) -> Self {
        Self {
            inner: Box::pin(future),
        }
    }
}

impl Future for JobFuture {
    type Output = JobOutcome;

    fn poll(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Self::Output> {
        self.inner.as_mut().poll(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::js_value::JsValue;

    #[test]
    fn pending_job_info_carries_id() {
        let info = PendingJobInfo::new(17);
        assert_eq!(info.job_id, 17);
    }

    #[tokio::test]
    async fn job_future_passes_outcome_through() {
        let fut = JobFuture::new(async { Ok(JsValue::Int(5)) });
        let outcome = fut.await;
        assert_eq!(outcome.unwrap(), JsValue::Int(5));
    }

    #[tokio::test]
    async fn job_future_passes_errors_through() {
        let fut = JobFuture::new(async { Err(crate::runtime::error::Error::host("nope")) });
        let outcome = fut.await;
        assert!(outcome.is_err());
    }
}
