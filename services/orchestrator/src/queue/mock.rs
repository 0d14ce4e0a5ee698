//! In-memory [`JobQueue`] used in dev mode and tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;

use super::{JobQueue, JobStatus, QueueError, QueuedJob, RunnerCredential};

/// Scriptable queue. Jobs, statuses, and failures are all driven by the
/// caller; nothing happens on its own.
#[derive(Debug, Default)]
pub struct MockQueue {
    jobs: Mutex<Vec<QueuedJob>>,
    statuses: Mutex<HashMap<u64, JobStatus>>,
    token_counter: AtomicU64,
    list_calls: AtomicU64,
    credential_calls: AtomicU64,
    rate_limited_lists: AtomicU64,
    rate_limit_hint: Mutex<Option<Duration>>,
    failing_credentials: AtomicU64,
    failing_statuses: AtomicU64,
    removed_runners: Mutex<Vec<String>>,
}

impl MockQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a job to the queue listing with status `Queued`.
    pub fn push_job(&self, job: QueuedJob) {
        self.statuses.lock().unwrap().insert(job.id, JobStatus::Queued);
        self.jobs.lock().unwrap().push(job);
    }

    /// Drop a job from the listing without changing its status.
    pub fn withdraw_job(&self, job_id: u64) {
        self.jobs.lock().unwrap().retain(|j| j.id != job_id);
    }

    /// Report a job with the given status from now on.
    pub fn set_status(&self, job_id: u64, status: JobStatus) {
        self.statuses.lock().unwrap().insert(job_id, status);
        if status != JobStatus::Queued {
            self.withdraw_job(job_id);
        }
    }

    /// Make the provider forget the job entirely (`job_status` -> `None`).
    pub fn forget_job(&self, job_id: u64) {
        self.withdraw_job(job_id);
        self.statuses.lock().unwrap().remove(&job_id);
    }

    /// Fail the next `count` listings with a rate-limit error.
    pub fn rate_limit_listings(&self, count: u64, retry_after: Option<Duration>) {
        *self.rate_limit_hint.lock().unwrap() = retry_after;
        self.rate_limited_lists.store(count, Ordering::SeqCst);
    }

    /// Fail the next `count` credential issuances.
    pub fn fail_credentials(&self, count: u64) {
        self.failing_credentials.store(count, Ordering::SeqCst);
    }

    /// Fail the next `count` status lookups.
    pub fn fail_statuses(&self, count: u64) {
        self.failing_statuses.store(count, Ordering::SeqCst);
    }

    /// Runner names deregistered so far, in call order.
    pub fn removed_runners(&self) -> Vec<String> {
        self.removed_runners.lock().unwrap().clone()
    }

    pub fn list_calls(&self) -> u64 {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn credential_calls(&self) -> u64 {
        self.credential_calls.load(Ordering::SeqCst)
    }

    fn take(counter: &AtomicU64) -> bool {
        let remaining = counter.load(Ordering::SeqCst);
        if remaining > 0 {
            counter.store(remaining - 1, Ordering::SeqCst);
            true
        } else {
            false
        }
    }
}

#[async_trait]
impl JobQueue for MockQueue {
    async fn list_queued_jobs(&self) -> Result<Vec<QueuedJob>, QueueError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if Self::take(&self.rate_limited_lists) {
            debug!("[MOCK] Listing rate limited");
            return Err(QueueError::RateLimited {
                retry_after: *self.rate_limit_hint.lock().unwrap(),
            });
        }
        let jobs = self.jobs.lock().unwrap().clone();
        debug!(count = jobs.len(), "[MOCK] Listing queued jobs");
        Ok(jobs)
    }

    async fn issue_credential(&self, runner_name: &str) -> Result<RunnerCredential, QueueError> {
        self.credential_calls.fetch_add(1, Ordering::SeqCst);
        if Self::take(&self.failing_credentials) {
            debug!(runner_name, "[MOCK] Credential issuance failing");
            return Err(QueueError::Unexpected {
                status: reqwest::StatusCode::INTERNAL_SERVER_ERROR,
                body: "mock issuance failure".to_string(),
            });
        }
        let n = self.token_counter.fetch_add(1, Ordering::SeqCst);
        debug!(runner_name, "[MOCK] Issued registration token");
        Ok(RunnerCredential {
            token: format!("mock-token-{n}"),
            expires_at: Utc::now() + Duration::from_secs(3600),
        })
    }

    async fn job_status(
        &self,
        _repository: &str,
        job_id: u64,
    ) -> Result<Option<JobStatus>, QueueError> {
        if Self::take(&self.failing_statuses) {
            debug!(job_id, "[MOCK] Status lookup failing");
            return Err(QueueError::Unexpected {
                status: reqwest::StatusCode::INTERNAL_SERVER_ERROR,
                body: "mock status failure".to_string(),
            });
        }
        Ok(self.statuses.lock().unwrap().get(&job_id).copied())
    }

    async fn remove_runner(&self, runner_name: &str) -> Result<(), QueueError> {
        debug!(runner_name, "[MOCK] Runner deregistered");
        self.removed_runners
            .lock()
            .unwrap()
            .push(runner_name.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(id: u64) -> QueuedJob {
        QueuedJob {
            id,
            run_id: 1,
            repository: "acme/widgets".to_string(),
            labels: vec!["runs-on=J1".to_string()],
        }
    }

    #[tokio::test]
    async fn test_push_and_list() {
        let queue = MockQueue::new();
        queue.push_job(job(5));

        let listed = queue.list_queued_jobs().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(queue.job_status("acme/widgets", 5).await.unwrap(), Some(JobStatus::Queued));
        assert_eq!(queue.list_calls(), 1);
    }

    #[tokio::test]
    async fn test_completion_withdraws_from_listing() {
        let queue = MockQueue::new();
        queue.push_job(job(5));
        queue.set_status(5, JobStatus::Completed);

        assert!(queue.list_queued_jobs().await.unwrap().is_empty());
        assert_eq!(
            queue.job_status("acme/widgets", 5).await.unwrap(),
            Some(JobStatus::Completed)
        );
    }

    #[tokio::test]
    async fn test_rate_limit_is_consumed() {
        let queue = MockQueue::new();
        queue.rate_limit_listings(1, Some(Duration::from_secs(9)));

        let err = queue.list_queued_jobs().await.unwrap_err();
        assert!(matches!(
            err,
            QueueError::RateLimited { retry_after: Some(d) } if d == Duration::from_secs(9)
        ));
        assert!(queue.list_queued_jobs().await.is_ok());
    }

    #[tokio::test]
    async fn test_tokens_are_unique() {
        let queue = MockQueue::new();
        let a = queue.issue_credential("runner-a").await.unwrap();
        let b = queue.issue_credential("runner-b").await.unwrap();
        assert_ne!(a.token, b.token);
        assert_eq!(queue.credential_calls(), 2);
    }
}
