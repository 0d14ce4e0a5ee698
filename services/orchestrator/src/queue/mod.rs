//! Job queue abstraction.
//!
//! The reconciler only ever sees this trait; the GitHub-backed client and
//! the in-memory mock are interchangeable behind it.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod github;
mod mock;

pub use github::GithubQueue;
pub use mock::MockQueue;

/// A queued CI job as reported by the queue provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedJob {
    pub id: u64,
    pub run_id: u64,
    pub repository: String,
    pub labels: Vec<String>,
}

/// Coarse lifecycle of a job on the provider side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Queued,
    InProgress,
    Completed,
}

/// One-time runner registration credential.
#[derive(Debug, Clone)]
pub struct RunnerCredential {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("rate limited by job queue")]
    RateLimited { retry_after: Option<Duration> },

    #[error("job queue request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("job queue returned {status}: {body}")]
    Unexpected {
        status: reqwest::StatusCode,
        body: String,
    },
}

/// Read side of the CI provider plus credential issuance.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// All currently queued jobs across the watched repositories.
    async fn list_queued_jobs(&self) -> Result<Vec<QueuedJob>, QueueError>;

    /// Mint a one-time registration credential for a runner.
    async fn issue_credential(&self, runner_name: &str) -> Result<RunnerCredential, QueueError>;

    /// Current status of one job, `None` if the provider no longer knows it.
    async fn job_status(
        &self,
        repository: &str,
        job_id: u64,
    ) -> Result<Option<JobStatus>, QueueError>;

    /// Drop a runner's registration on the queue side. Unknown names are a
    /// success: ephemeral runners deregister themselves on a clean exit,
    /// this only mops up after aborts and crashes.
    async fn remove_runner(&self, runner_name: &str) -> Result<(), QueueError>;
}
