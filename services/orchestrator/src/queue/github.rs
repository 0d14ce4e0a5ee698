//! GitHub Actions implementation of [`JobQueue`].

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, RETRY_AFTER};
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::debug;

use super::{JobQueue, JobStatus, QueueError, QueuedJob, RunnerCredential};

const USER_AGENT: &str = "kiln-orchestrator/0.1.0";

/// GitHub REST client scoped to one organization.
#[derive(Debug, Clone)]
pub struct GithubQueue {
    client: reqwest::Client,
    api_base: String,
    org: String,
    repo: Option<String>,
}

impl GithubQueue {
    pub fn new(
        api_base: &str,
        org: &str,
        repo: Option<String>,
        token: &str,
        call_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/vnd.github+json"));
        headers.insert(
            "X-GitHub-Api-Version",
            HeaderValue::from_static("2022-11-28"),
        );
        let mut auth = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|_| anyhow::anyhow!("GitHub token contains invalid header characters"))?;
        auth.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth);

        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .default_headers(headers)
            .timeout(call_timeout)
            .build()?;

        Ok(Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            org: org.to_string(),
            repo,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_base, path)
    }

    /// Repositories to scan: the configured one, or every repo in the org.
    async fn repositories(&self) -> Result<Vec<String>, QueueError> {
        if let Some(repo) = &self.repo {
            return Ok(vec![format!("{}/{}", self.org, repo)]);
        }

        let mut repos = Vec::new();
        let mut page = 1u32;
        loop {
            let url = self.url(&format!(
                "/orgs/{}/repos?per_page=100&page={}",
                self.org, page
            ));
            debug!(%url, "Listing organization repositories");
            let response = check(self.client.get(&url).send().await?).await?;
            let batch: Vec<RepoSummary> = response.json().await?;
            let len = batch.len();
            repos.extend(batch.into_iter().map(|r| r.full_name));
            if len < 100 {
                break;
            }
            page += 1;
        }
        Ok(repos)
    }

    async fn queued_jobs_in(&self, full_name: &str) -> Result<Vec<QueuedJob>, QueueError> {
        let url = self.url(&format!(
            "/repos/{full_name}/actions/runs?status=queued&per_page=50"
        ));
        debug!(%url, "Listing queued workflow runs");
        let response = check(self.client.get(&url).send().await?).await?;
        let runs: RunsResponse = response.json().await?;

        let mut jobs = Vec::new();
        for run in runs.workflow_runs {
            let url = self.url(&format!("/repos/{full_name}/actions/runs/{}/jobs", run.id));
            debug!(%url, "Listing jobs for run");
            let response = check(self.client.get(&url).send().await?).await?;
            let body: JobsResponse = response.json().await?;
            for job in body.jobs {
                if job.status != "queued" {
                    continue;
                }
                if !job.labels.iter().any(|l| l.starts_with("runs-on=")) {
                    continue;
                }
                jobs.push(QueuedJob {
                    id: job.id,
                    run_id: job.run_id,
                    repository: full_name.to_string(),
                    labels: job.labels,
                });
            }
        }
        Ok(jobs)
    }

    /// The org-level id of a registered runner, `None` if no runner with
    /// that name exists.
    async fn find_runner_id(&self, runner_name: &str) -> Result<Option<u64>, QueueError> {
        let mut page = 1u32;
        loop {
            let url = self.url(&format!(
                "/orgs/{}/actions/runners?per_page=100&page={}",
                self.org, page
            ));
            debug!(%url, "Listing organization runners");
            let response = check(self.client.get(&url).send().await?).await?;
            let listing: RunnersResponse = response.json().await?;
            if let Some(runner) = listing.runners.iter().find(|r| r.name == runner_name) {
                return Ok(Some(runner.id));
            }
            if listing.runners.len() < 100 {
                return Ok(None);
            }
            page += 1;
        }
    }
}

#[async_trait]
impl JobQueue for GithubQueue {
    async fn list_queued_jobs(&self) -> Result<Vec<QueuedJob>, QueueError> {
        let mut jobs = Vec::new();
        for full_name in self.repositories().await? {
            jobs.extend(self.queued_jobs_in(&full_name).await?);
        }
        Ok(jobs)
    }

    async fn issue_credential(&self, runner_name: &str) -> Result<RunnerCredential, QueueError> {
        let url = self.url(&format!(
            "/orgs/{}/actions/runners/registration-token",
            self.org
        ));
        debug!(%url, runner_name, "Requesting runner registration token");
        let response = check(self.client.post(&url).send().await?).await?;
        let token: RegistrationToken = response.json().await?;
        Ok(RunnerCredential {
            token: token.token,
            expires_at: token.expires_at,
        })
    }

    async fn job_status(
        &self,
        repository: &str,
        job_id: u64,
    ) -> Result<Option<JobStatus>, QueueError> {
        let url = self.url(&format!("/repos/{repository}/actions/jobs/{job_id}"));
        debug!(%url, "Fetching job status");
        let response = self.client.get(&url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = check(response).await?;
        let job: JobDetail = response.json().await?;
        Ok(Some(parse_status(&job.status)))
    }

    async fn remove_runner(&self, runner_name: &str) -> Result<(), QueueError> {
        let Some(runner_id) = self.find_runner_id(runner_name).await? else {
            debug!(runner_name, "Runner not registered, nothing to remove");
            return Ok(());
        };
        let url = self.url(&format!("/orgs/{}/actions/runners/{}", self.org, runner_id));
        debug!(%url, runner_name, "Removing runner registration");
        let response = self.client.delete(&url).send().await?;
        // Gone between listing and delete is the goal state anyway.
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        check(response).await?;
        Ok(())
    }
}

/// Map a non-success response to the queue error taxonomy.
async fn check(response: reqwest::Response) -> Result<reqwest::Response, QueueError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let remaining_zero = response
        .headers()
        .get("x-ratelimit-remaining")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == "0");
    if status == StatusCode::TOO_MANY_REQUESTS || (status == StatusCode::FORBIDDEN && remaining_zero)
    {
        return Err(QueueError::RateLimited {
            retry_after: retry_after_hint(response.headers()),
        });
    }

    let body = response.text().await.unwrap_or_default();
    Err(QueueError::Unexpected { status, body })
}

/// Retry hint from `Retry-After` seconds or an `X-RateLimit-Reset` epoch.
fn retry_after_hint(headers: &HeaderMap) -> Option<Duration> {
    if let Some(seconds) = headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
    {
        return Some(Duration::from_secs(seconds));
    }
    let reset = headers
        .get("x-ratelimit-reset")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<i64>().ok())?;
    let now = Utc::now().timestamp();
    Some(Duration::from_secs(reset.saturating_sub(now).max(0) as u64))
}

/// GitHub reports more states than we track; anything unrecognized is
/// treated as still queued so a live runner is never torn down early.
fn parse_status(status: &str) -> JobStatus {
    match status {
        "completed" => JobStatus::Completed,
        "in_progress" => JobStatus::InProgress,
        _ => JobStatus::Queued,
    }
}

#[derive(Debug, Deserialize)]
struct RepoSummary {
    full_name: String,
}

#[derive(Debug, Deserialize)]
struct RunsResponse {
    workflow_runs: Vec<WorkflowRun>,
}

#[derive(Debug, Deserialize)]
struct WorkflowRun {
    id: u64,
}

#[derive(Debug, Deserialize)]
struct JobsResponse {
    jobs: Vec<WorkflowJobEntry>,
}

#[derive(Debug, Deserialize)]
struct WorkflowJobEntry {
    id: u64,
    run_id: u64,
    status: String,
    #[serde(default)]
    labels: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RunnersResponse {
    runners: Vec<RunnerSummary>,
}

#[derive(Debug, Deserialize)]
struct RunnerSummary {
    id: u64,
    name: String,
}

#[derive(Debug, Deserialize)]
struct RegistrationToken {
    token: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct JobDetail {
    status: String,
}
