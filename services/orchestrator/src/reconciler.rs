//! The reconciliation loop.
//!
//! One pass polls the queue, admits newly discovered jobs, and then gives
//! every record that is due a turn on the state machine. Webhook signals
//! feed the same machine between passes, so the trigger source never
//! changes the semantics.
//!
//! # Invariants
//!
//! - All phase changes go through [`JobStore`]; a concurrent abort is
//!   observed as a phase mismatch and treated as a benign race.
//! - The fleet-size cap throttles new provisioning, it never fails a job.
//! - A capacity miss walks the selector's fallback candidates within the
//!   same attempt before the attempt counts as failed.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use kiln_retry::{BackoffPolicy, RetryTracker, DEFAULT_MAX_ATTEMPTS, DEFAULT_RETRY_WINDOW};
use serde::Serialize;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tracing::{debug, error, info, instrument, warn};

use crate::error::OrchestratorError;
use crate::fleet::{
    Fleet, FleetError, InstanceStatus, RequestInstance, MANAGED_BY, TAG_JOB_ID, TAG_MANAGED_BY,
    TAG_NAME, TAG_NAMESPACE, TAG_RUNNER_NAME, TAG_RUN_KEY,
};
use crate::labels::parse_labels;
use crate::queue::{JobQueue, JobStatus, QueuedJob, RunnerCredential};
use crate::selector::Selector;
use crate::store::{age, JobPhase, JobRecord, JobStore, StoreError};

/// Credentials closer to expiry than this are re-issued before use.
const CREDENTIAL_EXPIRY_SLACK: Duration = Duration::from_secs(300);

/// Lifecycle hint pushed from the webhook ingress.
#[derive(Debug, Clone, PartialEq)]
pub enum JobSignal {
    Queued(QueuedJob),
    Completed { job_id: u64 },
}

/// Health of one remote client, as seen by the loop.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ClientHealth {
    pub last_success_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub backoff_until: Option<DateTime<Utc>>,
}

impl ClientHealth {
    pub(crate) fn note_ok(&mut self) {
        self.last_success_at = Some(Utc::now());
        self.consecutive_failures = 0;
        self.last_error = None;
        self.backoff_until = None;
    }

    pub(crate) fn note_err(&mut self, message: &str) {
        self.consecutive_failures += 1;
        self.last_error = Some(message.to_string());
    }
}

/// Snapshot of loop liveness exposed on the control surface.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LoopHealth {
    pub last_tick_at: Option<DateTime<Utc>>,
    pub queue: ClientHealth,
    pub fleet: ClientHealth,
}

/// Counters from one reconcile pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassStats {
    pub listed: usize,
    pub admitted: usize,
    pub pruned: usize,
    pub driven: usize,
    pub list_failed: bool,
}

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub poll_interval: Duration,
    pub max_concurrent_instances: usize,
    pub max_attempts: u32,
    pub idle_timeout: Duration,
    pub provision_timeout: Duration,
    pub max_active_age: Duration,
    pub orphan_grace: Duration,
    pub record_retention: Duration,
    /// Organization whose jobs this loop owns; written into instance tags.
    pub namespace: String,
    pub runner_labels: Vec<String>,
    pub github_base_url: String,
    pub machine_image: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            max_concurrent_instances: 10,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            idle_timeout: Duration::from_secs(300),
            provision_timeout: Duration::from_secs(300),
            max_active_age: Duration::from_secs(7200),
            orphan_grace: Duration::from_secs(3600),
            record_retention: Duration::from_secs(3600),
            namespace: "default".to_string(),
            runner_labels: vec![
                "self-hosted".to_string(),
                "linux".to_string(),
                "x64".to_string(),
            ],
            github_base_url: "https://github.com".to_string(),
            machine_image: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Drives every tracked job through its lifecycle.
pub struct Reconciler {
    pub(crate) config: ReconcilerConfig,
    pub(crate) store: Arc<JobStore>,
    pub(crate) queue: Arc<dyn JobQueue>,
    pub(crate) fleet: Arc<dyn Fleet>,
    pub(crate) selector: Selector,
    pub(crate) retry: Mutex<RetryTracker>,
    pub(crate) health: RwLock<LoopHealth>,
}

impl Reconciler {
    pub fn new(
        config: ReconcilerConfig,
        store: Arc<JobStore>,
        queue: Arc<dyn JobQueue>,
        fleet: Arc<dyn Fleet>,
        selector: Selector,
    ) -> Self {
        Self {
            config,
            store,
            queue,
            fleet,
            selector,
            retry: Mutex::new(RetryTracker::new(1, DEFAULT_RETRY_WINDOW)),
            health: RwLock::new(LoopHealth::default()),
        }
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// Run until shutdown. The first pass fires immediately.
    #[instrument(skip(self, shutdown, signals))]
    pub async fn run(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
        mut signals: mpsc::Receiver<JobSignal>,
    ) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            max_instances = self.config.max_concurrent_instances,
            namespace = %self.config.namespace,
            "Reconciler started"
        );
        let mut ticker = tokio::time::interval(self.config.poll_interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.reconcile_once().await;
                }
                Some(signal) = signals.recv() => {
                    self.handle_signal(signal).await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Reconciler shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One full pass: poll, admit, prune, then step every due record.
    #[instrument(skip(self))]
    pub async fn reconcile_once(&self) -> PassStats {
        let mut stats = PassStats::default();
        let now = Utc::now();

        let backed_off = {
            let mut health = self.health.write().await;
            health.last_tick_at = Some(now);
            health.queue.backoff_until.is_some_and(|until| until > now)
        };

        if backed_off {
            debug!("Skipping queue poll, rate-limit backoff in effect");
        } else {
            match self.queue.list_queued_jobs().await {
                Ok(jobs) => {
                    self.health.write().await.queue.note_ok();
                    stats.listed = jobs.len();
                    stats.admitted = self.admit_jobs(&jobs).await;
                    stats.pruned = self.prune_vanished(&jobs).await;
                }
                Err(err) => {
                    stats.list_failed = true;
                    warn!(error = %err, "Queue listing failed");
                    let backoff = match &err {
                        crate::queue::QueueError::RateLimited { retry_after } => {
                            Some(retry_after.unwrap_or(self.config.poll_interval))
                        }
                        _ => None,
                    };
                    let mut health = self.health.write().await;
                    health.queue.note_err(&err.to_string());
                    if let Some(delay) = backoff {
                        health.queue.backoff_until = Some(Utc::now() + delay);
                    }
                }
            }
        }

        let now = Utc::now();
        let due: Vec<u64> = self
            .store
            .list()
            .await
            .into_iter()
            .filter(|r| !r.phase.is_terminal())
            .filter(|r| r.next_attempt_at.is_none_or(|at| at <= now))
            .map(|r| r.job_id)
            .collect();
        stats.driven = due.len();
        join_all(due.into_iter().map(|id| self.drive_job(id))).await;

        if stats.admitted > 0 || stats.pruned > 0 {
            info!(
                listed = stats.listed,
                admitted = stats.admitted,
                pruned = stats.pruned,
                driven = stats.driven,
                "Reconcile pass changed the tracked set"
            );
        }
        stats
    }

    /// Create records for listed jobs we are not yet tracking.
    async fn admit_jobs(&self, jobs: &[QueuedJob]) -> usize {
        let mut admitted = 0;
        for job in jobs {
            if self.store.get(job.id).await.is_some() {
                continue;
            }
            if self.retry.lock().await.is_exhausted(&job.id.to_string()) {
                warn!(job_id = job.id, "Skipping job, provisioning retry budget exhausted");
                continue;
            }
            let spec = match parse_labels(&job.labels) {
                Ok(Some(spec)) => spec,
                Ok(None) => {
                    debug!(job_id = job.id, "Job does not request a runner, ignoring");
                    continue;
                }
                Err(err) => {
                    warn!(job_id = job.id, error = %err, "Rejecting job with invalid labels");
                    if self.store.admit(JobRecord::rejected(job, err.to_string())).await {
                        admitted += 1;
                    }
                    continue;
                }
            };
            if let Err(err) = self.selector.select(&spec) {
                warn!(job_id = job.id, error = %err, "Rejecting unsatisfiable job");
                if self.store.admit(JobRecord::rejected(job, err.to_string())).await {
                    admitted += 1;
                }
                continue;
            }
            let record = JobRecord::discovered(job, spec);
            info!(
                job_id = job.id,
                run_id = job.run_id,
                repository = %job.repository,
                runner_name = %record.runner_name,
                "Admitted queued job"
            );
            if self.store.admit(record).await {
                admitted += 1;
            }
        }
        admitted
    }

    /// Abort `Discovered` records whose job has left the queue before we
    /// spent anything on it.
    async fn prune_vanished(&self, listed: &[QueuedJob]) -> usize {
        let listed_ids: HashSet<u64> = listed.iter().map(|j| j.id).collect();
        let now = Utc::now();
        let mut pruned = 0;
        for record in self.store.list().await {
            if record.phase != JobPhase::Discovered || listed_ids.contains(&record.job_id) {
                continue;
            }
            // A record admitted from a push signal can be missing from a
            // listing snapshot taken just before it; give it one poll
            // period before concluding it is gone.
            if age(record.discovered_at, now) <= self.config.poll_interval {
                continue;
            }
            if self.store.abort(record.job_id, "no longer queued").await.is_ok() {
                info!(job_id = record.job_id, "Pruned job withdrawn from queue");
                pruned += 1;
            }
        }
        pruned
    }

    async fn drive_job(&self, job_id: u64) {
        if let Err(err) = self.step_job(job_id).await {
            self.handle_job_error(job_id, err).await;
        }
    }

    /// Advance one job as far as it can go right now. The record is
    /// re-read before every step so a concurrent abort is observed.
    async fn step_job(&self, job_id: u64) -> Result<(), OrchestratorError> {
        loop {
            let Some(record) = self.store.get(job_id).await else {
                return Ok(());
            };
            if record.phase.is_terminal() {
                return Ok(());
            }
            if record.next_attempt_at.is_some_and(|at| at > Utc::now()) {
                return Ok(());
            }
            let advanced = match record.phase {
                JobPhase::Discovered => self.step_issue_credential(&record).await?,
                JobPhase::CredentialIssued => self.step_request_instance(&record).await?,
                JobPhase::InstanceRequested => self.step_watch_activation(&record).await?,
                JobPhase::InstanceActive => self.step_watch_completion(&record).await?,
                JobPhase::Completing => self.step_terminate(&record).await?,
                JobPhase::Terminated | JobPhase::Aborted => return Ok(()),
            };
            if !advanced {
                return Ok(());
            }
        }
    }

    /// `Discovered -> CredentialIssued`, gated by the fleet-size cap.
    async fn step_issue_credential(&self, record: &JobRecord) -> Result<bool, OrchestratorError> {
        if self.store.active_count().await >= self.config.max_concurrent_instances {
            debug!(job_id = record.job_id, "Fleet at capacity, holding provisioning");
            return Ok(false);
        }
        let credential = self.queue.issue_credential(&record.runner_name).await?;
        match self
            .store
            .begin_provisioning(record.job_id, credential, self.config.max_concurrent_instances)
            .await
        {
            Ok(true) => Ok(true),
            Ok(false) => {
                debug!(
                    job_id = record.job_id,
                    "Fleet reached capacity while issuing credential, holding"
                );
                Ok(false)
            }
            Err(StoreError::PhaseMismatch { .. } | StoreError::NotFound { .. }) => Ok(false),
            Err(err @ StoreError::IllegalTransition { .. }) => {
                Err(OrchestratorError::Invariant(err.to_string()))
            }
        }
    }

    /// `CredentialIssued -> InstanceRequested`, walking the candidate
    /// chain on capacity misses.
    async fn step_request_instance(&self, record: &JobRecord) -> Result<bool, OrchestratorError> {
        let placement = self.selector.select(&record.request_spec)?;
        let credential = self.fresh_credential(record).await?;
        let user_data = bootstrap_user_data(&self.config, record, &credential.token);
        let tags = instance_tags(&self.config, record);

        let mut last_capacity: Option<OrchestratorError> = None;
        for candidate in &placement.candidates {
            let request = RequestInstance {
                instance_type: candidate.name.clone(),
                price_ceiling: placement.price_ceiling,
                machine_image: self.config.machine_image.clone(),
                user_data: user_data.clone(),
                tags: tags.clone(),
            };
            let instance_id = match self.fleet.request_instance(&request).await {
                Ok(id) => {
                    self.health.write().await.fleet.note_ok();
                    id
                }
                Err(err @ (FleetError::InsufficientCapacity(_) | FleetError::PriceExceeded(_))) => {
                    warn!(
                        job_id = record.job_id,
                        instance_type = %candidate.name,
                        error = %err,
                        "Capacity miss, trying next candidate"
                    );
                    last_capacity = Some(err.into());
                    continue;
                }
                Err(err) => {
                    self.health.write().await.fleet.note_err(&err.to_string());
                    return Err(err.into());
                }
            };

            let advanced = Self::advanced(
                self.store
                    .advance(
                        record.job_id,
                        JobPhase::CredentialIssued,
                        JobPhase::InstanceRequested,
                        |r| {
                            r.instance_id = Some(instance_id.clone());
                            r.instance_type = Some(candidate.name.clone());
                            r.instance_requested_at = Some(Utc::now());
                        },
                    )
                    .await,
            )?;
            return match advanced {
                Some(_) => {
                    info!(
                        job_id = record.job_id,
                        instance_id = %instance_id,
                        instance_type = %candidate.name,
                        "Instance requested"
                    );
                    Ok(true)
                }
                None => {
                    // Lost the race with an abort: the instance was never
                    // recorded, so it is ours to clean up here.
                    warn!(
                        job_id = record.job_id,
                        instance_id = %instance_id,
                        "Record left provisioning mid-request, terminating fresh instance"
                    );
                    if let Err(err) = self.fleet.terminate_instance(&instance_id).await {
                        warn!(instance_id = %instance_id, error = %err, "Failed to terminate unrecorded instance");
                    }
                    Ok(false)
                }
            };
        }
        Err(last_capacity.unwrap_or_else(|| {
            OrchestratorError::Capacity("no candidate instance type accepted".to_string())
        }))
    }

    /// `InstanceRequested -> InstanceActive`, with the provisioning
    /// timeout as backstop.
    async fn step_watch_activation(&self, record: &JobRecord) -> Result<bool, OrchestratorError> {
        let Some(instance_id) = record.instance_id.clone() else {
            return Err(OrchestratorError::Invariant(format!(
                "job {} is instance_requested without an instance id",
                record.job_id
            )));
        };
        let view = match self.fleet.describe_instance(&instance_id).await {
            Ok(view) => {
                self.health.write().await.fleet.note_ok();
                view
            }
            Err(err) => {
                self.health.write().await.fleet.note_err(&err.to_string());
                return Err(err.into());
            }
        };
        match view {
            Some(view) if view.status == InstanceStatus::Running => {
                let advanced = Self::advanced(
                    self.store
                        .advance(
                            record.job_id,
                            JobPhase::InstanceRequested,
                            JobPhase::InstanceActive,
                            |r| {
                                r.last_seen_active_at = Some(Utc::now());
                            },
                        )
                        .await,
                )?;
                if advanced.is_some() {
                    info!(
                        job_id = record.job_id,
                        instance_id = %instance_id,
                        runner_name = %record.runner_name,
                        "Instance active"
                    );
                    self.retry.lock().await.clear(&record.job_id.to_string());
                }
                Ok(advanced.is_some())
            }
            Some(view) if view.status == InstanceStatus::Requesting => {
                let requested_at = record.instance_requested_at.unwrap_or(record.discovered_at);
                if age(requested_at, Utc::now()) > self.config.provision_timeout {
                    warn!(
                        job_id = record.job_id,
                        instance_id = %instance_id,
                        "Provisioning timed out"
                    );
                    self.abort_job(record.job_id, "provisioning timed out").await;
                }
                Ok(false)
            }
            _ => {
                self.abort_job(record.job_id, "instance gone before activation").await;
                Ok(false)
            }
        }
    }

    /// `InstanceActive -> Completing` once the job leaves the queue's
    /// active set.
    async fn step_watch_completion(&self, record: &JobRecord) -> Result<bool, OrchestratorError> {
        match self.queue.job_status(&record.repository, record.job_id).await? {
            Some(JobStatus::Queued | JobStatus::InProgress) => {
                self.store.touch_active(record.job_id).await;
                Ok(false)
            }
            Some(JobStatus::Completed) | None => {
                let advanced = Self::advanced(
                    self.store
                        .advance(record.job_id, JobPhase::InstanceActive, JobPhase::Completing, |_| {})
                        .await,
                )?;
                if advanced.is_some() {
                    debug!(job_id = record.job_id, "Job left the active set, completing");
                }
                Ok(advanced.is_some())
            }
        }
    }

    /// `Completing -> Terminated` once the fleet acknowledges.
    async fn step_terminate(&self, record: &JobRecord) -> Result<bool, OrchestratorError> {
        if let Some(instance_id) = &record.instance_id {
            match self.fleet.terminate_instance(instance_id).await {
                Ok(()) => self.health.write().await.fleet.note_ok(),
                Err(err) => {
                    self.health.write().await.fleet.note_err(&err.to_string());
                    return Err(err.into());
                }
            }
        }
        let advanced = Self::advanced(
            self.store
                .advance(record.job_id, JobPhase::Completing, JobPhase::Terminated, |r| {
                    r.terminal_reason = Some("job completed".to_string());
                })
                .await,
        )?;
        if let Some(updated) = advanced {
            self.deregister_runner(&updated).await;
            info!(
                job_id = record.job_id,
                instance_id = ?updated.instance_id,
                "Runner terminated"
            );
        }
        Ok(false)
    }

    /// Drop the queue-side runner registration once a credential has been
    /// spent on it. A leftover registration is offline and harmless, so a
    /// failure here only logs; GitHub ages them out eventually.
    async fn deregister_runner(&self, record: &JobRecord) {
        if record.credential_issued_at.is_none() {
            return;
        }
        if let Err(err) = self.queue.remove_runner(&record.runner_name).await {
            warn!(
                job_id = record.job_id,
                runner_name = %record.runner_name,
                error = %err,
                "Failed to deregister runner"
            );
        }
    }

    /// A phase mismatch or missing record means another path moved the
    /// job first; that is a benign race, not an error.
    fn advanced(result: Result<JobRecord, StoreError>) -> Result<Option<JobRecord>, OrchestratorError> {
        match result {
            Ok(record) => Ok(Some(record)),
            Err(StoreError::PhaseMismatch { .. } | StoreError::NotFound { .. }) => Ok(None),
            Err(err @ StoreError::IllegalTransition { .. }) => {
                Err(OrchestratorError::Invariant(err.to_string()))
            }
        }
    }

    /// The stored credential, re-issued when it is close to expiry.
    async fn fresh_credential(
        &self,
        record: &JobRecord,
    ) -> Result<RunnerCredential, OrchestratorError> {
        if let Some(credential) = &record.credential {
            if credential.expires_at > Utc::now() + CREDENTIAL_EXPIRY_SLACK {
                return Ok(credential.clone());
            }
        }
        debug!(job_id = record.job_id, "Re-issuing registration credential");
        let credential = self.queue.issue_credential(&record.runner_name).await?;
        self.store.refresh_credential(record.job_id, credential.clone()).await;
        Ok(credential)
    }

    async fn handle_job_error(&self, job_id: u64, err: OrchestratorError) {
        match &err {
            OrchestratorError::Validation(_) | OrchestratorError::Unsatisfiable(_) => {
                self.abort_job(job_id, &err.to_string()).await;
            }
            OrchestratorError::Invariant(_) => {
                error!(job_id, error = %err, "Invariant violation");
                self.abort_job(job_id, &err.to_string()).await;
            }
            OrchestratorError::Transient { .. } | OrchestratorError::Capacity(_) => {
                let Some(attempt) = self.store.note_attempt_failure(job_id).await else {
                    return;
                };
                if attempt >= self.config.max_attempts {
                    self.abort_job(job_id, &format!("retries exhausted: {err}")).await;
                    return;
                }
                let mut delay = self.config.backoff.delay(attempt);
                if let Some(hint) = err.retry_after() {
                    delay = delay.max(hint);
                }
                self.store.set_backoff(job_id, Utc::now() + delay).await;
                warn!(
                    job_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Step failed, backing off"
                );
            }
        }
    }

    /// Abort a job and release its instance. Quiet when the record is
    /// already terminal or gone, since racing paths both land here.
    /// Returns the id of the instance it terminated, if any.
    pub(crate) async fn abort_job(&self, job_id: u64, reason: &str) -> Option<String> {
        let record = match self.store.abort(job_id, reason).await {
            Ok(record) => record,
            Err(_) => return None,
        };
        warn!(job_id, reason, "Job aborted");
        self.retry.lock().await.record_failure(&job_id.to_string());
        self.deregister_runner(&record).await;
        let instance_id = record.instance_id?;
        match self.fleet.terminate_instance(&instance_id).await {
            Ok(()) => Some(instance_id),
            Err(err) => {
                warn!(
                    job_id,
                    instance_id = %instance_id,
                    error = %err,
                    "Failed to terminate instance of aborted job, leaving it to the sweep"
                );
                None
            }
        }
    }

    /// Feed one push signal into the same machine the poll drives.
    pub async fn handle_signal(&self, signal: JobSignal) {
        match signal {
            JobSignal::Queued(job) => {
                debug!(job_id = job.id, "Push signal: job queued");
                self.admit_jobs(std::slice::from_ref(&job)).await;
                self.drive_job(job.id).await;
            }
            JobSignal::Completed { job_id } => {
                debug!(job_id, "Push signal: job completed");
                let Some(record) = self.store.get(job_id).await else {
                    return;
                };
                if record.phase == JobPhase::InstanceActive {
                    self.drive_job(job_id).await;
                }
            }
        }
    }

    pub async fn health_snapshot(&self) -> LoopHealth {
        self.health.read().await.clone()
    }
}

/// Shell script that registers and starts the ephemeral runner agent,
/// base64-encoded for the fleet request. The runner advertises the
/// configured base labels plus the job's own, so queue-side routing sees
/// exactly the labels it matched on.
fn bootstrap_user_data(config: &ReconcilerConfig, record: &JobRecord, token: &str) -> String {
    let mut labels: Vec<&str> = config.runner_labels.iter().map(String::as_str).collect();
    for label in &record.labels {
        if !labels.contains(&label.as_str()) {
            labels.push(label);
        }
    }
    let script = format!(
        "#!/bin/bash\n\
         cd /actions-runner\n\
         export RUNNER_ALLOW_RUNASROOT=1\n\
         ./config.sh --url {}/{} --token {} --name {} --labels {} --ephemeral --work _work --replace\n\
         ./svc.sh install\n\
         ./svc.sh start\n",
        config.github_base_url,
        config.namespace,
        token,
        record.runner_name,
        labels.join(","),
    );
    STANDARD.encode(script)
}

/// Tags that let a later pass, or another process entirely, recognize the
/// instance and tie it back to its job.
fn instance_tags(config: &ReconcilerConfig, record: &JobRecord) -> BTreeMap<String, String> {
    BTreeMap::from([
        (TAG_MANAGED_BY.to_string(), MANAGED_BY.to_string()),
        (TAG_NAMESPACE.to_string(), config.namespace.clone()),
        (TAG_JOB_ID.to_string(), record.job_id.to_string()),
        (TAG_RUN_KEY.to_string(), record.request_spec.run_key.clone()),
        (TAG_RUNNER_NAME.to_string(), record.runner_name.clone()),
        (TAG_NAME.to_string(), format!("kiln-runner-{}", record.runner_name)),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labels::RequestSpec;

    fn record() -> JobRecord {
        let job = QueuedJob {
            id: 31,
            run_id: 7,
            repository: "acme/widgets".to_string(),
            labels: vec!["runs-on=J1".to_string(), "cpu=8".to_string()],
        };
        let spec = RequestSpec {
            run_key: "J1".to_string(),
            cpu_count: Some(8),
            ..RequestSpec::default()
        };
        JobRecord::discovered(&job, spec)
    }

    #[test]
    fn test_default_config() {
        let config = ReconcilerConfig::default();
        assert_eq!(config.poll_interval, Duration::from_secs(30));
        assert_eq!(config.max_concurrent_instances, 10);
        assert_eq!(config.provision_timeout, Duration::from_secs(300));
        assert_eq!(config.runner_labels, vec!["self-hosted", "linux", "x64"]);
    }

    #[test]
    fn test_instance_tags_tie_instance_to_job() {
        let record = record();
        let tags = instance_tags(&ReconcilerConfig::default(), &record);

        assert_eq!(tags[TAG_MANAGED_BY], MANAGED_BY);
        assert_eq!(tags[TAG_JOB_ID], "31");
        assert_eq!(tags[TAG_RUN_KEY], "J1");
        assert_eq!(tags[TAG_NAME], format!("kiln-runner-{}", record.runner_name));
    }

    #[test]
    fn test_bootstrap_script_unions_labels() {
        let record = record();
        let encoded = bootstrap_user_data(&ReconcilerConfig::default(), &record, "tok-123");
        let script = String::from_utf8(STANDARD.decode(encoded).unwrap()).unwrap();

        assert!(script.starts_with("#!/bin/bash"));
        assert!(script.contains("--labels self-hosted,linux,x64,runs-on=J1,cpu=8"));
        assert!(script.contains("--token tok-123"));
        assert!(script.contains("--ephemeral"));
        assert!(script.contains(&format!("--name {}", record.runner_name)));
    }

    #[test]
    fn test_bootstrap_script_deduplicates_labels() {
        let mut record = record();
        record.labels = vec!["linux".to_string(), "runs-on=J1".to_string()];
        let encoded = bootstrap_user_data(&ReconcilerConfig::default(), &record, "tok");
        let script = String::from_utf8(STANDARD.decode(encoded).unwrap()).unwrap();

        assert!(script.contains("--labels self-hosted,linux,x64,runs-on=J1 "));
    }
}
