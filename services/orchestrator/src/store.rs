//! Job records and the store that owns them.
//!
//! Every phase change in the system goes through this store, under one
//! write lock, so concurrent reconcile steps, webhook signals, and sweeps
//! cannot disagree about a job's phase.
//!
//! # Invariants
//!
//! - Phase edges outside the forward chain (plus abort) are rejected with
//!   `IllegalTransition`; callers never mutate `phase` directly.
//! - Capacity checks and the transition they guard happen under a single
//!   lock acquisition.
//! - Terminal records are immutable apart from eventual purging.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::labels::RequestSpec;
use crate::queue::{QueuedJob, RunnerCredential};

/// Lifecycle phase of one tracked job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPhase {
    Discovered,
    CredentialIssued,
    InstanceRequested,
    InstanceActive,
    Completing,
    Terminated,
    Aborted,
}

impl JobPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Discovered => "discovered",
            Self::CredentialIssued => "credential_issued",
            Self::InstanceRequested => "instance_requested",
            Self::InstanceActive => "instance_active",
            Self::Completing => "completing",
            Self::Terminated => "terminated",
            Self::Aborted => "aborted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminated | Self::Aborted)
    }

    /// Phases that hold (or are acquiring) a fleet instance. These count
    /// against the fleet-size cap.
    pub fn holds_capacity(&self) -> bool {
        matches!(
            self,
            Self::CredentialIssued | Self::InstanceRequested | Self::InstanceActive | Self::Completing
        )
    }

    pub fn can_advance_to(&self, next: JobPhase) -> bool {
        use JobPhase::*;
        match (self, next) {
            (Discovered, CredentialIssued)
            | (CredentialIssued, InstanceRequested)
            | (InstanceRequested, InstanceActive)
            | (InstanceActive, Completing)
            | (Completing, Terminated) => true,
            (from, Aborted) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for JobPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything the orchestrator knows about one job.
#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub job_id: u64,
    pub run_id: u64,
    pub repository: String,
    pub labels: Vec<String>,
    pub request_spec: RequestSpec,
    pub phase: JobPhase,
    pub runner_name: String,
    pub instance_id: Option<String>,
    pub instance_type: Option<String>,
    #[serde(skip_serializing)]
    pub credential: Option<RunnerCredential>,
    pub attempt: u32,
    pub discovered_at: DateTime<Utc>,
    pub credential_issued_at: Option<DateTime<Utc>>,
    pub instance_requested_at: Option<DateTime<Utc>>,
    pub last_seen_active_at: Option<DateTime<Utc>>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub terminal_reason: Option<String>,
}

impl JobRecord {
    /// Fresh record for a job that parsed into a valid request.
    pub fn discovered(job: &QueuedJob, request_spec: RequestSpec) -> Self {
        let now = Utc::now();
        let suffix = Uuid::new_v4().simple().to_string();
        Self {
            job_id: job.id,
            run_id: job.run_id,
            repository: job.repository.clone(),
            labels: job.labels.clone(),
            request_spec,
            phase: JobPhase::Discovered,
            runner_name: format!("runner-{}-{}", job.id, &suffix[..8]),
            instance_id: None,
            instance_type: None,
            credential: None,
            attempt: 0,
            discovered_at: now,
            credential_issued_at: None,
            instance_requested_at: None,
            last_seen_active_at: None,
            next_attempt_at: None,
            updated_at: now,
            terminal_reason: None,
        }
    }

    /// Record for a job whose labels could never be satisfied. Created
    /// terminal so the same bad job is not re-admitted every pass.
    pub fn rejected(job: &QueuedJob, reason: impl Into<String>) -> Self {
        let mut record = Self::discovered(job, RequestSpec::default());
        record.phase = JobPhase::Aborted;
        record.terminal_reason = Some(reason.into());
        record
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("job {job_id} is not tracked")]
    NotFound { job_id: u64 },

    #[error("job {job_id} is {actual}, expected {expected}")]
    PhaseMismatch {
        job_id: u64,
        expected: JobPhase,
        actual: JobPhase,
    },

    #[error("job {job_id} cannot move {from} -> {to}")]
    IllegalTransition {
        job_id: u64,
        from: JobPhase,
        to: JobPhase,
    },
}

/// Single-writer store of all job records.
#[derive(Debug, Default)]
pub struct JobStore {
    records: RwLock<HashMap<u64, JobRecord>>,
}

impl JobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record unless the job is already tracked.
    pub async fn admit(&self, record: JobRecord) -> bool {
        let mut records = self.records.write().await;
        if records.contains_key(&record.job_id) {
            return false;
        }
        records.insert(record.job_id, record);
        true
    }

    pub async fn get(&self, job_id: u64) -> Option<JobRecord> {
        self.records.read().await.get(&job_id).cloned()
    }

    /// All records, oldest discovery first.
    pub async fn list(&self) -> Vec<JobRecord> {
        let mut records: Vec<JobRecord> = self.records.read().await.values().cloned().collect();
        records.sort_by_key(|r| (r.discovered_at, r.job_id));
        records
    }

    /// Records currently counting against the fleet-size cap.
    pub async fn active_count(&self) -> usize {
        self.records
            .read()
            .await
            .values()
            .filter(|r| r.phase.holds_capacity())
            .count()
    }

    pub async fn phase_counts(&self) -> BTreeMap<&'static str, usize> {
        let records = self.records.read().await;
        let mut counts = BTreeMap::new();
        for record in records.values() {
            *counts.entry(record.phase.as_str()).or_insert(0) += 1;
        }
        counts
    }

    /// Move a job from one exact phase to the next, applying `apply` to the
    /// record under the same lock. Returns the updated record.
    pub async fn advance(
        &self,
        job_id: u64,
        from: JobPhase,
        to: JobPhase,
        apply: impl FnOnce(&mut JobRecord),
    ) -> Result<JobRecord, StoreError> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(&job_id)
            .ok_or(StoreError::NotFound { job_id })?;
        if record.phase != from {
            return Err(StoreError::PhaseMismatch {
                job_id,
                expected: from,
                actual: record.phase,
            });
        }
        if !from.can_advance_to(to) {
            return Err(StoreError::IllegalTransition { job_id, from, to });
        }
        record.phase = to;
        // The attempt budget is per phase; a failure streak in one phase
        // must not shorten the next one's.
        record.attempt = 0;
        record.next_attempt_at = None;
        record.updated_at = Utc::now();
        apply(record);
        Ok(record.clone())
    }

    /// Claim a capacity slot and move `Discovered -> CredentialIssued` in
    /// one step. `Ok(false)` means the cap is reached and the job should
    /// wait, not fail.
    pub async fn begin_provisioning(
        &self,
        job_id: u64,
        credential: RunnerCredential,
        cap: usize,
    ) -> Result<bool, StoreError> {
        let mut records = self.records.write().await;
        let holding = records.values().filter(|r| r.phase.holds_capacity()).count();
        if holding >= cap {
            return Ok(false);
        }
        let record = records
            .get_mut(&job_id)
            .ok_or(StoreError::NotFound { job_id })?;
        if record.phase != JobPhase::Discovered {
            return Err(StoreError::PhaseMismatch {
                job_id,
                expected: JobPhase::Discovered,
                actual: record.phase,
            });
        }
        let now = Utc::now();
        record.phase = JobPhase::CredentialIssued;
        record.credential = Some(credential);
        record.credential_issued_at = Some(now);
        record.attempt = 0;
        record.next_attempt_at = None;
        record.updated_at = now;
        Ok(true)
    }

    /// Abort a non-terminal job. Fails on terminal records so a finished
    /// job is never rewritten.
    pub async fn abort(
        &self,
        job_id: u64,
        reason: impl Into<String>,
    ) -> Result<JobRecord, StoreError> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(&job_id)
            .ok_or(StoreError::NotFound { job_id })?;
        if record.phase.is_terminal() {
            return Err(StoreError::IllegalTransition {
                job_id,
                from: record.phase,
                to: JobPhase::Aborted,
            });
        }
        record.phase = JobPhase::Aborted;
        record.terminal_reason = Some(reason.into());
        record.next_attempt_at = None;
        record.updated_at = Utc::now();
        Ok(record.clone())
    }

    /// Count a failed attempt. Returns the new attempt count, `None` if
    /// the record is gone or already terminal.
    pub async fn note_attempt_failure(&self, job_id: u64) -> Option<u32> {
        let mut records = self.records.write().await;
        let record = records.get_mut(&job_id)?;
        if record.phase.is_terminal() {
            return None;
        }
        record.attempt += 1;
        record.updated_at = Utc::now();
        Some(record.attempt)
    }

    /// Defer the next step for a job until the given time.
    pub async fn set_backoff(&self, job_id: u64, until: DateTime<Utc>) {
        let mut records = self.records.write().await;
        if let Some(record) = records.get_mut(&job_id) {
            if !record.phase.is_terminal() {
                record.next_attempt_at = Some(until);
                record.updated_at = Utc::now();
            }
        }
    }

    /// Record that the runner was seen alive on the queue side.
    pub async fn touch_active(&self, job_id: u64) {
        let mut records = self.records.write().await;
        if let Some(record) = records.get_mut(&job_id) {
            if record.phase == JobPhase::InstanceActive {
                let now = Utc::now();
                record.last_seen_active_at = Some(now);
                record.updated_at = now;
            }
        }
    }

    /// Replace a credential that expired before it was used.
    pub async fn refresh_credential(&self, job_id: u64, credential: RunnerCredential) {
        let mut records = self.records.write().await;
        if let Some(record) = records.get_mut(&job_id) {
            if !record.phase.is_terminal() {
                let now = Utc::now();
                record.credential = Some(credential);
                record.credential_issued_at = Some(now);
                record.updated_at = now;
            }
        }
    }

    /// Drop terminal records last updated before the cutoff.
    pub async fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> usize {
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|_, r| !(r.phase.is_terminal() && r.updated_at < cutoff));
        before - records.len()
    }
}

/// Elapsed wall time between two instants, zero if the clock went
/// backwards.
pub fn age(since: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - since).to_std().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queued_job(id: u64) -> QueuedJob {
        QueuedJob {
            id,
            run_id: 100,
            repository: "acme/widgets".to_string(),
            labels: vec!["runs-on=J1".to_string()],
        }
    }

    fn credential() -> RunnerCredential {
        RunnerCredential {
            token: "tok".to_string(),
            expires_at: Utc::now() + Duration::from_secs(3600),
        }
    }

    async fn admitted(store: &JobStore, id: u64) -> JobRecord {
        let record = JobRecord::discovered(&queued_job(id), RequestSpec::default());
        assert!(store.admit(record.clone()).await);
        record
    }

    #[tokio::test]
    async fn test_forward_chain_advances() {
        let store = JobStore::new();
        admitted(&store, 1).await;

        assert!(store.begin_provisioning(1, credential(), 10).await.unwrap());
        store
            .advance(1, JobPhase::CredentialIssued, JobPhase::InstanceRequested, |r| {
                r.instance_id = Some("i-1".to_string());
            })
            .await
            .unwrap();
        store
            .advance(1, JobPhase::InstanceRequested, JobPhase::InstanceActive, |_| {})
            .await
            .unwrap();
        store
            .advance(1, JobPhase::InstanceActive, JobPhase::Completing, |_| {})
            .await
            .unwrap();
        let record = store
            .advance(1, JobPhase::Completing, JobPhase::Terminated, |_| {})
            .await
            .unwrap();

        assert_eq!(record.phase, JobPhase::Terminated);
        assert_eq!(record.instance_id.as_deref(), Some("i-1"));
        assert!(record.phase.is_terminal());
    }

    #[tokio::test]
    async fn test_skipping_a_phase_is_illegal() {
        let store = JobStore::new();
        admitted(&store, 1).await;

        let err = store
            .advance(1, JobPhase::Discovered, JobPhase::InstanceActive, |_| {})
            .await
            .unwrap_err();
        assert_eq!(
            err,
            StoreError::IllegalTransition {
                job_id: 1,
                from: JobPhase::Discovered,
                to: JobPhase::InstanceActive,
            }
        );
    }

    #[tokio::test]
    async fn test_stale_phase_view_is_a_mismatch() {
        let store = JobStore::new();
        admitted(&store, 1).await;
        store.begin_provisioning(1, credential(), 10).await.unwrap();

        let err = store
            .advance(1, JobPhase::Discovered, JobPhase::CredentialIssued, |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::PhaseMismatch { actual, .. } if actual == JobPhase::CredentialIssued));
    }

    #[tokio::test]
    async fn test_abort_reaches_any_non_terminal_phase() {
        let store = JobStore::new();
        admitted(&store, 1).await;
        store.begin_provisioning(1, credential(), 10).await.unwrap();

        let record = store.abort(1, "queue withdrew the job").await.unwrap();
        assert_eq!(record.phase, JobPhase::Aborted);
        assert_eq!(record.terminal_reason.as_deref(), Some("queue withdrew the job"));

        let err = store.abort(1, "again").await.unwrap_err();
        assert!(matches!(err, StoreError::IllegalTransition { .. }));
        let record = store.get(1).await.unwrap();
        assert_eq!(record.terminal_reason.as_deref(), Some("queue withdrew the job"));
    }

    #[tokio::test]
    async fn test_cap_throttles_provisioning() {
        let store = JobStore::new();
        admitted(&store, 1).await;
        admitted(&store, 2).await;

        assert!(store.begin_provisioning(1, credential(), 1).await.unwrap());
        assert!(!store.begin_provisioning(2, credential(), 1).await.unwrap());
        assert_eq!(store.active_count().await, 1);

        let record = store.get(2).await.unwrap();
        assert_eq!(record.phase, JobPhase::Discovered);
    }

    #[tokio::test]
    async fn test_admit_is_first_writer_wins() {
        let store = JobStore::new();
        let first = admitted(&store, 1).await;
        let second = JobRecord::discovered(&queued_job(1), RequestSpec::default());

        assert!(!store.admit(second).await);
        assert_eq!(store.get(1).await.unwrap().runner_name, first.runner_name);
    }

    #[tokio::test]
    async fn test_purge_only_touches_old_terminal_records() {
        let store = JobStore::new();
        admitted(&store, 1).await;
        admitted(&store, 2).await;
        store.abort(1, "done with it").await.unwrap();

        assert_eq!(store.purge_terminal_before(Utc::now() - Duration::from_secs(60)).await, 0);
        assert_eq!(store.purge_terminal_before(Utc::now() + Duration::from_secs(60)).await, 1);
        assert!(store.get(1).await.is_none());
        assert!(store.get(2).await.is_some());
    }

    #[tokio::test]
    async fn test_attempt_counting_stops_at_terminal() {
        let store = JobStore::new();
        admitted(&store, 1).await;

        assert_eq!(store.note_attempt_failure(1).await, Some(1));
        assert_eq!(store.note_attempt_failure(1).await, Some(2));
        store.abort(1, "gave up").await.unwrap();
        assert_eq!(store.note_attempt_failure(1).await, None);
    }

    #[tokio::test]
    async fn test_attempt_budget_resets_on_each_phase() {
        let store = JobStore::new();
        admitted(&store, 1).await;
        assert_eq!(store.note_attempt_failure(1).await, Some(1));
        assert_eq!(store.note_attempt_failure(1).await, Some(2));

        store.begin_provisioning(1, credential(), 10).await.unwrap();
        assert_eq!(store.get(1).await.unwrap().attempt, 0);

        assert_eq!(store.note_attempt_failure(1).await, Some(1));
        store
            .advance(1, JobPhase::CredentialIssued, JobPhase::InstanceRequested, |_| {})
            .await
            .unwrap();
        assert_eq!(store.get(1).await.unwrap().attempt, 0);
    }

    #[tokio::test]
    async fn test_backoff_cleared_on_advance() {
        let store = JobStore::new();
        admitted(&store, 1).await;
        store.set_backoff(1, Utc::now() + Duration::from_secs(30)).await;
        assert!(store.get(1).await.unwrap().next_attempt_at.is_some());

        store.begin_provisioning(1, credential(), 10).await.unwrap();
        assert!(store.get(1).await.unwrap().next_attempt_at.is_none());
    }

    #[tokio::test]
    async fn test_rejected_records_are_terminal_on_admit() {
        let store = JobStore::new();
        let record = JobRecord::rejected(&queued_job(9), "conflicting labels");
        store.admit(record).await;

        let record = store.get(9).await.unwrap();
        assert_eq!(record.phase, JobPhase::Aborted);
        assert_eq!(store.active_count().await, 0);
    }

    #[test]
    fn test_runner_names_are_distinct_per_record() {
        let job = queued_job(7);
        let a = JobRecord::discovered(&job, RequestSpec::default());
        let b = JobRecord::discovered(&job, RequestSpec::default());
        assert_ne!(a.runner_name, b.runner_name);
        assert!(a.runner_name.starts_with("runner-7-"));
    }
}
