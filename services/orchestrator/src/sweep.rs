//! Time-budget and orphan sweep.
//!
//! The sweep is the backstop for everything the event-driven paths can
//! miss: stalled records, instances the provider kept after a crash, and
//! terminal records past retention. It is reentrant; every transition it
//! takes is store-checked and every termination is idempotent, so the
//! scheduled sweep and a manual cleanup can overlap safely.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{error, info, instrument, warn};

use crate::fleet::{InstanceView, MANAGED_BY, TAG_JOB_ID, TAG_MANAGED_BY, TAG_NAMESPACE};
use crate::reconciler::Reconciler;
use crate::store::{age, JobPhase};

/// Result of one sweep, returned by the manual cleanup endpoint.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepStats {
    pub aborted: usize,
    pub terminated_instances: Vec<String>,
    pub purged: usize,
}

impl Reconciler {
    /// One full sweep: abort records over their phase's time budget, reap
    /// orphaned instances, purge old terminal records.
    #[instrument(skip(self))]
    pub async fn sweep(&self) -> SweepStats {
        let mut stats = SweepStats::default();
        let now = Utc::now();

        for record in self.store.list().await {
            if record.phase.is_terminal() {
                continue;
            }
            let reason = match record.phase {
                // Discovered holds no instance and may legitimately wait
                // at the fleet cap; the poll prunes it when it vanishes.
                JobPhase::Discovered => None,
                JobPhase::CredentialIssued => (age(record.discovered_at, now)
                    > self.config.idle_timeout)
                    .then_some("provisioning stalled"),
                JobPhase::InstanceRequested => {
                    let since = record.instance_requested_at.unwrap_or(record.discovered_at);
                    (age(since, now) > self.config.provision_timeout)
                        .then_some("provisioning timed out")
                }
                JobPhase::InstanceActive => {
                    let since = record.instance_requested_at.unwrap_or(record.discovered_at);
                    (age(since, now) > self.config.max_active_age)
                        .then_some("exceeded max active age")
                }
                JobPhase::Completing => (age(record.updated_at, now) > self.config.idle_timeout)
                    .then_some("termination stalled"),
                JobPhase::Terminated | JobPhase::Aborted => None,
            };
            if let Some(reason) = reason {
                warn!(
                    job_id = record.job_id,
                    phase = %record.phase,
                    reason,
                    "Sweeping stalled job"
                );
                if let Some(instance_id) = self.abort_job(record.job_id, reason).await {
                    stats.terminated_instances.push(instance_id);
                }
                stats.aborted += 1;
            }
        }

        let filter = BTreeMap::from([
            (TAG_MANAGED_BY.to_string(), MANAGED_BY.to_string()),
            (TAG_NAMESPACE.to_string(), self.config.namespace.clone()),
        ]);
        match self.fleet.list_instances(&filter).await {
            Err(err) => {
                self.health.write().await.fleet.note_err(&err.to_string());
                warn!(error = %err, "Orphan sweep could not list instances");
            }
            Ok(views) => {
                self.health.write().await.fleet.note_ok();
                self.reap_orphans(&views, &mut stats).await;
            }
        }

        stats.purged = self
            .store
            .purge_terminal_before(now - self.config.record_retention)
            .await;
        self.retry.lock().await.prune();

        info!(
            aborted = stats.aborted,
            terminated = stats.terminated_instances.len(),
            purged = stats.purged,
            "Sweep complete"
        );
        stats
    }

    /// Terminate live managed instances with no live record claiming
    /// them, once past the launch grace. Two live instances claiming the
    /// same job is an invariant violation: all of them go.
    async fn reap_orphans(&self, views: &[InstanceView], stats: &mut SweepStats) {
        let now = Utc::now();
        let mut by_job: BTreeMap<u64, Vec<&InstanceView>> = BTreeMap::new();

        for view in views.iter().filter(|v| v.status.is_live()) {
            match view.tag(TAG_JOB_ID).and_then(|t| t.parse::<u64>().ok()) {
                Some(job_id) => by_job.entry(job_id).or_default().push(view),
                None => {
                    if age(view.launched_at, now) > self.config.orphan_grace {
                        warn!(
                            instance_id = %view.instance_id,
                            "Terminating managed instance with no job tag"
                        );
                        if self.terminate_quietly(&view.instance_id).await {
                            stats.terminated_instances.push(view.instance_id.clone());
                        }
                    }
                }
            }
        }

        for (job_id, candidates) in by_job {
            let record = self.store.get(job_id).await;
            let record_live = record.as_ref().is_some_and(|r| !r.phase.is_terminal());

            if candidates.len() > 1 && record_live {
                error!(
                    job_id,
                    count = candidates.len(),
                    "Multiple live instances claim one job, terminating all of them"
                );
                for view in &candidates {
                    if self.terminate_quietly(&view.instance_id).await {
                        stats.terminated_instances.push(view.instance_id.clone());
                    }
                }
                if self.store.abort(job_id, "duplicate live instances").await.is_ok() {
                    self.retry.lock().await.record_failure(&job_id.to_string());
                    stats.aborted += 1;
                }
                continue;
            }

            for view in candidates {
                let known = record_live
                    && record
                        .as_ref()
                        .is_some_and(|r| r.instance_id.as_deref() == Some(view.instance_id.as_str()));
                if !known && age(view.launched_at, now) > self.config.orphan_grace {
                    warn!(
                        instance_id = %view.instance_id,
                        job_id,
                        "Terminating orphaned instance"
                    );
                    if self.terminate_quietly(&view.instance_id).await {
                        stats.terminated_instances.push(view.instance_id.clone());
                    }
                }
            }
        }
    }

    /// Terminate without failing the sweep; a miss is retried next cycle.
    async fn terminate_quietly(&self, instance_id: &str) -> bool {
        match self.fleet.terminate_instance(instance_id).await {
            Ok(()) => true,
            Err(err) => {
                warn!(instance_id = %instance_id, error = %err, "Failed to terminate instance");
                false
            }
        }
    }
}

/// Periodic sweep on its own schedule, independent of the poll loop.
pub struct SweepWorker {
    reconciler: Arc<Reconciler>,
    interval: Duration,
}

impl SweepWorker {
    pub fn new(reconciler: Arc<Reconciler>, interval: Duration) -> Self {
        Self {
            reconciler,
            interval,
        }
    }

    #[instrument(skip(self, shutdown))]
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = self.interval.as_secs(), "Sweep worker started");
        let mut ticker = tokio::time::interval(self.interval);
        // The first tick completes immediately; skip it so sweeps start
        // one full interval in.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.reconciler.sweep().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Sweep worker shutting down");
                        break;
                    }
                }
            }
        }
    }
}
