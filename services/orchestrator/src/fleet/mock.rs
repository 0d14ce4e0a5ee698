//! In-memory [`Fleet`] used in dev mode and tests.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;

use super::{Fleet, FleetError, InstanceStatus, InstanceView, RequestInstance};

/// Scriptable fleet. Instances activate as soon as they are requested
/// unless activation is held; capacity misses are scripted per type.
#[derive(Debug, Default)]
pub struct MockFleet {
    instances: Mutex<BTreeMap<String, InstanceView>>,
    id_counter: AtomicU64,
    hold_activation: AtomicBool,
    exhausted_types: Mutex<HashSet<String>>,
    request_calls: AtomicU64,
    terminate_calls: AtomicU64,
    failing_terminations: AtomicU64,
    live_high_water: AtomicU64,
}

impl MockFleet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep newly requested instances in `Requesting` until
    /// [`Self::activate`] is called.
    pub fn hold_activation(&self) {
        self.hold_activation.store(true, Ordering::SeqCst);
    }

    pub fn activate(&self, instance_id: &str) {
        self.set_status(instance_id, InstanceStatus::Running);
    }

    pub fn set_status(&self, instance_id: &str, status: InstanceStatus) {
        if let Some(view) = self.instances.lock().unwrap().get_mut(instance_id) {
            view.status = status;
        }
    }

    /// Fail requests for this type with `InsufficientCapacity`.
    pub fn exhaust_type(&self, name: &str) {
        self.exhausted_types.lock().unwrap().insert(name.to_string());
    }

    pub fn restore_type(&self, name: &str) {
        self.exhausted_types.lock().unwrap().remove(name);
    }

    /// Plant an instance directly, bypassing the request path.
    pub fn insert_instance(&self, view: InstanceView) {
        self.instances
            .lock()
            .unwrap()
            .insert(view.instance_id.clone(), view);
    }

    pub fn instance(&self, instance_id: &str) -> Option<InstanceView> {
        self.instances.lock().unwrap().get(instance_id).cloned()
    }

    pub fn live_count(&self) -> usize {
        self.instances
            .lock()
            .unwrap()
            .values()
            .filter(|v| v.status.is_live())
            .count()
    }

    /// Highest number of simultaneously live instances ever observed.
    pub fn live_high_water(&self) -> u64 {
        self.live_high_water.load(Ordering::SeqCst)
    }

    pub fn request_calls(&self) -> u64 {
        self.request_calls.load(Ordering::SeqCst)
    }

    pub fn terminate_calls(&self) -> u64 {
        self.terminate_calls.load(Ordering::SeqCst)
    }

    /// Fail the next `count` terminations.
    pub fn fail_terminations(&self, count: u64) {
        self.failing_terminations.store(count, Ordering::SeqCst);
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
impl Fleet for MockFleet {
    async fn request_instance(&self, request: &RequestInstance) -> Result<String, FleetError> {
        self.request_calls.fetch_add(1, Ordering::SeqCst);
        if self
            .exhausted_types
            .lock()
            .unwrap()
            .contains(&request.instance_type)
        {
            debug!(instance_type = %request.instance_type, "[MOCK] No capacity");
            return Err(FleetError::InsufficientCapacity(format!(
                "no {} capacity in any zone",
                request.instance_type
            )));
        }

        let n = self.id_counter.fetch_add(1, Ordering::SeqCst);
        let instance_id = format!("i-mock-{n:04}");
        let status = if self.hold_activation.load(Ordering::SeqCst) {
            InstanceStatus::Requesting
        } else {
            InstanceStatus::Running
        };
        let view = InstanceView {
            instance_id: instance_id.clone(),
            status,
            instance_type: request.instance_type.clone(),
            tags: request.tags.clone(),
            launched_at: Utc::now(),
        };

        let mut instances = self.instances.lock().unwrap();
        instances.insert(instance_id.clone(), view);
        let live = instances.values().filter(|v| v.status.is_live()).count() as u64;
        self.live_high_water.fetch_max(live, Ordering::SeqCst);
        debug!(%instance_id, "[MOCK] Instance requested");
        Ok(instance_id)
    }

    async fn describe_instance(
        &self,
        instance_id: &str,
    ) -> Result<Option<InstanceView>, FleetError> {
        Ok(self.instances.lock().unwrap().get(instance_id).cloned())
    }

    async fn terminate_instance(&self, instance_id: &str) -> Result<(), FleetError> {
        self.terminate_calls.fetch_add(1, Ordering::SeqCst);
        if Self::take(&self.failing_terminations) {
            debug!(%instance_id, "[MOCK] Termination failing");
            return Err(FleetError::Unexpected {
                status: reqwest::StatusCode::INTERNAL_SERVER_ERROR,
                body: "mock termination failure".to_string(),
            });
        }
        if let Some(view) = self.instances.lock().unwrap().get_mut(instance_id) {
            view.status = InstanceStatus::Terminated;
            debug!(%instance_id, "[MOCK] Instance terminated");
        }
        Ok(())
    }

    async fn list_instances(
        &self,
        tags: &BTreeMap<String, String>,
    ) -> Result<Vec<InstanceView>, FleetError> {
        let instances = self.instances.lock().unwrap();
        Ok(instances
            .values()
            .filter(|v| tags.iter().all(|(k, want)| v.tags.get(k) == Some(want)))
            .cloned()
            .collect())
    }
}
