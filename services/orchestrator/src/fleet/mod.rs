//! Fleet provider abstraction.
//!
//! Instances are requested one at a time, tagged so a later pass (or a
//! different process entirely) can recognize them, and terminated
//! idempotently. The HTTP client and the in-memory mock are
//! interchangeable behind the [`Fleet`] trait.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod http;
mod mock;

pub use http::HttpFleet;
pub use mock::MockFleet;

/// Value of the `managed-by` tag on every instance this service creates.
pub const MANAGED_BY: &str = "kiln";

pub const TAG_MANAGED_BY: &str = "managed-by";
pub const TAG_NAMESPACE: &str = "namespace";
pub const TAG_JOB_ID: &str = "job-id";
pub const TAG_RUN_KEY: &str = "run-key";
pub const TAG_RUNNER_NAME: &str = "runner-name";
pub const TAG_NAME: &str = "Name";

/// Provider-side lifecycle of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Requesting,
    Running,
    Terminating,
    Terminated,
    Failed,
}

impl InstanceStatus {
    /// Whether the instance still exists (or will) from the provider's
    /// point of view.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Requesting | Self::Running)
    }
}

/// One spot instance request. Serializes to the provider's create body.
#[derive(Debug, Clone, Serialize)]
pub struct RequestInstance {
    pub instance_type: String,
    pub price_ceiling: f64,
    #[serde(rename = "image", skip_serializing_if = "Option::is_none")]
    pub machine_image: Option<String>,
    /// Base64-encoded bootstrap script.
    pub user_data: String,
    pub tags: BTreeMap<String, String>,
}

/// Provider view of one instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceView {
    pub instance_id: String,
    pub status: InstanceStatus,
    pub instance_type: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    pub launched_at: DateTime<Utc>,
}

impl InstanceView {
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }
}

#[derive(Debug, Error)]
pub enum FleetError {
    #[error("insufficient capacity: {0}")]
    InsufficientCapacity(String),

    #[error("price ceiling exceeded: {0}")]
    PriceExceeded(String),

    #[error("rate limited by fleet API")]
    RateLimited { retry_after: Option<Duration> },

    #[error("fleet request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("fleet API returned {status}: {body}")]
    Unexpected {
        status: reqwest::StatusCode,
        body: String,
    },
}

/// Compute provider seam.
#[async_trait]
pub trait Fleet: Send + Sync {
    /// Submit a request; returns the provider's instance id.
    async fn request_instance(&self, request: &RequestInstance) -> Result<String, FleetError>;

    /// Current view of one instance, `None` if the provider does not know
    /// the id.
    async fn describe_instance(&self, instance_id: &str)
        -> Result<Option<InstanceView>, FleetError>;

    /// Terminate an instance. Unknown ids are a success: the goal state
    /// already holds.
    async fn terminate_instance(&self, instance_id: &str) -> Result<(), FleetError>;

    /// Instances carrying every one of the given tags.
    async fn list_instances(
        &self,
        tags: &BTreeMap<String, String>,
    ) -> Result<Vec<InstanceView>, FleetError>;
}
