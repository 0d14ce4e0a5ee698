//! Label parsing for runner requests.
//!
//! CI jobs address this orchestrator through their label set. Labels are
//! `key=value` strings; the `runs-on` key marks a job as a request for an
//! ephemeral runner and carries the caller's correlation key. Jobs without
//! it are simply not ours.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Correlation key label. Required for a job to be considered at all.
pub const LABEL_RUN_KEY: &str = "runs-on";

/// Explicit instance type label. Mutually exclusive with [`LABEL_CPU`].
pub const LABEL_INSTANCE_TYPE: &str = "instanceType";

/// Minimum cpu count label. Mutually exclusive with [`LABEL_INSTANCE_TYPE`].
pub const LABEL_CPU: &str = "cpu";

/// Spot price ceiling label, in currency per hour.
pub const LABEL_MAX_PRICE: &str = "maxPrice";

/// Parsed resource request extracted from a job's labels.
///
/// At most one of `instance_type` and `cpu_count` is set; neither set means
/// the configured default type applies.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestSpec {
    /// Caller-supplied correlation key from `runs-on=`.
    pub run_key: String,

    /// Explicitly requested instance type.
    pub instance_type: Option<String>,

    /// Minimum cpu count.
    pub cpu_count: Option<u32>,

    /// Spot price ceiling.
    pub max_price: Option<f64>,
}

/// Rejection of a label set, naming the offending label.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("label {label:?}: value must not be empty")]
    EmptyValue { label: String },

    #[error("label {label:?}: expected a positive integer")]
    InvalidCpu { label: String },

    #[error("label {label:?}: expected a positive decimal")]
    InvalidPrice { label: String },

    #[error("label {label:?} conflicts with {other:?}: request an instance type or a cpu count, not both")]
    ConflictingAxes { label: String, other: String },
}

/// Parse a job's labels into a resource request.
///
/// Returns `Ok(None)` when no `runs-on` label is present: the job is not a
/// request for this orchestrator, which is never an error. Unknown keys are
/// ignored so callers can carry labels for other tooling. When a known key
/// appears more than once the last occurrence wins.
pub fn parse_labels(labels: &[String]) -> Result<Option<RequestSpec>, ValidationError> {
    let mut run_key: Option<(&str, &String)> = None;
    let mut instance_type: Option<(&str, &String)> = None;
    let mut cpu: Option<(&str, &String)> = None;
    let mut max_price: Option<(&str, &String)> = None;

    for label in labels {
        let Some((key, value)) = label.split_once('=') else {
            continue;
        };
        let slot = match key {
            LABEL_RUN_KEY => &mut run_key,
            LABEL_INSTANCE_TYPE => &mut instance_type,
            LABEL_CPU => &mut cpu,
            LABEL_MAX_PRICE => &mut max_price,
            _ => continue,
        };
        *slot = Some((value, label));
    }

    // Applicability is decided before any validation.
    let Some((run_key, run_key_label)) = run_key else {
        return Ok(None);
    };
    if run_key.is_empty() {
        return Err(ValidationError::EmptyValue {
            label: run_key_label.clone(),
        });
    }

    if let (Some((_, type_label)), Some((_, cpu_label))) = (&instance_type, &cpu) {
        return Err(ValidationError::ConflictingAxes {
            label: (*cpu_label).clone(),
            other: (*type_label).clone(),
        });
    }

    let instance_type = match instance_type {
        Some((value, label)) => {
            if value.is_empty() {
                return Err(ValidationError::EmptyValue {
                    label: label.clone(),
                });
            }
            Some(value.to_string())
        }
        None => None,
    };

    let cpu_count = match cpu {
        Some((value, label)) => {
            let cpus: u32 = value.parse().map_err(|_| ValidationError::InvalidCpu {
                label: label.clone(),
            })?;
            if cpus == 0 {
                return Err(ValidationError::InvalidCpu {
                    label: label.clone(),
                });
            }
            Some(cpus)
        }
        None => None,
    };

    let max_price = match max_price {
        Some((value, label)) => {
            let price: f64 = value.parse().map_err(|_| ValidationError::InvalidPrice {
                label: label.clone(),
            })?;
            if !price.is_finite() || price <= 0.0 {
                return Err(ValidationError::InvalidPrice {
                    label: label.clone(),
                });
            }
            Some(price)
        }
        None => None,
    };

    Ok(Some(RequestSpec {
        run_key: run_key.to_string(),
        instance_type,
        cpu_count,
        max_price,
    }))
}
