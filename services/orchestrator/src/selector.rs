//! Instance type selection against the configured allow-list.
//!
//! Selection is price-driven: among the allow-listed types that satisfy the
//! request, the cheapest wins. More expensive candidates are kept as a
//! fallback chain so a capacity miss on the first choice can walk upward
//! instead of failing the job.
//!
//! # Invariants
//!
//! - A request naming a type outside the allow-list is unsatisfiable, never
//!   silently substituted.
//! - A price ceiling below every candidate's floor is detected here, before
//!   anything is requested from the fleet.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::labels::RequestSpec;

/// One allow-listed machine shape with its expected spot price.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceType {
    pub name: String,
    pub cpus: u32,
    pub price: f64,
}

impl InstanceType {
    pub fn new(name: impl Into<String>, cpus: u32, price: f64) -> Self {
        Self {
            name: name.into(),
            cpus,
            price,
        }
    }
}

/// Request that no allow-listed type can satisfy. Terminal for the job.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum UnsatisfiableRequest {
    #[error("instance type {0:?} is not in the allow-list")]
    TypeNotAllowed(String),

    #[error("no allow-listed instance type has {0} cpus")]
    NoTypeWithCpus(u32),

    #[error("price ceiling {ceiling} is below the floor {floor} of cheapest candidate {cheapest:?}")]
    CeilingBelowFloor {
        ceiling: f64,
        cheapest: String,
        floor: f64,
    },
}

/// Resolved placement for one job.
///
/// `candidates` is ordered cheapest first; the head is the choice and the
/// tail is walked only on fleet capacity errors.
#[derive(Debug, Clone)]
pub struct Placement {
    pub candidates: Vec<InstanceType>,
    pub price_ceiling: f64,
}

impl Placement {
    /// The cheapest satisfying type.
    pub fn chosen(&self) -> &InstanceType {
        &self.candidates[0]
    }
}

/// The stock allow-list used when the operator does not configure one.
pub fn default_allow_list() -> Vec<InstanceType> {
    vec![
        InstanceType::new("t3.micro", 2, 0.0031),
        InstanceType::new("t3.medium", 2, 0.0125),
        InstanceType::new("t3.xlarge", 4, 0.05),
        InstanceType::new("t3.2xlarge", 8, 0.0998),
        InstanceType::new("m5.4xlarge", 16, 0.2304),
        InstanceType::new("m5.8xlarge", 32, 0.4608),
        InstanceType::new("m5.16xlarge", 64, 0.9216),
    ]
}

/// Maps parsed requests onto the allow-list.
#[derive(Debug, Clone)]
pub struct Selector {
    allow_list: Vec<InstanceType>,
    default_type: String,
    default_ceiling: f64,
}

impl Selector {
    pub fn new(allow_list: Vec<InstanceType>, default_type: String, default_ceiling: f64) -> Self {
        Self {
            allow_list,
            default_type,
            default_ceiling,
        }
    }

    pub fn allow_list(&self) -> &[InstanceType] {
        &self.allow_list
    }

    /// Resolve a request to an ordered candidate list.
    pub fn select(&self, spec: &RequestSpec) -> Result<Placement, UnsatisfiableRequest> {
        let mut candidates = if let Some(name) = &spec.instance_type {
            let found = self
                .allow_list
                .iter()
                .find(|t| &t.name == name)
                .cloned()
                .ok_or_else(|| UnsatisfiableRequest::TypeNotAllowed(name.clone()))?;
            vec![found]
        } else if let Some(cpus) = spec.cpu_count {
            let mut matching: Vec<InstanceType> = self
                .allow_list
                .iter()
                .filter(|t| t.cpus >= cpus)
                .cloned()
                .collect();
            if matching.is_empty() {
                return Err(UnsatisfiableRequest::NoTypeWithCpus(cpus));
            }
            matching.sort_by(|a, b| {
                a.price
                    .total_cmp(&b.price)
                    .then_with(|| a.cpus.cmp(&b.cpus))
            });
            matching
        } else {
            let found = self
                .allow_list
                .iter()
                .find(|t| t.name == self.default_type)
                .cloned()
                .ok_or_else(|| UnsatisfiableRequest::TypeNotAllowed(self.default_type.clone()))?;
            vec![found]
        };

        let ceiling = spec.max_price.unwrap_or(self.default_ceiling);
        let cheapest = candidates[0].clone();
        candidates.retain(|t| t.price <= ceiling);
        if candidates.is_empty() {
            return Err(UnsatisfiableRequest::CeilingBelowFloor {
                ceiling,
                cheapest: cheapest.name,
                floor: cheapest.price,
            });
        }

        Ok(Placement {
            candidates,
            price_ceiling: ceiling,
        })
    }
}
