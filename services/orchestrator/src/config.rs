//! Environment-driven configuration.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use kiln_retry::{BackoffPolicy, DEFAULT_MAX_ATTEMPTS};

use crate::reconciler::ReconcilerConfig;
use crate::selector::{default_allow_list, InstanceType, Selector};

#[derive(Debug, Clone)]
pub struct Config {
    /// Organization whose queued jobs this instance owns.
    pub github_org: String,
    pub github_token: String,
    /// Single-repository mode; the whole org is scanned when unset.
    pub github_repo: Option<String>,
    pub github_api_base: String,
    pub github_base_url: String,
    pub fleet_api_base: Option<String>,
    pub fleet_api_token: Option<String>,
    pub machine_image: Option<String>,
    pub listen_addr: String,
    pub poll_interval: Duration,
    pub sweep_interval: Duration,
    pub max_concurrent_instances: usize,
    pub idle_timeout: Duration,
    pub provision_timeout: Duration,
    pub max_active_age: Duration,
    pub orphan_grace: Duration,
    pub record_retention: Duration,
    pub call_timeout: Duration,
    pub max_attempts: u32,
    pub default_instance_type: String,
    pub default_price_ceiling: f64,
    pub instance_types: Vec<InstanceType>,
    pub runner_labels: Vec<String>,
    pub webhook_secret: Option<String>,
    pub log_level: String,
    pub dev_mode: bool,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let dev_mode = std::env::var("KILN_DEV")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false);

        let mut github_org = env_or("KILN_GITHUB_ORG", "");
        let github_token = env_or("KILN_GITHUB_TOKEN", "");
        let fleet_api_base = env_opt("KILN_FLEET_API_BASE");
        if !dev_mode {
            if github_org.is_empty() {
                bail!("KILN_GITHUB_ORG is required outside dev mode");
            }
            if github_token.is_empty() {
                bail!("KILN_GITHUB_TOKEN is required outside dev mode");
            }
            if fleet_api_base.is_none() {
                bail!("KILN_FLEET_API_BASE is required outside dev mode");
            }
        }
        if github_org.is_empty() {
            github_org = "dev".to_string();
        }

        let default_price_ceiling: f64 = env_or("KILN_DEFAULT_PRICE_CEILING", "0.10")
            .parse()
            .context("KILN_DEFAULT_PRICE_CEILING must be a decimal")?;
        if !default_price_ceiling.is_finite() || default_price_ceiling <= 0.0 {
            bail!("KILN_DEFAULT_PRICE_CEILING must be positive");
        }

        let instance_types = match env_opt("KILN_INSTANCE_TYPES") {
            Some(raw) => parse_instance_types(&raw)?,
            None => default_allow_list(),
        };
        let default_instance_type = env_or("KILN_DEFAULT_INSTANCE_TYPE", "t3.medium");
        if !instance_types.iter().any(|t| t.name == default_instance_type) {
            bail!("default instance type {default_instance_type:?} is not in the allow-list");
        }

        Ok(Self {
            github_org,
            github_token,
            github_repo: env_opt("KILN_GITHUB_REPO"),
            github_api_base: env_or("KILN_GITHUB_API_BASE", "https://api.github.com"),
            github_base_url: env_or("KILN_GITHUB_BASE_URL", "https://github.com"),
            fleet_api_base,
            fleet_api_token: env_opt("KILN_FLEET_API_TOKEN"),
            machine_image: env_opt("KILN_MACHINE_IMAGE"),
            listen_addr: env_or("KILN_LISTEN_ADDR", "0.0.0.0:8080"),
            poll_interval: env_secs("KILN_POLL_INTERVAL", 30)?,
            sweep_interval: env_secs("KILN_SWEEP_INTERVAL", 300)?,
            max_concurrent_instances: env_or("KILN_MAX_INSTANCES", "10")
                .parse()
                .context("KILN_MAX_INSTANCES must be an integer")?,
            idle_timeout: env_secs("KILN_IDLE_TIMEOUT", 300)?,
            provision_timeout: env_secs("KILN_PROVISION_TIMEOUT", 300)?,
            max_active_age: env_secs("KILN_MAX_ACTIVE_AGE", 7200)?,
            orphan_grace: env_secs("KILN_ORPHAN_GRACE", 3600)?,
            record_retention: env_secs("KILN_RECORD_RETENTION", 3600)?,
            call_timeout: env_secs("KILN_CALL_TIMEOUT", 30)?,
            max_attempts: env_or("KILN_MAX_ATTEMPTS", &DEFAULT_MAX_ATTEMPTS.to_string())
                .parse()
                .context("KILN_MAX_ATTEMPTS must be an integer")?,
            default_instance_type,
            default_price_ceiling,
            instance_types,
            runner_labels: split_csv(&env_or("KILN_RUNNER_LABELS", "self-hosted,linux,x64")),
            webhook_secret: env_opt("KILN_WEBHOOK_SECRET"),
            log_level: env_or("KILN_LOG_LEVEL", "info"),
            dev_mode,
        })
    }

    /// The reconciler's view of this configuration.
    pub fn reconciler(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            poll_interval: self.poll_interval,
            max_concurrent_instances: self.max_concurrent_instances,
            max_attempts: self.max_attempts,
            idle_timeout: self.idle_timeout,
            provision_timeout: self.provision_timeout,
            max_active_age: self.max_active_age,
            orphan_grace: self.orphan_grace,
            record_retention: self.record_retention,
            namespace: self.github_org.clone(),
            runner_labels: self.runner_labels.clone(),
            github_base_url: self.github_base_url.clone(),
            machine_image: self.machine_image.clone(),
            backoff: BackoffPolicy::default(),
        }
    }

    pub fn selector(&self) -> Selector {
        Selector::new(
            self.instance_types.clone(),
            self.default_instance_type.clone(),
            self.default_price_ceiling,
        )
    }
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_secs(name: &str, default: u64) -> Result<Duration> {
    let seconds = match std::env::var(name) {
        Err(_) => default,
        Ok(raw) => raw
            .parse()
            .with_context(|| format!("{name} must be an integer number of seconds"))?,
    };
    Ok(Duration::from_secs(seconds))
}

/// Parse an allow-list override of the form `name:cpus:price,...`.
fn parse_instance_types(raw: &str) -> Result<Vec<InstanceType>> {
    let mut types = Vec::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let mut parts = entry.split(':');
        let (Some(name), Some(cpus), Some(price), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            bail!("instance type entry {entry:?} is not name:cpus:price");
        };
        let cpus: u32 = cpus
            .parse()
            .with_context(|| format!("instance type {name:?}: bad cpu count {cpus:?}"))?;
        let price: f64 = price
            .parse()
            .with_context(|| format!("instance type {name:?}: bad price {price:?}"))?;
        if cpus == 0 || !price.is_finite() || price <= 0.0 {
            bail!("instance type {name:?} must have positive cpus and price");
        }
        types.push(InstanceType::new(name, cpus, price));
    }
    if types.is_empty() {
        bail!("KILN_INSTANCE_TYPES is set but empty");
    }
    Ok(types)
}

fn split_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_instance_types() {
        let types = parse_instance_types("t3.medium:2:0.0125, c5.2xlarge:8:0.09").unwrap();
        assert_eq!(types.len(), 2);
        assert_eq!(types[0].name, "t3.medium");
        assert_eq!(types[1].cpus, 8);
        assert_eq!(types[1].price, 0.09);
    }

    #[test]
    fn test_parse_instance_types_rejects_bad_entries() {
        assert!(parse_instance_types("t3.medium:2").is_err());
        assert!(parse_instance_types("t3.medium:2:0.01:extra").is_err());
        assert!(parse_instance_types("t3.medium:zero:0.01").is_err());
        assert!(parse_instance_types("t3.medium:0:0.01").is_err());
        assert!(parse_instance_types("t3.medium:2:-1").is_err());
        assert!(parse_instance_types("").is_err());
    }

    #[test]
    fn test_split_csv_trims_and_drops_empties() {
        assert_eq!(split_csv("a, b ,,c"), vec!["a", "b", "c"]);
        assert!(split_csv("").is_empty());
    }
}
