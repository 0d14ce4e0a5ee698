//! HTTP implementation of [`Fleet`].

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, RETRY_AFTER};
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::debug;

use super::{Fleet, FleetError, InstanceView, RequestInstance};

/// Client for the provider's JSON instance API.
#[derive(Debug, Clone)]
pub struct HttpFleet {
    client: reqwest::Client,
    base_url: String,
}

impl HttpFleet {
    pub fn new(
        base_url: &str,
        token: Option<&str>,
        call_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        if let Some(token) = token {
            let mut auth = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|_| anyhow::anyhow!("Fleet token contains invalid header characters"))?;
            auth.set_sensitive(true);
            headers.insert(AUTHORIZATION, auth);
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(call_timeout)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait]
impl Fleet for HttpFleet {
    async fn request_instance(&self, request: &RequestInstance) -> Result<String, FleetError> {
        let url = self.url("/v1/instances");
        debug!(%url, instance_type = %request.instance_type, "Requesting instance");
        let response = self.client.post(&url).json(request).send().await?;
        let response = check(response).await?;
        let created: CreatedInstance = response.json().await?;
        Ok(created.instance_id)
    }

    async fn describe_instance(
        &self,
        instance_id: &str,
    ) -> Result<Option<InstanceView>, FleetError> {
        let url = self.url(&format!("/v1/instances/{instance_id}"));
        debug!(%url, "Describing instance");
        let response = self.client.get(&url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = check(response).await?;
        Ok(Some(response.json().await?))
    }

    async fn terminate_instance(&self, instance_id: &str) -> Result<(), FleetError> {
        let url = self.url(&format!("/v1/instances/{instance_id}"));
        debug!(%url, "Terminating instance");
        let response = self.client.delete(&url).send().await?;
        // Already gone means the goal state holds.
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        check(response).await?;
        Ok(())
    }

    async fn list_instances(
        &self,
        tags: &BTreeMap<String, String>,
    ) -> Result<Vec<InstanceView>, FleetError> {
        let url = self.url("/v1/instances");
        let query: Vec<(String, &str)> = tags
            .iter()
            .map(|(k, v)| (format!("tag:{k}"), v.as_str()))
            .collect();
        debug!(%url, filters = query.len(), "Listing instances");
        let response = self.client.get(&url).query(&query).send().await?;
        let response = check(response).await?;
        let listing: InstanceListing = response.json().await?;
        Ok(listing.instances)
    }
}

/// Map a non-success response to the fleet error taxonomy.
async fn check(response: reqwest::Response) -> Result<reqwest::Response, FleetError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs);
        return Err(FleetError::RateLimited { retry_after });
    }

    let body = response.text().await.unwrap_or_default();
    if status == StatusCode::CONFLICT {
        if let Ok(error) = serde_json::from_str::<ProviderError>(&body) {
            match error.code.as_str() {
                "insufficient_capacity" => {
                    return Err(FleetError::InsufficientCapacity(error.message))
                }
                "price_exceeded" => return Err(FleetError::PriceExceeded(error.message)),
                _ => {}
            }
        }
    }
    Err(FleetError::Unexpected { status, body })
}

#[derive(Debug, Deserialize)]
struct CreatedInstance {
    instance_id: String,
}

#[derive(Debug, Deserialize)]
struct InstanceListing {
    instances: Vec<InstanceView>,
}

#[derive(Debug, Deserialize)]
struct ProviderError {
    code: String,
    #[serde(default)]
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::InstanceStatus;

    #[test]
    fn test_instance_view_deserializes() {
        let json = r#"{
            "instance_id": "i-0abc123",
            "status": "running",
            "instance_type": "c5.2xlarge",
            "tags": {"managed-by": "kiln", "job-id": "31"},
            "launched_at": "2026-08-21T09:30:00Z"
        }"#;

        let view: InstanceView = serde_json::from_str(json).unwrap();
        assert_eq!(view.instance_id, "i-0abc123");
        assert_eq!(view.status, InstanceStatus::Running);
        assert_eq!(view.tag("job-id"), Some("31"));
    }

    #[test]
    fn test_listing_tolerates_missing_tags() {
        let json = r#"{
            "instances": [
                {
                    "instance_id": "i-1",
                    "status": "requesting",
                    "instance_type": "t3.medium",
                    "launched_at": "2026-08-21T09:30:00Z"
                }
            ]
        }"#;

        let listing: InstanceListing = serde_json::from_str(json).unwrap();
        assert!(listing.instances[0].tags.is_empty());
        assert!(listing.instances[0].status.is_live());
    }

    #[test]
    fn test_create_body_shape() {
        let request = RequestInstance {
            instance_type: "t3.medium".to_string(),
            price_ceiling: 0.0125,
            machine_image: None,
            user_data: "IyEvYmluL2Jhc2g=".to_string(),
            tags: BTreeMap::from([("managed-by".to_string(), "kiln".to_string())]),
        };

        let body = serde_json::to_value(&request).unwrap();
        assert_eq!(body["instance_type"], "t3.medium");
        assert_eq!(body["tags"]["managed-by"], "kiln");
        assert!(body.get("image").is_none());
    }
}
