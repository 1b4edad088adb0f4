//! CLB API HTTP client
//!
//! Speaks the provider's JSON action protocol: every call is a `POST` to the
//! endpoint root with the action and region in headers. Responses are wrapped
//! in `{"Response": {..., "Error"?: {"Code", "Message"}, "RequestId"}}`.

use crate::clb_trait::ClbApi;
use crate::error::ClbError;
use crate::models::*;
use reqwest::Client;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::debug;

/// CLB API HTTP client
#[derive(Debug, Clone)]
pub struct HttpClbApi {
    client: Client,
    endpoint: String,
    token: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ApiErrorBody {
    code: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CreateListenerResponse {
    #[serde(default)]
    listener_ids: Vec<String>,
    request_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TaskResponse {
    request_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeListenersResponse {
    #[serde(default)]
    listeners: Vec<Listener>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeTargetsResponse {
    #[serde(default)]
    listeners: Vec<ListenerTargets>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeLoadBalancersResponse {
    #[serde(default, rename = "LoadBalancerSet")]
    load_balancers: Vec<LoadBalancer>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CreateLoadBalancerResponse {
    #[serde(default, rename = "LoadBalancerIds")]
    load_balancer_ids: Vec<String>,
    request_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeQuotaResponse {
    #[serde(default)]
    quota_set: Vec<Quota>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeTaskStatusResponse {
    status: i64,
    #[serde(default)]
    message: Option<String>,
}

/// Extracts the `Response` object, turning an embedded `Error` into [`ClbError`].
pub(crate) fn decode_envelope<T: DeserializeOwned>(body: &str) -> Result<T, ClbError> {
    let mut envelope: Value = serde_json::from_str(body)?;
    let response = envelope
        .get_mut("Response")
        .map(Value::take)
        .ok_or_else(|| ClbError::Api {
            code: "InvalidResponse".to_string(),
            message: format!(
                "missing Response object: {}",
                body.chars().take(500).collect::<String>()
            ),
        })?;
    if let Some(error) = response.get("Error") {
        let error: ApiErrorBody = serde_json::from_value(error.clone())?;
        return Err(ClbError::from_code(&error.code, &error.message));
    }
    Ok(serde_json::from_value(response)?)
}

impl HttpClbApi {
    /// Create a new CLB API client
    ///
    /// # Arguments
    /// * `endpoint` - API endpoint (e.g., "https://clb.api.example.com")
    /// * `token` - Bearer token for authentication
    pub fn new(endpoint: String, token: String) -> Result<Self, ClbError> {
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;

        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            token,
        })
    }

    /// Get the endpoint
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn call<T: DeserializeOwned>(&self, action: &str, region: &str, body: Value) -> Result<T, ClbError> {
        debug!("CLB call {} in {}", action, region);
        let response = self
            .client
            .post(format!("{}/", self.endpoint))
            .bearer_auth(&self.token)
            .header("X-Clb-Action", action)
            .header("X-Clb-Region", region)
            .header("Accept", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if status.as_u16() == 429 {
            return Err(ClbError::RateLimited(format!("{action}: HTTP 429")));
        }
        // Errors usually arrive in the envelope with 200, but not always
        match decode_envelope(&text) {
            Ok(value) if status.is_success() => Ok(value),
            Ok(_) => Err(ClbError::Api {
                code: status.to_string(),
                message: text.chars().take(500).collect(),
            }),
            Err(e) => Err(e),
        }
    }
}

#[async_trait::async_trait]
impl ClbApi for HttpClbApi {
    async fn create_listeners(
        &self,
        region: &str,
        lb_id: &str,
        listeners: &[CreateListenerRequest],
    ) -> Result<(Vec<String>, String), ClbError> {
        let response: CreateListenerResponse = self
            .call(
                "CreateListener",
                region,
                json!({ "LoadBalancerId": lb_id, "Listeners": listeners }),
            )
            .await?;
        Ok((response.listener_ids, response.request_id))
    }

    async fn delete_listeners(&self, region: &str, lb_id: &str, listener_ids: &[String]) -> Result<String, ClbError> {
        let response: TaskResponse = self
            .call(
                "DeleteLoadBalancerListeners",
                region,
                json!({ "LoadBalancerId": lb_id, "ListenerIds": listener_ids }),
            )
            .await?;
        Ok(response.request_id)
    }

    async fn describe_listeners(
        &self,
        region: &str,
        lb_id: &str,
        port: Option<u16>,
        protocol: Option<&str>,
    ) -> Result<Vec<Listener>, ClbError> {
        let mut body = json!({ "LoadBalancerId": lb_id });
        if let Some(port) = port {
            body["Port"] = json!(port);
        }
        if let Some(protocol) = protocol {
            body["Protocol"] = json!(protocol);
        }
        let response: DescribeListenersResponse = self.call("DescribeListeners", region, body).await?;
        Ok(response.listeners)
    }

    async fn register_targets(&self, region: &str, lb_id: &str, targets: &[ListenerTarget]) -> Result<String, ClbError> {
        let response: TaskResponse = self
            .call(
                "BatchRegisterTargets",
                region,
                json!({ "LoadBalancerId": lb_id, "Targets": targets }),
            )
            .await?;
        Ok(response.request_id)
    }

    async fn deregister_targets(&self, region: &str, lb_id: &str, targets: &[ListenerTarget]) -> Result<String, ClbError> {
        let response: TaskResponse = self
            .call(
                "BatchDeregisterTargets",
                region,
                json!({ "LoadBalancerId": lb_id, "Targets": targets }),
            )
            .await?;
        Ok(response.request_id)
    }

    async fn describe_targets(
        &self,
        region: &str,
        lb_id: &str,
        listener_ids: &[String],
    ) -> Result<Vec<ListenerTargets>, ClbError> {
        let response: DescribeTargetsResponse = self
            .call(
                "DescribeTargets",
                region,
                json!({ "LoadBalancerId": lb_id, "ListenerIds": listener_ids }),
            )
            .await?;
        Ok(response.listeners)
    }

    async fn describe_load_balancers(&self, region: &str, lb_ids: &[String]) -> Result<Vec<LoadBalancer>, ClbError> {
        let response: DescribeLoadBalancersResponse = self
            .call("DescribeLoadBalancers", region, json!({ "LoadBalancerIds": lb_ids }))
            .await?;
        Ok(response.load_balancers)
    }

    async fn create_load_balancer(
        &self,
        region: &str,
        request: &CreateLoadBalancerRequest,
    ) -> Result<(String, String), ClbError> {
        let response: CreateLoadBalancerResponse = self
            .call("CreateLoadBalancer", region, serde_json::to_value(request)?)
            .await?;
        let lb_id = response
            .load_balancer_ids
            .into_iter()
            .next()
            .ok_or_else(|| ClbError::Api {
                code: "InvalidResponse".to_string(),
                message: "CreateLoadBalancer returned no load balancer ID".to_string(),
            })?;
        Ok((lb_id, response.request_id))
    }

    async fn delete_load_balancers(&self, region: &str, lb_ids: &[String]) -> Result<String, ClbError> {
        let response: TaskResponse = self
            .call("DeleteLoadBalancer", region, json!({ "LoadBalancerIds": lb_ids }))
            .await?;
        Ok(response.request_id)
    }

    async fn describe_quota(&self, region: &str) -> Result<Vec<Quota>, ClbError> {
        let response: DescribeQuotaResponse = self.call("DescribeQuota", region, json!({})).await?;
        Ok(response.quota_set)
    }

    async fn describe_task_status(&self, region: &str, task_id: &str) -> Result<(TaskStatus, Option<String>), ClbError> {
        let response: DescribeTaskStatusResponse = self
            .call("DescribeTaskStatus", region, json!({ "TaskId": task_id }))
            .await?;
        Ok((TaskStatus::from_code(response.status), response.message))
    }
}
