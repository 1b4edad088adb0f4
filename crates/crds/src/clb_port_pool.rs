//! CLBPortPool CRD
//!
//! A named range of listener ports spread over a set of CLB instances.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[kube(
    group = "networking.clb.io",
    version = "v1alpha1",
    kind = "CLBPortPool",
    shortname = "cpp",
    status = "CLBPortPoolStatus",
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"StartPort","type":"integer","jsonPath":".spec.startPort"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CLBPortPoolSpec {
    /// First port of the pool
    pub start_port: u16,

    /// Last port of the pool (defaults to 65535)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_port: Option<u16>,

    /// Listener quota per load balancer, overriding the account quota
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listener_quota: Option<u16>,

    /// Ports per allocation unit; 0 or 1 allocates single ports
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segment_length: Option<u16>,

    /// Region of the load balancers (defaults to the controller region)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,

    /// Load balancer selection policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lb_policy: Option<LbPolicy>,

    /// Load balancers created outside the controller
    #[serde(default, rename = "existingLoadBalancerIDs")]
    pub existing_load_balancer_ids: Vec<String>,

    /// Automatic load balancer creation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_create: Option<AutoCreateConfig>,
}

impl CLBPortPoolSpec {
    /// Whether the controller may create load balancers for this pool.
    pub fn auto_create_enabled(&self) -> bool {
        self.auto_create.as_ref().is_some_and(|c| c.enabled)
    }
}

/// Load balancer selection policy
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub enum LbPolicy {
    /// Least-loaded first
    #[default]
    Uniform,
    /// Configured order
    InOrder,
    /// Random order
    Random,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct AutoCreateConfig {
    /// Create load balancers when every existing one is full
    #[serde(default)]
    pub enabled: bool,

    /// Upper bound on auto-created load balancers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_load_balancers: Option<u16>,

    /// Provider parameters passed through on creation
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CLBPortPoolStatus {
    /// Pool state
    #[serde(default)]
    pub state: PortPoolState,

    /// Human-readable reason for the current state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Effective listener quota per load balancer
    #[serde(default)]
    pub quota: u16,

    /// Observed load balancers
    #[serde(default)]
    pub load_balancer_statuses: Vec<LoadBalancerStatus>,

    /// Last reconciliation timestamp
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reconciled: Option<chrono::DateTime<chrono::Utc>>,
}

impl CLBPortPoolStatus {
    /// IDs of load balancers created by the controller.
    pub fn auto_created_ids(&self) -> Vec<String> {
        self.load_balancer_statuses
            .iter()
            .filter(|lb| lb.auto_created.unwrap_or(false))
            .map(|lb| lb.load_balancer_id.clone())
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
/// Port pool state
#[serde(rename_all = "PascalCase")]
pub enum PortPoolState {
    /// Not synced yet
    #[default]
    Pending,
    /// Ready for allocation
    Active,
    /// Creating load balancers
    Scaling,
    /// Being deleted
    Deleting,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerStatus {
    /// Created by the controller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_created: Option<bool>,

    /// Observed state
    #[serde(default)]
    pub state: LoadBalancerState,

    /// Provider load balancer ID
    #[serde(rename = "loadbalancerID")]
    pub load_balancer_id: String,

    /// Provider load balancer name
    #[serde(default, rename = "loadbalancerName")]
    pub load_balancer_name: String,

    /// VIPs
    #[serde(default)]
    pub ips: Vec<String>,

    /// Domain name, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,

    /// Listeners allocated on this load balancer
    #[serde(default)]
    pub allocated: u16,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
/// Observed load balancer state
pub enum LoadBalancerState {
    /// Exists and serves traffic
    #[default]
    Running,
    /// Not found at the provider
    NotFound,
}
