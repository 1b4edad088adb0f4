//! CLB API models
//!
//! Request and response bodies of the provider's JSON action protocol.
//! Field names are PascalCase on the wire.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Listener on a load balancer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct Listener {
    /// Listener ID
    pub listener_id: String,
    /// Listener protocol (TCP, UDP, TCP_SSL, QUIC)
    pub protocol: String,
    /// First port
    pub port: u16,
    /// Last port of a port-range listener
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_port: Option<u16>,
    /// Certificate bound to TLS or QUIC listeners
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_id: Option<String>,
}

/// Backend address registered behind a listener
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "PascalCase")]
pub struct Target {
    /// Backend IP
    pub ip: String,
    /// Backend port
    pub port: u16,
}

impl Target {
    /// Creates a target.
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self { ip: ip.into(), port }
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// Load balancer instance
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "PascalCase")]
pub struct LoadBalancer {
    /// Load balancer ID
    pub load_balancer_id: String,
    /// Display name
    #[serde(default)]
    pub load_balancer_name: String,
    /// VIPs
    #[serde(default, rename = "LoadBalancerVips")]
    pub vips: Vec<String>,
    /// Domain name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
}

/// Listener to create
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct CreateListenerRequest {
    /// First port
    pub port: u16,
    /// Last port of a port-range listener
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_port: Option<u16>,
    /// Listener protocol
    pub protocol: String,
    /// Listener name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listener_name: Option<String>,
    /// Certificate ID for TCP_SSL and QUIC
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_id: Option<String>,
}

/// Optional listener settings
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListenerExtra {
    /// Listener name
    pub name: Option<String>,
    /// Certificate ID
    pub certificate_id: Option<String>,
}

/// One target on one listener, the unit of target batch calls
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct ListenerTarget {
    /// Listener ID
    pub listener_id: String,
    /// Backend IP
    #[serde(rename = "EniIp")]
    pub ip: String,
    /// Backend port
    pub port: u16,
}

/// Targets of one listener
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct ListenerTargets {
    /// Listener ID
    pub listener_id: String,
    /// Registered backends
    #[serde(default)]
    pub targets: Vec<Target>,
}

/// State of an asynchronous provider task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// Finished successfully
    Succeeded,
    /// Finished with an error
    Failed,
    /// Still running
    Running,
}

impl TaskStatus {
    /// Decodes the numeric status of `DescribeTaskStatus`.
    pub fn from_code(code: i64) -> Self {
        match code {
            0 => TaskStatus::Succeeded,
            1 => TaskStatus::Failed,
            _ => TaskStatus::Running,
        }
    }
}

/// Account quota entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct Quota {
    /// Quota name, e.g. `TOTAL_LISTENER_QUOTA`
    pub quota_id: String,
    /// Current usage, when reported
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quota_current: Option<u64>,
    /// Limit
    pub quota_limit: u64,
}

/// Quota ID of the per-LB listener limit
pub const LISTENER_QUOTA_ID: &str = "TOTAL_LISTENER_QUOTA";

/// Load balancer to create
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "PascalCase")]
pub struct CreateLoadBalancerRequest {
    /// Display name
    pub load_balancer_name: String,
    /// Network type, `OPEN` for public load balancers
    pub load_balancer_type: String,
    /// Extra provider parameters
    #[serde(flatten)]
    pub parameters: BTreeMap<String, serde_json::Value>,
}

impl CreateLoadBalancerRequest {
    /// Public load balancer with pass-through parameters.
    ///
    /// Parameter values that parse as JSON are sent as JSON, others as strings.
    pub fn new(name: impl Into<String>, parameters: &BTreeMap<String, String>) -> Self {
        let parameters = parameters
            .iter()
            .map(|(k, v)| {
                let value = serde_json::from_str(v).unwrap_or_else(|_| serde_json::Value::String(v.clone()));
                (k.clone(), value)
            })
            .collect();
        Self {
            load_balancer_name: name.into(),
            load_balancer_type: "OPEN".to_string(),
            parameters,
        }
    }
}
