//! CLBPodBinding and CLBNodeBinding CRDs
//!
//! Desired listener ports for one Pod or Node, and the load balancer
//! ports they were bound to. Both kinds share spec entries and status.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[kube(
    group = "networking.clb.io",
    version = "v1alpha1",
    kind = "CLBPodBinding",
    shortname = "cpb",
    namespaced,
    status = "CLBBindingStatus",
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CLBPodBindingSpec {
    /// Deregister every target and stop reconciling
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub disabled: bool,

    /// Ports to expose
    #[serde(default)]
    pub ports: Vec<PortEntry>,
}

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[kube(
    group = "networking.clb.io",
    version = "v1alpha1",
    kind = "CLBNodeBinding",
    shortname = "cnb",
    status = "CLBBindingStatus",
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CLBNodeBindingSpec {
    /// Deregister every target and stop reconciling
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub disabled: bool,

    /// Ports to expose
    #[serde(default)]
    pub ports: Vec<PortEntry>,
}

/// One backend port to expose through the pools.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct PortEntry {
    /// Backend port
    pub port: u16,

    /// TCP, UDP, TCPUDP, TCP_SSL or QUIC
    pub protocol: String,

    /// Pools to take a load balancer port from, one allocation per pool
    pub pools: Vec<String>,

    /// Use the same load balancer port in every pool
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_same_port_across_pools: Option<bool>,

    /// Secret holding the certificate ID for TCP_SSL and QUIC listeners
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_secret_name: Option<String>,
}

impl PortEntry {
    /// Whether every pool must hand out the same port.
    pub fn same_port(&self) -> bool {
        self.use_same_port_across_pools.unwrap_or(false)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CLBBindingStatus {
    /// Binding state
    #[serde(default)]
    pub state: BindingState,

    /// Human-readable reason for the current state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// When the state last changed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<chrono::DateTime<chrono::Utc>>,

    /// Allocated load balancer ports
    #[serde(default)]
    pub port_bindings: Vec<PortBindingStatus>,
}

/// One allocated listener.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct PortBindingStatus {
    /// Backend port
    pub port: u16,

    /// Listener protocol (never TCPUDP)
    pub protocol: String,

    /// Certificate ID used by the listener
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_id: Option<String>,

    /// Pool the port came from
    pub pool: String,

    /// Load balancer ID
    pub lb_id: String,

    /// Load balancer port
    pub lb_port: u16,

    /// Last port of a segment listener
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lb_end_port: Option<u16>,

    /// Listener ID, empty until created
    #[serde(default)]
    pub listener_id: String,

    /// Load balancer region
    pub region: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
/// Binding state
#[serde(rename_all = "PascalCase")]
pub enum BindingState {
    /// Not reconciled yet
    #[default]
    Pending,
    /// Targets registered on every listener
    Bound,
    /// Backend is terminating
    NoBackend,
    /// Backend missing or has no IP yet
    WaitBackend,
    /// Every load balancer is at quota
    #[serde(rename = "WaitForLB")]
    WaitForLb,
    /// Node kind cannot host targets
    NodeTypeNotSupported,
    /// Mapping switched off
    Disabled,
    /// Unrecoverable error
    Failed,
    /// A named pool does not exist
    PortPoolNotFound,
    /// Every port in range is taken
    NoPortAvailable,
    /// Listeners being removed
    Deleting,
}

impl BindingState {
    /// Wire name of the state.
    pub fn as_str(self) -> &'static str {
        match self {
            BindingState::Pending => "Pending",
            BindingState::Bound => "Bound",
            BindingState::NoBackend => "NoBackend",
            BindingState::WaitBackend => "WaitBackend",
            BindingState::WaitForLb => "WaitForLB",
            BindingState::NodeTypeNotSupported => "NodeTypeNotSupported",
            BindingState::Disabled => "Disabled",
            BindingState::Failed => "Failed",
            BindingState::PortPoolNotFound => "PortPoolNotFound",
            BindingState::NoPortAvailable => "NoPortAvailable",
            BindingState::Deleting => "Deleting",
        }
    }
}

impl fmt::Display for BindingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_wire_names() {
        assert_eq!(serde_json::to_value(BindingState::WaitForLb).unwrap(), "WaitForLB");
        assert_eq!(
            serde_json::from_value::<BindingState>(serde_json::json!("NodeTypeNotSupported")).unwrap(),
            BindingState::NodeTypeNotSupported
        );
        assert_eq!(BindingState::WaitForLb.to_string(), "WaitForLB");
    }

    #[test]
    fn test_port_binding_wire_names() {
        let binding = PortBindingStatus {
            port: 80,
            protocol: "TCP".into(),
            pool: "pool-a".into(),
            lb_id: "lb-1".into(),
            lb_port: 30000,
            lb_end_port: None,
            listener_id: "lbl-1".into(),
            region: "ap-test".into(),
            cert_id: None,
        };
        let value = serde_json::to_value(&binding).unwrap();
        assert_eq!(value["lbId"], "lb-1");
        assert_eq!(value["lbPort"], 30000);
        assert!(value.get("lbEndPort").is_none());
    }

    #[test]
    fn test_spec_entry_defaults() {
        let spec: CLBPodBindingSpec = serde_json::from_value(serde_json::json!({
            "ports": [{"port": 7777, "protocol": "UDP", "pools": ["a", "b"]}]
        }))
        .unwrap();
        assert!(!spec.disabled);
        assert!(!spec.ports[0].same_port());
    }
}
