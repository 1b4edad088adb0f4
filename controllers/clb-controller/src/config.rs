//! Controller configuration from environment variables.

use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use clb_client::BatchConfig;

use crate::error::ControllerError;

const DEFAULT_CLB_API_URL: &str = "http://clb-gateway.kube-system:8080";
const DEFAULT_CONTROLLER_NAMESPACE: &str = "kube-system";
const DEFAULT_METRICS_ADDR: &str = "0.0.0.0:8080";

/// Reconcile concurrency per watched kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Workers {
    /// `CLBPodBinding` reconciles in flight
    pub pod_binding: u16,
    /// `CLBNodeBinding` reconciles in flight
    pub node_binding: u16,
    /// `CLBPortPool` reconciles in flight
    pub port_pool: u16,
    /// Pod annotation reconciles in flight
    pub pod: u16,
    /// Node annotation reconciles in flight
    pub node: u16,
}

impl Default for Workers {
    fn default() -> Self {
        Self {
            pod_binding: 10,
            node_binding: 5,
            port_pool: 2,
            pod: 10,
            node: 5,
        }
    }
}

/// Runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// CLB gateway endpoint
    pub clb_api_url: String,
    /// Bearer token for the CLB gateway
    pub clb_api_token: String,
    /// Region for pools that do not set one
    pub default_region: String,
    /// Restrict Pod and `CLBPodBinding` watches to one namespace
    pub watch_namespace: Option<String>,
    /// Namespace the controller runs in; Node certificate secrets live here
    pub controller_namespace: String,
    /// Reconcile concurrency
    pub workers: Workers,
    /// Bind address of the metrics and probe server
    pub metrics_addr: SocketAddr,
    /// CLB request batching
    pub batch: BatchConfig,
}

impl Config {
    /// Loads configuration from the process environment.
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Loads configuration through `lookup`; empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ControllerError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let required = |key: &str| {
            get(key).ok_or_else(|| ControllerError::InvalidConfig(format!("{key} environment variable is required")))
        };

        let defaults = Workers::default();
        let workers = Workers {
            pod_binding: parse_or(&get, "POD_BINDING_WORKERS", defaults.pod_binding)?,
            node_binding: parse_or(&get, "NODE_BINDING_WORKERS", defaults.node_binding)?,
            port_pool: parse_or(&get, "PORT_POOL_WORKERS", defaults.port_pool)?,
            pod: parse_or(&get, "POD_WORKERS", defaults.pod)?,
            node: parse_or(&get, "NODE_WORKERS", defaults.node)?,
        };
        if [workers.pod_binding, workers.node_binding, workers.port_pool, workers.pod, workers.node].contains(&0) {
            return Err(ControllerError::InvalidConfig("worker counts must be at least 1".to_string()));
        }

        let batch_defaults = BatchConfig::default();
        let batch = BatchConfig {
            max_tasks: parse_or(&get, "CLB_BATCH_MAX_TASKS", batch_defaults.max_tasks)?,
            window: get("CLB_BATCH_WINDOW_MS")
                .map(|v| parse::<u64>("CLB_BATCH_WINDOW_MS", &v).map(Duration::from_millis))
                .transpose()?
                .unwrap_or(batch_defaults.window),
        };
        if batch.max_tasks == 0 {
            return Err(ControllerError::InvalidConfig("CLB_BATCH_MAX_TASKS must be at least 1".to_string()));
        }

        Ok(Self {
            clb_api_url: get("CLB_API_URL").unwrap_or_else(|| DEFAULT_CLB_API_URL.to_string()),
            clb_api_token: required("CLB_API_TOKEN")?,
            default_region: required("CLB_DEFAULT_REGION")?,
            watch_namespace: get("WATCH_NAMESPACE"),
            controller_namespace: get("POD_NAMESPACE").unwrap_or_else(|| DEFAULT_CONTROLLER_NAMESPACE.to_string()),
            workers,
            metrics_addr: parse("METRICS_ADDR", &get("METRICS_ADDR").unwrap_or_else(|| DEFAULT_METRICS_ADDR.to_string()))?,
            batch,
        })
    }
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T, ControllerError>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| ControllerError::InvalidConfig(format!("{key}={value}: {e}")))
}

fn parse_or<T: FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T, ControllerError>
where
    T::Err: std::fmt::Display,
{
    get(key).map_or(Ok(default), |v| parse(key, &v))
}
