//! CLB Port Mapping Controller
//!
//! Maps Pod and Node ports onto cloud load balancer listeners:
//! - CLBPortPool: a port range spread over a set of load balancers
//! - CLBPodBinding / CLBNodeBinding: allocated ports, listeners and targets
//!   for one backend
//!
//! Backends opt in with the `networking.clb.io/port-mapping` annotation and
//! read their public addresses back from `networking.clb.io/port-mapping-result`.

mod backoff;
mod config;
mod controller;
mod error;
mod metrics;
mod reconciler;
mod watcher;

#[cfg(test)]
mod test_utils;

use crate::config::Config;
use crate::error::ControllerError;
use controller::Controller;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    // Configure rustls crypto provider before any TLS client is built
    let _ = rustls::crypto::ring::default_provider().install_default();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting CLB port mapping controller");

    let config = Config::from_env()?;
    info!("Configuration:");
    info!("  CLB API: {}", config.clb_api_url);
    info!("  Default region: {}", config.default_region);
    info!("  Namespace: {}", config.watch_namespace.as_deref().unwrap_or("all namespaces"));
    info!("  Metrics: {}", config.metrics_addr);

    let controller = Controller::new(config).await?;
    controller.run().await?;

    Ok(())
}
