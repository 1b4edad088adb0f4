//! Main controller implementation.
//!
//! This module contains the `Controller` struct that wires the clients,
//! replays allocator state and runs every watcher plus the metrics server.
//!
//! Five controllers share one `Reconciler`:
//! - CLBPortPool: keeps the allocator's pools and load balancers current
//! - CLBPodBinding / CLBNodeBinding: allocate ports and manage listeners
//! - Pod / Node: turn port mapping annotations into bindings

use crate::config::Config;
use crate::error::ControllerError;
use crate::metrics::{self, Metrics};
use crate::reconciler::Reconciler;
use crate::watcher::Watcher;
use clb_client::{ClbClient, ClbClientConfig, HttpClbApi};
use crds::{CLBNodeBinding, CLBPodBinding};
use kube::Client;
use port_allocator::PortAllocator;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Main controller for CLB port mapping.
pub struct Controller {
    shutdown: CancellationToken,
    port_pool_watcher: JoinHandle<Result<(), ControllerError>>,
    pod_binding_watcher: JoinHandle<Result<(), ControllerError>>,
    node_binding_watcher: JoinHandle<Result<(), ControllerError>>,
    pod_watcher: JoinHandle<Result<(), ControllerError>>,
    node_watcher: JoinHandle<Result<(), ControllerError>>,
    metrics_server: JoinHandle<Result<(), ControllerError>>,
}

impl Controller {
    /// Creates a new controller instance.
    ///
    /// Watchers start only after the allocator has been replayed from the
    /// cluster; a failed replay aborts startup.
    pub async fn new(config: Config) -> Result<Self, ControllerError> {
        info!("Initializing CLB port mapping controller");
        let shutdown = CancellationToken::new();

        let kube_client = Client::try_default().await?;

        let api = HttpClbApi::new(config.clb_api_url.clone(), config.clb_api_token.clone())?;
        let clb_config = ClbClientConfig {
            batch: config.batch,
            ..ClbClientConfig::default()
        };
        let clb = ClbClient::new(Arc::new(api), clb_config, shutdown.child_token());

        let metrics = Arc::new(Metrics::new()?);
        let metrics_server = tokio::spawn(metrics::serve(config.metrics_addr, Arc::clone(&metrics), shutdown.child_token()));

        let workers = config.workers;
        let reconciler = Arc::new(Reconciler::new(
            kube_client,
            clb,
            Arc::new(PortAllocator::new()),
            config,
            Arc::clone(&metrics),
        ));

        reconciler.replay().await?;
        metrics.set_ready();

        let watcher_instance = Arc::new(Watcher::new(Arc::clone(&reconciler)));

        let port_pool_watcher = {
            let watcher = Arc::clone(&watcher_instance);
            tokio::spawn(async move { watcher.watch_port_pools().await })
        };
        let pod_binding_watcher = {
            let watcher = Arc::clone(&watcher_instance);
            tokio::spawn(async move { watcher.watch_bindings::<CLBPodBinding>(workers.pod_binding).await })
        };
        let node_binding_watcher = {
            let watcher = Arc::clone(&watcher_instance);
            tokio::spawn(async move { watcher.watch_bindings::<CLBNodeBinding>(workers.node_binding).await })
        };
        let pod_watcher = {
            let watcher = Arc::clone(&watcher_instance);
            tokio::spawn(async move { watcher.watch_backends::<CLBPodBinding>(workers.pod).await })
        };
        let node_watcher = {
            let watcher = Arc::clone(&watcher_instance);
            tokio::spawn(async move { watcher.watch_backends::<CLBNodeBinding>(workers.node).await })
        };

        Ok(Self {
            shutdown,
            port_pool_watcher,
            pod_binding_watcher,
            node_binding_watcher,
            pod_watcher,
            node_watcher,
            metrics_server,
        })
    }

    /// Runs until a watcher exits or the process receives Ctrl-C.
    pub async fn run(mut self) -> Result<(), ControllerError> {
        info!("CLB port mapping controller running");

        let result = tokio::select! {
            result = &mut self.port_pool_watcher => flatten("CLBPortPool watcher", result),
            result = &mut self.pod_binding_watcher => flatten("CLBPodBinding watcher", result),
            result = &mut self.node_binding_watcher => flatten("CLBNodeBinding watcher", result),
            result = &mut self.pod_watcher => flatten("Pod watcher", result),
            result = &mut self.node_watcher => flatten("Node watcher", result),
            result = &mut self.metrics_server => flatten("metrics server", result),
            signal = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                signal.map_err(|e| ControllerError::Watch(format!("signal handler: {e}")))
            }
        };

        self.shutdown.cancel();
        if let Err(e) = &result {
            error!("Controller stopped: {}", e);
        }
        result
    }
}

fn flatten(
    name: &str,
    result: Result<Result<(), ControllerError>, tokio::task::JoinError>,
) -> Result<(), ControllerError> {
    match result {
        Ok(Ok(())) => Err(ControllerError::Watch(format!("{name} exited"))),
        Ok(Err(e)) => Err(ControllerError::Watch(format!("{name} error: {e}"))),
        Err(e) => Err(ControllerError::Watch(format!("{name} panicked: {e}"))),
    }
}
