//! Startup replay
//!
//! The allocator lives in memory only. Before any watcher runs, pools are
//! re-registered from their CRDs and every port recorded in a binding status
//! is marked allocated again, so new allocations never collide with ports
//! handed out by a previous process.

use crds::{CLBBindingStatus, CLBNodeBinding, CLBPodBinding, CLBPortPool, LoadBalancerState};
use kube::Api;
use kube::api::ListParams;
use port_allocator::{PoolState, PortAllocator};
use tracing::{info, warn};

use super::{Reconciler, ports, port_pool};
use crate::error::ControllerError;

/// Counts of one replay run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReplaySummary {
    /// Pools registered
    pub pools: usize,
    /// Port bindings marked allocated
    pub marked: usize,
    /// Port bindings whose pool or load balancer is unknown
    pub skipped: usize,
}

/// Registers one pool from its persisted state.
pub(crate) fn replay_pool(allocator: &PortAllocator, pool: &CLBPortPool, default_region: &str) -> Result<(), ControllerError> {
    let name = pool
        .metadata
        .name
        .as_deref()
        .ok_or(ControllerError::MissingObjectKey(".metadata.name"))?;
    let region = pool.spec.region.as_deref().unwrap_or(default_region);
    let status = pool.status.as_ref();
    let quota = pool
        .spec
        .listener_quota
        .map(usize::from)
        .or_else(|| status.map(|s| usize::from(s.quota)).filter(|q| *q > 0));

    let mut config = port_pool::pool_config(name, &pool.spec, region, quota.unwrap_or(0))?;
    config.listener_quota = quota;
    let registered = allocator.add_pool(config);

    let lb_ids: Vec<String> = status
        .map(|s| {
            s.load_balancer_statuses
                .iter()
                .filter(|lb| lb.state == LoadBalancerState::Running)
                .map(|lb| lb.load_balancer_id.clone())
                .collect()
        })
        .unwrap_or_default();
    registered.ensure_lb_ids(&lb_ids);
    if quota.is_some() && !lb_ids.is_empty() {
        registered.set_state(PoolState::Active);
    }
    Ok(())
}

/// Marks every port binding of one status allocated. Returns (marked, skipped).
pub(crate) fn replay_binding(allocator: &PortAllocator, key: &str, status: &CLBBindingStatus) -> (usize, usize) {
    let mut marked = 0;
    let mut skipped = 0;
    for binding in &status.port_bindings {
        let result = ports::allocation_of(binding)
            .and_then(|(lb, unit)| allocator.mark_allocated(&binding.pool, &lb, &unit));
        match result {
            Ok(true) => marked += 1,
            Ok(false) => {
                warn!(
                    "Skipping {} port {} of {}: load balancer {} not in pool {}",
                    binding.protocol, binding.lb_port, key, binding.lb_id, binding.pool
                );
                skipped += 1;
            }
            Err(e) => {
                warn!("Skipping {} port {} of {}: {}", binding.protocol, binding.lb_port, key, e);
                skipped += 1;
            }
        }
    }
    (marked, skipped)
}

impl Reconciler {
    /// Rebuilds allocator state from the cluster.
    pub async fn replay(&self) -> Result<ReplaySummary, ControllerError> {
        info!("Replaying port allocations from cluster state...");
        let mut summary = ReplaySummary::default();
        let lp = ListParams::default();

        let pools = Api::<CLBPortPool>::all(self.client.clone()).list(&lp).await?;
        for pool in &pools.items {
            match replay_pool(&self.allocator, pool, &self.config.default_region) {
                Ok(()) => summary.pools += 1,
                Err(e) => warn!("Skipping port pool replay: {}", e),
            }
        }

        let pod_bindings = match &self.config.watch_namespace {
            Some(ns) => Api::<CLBPodBinding>::namespaced(self.client.clone(), ns),
            None => Api::<CLBPodBinding>::all(self.client.clone()),
        }
        .list(&lp)
        .await?;
        let node_bindings = Api::<CLBNodeBinding>::all(self.client.clone()).list(&lp).await?;

        let statuses = pod_bindings
            .items
            .iter()
            .filter_map(|b| b.status.as_ref().map(|s| (super::resource_key(b), s)))
            .chain(
                node_bindings
                    .items
                    .iter()
                    .filter_map(|b| b.status.as_ref().map(|s| (super::resource_key(b), s))),
            );
        for (key, status) in statuses {
            let (marked, skipped) = replay_binding(&self.allocator, &key, status);
            summary.marked += marked;
            summary.skipped += skipped;
        }

        info!(
            "Replay finished: {} pools, {} ports marked, {} skipped",
            summary.pools, summary.marked, summary.skipped
        );
        Ok(summary)
    }
}
