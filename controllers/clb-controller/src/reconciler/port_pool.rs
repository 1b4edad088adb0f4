//! CLBPortPool reconciler
//!
//! Resolves region, quota and load balancers of a pool, mirrors them into the
//! allocator and scales the pool out when auto-creation is enabled.

use std::time::Duration;

use chrono::Utc;
use clb_client::LoadBalancer;
use crds::{CLBPortPool, CLBPortPoolSpec, CLBPortPoolStatus, LoadBalancerState, LoadBalancerStatus, PortPoolState};
use kube::api::{Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Api, Resource};
use port_allocator::{LbKey, LbPolicy, PoolConfig, PoolState};
use serde_json::{Value, json};
use tracing::{debug, error, info, warn};

use super::Reconciler;
use super::finalizer::{self, POOL_FINALIZER};
use crate::error::ControllerError;

const SCALING_REQUEUE: Duration = Duration::from_secs(5);
const ACTIVE_RESYNC: Duration = Duration::from_secs(60);

/// Status writes attempted when recording a freshly created load balancer.
const RECORD_ATTEMPTS: usize = 3;

/// Allocator configuration for a pool spec.
pub(crate) fn pool_config(
    name: &str,
    spec: &CLBPortPoolSpec,
    region: &str,
    quota: usize,
) -> Result<PoolConfig, ControllerError> {
    let mut config = PoolConfig::new(name, region, spec.start_port);
    if let Some(end_port) = spec.end_port {
        config.end_port = end_port;
    }
    if config.start_port == 0 || config.start_port > config.end_port {
        return Err(ControllerError::InvalidConfig(format!(
            "port pool {name}: invalid port range {}-{}",
            config.start_port, config.end_port
        )));
    }
    config.segment_length = spec.segment_length.unwrap_or(0);
    config.listener_quota = Some(quota);
    config.policy = match spec.lb_policy.unwrap_or_default() {
        crds::LbPolicy::Uniform => LbPolicy::Uniform,
        crds::LbPolicy::InOrder => LbPolicy::InOrder,
        crds::LbPolicy::Random => LbPolicy::Random,
    };
    Ok(config)
}

/// Load balancer IDs of a pool: configured ones first, then auto-created ones.
pub(crate) fn pool_lb_ids(spec: &CLBPortPoolSpec, status: Option<&CLBPortPoolStatus>) -> Vec<String> {
    let mut ids: Vec<String> = Vec::new();
    let auto_created = status.map(CLBPortPoolStatus::auto_created_ids).unwrap_or_default();
    for id in spec.existing_load_balancer_ids.iter().chain(auto_created.iter()) {
        if !id.is_empty() && !ids.contains(id) {
            ids.push(id.clone());
        }
    }
    ids
}

/// Status entries for `lb_ids` from what the provider reported.
pub(crate) fn lb_statuses(
    lb_ids: &[String],
    described: &[LoadBalancer],
    previous: Option<&CLBPortPoolStatus>,
) -> Vec<LoadBalancerStatus> {
    lb_ids
        .iter()
        .map(|id| {
            let auto_created = previous
                .and_then(|s| s.load_balancer_statuses.iter().find(|lb| lb.load_balancer_id == *id))
                .and_then(|lb| lb.auto_created);
            match described.iter().find(|lb| lb.load_balancer_id == *id) {
                Some(lb) => LoadBalancerStatus {
                    auto_created,
                    state: LoadBalancerState::Running,
                    load_balancer_id: id.clone(),
                    load_balancer_name: lb.load_balancer_name.clone(),
                    ips: lb.vips.clone(),
                    hostname: lb.domain.clone(),
                    allocated: 0,
                },
                None => LoadBalancerStatus {
                    auto_created,
                    state: LoadBalancerState::NotFound,
                    load_balancer_id: id.clone(),
                    ..LoadBalancerStatus::default()
                },
            }
        })
        .collect()
}

/// Whether one more load balancer should be created: auto-creation is on,
/// every running load balancer is full and the auto-created limit allows it.
pub(crate) fn needs_scale_up(spec: &CLBPortPoolSpec, statuses: &[LoadBalancerStatus], quota: usize) -> bool {
    let Some(auto_create) = spec.auto_create.as_ref().filter(|c| c.enabled) else {
        return false;
    };
    let auto_created = statuses.iter().filter(|lb| lb.auto_created.unwrap_or(false)).count();
    if auto_create
        .max_load_balancers
        .is_some_and(|max| auto_created >= usize::from(max))
    {
        return false;
    }
    statuses
        .iter()
        .filter(|lb| lb.state == LoadBalancerState::Running)
        .all(|lb| usize::from(lb.allocated) >= quota)
}

/// Writes `status` and returns the new resource version.
async fn patch_pool_status(
    api: &Api<CLBPortPool>,
    name: &str,
    resource_version: Option<&String>,
    status: &CLBPortPoolStatus,
) -> Result<Option<String>, ControllerError> {
    let mut value = serde_json::to_value(status)?;
    if status.message.is_none() {
        value["message"] = Value::Null;
    }
    let mut patch = json!({ "status": value });
    if let Some(rv) = resource_version {
        patch["metadata"] = json!({ "resourceVersion": rv });
    }
    let updated = api
        .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(updated.metadata.resource_version)
}

/// Adds a just-created load balancer to the stored pool status, re-reading
/// the pool on conflicts. Returns the new resource version.
async fn record_load_balancer(
    api: &Api<CLBPortPool>,
    name: &str,
    lb: &LoadBalancerStatus,
) -> Result<Option<String>, ControllerError> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        let current = api.get(name).await?;
        let mut status = current.status.unwrap_or_default();
        if !status
            .load_balancer_statuses
            .iter()
            .any(|s| s.load_balancer_id == lb.load_balancer_id)
        {
            status.load_balancer_statuses.push(lb.clone());
        }
        match patch_pool_status(api, name, current.metadata.resource_version.as_ref(), &status).await {
            Ok(resource_version) => return Ok(resource_version),
            Err(e) if e.is_conflict() && attempt < RECORD_ATTEMPTS => {
                debug!("Port pool {} changed while recording {}, retrying", name, lb.load_balancer_id);
            }
            Err(e) => return Err(e),
        }
    }
}

impl Reconciler {
    /// Reconciles a CLBPortPool resource.
    pub async fn reconcile_port_pool(&self, pool: &CLBPortPool) -> Result<Action, ControllerError> {
        let name = pool
            .metadata
            .name
            .as_deref()
            .ok_or(ControllerError::MissingObjectKey(".metadata.name"))?;
        let api: Api<CLBPortPool> = Api::all(self.client.clone());

        if finalizer::has_deletion_stamp(pool) {
            return self.cleanup_port_pool(&api, pool, name).await;
        }

        let mut resource_version = pool.metadata.resource_version.clone();
        if !finalizer::has_finalizer(pool, POOL_FINALIZER) {
            let updated = finalizer::add_finalizer(&api, pool, POOL_FINALIZER).await?;
            resource_version = updated.meta().resource_version.clone();
        }

        let spec = &pool.spec;
        let region = spec.region.clone().unwrap_or_else(|| self.config.default_region.clone());
        let quota = match spec.listener_quota {
            Some(quota) => usize::from(quota),
            None => self.clb.get_quota(&region).await?,
        };

        let config = match pool_config(name, spec, &region, quota) {
            Ok(config) => config,
            Err(e) => {
                warn!("{}", e);
                let status = CLBPortPoolStatus {
                    state: PortPoolState::Pending,
                    message: Some(e.to_string()),
                    last_reconciled: Some(Utc::now()),
                    ..pool.status.clone().unwrap_or_default()
                };
                patch_pool_status(&api, name, resource_version.as_ref(), &status).await?;
                return Ok(Action::await_change());
            }
        };

        let lb_ids = pool_lb_ids(spec, pool.status.as_ref());
        let described = self.clb.describe_load_balancers(&region, &lb_ids).await?;
        let mut statuses = lb_statuses(&lb_ids, &described, pool.status.as_ref());
        let running: Vec<String> = statuses
            .iter()
            .filter(|lb| lb.state == LoadBalancerState::Running)
            .map(|lb| lb.load_balancer_id.clone())
            .collect();
        for lb in statuses.iter().filter(|lb| lb.state == LoadBalancerState::NotFound) {
            warn!("Load balancer {} of port pool {} not found in {}", lb.load_balancer_id, name, region);
        }

        let allocator_pool = self.allocator.add_pool(config);
        allocator_pool.ensure_lb_ids(&running);
        allocator_pool.clear_blacklist();
        for lb in &mut statuses {
            let count = allocator_pool.allocated_count(&LbKey::new(lb.load_balancer_id.as_str(), region.as_str()));
            lb.allocated = u16::try_from(count).unwrap_or(u16::MAX);
            self.metrics
                .lb_allocated
                .with_label_values(&[name, lb.load_balancer_id.as_str()])
                .set(i64::try_from(count).unwrap_or(i64::MAX));
        }

        let (state, message, action) = if needs_scale_up(spec, &statuses, quota) {
            let params = spec.auto_create.as_ref().map(|c| c.parameters.clone()).unwrap_or_default();
            let lb_name = format!("{}-{}", name, statuses.len() + 1);
            let lb_id = self.clb.create_load_balancer(&region, &lb_name, &params).await?;
            info!("Port pool {} scaled out with load balancer {} ({})", name, lb_id, lb_name);
            let created = LoadBalancerStatus {
                auto_created: Some(true),
                state: LoadBalancerState::Running,
                load_balancer_id: lb_id.clone(),
                load_balancer_name: lb_name,
                ..LoadBalancerStatus::default()
            };
            resource_version = match record_load_balancer(&api, name, &created).await {
                Ok(resource_version) => resource_version,
                Err(e) => {
                    error!("Load balancer {} of port pool {} created but not recorded: {}", lb_id, name, e);
                    return Err(e);
                }
            };
            statuses.push(created);
            (
                PortPoolState::Scaling,
                Some(format!("created load balancer {lb_id}")),
                Action::requeue(SCALING_REQUEUE),
            )
        } else if running.is_empty() {
            (
                PortPoolState::Active,
                Some("no running load balancer".to_string()),
                Action::requeue(ACTIVE_RESYNC),
            )
        } else {
            (PortPoolState::Active, None, Action::requeue(ACTIVE_RESYNC))
        };

        allocator_pool.set_state(match state {
            PortPoolState::Scaling => PoolState::Scaling,
            _ => PoolState::Active,
        });

        let previous_state = pool.status.as_ref().map(|s| s.state.clone());
        if previous_state.as_ref() != Some(&state) {
            info!("Port pool {} -> {:?} (quota {}, {} load balancers)", name, state, quota, running.len());
        } else {
            debug!("Port pool {} resynced", name);
        }

        let status = CLBPortPoolStatus {
            state,
            message,
            quota: u16::try_from(quota).unwrap_or(u16::MAX),
            load_balancer_statuses: statuses,
            last_reconciled: Some(Utc::now()),
        };
        patch_pool_status(&api, name, resource_version.as_ref(), &status).await?;
        Ok(action)
    }

    /// Deletion: drop the pool from the allocator, delete idle auto-created
    /// load balancers and release the finalizer.
    async fn cleanup_port_pool(
        &self,
        api: &Api<CLBPortPool>,
        pool: &CLBPortPool,
        name: &str,
    ) -> Result<Action, ControllerError> {
        if !finalizer::has_finalizer(pool, POOL_FINALIZER) {
            return Ok(Action::await_change());
        }
        let status = pool.status.clone().unwrap_or_default();
        let mut resource_version = pool.metadata.resource_version.clone();
        if status.state != PortPoolState::Deleting {
            let deleting = CLBPortPoolStatus {
                state: PortPoolState::Deleting,
                ..status.clone()
            };
            resource_version = patch_pool_status(api, name, resource_version.as_ref(), &deleting).await?;
            info!("Port pool {} -> Deleting", name);
        }

        let region = pool
            .spec
            .region
            .clone()
            .unwrap_or_else(|| self.config.default_region.clone());
        let allocator_pool = self.allocator.pool(name);
        if let Some(p) = &allocator_pool {
            p.set_state(PoolState::Deleting);
        }

        for lb in &status.load_balancer_statuses {
            let allocated = allocator_pool.as_ref().map_or(usize::from(lb.allocated), |p| {
                p.allocated_count(&LbKey::new(lb.load_balancer_id.as_str(), region.as_str()))
            });
            if lb.auto_created.unwrap_or(false) {
                if allocated > 0 {
                    warn!(
                        "Keeping auto-created load balancer {} of port pool {}: {} listeners still allocated",
                        lb.load_balancer_id, name, allocated
                    );
                } else {
                    match self.clb.delete_load_balancer(&region, &lb.load_balancer_id).await {
                        Ok(()) => info!("Deleted auto-created load balancer {} of port pool {}", lb.load_balancer_id, name),
                        Err(e) if e.is_lb_not_found() => debug!("Load balancer {} already gone", lb.load_balancer_id),
                        Err(e) => return Err(e.into()),
                    }
                }
            }
            let _ = self
                .metrics
                .lb_allocated
                .remove_label_values(&[name, lb.load_balancer_id.as_str()]);
        }

        self.allocator.remove_pool(name);
        finalizer::remove_finalizer(api, pool, POOL_FINALIZER, resource_version.as_deref()).await?;
        info!("Port pool {} cleaned up", name);
        Ok(Action::await_change())
    }
}
