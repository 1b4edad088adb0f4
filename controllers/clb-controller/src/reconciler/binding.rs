//! Binding reconciler
//!
//! One generic state machine drives both `CLBPodBinding` and
//! `CLBNodeBinding` through the [`Binding`] trait:
//!
//! 1. `ensure_port_allocated`: diff spec against status, release what is no
//!    longer wanted, allocate what is missing, persist.
//! 2. `ensure_listeners`: make sure every recorded port has a listener.
//! 3. `ensure_backend_bindings`: register the backend on every listener and
//!    publish the result annotation.

use std::collections::HashMap;
use std::fmt::Debug;
use std::marker::PhantomData;
use std::str::FromStr;
use std::time::Duration;

use chrono::Utc;
use clb_client::{ListenerExtra, Target};
use crds::annotations::PORT_MAPPING_RESULT;
use crds::{BindingState, CLBBindingStatus, CLBPortPool, LoadBalancerStatus, PortBindingStatus, PortEntry};
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Api, Client, Resource, ResourceExt};
use port_allocator::{AllocError, PortAllocations, Protocol};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::{debug, error, info, warn};

use super::finalizer::{self, BINDING_FINALIZER};
use super::{Reconciler, ports, resource_key};
use crate::error::ControllerError;

/// Data key of certificate secrets holding the provider certificate ID.
pub const CERT_ID_KEY: &str = "cert-id";

const WAIT_LB_REQUEUE: Duration = Duration::from_secs(3);
const NO_PORT_REQUEUE: Duration = Duration::from_secs(30);
const POOL_NOT_READY_REQUEUE: Duration = Duration::from_secs(10);
const CONFLICT_REQUEUE: Duration = Duration::from_secs(1);
const BOUND_RESYNC: Duration = Duration::from_secs(300);

/// Listener quota rejections tolerated in one reconcile before giving up
/// until the next requeue.
const MAX_LISTENER_PASSES: usize = 4;

/// A binding kind and the backend kind it maps.
pub trait Binding:
    Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Object whose IP is registered behind the listeners.
    type Backend: Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Kind name, for logs and metrics.
    const KIND: &'static str;

    /// Backend kind name, for logs and metrics.
    const BACKEND_KIND: &'static str;

    /// Binding API, scoped to `namespace` where the kind is namespaced.
    fn api(client: Client, namespace: Option<&str>) -> Api<Self>;

    /// Backend API, scoped like [`api`](Binding::api).
    fn backend_api(client: Client, namespace: Option<&str>) -> Api<Self::Backend>;

    /// New binding named after and owned by `backend`.
    fn for_backend(backend: &Self::Backend, ports: Vec<PortEntry>, disabled: bool) -> Self;

    /// `spec.disabled`
    fn disabled(&self) -> bool;

    /// `spec.ports`
    fn ports(&self) -> &[PortEntry];

    /// `status`
    fn binding_status(&self) -> Option<&CLBBindingStatus>;

    /// Address to register as target, once the backend has one.
    fn backend_ip(backend: &Self::Backend) -> Option<String>;

    /// Backend is going away and must not receive traffic.
    fn backend_terminating(backend: &Self::Backend) -> bool;

    /// Whether listeners may point at this backend at all.
    fn backend_supported(_backend: &Self::Backend) -> bool {
        true
    }

    /// Namespace certificate secrets are read from.
    fn cert_namespace(&self, controller_namespace: &str) -> String;
}

/// Writes binding status, tracking the resource version between writes.
struct StatusWriter<'a, B: Binding> {
    api: &'a Api<B>,
    name: &'a str,
    resource_version: Option<String>,
}

impl<B: Binding> StatusWriter<'_, B> {
    async fn write(&mut self, status: &CLBBindingStatus) -> Result<(), ControllerError> {
        let mut value = serde_json::to_value(status)?;
        if status.message.is_none() {
            value["message"] = Value::Null;
        }
        let mut patch = json!({ "status": value });
        if let Some(rv) = &self.resource_version {
            patch["metadata"] = json!({ "resourceVersion": rv });
        }
        let updated = self
            .api
            .patch_status(self.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        self.resource_version = updated.meta().resource_version.clone();
        Ok(())
    }
}

/// Binding state and requeue for an allocation failure.
pub(crate) fn allocation_outcome(err: &AllocError) -> (BindingState, Action) {
    match err {
        AllocError::WaitLbScale(_) => (BindingState::WaitForLb, Action::requeue(WAIT_LB_REQUEUE)),
        AllocError::NoPortAvailable(_) => (BindingState::NoPortAvailable, Action::requeue(NO_PORT_REQUEUE)),
        AllocError::PoolNotFound(_) => (BindingState::PortPoolNotFound, Action::await_change()),
        // Pool known but not synced yet
        AllocError::QuotaNotFound(_) | AllocError::PortPoolNotAllocatable(..) => {
            (BindingState::Pending, Action::requeue(POOL_NOT_READY_REQUEUE))
        }
        _ => (BindingState::Failed, Action::await_change()),
    }
}

/// Outcome of a listener check for one port binding.
enum ListenerOutcome {
    Unchanged,
    Updated,
    QuotaExceeded,
}

impl Reconciler {
    /// Reconciles a `CLBPodBinding` or `CLBNodeBinding`.
    pub async fn reconcile_binding<B: Binding>(&self, binding: &B) -> Result<Action, ControllerError> {
        CLBBindingReconciler::new(self).reconcile(binding).await
    }
}

/// Reconciles one binding kind.
pub struct CLBBindingReconciler<'a, B> {
    ctx: &'a Reconciler,
    kind: PhantomData<B>,
}

impl<'a, B: Binding> CLBBindingReconciler<'a, B> {
    /// Binds the reconciler to the shared context.
    pub fn new(ctx: &'a Reconciler) -> Self {
        Self { ctx, kind: PhantomData }
    }

    /// Runs one reconcile of `binding`.
    pub async fn reconcile(&self, binding: &B) -> Result<Action, ControllerError> {
        let name = binding
            .meta()
            .name
            .as_deref()
            .ok_or(ControllerError::MissingObjectKey(".metadata.name"))?;
        let namespace = binding.meta().namespace.as_deref();
        let api = B::api(self.ctx.client.clone(), namespace);
        let mut writer = StatusWriter {
            api: &api,
            name,
            resource_version: binding.meta().resource_version.clone(),
        };
        let mut status = binding.binding_status().cloned().unwrap_or_default();

        let result = if finalizer::has_deletion_stamp(binding) {
            self.cleanup(binding, &api, &mut writer, &mut status).await
        } else {
            let outcome = self.sync(binding, &api, &mut writer, &mut status).await;
            self.finish(binding, &mut writer, &mut status, outcome).await
        };

        match result {
            Err(e) if e.is_conflict() => {
                debug!("{} {} changed during reconcile, retrying", B::KIND, resource_key(binding));
                Ok(Action::requeue(CONFLICT_REQUEUE))
            }
            other => other,
        }
    }

    async fn sync(
        &self,
        binding: &B,
        api: &Api<B>,
        writer: &mut StatusWriter<'_, B>,
        status: &mut CLBBindingStatus,
    ) -> Result<(BindingState, Action), ControllerError> {
        if !finalizer::has_finalizer(binding, BINDING_FINALIZER) {
            let updated = finalizer::add_finalizer(api, binding, BINDING_FINALIZER).await?;
            writer.resource_version = updated.meta().resource_version.clone();
        }

        if binding.disabled() {
            self.deregister_all(&status.port_bindings).await?;
            return Ok((BindingState::Disabled, Action::await_change()));
        }

        let mut complete = false;
        for _ in 0..MAX_LISTENER_PASSES {
            self.ensure_port_allocated(binding, writer, status).await?;
            if self.ensure_listeners(binding, writer, status).await? {
                complete = true;
                break;
            }
        }
        if !complete {
            return Ok((BindingState::Pending, Action::requeue(WAIT_LB_REQUEUE)));
        }

        self.ensure_backend_bindings(binding, status).await
    }

    /// Records the outcome of [`sync`](Self::sync) and picks the requeue.
    async fn finish(
        &self,
        binding: &B,
        writer: &mut StatusWriter<'_, B>,
        status: &mut CLBBindingStatus,
        outcome: Result<(BindingState, Action), ControllerError>,
    ) -> Result<Action, ControllerError> {
        let key = resource_key(binding);
        match outcome {
            Ok((state, action)) => {
                self.set_state(writer, status, state, None).await?;
                Ok(action)
            }
            Err(e) if e.is_conflict() => Err(e),
            Err(ControllerError::Allocation(e)) => {
                let (state, action) = allocation_outcome(&e);
                warn!("{} {}: {}", B::KIND, key, e);
                self.set_state(writer, status, state, Some(e.to_string())).await?;
                Ok(action)
            }
            Err(e) if e.is_lb_not_found() => {
                warn!("{} {}: {}", B::KIND, key, e);
                self.set_state(writer, status, BindingState::Failed, Some(e.to_string())).await?;
                Ok(Action::await_change())
            }
            Err(e) => {
                error!("{} {} failed: {}", B::KIND, key, e);
                if let Err(write_err) = self.set_state(writer, status, BindingState::Failed, Some(e.to_string())).await {
                    warn!("Failed to record failure of {} {}: {}", B::KIND, key, write_err);
                }
                Err(e)
            }
        }
    }

    async fn set_state(
        &self,
        writer: &mut StatusWriter<'_, B>,
        status: &mut CLBBindingStatus,
        state: BindingState,
        message: Option<String>,
    ) -> Result<(), ControllerError> {
        if status.state == state && status.message == message && status.last_transition_time.is_some() {
            return Ok(());
        }
        if status.state != state || status.last_transition_time.is_none() {
            info!("{} {} -> {}", B::KIND, writer.name, state);
            status.last_transition_time = Some(Utc::now());
            self.ctx
                .metrics
                .binding_states
                .with_label_values(&[B::KIND, state.as_str()])
                .inc();
        }
        status.state = state;
        status.message = message;
        writer.write(status).await
    }

    /// Step 1: make status hold exactly one allocation per spec key.
    ///
    /// Ports of removed entries are freed only once the status no longer
    /// lists them, so a failed write never leaves a persisted entry whose
    /// port another binding may already hold.
    async fn ensure_port_allocated(
        &self,
        binding: &B,
        writer: &mut StatusWriter<'_, B>,
        status: &mut CLBBindingStatus,
    ) -> Result<(), ControllerError> {
        let plan = ports::plan_ports(binding.ports(), &status.port_bindings)?;
        if plan.remove.is_empty() && plan.allocate.is_empty() {
            debug!("{} {} ports up to date", B::KIND, writer.name);
            return Ok(());
        }

        for stale in &plan.remove {
            self.delete_listener(stale).await?;
        }
        let previous = std::mem::replace(&mut status.port_bindings, plan.keep);

        let mut allocated = PortAllocations::new();
        let mut failure = None;
        for entry in &plan.allocate {
            let protocol = Protocol::from_str(&entry.protocol)?;
            match self.ctx.allocator.allocate(&entry.pools, protocol, entry.same_port()) {
                Ok(allocations) => {
                    for allocation in allocations.iter() {
                        info!(
                            "{} {} port {} allocated {} on {} from pool {}",
                            B::KIND,
                            writer.name,
                            entry.port,
                            allocation.port,
                            allocation.lb,
                            allocation.pool_name()
                        );
                        self.ctx
                            .metrics
                            .allocations
                            .with_label_values(&[allocation.pool_name(), "allocated"])
                            .inc();
                        status.port_bindings.push(ports::binding_from_allocation(entry, allocation));
                    }
                    allocated.extend(allocations);
                }
                Err(e) => {
                    let result = if e.is_capacity() { "exhausted" } else { "rejected" };
                    for pool in &entry.pools {
                        self.ctx.metrics.allocations.with_label_values(&[pool.as_str(), result]).inc();
                    }
                    failure = Some(e);
                    break;
                }
            }
        }

        if let Err(e) = writer.write(status).await {
            warn!(
                "Releasing {} new port(s) of {} {}: status update failed: {}",
                allocated.len(),
                B::KIND,
                writer.name,
                e
            );
            allocated.release();
            status.port_bindings = previous;
            return Err(e);
        }
        for stale in &plan.remove {
            self.release_port(stale);
        }
        match failure {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    /// Deletes the listener of a port binding. The port stays allocated.
    ///
    /// Without a recorded listener ID the listener is looked up by port, in
    /// case it was created but the ID never persisted.
    async fn delete_listener(&self, binding: &PortBindingStatus) -> Result<(), ControllerError> {
        let clb = &self.ctx.clb;
        let deleted = if binding.listener_id.is_empty() {
            clb.delete_listener_by_port(&binding.region, &binding.lb_id, binding.lb_port, &binding.protocol)
                .await
        } else {
            clb.delete_listener(&binding.region, &binding.lb_id, &binding.listener_id)
                .await
        };
        match deleted {
            Ok(()) => info!(
                "Deleted listener {} ({} {}) on {}",
                binding.listener_id, binding.protocol, binding.lb_port, binding.lb_id
            ),
            Err(e) if e.is_lb_not_found() => {
                warn!("Load balancer {} gone, listener on port {} dropped", binding.lb_id, binding.lb_port);
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    /// Frees the port of a port binding the status no longer records.
    fn release_port(&self, binding: &PortBindingStatus) {
        match ports::allocation_of(binding) {
            Ok((lb, unit)) => {
                self.ctx.allocator.release(&binding.pool, &lb, &unit);
                self.ctx
                    .metrics
                    .allocations
                    .with_label_values(&[binding.pool.as_str(), "released"])
                    .inc();
            }
            Err(e) => warn!("Cannot release {}/{}: {}", binding.pool, binding.lb_port, e),
        }
    }

    /// Step 2: every port binding gets a listener. Returns `false` if some
    /// entries were dropped because their load balancer is out of listeners.
    async fn ensure_listeners(
        &self,
        binding: &B,
        writer: &mut StatusWriter<'_, B>,
        status: &mut CLBBindingStatus,
    ) -> Result<bool, ControllerError> {
        let mut changed = false;
        let mut dropped = Vec::new();
        for idx in 0..status.port_bindings.len() {
            match self.ensure_listener(binding, writer.name, &mut status.port_bindings[idx]).await {
                Ok(ListenerOutcome::Unchanged) => {}
                Ok(ListenerOutcome::Updated) => changed = true,
                Ok(ListenerOutcome::QuotaExceeded) => dropped.push(idx),
                Err(e) => {
                    if changed {
                        // Keep listener IDs created so far
                        if let Err(write_err) = writer.write(status).await {
                            warn!("Failed to record listeners of {} {}: {}", B::KIND, writer.name, write_err);
                            if write_err.is_conflict() {
                                return Err(write_err);
                            }
                        }
                    }
                    return Err(e);
                }
            }
        }

        if !changed && dropped.is_empty() {
            return Ok(true);
        }
        let removed: Vec<PortBindingStatus> = dropped.iter().map(|idx| status.port_bindings[*idx].clone()).collect();
        let previous = status.port_bindings.clone();
        for idx in dropped.iter().rev() {
            status.port_bindings.remove(*idx);
        }
        if let Err(e) = writer.write(status).await {
            status.port_bindings = previous;
            return Err(e);
        }

        for entry in &removed {
            if let Ok((lb, unit)) = ports::allocation_of(entry) {
                if let Some(pool) = self.ctx.allocator.pool(&entry.pool) {
                    pool.blacklist_lb(&lb);
                    pool.release_port(&lb, &unit);
                }
            }
        }
        Ok(removed.is_empty())
    }

    async fn ensure_listener(
        &self,
        binding: &B,
        name: &str,
        entry: &mut PortBindingStatus,
    ) -> Result<ListenerOutcome, ControllerError> {
        let cert_id = self.certificate_for(binding, entry).await?;
        let mut outcome = ListenerOutcome::Unchanged;
        if entry.cert_id != cert_id {
            entry.cert_id.clone_from(&cert_id);
            outcome = ListenerOutcome::Updated;
        }

        let clb = &self.ctx.clb;
        if let Some(listener) = clb
            .get_listener_by_port(&entry.region, &entry.lb_id, entry.lb_port, &entry.protocol)
            .await?
        {
            if listener.listener_id != entry.listener_id {
                info!(
                    "Adopting listener {} for {} port {} on {}",
                    listener.listener_id, name, entry.lb_port, entry.lb_id
                );
                entry.listener_id = listener.listener_id;
                outcome = ListenerOutcome::Updated;
            }
            return Ok(outcome);
        }

        let extra = ListenerExtra {
            name: Some(format!("{}-{}-{}", name, entry.port, entry.protocol.to_ascii_lowercase())),
            certificate_id: cert_id,
        };
        match clb
            .allocate_create_listener(
                &entry.region,
                &entry.lb_id,
                entry.lb_port,
                entry.lb_end_port,
                &entry.protocol,
                &extra,
            )
            .await
        {
            Ok(listener_id) => {
                info!(
                    "Created listener {} ({} {}) on {} for {}",
                    listener_id, entry.protocol, entry.lb_port, entry.lb_id, name
                );
                entry.listener_id = listener_id;
                Ok(ListenerOutcome::Updated)
            }
            Err(e) if e.is_quota_exceeded() => {
                warn!(
                    "Load balancer {} of pool {} is out of listeners, excluding it: {}",
                    entry.lb_id, entry.pool, e
                );
                Ok(ListenerOutcome::QuotaExceeded)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Certificate ID for TLS and QUIC listeners, read from the entry's secret.
    async fn certificate_for(&self, binding: &B, entry: &PortBindingStatus) -> Result<Option<String>, ControllerError> {
        let protocol = Protocol::from_str(&entry.protocol)?;
        if !protocol.needs_certificate() {
            return Ok(None);
        }
        let secret_name = ports::entry_for(binding.ports(), entry)
            .and_then(|e| e.cert_secret_name.clone())
            .ok_or_else(|| {
                ControllerError::InvalidConfig(format!("port {} ({}) needs certSecretName", entry.port, entry.protocol))
            })?;
        let namespace = binding.cert_namespace(&self.ctx.config.controller_namespace);
        let secret = Api::<Secret>::namespaced(self.ctx.client.clone(), &namespace)
            .get(&secret_name)
            .await?;
        secret
            .data
            .as_ref()
            .and_then(|d| d.get(CERT_ID_KEY))
            .map(|v| String::from_utf8_lossy(&v.0).trim().to_string())
            .filter(|id| !id.is_empty())
            .map(Some)
            .ok_or_else(|| ControllerError::InvalidConfig(format!("secret {namespace}/{secret_name} has no {CERT_ID_KEY}")))
    }

    /// Step 3: point every listener at the backend.
    async fn ensure_backend_bindings(
        &self,
        binding: &B,
        status: &CLBBindingStatus,
    ) -> Result<(BindingState, Action), ControllerError> {
        let meta = binding.meta();
        let name = meta.name.as_deref().unwrap_or_default();
        let backend_api = B::backend_api(self.ctx.client.clone(), meta.namespace.as_deref());

        let Some(backend) = backend_api.get_opt(name).await? else {
            self.deregister_all(&status.port_bindings).await?;
            return Ok((BindingState::WaitBackend, Action::await_change()));
        };
        if B::backend_terminating(&backend) {
            self.deregister_all(&status.port_bindings).await?;
            return Ok((BindingState::NoBackend, Action::await_change()));
        }
        if !B::backend_supported(&backend) {
            self.deregister_all(&status.port_bindings).await?;
            return Ok((BindingState::NodeTypeNotSupported, Action::await_change()));
        }
        let Some(ip) = B::backend_ip(&backend) else {
            self.deregister_all(&status.port_bindings).await?;
            return Ok((BindingState::WaitBackend, Action::await_change()));
        };

        for entry in &status.port_bindings {
            self.bind_target(entry, &Target::new(ip.as_str(), entry.port)).await?;
        }
        self.publish_result(&backend_api, &backend, name, &status.port_bindings)
            .await?;
        Ok((BindingState::Bound, Action::requeue(BOUND_RESYNC)))
    }

    /// Registers `target` on one listener and removes every other target.
    async fn bind_target(&self, entry: &PortBindingStatus, target: &Target) -> Result<(), ControllerError> {
        let clb = &self.ctx.clb;
        let current = clb
            .describe_targets(&entry.region, &entry.lb_id, &entry.listener_id)
            .await?;
        let stale: Vec<Target> = current.iter().filter(|t| *t != target).cloned().collect();
        if !stale.is_empty() {
            info!("Deregistering {} stale target(s) from listener {}", stale.len(), entry.listener_id);
            clb.deregister_targets(&entry.region, &entry.lb_id, &entry.listener_id, &stale)
                .await?;
        }
        if !current.contains(target) {
            info!("Registering {} on listener {} ({})", target, entry.listener_id, entry.lb_id);
            clb.register_targets(&entry.region, &entry.lb_id, &entry.listener_id, std::slice::from_ref(target))
                .await?;
        }
        Ok(())
    }

    /// Removes every target from every recorded listener.
    async fn deregister_all(&self, bindings: &[PortBindingStatus]) -> Result<(), ControllerError> {
        let clb = &self.ctx.clb;
        for entry in bindings.iter().filter(|b| !b.listener_id.is_empty()) {
            let targets = match clb.describe_targets(&entry.region, &entry.lb_id, &entry.listener_id).await {
                Ok(targets) => targets,
                Err(e) if e.is_lb_not_found() => {
                    warn!("Load balancer {} gone, nothing to deregister", entry.lb_id);
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            if targets.is_empty() {
                continue;
            }
            info!("Deregistering {} target(s) from listener {}", targets.len(), entry.listener_id);
            clb.deregister_targets(&entry.region, &entry.lb_id, &entry.listener_id, &targets)
                .await?;
        }
        Ok(())
    }

    /// Writes the result annotation onto the backend when it changed.
    async fn publish_result(
        &self,
        backend_api: &Api<B::Backend>,
        backend: &B::Backend,
        name: &str,
        bindings: &[PortBindingStatus],
    ) -> Result<(), ControllerError> {
        let pools_api: Api<CLBPortPool> = Api::all(self.ctx.client.clone());
        let mut lbs: HashMap<String, Vec<LoadBalancerStatus>> = HashMap::new();
        let mut results = Vec::with_capacity(bindings.len());
        for entry in bindings {
            if !lbs.contains_key(&entry.pool) {
                let statuses = pools_api
                    .get_opt(&entry.pool)
                    .await?
                    .and_then(|p| p.status)
                    .map(|s| s.load_balancer_statuses)
                    .unwrap_or_default();
                lbs.insert(entry.pool.clone(), statuses);
            }
            let lb = lbs
                .get(&entry.pool)
                .and_then(|statuses| statuses.iter().find(|s| s.load_balancer_id == entry.lb_id));
            results.push(ports::mapping_result(entry, lb));
        }

        let value = serde_json::to_string(&results)?;
        if backend.annotations().get(PORT_MAPPING_RESULT) == Some(&value) {
            return Ok(());
        }
        let patch = json!({ "metadata": { "annotations": { PORT_MAPPING_RESULT: value } } });
        backend_api
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        info!("Published port mapping result on {} backend {}", B::KIND, name);
        Ok(())
    }

    /// Deletion: drop every listener, free every port, release the finalizer.
    async fn cleanup(
        &self,
        binding: &B,
        api: &Api<B>,
        writer: &mut StatusWriter<'_, B>,
        status: &mut CLBBindingStatus,
    ) -> Result<Action, ControllerError> {
        if !finalizer::has_finalizer(binding, BINDING_FINALIZER) {
            return Ok(Action::await_change());
        }
        self.set_state(writer, status, BindingState::Deleting, None).await?;

        let mut deleted = 0;
        let mut failure = None;
        for entry in &status.port_bindings {
            match self.delete_listener(entry).await {
                Ok(()) => deleted += 1,
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        if deleted > 0 {
            let released: Vec<PortBindingStatus> = status.port_bindings.drain(..deleted).collect();
            writer.write(status).await?;
            for entry in &released {
                self.release_port(entry);
            }
        }
        if let Some(e) = failure {
            error!("Cleanup of {} {} failed: {}", B::KIND, writer.name, e);
            return Err(e);
        }

        finalizer::remove_finalizer(api, binding, BINDING_FINALIZER, writer.resource_version.as_deref()).await?;
        info!("{} {} cleaned up", B::KIND, resource_key(binding));
        Ok(Action::await_change())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconciler::replay::replay_pool;
    use crate::test_utils::{
        FakeApiServer, create_test_pod, create_test_pod_binding, create_test_port_pool, pool_status,
        test_reconciler_with,
    };
    use clb_client::MockClbApi;
    use crds::CLBPodBinding;
    use k8s_openapi::api::core::v1::Pod;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use port_allocator::{LbKey, PoolState, PortPool, ProtocolPort};
    use std::sync::Arc;

    const LB: &str = "lb-1";

    struct Fixture {
        server: FakeApiServer,
        reconciler: Reconciler,
        mock: Arc<MockClbApi>,
        pool: Arc<PortPool>,
    }

    /// Pool `game` on one load balancer, API server without objects.
    fn fixture() -> Fixture {
        let server = FakeApiServer::new();
        let (reconciler, mock) = test_reconciler_with(server.client());
        mock.add_load_balancer(LB, &["1.2.3.4"]);
        let mut pool = create_test_port_pool("game", 30000, &[LB]);
        pool.status = Some(pool_status(50, &[LB]));
        replay_pool(&reconciler.allocator, &pool, "ap-test").unwrap();
        let pool = reconciler.allocator.pool("game").unwrap();
        Fixture {
            server,
            reconciler,
            mock,
            pool,
        }
    }

    fn lb() -> LbKey {
        LbKey::new(LB, "ap-test")
    }

    fn tcp(port: u16) -> ProtocolPort {
        ProtocolPort::new(port, Protocol::Tcp)
    }

    fn tcp_80() -> PortEntry {
        PortEntry {
            port: 80,
            protocol: "TCP".to_string(),
            pools: vec!["game".to_string()],
            ..Default::default()
        }
    }

    fn recorded(lb_port: u16, listener_id: &str) -> PortBindingStatus {
        PortBindingStatus {
            port: 80,
            protocol: "TCP".to_string(),
            pool: "game".to_string(),
            lb_id: LB.to_string(),
            lb_port,
            listener_id: listener_id.to_string(),
            region: "ap-test".to_string(),
            ..Default::default()
        }
    }

    fn pod_binding(ports: Vec<PortEntry>, recorded: Vec<PortBindingStatus>) -> CLBPodBinding {
        let mut binding = create_test_pod_binding("game-0", "games", ports);
        binding.metadata.finalizers = Some(vec![BINDING_FINALIZER.to_string()]);
        binding.status = Some(CLBBindingStatus {
            port_bindings: recorded,
            ..Default::default()
        });
        binding
    }

    impl Fixture {
        /// Listener created on the provider and its port held by the allocator.
        async fn listener(&self, lb_port: u16) -> String {
            self.pool.mark_allocated(&lb(), &tcp(lb_port));
            self.reconciler
                .clb
                .allocate_create_listener("ap-test", LB, lb_port, None, "TCP", &ListenerExtra::default())
                .await
                .unwrap()
        }

        fn stored(&self) -> Option<CLBPodBinding> {
            self.server.get("game-0", Some("games"))
        }

        fn status(&self) -> CLBBindingStatus {
            self.stored().unwrap().status.unwrap()
        }

        fn take_port(&self) {
            self.reconciler
                .allocator
                .allocate(&["game".to_string()], Protocol::Tcp, false)
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_removed_port_stays_held_while_status_write_fails() {
        let f = fixture();
        let id = f.listener(30000).await;
        let binding = f.server.insert(&pod_binding(vec![], vec![recorded(30000, &id)]));
        f.server.reject_status_patches(usize::MAX);

        let action = f.reconciler.reconcile_binding(&binding).await.unwrap();
        assert_eq!(action, Action::requeue(CONFLICT_REQUEUE));
        assert!(f.mock.listeners(LB).is_empty());
        assert_eq!(f.pool.allocated_ports(&lb()), vec![tcp(30000)]);

        // Someone else allocates meanwhile; a retry must not free their port
        f.take_port();
        f.reconciler.reconcile_binding(&binding).await.unwrap();
        assert_eq!(f.pool.allocated_count(&lb()), 2);

        f.server.reject_status_patches(0);
        let binding = f.stored().unwrap();
        let action = f.reconciler.reconcile_binding(&binding).await.unwrap();
        assert_eq!(action, Action::await_change());
        assert_eq!(f.pool.allocated_ports(&lb()), vec![tcp(30001)]);
        assert!(f.status().port_bindings.is_empty());
    }

    #[tokio::test]
    async fn test_new_allocation_rolled_back_when_status_write_fails() {
        let f = fixture();
        let binding = f.server.insert(&pod_binding(vec![tcp_80()], vec![]));
        f.server.reject_status_patches(1);

        let action = f.reconciler.reconcile_binding(&binding).await.unwrap();
        assert_eq!(action, Action::requeue(CONFLICT_REQUEUE));
        assert_eq!(f.pool.allocated_count(&lb()), 0);
        assert!(f.mock.listeners(LB).is_empty());
    }

    #[tokio::test]
    async fn test_existing_listener_is_adopted() {
        let f = fixture();
        let id = f.listener(30000).await;
        let binding = f.server.insert(&pod_binding(vec![tcp_80()], vec![recorded(30000, "")]));

        f.reconciler.reconcile_binding(&binding).await.unwrap();

        let status = f.status();
        assert_eq!(status.port_bindings[0].listener_id, id);
        assert_eq!(status.state, BindingState::WaitBackend);
        assert_eq!(f.mock.listeners(LB).len(), 1);
        assert_eq!(f.mock.calls_of("CreateListener").len(), 1);
    }

    #[tokio::test]
    async fn test_listener_quota_excludes_load_balancer() {
        let f = fixture();
        f.mock.set_listener_quota(0);
        let binding = f.server.insert(&pod_binding(vec![tcp_80()], vec![]));

        let action = f.reconciler.reconcile_binding(&binding).await.unwrap();
        assert_eq!(action, Action::requeue(WAIT_LB_REQUEUE));
        assert!(f.pool.is_blacklisted(&lb()));
        assert_eq!(f.pool.allocated_count(&lb()), 0);

        let status = f.status();
        assert_eq!(status.state, BindingState::WaitForLb);
        assert!(status.port_bindings.is_empty());
    }

    #[tokio::test]
    async fn test_conflict_recording_listeners_is_retried() {
        let f = fixture();
        f.pool.mark_allocated(&lb(), &tcp(30000));
        let gone = PortBindingStatus {
            port: 81,
            lb_id: "lb-gone".to_string(),
            lb_port: 30001,
            ..recorded(30001, "")
        };
        let ports = vec![tcp_80(), PortEntry { port: 81, ..tcp_80() }];
        let binding = f.server.insert(&pod_binding(ports, vec![recorded(30000, ""), gone]));
        f.server.reject_status_patches(1);

        let action = f.reconciler.reconcile_binding(&binding).await.unwrap();
        assert_eq!(action, Action::requeue(CONFLICT_REQUEUE));
        assert_eq!(f.mock.listeners(LB).len(), 1);
        assert_eq!(f.status().state, BindingState::default());
    }

    #[tokio::test]
    async fn test_backend_targets_follow_pod() {
        let f = fixture();
        let id = f.listener(30000).await;
        let binding = f.server.insert(&pod_binding(vec![tcp_80()], vec![recorded(30000, &id)]));
        let pod = f.server.insert(&create_test_pod("game-0", "games", Some("10.0.0.8")));

        let action = f.reconciler.reconcile_binding(&binding).await.unwrap();
        assert_eq!(action, Action::requeue(BOUND_RESYNC));
        assert_eq!(f.status().state, BindingState::Bound);
        assert_eq!(f.mock.targets(&id), vec![Target::new("10.0.0.8", 80)]);
        let published: Pod = f.server.get("game-0", Some("games")).unwrap();
        assert!(published.annotations().contains_key(PORT_MAPPING_RESULT));

        let mut finished = pod;
        if let Some(status) = finished.status.as_mut() {
            status.phase = Some("Failed".to_string());
        }
        f.server.insert(&finished);
        let action = f.reconciler.reconcile_binding(&f.stored().unwrap()).await.unwrap();
        assert_eq!(action, Action::await_change());
        assert_eq!(f.status().state, BindingState::NoBackend);
        assert!(f.mock.targets(&id).is_empty());
    }

    #[tokio::test]
    async fn test_missing_backend_deregisters_targets() {
        let f = fixture();
        let id = f.listener(30000).await;
        f.reconciler
            .clb
            .register_targets("ap-test", LB, &id, &[Target::new("10.0.0.7", 80)])
            .await
            .unwrap();
        let binding = f.server.insert(&pod_binding(vec![tcp_80()], vec![recorded(30000, &id)]));

        let action = f.reconciler.reconcile_binding(&binding).await.unwrap();
        assert_eq!(action, Action::await_change());
        assert_eq!(f.status().state, BindingState::WaitBackend);
        assert!(f.mock.targets(&id).is_empty());
    }

    fn deleted(binding: CLBPodBinding) -> CLBPodBinding {
        let mut binding = binding;
        binding.metadata.deletion_timestamp = Some(Time(Utc::now()));
        binding
    }

    #[tokio::test]
    async fn test_cleanup_releases_ports_and_finalizer() {
        let f = fixture();
        let id = f.listener(30000).await;
        let binding = f
            .server
            .insert(&deleted(pod_binding(vec![tcp_80()], vec![recorded(30000, &id)])));

        let action = f.reconciler.reconcile_binding(&binding).await.unwrap();
        assert_eq!(action, Action::await_change());
        assert_eq!(f.pool.allocated_count(&lb()), 0);
        assert!(f.mock.listeners(LB).is_empty());
        assert!(f.stored().is_none());
        assert_eq!(f.server.conflicts(), 0);
    }

    #[tokio::test]
    async fn test_cleanup_retry_keeps_reallocated_port() {
        let f = fixture();
        let id = f.listener(30000).await;
        let binding = f
            .server
            .insert(&deleted(pod_binding(vec![tcp_80()], vec![recorded(30000, &id)])));
        f.server.reject_patches(1);

        let action = f.reconciler.reconcile_binding(&binding).await.unwrap();
        assert_eq!(action, Action::requeue(CONFLICT_REQUEUE));
        assert_eq!(f.pool.allocated_count(&lb()), 0);
        let binding = f.stored().unwrap();
        assert_eq!(binding.status.as_ref().map(|s| s.state), Some(BindingState::Deleting));
        assert!(binding.status.as_ref().is_some_and(|s| s.port_bindings.is_empty()));

        f.take_port();
        let action = f.reconciler.reconcile_binding(&binding).await.unwrap();
        assert_eq!(action, Action::await_change());
        assert_eq!(f.pool.allocated_ports(&lb()), vec![tcp(30000)]);
        assert!(f.stored().is_none());
    }

    #[test]
    fn test_capacity_errors_wait() {
        let (state, action) = allocation_outcome(&AllocError::WaitLbScale(vec!["pool-a".to_string()]));
        assert_eq!(state, BindingState::WaitForLb);
        assert_eq!(action, Action::requeue(Duration::from_secs(3)));

        let (state, action) = allocation_outcome(&AllocError::NoPortAvailable(vec!["pool-a".to_string()]));
        assert_eq!(state, BindingState::NoPortAvailable);
        assert_eq!(action, Action::requeue(Duration::from_secs(30)));
    }

    #[test]
    fn test_missing_pool_waits_for_change() {
        let (state, action) = allocation_outcome(&AllocError::PoolNotFound("pool-a".to_string()));
        assert_eq!(state, BindingState::PortPoolNotFound);
        assert_eq!(action, Action::await_change());
    }

    #[test]
    fn test_unsynced_pool_stays_pending() {
        let (state, action) =
            allocation_outcome(&AllocError::PortPoolNotAllocatable("pool-a".to_string(), PoolState::Pending));
        assert_eq!(state, BindingState::Pending);
        assert_eq!(action, Action::requeue(POOL_NOT_READY_REQUEUE));
    }

    #[test]
    fn test_configuration_errors_fail() {
        let (state, action) = allocation_outcome(&AllocError::EmptyPools);
        assert_eq!(state, BindingState::Failed);
        assert_eq!(action, Action::await_change());
    }
}
