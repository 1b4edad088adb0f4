//! Kubernetes resource watchers.
//!
//! This module handles watching Kubernetes resources for changes
//! and triggering reconciliation using kube_runtime::Controller.
//!
//! All watchers go through a generic `watch_resource()` helper that runs the
//! controller loop with the shared error policy: Fibonacci backoff per object,
//! reset on the next successful reconcile.

use crate::error::ControllerError;
use crate::reconciler::binding::Binding;
use crate::reconciler::{Reconciler, resource_key};
use crds::CLBPortPool;
use crds::annotations::{PORT_MAPPING, PORT_MAPPING_RESULT};
use futures::StreamExt;
use futures::future::BoxFuture;
use kube::runtime::reflector::ObjectRef;
use kube::{Api, Resource, ResourceExt};
use kube_runtime::{Controller, controller::{self, Action, Config as ControllerConfig}, watcher};
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Reconcile entry point of one watcher.
type ReconcileFn<K> = fn(Arc<Reconciler>, Arc<K>) -> BoxFuture<'static, Result<Action, ControllerError>>;

/// Runs `controller` until its watch streams end.
///
/// `resource_name` labels logs and the `reconcile_errors_total` metric.
async fn watch_resource<K>(
    controller: Controller<K>,
    reconciler: Arc<Reconciler>,
    reconcile_fn: ReconcileFn<K>,
    resource_name: &'static str,
    concurrency: u16,
) -> Result<(), ControllerError>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    info!("Starting {} watcher ({} workers)", resource_name, concurrency);

    let error_policy = move |obj: Arc<K>, error: &ControllerError, ctx: Arc<Reconciler>| {
        let key = format!("{}/{}", resource_name, resource_key(obj.as_ref()));
        ctx.increment_error(&key);
        let (delay, errors) = ctx.get_backoff_for_resource(&key);
        ctx.metrics.reconcile_errors.with_label_values(&[resource_name]).inc();
        warn!(
            "Reconciliation error for {} (attempt {}), retrying in {:?}: {}",
            key, errors, delay, error
        );
        Action::requeue(delay)
    };

    let reconcile = move |obj: Arc<K>, ctx: Arc<Reconciler>| async move {
        let key = format!("{}/{}", resource_name, resource_key(obj.as_ref()));
        debug!("Reconciling {}", key);
        let action = reconcile_fn(Arc::clone(&ctx), obj).await?;
        ctx.reset_error(&key);
        Ok(action)
    };

    // Debounce folds the status writes of one reconcile into a single follow-up
    let controller_config = ControllerConfig::default()
        .debounce(Duration::from_secs(1))
        .concurrency(concurrency);

    controller
        .with_config(controller_config)
        .run(reconcile, error_policy, reconciler)
        .for_each(|res| async move {
            match res {
                Ok((obj, _)) => debug!("Reconciled {} {}", resource_name, obj.name),
                // Backend events for objects without a binding
                Err(controller::Error::ObjectNotFound(obj)) => debug!("{} {} not found", resource_name, obj.name),
                // Already reported by the error policy
                Err(controller::Error::ReconcilerFailed(..)) => {}
                Err(e) => warn!("Controller error for {}: {}", resource_name, e),
            }
        })
        .await;

    Ok(())
}

fn requests_mapping<K: Resource>(resource: &K) -> bool {
    let annotations = resource.annotations();
    annotations.contains_key(PORT_MAPPING) || annotations.contains_key(PORT_MAPPING_RESULT)
}

/// Watches Kubernetes resources for changes.
pub struct Watcher {
    reconciler: Arc<Reconciler>,
}

impl Watcher {
    /// Creates a new watcher instance.
    pub fn new(reconciler: Arc<Reconciler>) -> Self {
        Self { reconciler }
    }

    /// Watches `CLBPortPool` resources.
    pub async fn watch_port_pools(&self) -> Result<(), ControllerError> {
        let api: Api<CLBPortPool> = Api::all(self.reconciler.client.clone());
        watch_resource(
            Controller::new(api, watcher::Config::default()),
            Arc::clone(&self.reconciler),
            |ctx, pool| Box::pin(async move { ctx.reconcile_port_pool(&pool).await }),
            "CLBPortPool",
            self.reconciler.config.workers.port_pool,
        )
        .await
    }

    /// Watches one binding kind, re-triggered by changes of its backend.
    pub async fn watch_bindings<B: Binding>(&self, concurrency: u16) -> Result<(), ControllerError> {
        let client = self.reconciler.client.clone();
        let ns = self.reconciler.config.watch_namespace.as_deref();
        let controller = Controller::new(B::api(client.clone(), ns), watcher::Config::default()).watches(
            B::backend_api(client, ns),
            watcher::Config::default(),
            |backend: B::Backend| {
                if !requests_mapping(&backend) {
                    return None;
                }
                let name = backend.meta().name.as_deref()?;
                let binding = ObjectRef::<B>::new(name);
                Some(match backend.meta().namespace.as_deref() {
                    Some(ns) => binding.within(ns),
                    None => binding,
                })
            },
        );
        watch_resource(
            controller,
            Arc::clone(&self.reconciler),
            |ctx, binding| Box::pin(async move { ctx.reconcile_binding(binding.as_ref()).await }),
            B::KIND,
            concurrency,
        )
        .await
    }

    /// Watches the backends of one binding kind, re-triggered when a binding
    /// they own changes or goes away.
    pub async fn watch_backends<B: Binding>(&self, concurrency: u16) -> Result<(), ControllerError> {
        let client = self.reconciler.client.clone();
        let ns = self.reconciler.config.watch_namespace.as_deref();
        let controller = Controller::new(B::backend_api(client.clone(), ns), watcher::Config::default())
            .owns(B::api(client, ns), watcher::Config::default());
        watch_resource(
            controller,
            Arc::clone(&self.reconciler),
            |ctx, backend| Box::pin(async move { ctx.reconcile_backend::<B>(backend.as_ref()).await }),
            B::BACKEND_KIND,
            concurrency,
        )
        .await
    }
}
