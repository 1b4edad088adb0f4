//! Reconciliation logic for the CLB port mapping CRDs.
//!
//! - `port_pool`: `CLBPortPool`, keeps the allocator in sync with the pools
//! - `binding`: `CLBPodBinding` and `CLBNodeBinding`, generic over [`binding::Binding`]
//! - `mapping`: Pods and Nodes, turns annotations into bindings
//! - `replay`: rebuilds allocator state from persisted status at startup

pub mod binding;
pub mod finalizer;
pub mod mapping;
pub mod node;
pub mod pod;
pub mod port_pool;
pub mod ports;
pub mod replay;

use crate::backoff::FibonacciBackoff;
use crate::config::Config;
use crate::metrics::Metrics;
use clb_client::ClbClient;
use kube::{Client, Resource};
use port_allocator::PortAllocator;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::warn;

/// Backoff state for a resource
#[derive(Debug, Clone)]
struct BackoffState {
    backoff: FibonacciBackoff,
    error_count: u32,
}

impl BackoffState {
    fn new() -> Self {
        Self {
            backoff: FibonacciBackoff::default(),
            error_count: 0,
        }
    }
}

/// `namespace/name`, or `name` for cluster-scoped objects.
pub fn resource_key<K: Resource>(resource: &K) -> String {
    let name = resource.meta().name.as_deref().unwrap_or_default();
    match resource.meta().namespace.as_deref() {
        Some(ns) => format!("{ns}/{name}"),
        None => name.to_string(),
    }
}

/// Shared state of every reconciler.
pub struct Reconciler {
    pub(crate) client: Client,
    pub(crate) clb: ClbClient,
    pub(crate) allocator: Arc<PortAllocator>,
    pub(crate) config: Config,
    pub(crate) metrics: Arc<Metrics>,
    /// Error tracking per resource (kind/namespace/name -> BackoffState)
    backoff_states: Arc<Mutex<HashMap<String, BackoffState>>>,
}

impl Reconciler {
    /// Creates a new reconciler instance.
    pub fn new(
        client: Client,
        clb: ClbClient,
        allocator: Arc<PortAllocator>,
        config: Config,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            client,
            clb,
            allocator,
            config,
            metrics,
            backoff_states: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Next retry delay and consecutive error count for a resource.
    pub fn get_backoff_for_resource(&self, resource_key: &str) -> (Duration, u32) {
        match self.backoff_states.lock() {
            Ok(mut states) => {
                let state = states
                    .entry(resource_key.to_string())
                    .or_insert_with(BackoffState::new);
                (state.backoff.next_backoff(), state.error_count)
            }
            Err(e) => {
                warn!("Failed to lock backoff_states: {}, using default backoff", e);
                (Duration::from_secs(60), 0)
            }
        }
    }

    /// Increment error count for a resource
    pub fn increment_error(&self, resource_key: &str) {
        if let Ok(mut states) = self.backoff_states.lock() {
            let state = states
                .entry(resource_key.to_string())
                .or_insert_with(BackoffState::new);
            state.error_count += 1;
        }
    }

    /// Forget the error history of a resource (on successful reconciliation)
    pub fn reset_error(&self, resource_key: &str) {
        if let Ok(mut states) = self.backoff_states.lock() {
            states.remove(resource_key);
        }
    }
}
