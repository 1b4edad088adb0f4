//! Test utilities for unit testing reconcilers
//!
//! This module provides helpers for creating test data and setting up test scenarios.

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use clb_client::{BatchConfig, ClbApi, ClbClient, ClbClientConfig, MockClbApi};
use crds::*;
use http::{Method, Request, Response, StatusCode};
use k8s_openapi::api::core::v1::{Node, NodeAddress, NodeStatus, Pod, PodStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::client::Body;
use kube::{Client, Resource};
use port_allocator::PortAllocator;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::metrics::Metrics;
use crate::reconciler::Reconciler;

/// Helper to create test CLBPodBinding CRD
pub fn create_test_pod_binding(name: &str, namespace: &str, ports: Vec<PortEntry>) -> CLBPodBinding {
    CLBPodBinding {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: CLBPodBindingSpec { disabled: false, ports },
        status: None,
    }
}

/// Helper to create a running Pod, with an IP once scheduled
pub fn create_test_pod(name: &str, namespace: &str, ip: Option<&str>) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            uid: Some(format!("uid-{namespace}-{name}")),
            ..Default::default()
        },
        spec: None,
        status: Some(PodStatus {
            phase: Some(if ip.is_some() { "Running" } else { "Pending" }.to_string()),
            pod_ip: ip.map(ToString::to_string),
            ..Default::default()
        }),
    }
}

/// Helper to create a Node; `virtual_kubelet` sets `type=virtual-kubelet`
pub fn create_test_node(name: &str, internal_ip: Option<&str>, virtual_kubelet: bool) -> Node {
    let labels = virtual_kubelet.then(|| BTreeMap::from([("type".to_string(), "virtual-kubelet".to_string())]));
    Node {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            uid: Some(format!("uid-{name}")),
            labels,
            ..Default::default()
        },
        spec: None,
        status: Some(NodeStatus {
            addresses: internal_ip.map(|ip| {
                vec![
                    NodeAddress {
                        address: name.to_string(),
                        type_: "Hostname".to_string(),
                    },
                    NodeAddress {
                        address: ip.to_string(),
                        type_: "InternalIP".to_string(),
                    },
                ]
            }),
            ..Default::default()
        }),
    }
}

/// Helper to create test CLBPortPool CRD without status
pub fn create_test_port_pool(name: &str, start_port: u16, lb_ids: &[&str]) -> CLBPortPool {
    CLBPortPool {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: CLBPortPoolSpec {
            start_port,
            end_port: None,
            listener_quota: None,
            segment_length: None,
            region: None,
            lb_policy: None,
            existing_load_balancer_ids: lb_ids.iter().map(ToString::to_string).collect(),
            auto_create: None,
        },
        status: None,
    }
}

/// Helper to create an Active pool status with running load balancers
pub fn pool_status(quota: u16, lb_ids: &[&str]) -> CLBPortPoolStatus {
    CLBPortPoolStatus {
        state: PortPoolState::Active,
        quota,
        load_balancer_statuses: lb_ids
            .iter()
            .map(|id| LoadBalancerStatus {
                load_balancer_id: (*id).to_string(),
                ips: vec!["1.2.3.4".to_string()],
                ..Default::default()
            })
            .collect(),
        ..Default::default()
    }
}

/// Reconciler backed by a `MockClbApi` and a client for an unreachable API
/// server. Must run inside a tokio runtime.
pub fn test_reconciler() -> (Reconciler, Arc<MockClbApi>) {
    let _ = rustls::crypto::ring::default_provider().install_default();
    let kube_config = kube::Config::new("http://127.0.0.1:9".parse().unwrap());
    test_reconciler_with(Client::try_from(kube_config).unwrap())
}

/// Reconciler backed by a `MockClbApi` and the given Kubernetes client.
pub fn test_reconciler_with(client: Client) -> (Reconciler, Arc<MockClbApi>) {
    let mock = Arc::new(MockClbApi::new());
    let api: Arc<dyn ClbApi> = Arc::clone(&mock) as Arc<dyn ClbApi>;
    let clb_config = ClbClientConfig {
        batch: BatchConfig {
            max_tasks: 20,
            window: Duration::from_millis(10),
        },
        ..ClbClientConfig::default()
    };
    let clb = ClbClient::new(api, clb_config, CancellationToken::new());

    let vars = BTreeMap::from([
        ("CLB_API_TOKEN", "test-token"),
        ("CLB_DEFAULT_REGION", "ap-test"),
    ]);
    let config = Config::from_lookup(|key| vars.get(key).map(ToString::to_string)).unwrap();
    let metrics = Arc::new(Metrics::new().unwrap());

    (
        Reconciler::new(client, clb, Arc::new(PortAllocator::new()), config, metrics),
        mock,
    )
}

#[derive(Debug, Default)]
struct ApiState {
    objects: BTreeMap<String, Value>,
    resource_version: u64,
    rejected_status_patches: usize,
    rejected_patches: usize,
    conflicts: usize,
}

impl ApiState {
    fn bump(&mut self, object: &mut Value) {
        self.resource_version += 1;
        object["metadata"]["resourceVersion"] = json!(self.resource_version.to_string());
    }

    fn patch(&mut self, key: &str, status: bool, body: &[u8]) -> Response<Body> {
        let rejected = if status {
            &mut self.rejected_status_patches
        } else {
            &mut self.rejected_patches
        };
        if *rejected > 0 {
            *rejected -= 1;
            self.conflicts += 1;
            return failure(StatusCode::CONFLICT, "Conflict", key);
        }
        let Some(mut object) = self.objects.get(key).cloned() else {
            return failure(StatusCode::NOT_FOUND, "NotFound", key);
        };

        let mut patch: Value = serde_json::from_slice(body).unwrap();
        let expected = patch.pointer("/metadata/resourceVersion").and_then(Value::as_str);
        if expected.is_some_and(|rv| object.pointer("/metadata/resourceVersion").and_then(Value::as_str) != Some(rv)) {
            self.conflicts += 1;
            return failure(StatusCode::CONFLICT, "Conflict", key);
        }
        if let Some(metadata) = patch.get_mut("metadata").and_then(Value::as_object_mut) {
            metadata.remove("resourceVersion");
        }
        merge_patch(&mut object, &patch);
        self.bump(&mut object);

        // A deleted object goes away with its last finalizer
        let deleted = object.pointer("/metadata/deletionTimestamp").is_some()
            && object
                .pointer("/metadata/finalizers")
                .and_then(Value::as_array)
                .is_none_or(Vec::is_empty);
        if deleted {
            self.objects.remove(key);
        } else {
            self.objects.insert(key.to_string(), object.clone());
        }
        respond(StatusCode::OK, &object)
    }
}

/// JSON merge patch (RFC 7386)
fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(fields) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(serde_json::Map::new());
    }
    if let Value::Object(map) = target {
        for (key, value) in fields {
            if value.is_null() {
                map.remove(key);
            } else {
                merge_patch(map.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}

fn respond(status: StatusCode, body: &Value) -> Response<Body> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(body).unwrap()))
        .unwrap()
}

fn failure(status: StatusCode, reason: &str, key: &str) -> Response<Body> {
    respond(
        status,
        &json!({
            "kind": "Status",
            "apiVersion": "v1",
            "metadata": {},
            "status": "Failure",
            "message": format!("{reason}: {key}"),
            "reason": reason,
            "code": status.as_u16(),
        }),
    )
}

fn object_key<K: Resource<DynamicType = ()>>(name: &str, namespace: Option<&str>) -> String {
    format!("{}/{}", K::url_path(&(), namespace), name)
}

/// In-memory API server for reconciler tests.
///
/// Serves GET and merge-patch PATCH for objects inserted up front, enforces
/// `metadata.resourceVersion` preconditions, and removes deleted objects once
/// their last finalizer is gone.
#[derive(Debug, Clone, Default)]
pub struct FakeApiServer {
    state: Arc<Mutex<ApiState>>,
}

impl FakeApiServer {
    /// Empty server.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ApiState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stores `object` and returns it as read back, with a resource version.
    pub fn insert<K>(&self, object: &K) -> K
    where
        K: Resource<DynamicType = ()> + Serialize + DeserializeOwned,
    {
        let meta = object.meta();
        let key = object_key::<K>(meta.name.as_deref().unwrap(), meta.namespace.as_deref());
        let mut value = serde_json::to_value(object).unwrap();
        let mut state = self.lock();
        state.bump(&mut value);
        state.objects.insert(key, value.clone());
        serde_json::from_value(value).unwrap()
    }

    /// Current state of an object, `None` once deleted.
    pub fn get<K>(&self, name: &str, namespace: Option<&str>) -> Option<K>
    where
        K: Resource<DynamicType = ()> + DeserializeOwned,
    {
        let value = self.lock().objects.get(&object_key::<K>(name, namespace)).cloned()?;
        Some(serde_json::from_value(value).unwrap())
    }

    /// Fail the next `n` status patches with 409 Conflict.
    pub fn reject_status_patches(&self, n: usize) {
        self.lock().rejected_status_patches = n;
    }

    /// Fail the next `n` object patches (not status) with 409 Conflict.
    pub fn reject_patches(&self, n: usize) {
        self.lock().rejected_patches = n;
    }

    /// Conflicts answered so far.
    pub fn conflicts(&self) -> usize {
        self.lock().conflicts
    }

    /// Client talking to this server.
    pub fn client(&self) -> Client {
        let server = self.clone();
        let service = tower::service_fn(move |request: Request<Body>| {
            let server = server.clone();
            async move { Ok::<_, Infallible>(server.handle(request).await) }
        });
        Client::new(service, "default")
    }

    async fn handle(&self, request: Request<Body>) -> Response<Body> {
        let (parts, body) = request.into_parts();
        let body = body.collect_bytes().await.unwrap_or_default();
        let path = parts.uri.path();
        let (key, status) = match path.strip_suffix("/status") {
            Some(key) => (key, true),
            None => (path, false),
        };

        let mut state = self.lock();
        match parts.method {
            Method::GET => match state.objects.get(key) {
                Some(object) => respond(StatusCode::OK, object),
                None => failure(StatusCode::NOT_FOUND, "NotFound", key),
            },
            Method::PATCH => state.patch(key, status, &body),
            _ => failure(StatusCode::METHOD_NOT_ALLOWED, "MethodNotAllowed", key),
        }
    }
}
