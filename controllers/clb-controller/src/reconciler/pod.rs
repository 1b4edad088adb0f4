//! `CLBPodBinding`: bindings whose backend is a Pod.

use crds::{CLBBindingStatus, CLBPodBinding, CLBPodBindingSpec, PortEntry};
use k8s_openapi::api::core::v1::Pod;
use kube::api::ObjectMeta;
use kube::{Api, Client, Resource, ResourceExt};

use super::binding::Binding;

impl Binding for CLBPodBinding {
    type Backend = Pod;

    const KIND: &'static str = "CLBPodBinding";

    const BACKEND_KIND: &'static str = "Pod";

    fn api(client: Client, namespace: Option<&str>) -> Api<Self> {
        match namespace {
            Some(ns) => Api::namespaced(client, ns),
            None => Api::all(client),
        }
    }

    fn backend_api(client: Client, namespace: Option<&str>) -> Api<Pod> {
        match namespace {
            Some(ns) => Api::namespaced(client, ns),
            None => Api::all(client),
        }
    }

    fn for_backend(backend: &Pod, ports: Vec<PortEntry>, disabled: bool) -> Self {
        CLBPodBinding {
            metadata: ObjectMeta {
                name: backend.metadata.name.clone(),
                namespace: backend.metadata.namespace.clone(),
                owner_references: backend.controller_owner_ref(&()).map(|r| vec![r]),
                ..ObjectMeta::default()
            },
            spec: CLBPodBindingSpec { disabled, ports },
            status: None,
        }
    }

    fn disabled(&self) -> bool {
        self.spec.disabled
    }

    fn ports(&self) -> &[PortEntry] {
        &self.spec.ports
    }

    fn binding_status(&self) -> Option<&CLBBindingStatus> {
        self.status.as_ref()
    }

    fn backend_ip(backend: &Pod) -> Option<String> {
        backend
            .status
            .as_ref()
            .and_then(|s| s.pod_ip.clone())
            .filter(|ip| !ip.is_empty())
    }

    fn backend_terminating(backend: &Pod) -> bool {
        backend.metadata.deletion_timestamp.is_some()
            || backend
                .status
                .as_ref()
                .and_then(|s| s.phase.as_deref())
                .is_some_and(|phase| phase == "Succeeded" || phase == "Failed")
    }

    fn cert_namespace(&self, _controller_namespace: &str) -> String {
        self.namespace().unwrap_or_else(|| "default".to_string())
    }
}
