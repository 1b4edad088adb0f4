//! `CLBNodeBinding`: bindings whose backend is a Node.

use crds::{CLBBindingStatus, CLBNodeBinding, CLBNodeBindingSpec, PortEntry};
use k8s_openapi::api::core::v1::Node;
use kube::api::ObjectMeta;
use kube::{Api, Client, Resource};

use super::binding::Binding;

/// Label marking nodes that cannot receive listener traffic.
const NODE_TYPE_LABEL: &str = "type";
const VIRTUAL_KUBELET: &str = "virtual-kubelet";

impl Binding for CLBNodeBinding {
    type Backend = Node;

    const KIND: &'static str = "CLBNodeBinding";

    const BACKEND_KIND: &'static str = "Node";

    fn api(client: Client, _namespace: Option<&str>) -> Api<Self> {
        Api::all(client)
    }

    fn backend_api(client: Client, _namespace: Option<&str>) -> Api<Node> {
        Api::all(client)
    }

    fn for_backend(backend: &Node, ports: Vec<PortEntry>, disabled: bool) -> Self {
        CLBNodeBinding {
            metadata: ObjectMeta {
                name: backend.metadata.name.clone(),
                owner_references: backend.controller_owner_ref(&()).map(|r| vec![r]),
                ..ObjectMeta::default()
            },
            spec: CLBNodeBindingSpec { disabled, ports },
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

    fn backend_ip(backend: &Node) -> Option<String> {
        let addresses = backend.status.as_ref()?.addresses.as_ref()?;
        addresses
            .iter()
            .find(|a| a.type_ == "InternalIP")
            .map(|a| a.address.clone())
    }

    fn backend_terminating(backend: &Node) -> bool {
        backend.metadata.deletion_timestamp.is_some()
    }

    fn backend_supported(backend: &Node) -> bool {
        backend
            .metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(NODE_TYPE_LABEL))
            .is_none_or(|t| t != VIRTUAL_KUBELET)
    }

    fn cert_namespace(&self, controller_namespace: &str) -> String {
        controller_namespace.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::create_test_node;

    #[test]
    fn test_internal_ip() {
        let node = create_test_node("node-1", Some("192.168.0.10"), false);
        assert_eq!(CLBNodeBinding::backend_ip(&node).as_deref(), Some("192.168.0.10"));
        assert_eq!(CLBNodeBinding::backend_ip(&create_test_node("node-2", None, false)), None);
    }

    #[test]
    fn test_virtual_kubelet_not_supported() {
        assert!(CLBNodeBinding::backend_supported(&create_test_node("node-1", Some("192.168.0.10"), false)));
        assert!(!CLBNodeBinding::backend_supported(&create_test_node("vk-1", Some("192.168.0.11"), true)));
    }

    #[test]
    fn test_certificates_from_controller_namespace() {
        let node = create_test_node("node-1", Some("192.168.0.10"), false);
        let binding = CLBNodeBinding::for_backend(&node, vec![], false);
        assert_eq!(binding.metadata.namespace, None);
        assert_eq!(binding.cert_namespace("kube-system"), "kube-system");
    }
}
