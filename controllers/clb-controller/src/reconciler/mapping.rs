//! Pod and Node reconcilers: keep the same-named binding in line with the
//! backend's port mapping annotations.

use std::collections::BTreeMap;

use crds::PortEntry;
use crds::annotations::{ENABLE_PORT_MAPPING, PORT_MAPPING, PORT_MAPPING_RESULT, parse_enable_flag, parse_port_mapping};
use kube::api::{DeleteParams, Patch, PatchParams, PostParams};
use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use serde_json::json;
use tracing::{debug, info, warn};

use super::binding::Binding;
use super::{Reconciler, finalizer};
use crate::error::ControllerError;

/// Binding spec requested by a backend: port entries and the disabled flag.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct DesiredBinding {
    pub ports: Vec<PortEntry>,
    pub disabled: bool,
}

/// Reads the mapping annotations. `None` when the backend asks for no mapping.
pub(crate) fn desired_binding(annotations: &BTreeMap<String, String>) -> Result<Option<DesiredBinding>, ControllerError> {
    let Some(mapping) = annotations.get(PORT_MAPPING) else {
        return Ok(None);
    };
    let ports = parse_port_mapping(mapping).map_err(|e| ControllerError::InvalidAnnotation(e.to_string()))?;
    let enabled = parse_enable_flag(annotations.get(ENABLE_PORT_MAPPING).map(String::as_str))
        .map_err(|e| ControllerError::InvalidAnnotation(e.to_string()))?;
    Ok(Some(DesiredBinding {
        ports,
        disabled: !enabled,
    }))
}

fn owned_by<K: Resource, O: Resource>(resource: &K, owner: &O) -> bool {
    let Some(uid) = owner.meta().uid.as_deref() else {
        return false;
    };
    resource
        .meta()
        .owner_references
        .as_ref()
        .is_some_and(|refs| refs.iter().any(|r| r.uid == uid))
}

impl Reconciler {
    /// Reconciles a Pod or Node against its binding.
    pub async fn reconcile_backend<B: Binding>(&self, backend: &B::Backend) -> Result<Action, ControllerError> {
        let name = backend
            .meta()
            .name
            .as_deref()
            .ok_or(ControllerError::MissingObjectKey(".metadata.name"))?;
        let namespace = backend.meta().namespace.as_deref();
        let annotations = backend.annotations();

        if B::backend_terminating(backend) {
            debug!("{} backend {} is terminating, leaving binding as is", B::KIND, name);
            return Ok(Action::await_change());
        }

        let desired = match desired_binding(annotations) {
            Ok(desired) => desired,
            Err(e) => {
                warn!("{} backend {}: {}", B::KIND, name, e);
                return Ok(Action::await_change());
            }
        };
        if desired.is_none() && !annotations.contains_key(PORT_MAPPING_RESULT) {
            return Ok(Action::await_change());
        }

        let api = B::api(self.client.clone(), namespace);
        let existing = api.get_opt(name).await?;

        match (desired, existing) {
            (None, Some(binding)) => {
                if owned_by(&binding, backend) && !finalizer::has_deletion_stamp(&binding) {
                    api.delete(name, &DeleteParams::default()).await?;
                    info!("Port mapping removed from {} backend {}, deleted binding", B::KIND, name);
                }
            }
            (None, None) => {
                let patch = json!({ "metadata": { "annotations": { PORT_MAPPING_RESULT: null } } });
                B::backend_api(self.client.clone(), namespace)
                    .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
                    .await?;
                debug!("Cleared stale port mapping result on {} backend {}", B::KIND, name);
            }
            (Some(desired), None) => {
                let binding = B::for_backend(backend, desired.ports, desired.disabled);
                match api.create(&PostParams::default(), &binding).await {
                    Ok(_) => info!("Created {} {}", B::KIND, name),
                    // Old binding still finalizing; its deletion requeues us
                    Err(kube::Error::Api(resp)) if resp.code == 409 => {
                        debug!("{} {} already exists", B::KIND, name);
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            (Some(desired), Some(binding)) => {
                if finalizer::has_deletion_stamp(&binding) {
                    debug!("{} {} is being deleted, waiting", B::KIND, name);
                } else if binding.ports() != desired.ports.as_slice() || binding.disabled() != desired.disabled {
                    let patch = json!({
                        "metadata": { "resourceVersion": binding.meta().resource_version },
                        "spec": { "ports": desired.ports, "disabled": desired.disabled },
                    });
                    api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
                        .await?;
                    info!("Updated {} {} from backend annotations", B::KIND, name);
                } else {
                    debug!("{} {} up to date", B::KIND, name);
                }
            }
        }
        Ok(Action::await_change())
    }
}
