//! Finalizer helpers.
//!
//! Finalizers are written with a JSON merge patch carrying the full list and
//! the object's `resourceVersion`, so a concurrent change fails with a
//! conflict instead of being overwritten.

use kube::api::{Patch, PatchParams};
use kube::{Api, Resource};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use std::fmt::Debug;

use crate::error::ControllerError;

/// Finalizer on `CLBPodBinding` and `CLBNodeBinding` objects.
pub const BINDING_FINALIZER: &str = "networking.clb.io/binding";

/// Finalizer on `CLBPortPool` objects.
pub const POOL_FINALIZER: &str = "networking.clb.io/port-pool";

/// Checks whether `finalizer` is set on the object.
pub fn has_finalizer<K: Resource>(resource: &K, finalizer: &str) -> bool {
    resource
        .meta()
        .finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|cur| cur == finalizer))
}

/// Checks whether the object is being deleted.
pub fn has_deletion_stamp<K: Resource>(resource: &K) -> bool {
    resource.meta().deletion_timestamp.is_some()
}

async fn patch_finalizers<K>(
    api: &Api<K>,
    resource: &K,
    resource_version: Option<&str>,
    finalizers: Vec<String>,
) -> Result<K, ControllerError>
where
    K: Resource + Clone + DeserializeOwned + Serialize + Debug,
{
    let name = resource
        .meta()
        .name
        .as_deref()
        .ok_or(ControllerError::MissingObjectKey(".metadata.name"))?;
    let patch = json!({
        "metadata": {
            "resourceVersion": resource_version,
            "finalizers": finalizers,
        }
    });
    Ok(api.patch(name, &PatchParams::default(), &Patch::Merge(&patch)).await?)
}

/// Adds `finalizer` and returns the updated object.
pub async fn add_finalizer<K>(api: &Api<K>, resource: &K, finalizer: &str) -> Result<K, ControllerError>
where
    K: Resource + Clone + DeserializeOwned + Serialize + Debug,
{
    let mut finalizers = resource.meta().finalizers.clone().unwrap_or_default();
    finalizers.push(finalizer.to_string());
    patch_finalizers(api, resource, resource.meta().resource_version.as_deref(), finalizers).await
}

/// Removes `finalizer`; a no-op if it is not set.
///
/// `resource_version` is the version of the last write made during this
/// reconcile, which supersedes the one `resource` was read with.
pub async fn remove_finalizer<K>(
    api: &Api<K>,
    resource: &K,
    finalizer: &str,
    resource_version: Option<&str>,
) -> Result<(), ControllerError>
where
    K: Resource + Clone + DeserializeOwned + Serialize + Debug,
{
    let Some(mut finalizers) = resource.meta().finalizers.clone() else {
        return Ok(());
    };
    let Some(index) = finalizers.iter().position(|cur| cur == finalizer) else {
        return Ok(());
    };
    finalizers.swap_remove(index);
    patch_finalizers(api, resource, resource_version, finalizers).await?;
    Ok(())
}
