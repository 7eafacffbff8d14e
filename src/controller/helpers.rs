//! Shared helpers for controller modules.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Resource, ResourceExt};

/// Field manager name used for server-side apply patches.
pub const FIELD_MANAGER: &str = "helm-chart-operator";

/// Build a controller OwnerReference for any kube-rs `Resource`.
///
/// The trait bound `K: Resource<DynamicType = ()>` means "any type whose
/// Kubernetes metadata is known at compile time", which is true for every
/// struct that derives `CustomResource`.
pub fn controller_owner_ref<K: Resource<DynamicType = ()>>(obj: &K) -> OwnerReference {
    OwnerReference {
        api_version: K::api_version(&()).to_string(),
        kind: K::kind(&()).to_string(),
        name: obj.name_any(),
        uid: obj.meta().uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}
