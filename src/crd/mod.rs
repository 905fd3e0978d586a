//! Custom Resource Definitions for the k0smotron controller
//!
//! Contains the controller-owned CRDs (`K0sControlPlane`,
//! `K0sControllerConfig`) and the consumed subset of the Cluster API
//! resources (`Cluster`, `Machine`).

mod bootstrap;
mod capi;
mod control_plane;
mod types;

pub use bootstrap::{
    K0sConfigSpec, K0sControllerConfig, K0sControllerConfigSpec, K0sControllerConfigStatus,
    TunnelingMode, TunnelingSpec,
};
pub use capi::{
    ApiEndpoint, Cluster, ClusterNetwork, ClusterSpec, ClusterStatus, FailureDomain, Machine,
    MachineBootstrap, MachineSpec, MachineStatus, NetworkRanges,
};
pub use control_plane::{
    K0sControlPlane, K0sControlPlaneMachineTemplate, K0sControlPlaneSpec, K0sControlPlaneStatus,
    MachineTemplateMeta, UpdateStrategy, CONTROL_PLANE_READY_CONDITION,
};
pub use types::{Condition, ConditionStatus, ObjectReference};

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Resource, ResourceExt};

/// Build a controller owner reference pointing at `owner`
pub fn controller_reference<K>(owner: &K) -> OwnerReference
where
    K: Resource<DynamicType = ()>,
{
    OwnerReference {
        api_version: K::api_version(&()).into_owned(),
        kind: K::kind(&()).into_owned(),
        name: owner.name_any(),
        uid: owner.meta().uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// True if `child` carries a controller owner reference to `owner`
pub fn is_controlled_by<C, O>(child: &C, owner: &O) -> bool
where
    C: Resource,
    O: Resource,
{
    let owner_uid = match &owner.meta().uid {
        Some(uid) => uid,
        None => return false,
    };
    child
        .meta()
        .owner_references
        .as_ref()
        .is_some_and(|refs| {
            refs.iter()
                .any(|r| r.controller == Some(true) && &r.uid == owner_uid)
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ObjectMeta;

    fn control_plane(name: &str, uid: &str) -> K0sControlPlane {
        let mut kcp = K0sControlPlane::new(name, K0sControlPlaneSpec::default_for_tests());
        kcp.metadata.uid = Some(uid.to_string());
        kcp
    }

    #[test]
    fn controller_reference_carries_kind_and_uid() {
        let kcp = control_plane("cp1", "uid-123");
        let owner_ref = controller_reference(&kcp);

        assert_eq!(owner_ref.api_version, "controlplane.cluster.x-k8s.io/v1beta1");
        assert_eq!(owner_ref.kind, "K0sControlPlane");
        assert_eq!(owner_ref.name, "cp1");
        assert_eq!(owner_ref.uid, "uid-123");
        assert_eq!(owner_ref.controller, Some(true));
        assert_eq!(owner_ref.block_owner_deletion, Some(true));
    }

    #[test]
    fn machines_owned_by_another_controller_are_not_matched() {
        let kcp = control_plane("cp1", "uid-123");
        let other = control_plane("cp2", "uid-456");

        let machine = Machine {
            metadata: ObjectMeta {
                name: Some("cp1-0".into()),
                owner_references: Some(vec![controller_reference(&kcp)]),
                ..Default::default()
            },
            spec: MachineSpec::default(),
            status: None,
        };

        assert!(is_controlled_by(&machine, &kcp));
        assert!(!is_controlled_by(&machine, &other));
    }

    #[test]
    fn non_controller_owner_references_do_not_count() {
        let kcp = control_plane("cp1", "uid-123");
        let mut owner_ref = controller_reference(&kcp);
        owner_ref.controller = Some(false);

        let machine = Machine {
            metadata: ObjectMeta {
                name: Some("cp1-0".into()),
                owner_references: Some(vec![owner_ref]),
                ..Default::default()
            },
            spec: MachineSpec::default(),
            status: None,
        };

        assert!(!is_controlled_by(&machine, &kcp));
    }
}
