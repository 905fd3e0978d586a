//! Status derivation and publishing for the control plane object

use kube::api::{Api, Patch, PatchParams};
use kube::{Client, ResourceExt};
use serde_json::json;
use tracing::debug;

use crate::crd::{
    Cluster, Condition, ConditionStatus, K0sControlPlane, K0sControlPlaneStatus, Machine,
    CONTROL_PLANE_READY_CONDITION,
};
use crate::machines::{machine_selector, min_machine_version, versions_match};
use crate::{Result, FIELD_MANAGER};

/// Derive the control plane status from the owned machine set
pub fn compute_status(
    cluster: &Cluster,
    kcp: &K0sControlPlane,
    machines: &[Machine],
) -> K0sControlPlaneStatus {
    let desired = kcp.spec.replicas;
    let desired_version = kcp.spec.version_with_suffix();

    let replicas = machines.len() as i32;
    let updated_replicas = machines
        .iter()
        .filter(|m| {
            m.spec
                .version
                .as_deref()
                .is_some_and(|v| versions_match(v, &desired_version))
        })
        .count() as i32;
    let ready_replicas = machines.iter().filter(|m| m.is_ready()).count() as i32;
    let unavailable_replicas = replicas - ready_replicas;

    let ready = ready_replicas == desired && unavailable_replicas == 0;
    let condition = if ready {
        Condition::new(
            CONTROL_PLANE_READY_CONDITION,
            ConditionStatus::True,
            "Ready",
            format!("{ready_replicas} of {desired} machines ready"),
        )
    } else {
        let reason = if replicas < desired {
            "ScalingUp"
        } else if replicas > desired {
            "ScalingDown"
        } else {
            "WaitingForMachines"
        };
        Condition::new(
            CONTROL_PLANE_READY_CONDITION,
            ConditionStatus::False,
            reason,
            format!("{ready_replicas} of {desired} machines ready"),
        )
    };

    K0sControlPlaneStatus {
        replicas,
        updated_replicas,
        ready_replicas,
        unavailable_replicas,
        version: min_machine_version(machines).or(Some(desired_version)),
        selector: Some(machine_selector(&cluster.name_any())),
        ready,
        conditions: Vec::new(),
    }
    .condition(condition)
}

/// Publish a status onto the control plane object
pub async fn patch_status(
    client: &Client,
    kcp: &K0sControlPlane,
    status: K0sControlPlaneStatus,
) -> Result<()> {
    let namespace = kcp.namespace().unwrap_or_default();
    let api: Api<K0sControlPlane> = Api::namespaced(client.clone(), &namespace);

    api.patch_status(
        &kcp.name_any(),
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Merge(&json!({"status": status})),
    )
    .await?;

    debug!(controlplane = %kcp.name_any(), "published status");
    Ok(())
}
