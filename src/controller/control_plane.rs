//! K0sControlPlane dispatcher
//!
//! One reconcile pass runs the stages in order: configuration enrichment,
//! certificate secrets, tunneling resources, kubeconfigs, and the machine
//! planner, then publishes the derived status. Transient conditions requeue
//! with a fixed interval; everything else is retried by the runtime with
//! backoff.

use std::sync::Arc;
use std::time::Duration;

use kube::api::{Api, DeleteParams};
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

use crate::config;
use crate::controller::{get_optional, status};
use crate::crd::{
    Cluster, Condition, ConditionStatus, K0sControlPlane, K0sControlPlaneStatus, Machine,
    CONTROL_PLANE_READY_CONDITION,
};
use crate::machines;
use crate::pki;
use crate::tunneling;
use crate::workload::WorkloadClientCache;
use crate::{Error, Result, PAUSED_ANNOTATION};

/// Requeue interval while the owner cluster or a dependency is not ready
const DEPENDENCY_REQUEUE: Duration = Duration::from_secs(20);
/// Requeue interval after a failed pass
const ERROR_REQUEUE: Duration = Duration::from_secs(5);

/// Controller context shared across reconciliation calls
pub struct Context {
    /// Management cluster client
    pub client: Client,
    /// Cached workload cluster clients, keyed by cluster identity
    pub workload_clients: WorkloadClientCache,
}

impl Context {
    /// Create a new controller context with the given client
    pub fn new(client: Client) -> Self {
        Self {
            client,
            workload_clients: WorkloadClientCache::new(),
        }
    }
}

/// Reconcile a K0sControlPlane resource
#[instrument(skip(kcp, ctx), fields(controlplane = %kcp.name_any()))]
pub async fn reconcile(kcp: Arc<K0sControlPlane>, ctx: Arc<Context>) -> Result<Action> {
    info!("reconciling control plane");

    let namespace = kcp
        .namespace()
        .ok_or_else(|| Error::validation("K0sControlPlane must be namespaced"))?;

    let Some(owner) = kcp
        .owner_references()
        .iter()
        .find(|r| r.kind == "Cluster")
        .cloned()
    else {
        debug!("waiting for the cluster controller to set the owner reference");
        return Ok(Action::requeue(DEPENDENCY_REQUEUE));
    };

    let clusters: Api<Cluster> = Api::namespaced(ctx.client.clone(), &namespace);
    let Some(cluster) = get_optional(&clusters, &owner.name).await? else {
        debug!(cluster = %owner.name, "owner cluster does not exist yet");
        return Ok(Action::requeue(DEPENDENCY_REQUEUE));
    };

    let paused_annotation = kcp
        .annotations()
        .get(PAUSED_ANNOTATION)
        .is_some_and(|v| v == "true");
    if cluster.spec.paused || paused_annotation {
        info!("reconciliation is paused");
        return Ok(Action::await_change());
    }

    if kcp.metadata.deletion_timestamp.is_some() {
        reconcile_delete(&ctx, &cluster, &kcp).await?;
        return Ok(Action::await_change());
    }

    if let Err(error) = kcp.spec.validate() {
        warn!(%error, "control plane spec failed validation");
        let status = K0sControlPlaneStatus::default().condition(Condition::new(
            CONTROL_PLANE_READY_CONDITION,
            ConditionStatus::False,
            "InvalidSpec",
            error.to_string(),
        ));
        status::patch_status(&ctx.client, &kcp, status).await?;
        return Ok(Action::await_change());
    }

    // Enrichment rewrites the embedded config on the working copy; every
    // downstream stage renders from it.
    let mut kcp = (*kcp).clone();
    if let Some(doc) = config::enrich_cluster_config(&cluster, &kcp.spec.k0s_config_spec)? {
        kcp.spec.k0s_config_spec.k0s = Some(doc);
    }

    let outcome = run_stages(&ctx, &cluster, &kcp).await;

    let machines = machines::list_control_plane_machines(&ctx.client, &cluster, &kcp).await?;
    let derived = status::compute_status(&cluster, &kcp, &machines);
    let converged = derived.ready;
    status::patch_status(&ctx.client, &kcp, derived).await?;

    match outcome {
        Ok(()) if converged => Ok(Action::await_change()),
        Ok(()) => Ok(Action::requeue(DEPENDENCY_REQUEUE)),
        Err(error) if error.is_transient() => {
            debug!(%error, "dependency not ready, requeueing");
            Ok(Action::requeue(DEPENDENCY_REQUEUE))
        }
        Err(error) => Err(error),
    }
}

async fn run_stages(ctx: &Context, cluster: &Cluster, kcp: &K0sControlPlane) -> Result<()> {
    pki::ensure_certificates(&ctx.client, cluster, kcp).await?;

    // Tunneling runs before the kubeconfig stage: a missing control plane
    // endpoint must not block the tunnel that makes the cluster reachable.
    if kcp.spec.k0s_config_spec.tunneling.enabled {
        tunneling::reconcile_tunneling(&ctx.client, cluster, kcp).await?;
    }

    pki::reconcile_kubeconfig(&ctx.client, cluster, kcp).await?;

    machines::reconcile_machines(&ctx.client, &ctx.workload_clients, cluster, kcp).await?;

    Ok(())
}

/// Tear down the control plane's machines; everything else cascades through
/// owner references
async fn reconcile_delete(ctx: &Context, cluster: &Cluster, kcp: &K0sControlPlane) -> Result<()> {
    let namespace = kcp.namespace().unwrap_or_default();
    let machines = machines::list_control_plane_machines(&ctx.client, cluster, kcp).await?;
    let api: Api<Machine> = Api::namespaced(ctx.client.clone(), &namespace);

    for machine in &machines {
        match api
            .delete(&machine.name_any(), &DeleteParams::default())
            .await
        {
            Ok(_) => {}
            Err(kube::Error::Api(ae)) if ae.code == 404 => {}
            Err(e) => return Err(e.into()),
        }
    }

    info!(
        machines = machines.len(),
        "control plane deleted, remaining resources cascade through owner references"
    );
    Ok(())
}

/// Error policy for the controller: log and retry with a short delay; the
/// runtime applies exponential backoff on repeated failures
pub fn error_policy(kcp: Arc<K0sControlPlane>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        controlplane = %kcp.name_any(),
        "reconciliation failed"
    );
    Action::requeue(ERROR_REQUEUE)
}
