//! Workload cluster API access
//!
//! Scale-down safety and in-place upgrades require talking to the hosted
//! cluster itself: etcd membership lives under `etcd.k0sproject.io`, control
//! nodes and upgrade plans under `autopilot.k0sproject.io`. Access goes
//! through a narrow trait so the planner can be tested against mocks, and
//! real clients are built lazily from the cluster's kubeconfig secret and
//! cached for the life of the process.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, DeleteParams, DynamicObject, Patch, PatchParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::discovery::ApiResource;
use kube::{Client, ResourceExt};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{info, warn};

#[cfg(test)]
use mockall::automock;

use crate::controller::get_optional;
use crate::crd::Cluster;
use crate::pki::KUBECONFIG_DATA_KEY;
use crate::{Error, Result, LEAVE_ANNOTATION, MARKED_TO_LEAVE_ANNOTATION};

/// Condition reported by k0s while an etcd member is part of the cluster
const ETCD_JOINED_CONDITION: &str = "Joined";

/// Operations the planner performs against a workload cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait WorkloadClusterApi: Send + Sync {
    /// True once the named etcd member has departed: the member object is
    /// gone, or its `Joined` condition has gone `False`
    async fn etcd_member_left(&self, name: &str) -> Result<bool>;

    /// Patch the etcd member with `spec.leave=true` and a departure marker
    async fn mark_etcd_member_to_leave(&self, name: &str) -> Result<()>;

    /// Fallback: annotate the control node so autopilot makes it leave
    async fn annotate_control_node_to_leave(&self, name: &str) -> Result<()>;

    /// Delete the control node object, tolerating absence
    async fn delete_control_node(&self, name: &str) -> Result<()>;

    /// Create an autopilot plan; an already-existing plan counts as success
    async fn apply_autopilot_plan(&self, plan: &Value) -> Result<()>;
}

/// Signal a control node to leave etcd, preferring the etcd member patch
/// and falling back to the control node annotation when that fails
pub async fn mark_control_node_to_leave(api: &dyn WorkloadClusterApi, name: &str) -> Result<()> {
    if let Err(error) = api.mark_etcd_member_to_leave(name).await {
        warn!(
            node = %name,
            %error,
            "failed to mark etcd member to leave, annotating control node instead"
        );
        api.annotate_control_node_to_leave(name).await?;
    }
    info!(node = %name, "marked control node to leave etcd");
    Ok(())
}

fn etcd_member_resource() -> ApiResource {
    ApiResource {
        group: "etcd.k0sproject.io".to_string(),
        version: "v1beta1".to_string(),
        api_version: "etcd.k0sproject.io/v1beta1".to_string(),
        kind: "EtcdMember".to_string(),
        plural: "etcdmembers".to_string(),
    }
}

fn control_node_resource() -> ApiResource {
    ApiResource {
        group: "autopilot.k0sproject.io".to_string(),
        version: "v1beta2".to_string(),
        api_version: "autopilot.k0sproject.io/v1beta2".to_string(),
        kind: "ControlNode".to_string(),
        plural: "controlnodes".to_string(),
    }
}

fn plan_resource() -> ApiResource {
    ApiResource {
        group: "autopilot.k0sproject.io".to_string(),
        version: "v1beta2".to_string(),
        api_version: "autopilot.k0sproject.io/v1beta2".to_string(),
        kind: "Plan".to_string(),
        plural: "plans".to_string(),
    }
}

/// Workload cluster access over a real Kubernetes client
pub struct RemoteWorkloadCluster {
    client: Client,
}

impl RemoteWorkloadCluster {
    /// Wrap a client connected to the workload cluster
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn etcd_members(&self) -> Api<DynamicObject> {
        Api::all_with(self.client.clone(), &etcd_member_resource())
    }

    fn control_nodes(&self) -> Api<DynamicObject> {
        Api::all_with(self.client.clone(), &control_node_resource())
    }
}

#[async_trait]
impl WorkloadClusterApi for RemoteWorkloadCluster {
    async fn etcd_member_left(&self, name: &str) -> Result<bool> {
        match self.etcd_members().get(name).await {
            Ok(member) => {
                let departed = member
                    .data
                    .get("status")
                    .and_then(|s| s.get("conditions"))
                    .and_then(Value::as_array)
                    .is_some_and(|conditions| {
                        conditions.iter().any(|c| {
                            c.get("type").and_then(Value::as_str) == Some(ETCD_JOINED_CONDITION)
                                && c.get("status").and_then(Value::as_str) == Some("False")
                        })
                    });
                Ok(departed)
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(true),
            Err(e) => Err(e.into()),
        }
    }

    async fn mark_etcd_member_to_leave(&self, name: &str) -> Result<()> {
        let patch = json!({
            "spec": {"leave": true},
            "metadata": {
                "annotations": {MARKED_TO_LEAVE_ANNOTATION: Utc::now().to_rfc3339()}
            }
        });
        self.etcd_members()
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn annotate_control_node_to_leave(&self, name: &str) -> Result<()> {
        let patch = json!({
            "metadata": {"annotations": {LEAVE_ANNOTATION: "true"}}
        });
        match self
            .control_nodes()
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_control_node(&self, name: &str) -> Result<()> {
        match self
            .control_nodes()
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn apply_autopilot_plan(&self, plan: &Value) -> Result<()> {
        let object: DynamicObject = serde_json::from_value(plan.clone())
            .map_err(|e| Error::serialization(format!("invalid autopilot plan: {e}")))?;
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &plan_resource());
        match api.create(&PostParams::default(), &object).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Lazily-initialized cache of workload cluster clients, keyed by the
/// cluster's namespaced name. This is the only process-wide mutable state.
#[derive(Default)]
pub struct WorkloadClientCache {
    clients: Mutex<HashMap<String, Client>>,
}

impl WorkloadClientCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or build a client for the given cluster from its kubeconfig secret
    pub async fn client_for(&self, management: &Client, cluster: &Cluster) -> Result<Client> {
        let namespace = cluster.namespace().unwrap_or_default();
        let key = format!("{}/{}", namespace, cluster.name_any());

        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(&key) {
            return Ok(client.clone());
        }

        let secret_name = format!("{}-kubeconfig", cluster.name_any());
        let secrets: Api<Secret> = Api::namespaced(management.clone(), &namespace);
        let secret = get_optional(&secrets, &secret_name).await?.ok_or_else(|| {
            Error::missing_dependency(format!("kubeconfig secret {secret_name} not found"))
        })?;

        let raw = secret
            .data
            .as_ref()
            .and_then(|d| d.get(KUBECONFIG_DATA_KEY))
            .map(|b| String::from_utf8_lossy(&b.0).into_owned())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                Error::missing_dependency(format!("kubeconfig secret {secret_name} is empty"))
            })?;

        let kubeconfig = Kubeconfig::from_yaml(&raw)
            .map_err(|e| Error::serialization(format!("invalid kubeconfig: {e}")))?;
        let config = kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| Error::serialization(format!("invalid kubeconfig: {e}")))?;
        let client = Client::try_from(config)?;

        clients.insert(key, client.clone());
        Ok(client)
    }

    /// Get or build a [`WorkloadClusterApi`] for the given cluster
    pub async fn api_for(
        &self,
        management: &Client,
        cluster: &Cluster,
    ) -> Result<RemoteWorkloadCluster> {
        Ok(RemoteWorkloadCluster::new(
            self.client_for(management, cluster).await?,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::predicate::eq;

    #[tokio::test]
    async fn leave_marking_prefers_the_etcd_member_patch() {
        let mut api = MockWorkloadClusterApi::new();
        api.expect_mark_etcd_member_to_leave()
            .with(eq("cp-0"))
            .times(1)
            .returning(|_| Ok(()));
        api.expect_annotate_control_node_to_leave().never();

        mark_control_node_to_leave(&api, "cp-0").await.unwrap();
    }

    #[tokio::test]
    async fn leave_marking_falls_back_to_the_control_node_annotation() {
        let mut api = MockWorkloadClusterApi::new();
        api.expect_mark_etcd_member_to_leave()
            .with(eq("cp-0"))
            .returning(|_| {
                Err(Error::serialization(
                    "etcdmembers.etcd.k0sproject.io \"cp-0\" could not be patched",
                ))
            });
        api.expect_annotate_control_node_to_leave()
            .with(eq("cp-0"))
            .times(1)
            .returning(|_| Ok(()));

        mark_control_node_to_leave(&api, "cp-0").await.unwrap();
    }

    #[tokio::test]
    async fn fallback_failure_propagates_to_the_caller() {
        let mut api = MockWorkloadClusterApi::new();
        api.expect_mark_etcd_member_to_leave()
            .returning(|_| Err(Error::serialization("patch failed")));
        api.expect_annotate_control_node_to_leave()
            .returning(|_| Err(Error::serialization("annotate failed")));

        let result = mark_control_node_to_leave(&api, "cp-0").await;
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("annotate failed"));
    }

    #[test]
    fn workload_resources_live_in_the_k0s_api_groups() {
        let etcd = etcd_member_resource();
        assert_eq!(etcd.api_version, "etcd.k0sproject.io/v1beta1");
        assert_eq!(etcd.plural, "etcdmembers");

        let node = control_node_resource();
        assert_eq!(node.api_version, "autopilot.k0sproject.io/v1beta2");
        assert_eq!(node.plural, "controlnodes");

        let plan = plan_resource();
        assert_eq!(plan.api_version, "autopilot.k0sproject.io/v1beta2");
        assert_eq!(plan.plural, "plans");
    }
}
