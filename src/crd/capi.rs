//! Consumed subset of the Cluster API resources
//!
//! The controller reads `Cluster` objects and manages `Machine` objects.
//! Only the fields the reconciler actually touches are modeled; everything
//! else round-trips through the API server untouched thanks to server-side
//! apply.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Condition, ObjectReference};

/// Specification of a Cluster API `Cluster`
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "cluster.x-k8s.io",
    version = "v1beta1",
    kind = "Cluster",
    plural = "clusters",
    status = "ClusterStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// When true, the cluster and everything it owns is not reconciled
    #[serde(default)]
    pub paused: bool,

    /// Cluster-wide network configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_network: Option<ClusterNetwork>,

    /// Endpoint the cluster's API server is reachable at
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_plane_endpoint: Option<ApiEndpoint>,

    /// Reference to the control plane provider object
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_plane_ref: Option<ObjectReference>,
}

/// Network ranges and service domain of a cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterNetwork {
    /// Service CIDR blocks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub services: Option<NetworkRanges>,

    /// Pod CIDR blocks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pods: Option<NetworkRanges>,

    /// DNS domain used by services
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_domain: Option<String>,
}

/// A list of CIDR blocks
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkRanges {
    /// CIDR blocks, first entry wins where a single value is needed
    #[serde(default)]
    pub cidr_blocks: Vec<String>,
}

impl NetworkRanges {
    /// First CIDR block, if any
    pub fn first(&self) -> Option<&str> {
        self.cidr_blocks.first().map(String::as_str)
    }
}

/// Host and port of an API server endpoint
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ApiEndpoint {
    /// Hostname or IP address
    #[serde(default)]
    pub host: String,
    /// Port number
    #[serde(default)]
    pub port: i32,
}

impl ApiEndpoint {
    /// True when either the host or the port is unset
    pub fn is_zero(&self) -> bool {
        self.host.is_empty() || self.port == 0
    }
}

/// Status of a Cluster API `Cluster`
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    /// Failure domains the cluster's provider exposes
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub failure_domains: BTreeMap<String, FailureDomain>,
}

/// A provider failure domain
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FailureDomain {
    /// Whether control plane machines may be placed in this domain
    #[serde(default)]
    pub control_plane: bool,
}

impl Cluster {
    /// The control plane endpoint, when it is fully populated
    pub fn endpoint(&self) -> Option<&ApiEndpoint> {
        self.spec
            .control_plane_endpoint
            .as_ref()
            .filter(|e| !e.is_zero())
    }
}

/// Specification of a Cluster API `Machine`
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "cluster.x-k8s.io",
    version = "v1beta1",
    kind = "Machine",
    plural = "machines",
    status = "MachineStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct MachineSpec {
    /// Name of the owning cluster
    #[serde(default)]
    pub cluster_name: String,

    /// Kubernetes/k0s version in the suffixed `<version>+k0s.<n>` form
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Failure domain the machine is placed in
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_domain: Option<String>,

    /// Bootstrap configuration reference
    #[serde(default)]
    pub bootstrap: MachineBootstrap,

    /// Reference to the provider-specific infrastructure machine
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub infrastructure_ref: Option<ObjectReference>,
}

/// Bootstrap source for a machine
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MachineBootstrap {
    /// Reference to the bootstrap config object
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_ref: Option<ObjectReference>,

    /// Name of the secret holding rendered bootstrap data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_secret_name: Option<String>,
}

/// Status of a Cluster API `Machine`
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MachineStatus {
    /// Lifecycle phase reported by the machine controller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,

    /// Machine conditions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<Condition>>,
}

impl Machine {
    /// True when the machine's upstream `Ready` condition is `True`
    pub fn is_ready(&self) -> bool {
        self.status
            .as_ref()
            .and_then(|s| s.conditions.as_ref())
            .is_some_and(|conditions| conditions.iter().any(|c| c.is_true("Ready")))
    }

    /// True when the machine has a deletion timestamp
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::ConditionStatus;
    use kube::core::ObjectMeta;

    #[test]
    fn endpoint_with_zero_port_is_treated_as_unset() {
        let mut cluster = Cluster::new("c1", ClusterSpec::default());
        assert!(cluster.endpoint().is_none());

        cluster.spec.control_plane_endpoint = Some(ApiEndpoint {
            host: "test.endpoint".into(),
            port: 0,
        });
        assert!(cluster.endpoint().is_none());

        cluster.spec.control_plane_endpoint = Some(ApiEndpoint {
            host: "test.endpoint".into(),
            port: 6443,
        });
        assert_eq!(cluster.endpoint().unwrap().host, "test.endpoint");
    }

    #[test]
    fn machine_readiness_follows_the_ready_condition() {
        let mut machine = Machine {
            metadata: ObjectMeta::default(),
            spec: MachineSpec::default(),
            status: None,
        };
        assert!(!machine.is_ready());

        machine.status = Some(MachineStatus {
            phase: Some("Running".into()),
            conditions: Some(vec![Condition::new(
                "Ready",
                ConditionStatus::True,
                "Ready",
                "",
            )]),
        });
        assert!(machine.is_ready());

        machine.status.as_mut().unwrap().conditions = Some(vec![Condition::new(
            "Ready",
            ConditionStatus::False,
            "Provisioning",
            "",
        )]);
        assert!(!machine.is_ready());
    }

    #[test]
    fn cluster_network_first_block_wins() {
        let ranges = NetworkRanges {
            cidr_blocks: vec!["10.96.0.0/12".into(), "10.112.0.0/12".into()],
        };
        assert_eq!(ranges.first(), Some("10.96.0.0/12"));
        assert_eq!(NetworkRanges::default().first(), None);
    }
}
