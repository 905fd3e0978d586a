//! K0sControlPlane Custom Resource Definition
//!
//! The K0sControlPlane CRD declares a hosted k0s control plane: the desired
//! k0s version, the number of controller machines, the infrastructure
//! template they are cloned from, and the configuration handed to every
//! bootstrapped node.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::bootstrap::K0sConfigSpec;
use super::types::{Condition, ObjectReference};
use crate::K0S_VERSION_SUFFIX;

/// Condition set on the control plane once every desired machine is ready
pub const CONTROL_PLANE_READY_CONDITION: &str = "ControlPlaneReady";

/// Specification for a K0sControlPlane
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "controlplane.cluster.x-k8s.io",
    version = "v1beta1",
    kind = "K0sControlPlane",
    plural = "k0scontrolplanes",
    shortname = "kcp",
    status = "K0sControlPlaneStatus",
    namespaced,
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".spec.version"}"#,
    printcolumn = r#"{"name":"Replicas","type":"integer","jsonPath":".spec.replicas"}"#,
    printcolumn = r#"{"name":"Ready","type":"boolean","jsonPath":".status.ready"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct K0sControlPlaneSpec {
    /// Desired k0s version (e.g. `v1.30.0`)
    pub version: String,

    /// Desired number of control plane machines, typically odd
    #[serde(default = "default_replicas")]
    pub replicas: i32,

    /// How version changes are rolled out
    #[serde(default)]
    pub update_strategy: UpdateStrategy,

    /// Template the per-machine infrastructure objects are cloned from
    pub machine_template: K0sControlPlaneMachineTemplate,

    /// Configuration handed to every bootstrapped controller
    #[serde(default)]
    pub k0s_config_spec: K0sConfigSpec,
}

fn default_replicas() -> i32 {
    1
}

/// Rollout strategy for version changes
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum UpdateStrategy {
    /// Replace drifted machines with freshly provisioned ones
    #[default]
    Recreate,
    /// Upgrade machines in place through a k0s autopilot plan
    InPlace,
}

/// Machine template reference plus metadata stamped onto cloned machines
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct K0sControlPlaneMachineTemplate {
    /// Reference to the provider-specific infrastructure machine template
    pub infrastructure_ref: ObjectReference,

    /// Extra metadata applied to cloned infrastructure machines
    #[serde(default)]
    pub metadata: MachineTemplateMeta,
}

/// Labels and annotations applied to cloned infrastructure machines
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MachineTemplateMeta {
    /// Labels merged into every cloned machine
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    /// Annotations merged into every cloned machine
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl K0sControlPlaneSpec {
    /// Validate the control plane specification
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.version.is_empty() {
            return Err(crate::Error::validation("spec.version must be set"));
        }
        if self.replicas < 1 {
            return Err(crate::Error::validation(
                "spec.replicas must be at least 1",
            ));
        }
        if self
            .machine_template
            .infrastructure_ref
            .name
            .as_deref()
            .unwrap_or("")
            .is_empty()
        {
            return Err(crate::Error::validation(
                "spec.machineTemplate.infrastructureRef.name must be set",
            ));
        }
        Ok(())
    }

    /// Desired machine version in the suffixed `<version>+k0s.<n>` form
    pub fn version_with_suffix(&self) -> String {
        if self.version.contains("+k0s.") {
            self.version.clone()
        } else {
            format!("{}+{}", self.version, K0S_VERSION_SUFFIX)
        }
    }

    #[cfg(test)]
    pub(crate) fn default_for_tests() -> Self {
        Self {
            version: "v1.30.0".to_string(),
            replicas: 1,
            update_strategy: UpdateStrategy::Recreate,
            machine_template: K0sControlPlaneMachineTemplate {
                infrastructure_ref: ObjectReference {
                    api_version: Some("infrastructure.cluster.x-k8s.io/v1beta1".to_string()),
                    kind: Some("GenericInfrastructureMachineTemplate".to_string()),
                    name: Some("infra-foo".to_string()),
                    ..Default::default()
                },
                metadata: MachineTemplateMeta::default(),
            },
            k0s_config_spec: K0sConfigSpec::default(),
        }
    }
}

/// Status for a K0sControlPlane
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct K0sControlPlaneStatus {
    /// Number of owned, non-deleting machines
    #[serde(default)]
    pub replicas: i32,

    /// Machines already running the desired version
    #[serde(default)]
    pub updated_replicas: i32,

    /// Machines whose upstream Ready condition is true
    #[serde(default)]
    pub ready_replicas: i32,

    /// Machines that exist but are not ready
    #[serde(default)]
    pub unavailable_replicas: i32,

    /// Lowest version currently running, suffixed form
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Serialized label selector matching the owned machines
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,

    /// True once every desired machine is ready
    #[serde(default)]
    pub ready: bool,

    /// Conditions describing the control plane state
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl K0sControlPlaneStatus {
    /// Add a condition, replacing any existing condition of the same type
    pub fn condition(mut self, condition: Condition) -> Self {
        self.conditions.retain(|c| c.type_ != condition.type_);
        self.conditions.push(condition);
        self
    }

    /// True if the `ControlPlaneReady` condition is present and true
    pub fn is_control_plane_ready(&self) -> bool {
        self.conditions
            .iter()
            .any(|c| c.is_true(CONTROL_PLANE_READY_CONDITION))
    }
}
