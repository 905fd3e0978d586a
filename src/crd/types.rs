//! Shared reference and condition types used across resource specs

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Reference to another object by group/version, kind and name
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectReference {
    /// API version of the referent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,

    /// Kind of the referent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    /// Name of the referent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Namespace of the referent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// Status of a condition
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// The condition holds
    True,
    /// The condition does not hold
    False,
    /// The condition state cannot be determined
    #[default]
    Unknown,
}

/// A condition on a resource status
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Condition type (e.g. "Ready")
    #[serde(rename = "type")]
    pub type_: String,
    /// Current status of the condition
    pub status: ConditionStatus,
    /// Machine-readable reason for the condition state
    #[serde(default)]
    pub reason: String,
    /// Human-readable message
    #[serde(default)]
    pub message: String,
    /// When the condition last changed, RFC 3339
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

impl Condition {
    /// Create a new condition
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: None,
        }
    }

    /// True if the condition type matches and its status is `True`
    pub fn is_true(&self, type_: &str) -> bool {
        self.type_ == type_ && self.status == ConditionStatus::True
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_references_serialize_with_camel_case_keys() {
        let reference = ObjectReference {
            api_version: Some("infrastructure.cluster.x-k8s.io/v1beta1".into()),
            kind: Some("GenericInfrastructureMachineTemplate".into()),
            name: Some("infra-foo".into()),
            namespace: None,
        };
        let json = serde_json::to_value(&reference).unwrap();

        assert_eq!(json["apiVersion"], "infrastructure.cluster.x-k8s.io/v1beta1");
        assert_eq!(json["kind"], "GenericInfrastructureMachineTemplate");
        assert!(json.get("namespace").is_none());
    }

    #[test]
    fn condition_serializes_with_lowercase_type_key() {
        let condition = Condition::new(
            "Ready",
            ConditionStatus::False,
            "WaitingForMachines",
            "0 of 3 machines ready",
        );
        let json = serde_json::to_value(&condition).unwrap();

        assert_eq!(json["type"], "Ready");
        assert_eq!(json["status"], "False");
        assert_eq!(json["reason"], "WaitingForMachines");
    }

    #[test]
    fn is_true_requires_both_type_and_status() {
        let ready = Condition::new("Ready", ConditionStatus::True, "Ready", "");
        assert!(ready.is_true("Ready"));
        assert!(!ready.is_true("Joined"));

        let not_ready = Condition::new("Ready", ConditionStatus::False, "NotReady", "");
        assert!(!not_ready.is_true("Ready"));
    }
}
