//! K0sControllerConfig bootstrap CRD and the shared k0s configuration spec

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// User-facing k0s configuration shared by the control plane spec and the
/// per-machine bootstrap objects
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct K0sConfigSpec {
    /// Embedded k0s `ClusterConfig` document. The document is schemaless;
    /// the enricher only performs path-scoped writes that never overwrite a
    /// present leaf.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub k0s: Option<serde_json::Value>,

    /// Extra command line arguments passed to `k0s controller`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    /// Override for the k0s binary download URL; replaces the per-platform
    /// defaults in autopilot plans and bootstrap scripts
    #[serde(default, rename = "downloadURL", skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,

    /// Tunneling configuration for clusters the management network cannot
    /// reach directly
    #[serde(default)]
    pub tunneling: TunnelingSpec,
}

impl K0sConfigSpec {
    /// True when `--enable-worker` appears in the controller arguments
    pub fn worker_enabled(&self) -> bool {
        self.args
            .iter()
            .any(|arg| arg == "--enable-worker" || arg == "--enable-worker=true")
    }
}

/// FRP tunneling configuration
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TunnelingSpec {
    /// Whether tunneling resources are reconciled
    #[serde(default)]
    pub enabled: bool,

    /// How clients reach the tunneled API server
    #[serde(default)]
    pub mode: TunnelingMode,

    /// Address of the FRP server; resolved from a management cluster node
    /// when empty
    #[serde(default)]
    pub server_address: String,

    /// NodePort the tunnel is exposed on
    #[serde(default = "default_tunneling_node_port")]
    pub tunneling_node_port: i32,
}

impl Default for TunnelingSpec {
    fn default() -> Self {
        Self {
            enabled: false,
            mode: TunnelingMode::default(),
            server_address: String::new(),
            tunneling_node_port: default_tunneling_node_port(),
        }
    }
}

fn default_tunneling_node_port() -> i32 {
    31443
}

/// Kubeconfig variant published for a tunneled cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TunnelingMode {
    /// Clients connect to the real endpoint through an HTTP proxy
    #[default]
    Proxy,
    /// Clients connect to the tunnel endpoint directly
    Tunnel,
}

/// Specification of a per-machine `K0sControllerConfig` bootstrap object
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "bootstrap.cluster.x-k8s.io",
    version = "v1beta1",
    kind = "K0sControllerConfig",
    plural = "k0scontrollerconfigs",
    status = "K0sControllerConfigStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct K0sControllerConfigSpec {
    /// k0s version the node is bootstrapped with, suffixed form
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Rendered k0s configuration for this machine
    #[serde(flatten)]
    pub k0s_config_spec: K0sConfigSpec,
}

/// Status of a `K0sControllerConfig`
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct K0sControllerConfigStatus {
    /// True once the bootstrap data secret has been produced
    #[serde(default)]
    pub ready: bool,

    /// Name of the secret holding the rendered bootstrap data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_secret_name: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tunneling_defaults_to_disabled_proxy_mode() {
        let spec = TunnelingSpec::default();
        assert!(!spec.enabled);
        assert_eq!(spec.mode, TunnelingMode::Proxy);
        assert!(spec.server_address.is_empty());
        assert_eq!(spec.tunneling_node_port, 31443);
    }

    #[test]
    fn tunneling_mode_uses_lowercase_wire_values() {
        assert_eq!(
            serde_json::to_value(TunnelingMode::Proxy).unwrap(),
            serde_json::json!("proxy")
        );
        assert_eq!(
            serde_json::to_value(TunnelingMode::Tunnel).unwrap(),
            serde_json::json!("tunnel")
        );
    }

    #[test]
    fn worker_enabled_matches_both_flag_spellings() {
        let mut spec = K0sConfigSpec::default();
        assert!(!spec.worker_enabled());

        spec.args = vec!["--debug".into(), "--enable-worker".into()];
        assert!(spec.worker_enabled());

        spec.args = vec!["--enable-worker=true".into()];
        assert!(spec.worker_enabled());

        spec.args = vec!["--enable-worker=false".into()];
        assert!(!spec.worker_enabled());
    }

    #[test]
    fn download_url_round_trips_with_uppercase_key() {
        let spec = K0sConfigSpec {
            download_url: Some("https://mirror.example.com/k0s".into()),
            ..Default::default()
        };
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["downloadURL"], "https://mirror.example.com/k0s");

        let parsed: K0sConfigSpec = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, spec);
    }

    #[test]
    fn controller_config_spec_flattens_the_shared_config() {
        let spec = K0sControllerConfigSpec {
            version: Some("v1.30.0+k0s.0".into()),
            k0s_config_spec: K0sConfigSpec {
                args: vec!["--enable-worker".into()],
                ..Default::default()
            },
        };
        let json = serde_json::to_value(&spec).unwrap();

        // flattened: args at the top level, no nested k0sConfigSpec key
        assert_eq!(json["version"], "v1.30.0+k0s.0");
        assert_eq!(json["args"][0], "--enable-worker");
        assert!(json.get("k0sConfigSpec").is_none());
    }
}
