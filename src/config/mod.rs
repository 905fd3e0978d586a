//! k0s cluster configuration enrichment
//!
//! The embedded k0s `ClusterConfig` document is schemaless; enrichment
//! treats it as a nested map and performs path-scoped writes that never
//! overwrite a leaf the user already set. Cluster-derived network facts,
//! the external address policy and tunneling SANs are merged in here before
//! the document is rendered into per-machine bootstrap configs.

use serde_json::{json, Map, Value};

use crate::crd::{Cluster, K0sConfigSpec};
use crate::Result;

/// API version stamped on generated k0s config documents
const K0S_CONFIG_API_VERSION: &str = "k0s.k0sproject.io/v1beta1";
/// Kind stamped on generated k0s config documents
const K0S_CONFIG_KIND: &str = "ClusterConfig";

/// Enrich the user-supplied k0s configuration with cluster-derived data.
///
/// Returns `None` when the user provided no document and the cluster
/// carries no network configuration to seed one from. The operation is
/// idempotent: enriching an already-enriched document is a no-op.
pub fn enrich_cluster_config(cluster: &Cluster, config: &K0sConfigSpec) -> Result<Option<Value>> {
    let mut doc = match enrich_with_cluster_data(cluster, config.k0s.clone()) {
        Some(doc) => doc,
        None => return Ok(None),
    };

    apply_external_address_policy(cluster, &mut doc);

    if !config.tunneling.server_address.is_empty() {
        append_san(&mut doc, &config.tunneling.server_address);
    }

    Ok(Some(doc))
}

/// Merge the cluster's network facts into the document, creating it when
/// needed. Present leaves win over cluster data.
fn enrich_with_cluster_data(cluster: &Cluster, config: Option<Value>) -> Option<Value> {
    let network = cluster.spec.cluster_network.as_ref();
    if config.is_none() && network.is_none() {
        return None;
    }

    let mut doc = config.unwrap_or_else(|| Value::Object(Map::new()));

    if let Some(network) = network {
        if let Some(cidr) = network.services.as_ref().and_then(|r| r.first()) {
            set_if_absent(&mut doc, &["spec", "network", "serviceCIDR"], json!(cidr));
        }
        if let Some(cidr) = network.pods.as_ref().and_then(|r| r.first()) {
            set_if_absent(&mut doc, &["spec", "network", "podCIDR"], json!(cidr));
        }
        if let Some(domain) = network.service_domain.as_deref() {
            if !domain.is_empty() {
                set_if_absent(&mut doc, &["spec", "network", "clusterDomain"], json!(domain));
            }
        }
    }

    set_if_absent(&mut doc, &["apiVersion"], json!(K0S_CONFIG_API_VERSION));
    set_if_absent(&mut doc, &["kind"], json!(K0S_CONFIG_KIND));

    Some(doc)
}

/// Publish the control plane endpoint to workers.
///
/// With node-local load balancing enabled each worker balances across the
/// controllers itself, and an external address would override that; the
/// endpoint host goes into the certificate SANs instead. Without NLLB the
/// endpoint host becomes `spec.api.externalAddress`.
fn apply_external_address_policy(cluster: &Cluster, doc: &mut Value) {
    let Some(endpoint) = cluster.endpoint() else {
        return;
    };

    if nllb_enabled(doc) {
        prepend_san(doc, &endpoint.host);
    } else {
        set_if_absent(doc, &["spec", "api", "externalAddress"], json!(endpoint.host));
    }
}

fn nllb_enabled(doc: &Value) -> bool {
    get_path(
        doc,
        &["spec", "network", "nodeLocalLoadBalancing", "enabled"],
    )
    .and_then(Value::as_bool)
    .unwrap_or(false)
}

/// Read the value at a dotted path, if present
pub fn get_path<'a>(doc: &'a Value, path: &[&str]) -> Option<&'a Value> {
    let mut current = doc;
    for segment in path {
        current = current.get(segment)?;
    }
    Some(current)
}

/// Write `value` at `path` unless a value is already present, creating
/// intermediate objects as needed. A non-object intermediate aborts the
/// write, leaving the user's document untouched.
fn set_if_absent(doc: &mut Value, path: &[&str], value: Value) {
    let (leaf, parents) = match path.split_last() {
        Some(split) => split,
        None => return,
    };
    let Some(parent) = ensure_object_path(doc, parents) else {
        return;
    };
    parent.entry(leaf.to_string()).or_insert(value);
}

fn ensure_object_path<'a>(doc: &'a mut Value, path: &[&str]) -> Option<&'a mut Map<String, Value>> {
    let mut current = doc.as_object_mut()?;
    for segment in path {
        let entry = current
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        current = entry.as_object_mut()?;
    }
    Some(current)
}

fn sans_mut(doc: &mut Value) -> Option<&mut Vec<Value>> {
    let api = ensure_object_path(doc, &["spec", "api"])?;
    api.entry("sans".to_string())
        .or_insert_with(|| Value::Array(Vec::new()))
        .as_array_mut()
}

fn prepend_san(doc: &mut Value, san: &str) {
    if let Some(sans) = sans_mut(doc) {
        if !sans.iter().any(|v| v.as_str() == Some(san)) {
            sans.insert(0, json!(san));
        }
    }
}

fn append_san(doc: &mut Value, san: &str) {
    if let Some(sans) = sans_mut(doc) {
        if !sans.iter().any(|v| v.as_str() == Some(san)) {
            sans.push(json!(san));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{
        ApiEndpoint, ClusterNetwork, ClusterSpec, K0sConfigSpec, NetworkRanges, TunnelingSpec,
    };

    fn cluster_with_network() -> Cluster {
        Cluster::new(
            "test",
            ClusterSpec {
                cluster_network: Some(ClusterNetwork {
                    services: Some(NetworkRanges {
                        cidr_blocks: vec!["10.96.0.0/12".into()],
                    }),
                    pods: Some(NetworkRanges {
                        cidr_blocks: vec!["10.244.0.0/16".into()],
                    }),
                    service_domain: None,
                }),
                ..Default::default()
            },
        )
    }

    fn cluster_with_endpoint() -> Cluster {
        Cluster::new(
            "test",
            ClusterSpec {
                control_plane_endpoint: Some(ApiEndpoint {
                    host: "test.endpoint".into(),
                    port: 6443,
                }),
                ..Default::default()
            },
        )
    }

    fn spec_with_doc(doc: Value) -> K0sConfigSpec {
        K0sConfigSpec {
            k0s: Some(doc),
            ..Default::default()
        }
    }

    #[test]
    fn empty_cluster_and_empty_config_produce_nothing() {
        let cluster = Cluster::new("test", ClusterSpec::default());
        let result = enrich_cluster_config(&cluster, &K0sConfigSpec::default()).unwrap();
        assert_eq!(result, None);
    }

    #[test]
    fn cluster_cidrs_seed_a_fresh_document() {
        let result = enrich_cluster_config(&cluster_with_network(), &K0sConfigSpec::default())
            .unwrap()
            .unwrap();

        assert_eq!(
            result,
            json!({
                "apiVersion": "k0s.k0sproject.io/v1beta1",
                "kind": "ClusterConfig",
                "spec": {
                    "network": {
                        "serviceCIDR": "10.96.0.0/12",
                        "podCIDR": "10.244.0.0/16",
                    }
                }
            })
        );
    }

    #[test]
    fn user_service_cidr_is_never_overwritten() {
        let config = spec_with_doc(json!({
            "spec": {"network": {"serviceCIDR": "10.98.0.0/12"}}
        }));
        let result = enrich_cluster_config(&cluster_with_network(), &config)
            .unwrap()
            .unwrap();

        assert_eq!(
            get_path(&result, &["spec", "network", "serviceCIDR"]),
            Some(&json!("10.98.0.0/12"))
        );
        assert_eq!(
            get_path(&result, &["spec", "network", "podCIDR"]),
            Some(&json!("10.244.0.0/16"))
        );
    }

    #[test]
    fn service_domain_becomes_cluster_domain() {
        let cluster = Cluster::new(
            "test",
            ClusterSpec {
                cluster_network: Some(ClusterNetwork {
                    services: None,
                    pods: None,
                    service_domain: Some("cluster.local".into()),
                }),
                ..Default::default()
            },
        );
        let result = enrich_cluster_config(&cluster, &K0sConfigSpec::default())
            .unwrap()
            .unwrap();

        assert_eq!(
            result,
            json!({
                "apiVersion": "k0s.k0sproject.io/v1beta1",
                "kind": "ClusterConfig",
                "spec": {"network": {"clusterDomain": "cluster.local"}}
            })
        );
    }

    #[test]
    fn nllb_suppresses_external_address_and_fills_sans() {
        let config = spec_with_doc(json!({
            "apiVersion": "k0s.k0sproject.io/v1beta1",
            "kind": "ClusterConfig",
            "spec": {
                "api": {"sans": ["test.com"]},
                "network": {"nodeLocalLoadBalancing": {"enabled": true}},
            }
        }));
        let result = enrich_cluster_config(&cluster_with_endpoint(), &config)
            .unwrap()
            .unwrap();

        assert_eq!(
            get_path(&result, &["spec", "api", "sans"]),
            Some(&json!(["test.endpoint", "test.com"]))
        );
        assert_eq!(get_path(&result, &["spec", "api", "externalAddress"]), None);
    }

    #[test]
    fn without_nllb_the_endpoint_becomes_external_address() {
        let config = spec_with_doc(json!({
            "apiVersion": "k0s.k0sproject.io/v1beta1",
            "kind": "ClusterConfig",
            "spec": {"api": {"sans": ["test.com"]}}
        }));
        let result = enrich_cluster_config(&cluster_with_endpoint(), &config)
            .unwrap()
            .unwrap();

        assert_eq!(
            get_path(&result, &["spec", "api", "externalAddress"]),
            Some(&json!("test.endpoint"))
        );
        assert_eq!(
            get_path(&result, &["spec", "api", "sans"]),
            Some(&json!(["test.com"]))
        );
    }

    #[test]
    fn user_external_address_wins_over_the_endpoint() {
        let config = spec_with_doc(json!({
            "spec": {"api": {"externalAddress": "user.example.com"}}
        }));
        let result = enrich_cluster_config(&cluster_with_endpoint(), &config)
            .unwrap()
            .unwrap();

        assert_eq!(
            get_path(&result, &["spec", "api", "externalAddress"]),
            Some(&json!("user.example.com"))
        );
    }

    #[test]
    fn tunneling_server_address_joins_the_sans() {
        let config = K0sConfigSpec {
            k0s: Some(json!({
                "apiVersion": "k0s.k0sproject.io/v1beta1",
                "kind": "ClusterConfig",
                "spec": {"api": {"sans": ["test.com"]}}
            })),
            tunneling: TunnelingSpec {
                server_address: "my-tunneling-server-address.com".into(),
                ..Default::default()
            },
            ..Default::default()
        };
        let result = enrich_cluster_config(&cluster_with_endpoint(), &config)
            .unwrap()
            .unwrap();

        assert_eq!(
            get_path(&result, &["spec", "api", "sans"]),
            Some(&json!(["test.com", "my-tunneling-server-address.com"]))
        );
        assert_eq!(
            get_path(&result, &["spec", "api", "externalAddress"]),
            Some(&json!("test.endpoint"))
        );
    }

    #[test]
    fn enrichment_is_idempotent() {
        let mut cluster = cluster_with_network();
        cluster.spec.control_plane_endpoint = Some(ApiEndpoint {
            host: "test.endpoint".into(),
            port: 6443,
        });
        let config = K0sConfigSpec {
            k0s: Some(json!({
                "spec": {
                    "api": {"sans": ["test.com"]},
                    "network": {"nodeLocalLoadBalancing": {"enabled": true}},
                }
            })),
            tunneling: TunnelingSpec {
                server_address: "tunnel.example.com".into(),
                ..Default::default()
            },
            ..Default::default()
        };

        let once = enrich_cluster_config(&cluster, &config).unwrap().unwrap();
        let twice = enrich_cluster_config(
            &cluster,
            &K0sConfigSpec {
                k0s: Some(once.clone()),
                tunneling: config.tunneling.clone(),
                ..Default::default()
            },
        )
        .unwrap()
        .unwrap();

        assert_eq!(once, twice);
    }

    #[test]
    fn a_scalar_in_the_path_aborts_the_write() {
        let config = spec_with_doc(json!({"spec": {"network": "not-an-object"}}));
        let result = enrich_cluster_config(&cluster_with_network(), &config)
            .unwrap()
            .unwrap();

        // the user's (odd) value is preserved untouched
        assert_eq!(
            get_path(&result, &["spec", "network"]),
            Some(&json!("not-an-object"))
        );
    }
}
