//! FRP tunneling resources
//!
//! When the management network cannot reach the workload nodes directly, an
//! FRP client deployment forwards the hosted API server through an FRP
//! server. The reconciler owns four resources: the random tunnel token, the
//! frpc configuration, the client deployment and the service exposing the
//! tunnel port. All of them are controller-owned by the control plane.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, Node, PodSpec, PodTemplateSpec,
    Secret, Service, ServicePort, ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use k8s_openapi::ByteString;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::core::ObjectMeta;
use kube::{Client, ResourceExt};
use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};
use tracing::info;

use crate::controller::get_optional;
use crate::crd::{controller_reference, Cluster, K0sControlPlane};
use crate::{Error, Result, CLUSTER_NAME_LABEL, FIELD_MANAGER};

/// Image run by the FRP client deployment
const FRPC_IMAGE: &str = "snowdreamtech/frpc:0.51.3";
/// Port the FRP server listens on
const FRP_SERVER_PORT: i32 = 7000;
/// Data key of the token secret
const TOKEN_DATA_KEY: &str = "value";

/// Name of the FRP token secret for a cluster
pub fn frp_token_secret_name(cluster_name: &str) -> String {
    format!("{cluster_name}-frp-token")
}

/// Name of the frpc ConfigMap for a control plane
pub fn frp_config_map_name(kcp_name: &str) -> String {
    format!("{kcp_name}-frpc-config")
}

/// Name of the frpc Deployment and Service for a control plane
pub fn frp_workload_name(kcp_name: &str) -> String {
    format!("{kcp_name}-frpc")
}

fn generate_token() -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(32)
        .map(char::from)
        .collect()
}

/// Render the frpc configuration forwarding the hosted API server
fn render_frpc_config(server_address: &str, token: &str, node_port: i32) -> String {
    format!(
        "[common]\n\
         server_addr = {server_address}\n\
         server_port = {FRP_SERVER_PORT}\n\
         authentication_method = token\n\
         token = {token}\n\
         \n\
         [kube-apiserver]\n\
         type = tcp\n\
         local_ip = 10.96.0.1\n\
         local_port = 443\n\
         remote_port = {node_port}\n"
    )
}

fn node_address(node: &Node) -> Option<String> {
    let addresses = node.status.as_ref()?.addresses.as_ref()?;
    addresses
        .iter()
        .find(|a| a.type_ == "ExternalIP")
        .or_else(|| addresses.iter().find(|a| a.type_ == "InternalIP"))
        .map(|a| a.address.clone())
}

/// Resolve the FRP server address from a management cluster node when the
/// spec leaves it empty
async fn detect_node_address(client: &Client) -> Result<String> {
    let nodes: Api<Node> = Api::all(client.clone());
    let list = nodes.list(&ListParams::default()).await?;
    list.items
        .iter()
        .find_map(node_address)
        .ok_or_else(|| Error::not_ready("no node address available for tunneling"))
}

fn owned_metadata(kcp: &K0sControlPlane, cluster: &Cluster, name: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: kcp.namespace(),
        labels: Some(BTreeMap::from([(
            CLUSTER_NAME_LABEL.to_string(),
            cluster.name_any(),
        )])),
        owner_references: Some(vec![controller_reference(kcp)]),
        ..Default::default()
    }
}

fn frpc_deployment(kcp: &K0sControlPlane, cluster: &Cluster) -> Deployment {
    let name = frp_workload_name(&kcp.name_any());
    let selector_labels = BTreeMap::from([("app".to_string(), name.clone())]);

    Deployment {
        metadata: owned_metadata(kcp, cluster, &name),
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(selector_labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(selector_labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: "frpc".to_string(),
                        image: Some(FRPC_IMAGE.to_string()),
                        args: Some(vec![
                            "-c".to_string(),
                            "/etc/frp/frpc.ini".to_string(),
                        ]),
                        ports: Some(vec![ContainerPort {
                            container_port: 6443,
                            ..Default::default()
                        }]),
                        volume_mounts: Some(vec![VolumeMount {
                            name: "frpc-config".to_string(),
                            mount_path: "/etc/frp/frpc.ini".to_string(),
                            sub_path: Some("frpc.ini".to_string()),
                            ..Default::default()
                        }]),
                        ..Default::default()
                    }],
                    volumes: Some(vec![Volume {
                        name: "frpc-config".to_string(),
                        config_map: Some(ConfigMapVolumeSource {
                            name: frp_config_map_name(&kcp.name_any()),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn frpc_service(kcp: &K0sControlPlane, cluster: &Cluster, node_port: i32) -> Service {
    let name = frp_workload_name(&kcp.name_any());
    Service {
        metadata: owned_metadata(kcp, cluster, &name),
        spec: Some(ServiceSpec {
            type_: Some("NodePort".to_string()),
            selector: Some(BTreeMap::from([("app".to_string(), name)])),
            ports: Some(vec![ServicePort {
                name: Some("kube-apiserver".to_string()),
                port: 6443,
                target_port: Some(IntOrString::Int(6443)),
                node_port: Some(node_port),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Ensure the FRP token, ConfigMap, Deployment and Service exist.
///
/// A missing control plane endpoint never blocks this stage; the tunnel is
/// exactly what makes an unreachable cluster usable.
pub async fn reconcile_tunneling(
    client: &Client,
    cluster: &Cluster,
    kcp: &K0sControlPlane,
) -> Result<()> {
    let namespace = kcp.namespace().unwrap_or_default();
    let tunneling = &kcp.spec.k0s_config_spec.tunneling;

    let server_address = if tunneling.server_address.is_empty() {
        detect_node_address(client).await?
    } else {
        tunneling.server_address.clone()
    };

    let apply = PatchParams::apply(FIELD_MANAGER).force();

    // tunnel token, generated once and reused afterwards
    let secrets: Api<Secret> = Api::namespaced(client.clone(), &namespace);
    let token_name = frp_token_secret_name(&cluster.name_any());
    let token = match get_optional(&secrets, &token_name).await? {
        Some(secret) => secret
            .data
            .as_ref()
            .and_then(|d| d.get(TOKEN_DATA_KEY))
            .map(|b| String::from_utf8_lossy(&b.0).into_owned())
            .unwrap_or_default(),
        None => {
            let token = generate_token();
            let secret = Secret {
                metadata: owned_metadata(kcp, cluster, &token_name),
                data: Some(BTreeMap::from([(
                    TOKEN_DATA_KEY.to_string(),
                    ByteString(token.clone().into_bytes()),
                )])),
                ..Default::default()
            };
            secrets
                .patch(&token_name, &apply, &Patch::Apply(&secret))
                .await?;
            info!(secret = %token_name, "generated FRP tunnel token");
            token
        }
    };

    let config_maps: Api<ConfigMap> = Api::namespaced(client.clone(), &namespace);
    let config_map_name = frp_config_map_name(&kcp.name_any());
    let config_map = ConfigMap {
        metadata: owned_metadata(kcp, cluster, &config_map_name),
        data: Some(BTreeMap::from([(
            "frpc.ini".to_string(),
            render_frpc_config(&server_address, &token, tunneling.tunneling_node_port),
        )])),
        ..Default::default()
    };
    config_maps
        .patch(&config_map_name, &apply, &Patch::Apply(&config_map))
        .await?;

    let deployments: Api<Deployment> = Api::namespaced(client.clone(), &namespace);
    let deployment = frpc_deployment(kcp, cluster);
    deployments
        .patch(&frp_workload_name(&kcp.name_any()), &apply, &Patch::Apply(&deployment))
        .await?;

    let services: Api<Service> = Api::namespaced(client.clone(), &namespace);
    let service = frpc_service(kcp, cluster, tunneling.tunneling_node_port);
    services
        .patch(&frp_workload_name(&kcp.name_any()), &apply, &Patch::Apply(&service))
        .await?;

    Ok(())
}
