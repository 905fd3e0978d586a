//! Machine planner for the control plane set
//!
//! The planner diffs the owned machine set against the declared spec and
//! converges it: it clones infrastructure machines from the template,
//! creates machines and their bootstrap configs, replaces machines whose
//! template lineage or version drifted, and scales down one machine at a
//! time behind an etcd departure check. In-place version rollouts go
//! through a k0s autopilot plan instead of touching machines.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::Utc;
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams};
use kube::core::ObjectMeta;
use kube::{Client, ResourceExt};
use semver::Version;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::controller::get_optional;
use crate::crd::{
    controller_reference, is_controlled_by, Cluster, K0sControlPlane, K0sControllerConfig,
    K0sControllerConfigSpec, Machine, MachineBootstrap, MachineSpec, ObjectReference,
    UpdateStrategy,
};
use crate::workload::{self, WorkloadClientCache, WorkloadClusterApi};
use crate::{
    Error, Result, CLUSTER_NAME_LABEL, CONTROL_PLANE_LABEL, FIELD_MANAGER, GENERATED_ROLE_LABEL,
    WORKER_ENABLED_LABEL,
};

pub mod template;

/// API version of the bootstrap config objects referenced by machines
const BOOTSTRAP_API_VERSION: &str = "bootstrap.cluster.x-k8s.io/v1beta1";
/// Kind of the bootstrap config objects referenced by machines
const BOOTSTRAP_KIND: &str = "K0sControllerConfig";

/// Name of the machine at the given index
pub fn machine_name(cp_name: &str, index: u32) -> String {
    format!("{cp_name}-{index}")
}

fn machine_index(cp_name: &str, name: &str) -> Option<u32> {
    name.strip_prefix(cp_name)?
        .strip_prefix('-')?
        .parse()
        .ok()
}

/// Lowest index for which no machine named `<cp>-<i>` exists
pub fn lowest_free_index(cp_name: &str, machines: &[Machine]) -> u32 {
    let used: HashSet<u32> = machines
        .iter()
        .filter_map(|m| machine_index(cp_name, &m.name_any()))
        .collect();
    (0..).find(|i| !used.contains(i)).unwrap_or(0)
}

fn parse_version(version: &str) -> Option<Version> {
    Version::parse(version.trim_start_matches('v')).ok()
}

/// Compare versions by semver precedence, so build metadata such as
/// `+k0s.0` never causes spurious drift. Unparseable versions fall back to
/// string equality.
pub fn versions_match(machine_version: &str, desired: &str) -> bool {
    match (parse_version(machine_version), parse_version(desired)) {
        (Some(a), Some(b)) => a.cmp_precedence(&b) == std::cmp::Ordering::Equal,
        _ => machine_version == desired,
    }
}

/// Lowest version currently running across the machine set, as stored on
/// the machine spec
pub fn min_machine_version(machines: &[Machine]) -> Option<String> {
    machines
        .iter()
        .filter_map(|m| m.spec.version.as_deref())
        .min_by(|a, b| match (parse_version(a), parse_version(b)) {
            (Some(a), Some(b)) => a.cmp_precedence(&b),
            _ => a.cmp(b),
        })
        .map(str::to_string)
}

/// Pick the machine to remove on scale-down: stale template lineage first,
/// then the oldest creation timestamp, then the lexicographically smallest
/// name
pub fn select_scale_down_target<'a>(
    machines: &'a [Machine],
    stale: &HashSet<String>,
) -> Option<&'a Machine> {
    machines.iter().min_by_key(|m| {
        (
            !stale.contains(&m.name_any()),
            m.metadata
                .creation_timestamp
                .as_ref()
                .map(|t| t.0.timestamp()),
            m.name_any(),
        )
    })
}

/// Failure domain for the machine at the given index, rotating through the
/// cluster's control plane domains
pub fn select_failure_domain(cluster: &Cluster, index: u32) -> Option<String> {
    let domains: Vec<&String> = cluster
        .status
        .as_ref()
        .map(|s| {
            s.failure_domains
                .iter()
                .filter(|(_, d)| d.control_plane)
                .map(|(name, _)| name)
                .collect()
        })
        .unwrap_or_default();

    if domains.is_empty() {
        None
    } else {
        Some(domains[index as usize % domains.len()].clone())
    }
}

/// Label selector matching the control plane machines of a cluster
pub fn machine_selector(cluster_name: &str) -> String {
    format!("{CLUSTER_NAME_LABEL}={cluster_name},{CONTROL_PLANE_LABEL}=true")
}

/// Build the autopilot plan upgrading every control plane machine in place
pub fn autopilot_plan(kcp: &K0sControlPlane, machine_names: &[String], timestamp: i64) -> Value {
    let version = &kcp.spec.version;
    let (amd64, arm64, arm) = match &kcp.spec.k0s_config_spec.download_url {
        Some(url) => (url.clone(), url.clone(), url.clone()),
        None => (
            format!("https://get.k0sproject.io/{version}/k0s-{version}-amd64"),
            format!("https://get.k0sproject.io/{version}/k0s-{version}-arm64"),
            format!("https://get.k0sproject.io/{version}/k0s-{version}-arm"),
        ),
    };

    json!({
        "apiVersion": "autopilot.k0sproject.io/v1beta2",
        "kind": "Plan",
        "metadata": {"name": "autopilot"},
        "spec": {
            "id": format!("id-{}-{timestamp}", kcp.name_any()),
            "timestamp": timestamp.to_string(),
            "commands": [{
                "k0supdate": {
                    "version": version,
                    "platforms": {
                        "linux-amd64": {"url": amd64},
                        "linux-arm64": {"url": arm64},
                        "linux-arm": {"url": arm},
                    },
                    "targets": {
                        "controllers": {
                            "discovery": {
                                "static": {"nodes": machine_names}
                            }
                        }
                    }
                }
            }]
        }
    })
}

/// Build the machine object for one control plane node
pub fn generate_machine(
    name: &str,
    cluster: &Cluster,
    kcp: &K0sControlPlane,
    infrastructure_ref: ObjectReference,
    failure_domain: Option<String>,
) -> Machine {
    let mut labels = BTreeMap::from([
        (CLUSTER_NAME_LABEL.to_string(), cluster.name_any()),
        (CONTROL_PLANE_LABEL.to_string(), "true".to_string()),
        (GENERATED_ROLE_LABEL.to_string(), "control-plane".to_string()),
    ]);
    if kcp.spec.k0s_config_spec.worker_enabled() {
        labels.insert(WORKER_ENABLED_LABEL.to_string(), "true".to_string());
    }

    Machine {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: kcp.namespace(),
            labels: Some(labels),
            owner_references: Some(vec![controller_reference(kcp)]),
            ..Default::default()
        },
        spec: MachineSpec {
            cluster_name: cluster.name_any(),
            version: Some(kcp.spec.version_with_suffix()),
            failure_domain,
            bootstrap: MachineBootstrap {
                config_ref: Some(ObjectReference {
                    api_version: Some(BOOTSTRAP_API_VERSION.to_string()),
                    kind: Some(BOOTSTRAP_KIND.to_string()),
                    name: Some(name.to_string()),
                    namespace: kcp.namespace(),
                }),
                data_secret_name: None,
            },
            infrastructure_ref: Some(infrastructure_ref),
        },
        status: None,
    }
}

/// Build the bootstrap config for a machine, controller-owned by it
pub fn generate_bootstrap_config(machine: &Machine, kcp: &K0sControlPlane) -> K0sControllerConfig {
    K0sControllerConfig {
        metadata: ObjectMeta {
            name: Some(machine.name_any()),
            namespace: machine.namespace(),
            labels: Some(BTreeMap::from([(
                CLUSTER_NAME_LABEL.to_string(),
                machine.spec.cluster_name.clone(),
            )])),
            owner_references: Some(vec![controller_reference(machine)]),
            ..Default::default()
        },
        spec: K0sControllerConfigSpec {
            version: Some(kcp.spec.version_with_suffix()),
            k0s_config_spec: kcp.spec.k0s_config_spec.clone(),
        },
        status: None,
    }
}

/// List the active control plane machines owned by this control plane
pub async fn list_control_plane_machines(
    client: &Client,
    cluster: &Cluster,
    kcp: &K0sControlPlane,
) -> Result<Vec<Machine>> {
    let namespace = kcp.namespace().unwrap_or_default();
    let api: Api<Machine> = Api::namespaced(client.clone(), &namespace);
    let list = api
        .list(&ListParams::default().labels(&machine_selector(&cluster.name_any())))
        .await?;

    Ok(list
        .items
        .into_iter()
        .filter(|m| is_controlled_by(m, kcp) && !m.is_deleting())
        .collect())
}

async fn infra_machines(
    client: &Client,
    namespace: &str,
    machines: &[Machine],
) -> Result<HashMap<String, DynamicObject>> {
    let mut result = HashMap::new();
    for machine in machines {
        let Some(reference) = &machine.spec.infrastructure_ref else {
            continue;
        };
        let Ok(resource) = template::api_resource_for_ref(reference) else {
            continue;
        };
        let api: Api<DynamicObject> = Api::namespaced_with(client.clone(), namespace, &resource);
        let name = reference.name.as_deref().unwrap_or_default();
        match api.get(name).await {
            Ok(infra) => {
                result.insert(machine.name_any(), infra);
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(result)
}

fn apply_params() -> PatchParams {
    PatchParams::apply(FIELD_MANAGER).force()
}

async fn create_machine_with_dependencies(
    client: &Client,
    cluster: &Cluster,
    kcp: &K0sControlPlane,
    machines: &[Machine],
) -> Result<Machine> {
    let namespace = kcp.namespace().unwrap_or_default();
    let index = lowest_free_index(&kcp.name_any(), machines);
    let name = machine_name(&kcp.name_any(), index);

    let template_object = template::get_machine_template(client, cluster, kcp).await?;
    let infra = template::machine_from_template(&template_object, &name, cluster, kcp)?;
    let infra_api: Api<DynamicObject> = Api::namespaced_with(
        client.clone(),
        &namespace,
        &template::api_resource_for_object(&infra)?,
    );
    infra_api
        .patch(&name, &apply_params(), &Patch::Apply(&infra))
        .await?;

    let machine = generate_machine(
        &name,
        cluster,
        kcp,
        template::object_reference_for(&infra),
        select_failure_domain(cluster, index),
    );
    let machines_api: Api<Machine> = Api::namespaced(client.clone(), &namespace);
    let machine = machines_api
        .patch(&name, &apply_params(), &Patch::Apply(&machine))
        .await?;

    let bootstrap = generate_bootstrap_config(&machine, kcp);
    let bootstrap_api: Api<K0sControllerConfig> = Api::namespaced(client.clone(), &namespace);
    bootstrap_api
        .patch(&name, &apply_params(), &Patch::Apply(&bootstrap))
        .await?;

    info!(machine = %name, "created control plane machine");
    Ok(machine)
}

async fn delete_machine_with_dependencies(
    client: &Client,
    workload_api: &dyn WorkloadClusterApi,
    namespace: &str,
    machine: &Machine,
) -> Result<()> {
    let name = machine.name_any();

    workload_api.delete_control_node(&name).await?;

    let machines_api: Api<Machine> = Api::namespaced(client.clone(), namespace);
    match machines_api.delete(&name, &DeleteParams::default()).await {
        Ok(_) => {}
        Err(kube::Error::Api(ae)) if ae.code == 404 => {}
        Err(e) => return Err(e.into()),
    }

    if let Some(reference) = &machine.spec.infrastructure_ref {
        if let Ok(resource) = template::api_resource_for_ref(reference) {
            let infra_api: Api<DynamicObject> =
                Api::namespaced_with(client.clone(), namespace, &resource);
            let infra_name = reference.name.as_deref().unwrap_or(&name);
            match infra_api.delete(infra_name, &DeleteParams::default()).await {
                Ok(_) => {}
                Err(kube::Error::Api(ae)) if ae.code == 404 => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    let bootstrap_api: Api<K0sControllerConfig> = Api::namespaced(client.clone(), namespace);
    match bootstrap_api.delete(&name, &DeleteParams::default()).await {
        Ok(_) => {}
        Err(kube::Error::Api(ae)) if ae.code == 404 => {}
        Err(e) => return Err(e.into()),
    }

    info!(machine = %name, "deleted control plane machine");
    Ok(())
}

async fn ensure_bootstrap_configs(
    client: &Client,
    namespace: &str,
    kcp: &K0sControlPlane,
    machines: &[Machine],
) -> Result<()> {
    let bootstrap_api: Api<K0sControllerConfig> = Api::namespaced(client.clone(), namespace);
    for machine in machines {
        let name = machine.name_any();
        if get_optional(&bootstrap_api, &name).await?.is_some() {
            continue;
        }
        let bootstrap = generate_bootstrap_config(machine, kcp);
        bootstrap_api
            .patch(&name, &apply_params(), &Patch::Apply(&bootstrap))
            .await?;
        info!(machine = %name, "recreated missing bootstrap config");
    }
    Ok(())
}

/// Converge the control plane machine set toward the declared spec.
///
/// Creation fills every missing index within a pass; deletion is limited to
/// one machine per pass and is preceded by an etcd departure check against
/// the workload cluster.
pub async fn reconcile_machines(
    client: &Client,
    workload_clients: &WorkloadClientCache,
    cluster: &Cluster,
    kcp: &K0sControlPlane,
) -> Result<()> {
    let namespace = kcp.namespace().unwrap_or_default();
    let desired = kcp.spec.replicas.max(0) as usize;
    let desired_version = kcp.spec.version_with_suffix();

    let mut machines = list_control_plane_machines(client, cluster, kcp).await?;

    let infra = infra_machines(client, &namespace, &machines).await?;
    let mut stale: HashSet<String> = machines
        .iter()
        .filter(|m| {
            !infra
                .get(&m.name_any())
                .map(|i| template::matches_lineage(i, &kcp.spec.machine_template.infrastructure_ref))
                .unwrap_or(false)
        })
        .map(|m| m.name_any())
        .collect();

    if kcp.spec.update_strategy == UpdateStrategy::Recreate {
        for machine in &machines {
            if let Some(version) = machine.spec.version.as_deref() {
                if !versions_match(version, &desired_version) {
                    stale.insert(machine.name_any());
                }
            }
        }
    }

    while machines.len() < desired {
        let machine = create_machine_with_dependencies(client, cluster, kcp, &machines).await?;
        machines.push(machine);
    }

    // Replacement surges one machine above the desired count so the new
    // machine exists before the stale one is removed.
    if !stale.is_empty() && machines.len() < desired + 1 {
        debug!(stale = stale.len(), "replacing stale control plane machines");
        let machine = create_machine_with_dependencies(client, cluster, kcp, &machines).await?;
        machines.push(machine);
    }

    if machines.len() > desired {
        if let Some(target) = select_scale_down_target(&machines, &stale).cloned() {
            let name = target.name_any();
            let workload_api = workload_clients.api_for(client, cluster).await?;

            if !workload_api.etcd_member_left(&name).await? {
                workload::mark_control_node_to_leave(&workload_api, &name).await?;
                return Err(Error::not_ready(format!(
                    "etcd member {name} has not left the cluster yet"
                )));
            }

            delete_machine_with_dependencies(client, &workload_api, &namespace, &target).await?;
            machines.retain(|m| m.name_any() != name);
        }
    }

    if kcp.spec.update_strategy == UpdateStrategy::InPlace {
        let drifted = machines.iter().any(|m| {
            m.spec
                .version
                .as_deref()
                .is_some_and(|v| !versions_match(v, &desired_version))
        });
        if drifted {
            let mut names: Vec<String> = machines.iter().map(|m| m.name_any()).collect();
            names.sort();
            let plan = autopilot_plan(kcp, &names, Utc::now().timestamp());
            let workload_api = workload_clients.api_for(client, cluster).await?;
            workload_api.apply_autopilot_plan(&plan).await?;
            info!(version = %kcp.spec.version, "posted autopilot upgrade plan");
        }
    }

    ensure_bootstrap_configs(client, &namespace, kcp, &machines).await?;

    Ok(())
}
