//! Infrastructure machine template handling
//!
//! The machine template is polymorphic over provider kinds, so everything
//! here works on [`DynamicObject`]: fetch the template by reference, stamp
//! the owning Cluster's controller reference onto it, and clone per-machine
//! infrastructure objects out of its `spec.template` body.

use std::collections::BTreeMap;

use kube::api::{Api, DynamicObject, Patch, PatchParams};
use kube::core::{ObjectMeta, TypeMeta};
use kube::discovery::ApiResource;
use kube::{Client, ResourceExt};
use serde_json::Value;

use crate::crd::{
    controller_reference, is_controlled_by, Cluster, K0sControlPlane, ObjectReference,
};
use crate::{
    Error, Result, CLONED_FROM_GROUPKIND_ANNOTATION, CLONED_FROM_NAME_ANNOTATION,
    CLUSTER_NAME_LABEL, CONTROL_PLANE_LABEL, CONTROL_PLANE_NAME_LABEL, FIELD_MANAGER,
};

/// Suffix by which a template kind differs from the kind it stamps out
const TEMPLATE_SUFFIX: &str = "Template";

/// Split an apiVersion into group and version; the group is empty for the
/// core API
pub fn parse_api_version(api_version: &str) -> (&str, &str) {
    match api_version.rsplit_once('/') {
        Some((group, version)) => (group, version),
        None => ("", api_version),
    }
}

/// Group/kind string used in lineage annotations, `Kind.group` form
pub fn group_kind(api_version: &str, kind: &str) -> String {
    let (group, _) = parse_api_version(api_version);
    if group.is_empty() {
        kind.to_string()
    } else {
        format!("{kind}.{group}")
    }
}

fn pluralize_kind(kind: &str) -> String {
    format!("{}s", kind.to_lowercase())
}

/// Build an [`ApiResource`] for an object reference
pub fn api_resource_for_ref(reference: &ObjectReference) -> Result<ApiResource> {
    let api_version = reference
        .api_version
        .as_deref()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| Error::template("object reference has no apiVersion"))?;
    let kind = reference
        .kind
        .as_deref()
        .filter(|k| !k.is_empty())
        .ok_or_else(|| Error::template("object reference has no kind"))?;

    let (group, version) = parse_api_version(api_version);
    Ok(ApiResource {
        group: group.to_string(),
        version: version.to_string(),
        api_version: api_version.to_string(),
        kind: kind.to_string(),
        plural: pluralize_kind(kind),
    })
}

/// Build an [`ApiResource`] for a dynamic object from its own type metadata
pub fn api_resource_for_object(object: &DynamicObject) -> Result<ApiResource> {
    let types = object
        .types
        .as_ref()
        .ok_or_else(|| Error::template("object has no type metadata"))?;
    let (group, version) = parse_api_version(&types.api_version);
    Ok(ApiResource {
        group: group.to_string(),
        version: version.to_string(),
        api_version: types.api_version.clone(),
        kind: types.kind.clone(),
        plural: pluralize_kind(&types.kind),
    })
}

/// True when the infra machine's lineage annotations match the control
/// plane's current template reference
pub fn matches_lineage(infra: &DynamicObject, reference: &ObjectReference) -> bool {
    let annotations = match &infra.metadata.annotations {
        Some(annotations) => annotations,
        None => return false,
    };
    let expected_name = reference.name.as_deref().unwrap_or("");
    let expected_group_kind = group_kind(
        reference.api_version.as_deref().unwrap_or(""),
        reference.kind.as_deref().unwrap_or(""),
    );

    annotations.get(CLONED_FROM_NAME_ANNOTATION).map(String::as_str) == Some(expected_name)
        && annotations
            .get(CLONED_FROM_GROUPKIND_ANNOTATION)
            .map(String::as_str)
            == Some(expected_group_kind.as_str())
}

/// Fetch the machine template the control plane references.
///
/// Templates are owned by the Cluster rather than the control plane, so
/// re-cloning after a template swap never re-owns them; the owner reference
/// is stamped on first sight.
pub async fn get_machine_template(
    client: &Client,
    cluster: &Cluster,
    kcp: &K0sControlPlane,
) -> Result<DynamicObject> {
    let reference = &kcp.spec.machine_template.infrastructure_ref;
    let name = reference
        .name
        .as_deref()
        .ok_or_else(|| Error::template("machine template reference has no name"))?;
    let namespace = reference
        .namespace
        .clone()
        .or_else(|| kcp.namespace())
        .unwrap_or_default();

    let resource = api_resource_for_ref(reference)?;
    let api: Api<DynamicObject> = Api::namespaced_with(client.clone(), &namespace, &resource);

    let template = match api.get(name).await {
        Ok(template) => template,
        Err(kube::Error::Api(ae)) if ae.code == 404 => {
            return Err(Error::missing_dependency(format!(
                "machine template {name} not found"
            )))
        }
        Err(e) => return Err(e.into()),
    };

    if !is_controlled_by(&template, cluster) {
        let mut owner_refs: Vec<_> = template
            .metadata
            .owner_references
            .clone()
            .unwrap_or_default()
            .into_iter()
            .filter(|r| r.controller != Some(true))
            .collect();
        owner_refs.push(controller_reference(cluster));

        let patch = serde_json::json!({"metadata": {"ownerReferences": owner_refs}});
        api.patch(
            name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await?;
    }

    Ok(template)
}

/// Clone a per-machine infrastructure object out of the template's
/// `spec.template` body. A template without one is malformed.
pub fn machine_from_template(
    template: &DynamicObject,
    name: &str,
    cluster: &Cluster,
    kcp: &K0sControlPlane,
) -> Result<DynamicObject> {
    let template_kind = template
        .types
        .as_ref()
        .map(|t| t.kind.clone())
        .unwrap_or_default();
    let template_api_version = template
        .types
        .as_ref()
        .map(|t| t.api_version.clone())
        .unwrap_or_default();

    let body = template
        .data
        .get("spec")
        .and_then(|spec| spec.get("template"))
        .and_then(Value::as_object)
        .ok_or_else(|| {
            Error::template(format!(
                "missing spec.template on {} {:?}",
                template_kind,
                template.name_any()
            ))
        })?;

    let mut data = body.clone();
    data.remove("metadata");

    let mut annotations: BTreeMap<String, String> = kcp.annotations().clone();
    annotations.insert(
        CLONED_FROM_NAME_ANNOTATION.to_string(),
        kcp.spec
            .machine_template
            .infrastructure_ref
            .name
            .clone()
            .unwrap_or_default(),
    );
    annotations.insert(
        CLONED_FROM_GROUPKIND_ANNOTATION.to_string(),
        group_kind(&template_api_version, &template_kind),
    );

    let mut labels = kcp.spec.machine_template.metadata.labels.clone();
    labels.insert(CLUSTER_NAME_LABEL.to_string(), cluster.name_any());
    labels.insert(CONTROL_PLANE_LABEL.to_string(), String::new());
    labels.insert(CONTROL_PLANE_NAME_LABEL.to_string(), kcp.name_any());

    Ok(DynamicObject {
        types: Some(TypeMeta {
            api_version: template_api_version,
            kind: template_kind
                .strip_suffix(TEMPLATE_SUFFIX)
                .unwrap_or(&template_kind)
                .to_string(),
        }),
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: kcp.namespace(),
            annotations: Some(annotations),
            labels: Some(labels),
            ..Default::default()
        },
        data: Value::Object(data),
    })
}

/// Object reference pointing at a cloned infrastructure machine
pub fn object_reference_for(object: &DynamicObject) -> ObjectReference {
    ObjectReference {
        api_version: object.types.as_ref().map(|t| t.api_version.clone()),
        kind: object.types.as_ref().map(|t| t.kind.clone()),
        name: object.metadata.name.clone(),
        namespace: object.metadata.namespace.clone(),
    }
}
