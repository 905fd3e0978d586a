//! Controller implementation for the K0sControlPlane CRD
//!
//! The dispatcher in [`control_plane`] runs the reconcile stages in order
//! (enrichment, PKI, tunneling, kubeconfig, machines) and the status writer
//! in [`status`] publishes the derived replica counts and conditions.

mod control_plane;
mod status;

pub use control_plane::{error_policy, reconcile, Context};
pub use status::{compute_status, patch_status};

use kube::api::Api;
use kube::Resource;
use serde::de::DeserializeOwned;

use crate::Result;

/// Get a resource by name, returning `None` on 404.
///
/// Reduces boilerplate for the common pattern of handling resources that
/// may or may not exist yet.
pub async fn get_optional<K>(api: &Api<K>, name: &str) -> Result<Option<K>>
where
    K: Resource + Clone + DeserializeOwned + std::fmt::Debug,
{
    match api.get(name).await {
        Ok(resource) => Ok(Some(resource)),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
        Err(e) => Err(e.into()),
    }
}
