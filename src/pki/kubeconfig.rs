//! Kubeconfig rendering for hosted clusters
//!
//! Produces the admin kubeconfig stored in the `<cluster>-kubeconfig`
//! secret and its tunneling variants. The client credential is a fresh
//! certificate signed by the cluster CA with `system:masters` membership.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

use super::{CertificateAuthority, PkiError};

/// A rendered kubeconfig document
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Kubeconfig {
    /// Always `v1`
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    /// Always `Config`
    pub kind: String,
    /// Cluster entries
    pub clusters: Vec<NamedCluster>,
    /// Context entries
    pub contexts: Vec<NamedContext>,
    /// Name of the active context
    #[serde(rename = "current-context")]
    pub current_context: String,
    /// User entries
    pub users: Vec<NamedUser>,
}

/// A named cluster entry
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct NamedCluster {
    /// Entry name
    pub name: String,
    /// Cluster connection details
    pub cluster: ClusterEntry,
}

/// Connection details for one cluster
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ClusterEntry {
    /// Base64-encoded CA certificate
    #[serde(rename = "certificate-authority-data")]
    pub certificate_authority_data: String,
    /// API server URL
    pub server: String,
    /// Optional HTTP proxy the client dials through
    #[serde(rename = "proxy-url", default, skip_serializing_if = "Option::is_none")]
    pub proxy_url: Option<String>,
}

/// A named context entry
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct NamedContext {
    /// Entry name
    pub name: String,
    /// Cluster/user pairing
    pub context: ContextEntry,
}

/// Cluster/user pairing for one context
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ContextEntry {
    /// Cluster entry name
    pub cluster: String,
    /// User entry name
    pub user: String,
}

/// A named user entry
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct NamedUser {
    /// Entry name
    pub name: String,
    /// Client credentials
    pub user: UserEntry,
}

/// Client certificate credentials
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct UserEntry {
    /// Base64-encoded client certificate
    #[serde(rename = "client-certificate-data")]
    pub client_certificate_data: String,
    /// Base64-encoded client key
    #[serde(rename = "client-key-data")]
    pub client_key_data: String,
}

impl Kubeconfig {
    /// Generate an admin kubeconfig for `cluster_name`, pointing clients at
    /// `server` and signing the credential with the cluster CA
    pub fn generate(
        cluster_name: &str,
        server: &str,
        ca: &CertificateAuthority,
        proxy_url: Option<String>,
    ) -> std::result::Result<Self, PkiError> {
        let issued = ca.issue_client_certificate("kubernetes-admin", "system:masters")?;

        let user_name = format!("{cluster_name}-admin");
        let context_name = format!("{user_name}@{cluster_name}");

        Ok(Self {
            api_version: "v1".to_string(),
            kind: "Config".to_string(),
            clusters: vec![NamedCluster {
                name: cluster_name.to_string(),
                cluster: ClusterEntry {
                    certificate_authority_data: BASE64.encode(ca.ca_cert_pem()),
                    server: server.to_string(),
                    proxy_url,
                },
            }],
            contexts: vec![NamedContext {
                name: context_name.clone(),
                context: ContextEntry {
                    cluster: cluster_name.to_string(),
                    user: user_name.clone(),
                },
            }],
            current_context: context_name,
            users: vec![NamedUser {
                name: user_name,
                user: UserEntry {
                    client_certificate_data: BASE64.encode(&issued.cert_pem),
                    client_key_data: BASE64.encode(&issued.key_pem),
                },
            }],
        })
    }

    /// Render the document as YAML
    pub fn to_yaml(&self) -> std::result::Result<String, PkiError> {
        serde_yaml::to_string(self).map_err(|e| PkiError::Serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_ca() -> CertificateAuthority {
        CertificateAuthority::new("kubernetes").unwrap()
    }

    #[test]
    fn direct_kubeconfig_points_at_the_endpoint() {
        let ca = test_ca();
        let kc = Kubeconfig::generate("test", "https://test.endpoint:6443", &ca, None).unwrap();

        assert_eq!(kc.clusters.len(), 1);
        assert_eq!(kc.clusters[0].cluster.server, "https://test.endpoint:6443");
        assert_eq!(kc.clusters[0].cluster.proxy_url, None);
        assert_eq!(kc.current_context, "test-admin@test");

        let ca_pem = BASE64
            .decode(&kc.clusters[0].cluster.certificate_authority_data)
            .unwrap();
        assert!(String::from_utf8(ca_pem).unwrap().contains("BEGIN CERTIFICATE"));
    }

    #[test]
    fn proxied_kubeconfig_keeps_the_real_server_and_adds_a_proxy() {
        let ca = test_ca();
        let kc = Kubeconfig::generate(
            "test",
            "https://test.endpoint:6443",
            &ca,
            Some("http://test.com:9999".to_string()),
        )
        .unwrap();

        for cluster in &kc.clusters {
            assert_eq!(cluster.cluster.server, "https://test.endpoint:6443");
            assert_eq!(cluster.cluster.proxy_url.as_deref(), Some("http://test.com:9999"));
        }
    }

    #[test]
    fn tunneled_kubeconfig_points_at_the_tunnel() {
        let ca = test_ca();
        let kc = Kubeconfig::generate("test", "https://test.com:9999", &ca, None).unwrap();

        for cluster in &kc.clusters {
            assert_eq!(cluster.cluster.server, "https://test.com:9999");
            assert!(cluster.cluster.proxy_url.is_none());
        }
    }

    #[test]
    fn rendered_yaml_round_trips() {
        let ca = test_ca();
        let kc = Kubeconfig::generate(
            "test",
            "https://test.endpoint:6443",
            &ca,
            Some("http://test.com:9999".to_string()),
        )
        .unwrap();

        let yaml = kc.to_yaml().unwrap();
        assert!(yaml.contains("proxy-url: http://test.com:9999"));
        assert!(yaml.contains("current-context: test-admin@test"));

        let parsed: Kubeconfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed, kc);
    }

    #[test]
    fn proxy_url_is_omitted_entirely_when_unset() {
        let ca = test_ca();
        let yaml = Kubeconfig::generate("test", "https://test.endpoint:6443", &ca, None)
            .unwrap()
            .to_yaml()
            .unwrap();
        assert!(!yaml.contains("proxy-url"));
    }

    #[test]
    fn client_credentials_decode_to_pem() {
        let ca = test_ca();
        let kc = Kubeconfig::generate("test", "https://test.endpoint:6443", &ca, None).unwrap();

        let cert = BASE64
            .decode(&kc.users[0].user.client_certificate_data)
            .unwrap();
        let key = BASE64.decode(&kc.users[0].user.client_key_data).unwrap();

        assert!(String::from_utf8(cert).unwrap().contains("BEGIN CERTIFICATE"));
        assert!(String::from_utf8(key).unwrap().contains("PRIVATE KEY"));
    }
}
