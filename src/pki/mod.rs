//! PKI operations for hosted control planes
//!
//! The controller acts as the certificate authority factory for every hosted
//! cluster: it generates the cluster, etcd and front-proxy CAs plus the
//! service account signing key, stores them as Cluster API style secrets,
//! and signs the admin client certificates embedded in kubeconfigs.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, ResourceExt};
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue, IsCa, Issuer,
    KeyPair, KeyUsagePurpose,
};
use thiserror::Error;
use tracing::info;

use crate::controller::get_optional;
use crate::crd::{controller_reference, Cluster, K0sControlPlane, TunnelingMode};
use crate::{Error as ControllerError, Result, CLUSTER_NAME_LABEL, FIELD_MANAGER};

pub mod kubeconfig;

/// Data key for certificates in PKI secrets
pub const TLS_CERT_KEY: &str = "tls.crt";
/// Data key for private keys in PKI secrets
pub const TLS_KEY_KEY: &str = "tls.key";
/// Data key for the rendered kubeconfig in kubeconfig secrets
pub const KUBECONFIG_DATA_KEY: &str = "value";
/// Secret type used for Cluster API cluster secrets
const CLUSTER_SECRET_TYPE: &str = "cluster.x-k8s.io/secret";

/// PKI errors
#[derive(Debug, Error)]
pub enum PkiError {
    /// Key generation failed
    #[error("key generation failed: {0}")]
    KeyGenerationFailed(String),

    /// Certificate generation failed
    #[error("certificate generation failed: {0}")]
    CertificateGenerationFailed(String),

    /// Certificate or key parsing error
    #[error("certificate parsing error: {0}")]
    ParseError(String),

    /// Kubeconfig rendering error
    #[error("kubeconfig serialization error: {0}")]
    Serialization(String),
}

/// The per-cluster secrets the PKI stage owns
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CertificatePurpose {
    /// Cluster certificate authority
    ClusterCa,
    /// Etcd certificate authority
    EtcdCa,
    /// Front-proxy certificate authority
    FrontProxyCa,
    /// Service account token signing key
    ServiceAccount,
}

impl CertificatePurpose {
    /// All purposes ensured on every reconcile
    pub const ALL: [CertificatePurpose; 4] = [
        CertificatePurpose::ClusterCa,
        CertificatePurpose::EtcdCa,
        CertificatePurpose::FrontProxyCa,
        CertificatePurpose::ServiceAccount,
    ];

    /// Name of the secret holding this purpose for the given cluster
    pub fn secret_name(&self, cluster_name: &str) -> String {
        let suffix = match self {
            CertificatePurpose::ClusterCa => "ca",
            CertificatePurpose::EtcdCa => "etcd",
            CertificatePurpose::FrontProxyCa => "proxy",
            CertificatePurpose::ServiceAccount => "sa",
        };
        format!("{cluster_name}-{suffix}")
    }

    fn common_name(&self) -> &'static str {
        match self {
            CertificatePurpose::ClusterCa => "kubernetes",
            CertificatePurpose::EtcdCa => "etcd-ca",
            CertificatePurpose::FrontProxyCa => "front-proxy-ca",
            CertificatePurpose::ServiceAccount => "service-accounts",
        }
    }
}

/// Certificate authority for one purpose of one hosted cluster
pub struct CertificateAuthority {
    /// CA key pair serialized as PEM (deserialized per use, KeyPair is not Clone)
    ca_key_pem: String,
    /// PEM-encoded CA certificate
    ca_cert_pem: String,
}

impl CertificateAuthority {
    /// Create a new self-signed CA
    pub fn new(common_name: &str) -> std::result::Result<Self, PkiError> {
        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        dn.push(
            DnType::CommonName,
            DnValue::Utf8String(common_name.to_string()),
        );
        params.distinguished_name = dn;

        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        // 10 year validity
        params.not_before = rcgen::date_time_ymd(2024, 1, 1);
        params.not_after = rcgen::date_time_ymd(2034, 1, 1);

        let key_pair = KeyPair::generate().map_err(|e| {
            PkiError::KeyGenerationFailed(format!("failed to generate CA key: {}", e))
        })?;

        let ca_key_pem = key_pair.serialize_pem();

        let cert = params.self_signed(&key_pair).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to create CA cert: {}", e))
        })?;

        Ok(Self {
            ca_key_pem,
            ca_cert_pem: cert.pem(),
        })
    }

    /// Load a CA from PEM data
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> std::result::Result<Self, PkiError> {
        let _ = KeyPair::from_pem(key_pem)
            .map_err(|e| PkiError::ParseError(format!("failed to parse CA key: {}", e)))?;
        if !cert_pem.contains("BEGIN CERTIFICATE") {
            return Err(PkiError::ParseError(
                "CA certificate is not PEM encoded".to_string(),
            ));
        }

        Ok(Self {
            ca_key_pem: key_pem.to_string(),
            ca_cert_pem: cert_pem.to_string(),
        })
    }

    /// The CA certificate in PEM format
    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    /// The CA private key in PEM format
    pub fn ca_key_pem(&self) -> &str {
        &self.ca_key_pem
    }

    fn load_key_pair(&self) -> std::result::Result<KeyPair, PkiError> {
        KeyPair::from_pem(&self.ca_key_pem)
            .map_err(|e| PkiError::ParseError(format!("failed to load CA key: {}", e)))
    }

    /// Issue a client certificate signed by this CA
    pub fn issue_client_certificate(
        &self,
        common_name: &str,
        organization: &str,
    ) -> std::result::Result<IssuedCertificate, PkiError> {
        let key_pair = KeyPair::generate().map_err(|e| {
            PkiError::KeyGenerationFailed(format!("failed to generate client key: {}", e))
        })?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(
            DnType::CommonName,
            DnValue::Utf8String(common_name.to_string()),
        );
        dn.push(
            DnType::OrganizationName,
            DnValue::Utf8String(organization.to_string()),
        );
        params.distinguished_name = dn;

        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![rcgen::ExtendedKeyUsagePurpose::ClientAuth];

        params.not_before = rcgen::date_time_ymd(2024, 1, 1);
        params.not_after = rcgen::date_time_ymd(2034, 1, 1);

        let ca_key = self.load_key_pair()?;
        let issuer = Issuer::from_ca_cert_pem(&self.ca_cert_pem, &ca_key)
            .map_err(|e| PkiError::ParseError(format!("failed to create issuer: {}", e)))?;

        let cert = params.signed_by(&key_pair, &issuer).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!(
                "failed to sign client certificate: {}",
                e
            ))
        })?;

        Ok(IssuedCertificate {
            cert_pem: cert.pem(),
            key_pem: key_pair.serialize_pem(),
        })
    }
}

/// A signed end-entity certificate with its private key
pub struct IssuedCertificate {
    /// Certificate in PEM format
    pub cert_pem: String,
    /// Private key in PEM format
    pub key_pem: String,
}

/// A raw signing key pair (service account tokens)
pub struct SigningKeyPair {
    /// Private key in PEM format
    pub private_key_pem: String,
    /// Public key in PEM format
    pub public_key_pem: String,
}

impl SigningKeyPair {
    /// Generate a fresh signing key pair
    pub fn generate() -> std::result::Result<Self, PkiError> {
        let key_pair = KeyPair::generate().map_err(|e| {
            PkiError::KeyGenerationFailed(format!("failed to generate signing key: {}", e))
        })?;
        Ok(Self {
            private_key_pem: key_pair.serialize_pem(),
            public_key_pem: key_pair.public_key_pem(),
        })
    }
}

/// Build a cluster secret labeled and controller-owned the Cluster API way
pub fn cluster_secret(
    cluster: &Cluster,
    kcp: &K0sControlPlane,
    name: &str,
    data: BTreeMap<String, ByteString>,
) -> Secret {
    Secret {
        metadata: kube::core::ObjectMeta {
            name: Some(name.to_string()),
            namespace: cluster.namespace(),
            labels: Some(BTreeMap::from([(
                CLUSTER_NAME_LABEL.to_string(),
                cluster.name_any(),
            )])),
            owner_references: Some(vec![controller_reference(kcp)]),
            ..Default::default()
        },
        type_: Some(CLUSTER_SECRET_TYPE.to_string()),
        data: Some(data),
        ..Default::default()
    }
}

fn certificate_data(purpose: CertificatePurpose) -> std::result::Result<BTreeMap<String, ByteString>, PkiError> {
    let mut data = BTreeMap::new();
    match purpose {
        CertificatePurpose::ServiceAccount => {
            let keys = SigningKeyPair::generate()?;
            data.insert(
                TLS_CERT_KEY.to_string(),
                ByteString(keys.public_key_pem.into_bytes()),
            );
            data.insert(
                TLS_KEY_KEY.to_string(),
                ByteString(keys.private_key_pem.into_bytes()),
            );
        }
        _ => {
            let ca = CertificateAuthority::new(purpose.common_name())?;
            data.insert(
                TLS_CERT_KEY.to_string(),
                ByteString(ca.ca_cert_pem().as_bytes().to_vec()),
            );
            data.insert(
                TLS_KEY_KEY.to_string(),
                ByteString(ca.ca_key_pem().as_bytes().to_vec()),
            );
        }
    }
    Ok(data)
}

/// Ensure the cluster certificate secrets exist, generating any that are
/// missing. Existing secrets are left untouched.
pub async fn ensure_certificates(
    client: &Client,
    cluster: &Cluster,
    kcp: &K0sControlPlane,
) -> Result<()> {
    let namespace = cluster.namespace().unwrap_or_default();
    let secrets: Api<Secret> = Api::namespaced(client.clone(), &namespace);

    for purpose in CertificatePurpose::ALL {
        let name = purpose.secret_name(&cluster.name_any());
        if get_optional(&secrets, &name).await?.is_some() {
            continue;
        }

        let secret = cluster_secret(cluster, kcp, &name, certificate_data(purpose)?);
        secrets
            .patch(
                &name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&secret),
            )
            .await?;
        info!(secret = %name, "generated cluster certificate secret");
    }

    Ok(())
}

/// Load the cluster CA from its secret
pub async fn load_cluster_ca(client: &Client, cluster: &Cluster) -> Result<CertificateAuthority> {
    let namespace = cluster.namespace().unwrap_or_default();
    let name = CertificatePurpose::ClusterCa.secret_name(&cluster.name_any());
    let secrets: Api<Secret> = Api::namespaced(client.clone(), &namespace);

    let secret = get_optional(&secrets, &name)
        .await?
        .ok_or_else(|| ControllerError::missing_dependency(format!("cluster CA secret {name} not found")))?;

    let data = secret.data.unwrap_or_default();
    let cert = data
        .get(TLS_CERT_KEY)
        .map(|b| String::from_utf8_lossy(&b.0).into_owned())
        .ok_or_else(|| ControllerError::missing_dependency(format!("{name} has no {TLS_CERT_KEY}")))?;
    let key = data
        .get(TLS_KEY_KEY)
        .map(|b| String::from_utf8_lossy(&b.0).into_owned())
        .ok_or_else(|| ControllerError::missing_dependency(format!("{name} has no {TLS_KEY_KEY}")))?;

    Ok(CertificateAuthority::from_pem(&cert, &key)?)
}

/// Ensure the kubeconfig secrets for the cluster exist.
///
/// With tunneling enabled a `-proxied` or `-tunneled` variant is published
/// in addition to the canonical `<cluster>-kubeconfig`. When a variant has
/// to be created, the pass still ends in a retriable error after the write;
/// the canonical pipeline resumes on the next reconcile, once the variant
/// is visible through the cache.
pub async fn reconcile_kubeconfig(
    client: &Client,
    cluster: &Cluster,
    kcp: &K0sControlPlane,
) -> Result<()> {
    let endpoint = cluster
        .endpoint()
        .ok_or_else(|| ControllerError::not_ready("control plane endpoint is not set"))?;

    let namespace = cluster.namespace().unwrap_or_default();
    let cluster_name = cluster.name_any();
    let secrets: Api<Secret> = Api::namespaced(client.clone(), &namespace);

    let tunneling = &kcp.spec.k0s_config_spec.tunneling;
    if tunneling.enabled {
        let (variant_name, server, proxy_url) = match tunneling.mode {
            TunnelingMode::Proxy => (
                format!("{cluster_name}-proxied-kubeconfig"),
                format!("https://{}:{}", endpoint.host, endpoint.port),
                Some(format!(
                    "http://{}:{}",
                    tunneling.server_address, tunneling.tunneling_node_port
                )),
            ),
            TunnelingMode::Tunnel => (
                format!("{cluster_name}-tunneled-kubeconfig"),
                format!(
                    "https://{}:{}",
                    tunneling.server_address, tunneling.tunneling_node_port
                ),
                None,
            ),
        };

        if get_optional(&secrets, &variant_name).await?.is_none() {
            let ca = load_cluster_ca(client, cluster).await?;
            let rendered =
                kubeconfig::Kubeconfig::generate(&cluster_name, &server, &ca, proxy_url)?
                    .to_yaml()?;
            let secret = cluster_secret(
                cluster,
                kcp,
                &variant_name,
                BTreeMap::from([(
                    KUBECONFIG_DATA_KEY.to_string(),
                    ByteString(rendered.into_bytes()),
                )]),
            );
            secrets
                .patch(
                    &variant_name,
                    &PatchParams::apply(FIELD_MANAGER).force(),
                    &Patch::Apply(&secret),
                )
                .await?;
            info!(secret = %variant_name, "published tunneling kubeconfig variant");
            return Err(ControllerError::not_ready(format!(
                "kubeconfig secret {variant_name} not found"
            )));
        }
    }

    let canonical = format!("{cluster_name}-kubeconfig");
    if get_optional(&secrets, &canonical).await?.is_none() {
        let ca = load_cluster_ca(client, cluster).await?;
        let server = format!("https://{}:{}", endpoint.host, endpoint.port);
        let rendered = kubeconfig::Kubeconfig::generate(&cluster_name, &server, &ca, None)?
            .to_yaml()?;
        let secret = cluster_secret(
            cluster,
            kcp,
            &canonical,
            BTreeMap::from([(
                KUBECONFIG_DATA_KEY.to_string(),
                ByteString(rendered.into_bytes()),
            )]),
        );
        secrets
            .patch(
                &canonical,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&secret),
            )
            .await?;
        info!(secret = %canonical, "published cluster kubeconfig");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{ClusterSpec, K0sControlPlaneSpec};
    use x509_parser::prelude::*;

    fn parse_pem_block(pem_data: &str) -> Vec<u8> {
        ::pem::parse(pem_data.as_bytes()).unwrap().contents().to_vec()
    }

    #[test]
    fn ca_can_be_created_and_reloaded() {
        let ca = CertificateAuthority::new("kubernetes").unwrap();
        assert!(ca.ca_cert_pem().contains("BEGIN CERTIFICATE"));
        assert!(ca.ca_key_pem().contains("PRIVATE KEY"));

        let reloaded =
            CertificateAuthority::from_pem(ca.ca_cert_pem(), ca.ca_key_pem()).unwrap();
        assert_eq!(reloaded.ca_cert_pem(), ca.ca_cert_pem());
    }

    #[test]
    fn corrupted_ca_material_is_rejected() {
        let ca = CertificateAuthority::new("kubernetes").unwrap();

        assert!(CertificateAuthority::from_pem(ca.ca_cert_pem(), "garbage").is_err());
        assert!(CertificateAuthority::from_pem("garbage", ca.ca_key_pem()).is_err());
    }

    #[test]
    fn issued_client_cert_is_signed_by_the_ca() {
        let ca = CertificateAuthority::new("kubernetes").unwrap();
        let issued = ca
            .issue_client_certificate("kubernetes-admin", "system:masters")
            .unwrap();

        assert!(issued.cert_pem.contains("BEGIN CERTIFICATE"));
        assert!(issued.key_pem.contains("PRIVATE KEY"));

        let cert_der = parse_pem_block(&issued.cert_pem);
        let (_, cert) = X509Certificate::from_der(&cert_der).unwrap();

        let ca_der = parse_pem_block(ca.ca_cert_pem());
        let (_, ca_cert) = X509Certificate::from_der(&ca_der).unwrap();

        cert.verify_signature(Some(ca_cert.public_key())).unwrap();

        let cn = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .unwrap();
        assert_eq!(cn, "kubernetes-admin");
    }

    #[test]
    fn certs_from_a_different_ca_fail_verification() {
        let ca1 = CertificateAuthority::new("kubernetes").unwrap();
        let ca2 = CertificateAuthority::new("kubernetes").unwrap();

        let issued = ca1
            .issue_client_certificate("kubernetes-admin", "system:masters")
            .unwrap();
        let cert_der = parse_pem_block(&issued.cert_pem);
        let (_, cert) = X509Certificate::from_der(&cert_der).unwrap();

        let ca2_der = parse_pem_block(ca2.ca_cert_pem());
        let (_, ca2_cert) = X509Certificate::from_der(&ca2_der).unwrap();

        assert!(cert.verify_signature(Some(ca2_cert.public_key())).is_err());
    }

    #[test]
    fn signing_key_pair_exposes_both_halves() {
        let keys = SigningKeyPair::generate().unwrap();
        assert!(keys.private_key_pem.contains("PRIVATE KEY"));
        assert!(keys.public_key_pem.contains("PUBLIC KEY"));
        assert!(!keys.public_key_pem.contains("PRIVATE"));
    }

    #[test]
    fn purpose_secret_names_follow_the_cluster_api_convention() {
        assert_eq!(
            CertificatePurpose::ClusterCa.secret_name("my-cluster"),
            "my-cluster-ca"
        );
        assert_eq!(
            CertificatePurpose::EtcdCa.secret_name("my-cluster"),
            "my-cluster-etcd"
        );
        assert_eq!(
            CertificatePurpose::FrontProxyCa.secret_name("my-cluster"),
            "my-cluster-proxy"
        );
        assert_eq!(
            CertificatePurpose::ServiceAccount.secret_name("my-cluster"),
            "my-cluster-sa"
        );
    }

    #[test]
    fn cluster_secrets_are_labeled_and_owned_by_the_control_plane() {
        let mut cluster = Cluster::new("test", ClusterSpec::default());
        cluster.metadata.namespace = Some("default".into());

        let mut kcp = K0sControlPlane::new("test", K0sControlPlaneSpec::default_for_tests());
        kcp.metadata.uid = Some("uid-1".into());

        let secret = cluster_secret(
            &cluster,
            &kcp,
            "test-ca",
            BTreeMap::from([(TLS_CERT_KEY.to_string(), ByteString(b"cert".to_vec()))]),
        );

        assert_eq!(secret.metadata.name.as_deref(), Some("test-ca"));
        assert_eq!(secret.metadata.namespace.as_deref(), Some("default"));
        assert_eq!(
            secret.metadata.labels.as_ref().unwrap()[CLUSTER_NAME_LABEL],
            "test"
        );
        let owner = &secret.metadata.owner_references.as_ref().unwrap()[0];
        assert_eq!(owner.kind, "K0sControlPlane");
        assert_eq!(owner.controller, Some(true));
    }

    #[test]
    fn certificate_data_for_service_account_is_a_key_pair() {
        let data = certificate_data(CertificatePurpose::ServiceAccount).unwrap();
        let cert = String::from_utf8(data[TLS_CERT_KEY].0.clone()).unwrap();
        let key = String::from_utf8(data[TLS_KEY_KEY].0.clone()).unwrap();

        assert!(cert.contains("PUBLIC KEY"));
        assert!(key.contains("PRIVATE KEY"));
    }
}
