//! Error types for the k0smotron control plane controller

use thiserror::Error;

/// Main error type for controller operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// A dependency is not ready yet; the reconcile should be requeued
    #[error("not ready: {0}")]
    NotReady(String),

    /// A required object (e.g. a CA secret) does not exist
    #[error("missing dependency: {0}")]
    MissingDependency(String),

    /// Validation error for the control plane spec
    #[error("validation error: {0}")]
    Validation(String),

    /// The infrastructure machine template is malformed
    #[error("template error: {0}")]
    Template(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// PKI operation error
    #[error("pki error: {0}")]
    Pki(#[from] crate::pki::PkiError),
}

impl Error {
    /// Create a not-ready error with the given message
    pub fn not_ready(msg: impl Into<String>) -> Self {
        Self::NotReady(msg.into())
    }

    /// Create a missing-dependency error with the given message
    pub fn missing_dependency(msg: impl Into<String>) -> Self {
        Self::MissingDependency(msg.into())
    }

    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a template error with the given message
    pub fn template(msg: impl Into<String>) -> Self {
        Self::Template(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// True if this error should be handled with a short requeue rather
    /// than surfaced to the runtime's backoff
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::NotReady(_) | Self::MissingDependency(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn helper_constructors_set_the_right_variant() {
        match Error::validation("replicas must be at least 1") {
            Error::Validation(msg) => assert_eq!(msg, "replicas must be at least 1"),
            _ => panic!("expected Validation variant"),
        }
        match Error::not_ready("control plane endpoint is not set") {
            Error::NotReady(msg) => assert!(msg.contains("endpoint")),
            _ => panic!("expected NotReady variant"),
        }
        match Error::missing_dependency("cluster CA secret not found") {
            Error::MissingDependency(msg) => assert!(msg.contains("CA")),
            _ => panic!("expected MissingDependency variant"),
        }
    }

    #[test]
    fn transient_errors_are_requeued_not_escalated() {
        assert!(Error::not_ready("etcd member has not left").is_transient());
        assert!(Error::missing_dependency("secret").is_transient());
        assert!(!Error::validation("bad spec").is_transient());
        assert!(!Error::template("missing spec.template").is_transient());
    }

    #[test]
    fn display_includes_category_and_message() {
        let err = Error::template(
            "missing spec.template on GenericInfrastructureMachineTemplate \"infra-foo\"",
        );
        assert!(err.to_string().starts_with("template error"));
        assert!(err.to_string().contains("infra-foo"));
    }
}
