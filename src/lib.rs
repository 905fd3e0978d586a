//! k0smotron - Cluster API controller for k0s-based hosted control planes
//!
//! The controller watches `K0sControlPlane` objects and converges the set of
//! control plane machines, bootstrap configurations, PKI secrets, kubeconfigs
//! and tunneling resources toward the declared spec. Version rollouts happen
//! either by machine replacement or in place through k0s autopilot plans.
//!
//! # Modules
//!
//! - [`crd`] - Custom Resource Definitions (`K0sControlPlane`,
//!   `K0sControllerConfig`) and the consumed Cluster API types
//! - [`controller`] - dispatcher reconciliation logic and status publishing
//! - [`config`] - k0s cluster configuration enrichment
//! - [`pki`] - certificate authorities, cluster secrets and kubeconfigs
//! - [`tunneling`] - FRP tunneling resources for unreachable clusters
//! - [`machines`] - the machine planner (scale, replace, roll versions)
//! - [`workload`] - workload cluster API access (etcd members, autopilot)
//! - [`error`] - error types for the controller

#![deny(missing_docs)]

pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod machines;
pub mod pki;
pub mod tunneling;
pub mod workload;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Shared constants
// =============================================================================

/// Field manager used for all server-side apply patches
pub const FIELD_MANAGER: &str = "k0smotron";

/// Label carrying the owning cluster's name
pub const CLUSTER_NAME_LABEL: &str = "cluster.x-k8s.io/cluster-name";

/// Label marking a machine as part of the control plane
pub const CONTROL_PLANE_LABEL: &str = "cluster.x-k8s.io/control-plane";

/// Label carrying the name of the control plane that generated a machine
pub const CONTROL_PLANE_NAME_LABEL: &str = "cluster.x-k8s.io/control-plane-name";

/// Label carrying the role the machine was generated for
pub const GENERATED_ROLE_LABEL: &str = "cluster.x-k8s.io/generateMachine-role";

/// Label set when the control plane nodes also schedule workloads
pub const WORKER_ENABLED_LABEL: &str = "k0smotron.io/control-plane-worker-enabled";

/// Annotation pausing reconciliation of a resource
pub const PAUSED_ANNOTATION: &str = "cluster.x-k8s.io/paused";

/// Annotation recording the template an infra machine was cloned from
pub const CLONED_FROM_NAME_ANNOTATION: &str = "cluster.x-k8s.io/cloned-from-name";

/// Annotation recording the group/kind of the source template
pub const CLONED_FROM_GROUPKIND_ANNOTATION: &str = "cluster.x-k8s.io/cloned-from-groupkind";

/// Annotation stamped on an etcd member when it is marked to leave
pub const MARKED_TO_LEAVE_ANNOTATION: &str = "k0smotron.io/marked-to-leave-at";

/// Annotation instructing a control node to leave the etcd cluster
pub const LEAVE_ANNOTATION: &str = "k0smotron.io/leave";

/// Build metadata suffix appended to machine versions
pub const K0S_VERSION_SUFFIX: &str = "k0s.0";
