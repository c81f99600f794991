//! Ingress controller core model
//!
//! This crate holds the data types shared by the controller's index, xDS
//! caches, and status publisher:
//!
//! - [`RoutingGraph`] is the immutable product of a graph build: listeners own
//!   virtual hosts keyed by FQDN, virtual hosts own ordered routes, and routes
//!   reference deduplicated [`Cluster`]s and [`Secret`]s by name.
//! - [`StatusResult`] records whether a root configuration object produced
//!   valid configuration, and why not.
//! - [`Leadership`] tells long-running loops whether this instance is allowed
//!   to publish.
//!
//! Nothing in this crate talks to Kubernetes or Envoy directly.

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod cluster;
pub mod graph;
mod key;
pub mod leadership;
pub mod path_rewrite;
pub mod status;
pub mod timeout;

pub use self::{
    cluster::{Cluster, ClusterDiscovery, LoadBalancerStrategy, UpstreamProtocol, UpstreamValidation},
    graph::{
        GraphObserver, Listener, ListenerProtocol, RoutingGraph, Secret, SecretData, VirtualHost,
        HTTPS_LISTENER_NAME, HTTP_LISTENER_NAME,
    },
    key::{ObjectKey, ObjectKind, ResourceId},
    leadership::Leadership,
    status::{ConditionType, CurrentStatus, StatusResult, StatusSink, SubCondition},
};
