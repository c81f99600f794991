//! Compiles the object store's contents into a [`RoutingGraph`].
//!
//! A build runs a fixed sequence of processors over a shared [`Context`]:
//!
//! 1. ExtensionServices become clusters that authorization servers reference.
//! 2. Ingresses claim virtual hosts first.
//! 3. HTTPProxies claim the remaining virtual hosts, resolving includes.
//! 4. Listeners are assembled from the claimed virtual hosts.
//!
//! Each processor relies on lookup structures populated by the processors
//! before it. Configuration errors never fail a build; they are recorded in
//! the offending object's [`StatusResult`] and the object contributes nothing.

mod extension_service;
mod httpproxy;
mod ingress;
mod listener;
mod lookup;

use crate::store::Snapshot;
use ahash::AHashMap as HashMap;
use ingress_controller_core::{
    graph::{Authorization, Route, TcpProxy, VirtualHostTls},
    timeout::Timeout,
    Cluster, ConditionType, Listener, ObjectKey, ResourceId, RoutingGraph, Secret, StatusResult,
};
use std::{collections::BTreeMap, time::Duration};

/// Settings that apply to every build.
#[derive(Clone, Debug)]
pub struct Config {
    pub cluster_domain: String,
    pub http_port: u16,
    pub https_port: u16,
    /// The secret served to TLS clients without SNI, for virtual hosts that
    /// opt in.
    pub fallback_certificate: Option<ResourceId>,
    /// When non-empty, root HTTPProxies are only accepted in these namespaces.
    pub root_namespaces: Vec<String>,
    pub disable_permit_insecure: bool,
    pub connect_timeout: Duration,
}

pub struct Builder {
    config: Config,
    processors: Vec<Box<dyn Processor>>,
}

/// The product of a build.
#[derive(Debug, Default)]
pub struct BuildOutput {
    pub graph: RoutingGraph,
    pub statuses: HashMap<ObjectKey, StatusResult>,
}

/// Contributes one kind of configuration to a build.
pub(crate) trait Processor: Send + Sync {
    fn name(&self) -> &'static str;

    fn run(&self, ctx: &mut Context<'_>);
}

/// The graph under construction, shared by all processors in a build.
pub(crate) struct Context<'a> {
    pub(crate) snapshot: &'a Snapshot,
    pub(crate) config: &'a Config,
    pub(crate) statuses: HashMap<ObjectKey, StatusResult>,

    /// The owner of each FQDN, whether or not the owner turned out valid.
    pub(crate) claims: HashMap<String, ObjectKey>,
    /// Valid virtual hosts, by FQDN.
    pub(crate) hosts: BTreeMap<String, Host>,
    /// Valid ExtensionServices, for authorization lookups.
    pub(crate) extensions: HashMap<ResourceId, Extension>,
    /// The fallback certificate's secret name, once a virtual host has
    /// resolved it.
    pub(crate) fallback_secret: Option<String>,

    pub(crate) clusters: BTreeMap<String, Cluster>,
    pub(crate) secrets: BTreeMap<String, Secret>,
    pub(crate) listeners: Vec<Listener>,
}

/// A virtual host that has been claimed and validated.
#[derive(Debug)]
pub(crate) struct Host {
    pub(crate) owner: ObjectKey,
    pub(crate) tls: Option<VirtualHostTls>,
    pub(crate) authorization: Option<Authorization>,
    pub(crate) tcp_proxy: Option<TcpProxy>,
    /// Routes in contribution order; duplicates are resolved on assembly.
    pub(crate) routes: Vec<HostRoute>,
}

#[derive(Clone, Debug)]
pub(crate) struct HostRoute {
    pub(crate) route: Route,
    pub(crate) insecure: Insecure,
}

/// How a route of a secure virtual host is exposed on the plaintext listener.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Insecure {
    Serve,
    Redirect,
    Drop,
}

#[derive(Clone, Debug)]
pub(crate) struct Extension {
    pub(crate) cluster: String,
    pub(crate) response_timeout: Timeout,
}

/// Clusters and secrets that are only added to the graph if the object that
/// references them is valid.
#[derive(Debug, Default)]
pub(crate) struct Resources {
    pub(crate) clusters: Vec<Cluster>,
    pub(crate) secrets: Vec<Secret>,
}

/// A configuration error found while resolving a reference.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Invalid {
    pub(crate) condition: ConditionType,
    pub(crate) reason: &'static str,
    pub(crate) message: String,
}

// === impl Config ===

impl Default for Config {
    fn default() -> Self {
        Self {
            cluster_domain: "cluster.local".to_string(),
            http_port: 8080,
            https_port: 8443,
            fallback_certificate: None,
            root_namespaces: Vec::new(),
            disable_permit_insecure: false,
            connect_timeout: ingress_controller_core::graph::DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

// === impl Builder ===

impl Builder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            processors: vec![
                Box::new(extension_service::ExtensionServiceProcessor),
                Box::new(ingress::IngressProcessor),
                Box::new(httpproxy::HttpProxyProcessor),
                Box::new(listener::ListenerProcessor),
            ],
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn build(&self, snapshot: &Snapshot) -> BuildOutput {
        let mut ctx = Context::new(snapshot, &self.config);
        for processor in &self.processors {
            let _span = tracing::debug_span!("process", processor = processor.name()).entered();
            processor.run(&mut ctx);
        }
        ctx.finish()
    }
}

// === impl Context ===

impl<'a> Context<'a> {
    fn new(snapshot: &'a Snapshot, config: &'a Config) -> Self {
        Self {
            snapshot,
            config,
            statuses: HashMap::default(),
            claims: HashMap::default(),
            hosts: BTreeMap::new(),
            extensions: HashMap::default(),
            fallback_secret: None,
            clusters: BTreeMap::new(),
            secrets: BTreeMap::new(),
            listeners: Vec::new(),
        }
    }

    /// Adds resources referenced by a valid object.
    pub(crate) fn commit(&mut self, resources: Resources) {
        for cluster in resources.clusters {
            self.clusters.entry(cluster.name.clone()).or_insert(cluster);
        }
        for secret in resources.secrets {
            self.secrets.entry(secret.name.clone()).or_insert(secret);
        }
    }

    /// Merges a status into any status already recorded for the object.
    pub(crate) fn record(&mut self, status: StatusResult) {
        match self.statuses.get_mut(&status.key) {
            None => {
                self.statuses.insert(status.key.clone(), status);
            }
            Some(existing) => {
                for e in status.errors {
                    existing.add_error(e.condition_type, e.reason, e.message);
                }
                for w in status.warnings {
                    existing.add_warning(w.condition_type, w.reason, w.message);
                }
            }
        }
    }

    fn finish(self) -> BuildOutput {
        let mut listeners = self.listeners;
        listeners.sort_by(|a, b| a.name.cmp(&b.name));
        BuildOutput {
            graph: RoutingGraph {
                listeners,
                clusters: self.clusters,
                secrets: self.secrets,
            },
            statuses: self.statuses,
        }
    }
}

// === impl Resources ===

impl Resources {
    pub(crate) fn extend(&mut self, other: Resources) {
        self.clusters.extend(other.clusters);
        self.secrets.extend(other.secrets);
    }
}

// === impl Invalid ===

impl Invalid {
    pub(crate) fn new(
        condition: ConditionType,
        reason: &'static str,
        message: impl Into<String>,
    ) -> Self {
        Self {
            condition,
            reason,
            message: message.into(),
        }
    }

    pub(crate) fn record(self, status: &mut StatusResult) {
        status.add_error(self.condition, self.reason, self.message);
    }
}
