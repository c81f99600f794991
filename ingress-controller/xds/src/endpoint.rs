use crate::{cluster::socket_address, metrics::CacheMetrics, proto, SnapshotCache, ENDPOINT_TYPE_URL};
use ahash::AHashMap as HashMap;
use envoy_types::pb::envoy::config::endpoint::v3::{
    lb_endpoint::HostIdentifier, ClusterLoadAssignment, Endpoint, LbEndpoint, LocalityLbEndpoints,
};
use envoy_types::pb::google::protobuf::Any;
use ingress_controller_core::ResourceId;
use ingress_controller_k8s_api::{EndpointPort, Endpoints};
use parking_lot::RwLock;
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

pub type SharedEndpointCache = Arc<RwLock<EndpointCache>>;

/// Derives cluster load assignments directly from Endpoints objects.
///
/// Each Endpoints object contributes one assignment per port, named
/// `namespace/service/port` after the port's name, or `namespace/service` for
/// the unnamed port of a single-port service. Updating an object only touches the assignments it
/// contributes.
#[derive(Debug)]
pub struct EndpointCache {
    cache: SnapshotCache,
    contributions: HashMap<ResourceId, BTreeSet<String>>,
}

// === impl EndpointCache ===

impl EndpointCache {
    pub fn new(metrics: &CacheMetrics) -> Self {
        Self {
            cache: SnapshotCache::new(
                ENDPOINT_TYPE_URL,
                Some(empty_assignment),
                metrics.family("endpoint"),
            ),
            contributions: HashMap::default(),
        }
    }

    pub fn shared(metrics: &CacheMetrics) -> SharedEndpointCache {
        Arc::new(RwLock::new(Self::new(metrics)))
    }

    pub fn cache(&self) -> &SnapshotCache {
        &self.cache
    }

    fn set(&mut self, id: ResourceId, assignments: BTreeMap<String, Any>) {
        let names = assignments.keys().cloned().collect::<BTreeSet<_>>();
        let previous = if names.is_empty() {
            self.contributions.remove(&id)
        } else {
            self.contributions.insert(id, names)
        };

        self.cache.update(move |resources| {
            for name in previous.iter().flatten() {
                resources.remove(name);
            }
            for (name, assignment) in assignments {
                resources.insert(name, Arc::new(assignment));
            }
        });
    }
}

impl kubert::index::IndexNamespacedResource<Endpoints> for EndpointCache {
    fn apply(&mut self, endpoints: Endpoints) {
        let namespace = endpoints.metadata.namespace.clone().unwrap_or_default();
        let name = endpoints.metadata.name.clone().unwrap_or_default();
        let assignments = assignments(&namespace, &name, &endpoints);
        tracing::trace!(%namespace, %name, assignments = assignments.len(), "Indexing endpoints");
        self.set(ResourceId::new(namespace, name), assignments);
    }

    fn delete(&mut self, namespace: String, name: String) {
        tracing::trace!(%namespace, %name, "Removing endpoints");
        self.set(ResourceId::new(namespace, name), BTreeMap::new());
    }
}

/// The assignment served for a cluster with no endpoints.
pub fn empty_assignment(name: &str) -> Any {
    proto::any(
        ENDPOINT_TYPE_URL,
        &ClusterLoadAssignment {
            cluster_name: name.to_string(),
            ..Default::default()
        },
    )
}

fn port_name(namespace: &str, service: &str, port: &EndpointPort) -> String {
    match port.name.as_deref() {
        Some(name) if !name.is_empty() => format!("{namespace}/{service}/{name}"),
        _ => format!("{namespace}/{service}"),
    }
}

fn assignments(namespace: &str, service: &str, endpoints: &Endpoints) -> BTreeMap<String, Any> {
    let mut addrs = BTreeMap::<String, BTreeSet<(String, u16)>>::new();
    for subset in endpoints.subsets.iter().flatten() {
        for port in subset.ports.iter().flatten() {
            let Ok(port_number) = u16::try_from(port.port) else {
                tracing::debug!(%namespace, %service, port = port.port, "Ignoring invalid port");
                continue;
            };
            let ready = addrs.entry(port_name(namespace, service, port)).or_default();
            // Not-ready addresses are never served.
            for addr in subset.addresses.iter().flatten() {
                ready.insert((addr.ip.clone(), port_number));
            }
        }
    }

    addrs
        .into_iter()
        .map(|(name, addrs)| {
            let lb_endpoints = addrs
                .iter()
                .map(|(ip, port)| LbEndpoint {
                    host_identifier: Some(HostIdentifier::Endpoint(Endpoint {
                        address: Some(socket_address(ip, *port)),
                        ..Default::default()
                    })),
                    ..Default::default()
                })
                .collect::<Vec<_>>();
            let endpoints = if lb_endpoints.is_empty() {
                vec![]
            } else {
                vec![LocalityLbEndpoints {
                    lb_endpoints,
                    ..Default::default()
                }]
            };
            let assignment = ClusterLoadAssignment {
                cluster_name: name.clone(),
                endpoints,
                ..Default::default()
            };
            (name, proto::any(ENDPOINT_TYPE_URL, &assignment))
        })
        .collect()
}
