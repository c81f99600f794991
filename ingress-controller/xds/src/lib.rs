//! Envoy resource caches
//!
//! Each cache projects one resource family into versioned, immutable
//! snapshots of encoded Envoy v3 resources:
//!
//! - [`ListenerCache`], [`RouteCache`], [`ClusterCache`] and [`SecretCache`]
//!   observe every rebuilt [`RoutingGraph`](ingress_controller_core::RoutingGraph).
//! - [`EndpointCache`] indexes `Endpoints` objects directly, so endpoint churn
//!   never triggers a graph rebuild.
//!
//! The discovery server reads snapshots through [`Caches`] and watches each
//! cache for version changes.

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

mod cluster;
mod endpoint;
mod listener;
mod metrics;
mod proto;
mod route;
mod secret;
mod snapshot;

pub use self::{
    cluster::ClusterCache,
    endpoint::{EndpointCache, SharedEndpointCache},
    listener::ListenerCache,
    metrics::CacheMetrics,
    route::{secure_route_config, RouteCache, FALLBACK_ROUTE_CONFIG},
    secret::SecretCache,
    snapshot::{Placeholder, Snapshot, SnapshotCache},
};
use std::sync::Arc;

pub const LISTENER_TYPE_URL: &str = "type.googleapis.com/envoy.config.listener.v3.Listener";
pub const ROUTE_TYPE_URL: &str = "type.googleapis.com/envoy.config.route.v3.RouteConfiguration";
pub const CLUSTER_TYPE_URL: &str = "type.googleapis.com/envoy.config.cluster.v3.Cluster";
pub const ENDPOINT_TYPE_URL: &str =
    "type.googleapis.com/envoy.config.endpoint.v3.ClusterLoadAssignment";
pub const SECRET_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.transport_sockets.tls.v3.Secret";

/// Every resource cache served by the discovery server.
#[derive(Clone, Debug)]
pub struct Caches {
    pub listeners: ListenerCache,
    pub routes: RouteCache,
    pub clusters: ClusterCache,
    pub secrets: SecretCache,
    pub endpoints: SnapshotCache,
}

// === impl Caches ===

impl Caches {
    /// Builds the graph-driven caches alongside the given endpoint cache,
    /// which is fed by its own index.
    pub fn new(metrics: &CacheMetrics, endpoints: &EndpointCache) -> Self {
        Self {
            listeners: ListenerCache::new(metrics),
            routes: RouteCache::new(metrics),
            clusters: ClusterCache::new(metrics),
            secrets: SecretCache::new(metrics),
            endpoints: endpoints.cache().clone(),
        }
    }

    /// Returns the cache serving `type_url`, if any.
    pub fn cache(&self, type_url: &str) -> Option<&SnapshotCache> {
        match type_url {
            LISTENER_TYPE_URL => Some(self.listeners.cache()),
            ROUTE_TYPE_URL => Some(self.routes.cache()),
            CLUSTER_TYPE_URL => Some(self.clusters.cache()),
            ENDPOINT_TYPE_URL => Some(&self.endpoints),
            SECRET_TYPE_URL => Some(self.secrets.cache()),
            _ => None,
        }
    }

    /// Returns the current snapshot of `type_url` for diagnostics.
    pub fn dump(&self, type_url: &str) -> Option<Arc<Snapshot>> {
        self.cache(type_url).map(SnapshotCache::snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use envoy_types::pb::envoy::config::{
        endpoint::v3::{lb_endpoint::HostIdentifier, ClusterLoadAssignment},
        route::v3::{
            route, route_action::ClusterSpecifier, route_match::PathSpecifier, RouteConfiguration,
        },
    };
    use ingress_controller_core::{
        cluster::UpstreamParams,
        graph::{Forward, HeadersPolicy, PathMatch, Route, RouteAction, WeightedCluster},
        Cluster, ClusterDiscovery, GraphObserver, Listener, ListenerProtocol, RoutingGraph,
        VirtualHost, HTTP_LISTENER_NAME,
    };
    use ingress_controller_k8s_api::{
        EndpointAddress, EndpointPort, EndpointSubset, Endpoints, ObjectMeta,
    };
    use kubert::index::IndexNamespacedResource;
    use pretty_assertions::assert_eq;
    use prost::Message;

    #[test]
    fn unknown_type_urls_are_not_served() {
        let metrics = CacheMetrics::default();
        let caches = Caches::new(&metrics, &EndpointCache::new(&metrics));
        assert!(caches.dump("type.googleapis.com/envoy.config.core.v3.Unknown").is_none());
        for type_url in [
            LISTENER_TYPE_URL,
            ROUTE_TYPE_URL,
            CLUSTER_TYPE_URL,
            ENDPOINT_TYPE_URL,
            SECRET_TYPE_URL,
        ] {
            let snapshot = caches.dump(type_url).expect("family must be served");
            assert_eq!(snapshot.type_url(), type_url);
        }
    }

    /// A service with one ready endpoint, exposed at `/`, produces a route to
    /// its cluster and a single address for that cluster.
    #[test]
    fn service_exposed_end_to_end() {
        let metrics = CacheMetrics::default();
        let mut endpoints = EndpointCache::new(&metrics);
        let caches = Caches::new(&metrics, &endpoints);

        endpoints.apply(Endpoints {
            metadata: ObjectMeta {
                namespace: Some("app".to_string()),
                name: Some("backend".to_string()),
                ..Default::default()
            },
            subsets: Some(vec![EndpointSubset {
                addresses: Some(vec![EndpointAddress {
                    ip: "10.0.0.5".to_string(),
                    ..Default::default()
                }]),
                ports: Some(vec![EndpointPort {
                    port: 80,
                    ..Default::default()
                }]),
                ..Default::default()
            }]),
        });

        let cluster_name = Cluster::service_name("app", "backend", 80, &UpstreamParams::default());
        let mut vhost = VirtualHost::new("x.example.com");
        vhost.routes = vec![Route {
            path: PathMatch::Prefix("/".to_string()),
            headers: vec![],
            action: RouteAction::Forward(Forward {
                clusters: vec![WeightedCluster {
                    name: cluster_name.clone(),
                    weight: 1,
                    request_headers: HeadersPolicy::default(),
                    response_headers: HeadersPolicy::default(),
                }],
                ..Default::default()
            }),
            authorization: None,
        }];
        let mut graph = RoutingGraph {
            listeners: vec![Listener {
                name: HTTP_LISTENER_NAME.to_string(),
                port: 8080,
                protocol: ListenerProtocol::Http,
                virtual_hosts: vec![vhost],
                fallback_certificate: None,
            }],
            ..Default::default()
        };
        graph.clusters.insert(
            cluster_name.clone(),
            Cluster {
                name: cluster_name.clone(),
                discovery: ClusterDiscovery::Eds {
                    service_name: "app/backend".to_string(),
                },
                protocol: Default::default(),
                validation: None,
                sni: None,
                lb_strategy: Default::default(),
                connect_timeout: ingress_controller_core::graph::DEFAULT_CONNECT_TIMEOUT,
            },
        );
        for observer in [
            &caches.secrets as &dyn GraphObserver,
            &caches.clusters,
            &caches.routes,
            &caches.listeners,
        ] {
            observer.on_change(&graph);
        }

        assert_eq!(cluster_name, "app/backend/80");
        assert_eq!(
            caches.clusters.cache().snapshot().names().collect::<Vec<_>>(),
            vec!["app/backend/80"]
        );

        let rc = caches.routes.cache().query(&[HTTP_LISTENER_NAME.to_string()]);
        let rc = RouteConfiguration::decode(&*rc[0].value).expect("route must decode");
        let route = &rc.virtual_hosts[0].routes[0];
        assert_eq!(
            route.r#match.as_ref().and_then(|m| m.path_specifier.clone()),
            Some(PathSpecifier::Prefix("/".to_string()))
        );
        match &route.action {
            Some(route::Action::Route(action)) => assert_eq!(
                action.cluster_specifier,
                Some(ClusterSpecifier::Cluster("app/backend/80".to_string()))
            ),
            other => panic!("unexpected action: {other:?}"),
        }

        let cla = caches.endpoints.query(&["app/backend/80".to_string()]);
        let cla = ClusterLoadAssignment::decode(&*cla[0].value).expect("assignment must decode");
        let lb_endpoints = cla
            .endpoints
            .iter()
            .flat_map(|l| l.lb_endpoints.iter())
            .collect::<Vec<_>>();
        assert_eq!(lb_endpoints.len(), 1);
        match &lb_endpoints[0].host_identifier {
            Some(HostIdentifier::Endpoint(e)) => {
                assert_eq!(e.address, Some(cluster::socket_address("10.0.0.5", 80)))
            }
            other => panic!("unexpected host: {other:?}"),
        }
    }
}
