use crate::{metrics::CacheMetrics, proto, SnapshotCache, CLUSTER_TYPE_URL};
use envoy_types::pb::{
    envoy::{
        config::{
            cluster::v3::{
                cluster::{ClusterDiscoveryType, DiscoveryType, EdsClusterConfig, LbPolicy},
                Cluster,
            },
            core::v3::{
                address, socket_address::PortSpecifier, transport_socket, Address,
                Http2ProtocolOptions, SocketAddress, TransportSocket,
            },
            endpoint::v3::{
                lb_endpoint::HostIdentifier, ClusterLoadAssignment, Endpoint, LbEndpoint,
                LocalityLbEndpoints,
            },
        },
        extensions::{
            transport_sockets::tls::v3::{
                common_tls_context::{CombinedCertificateValidationContext, ValidationContextType},
                subject_alt_name_matcher::SanType,
                CertificateValidationContext, CommonTlsContext, SubjectAltNameMatcher,
                UpstreamTlsContext,
            },
            upstreams::http::v3::{
                http_protocol_options::{
                    explicit_http_config::ProtocolConfig, ExplicitHttpConfig,
                    UpstreamProtocolOptions,
                },
                HttpProtocolOptions,
            },
        },
        r#type::matcher::v3::{string_matcher::MatchPattern, StringMatcher},
    },
    google::protobuf::UInt32Value,
};
use ingress_controller_core::{
    cluster::DnsTarget, Cluster as GraphCluster, ClusterDiscovery, GraphObserver,
    LoadBalancerStrategy, RoutingGraph, UpstreamProtocol, UpstreamValidation,
};
use std::collections::HashMap;

const HTTP_PROTOCOL_OPTIONS: &str = "envoy.extensions.upstreams.http.v3.HttpProtocolOptions";
const HTTP_PROTOCOL_OPTIONS_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.upstreams.http.v3.HttpProtocolOptions";
const UPSTREAM_TLS_CONTEXT_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.transport_sockets.tls.v3.UpstreamTlsContext";

/// Serves an Envoy cluster for every cluster in the routing graph.
#[derive(Clone, Debug)]
pub struct ClusterCache(SnapshotCache);

impl ClusterCache {
    pub fn new(metrics: &CacheMetrics) -> Self {
        Self(SnapshotCache::new(
            CLUSTER_TYPE_URL,
            None,
            metrics.family("cluster"),
        ))
    }

    pub fn cache(&self) -> &SnapshotCache {
        &self.0
    }
}

impl GraphObserver for ClusterCache {
    fn on_change(&self, graph: &RoutingGraph) {
        let clusters = graph
            .clusters
            .values()
            .map(|c| (c.name.clone(), proto::any(CLUSTER_TYPE_URL, &cluster(c))))
            .collect();
        self.0.replace(clusters);
    }
}

pub(crate) fn cluster(c: &GraphCluster) -> Cluster {
    let mut cluster = Cluster {
        name: c.name.clone(),
        connect_timeout: Some(proto::duration(c.connect_timeout)),
        lb_policy: lb_policy(c.lb_strategy) as i32,
        ..Default::default()
    };

    match &c.discovery {
        ClusterDiscovery::Eds { service_name } => {
            cluster.cluster_discovery_type =
                Some(ClusterDiscoveryType::Type(DiscoveryType::Eds as i32));
            cluster.eds_cluster_config = Some(EdsClusterConfig {
                eds_config: Some(proto::ads()),
                service_name: service_name.clone(),
            });
        }
        ClusterDiscovery::StrictDns { targets } => {
            cluster.cluster_discovery_type =
                Some(ClusterDiscoveryType::Type(DiscoveryType::StrictDns as i32));
            cluster.load_assignment = Some(dns_assignment(&c.name, targets));
        }
    }

    if c.protocol.is_http2() {
        cluster.typed_extension_protocol_options = http2_protocol_options();
    }

    if c.protocol.is_tls() {
        let tls = upstream_tls(c.protocol, c.validation.as_ref(), c.sni.as_deref());
        cluster.transport_socket = Some(TransportSocket {
            name: "envoy.transport_sockets.tls".to_string(),
            config_type: Some(transport_socket::ConfigType::TypedConfig(proto::any(
                UPSTREAM_TLS_CONTEXT_TYPE_URL,
                &tls,
            ))),
        });
    }

    cluster
}

fn lb_policy(strategy: LoadBalancerStrategy) -> LbPolicy {
    match strategy {
        LoadBalancerStrategy::RoundRobin => LbPolicy::RoundRobin,
        LoadBalancerStrategy::WeightedLeastRequest => LbPolicy::LeastRequest,
        LoadBalancerStrategy::Random => LbPolicy::Random,
        // Cookie affinity hashes on the session cookie set by the route.
        LoadBalancerStrategy::Cookie => LbPolicy::RingHash,
    }
}

fn dns_assignment(name: &str, targets: &[DnsTarget]) -> ClusterLoadAssignment {
    let lb_endpoints = targets
        .iter()
        .map(|t| LbEndpoint {
            host_identifier: Some(HostIdentifier::Endpoint(Endpoint {
                address: Some(socket_address(&t.host, t.port)),
                ..Default::default()
            })),
            load_balancing_weight: (t.weight > 0).then_some(UInt32Value { value: t.weight }),
            ..Default::default()
        })
        .collect();

    ClusterLoadAssignment {
        cluster_name: name.to_string(),
        endpoints: vec![LocalityLbEndpoints {
            lb_endpoints,
            ..Default::default()
        }],
        ..Default::default()
    }
}

pub(crate) fn socket_address(host: &str, port: u16) -> Address {
    Address {
        address: Some(address::Address::SocketAddress(SocketAddress {
            address: host.to_string(),
            port_specifier: Some(PortSpecifier::PortValue(port.into())),
            ..Default::default()
        })),
    }
}

fn http2_protocol_options() -> HashMap<String, envoy_types::pb::google::protobuf::Any> {
    let options = HttpProtocolOptions {
        upstream_protocol_options: Some(UpstreamProtocolOptions::ExplicitHttpConfig(
            ExplicitHttpConfig {
                protocol_config: Some(ProtocolConfig::Http2ProtocolOptions(
                    Http2ProtocolOptions::default(),
                )),
            },
        )),
        ..Default::default()
    };
    let mut map = HashMap::new();
    map.insert(
        HTTP_PROTOCOL_OPTIONS.to_string(),
        proto::any(HTTP_PROTOCOL_OPTIONS_TYPE_URL, &options),
    );
    map
}

fn upstream_tls(
    protocol: UpstreamProtocol,
    validation: Option<&UpstreamValidation>,
    sni: Option<&str>,
) -> UpstreamTlsContext {
    let validation_context_type = validation.map(|v| {
        ValidationContextType::CombinedValidationContext(CombinedCertificateValidationContext {
            default_validation_context: Some(CertificateValidationContext {
                match_typed_subject_alt_names: vec![SubjectAltNameMatcher {
                    san_type: SanType::Dns as i32,
                    matcher: Some(StringMatcher {
                        match_pattern: Some(MatchPattern::Exact(v.subject_name.clone())),
                        ignore_case: false,
                    }),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            validation_context_sds_secret_config: Some(proto::sds(&v.ca_secret)),
            ..Default::default()
        })
    });

    let alpn_protocols = match protocol {
        UpstreamProtocol::H2 => vec!["h2".to_string()],
        _ => vec![],
    };

    UpstreamTlsContext {
        common_tls_context: Some(CommonTlsContext {
            alpn_protocols,
            validation_context_type,
            ..Default::default()
        }),
        sni: sni
            .map(str::to_string)
            .or_else(|| validation.map(|v| v.subject_name.clone()))
            .unwrap_or_default(),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ingress_controller_core::cluster::UpstreamParams;
    use pretty_assertions::assert_eq;
    use prost::Message;
    use std::time::Duration;

    fn eds(params: UpstreamParams) -> GraphCluster {
        GraphCluster {
            name: GraphCluster::service_name("app", "backend", 443, &params),
            discovery: ClusterDiscovery::Eds {
                service_name: "app/backend/https".to_string(),
            },
            protocol: params.protocol,
            validation: params.validation,
            sni: params.sni,
            lb_strategy: params.lb_strategy,
            connect_timeout: Duration::from_secs(2),
        }
    }

    fn tls_context(cluster: &Cluster) -> UpstreamTlsContext {
        let socket = cluster.transport_socket.as_ref().expect("transport socket");
        match socket.config_type.as_ref() {
            Some(transport_socket::ConfigType::TypedConfig(any)) => {
                UpstreamTlsContext::decode(&*any.value).expect("tls context must decode")
            }
            None => panic!("missing typed config"),
        }
    }

    #[test]
    fn plain_eds_cluster() {
        let c = cluster(&eds(UpstreamParams::default()));
        assert_eq!(c.name, "app/backend/443");
        assert_eq!(
            c.cluster_discovery_type,
            Some(ClusterDiscoveryType::Type(DiscoveryType::Eds as i32))
        );
        assert_eq!(
            c.eds_cluster_config
                .as_ref()
                .map(|eds| eds.service_name.as_str()),
            Some("app/backend/https")
        );
        assert_eq!(c.lb_policy, LbPolicy::RoundRobin as i32);
        assert!(c.transport_socket.is_none());
        assert!(c.typed_extension_protocol_options.is_empty());
    }

    #[test]
    fn validated_tls_cluster() {
        let c = cluster(&eds(UpstreamParams {
            protocol: UpstreamProtocol::H2,
            validation: Some(UpstreamValidation {
                ca_secret: "app/ca/ca".to_string(),
                subject_name: "backend.example.com".to_string(),
            }),
            ..Default::default()
        }));

        assert!(c.typed_extension_protocol_options.contains_key(HTTP_PROTOCOL_OPTIONS));
        let tls = tls_context(&c);
        assert_eq!(tls.sni, "backend.example.com");
        let common = tls.common_tls_context.expect("common context");
        assert_eq!(common.alpn_protocols, vec!["h2".to_string()]);
        match common.validation_context_type {
            Some(ValidationContextType::CombinedValidationContext(combined)) => {
                assert_eq!(
                    combined
                        .validation_context_sds_secret_config
                        .map(|sds| sds.name),
                    Some("app/ca/ca".to_string())
                );
            }
            other => panic!("unexpected validation context: {other:?}"),
        }
    }

    #[test]
    fn dns_cluster_for_extension_services() {
        let c = cluster(&GraphCluster {
            name: GraphCluster::extension_name("auth", "authz"),
            discovery: ClusterDiscovery::StrictDns {
                targets: vec![DnsTarget {
                    host: "authz.auth.svc.cluster.local".to_string(),
                    port: 9000,
                    weight: 0,
                }],
            },
            protocol: UpstreamProtocol::H2c,
            validation: None,
            sni: None,
            lb_strategy: LoadBalancerStrategy::Cookie,
            connect_timeout: Duration::from_millis(500),
        });

        assert_eq!(
            c.cluster_discovery_type,
            Some(ClusterDiscoveryType::Type(DiscoveryType::StrictDns as i32))
        );
        assert_eq!(c.lb_policy, LbPolicy::RingHash as i32);
        assert_eq!(c.connect_timeout, Some(proto::duration(Duration::from_millis(500))));
        assert!(c.transport_socket.is_none());
        let assignment = c.load_assignment.expect("load assignment");
        assert_eq!(assignment.cluster_name, "extension/auth/authz");
        let endpoint = &assignment.endpoints[0].lb_endpoints[0];
        assert_eq!(endpoint.load_balancing_weight, None);
    }
}
