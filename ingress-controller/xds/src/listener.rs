use crate::{
    cluster::socket_address,
    metrics::CacheMetrics,
    proto,
    route::{secure_route_config, serves_http, FALLBACK_ROUTE_CONFIG},
    SnapshotCache, LISTENER_TYPE_URL,
};
use envoy_types::pb::{
    envoy::{
        config::{
            core::v3::{
                grpc_service::{EnvoyGrpc, TargetSpecifier},
                transport_socket, ApiVersion, GrpcService, TransportSocket,
            },
            listener::v3::{
                filter, listener_filter, Filter, FilterChain, FilterChainMatch, Listener,
                ListenerFilter,
            },
        },
        extensions::{
            filters::{
                http::{
                    ext_authz::v3::{ext_authz, ExtAuthz},
                    router::v3::Router,
                },
                listener::tls_inspector::v3::TlsInspector,
                network::{
                    http_connection_manager::v3::{
                        http_connection_manager::RouteSpecifier, http_filter, HttpConnectionManager,
                        HttpFilter, Rds,
                    },
                    tcp_proxy::v3::{tcp_proxy, TcpProxy},
                },
            },
            transport_sockets::tls::v3::{
                certificate_validation_context::TrustChainVerification,
                common_tls_context::ValidationContextType, CertificateValidationContext,
                CommonTlsContext, DownstreamTlsContext, TlsParameters,
            },
        },
    },
    google::protobuf::BoolValue,
};
use ingress_controller_core::{
    graph::{self, Authorization, ClientValidation, TlsVersion, VirtualHostTls, WeightedCluster},
    GraphObserver, ListenerProtocol, RoutingGraph,
};

const HCM_FILTER: &str = "envoy.filters.network.http_connection_manager";
const TCP_PROXY_FILTER: &str = "envoy.filters.network.tcp_proxy";
const ROUTER_FILTER: &str = "envoy.filters.http.router";
const TLS_INSPECTOR_FILTER: &str = "envoy.filters.listener.tls_inspector";
const TLS_TRANSPORT_SOCKET: &str = "envoy.transport_sockets.tls";

const HCM_TYPE_URL: &str = "type.googleapis.com/envoy.extensions.filters.network.http_connection_manager.v3.HttpConnectionManager";
const TCP_PROXY_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.network.tcp_proxy.v3.TcpProxy";
const ROUTER_TYPE_URL: &str = "type.googleapis.com/envoy.extensions.filters.http.router.v3.Router";
const EXT_AUTHZ_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.http.ext_authz.v3.ExtAuthz";
const TLS_INSPECTOR_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.listener.tls_inspector.v3.TlsInspector";
const DOWNSTREAM_TLS_CONTEXT_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.transport_sockets.tls.v3.DownstreamTlsContext";

// Values of `TlsParameters.TlsProtocol`.
const TLS_V1_2: i32 = 3;
const TLS_V1_3: i32 = 4;

/// Serves the plaintext and TLS listeners of the routing graph.
#[derive(Clone, Debug)]
pub struct ListenerCache(SnapshotCache);

// === impl ListenerCache ===

impl ListenerCache {
    pub fn new(metrics: &CacheMetrics) -> Self {
        Self(SnapshotCache::new(
            LISTENER_TYPE_URL,
            None,
            metrics.family("listener"),
        ))
    }

    pub fn cache(&self) -> &SnapshotCache {
        &self.0
    }
}

impl GraphObserver for ListenerCache {
    fn on_change(&self, graph: &RoutingGraph) {
        let listeners = graph
            .listeners
            .iter()
            .map(|l| (l.name.clone(), proto::any(LISTENER_TYPE_URL, &listener(l))))
            .collect();
        self.0.replace(listeners);
    }
}

fn listener(l: &graph::Listener) -> Listener {
    let mut listener = Listener {
        name: l.name.clone(),
        address: Some(socket_address("0.0.0.0", l.port)),
        ..Default::default()
    };

    match l.protocol {
        ListenerProtocol::Http => {
            listener.filter_chains = vec![FilterChain {
                filters: vec![http_connection_manager(&l.name, &l.name, None)],
                ..Default::default()
            }];
        }
        ListenerProtocol::Https => {
            listener.listener_filters = vec![ListenerFilter {
                name: TLS_INSPECTOR_FILTER.to_string(),
                config_type: Some(listener_filter::ConfigType::TypedConfig(proto::any(
                    TLS_INSPECTOR_TYPE_URL,
                    &TlsInspector::default(),
                ))),
                ..Default::default()
            }];
            listener.filter_chains = l
                .virtual_hosts
                .iter()
                .map(|vh| secure_filter_chain(&l.name, vh))
                .collect();
            if let Some(fallback) = &l.fallback_certificate {
                listener.filter_chains.push(fallback_filter_chain(&l.name, &fallback.secret));
            }
        }
    }

    listener
}

fn secure_filter_chain(listener: &str, vh: &graph::VirtualHost) -> FilterChain {
    let mut chain = FilterChain {
        filter_chain_match: Some(FilterChainMatch {
            server_names: vec![vh.fqdn.clone()],
            ..Default::default()
        }),
        ..Default::default()
    };

    let http = serves_http(vh);
    if let Some(VirtualHostTls::Terminate {
        secret,
        min_protocol,
        client_validation,
        ..
    }) = &vh.tls
    {
        let alpn = if http {
            vec!["h2".to_string(), "http/1.1".to_string()]
        } else {
            vec![]
        };
        chain.transport_socket = Some(downstream_tls(
            secret,
            *min_protocol,
            client_validation.as_ref(),
            alpn,
        ));
    }

    chain.filters = if http {
        vec![http_connection_manager(
            listener,
            &secure_route_config(&vh.fqdn),
            vh.authorization.as_ref(),
        )]
    } else {
        let clusters = vh
            .tcp_proxy
            .as_ref()
            .map(|p| p.clusters.as_slice())
            .unwrap_or_default();
        vec![tcp_proxy(listener, clusters)]
    };

    chain
}

/// Serves TLS clients that send no SNI, or an SNI that matches no virtual
/// host.
fn fallback_filter_chain(listener: &str, secret: &str) -> FilterChain {
    FilterChain {
        filter_chain_match: Some(FilterChainMatch {
            transport_protocol: "tls".to_string(),
            ..Default::default()
        }),
        transport_socket: Some(downstream_tls(
            secret,
            TlsVersion::default(),
            None,
            vec!["h2".to_string(), "http/1.1".to_string()],
        )),
        filters: vec![http_connection_manager(listener, FALLBACK_ROUTE_CONFIG, None)],
        name: "fallback-certificate".to_string(),
        ..Default::default()
    }
}

fn http_connection_manager(
    stat_prefix: &str,
    route_config: &str,
    authorization: Option<&Authorization>,
) -> Filter {
    let mut http_filters = Vec::with_capacity(2);
    if let Some(authz) = authorization {
        http_filters.push(HttpFilter {
            name: crate::route::EXT_AUTHZ_FILTER.to_string(),
            config_type: Some(http_filter::ConfigType::TypedConfig(proto::any(
                EXT_AUTHZ_TYPE_URL,
                &ext_authz(authz),
            ))),
            ..Default::default()
        });
    }
    http_filters.push(HttpFilter {
        name: ROUTER_FILTER.to_string(),
        config_type: Some(http_filter::ConfigType::TypedConfig(proto::any(
            ROUTER_TYPE_URL,
            &Router::default(),
        ))),
        ..Default::default()
    });

    let hcm = HttpConnectionManager {
        stat_prefix: stat_prefix.to_string(),
        route_specifier: Some(RouteSpecifier::Rds(Rds {
            config_source: Some(proto::ads()),
            route_config_name: route_config.to_string(),
        })),
        http_filters,
        use_remote_address: Some(BoolValue { value: true }),
        ..Default::default()
    };

    Filter {
        name: HCM_FILTER.to_string(),
        config_type: Some(filter::ConfigType::TypedConfig(proto::any(HCM_TYPE_URL, &hcm))),
    }
}

fn ext_authz(authz: &Authorization) -> ExtAuthz {
    ExtAuthz {
        services: Some(ext_authz::Services::GrpcService(GrpcService {
            target_specifier: Some(TargetSpecifier::EnvoyGrpc(EnvoyGrpc {
                cluster_name: authz.cluster.clone(),
                ..Default::default()
            })),
            timeout: proto::timeout(authz.response_timeout),
            ..Default::default()
        })),
        failure_mode_allow: authz.fail_open,
        transport_api_version: ApiVersion::V3 as i32,
        ..Default::default()
    }
}

fn tcp_proxy(stat_prefix: &str, clusters: &[WeightedCluster]) -> Filter {
    let cluster_specifier = match clusters {
        [cluster] => tcp_proxy::ClusterSpecifier::Cluster(cluster.name.clone()),
        clusters => tcp_proxy::ClusterSpecifier::WeightedClusters(tcp_proxy::WeightedCluster {
            clusters: clusters
                .iter()
                .map(|c| tcp_proxy::weighted_cluster::ClusterWeight {
                    name: c.name.clone(),
                    weight: c.weight,
                    ..Default::default()
                })
                .collect(),
        }),
    };

    let proxy = TcpProxy {
        stat_prefix: stat_prefix.to_string(),
        cluster_specifier: Some(cluster_specifier),
        ..Default::default()
    };

    Filter {
        name: TCP_PROXY_FILTER.to_string(),
        config_type: Some(filter::ConfigType::TypedConfig(proto::any(
            TCP_PROXY_TYPE_URL,
            &proxy,
        ))),
    }
}

fn downstream_tls(
    secret: &str,
    min_protocol: TlsVersion,
    client_validation: Option<&ClientValidation>,
    alpn_protocols: Vec<String>,
) -> TransportSocket {
    let validation_context_type = client_validation.map(|v| match &v.ca_secret {
        Some(ca) => ValidationContextType::ValidationContextSdsSecretConfig(proto::sds(ca)),
        None => ValidationContextType::ValidationContext(CertificateValidationContext {
            trust_chain_verification: TrustChainVerification::AcceptUntrusted as i32,
            ..Default::default()
        }),
    });

    let tls = DownstreamTlsContext {
        common_tls_context: Some(CommonTlsContext {
            tls_params: Some(TlsParameters {
                tls_minimum_protocol_version: match min_protocol {
                    TlsVersion::V1_2 => TLS_V1_2,
                    TlsVersion::V1_3 => TLS_V1_3,
                },
                tls_maximum_protocol_version: TLS_V1_3,
                ..Default::default()
            }),
            tls_certificate_sds_secret_configs: vec![proto::sds(secret)],
            validation_context_type,
            alpn_protocols,
            ..Default::default()
        }),
        require_client_certificate: client_validation.map(|_| BoolValue { value: true }),
        ..Default::default()
    };

    TransportSocket {
        name: TLS_TRANSPORT_SOCKET.to_string(),
        config_type: Some(transport_socket::ConfigType::TypedConfig(proto::any(
            DOWNSTREAM_TLS_CONTEXT_TYPE_URL,
            &tls,
        ))),
    }
}
