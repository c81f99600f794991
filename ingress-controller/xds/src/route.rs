use crate::{metrics::CacheMetrics, proto, SnapshotCache, ROUTE_TYPE_URL};
use envoy_types::pb::{
    envoy::{
        config::{
            core::v3::{header_value_option::HeaderAppendAction, HeaderValue, HeaderValueOption},
            route::v3::{
                header_matcher::HeaderMatchSpecifier,
                redirect_action::SchemeRewriteSpecifier,
                route,
                route_action::{
                    hash_policy::{self, PolicySpecifier},
                    ClusterSpecifier, HashPolicy, HostRewriteSpecifier, RequestMirrorPolicy,
                    UpgradeConfig,
                },
                route_match::PathSpecifier,
                weighted_cluster::{cluster_weight, ClusterWeight},
                HeaderMatcher, RedirectAction, RetryPolicy, Route, RouteAction, RouteConfiguration,
                RouteMatch, VirtualHost, WeightedCluster,
            },
        },
        extensions::filters::http::ext_authz::v3::{
            ext_authz_per_route::Override, CheckSettings, ExtAuthzPerRoute,
        },
        r#type::matcher::v3::{string_matcher::MatchPattern, RegexMatcher, StringMatcher},
    },
    google::protobuf::{Any, Duration, UInt32Value},
};
use ingress_controller_core::{
    graph::{
        self, Forward, HeaderMatchValue, HeadersPolicy, PathMatch, RouteAuthorization,
        WeightedCluster as GraphWeightedCluster,
    },
    GraphObserver, ListenerProtocol, RoutingGraph, HTTP_LISTENER_NAME,
};
use std::collections::{BTreeMap, HashMap};

/// Route configuration for virtual hosts served with the fallback
/// certificate.
pub const FALLBACK_ROUTE_CONFIG: &str = "ingress_fallbackcert";

/// Per-route filter configurations are keyed by the HTTP filter's name.
pub(crate) const EXT_AUTHZ_FILTER: &str = "envoy.filters.http.ext_authz";

/// Requests are pinned to an upstream by this cookie when cookie affinity is
/// enabled.
const SESSION_AFFINITY_COOKIE: &str = "X-Session-Affinity";

const EXT_AUTHZ_PER_ROUTE_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.http.ext_authz.v3.ExtAuthzPerRoute";

/// Serves the route configurations referenced by the listeners.
#[derive(Clone, Debug)]
pub struct RouteCache(SnapshotCache);

// === impl RouteCache ===

impl RouteCache {
    pub fn new(metrics: &CacheMetrics) -> Self {
        Self(SnapshotCache::new(
            ROUTE_TYPE_URL,
            Some(empty_route_configuration),
            metrics.family("route"),
        ))
    }

    pub fn cache(&self) -> &SnapshotCache {
        &self.0
    }
}

impl GraphObserver for RouteCache {
    fn on_change(&self, graph: &RoutingGraph) {
        let mut configs = BTreeMap::new();
        let mut insert = |config: RouteConfiguration| {
            configs.insert(config.name.clone(), proto::any(ROUTE_TYPE_URL, &config));
        };

        for listener in &graph.listeners {
            match listener.protocol {
                ListenerProtocol::Http => {
                    insert(route_configuration(
                        HTTP_LISTENER_NAME,
                        &listener.virtual_hosts,
                    ));
                }
                ListenerProtocol::Https => {
                    for vhost in listener.virtual_hosts.iter().filter(|vh| serves_http(vh)) {
                        insert(route_configuration(
                            &secure_route_config(&vhost.fqdn),
                            std::slice::from_ref(vhost),
                        ));
                    }
                    if let Some(fallback) = &listener.fallback_certificate {
                        let vhosts = fallback
                            .virtual_hosts
                            .iter()
                            .filter(|vh| serves_http(vh))
                            .cloned()
                            .collect::<Vec<_>>();
                        insert(route_configuration(FALLBACK_ROUTE_CONFIG, &vhosts));
                    }
                }
            }
        }

        self.0.replace(configs);
    }
}

/// The route configuration name of a TLS-terminated virtual host.
pub fn secure_route_config(fqdn: &str) -> String {
    format!("https/{fqdn}")
}

/// Whether a secure virtual host terminates HTTP, rather than proxying TCP.
pub(crate) fn serves_http(vhost: &graph::VirtualHost) -> bool {
    !vhost.is_passthrough() && vhost.tcp_proxy.is_none()
}

fn empty_route_configuration(name: &str) -> Any {
    proto::any(
        ROUTE_TYPE_URL,
        &RouteConfiguration {
            name: name.to_string(),
            ..Default::default()
        },
    )
}

fn route_configuration(name: &str, vhosts: &[graph::VirtualHost]) -> RouteConfiguration {
    RouteConfiguration {
        name: name.to_string(),
        virtual_hosts: vhosts.iter().map(virtual_host).collect(),
        ..Default::default()
    }
}

fn virtual_host(vhost: &graph::VirtualHost) -> VirtualHost {
    let domains = if vhost.fqdn == "*" {
        vec!["*".to_string()]
    } else {
        vec![vhost.fqdn.clone(), format!("{}:*", vhost.fqdn)]
    };
    VirtualHost {
        name: vhost.fqdn.clone(),
        domains,
        routes: vhost.routes.iter().map(route).collect(),
        ..Default::default()
    }
}

fn route(r: &graph::Route) -> Route {
    let mut route = Route {
        r#match: Some(route_match(&r.path, &r.headers)),
        ..Default::default()
    };

    match &r.action {
        graph::RouteAction::HttpsRedirect => {
            route.action = Some(route::Action::Redirect(RedirectAction {
                scheme_rewrite_specifier: Some(SchemeRewriteSpecifier::HttpsRedirect(true)),
                ..Default::default()
            }));
        }
        graph::RouteAction::Forward(fwd) => {
            let (host, set) = split_host(&fwd.request_headers);
            route.request_headers_to_add = headers_to_add(&set);
            route.request_headers_to_remove = fwd.request_headers.remove.iter().cloned().collect();
            route.response_headers_to_add = headers_to_add(&fwd.response_headers.set);
            route.response_headers_to_remove =
                fwd.response_headers.remove.iter().cloned().collect();

            let mut action = route_action(fwd);
            action.host_rewrite_specifier = host.map(HostRewriteSpecifier::HostRewriteLiteral);
            route.action = Some(route::Action::Route(action));
        }
    }

    if let Some(authz) = &r.authorization {
        route.typed_per_filter_config = HashMap::from([(
            EXT_AUTHZ_FILTER.to_string(),
            proto::any(EXT_AUTHZ_PER_ROUTE_TYPE_URL, &authz_per_route(authz)),
        )]);
    }

    route
}

fn route_match(path: &PathMatch, headers: &[graph::HeaderMatch]) -> RouteMatch {
    let path_specifier = match path {
        PathMatch::Exact(p) => PathSpecifier::Path(p.clone()),
        PathMatch::Regex(p) => PathSpecifier::SafeRegex(RegexMatcher {
            regex: p.clone(),
            ..Default::default()
        }),
        PathMatch::Prefix(p) => PathSpecifier::Prefix(p.clone()),
    };

    RouteMatch {
        path_specifier: Some(path_specifier),
        headers: headers
            .iter()
            .map(|h| HeaderMatcher {
                name: h.name.clone(),
                invert_match: h.invert,
                header_match_specifier: Some(match &h.value {
                    HeaderMatchValue::Present => HeaderMatchSpecifier::PresentMatch(true),
                    HeaderMatchValue::Exact(v) => string_match(MatchPattern::Exact(v.clone())),
                    HeaderMatchValue::Contains(v) => {
                        string_match(MatchPattern::Contains(v.clone()))
                    }
                }),
                ..Default::default()
            })
            .collect(),
        ..Default::default()
    }
}

fn string_match(pattern: MatchPattern) -> HeaderMatchSpecifier {
    HeaderMatchSpecifier::StringMatch(StringMatcher {
        match_pattern: Some(pattern),
        ignore_case: false,
    })
}

fn route_action(fwd: &Forward) -> RouteAction {
    let mut action = RouteAction {
        cluster_specifier: Some(cluster_specifier(&fwd.clusters)),
        timeout: proto::timeout(fwd.timeouts.response),
        idle_timeout: proto::timeout(fwd.timeouts.idle),
        prefix_rewrite: fwd.prefix_rewrite.clone().unwrap_or_default(),
        ..Default::default()
    };

    if let Some(mirror) = &fwd.mirror {
        action.request_mirror_policies = vec![RequestMirrorPolicy {
            cluster: mirror.clone(),
            ..Default::default()
        }];
    }

    if let Some(retry) = &fwd.retry {
        action.retry_policy = Some(RetryPolicy {
            retry_on: retry.retry_on.join(","),
            num_retries: Some(UInt32Value {
                value: retry.num_retries,
            }),
            per_try_timeout: proto::timeout(retry.per_try_timeout),
            ..Default::default()
        });
    }

    if fwd.websocket {
        action.upgrade_configs = vec![UpgradeConfig {
            upgrade_type: "websocket".to_string(),
            ..Default::default()
        }];
    }

    if fwd.cookie_affinity {
        action.hash_policy = vec![HashPolicy {
            policy_specifier: Some(PolicySpecifier::Cookie(hash_policy::Cookie {
                name: SESSION_AFFINITY_COOKIE.to_string(),
                ttl: Some(Duration::default()),
                path: "/".to_string(),
                ..Default::default()
            })),
            ..Default::default()
        }];
    }

    action
}

fn cluster_specifier(clusters: &[GraphWeightedCluster]) -> ClusterSpecifier {
    if let [cluster] = clusters {
        if cluster.request_headers.is_empty() && cluster.response_headers.is_empty() {
            return ClusterSpecifier::Cluster(cluster.name.clone());
        }
    }

    ClusterSpecifier::WeightedClusters(WeightedCluster {
        clusters: clusters
            .iter()
            .map(|c| {
                let (host, set) = split_host(&c.request_headers);
                ClusterWeight {
                    name: c.name.clone(),
                    weight: Some(UInt32Value { value: c.weight }),
                    request_headers_to_add: headers_to_add(&set),
                    request_headers_to_remove: c.request_headers.remove.iter().cloned().collect(),
                    response_headers_to_add: headers_to_add(&c.response_headers.set),
                    response_headers_to_remove: c
                        .response_headers
                        .remove
                        .iter()
                        .cloned()
                        .collect(),
                    host_rewrite_specifier: host
                        .map(cluster_weight::HostRewriteSpecifier::HostRewriteLiteral),
                    ..Default::default()
                }
            })
            .collect(),
        ..Default::default()
    })
}

/// Envoy rewrites the `Host` header through a dedicated field, so it is
/// separated from the other headers to set.
fn split_host(policy: &HeadersPolicy) -> (Option<String>, BTreeMap<String, String>) {
    let mut host = None;
    let mut set = BTreeMap::new();
    for (name, value) in &policy.set {
        if name.eq_ignore_ascii_case("host") {
            host = Some(value.clone());
        } else {
            set.insert(name.clone(), value.clone());
        }
    }
    (host, set)
}

fn headers_to_add(set: &BTreeMap<String, String>) -> Vec<HeaderValueOption> {
    set.iter()
        .map(|(key, value)| HeaderValueOption {
            header: Some(HeaderValue {
                key: key.clone(),
                value: value.clone(),
                ..Default::default()
            }),
            append_action: HeaderAppendAction::OverwriteIfExistsOrAdd as i32,
            ..Default::default()
        })
        .collect()
}

fn authz_per_route(authz: &RouteAuthorization) -> ExtAuthzPerRoute {
    let r#override = if authz.disabled {
        Override::Disabled(true)
    } else {
        Override::CheckSettings(CheckSettings {
            context_extensions: authz
                .context
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            ..Default::default()
        })
    };
    ExtAuthzPerRoute {
        r#override: Some(r#override),
    }
}
