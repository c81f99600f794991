use crate::{cluster::Cluster, timeout::Timeout};
use std::{
    collections::{BTreeMap, BTreeSet},
    time::Duration,
};

/// The validated, immutable product of a graph build.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RoutingGraph {
    /// Listeners ordered by name.
    pub listeners: Vec<Listener>,
    pub clusters: BTreeMap<String, Cluster>,
    pub secrets: BTreeMap<String, Secret>,
}

/// Observes each newly built routing graph.
///
/// Observers are invoked serially, in registration order, after every
/// rebuild. The graph must not be retained beyond the call; observers copy
/// what they need into their own snapshots.
pub trait GraphObserver: Send + Sync {
    fn on_change(&self, graph: &RoutingGraph);
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ListenerProtocol {
    Http,
    Https,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Listener {
    pub name: String,
    pub port: u16,
    pub protocol: ListenerProtocol,
    /// Virtual hosts ordered by FQDN.
    pub virtual_hosts: Vec<VirtualHost>,
    /// The secret served to TLS clients that do not match any virtual host.
    pub fallback_certificate: Option<FallbackCertificate>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FallbackCertificate {
    pub secret: String,
    /// Virtual hosts whose routes are served on the fallback chain.
    pub virtual_hosts: Vec<VirtualHost>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VirtualHost {
    pub fqdn: String,
    pub routes: Vec<Route>,
    pub tls: Option<VirtualHostTls>,
    pub authorization: Option<Authorization>,
    pub tcp_proxy: Option<TcpProxy>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VirtualHostTls {
    Terminate {
        secret: String,
        min_protocol: TlsVersion,
        client_validation: Option<ClientValidation>,
        fallback: bool,
    },
    Passthrough,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum TlsVersion {
    #[default]
    V1_2,
    V1_3,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientValidation {
    /// The CA secret used to verify client certificates, unless verification
    /// is skipped.
    pub ca_secret: Option<String>,
}

/// External authorization for a virtual host.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Authorization {
    pub cluster: String,
    pub response_timeout: Timeout,
    pub fail_open: bool,
}

/// Authorization settings resolved for a single route.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RouteAuthorization {
    pub disabled: bool,
    pub context: BTreeMap<String, String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TcpProxy {
    pub clusters: Vec<WeightedCluster>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Route {
    pub path: PathMatch,
    pub headers: Vec<HeaderMatch>,
    pub action: RouteAction,
    /// Set when the virtual host has authorization configured.
    pub authorization: Option<RouteAuthorization>,
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PathMatch {
    Exact(String),
    Regex(String),
    Prefix(String),
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HeaderMatch {
    pub name: String,
    pub value: HeaderMatchValue,
    pub invert: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HeaderMatchValue {
    Present,
    Exact(String),
    Contains(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RouteAction {
    Forward(Forward),
    /// Redirects plaintext requests to the same URL over HTTPS.
    HttpsRedirect,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Forward {
    pub clusters: Vec<WeightedCluster>,
    pub mirror: Option<String>,
    pub prefix_rewrite: Option<String>,
    pub timeouts: TimeoutPolicy,
    pub retry: Option<RetryPolicy>,
    pub websocket: bool,
    pub cookie_affinity: bool,
    pub request_headers: HeadersPolicy,
    pub response_headers: HeadersPolicy,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WeightedCluster {
    pub name: String,
    pub weight: u32,
    pub request_headers: HeadersPolicy,
    pub response_headers: HeadersPolicy,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HeadersPolicy {
    pub set: BTreeMap<String, String>,
    pub remove: BTreeSet<String>,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct TimeoutPolicy {
    pub response: Timeout,
    pub idle: Timeout,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retry_on: Vec<String>,
    pub num_retries: u32,
    pub per_try_timeout: Timeout,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Secret {
    pub name: String,
    pub data: SecretData,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SecretData {
    Tls { cert: Vec<u8>, key: Vec<u8> },
    Ca { ca: Vec<u8> },
}

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// The plaintext listener. Its route configuration shares the name.
pub const HTTP_LISTENER_NAME: &str = "ingress_http";

pub const HTTPS_LISTENER_NAME: &str = "ingress_https";

// === impl RoutingGraph ===

impl RoutingGraph {
    pub fn listener(&self, name: &str) -> Option<&Listener> {
        self.listeners.iter().find(|l| l.name == name)
    }

    /// Iterates over every virtual host on every listener.
    pub fn virtual_hosts(&self) -> impl Iterator<Item = (&Listener, &VirtualHost)> + '_ {
        self.listeners
            .iter()
            .flat_map(|l| l.virtual_hosts.iter().map(move |vh| (l, vh)))
    }
}

// === impl VirtualHost ===

impl VirtualHost {
    pub fn new(fqdn: impl Into<String>) -> Self {
        Self {
            fqdn: fqdn.into(),
            routes: Vec::new(),
            tls: None,
            authorization: None,
            tcp_proxy: None,
        }
    }

    pub fn is_passthrough(&self) -> bool {
        matches!(self.tls, Some(VirtualHostTls::Passthrough))
    }

    pub fn secret(&self) -> Option<&str> {
        match &self.tls {
            Some(VirtualHostTls::Terminate { secret, .. }) => Some(secret),
            _ => None,
        }
    }

    pub fn fallback_enabled(&self) -> bool {
        matches!(
            self.tls,
            Some(VirtualHostTls::Terminate { fallback: true, .. })
        )
    }
}

// === impl Route ===

impl Route {
    /// Orders routes so that the most specific match is evaluated first.
    ///
    /// Exact paths precede regular expressions, which precede prefixes; within
    /// a kind longer paths come first, and then routes with more header
    /// matches.
    pub fn precedence_cmp(&self, other: &Self) -> std::cmp::Ordering {
        fn rank(path: &PathMatch) -> (u8, usize) {
            match path {
                PathMatch::Exact(p) => (0, p.len()),
                PathMatch::Regex(p) => (1, p.len()),
                PathMatch::Prefix(p) => (2, p.len()),
            }
        }
        let (a_kind, a_len) = rank(&self.path);
        let (b_kind, b_len) = rank(&other.path);
        a_kind
            .cmp(&b_kind)
            .then(b_len.cmp(&a_len))
            .then(other.headers.len().cmp(&self.headers.len()))
            .then_with(|| self.path.cmp(&other.path))
            .then_with(|| self.headers.cmp(&other.headers))
    }

    /// Identifies routes that match exactly the same requests.
    pub fn match_key(&self) -> (PathMatch, Vec<HeaderMatch>) {
        let mut headers = self.headers.clone();
        headers.sort();
        (self.path.clone(), headers)
    }
}

// === impl HeadersPolicy ===

impl HeadersPolicy {
    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.remove.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(path: PathMatch, headers: usize) -> Route {
        Route {
            path,
            headers: (0..headers)
                .map(|i| HeaderMatch {
                    name: format!("x-{i}"),
                    value: HeaderMatchValue::Present,
                    invert: false,
                })
                .collect(),
            action: RouteAction::HttpsRedirect,
            authorization: None,
        }
    }

    #[test]
    fn orders_routes_by_specificity() {
        let mut routes = vec![
            route(PathMatch::Prefix("/".into()), 0),
            route(PathMatch::Prefix("/api".into()), 0),
            route(PathMatch::Prefix("/api".into()), 1),
            route(PathMatch::Regex("/r.*".into()), 0),
            route(PathMatch::Exact("/a".into()), 0),
        ];
        routes.sort_by(Route::precedence_cmp);
        let paths = routes
            .iter()
            .map(|r| (r.path.clone(), r.headers.len()))
            .collect::<Vec<_>>();
        assert_eq!(
            paths,
            vec![
                (PathMatch::Exact("/a".into()), 0),
                (PathMatch::Regex("/r.*".into()), 0),
                (PathMatch::Prefix("/api".into()), 1),
                (PathMatch::Prefix("/api".into()), 0),
                (PathMatch::Prefix("/".into()), 0),
            ]
        );
    }
}
