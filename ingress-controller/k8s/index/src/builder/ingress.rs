use super::{
    lookup::{self, PortRef},
    Context, Host, HostRoute, Insecure, Invalid, Processor, Resources,
};
use ingress_controller_core::{
    cluster::UpstreamParams,
    graph::{
        Forward, PathMatch, RetryPolicy, Route, RouteAction, TimeoutPolicy, TlsVersion,
        VirtualHostTls, WeightedCluster,
    },
    timeout::Timeout,
    ConditionType, ObjectKey, ResourceId, Secret, StatusResult,
};
use ingress_controller_k8s_api::{Ingress, IngressBackend, ObjectMeta, ServiceBackendPort};
use std::collections::BTreeMap;

const FORCE_SSL_REDIRECT: &str = "ingress.kubernetes.io/force-ssl-redirect";
const ALLOW_HTTP: &str = "kubernetes.io/ingress.allow-http";
const WEBSOCKET_ROUTES: &str = "projectcontour.io/websocket-routes";
const RESPONSE_TIMEOUT: &str = "projectcontour.io/response-timeout";
const RETRY_ON: &str = "projectcontour.io/retry-on";
const NUM_RETRIES: &str = "projectcontour.io/num-retries";
const PER_TRY_TIMEOUT: &str = "projectcontour.io/per-try-timeout";

/// Characters that mark an Ingress path as a regular expression.
const REGEX_CHARS: [char; 6] = ['^', '+', '*', '[', ']', '%'];

/// Builds virtual hosts from `networking.k8s.io/v1` Ingresses.
///
/// Ingresses may share a host, in which case their routes are merged. Ingress
/// status carries no conditions, so problems are recorded for observability
/// only and drop just the offending route.
pub(crate) struct IngressProcessor;

/// Route settings configured through Ingress annotations.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
struct Annotations {
    force_ssl_redirect: bool,
    allow_http: bool,
    websocket_paths: Vec<String>,
    response_timeout: Timeout,
    retry: Option<RetryPolicy>,
}

impl Processor for IngressProcessor {
    fn name(&self) -> &'static str {
        "ingress"
    }

    fn run(&self, ctx: &mut Context<'_>) {
        let snapshot = ctx.snapshot;
        let mut ids = snapshot.ingresses.keys().collect::<Vec<_>>();
        ids.sort();

        for id in ids {
            let ingress = &snapshot.ingresses[id];
            let mut status = StatusResult::new(
                ObjectKey::ingress(&id.namespace, &id.name),
                ingress.metadata.generation,
            );
            process(ctx, id, ingress, &mut status);
            ctx.record(status);
        }
    }
}

fn process(ctx: &mut Context<'_>, id: &ResourceId, ingress: &Ingress, status: &mut StatusResult) {
    let spec = match ingress.spec.as_ref() {
        Some(spec) => spec,
        None => return,
    };
    let annotations = match Annotations::parse(&ingress.metadata) {
        Ok(annotations) => annotations,
        Err(invalid) => {
            tracing::debug!(namespace = %id.namespace, name = %id.name, error = %invalid.message, "Ignoring ingress");
            invalid.record(status);
            return;
        }
    };

    let mut tls_hosts = BTreeMap::<&str, Secret>::new();
    for tls in spec.tls.iter().flatten() {
        let secret_name = match tls.secret_name.as_deref() {
            Some(name) if !name.is_empty() => name,
            _ => continue,
        };
        match lookup::tls_secret(ctx.snapshot, secret_name, &id.namespace, ConditionType::Tls) {
            Ok(secret) => {
                for host in tls.hosts.iter().flatten() {
                    tls_hosts.entry(host.as_str()).or_insert_with(|| secret.clone());
                }
            }
            Err(invalid) => invalid.record(status),
        }
    }

    let mut resources = Resources::default();
    let mut routes = Vec::<(String, Route)>::new();
    if let Some(backend) = spec.default_backend.as_ref() {
        if let Some(route) = backend_route(ctx, id, None, "Prefix", backend, &annotations, status, &mut resources) {
            routes.push(("*".to_string(), route));
        }
    }
    for rule in spec.rules.iter().flatten() {
        let host = match rule.host.as_deref() {
            Some(host) if !host.is_empty() => host,
            _ => "*",
        };
        for path in rule.http.iter().flat_map(|http| http.paths.iter()) {
            let route = backend_route(
                ctx,
                id,
                path.path.as_deref(),
                &path.path_type,
                &path.backend,
                &annotations,
                status,
                &mut resources,
            );
            if let Some(route) = route {
                routes.push((host.to_string(), route));
            }
        }
    }

    let key = status.key.clone();
    for (fqdn, route) in routes {
        let owner = ctx.claims.entry(fqdn.clone()).or_insert_with(|| key.clone());
        if owner.kind != key.kind {
            continue;
        }

        let host = ctx.hosts.entry(fqdn.clone()).or_insert_with(|| Host {
            owner: key.clone(),
            tls: None,
            authorization: None,
            tcp_proxy: None,
            routes: Vec::new(),
        });
        if host.tls.is_none() {
            if let Some(secret) = tls_hosts.get(fqdn.as_str()) {
                host.tls = Some(VirtualHostTls::Terminate {
                    secret: secret.name.clone(),
                    min_protocol: TlsVersion::V1_2,
                    client_validation: None,
                    fallback: false,
                });
                resources.secrets.push(secret.clone());
            }
        }

        let insecure = if !annotations.allow_http {
            Insecure::Drop
        } else if annotations.force_ssl_redirect {
            Insecure::Redirect
        } else {
            Insecure::Serve
        };
        host.routes.push(HostRoute { route, insecure });
    }
    ctx.commit(resources);
}

#[allow(clippy::too_many_arguments)]
fn backend_route(
    ctx: &Context<'_>,
    id: &ResourceId,
    path: Option<&str>,
    path_type: &str,
    backend: &IngressBackend,
    annotations: &Annotations,
    status: &mut StatusResult,
    resources: &mut Resources,
) -> Option<Route> {
    let service = match backend.service.as_ref() {
        Some(service) => service,
        None => {
            status.add_error(
                ConditionType::Service,
                "ServiceUnresolvedReference",
                "backend must reference a service",
            );
            return None;
        }
    };
    let port = match service.port.as_ref() {
        Some(ServiceBackendPort {
            number: Some(number),
            ..
        }) => PortRef::Number(*number),
        Some(ServiceBackendPort {
            name: Some(name), ..
        }) => PortRef::Name(name),
        _ => {
            status.add_error(
                ConditionType::Service,
                "ServiceUnresolvedReference",
                format!("backend service {} must specify a port", service.name),
            );
            return None;
        }
    };
    let port = match lookup::service_port(ctx.snapshot, &id.namespace, &service.name, port) {
        Ok(port) => port,
        Err(invalid) => {
            invalid.record(status);
            return None;
        }
    };

    let path = match path_match(path, path_type) {
        Ok(path) => path,
        Err(invalid) => {
            invalid.record(status);
            return None;
        }
    };
    let websocket = match &path {
        PathMatch::Exact(p) | PathMatch::Prefix(p) | PathMatch::Regex(p) => {
            annotations.websocket_paths.iter().any(|w| w == p)
        }
    };

    let params = UpstreamParams {
        protocol: port.protocol.unwrap_or_default(),
        ..Default::default()
    };
    let cluster = lookup::service_cluster(ctx.config, &port, params);
    let forward = Forward {
        clusters: vec![WeightedCluster {
            name: cluster.name.clone(),
            weight: 1,
            request_headers: Default::default(),
            response_headers: Default::default(),
        }],
        timeouts: TimeoutPolicy {
            response: annotations.response_timeout,
            idle: Timeout::Default,
        },
        retry: annotations.retry.clone(),
        websocket,
        ..Default::default()
    };
    resources.clusters.push(cluster);

    Some(Route {
        path,
        headers: Vec::new(),
        action: RouteAction::Forward(forward),
        authorization: None,
    })
}

fn path_match(path: Option<&str>, path_type: &str) -> Result<PathMatch, Invalid> {
    let path = match path {
        Some(path) if !path.is_empty() => path,
        _ => "/",
    };
    if !path.starts_with('/') {
        return Err(Invalid::new(
            ConditionType::Route,
            "PathMatchConditionsNotValid",
            format!("path {path:?} must begin with '/'"),
        ));
    }
    if path_type == "Exact" {
        return Ok(PathMatch::Exact(path.to_string()));
    }
    if path.contains(REGEX_CHARS) {
        regex::Regex::new(path).map_err(|error| {
            Invalid::new(
                ConditionType::Route,
                "PathMatchConditionsNotValid",
                format!("invalid regular expression {path:?}: {error}"),
            )
        })?;
        return Ok(PathMatch::Regex(path.to_string()));
    }
    Ok(PathMatch::Prefix(path.to_string()))
}

// === impl Annotations ===

impl Annotations {
    fn parse(meta: &ObjectMeta) -> Result<Self, Invalid> {
        let get = |key: &str| {
            meta.annotations
                .as_ref()
                .and_then(|a| a.get(key))
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
        };
        let invalid = |key: &str, message: String| {
            Invalid::new(
                ConditionType::Spec,
                "AnnotationNotValid",
                format!("annotation {key}: {message}"),
            )
        };

        let response_timeout = Timeout::parse_opt(get(RESPONSE_TIMEOUT))
            .map_err(|e| invalid(RESPONSE_TIMEOUT, e.to_string()))?;

        let retry = match get(RETRY_ON) {
            None => None,
            Some(retry_on) => {
                let num_retries = get(NUM_RETRIES)
                    .map(str::parse::<u32>)
                    .transpose()
                    .map_err(|e| invalid(NUM_RETRIES, e.to_string()))?
                    .unwrap_or(1);
                let per_try_timeout = Timeout::parse_opt(get(PER_TRY_TIMEOUT))
                    .map_err(|e| invalid(PER_TRY_TIMEOUT, e.to_string()))?;
                Some(RetryPolicy {
                    retry_on: split_list(retry_on),
                    num_retries,
                    per_try_timeout,
                })
            }
        };

        Ok(Self {
            force_ssl_redirect: get(FORCE_SSL_REDIRECT) == Some("true"),
            allow_http: get(ALLOW_HTTP) != Some("false"),
            websocket_paths: get(WEBSOCKET_ROUTES).map(split_list).unwrap_or_default(),
            response_timeout,
            retry,
        })
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .collect()
}
