use super::{
    lookup::{self, PortRef},
    Context, Host, HostRoute, Insecure, Invalid, Processor, Resources,
};
use ahash::AHashSet as HashSet;
use ingress_controller_core::{
    cluster::{UpstreamParams, UpstreamValidation},
    graph::{
        Authorization, ClientValidation, Forward, HeaderMatch, HeaderMatchValue, HeadersPolicy,
        PathMatch, RetryPolicy, Route, RouteAction, RouteAuthorization, TcpProxy, TimeoutPolicy,
        TlsVersion, VirtualHostTls, WeightedCluster,
    },
    path_rewrite::{self, PathRewriteError, PathRewritePolicy},
    timeout::Timeout,
    ConditionType, LoadBalancerStrategy, ObjectKey, ResourceId, StatusResult, UpstreamProtocol,
};
use ingress_controller_k8s_api::{httpproxy as api, HttpProxy};

/// Builds virtual hosts from root HTTPProxies and the proxies they include.
pub(crate) struct HttpProxyProcessor;

/// State carried down one root's include tree.
struct Walk {
    /// Whether the virtual host terminates TLS.
    secure: bool,
    /// The virtual host's default authorization policy, when an authorization
    /// server is configured.
    auth: Option<api::AuthorizationPolicy>,
    /// The include path from the root to the proxy being visited.
    stack: Vec<ResourceId>,
}

/// Routes and resources contributed by a valid proxy and its includes.
#[derive(Default)]
struct Contribution {
    routes: Vec<(ResourceId, HostRoute)>,
    resources: Resources,
}

/// Match conditions inherited from includes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
struct Conditions {
    prefix: Option<String>,
    headers: Vec<HeaderMatch>,
}

impl Processor for HttpProxyProcessor {
    fn name(&self) -> &'static str {
        "httpproxy"
    }

    fn run(&self, ctx: &mut Context<'_>) {
        let snapshot = ctx.snapshot;

        let mut roots = snapshot
            .http_proxies
            .iter()
            .filter(|(_, p)| p.spec.virtual_host.is_some())
            .collect::<Vec<_>>();
        // The oldest root claims a contested FQDN.
        roots.sort_by(|(a_id, a), (b_id, b)| {
            let a_created = a.metadata.creation_timestamp.as_ref().map(|t| t.0);
            let b_created = b.metadata.creation_timestamp.as_ref().map(|t| t.0);
            a_created.cmp(&b_created).then_with(|| a_id.cmp(b_id))
        });

        let mut reached = HashSet::default();
        for (id, proxy) in roots {
            let _span = tracing::debug_span!("root", namespace = %id.namespace, name = %id.name).entered();
            root(ctx, id, proxy, &mut reached);
        }

        let mut orphans = snapshot
            .http_proxies
            .iter()
            .filter(|(id, p)| p.spec.virtual_host.is_none() && !reached.contains(*id))
            .collect::<Vec<_>>();
        orphans.sort_by(|(a, _), (b, _)| a.cmp(b));
        for (id, proxy) in orphans {
            tracing::debug!(namespace = %id.namespace, name = %id.name, "Orphaned");
            let mut status = StatusResult::new(
                ObjectKey::http_proxy(&id.namespace, &id.name),
                proxy.metadata.generation,
            );
            status.set_orphaned();
            ctx.record(status);
        }
    }
}

fn root(ctx: &mut Context<'_>, id: &ResourceId, proxy: &HttpProxy, reached: &mut HashSet<ResourceId>) {
    let vhost = match proxy.spec.virtual_host.as_ref() {
        Some(vhost) => vhost,
        None => return,
    };
    let key = ObjectKey::http_proxy(&id.namespace, &id.name);
    let mut status = StatusResult::new(key.clone(), proxy.metadata.generation);
    reached.insert(id.clone());

    let roots = &ctx.config.root_namespaces;
    if !roots.is_empty() && !roots.contains(&id.namespace) {
        status.add_error(
            ConditionType::RootNamespace,
            "RootProxyNotAllowedInNamespace",
            "root HTTPProxy cannot be defined in this namespace",
        );
        ctx.record(status);
        return;
    }

    let fqdn = vhost.fqdn.trim().to_string();
    if let Err(invalid) = validate_fqdn(&fqdn) {
        invalid.record(&mut status);
        ctx.record(status);
        return;
    }
    if let Some(owner) = ctx.claims.get(&fqdn) {
        status.add_error(
            ConditionType::VirtualHost,
            "DuplicateVhost",
            format!("fqdn {fqdn:?} is already used by {owner}"),
        );
        ctx.record(status);
        return;
    }
    ctx.claims.insert(fqdn.clone(), key.clone());

    let mut resources = Resources::default();
    let tls = vhost
        .tls
        .as_ref()
        .and_then(|tls| virtual_host_tls(ctx, id, &proxy.spec, tls, &mut status, &mut resources));
    let authorization = vhost
        .authorization
        .as_ref()
        .and_then(|auth| authorization(ctx, id, vhost, auth, &mut status));
    let tcp_proxy = proxy
        .spec
        .tcp_proxy
        .as_ref()
        .and_then(|tcp| tcp_proxy(ctx, id, vhost, tcp, &mut status, &mut resources, reached));
    if !status.is_valid() {
        ctx.record(status);
        return;
    }

    let mut routes = Vec::new();
    if tcp_proxy.is_some() {
        if !proxy.spec.routes.is_empty() || !proxy.spec.includes.is_empty() {
            status.add_warning(
                ConditionType::TcpProxy,
                "RoutesIgnored",
                "routes and includes are ignored when tcpproxy is configured",
            );
        }
        ctx.record(status);
    } else {
        // The walk folds the root's route errors into this status.
        ctx.record(status);
        let mut walk = Walk {
            secure: matches!(tls, Some(VirtualHostTls::Terminate { .. })),
            auth: authorization.as_ref().map(|_| {
                vhost
                    .authorization
                    .as_ref()
                    .and_then(|a| a.auth_policy.clone())
                    .unwrap_or_default()
            }),
            stack: Vec::new(),
        };
        let contribution = match walk.proxy(ctx, id, proxy, &Conditions::default(), reached) {
            Some(contribution) => contribution,
            None => return,
        };
        resources.extend(contribution.resources);

        // Duplicate matches are resolved in favor of the first route, so
        // routes are ordered by the name of the proxy that declared them.
        let mut contributed = contribution.routes;
        contributed.sort_by(|(a, _), (b, _)| a.cmp(b));
        routes = contributed.into_iter().map(|(_, route)| route).collect();
    }

    ctx.hosts.insert(
        fqdn,
        Host {
            owner: key,
            tls,
            authorization,
            tcp_proxy,
            routes,
        },
    );
    ctx.commit(resources);
}

fn validate_fqdn(fqdn: &str) -> Result<(), Invalid> {
    if fqdn.is_empty() {
        return Err(Invalid::new(
            ConditionType::VirtualHost,
            "FQDNNotSpecified",
            "virtualhost.fqdn must be specified",
        ));
    }
    let rest = fqdn.strip_prefix("*.").unwrap_or(fqdn);
    if rest.contains('*') {
        return Err(Invalid::new(
            ConditionType::VirtualHost,
            "WildCardNotAllowed",
            format!("fqdn {fqdn:?} may only contain a wildcard as its first label"),
        ));
    }
    if rest.is_empty() || rest.contains(|c: char| c.is_whitespace() || c == '/' || c == ':') {
        return Err(Invalid::new(
            ConditionType::VirtualHost,
            "FQDNNotValid",
            format!("fqdn {fqdn:?} is not a valid host name"),
        ));
    }
    Ok(())
}

fn virtual_host_tls(
    ctx: &mut Context<'_>,
    id: &ResourceId,
    spec: &api::HttpProxySpec,
    tls: &api::Tls,
    status: &mut StatusResult,
    resources: &mut Resources,
) -> Option<VirtualHostTls> {
    let invalid = |reason: &'static str, message: &str| {
        Invalid::new(ConditionType::Tls, reason, message.to_string())
    };
    let secret_name = tls.secret_name.as_deref().filter(|s| !s.is_empty());

    if tls.passthrough {
        let error = if secret_name.is_some() {
            Some(invalid(
                "TLSConfigNotValid",
                "tls.passthrough cannot be combined with tls.secretName",
            ))
        } else if spec.tcp_proxy.is_none() {
            Some(invalid("TLSConfigNotValid", "tls.passthrough requires tcpproxy"))
        } else if tls.client_validation.is_some() || tls.enable_fallback_certificate {
            Some(invalid(
                "TLSIncompatibleFeatures",
                "tls.passthrough cannot be combined with client validation or the fallback certificate",
            ))
        } else {
            None
        };
        return match error {
            Some(error) => {
                error.record(status);
                None
            }
            None => Some(VirtualHostTls::Passthrough),
        };
    }

    let secret_name = match secret_name {
        Some(name) => name,
        None => {
            invalid(
                "TLSConfigNotValid",
                "either tls.secretName or tls.passthrough must be specified",
            )
            .record(status);
            return None;
        }
    };
    if tls.enable_fallback_certificate && tls.client_validation.is_some() {
        invalid(
            "TLSIncompatibleFeatures",
            "tls.enableFallbackCertificate cannot be combined with tls.clientValidation",
        )
        .record(status);
        return None;
    }
    let min_protocol = match tls.minimum_protocol_version.as_deref() {
        None | Some("") | Some("1.2") => TlsVersion::V1_2,
        Some("1.3") => TlsVersion::V1_3,
        Some(other) => {
            Invalid::new(
                ConditionType::Tls,
                "TLSConfigNotValid",
                format!("unsupported minimum protocol version {other:?}"),
            )
            .record(status);
            return None;
        }
    };

    let snapshot = ctx.snapshot;
    let secret = match lookup::tls_secret(snapshot, secret_name, &id.namespace, ConditionType::Tls) {
        Ok(secret) => secret,
        Err(error) => {
            error.record(status);
            return None;
        }
    };

    let client_validation = match tls.client_validation.as_ref() {
        None => None,
        Some(v) if v.skip_client_cert_validation => Some(ClientValidation { ca_secret: None }),
        Some(v) => {
            let ca = match v.ca_secret.as_deref().filter(|s| !s.is_empty()) {
                Some(ca) => ca,
                None => {
                    invalid(
                        "ClientValidationInvalid",
                        "tls.clientValidation.caSecret must be specified",
                    )
                    .record(status);
                    return None;
                }
            };
            match lookup::ca_secret(snapshot, ca, &id.namespace, ConditionType::Tls) {
                Ok(ca) => {
                    let name = ca.name.clone();
                    resources.secrets.push(ca);
                    Some(ClientValidation {
                        ca_secret: Some(name),
                    })
                }
                Err(error) => {
                    error.record(status);
                    return None;
                }
            }
        }
    };

    if tls.enable_fallback_certificate {
        let fallback = match ctx.config.fallback_certificate.as_ref() {
            Some(fallback) => fallback,
            None => {
                invalid(
                    "FallbackNotPresent",
                    "tls.enableFallbackCertificate requires a configured fallback certificate",
                )
                .record(status);
                return None;
            }
        };
        match lookup::tls_secret(snapshot, &fallback.to_string(), &fallback.namespace, ConditionType::Tls) {
            Ok(secret) => {
                ctx.fallback_secret = Some(secret.name.clone());
                resources.secrets.push(secret);
            }
            Err(error) => {
                Invalid::new(ConditionType::Tls, "FallbackNotValid", error.message).record(status);
                return None;
            }
        }
    }

    let name = secret.name.clone();
    resources.secrets.push(secret);
    Some(VirtualHostTls::Terminate {
        secret: name,
        min_protocol,
        client_validation,
        fallback: tls.enable_fallback_certificate,
    })
}

fn authorization(
    ctx: &Context<'_>,
    id: &ResourceId,
    vhost: &api::VirtualHost,
    auth: &api::AuthorizationServer,
    status: &mut StatusResult,
) -> Option<Authorization> {
    let terminates = vhost
        .tls
        .as_ref()
        .is_some_and(|tls| !tls.passthrough);
    if !terminates {
        status.add_error(
            ConditionType::Tls,
            "TLSIncompatibleFeatures",
            "authorization requires TLS termination",
        );
        return None;
    }

    let ext_id = ResourceId::new(
        auth.extension_ref
            .namespace
            .clone()
            .filter(|ns| !ns.is_empty())
            .unwrap_or_else(|| id.namespace.clone()),
        auth.extension_ref.name.clone(),
    );
    let extension = match ctx.extensions.get(&ext_id) {
        Some(extension) => extension,
        None => {
            status.add_error(
                ConditionType::Auth,
                "ExtensionServiceNotFound",
                format!("ExtensionService {ext_id} is missing or invalid"),
            );
            return None;
        }
    };

    let response_timeout = match Timeout::parse_opt(auth.response_timeout.as_deref()) {
        Ok(Timeout::Default) => extension.response_timeout,
        Ok(timeout) => timeout,
        Err(error) => {
            status.add_error(
                ConditionType::Auth,
                "AuthResponseTimeoutInvalid",
                format!("invalid authorization response timeout: {error}"),
            );
            return None;
        }
    };

    Some(Authorization {
        cluster: extension.cluster.clone(),
        response_timeout,
        fail_open: auth.fail_open,
    })
}

fn tcp_proxy(
    ctx: &mut Context<'_>,
    id: &ResourceId,
    vhost: &api::VirtualHost,
    tcp: &api::TcpProxy,
    status: &mut StatusResult,
    resources: &mut Resources,
    reached: &mut HashSet<ResourceId>,
) -> Option<TcpProxy> {
    let invalid = |reason: &'static str, message: String| {
        Invalid::new(ConditionType::TcpProxy, reason, message)
    };
    if vhost.tls.is_none() {
        invalid(
            "TLSMustBeConfigured",
            "tcpproxy requires TLS termination or passthrough".to_string(),
        )
        .record(status);
        return None;
    }

    let snapshot = ctx.snapshot;
    let (services, lb_policy, namespace) = match (tcp.include.as_ref(), tcp.services.is_empty()) {
        (Some(_), false) => {
            invalid(
                "NoServicesAndInclude",
                "tcpproxy cannot specify both services and include".to_string(),
            )
            .record(status);
            return None;
        }
        (None, true) => {
            invalid(
                "NothingDefined",
                "tcpproxy must specify either services or include".to_string(),
            )
            .record(status);
            return None;
        }
        (None, false) => (&tcp.services, tcp.load_balancer_policy.as_ref(), id.namespace.as_str()),
        (Some(include), true) => {
            let target_id = ResourceId::new(
                include
                    .namespace
                    .clone()
                    .filter(|ns| !ns.is_empty())
                    .unwrap_or_else(|| id.namespace.clone()),
                include.name.clone(),
            );
            let target = match snapshot.http_proxies.get(&target_id) {
                Some(target) => target,
                None => {
                    invalid("IncludeNotFound", format!("tcpproxy include {target_id} not found"))
                        .record(status);
                    return None;
                }
            };
            let target_tcp = match target.spec.tcp_proxy.as_ref() {
                Some(t) if t.include.is_none() && !t.services.is_empty() => t,
                _ => {
                    invalid(
                        "TCPProxyIncludeNotValid",
                        format!("included HTTPProxy {target_id} must define tcpproxy services"),
                    )
                    .record(status);
                    return None;
                }
            };
            reached.insert(target_id.clone());
            ctx.record(StatusResult::new(
                ObjectKey::http_proxy(&target_id.namespace, &target_id.name),
                target.metadata.generation,
            ));
            (
                &target_tcp.services,
                target_tcp.load_balancer_policy.as_ref(),
                target.metadata.namespace.as_deref().unwrap_or(&id.namespace),
            )
        }
    };

    let lb_strategy = match lb_policy.map(|p| p.strategy.parse::<LoadBalancerStrategy>()) {
        None => LoadBalancerStrategy::default(),
        Some(Ok(strategy)) => strategy,
        Some(Err(error)) => {
            invalid("LoadBalancerPolicyNotValid", error.to_string()).record(status);
            return None;
        }
    };

    let mut clusters = Vec::with_capacity(services.len());
    for service in services {
        match upstream(ctx, namespace, service, lb_strategy, resources) {
            Ok(name) => clusters.push(WeightedCluster {
                name,
                weight: service.weight.unwrap_or(0),
                request_headers: HeadersPolicy::default(),
                response_headers: HeadersPolicy::default(),
            }),
            Err(error) => error.record(status),
        }
    }
    if !status.is_valid() {
        return None;
    }
    equalize_weights(&mut clusters);
    Some(TcpProxy { clusters })
}

// === impl Walk ===

impl Walk {
    /// Visits a proxy and, depth-first, the proxies it includes.
    ///
    /// Returns nothing if the proxy has any error, in which case neither it
    /// nor its includes contribute routes.
    fn proxy(
        &mut self,
        ctx: &mut Context<'_>,
        id: &ResourceId,
        proxy: &HttpProxy,
        conditions: &Conditions,
        reached: &mut HashSet<ResourceId>,
    ) -> Option<Contribution> {
        let snapshot = ctx.snapshot;
        reached.insert(id.clone());
        let mut status = StatusResult::new(
            ObjectKey::http_proxy(&id.namespace, &id.name),
            proxy.metadata.generation,
        );
        self.stack.push(id.clone());

        let mut contribution = Contribution::default();
        for route in &proxy.spec.routes {
            if let Some((routes, resources)) = self.route(ctx, id, route, conditions, &mut status) {
                contribution
                    .routes
                    .extend(routes.into_iter().map(|r| (id.clone(), r)));
                contribution.resources.extend(resources);
            }
        }

        let mut seen = Vec::<&[api::MatchCondition]>::new();
        for include in &proxy.spec.includes {
            if seen.contains(&include.conditions.as_slice()) {
                status.add_error(
                    ConditionType::Include,
                    "DuplicateMatchConditions",
                    "duplicate conditions defined on an include",
                );
                continue;
            }
            seen.push(&include.conditions);

            let composed = match conditions.include(&include.conditions) {
                Ok(composed) => composed,
                Err(message) => {
                    status.add_error(ConditionType::Include, "PathMatchConditionsNotValid", message);
                    continue;
                }
            };
            let target_id = ResourceId::new(
                include
                    .namespace
                    .clone()
                    .filter(|ns| !ns.is_empty())
                    .unwrap_or_else(|| id.namespace.clone()),
                include.name.clone(),
            );
            let target = match snapshot.http_proxies.get(&target_id) {
                Some(target) => target,
                None => {
                    status.add_error(
                        ConditionType::Include,
                        "IncludeNotFound",
                        format!("include {target_id} not found"),
                    );
                    continue;
                }
            };
            if target.spec.virtual_host.is_some() {
                status.add_error(
                    ConditionType::Include,
                    "RootIncludesRoot",
                    format!("root HTTPProxy cannot include another root HTTPProxy ({target_id})"),
                );
                continue;
            }
            if self.stack.contains(&target_id) {
                let cycle = self
                    .stack
                    .iter()
                    .chain(std::iter::once(&target_id))
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(" -> ");
                status.add_error(
                    ConditionType::Include,
                    "IncludeCreatesCycle",
                    format!("include creates an include cycle: {cycle}"),
                );
                continue;
            }

            if let Some(child) = self.proxy(ctx, &target_id, target, &composed, reached) {
                contribution.routes.extend(child.routes);
                contribution.resources.extend(child.resources);
            }
        }
        self.stack.pop();

        let valid = status.is_valid();
        if !valid {
            tracing::debug!(namespace = %id.namespace, name = %id.name, "Invalid HTTPProxy");
        }
        ctx.record(status);
        valid.then_some(contribution)
    }

    fn route(
        &self,
        ctx: &Context<'_>,
        id: &ResourceId,
        route: &api::Route,
        conditions: &Conditions,
        status: &mut StatusResult,
    ) -> Option<(Vec<HostRoute>, Resources)> {
        let mut errors = Vec::<Invalid>::new();

        let (path, headers) = match conditions.route(&route.conditions) {
            Ok(matched) => matched,
            Err(message) => {
                errors.push(Invalid::new(
                    ConditionType::Route,
                    "PathMatchConditionsNotValid",
                    message,
                ));
                (PathMatch::Prefix("/".to_string()), Vec::new())
            }
        };

        let authorization = match (&self.auth, &route.auth_policy) {
            (None, None) => None,
            (None, Some(_)) => {
                errors.push(Invalid::new(
                    ConditionType::Auth,
                    "AuthNotPermitted",
                    "route authorization policy requires the virtual host to configure authorization",
                ));
                None
            }
            (Some(default), policy) => {
                let mut context = default.context.clone();
                if let Some(policy) = policy {
                    context.extend(policy.context.clone());
                }
                Some(RouteAuthorization {
                    disabled: policy.as_ref().map_or(default.disabled, |p| p.disabled),
                    context,
                })
            }
        };

        let timeouts = match route.timeout_policy.as_ref().map(timeout_policy) {
            None => TimeoutPolicy::default(),
            Some(Ok(timeouts)) => timeouts,
            Some(Err(error)) => {
                errors.push(error);
                TimeoutPolicy::default()
            }
        };

        let retry = match route.retry_policy.as_ref() {
            None => None,
            Some(retry) => match Timeout::parse_opt(retry.per_try_timeout.as_deref()) {
                Ok(per_try_timeout) => Some(RetryPolicy {
                    retry_on: if retry.retry_on.is_empty() {
                        vec!["5xx".to_string()]
                    } else {
                        retry.retry_on.clone()
                    },
                    num_retries: retry.count.unwrap_or(1),
                    per_try_timeout,
                }),
                Err(error) => {
                    errors.push(Invalid::new(
                        ConditionType::Route,
                        "TimeoutPolicyNotValid",
                        format!("invalid per-try timeout: {error}"),
                    ));
                    None
                }
            },
        };

        let lb_strategy = match route
            .load_balancer_policy
            .as_ref()
            .map(|p| p.strategy.parse::<LoadBalancerStrategy>())
        {
            None => LoadBalancerStrategy::default(),
            Some(Ok(strategy)) => strategy,
            Some(Err(error)) => {
                errors.push(Invalid::new(
                    ConditionType::Route,
                    "LoadBalancerPolicyNotValid",
                    error.to_string(),
                ));
                LoadBalancerStrategy::default()
            }
        };

        let request_headers = headers_policy(route.request_headers_policy.as_ref(), true)
            .unwrap_or_else(|message| {
                errors.push(Invalid::new(ConditionType::Route, "RequestHeadersPolicyInvalid", message));
                HeadersPolicy::default()
            });
        let response_headers = headers_policy(route.response_headers_policy.as_ref(), false)
            .unwrap_or_else(|message| {
                errors.push(Invalid::new(ConditionType::Route, "ResponseHeadersPolicyInvalid", message));
                HeadersPolicy::default()
            });

        let rewrite = match route.path_rewrite_policy.as_ref() {
            None => None,
            Some(policy) => {
                let policy = PathRewritePolicy::new(
                    policy
                        .replace_prefix
                        .iter()
                        .map(|r| (r.prefix.clone(), r.replacement.clone())),
                );
                match (policy.validate(), &path) {
                    (Err(error), _) => {
                        let reason = match error {
                            PathRewriteError::DuplicatePrefix(_)
                            | PathRewriteError::AmbiguousEmptyPrefix => "AmbiguousPrefix",
                            _ => "PathRewritePolicyNotValid",
                        };
                        errors.push(Invalid::new(ConditionType::PathRewrite, reason, error.to_string()));
                        None
                    }
                    (Ok(()), PathMatch::Prefix(prefix)) => policy.rewrite(prefix),
                    (Ok(()), _) => {
                        errors.push(Invalid::new(
                            ConditionType::PathRewrite,
                            "IncompatiblePathMatch",
                            "path rewriting requires a prefix condition",
                        ));
                        None
                    }
                }
            }
        };

        let mut resources = Resources::default();
        let mut clusters = Vec::with_capacity(route.services.len());
        let mut mirror = None;
        for service in &route.services {
            let name = match upstream(ctx, &id.namespace, service, lb_strategy, &mut resources) {
                Ok(name) => name,
                Err(error) => {
                    errors.push(error);
                    continue;
                }
            };
            if service.mirror {
                if mirror.is_some() {
                    errors.push(Invalid::new(
                        ConditionType::Service,
                        "OnlyOneMirror",
                        "only one service per route may be nominated as mirror",
                    ));
                }
                mirror = Some(name);
                continue;
            }
            let request_headers = headers_policy(service.request_headers_policy.as_ref(), true);
            let response_headers = headers_policy(service.response_headers_policy.as_ref(), false);
            match (request_headers, response_headers) {
                (Ok(request_headers), Ok(response_headers)) => clusters.push(WeightedCluster {
                    name,
                    weight: service.weight.unwrap_or(0),
                    request_headers,
                    response_headers,
                }),
                (Err(message), _) => errors.push(Invalid::new(
                    ConditionType::Service,
                    "RequestHeadersPolicyInvalid",
                    message,
                )),
                (_, Err(message)) => errors.push(Invalid::new(
                    ConditionType::Service,
                    "ResponseHeadersPolicyInvalid",
                    message,
                )),
            }
        }
        if clusters.is_empty() && errors.is_empty() {
            errors.push(Invalid::new(
                ConditionType::Route,
                "NoServicesPresent",
                "route must have at least one non-mirror service",
            ));
        }

        if !errors.is_empty() {
            for error in errors {
                error.record(status);
            }
            return None;
        }
        equalize_weights(&mut clusters);

        let insecure = if !self.secure
            || (route.permit_insecure && !ctx.config.disable_permit_insecure)
        {
            Insecure::Serve
        } else {
            Insecure::Redirect
        };
        let paths = match path {
            PathMatch::Prefix(prefix) => path_rewrite::expand_prefix(&prefix, rewrite.as_deref()),
            path => vec![(path, None)],
        };
        let routes = paths
            .into_iter()
            .map(|(path, prefix_rewrite)| HostRoute {
                route: Route {
                    path,
                    headers: headers.clone(),
                    action: RouteAction::Forward(Forward {
                        clusters: clusters.clone(),
                        mirror: mirror.clone(),
                        prefix_rewrite,
                        timeouts,
                        retry: retry.clone(),
                        websocket: route.enable_websockets,
                        cookie_affinity: lb_strategy == LoadBalancerStrategy::Cookie,
                        request_headers: request_headers.clone(),
                        response_headers: response_headers.clone(),
                    }),
                    authorization: authorization.clone(),
                },
                insecure,
            })
            .collect();
        Some((routes, resources))
    }
}

/// Resolves an HTTPProxy service reference to a cluster name, adding the
/// cluster and any CA secret to `resources`.
fn upstream(
    ctx: &Context<'_>,
    namespace: &str,
    service: &api::Service,
    lb_strategy: LoadBalancerStrategy,
    resources: &mut Resources,
) -> Result<String, Invalid> {
    if !(1..=65535).contains(&service.port) {
        return Err(Invalid::new(
            ConditionType::Service,
            "ServiceUnresolvedReference",
            format!("service {} port {} is out of range", service.name, service.port),
        ));
    }
    let port = lookup::service_port(ctx.snapshot, namespace, &service.name, PortRef::Number(service.port))?;

    let mut protocol = match service.protocol.as_deref() {
        None => port.protocol.unwrap_or_default(),
        Some(protocol) => UpstreamProtocol::parse(Some(protocol)).map_err(|error| {
            Invalid::new(ConditionType::Service, "UnsupportedProtocol", error.to_string())
        })?,
    };

    let validation = match service.validation.as_ref() {
        None => None,
        Some(v) => {
            if protocol == UpstreamProtocol::H2c {
                return Err(Invalid::new(
                    ConditionType::Service,
                    "UnsupportedProtocol",
                    "upstream validation requires a TLS protocol",
                ));
            }
            let ca = lookup::ca_secret(ctx.snapshot, &v.ca_secret, namespace, ConditionType::Service)?;
            if !protocol.is_tls() {
                protocol = UpstreamProtocol::Tls;
            }
            let validation = UpstreamValidation {
                ca_secret: ca.name.clone(),
                subject_name: v.subject_name.clone(),
            };
            resources.secrets.push(ca);
            Some(validation)
        }
    };

    let sni = validation.as_ref().map(|v| v.subject_name.clone());
    let cluster = lookup::service_cluster(
        ctx.config,
        &port,
        UpstreamParams {
            protocol,
            validation,
            sni,
            lb_strategy,
        },
    );
    let name = cluster.name.clone();
    resources.clusters.push(cluster);
    Ok(name)
}

fn timeout_policy(policy: &api::TimeoutPolicy) -> Result<TimeoutPolicy, Invalid> {
    let parse = |value: Option<&String>, field: &str| {
        Timeout::parse_opt(value.map(String::as_str)).map_err(|error| {
            Invalid::new(
                ConditionType::Route,
                "TimeoutPolicyNotValid",
                format!("invalid {field} timeout: {error}"),
            )
        })
    };
    Ok(TimeoutPolicy {
        response: parse(policy.response.as_ref(), "response")?,
        idle: parse(policy.idle.as_ref(), "idle")?,
    })
}

fn headers_policy(policy: Option<&api::HeadersPolicy>, allow_host: bool) -> Result<HeadersPolicy, String> {
    let mut headers = HeadersPolicy::default();
    let policy = match policy {
        Some(policy) => policy,
        None => return Ok(headers),
    };

    for api::HeaderValue { name, value } in &policy.set {
        let name = name.trim().to_ascii_lowercase();
        if name.is_empty() {
            return Err("header name must not be empty".to_string());
        }
        if name == "host" && !allow_host {
            return Err("the Host header may only be set on requests".to_string());
        }
        if headers.set.insert(name.clone(), value.clone()).is_some() {
            return Err(format!("duplicate header addition: {name:?}"));
        }
    }
    for name in &policy.remove {
        let name = name.trim().to_ascii_lowercase();
        if name.is_empty() {
            return Err("header name must not be empty".to_string());
        }
        headers.remove.insert(name);
    }
    Ok(headers)
}

/// Gives every cluster an equal share when no weights are set.
fn equalize_weights(clusters: &mut [WeightedCluster]) {
    if clusters.iter().all(|c| c.weight == 0) {
        for cluster in clusters {
            cluster.weight = 1;
        }
    }
}

// === impl Conditions ===

impl Conditions {
    /// Composes an include's conditions onto the inherited ones.
    fn include(&self, conditions: &[api::MatchCondition]) -> Result<Self, String> {
        let mut composed = self.clone();
        let mut prefix = None;
        for condition in conditions {
            if condition.exact.is_some() || condition.regex.is_some() {
                return Err("include conditions may only match prefixes and headers".to_string());
            }
            if let Some(p) = condition.prefix.as_deref() {
                if prefix.is_some() {
                    return Err("more than one prefix is not allowed in a condition block".to_string());
                }
                validate_path(p)?;
                prefix = Some(p);
            }
            if let Some(header) = condition.header.as_ref() {
                composed.headers.push(header_match(header)?);
            }
        }
        if let Some(prefix) = prefix {
            composed.prefix = Some(join_prefix(self.prefix.as_deref(), prefix));
        }
        Ok(composed)
    }

    /// Resolves a route's conditions, qualified by the inherited ones.
    fn route(&self, conditions: &[api::MatchCondition]) -> Result<(PathMatch, Vec<HeaderMatch>), String> {
        let mut headers = self.headers.clone();
        let mut path = None;
        for condition in conditions {
            let paths = [
                condition.prefix.is_some(),
                condition.exact.is_some(),
                condition.regex.is_some(),
            ]
            .into_iter()
            .filter(|set| *set)
            .count();
            if paths > 1 || (paths == 1 && path.is_some()) {
                return Err("more than one path condition is not allowed".to_string());
            }

            if let Some(prefix) = condition.prefix.as_deref() {
                validate_path(prefix)?;
                path = Some(PathMatch::Prefix(join_prefix(self.prefix.as_deref(), prefix)));
            }
            if let Some(exact) = condition.exact.as_deref() {
                validate_path(exact)?;
                path = Some(PathMatch::Exact(join_prefix(self.prefix.as_deref(), exact)));
            }
            if let Some(re) = condition.regex.as_deref() {
                let re = match self.prefix.as_deref() {
                    Some(prefix) if prefix != "/" => {
                        format!("{}{}", regex::escape(prefix.trim_end_matches('/')), re)
                    }
                    _ => re.to_string(),
                };
                regex::Regex::new(&re)
                    .map_err(|error| format!("invalid regular expression {re:?}: {error}"))?;
                path = Some(PathMatch::Regex(re));
            }
            if let Some(header) = condition.header.as_ref() {
                headers.push(header_match(header)?);
            }
        }

        let path = path.unwrap_or_else(|| {
            PathMatch::Prefix(self.prefix.clone().unwrap_or_else(|| "/".to_string()))
        });
        Ok((path, headers))
    }
}

fn validate_path(path: &str) -> Result<(), String> {
    if path.starts_with('/') {
        Ok(())
    } else {
        Err(format!("path conditions must start with '/', {path:?} was supplied"))
    }
}

fn join_prefix(parent: Option<&str>, child: &str) -> String {
    match parent {
        None | Some("/") => child.to_string(),
        Some(parent) if child == "/" => parent.to_string(),
        Some(parent) => format!(
            "{}/{}",
            parent.trim_end_matches('/'),
            child.trim_start_matches('/')
        ),
    }
}

fn header_match(condition: &api::HeaderMatchCondition) -> Result<HeaderMatch, String> {
    let name = condition.name.trim();
    if name.is_empty() {
        return Err("header condition name must not be empty".to_string());
    }

    let mut matches = Vec::with_capacity(1);
    if condition.present {
        matches.push((HeaderMatchValue::Present, false));
    }
    if condition.not_present {
        matches.push((HeaderMatchValue::Present, true));
    }
    if let Some(v) = &condition.contains {
        matches.push((HeaderMatchValue::Contains(v.clone()), false));
    }
    if let Some(v) = &condition.not_contains {
        matches.push((HeaderMatchValue::Contains(v.clone()), true));
    }
    if let Some(v) = &condition.exact {
        matches.push((HeaderMatchValue::Exact(v.clone()), false));
    }
    if let Some(v) = &condition.not_exact {
        matches.push((HeaderMatchValue::Exact(v.clone()), true));
    }

    match matches.len() {
        1 => {
            let (value, invert) = matches.remove(0);
            Ok(HeaderMatch {
                name: name.to_ascii_lowercase(),
                value,
                invert,
            })
        }
        0 => Err(format!("header condition {name:?} must specify a match")),
        _ => Err(format!("header condition {name:?} may only specify one match")),
    }
}
