use super::{Context, Host, HostRoute, Insecure, Processor};
use ahash::AHashSet as HashSet;
use ingress_controller_core::{
    graph::{FallbackCertificate, Route, RouteAction, VirtualHostTls},
    Listener, ListenerProtocol, VirtualHost, HTTPS_LISTENER_NAME, HTTP_LISTENER_NAME,
};

/// Places claimed virtual hosts on the plaintext and TLS listeners.
pub(crate) struct ListenerProcessor;

impl Processor for ListenerProcessor {
    fn name(&self) -> &'static str {
        "listener"
    }

    fn run(&self, ctx: &mut Context<'_>) {
        let hosts = std::mem::take(&mut ctx.hosts);

        let mut insecure = Vec::new();
        let mut secure = Vec::new();
        let mut fallback = Vec::new();
        for (fqdn, host) in hosts {
            let Host {
                owner,
                tls,
                authorization,
                tcp_proxy,
                routes,
            } = host;
            let routes = dedupe(routes);

            let plaintext = plaintext_routes(&tls, authorization.is_some(), &routes);
            if !plaintext.is_empty() {
                let mut vhost = VirtualHost::new(fqdn.clone());
                vhost.routes = plaintext;
                insecure.push(vhost);
            }

            let tls = match tls {
                Some(tls) => tls,
                None => continue,
            };
            if routes.is_empty() && tcp_proxy.is_none() {
                tracing::debug!(%fqdn, %owner, "Secure virtual host has no routes");
                continue;
            }
            let vhost = VirtualHost {
                fqdn,
                routes: routes.into_iter().map(|r| r.route).collect(),
                tls: Some(tls),
                authorization,
                tcp_proxy,
            };
            if vhost.fallback_enabled() {
                fallback.push(vhost.clone());
            }
            secure.push(vhost);
        }

        ctx.listeners.push(Listener {
            name: HTTP_LISTENER_NAME.to_string(),
            port: ctx.config.http_port,
            protocol: ListenerProtocol::Http,
            virtual_hosts: insecure,
            fallback_certificate: None,
        });

        if secure.is_empty() {
            return;
        }
        let fallback_certificate = match ctx.fallback_secret.as_ref() {
            Some(secret) if !fallback.is_empty() => Some(FallbackCertificate {
                secret: secret.clone(),
                virtual_hosts: fallback,
            }),
            _ => None,
        };
        ctx.listeners.push(Listener {
            name: HTTPS_LISTENER_NAME.to_string(),
            port: ctx.config.https_port,
            protocol: ListenerProtocol::Https,
            virtual_hosts: secure,
            fallback_certificate,
        });
    }
}

/// Drops routes that duplicate an earlier route's match and orders the rest
/// by precedence.
fn dedupe(routes: Vec<HostRoute>) -> Vec<HostRoute> {
    let mut seen = HashSet::default();
    let mut routes = routes
        .into_iter()
        .filter(|r| seen.insert(r.route.match_key()))
        .collect::<Vec<_>>();
    routes.sort_by(|a, b| a.route.precedence_cmp(&b.route));
    routes
}

/// Routes served on the plaintext listener.
///
/// Authorization is only enforced over TLS, so routes of a virtual host with
/// an authorization server always redirect.
fn plaintext_routes(tls: &Option<VirtualHostTls>, authorized: bool, routes: &[HostRoute]) -> Vec<Route> {
    if matches!(tls, Some(VirtualHostTls::Passthrough)) {
        return Vec::new();
    }
    routes
        .iter()
        .filter_map(|r| match r.insecure {
            Insecure::Drop => None,
            Insecure::Serve if !authorized => Some(Route {
                authorization: None,
                ..r.route.clone()
            }),
            Insecure::Serve | Insecure::Redirect => Some(Route {
                path: r.route.path.clone(),
                headers: r.route.headers.clone(),
                action: RouteAction::HttpsRedirect,
                authorization: None,
            }),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ingress_controller_core::graph::{Forward, PathMatch, RouteAuthorization};
    use pretty_assertions::assert_eq;

    fn route(prefix: &str, insecure: Insecure) -> HostRoute {
        HostRoute {
            route: Route {
                path: PathMatch::Prefix(prefix.to_string()),
                headers: vec![],
                action: RouteAction::Forward(Forward::default()),
                authorization: Some(RouteAuthorization::default()),
            },
            insecure,
        }
    }

    #[test]
    fn first_duplicate_wins() {
        let mut second = route("/", Insecure::Serve);
        second.route.action = RouteAction::HttpsRedirect;
        let routes = dedupe(vec![
            route("/", Insecure::Serve),
            route("/api", Insecure::Serve),
            second,
        ]);
        assert_eq!(routes.len(), 2);
        assert_eq!(routes[0].route.path, PathMatch::Prefix("/api".to_string()));
        assert_eq!(routes[1].route.action, RouteAction::Forward(Forward::default()));
    }

    #[test]
    fn plaintext_dispositions() {
        let tls = Some(VirtualHostTls::Terminate {
            secret: "default/cert".to_string(),
            min_protocol: Default::default(),
            client_validation: None,
            fallback: false,
        });
        let routes = vec![
            route("/a", Insecure::Serve),
            route("/b", Insecure::Redirect),
            route("/c", Insecure::Drop),
        ];

        let served = plaintext_routes(&tls, false, &routes);
        assert_eq!(served.len(), 2);
        assert!(matches!(served[0].action, RouteAction::Forward(_)));
        assert_eq!(served[0].authorization, None);
        assert_eq!(served[1].action, RouteAction::HttpsRedirect);

        let authorized = plaintext_routes(&tls, true, &routes);
        assert!(authorized
            .iter()
            .all(|r| r.action == RouteAction::HttpsRedirect));

        assert!(plaintext_routes(&Some(VirtualHostTls::Passthrough), false, &routes).is_empty());
    }
}
