use super::{Config, Invalid};
use crate::store::{Snapshot, CA_CERT_KEY, TLS_CERT_KEY, TLS_PRIVATE_KEY};
use ingress_controller_core::{
    cluster::{DnsTarget, UpstreamParams},
    Cluster, ClusterDiscovery, ConditionType, ResourceId, Secret, SecretData, UpstreamProtocol,
};
use ingress_controller_k8s_api as k8s;

/// Service annotations that select an upstream protocol for a comma-separated
/// list of port names or numbers.
const UPSTREAM_PROTOCOL_ANNOTATIONS: [(&str, UpstreamProtocol); 3] = [
    ("projectcontour.io/upstream-protocol.h2", UpstreamProtocol::H2),
    ("projectcontour.io/upstream-protocol.h2c", UpstreamProtocol::H2c),
    ("projectcontour.io/upstream-protocol.tls", UpstreamProtocol::Tls),
];

#[derive(Copy, Clone, Debug)]
pub(crate) enum PortRef<'a> {
    Number(i32),
    Name(&'a str),
}

/// A service port that routes may forward to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct ServicePort {
    pub(crate) id: ResourceId,
    pub(crate) port: u16,
    /// The name under which the endpoint cache publishes this port's
    /// addresses.
    pub(crate) eds_name: String,
    /// Set for `ExternalName` services, which are resolved through DNS.
    pub(crate) external_name: Option<String>,
    /// The protocol selected by the service's annotations, if any.
    pub(crate) protocol: Option<UpstreamProtocol>,
}

/// Resolves a TLS certificate secret referenced from `from_ns`.
///
/// References may name a secret in another namespace as `namespace/name`
/// when a TLSCertificateDelegation in that namespace permits it.
pub(crate) fn tls_secret(
    snapshot: &Snapshot,
    reference: &str,
    from_ns: &str,
    condition: ConditionType,
) -> Result<Secret, Invalid> {
    let id = ResourceId::parse_ref(reference, from_ns);
    check_delegation(snapshot, &id, from_ns, condition)?;

    let secret = snapshot.secrets.get(&id).ok_or_else(|| {
        Invalid::new(condition, "SecretNotValid", format!("Secret not found: {id}"))
    })?;
    let (cert, key) = match (data(secret, TLS_CERT_KEY), data(secret, TLS_PRIVATE_KEY)) {
        (Some(cert), Some(key)) => (cert, key),
        _ => {
            return Err(Invalid::new(
                condition,
                "SecretNotValid",
                format!("Secret {id} is not a TLS certificate"),
            ))
        }
    };
    Ok(Secret {
        name: id.to_string(),
        data: SecretData::Tls { cert, key },
    })
}

/// Resolves a CA bundle secret referenced from `from_ns`.
pub(crate) fn ca_secret(
    snapshot: &Snapshot,
    reference: &str,
    from_ns: &str,
    condition: ConditionType,
) -> Result<Secret, Invalid> {
    let id = ResourceId::parse_ref(reference, from_ns);
    check_delegation(snapshot, &id, from_ns, condition)?;

    let ca = snapshot
        .secrets
        .get(&id)
        .and_then(|s| data(s, CA_CERT_KEY))
        .ok_or_else(|| {
            Invalid::new(
                condition,
                "SecretNotValid",
                format!("CA secret {id} not found or missing {CA_CERT_KEY}"),
            )
        })?;
    Ok(Secret {
        name: ca_secret_name(&id),
        data: SecretData::Ca { ca },
    })
}

/// CA bundles are published separately from certificates so that one
/// Kubernetes secret may serve as both.
pub(crate) fn ca_secret_name(id: &ResourceId) -> String {
    format!("{id}/ca")
}

fn check_delegation(
    snapshot: &Snapshot,
    id: &ResourceId,
    from_ns: &str,
    condition: ConditionType,
) -> Result<(), Invalid> {
    if id.namespace == from_ns {
        return Ok(());
    }
    let permitted = snapshot
        .delegations
        .iter()
        .filter(|(d, _)| d.namespace == id.namespace)
        .any(|(_, d)| d.spec.permits(&id.name, from_ns));
    if permitted {
        return Ok(());
    }
    Err(Invalid::new(
        condition,
        "DelegationNotPermitted",
        format!("Secret {id} is not delegated to namespace {from_ns}"),
    ))
}

fn data(secret: &k8s::Secret, key: &str) -> Option<Vec<u8>> {
    secret
        .data
        .as_ref()?
        .get(key)
        .map(|b| b.0.clone())
        .filter(|b| !b.is_empty())
}

/// Finds the port of a service that a backend references.
pub(crate) fn service_port(
    snapshot: &Snapshot,
    namespace: &str,
    name: &str,
    port: PortRef<'_>,
) -> Result<ServicePort, Invalid> {
    let id = ResourceId::new(namespace, name);
    let unresolved = |message: String| {
        Invalid::new(ConditionType::Service, "ServiceUnresolvedReference", message)
    };

    let service = snapshot
        .services
        .get(&id)
        .ok_or_else(|| unresolved(format!("Service {id} not found")))?;
    let spec = service
        .spec
        .as_ref()
        .ok_or_else(|| unresolved(format!("Service {id} has no spec")))?;
    let svc_port = spec
        .ports
        .iter()
        .flatten()
        .find(|p| match port {
            PortRef::Number(n) => p.port == n,
            PortRef::Name(n) => p.name.as_deref() == Some(n),
        })
        .ok_or_else(|| match port {
            PortRef::Number(n) => unresolved(format!("port {n} not found on Service {id}")),
            PortRef::Name(n) => unresolved(format!("port {n:?} not found on Service {id}")),
        })?;
    let number = u16::try_from(svc_port.port)
        .map_err(|_| unresolved(format!("port {} is out of range", svc_port.port)))?;

    // Endpoints ports carry the name of the service port they back, so an
    // unnamed service port matches the single unnamed endpoints port whatever
    // its target.
    let eds_name = match svc_port.name.as_deref() {
        Some(name) if !name.is_empty() => format!("{}/{}/{name}", id.namespace, id.name),
        _ => format!("{}/{}", id.namespace, id.name),
    };

    let external_name = match spec.type_.as_deref() {
        Some("ExternalName") => Some(
            spec.external_name
                .clone()
                .filter(|n| !n.is_empty())
                .ok_or_else(|| unresolved(format!("Service {id} has no externalName")))?,
        ),
        _ => None,
    };

    Ok(ServicePort {
        eds_name,
        id,
        port: number,
        external_name,
        protocol: annotated_protocol(service, svc_port),
    })
}

fn annotated_protocol(service: &k8s::Service, port: &k8s::ServicePort) -> Option<UpstreamProtocol> {
    let annotations = service.metadata.annotations.as_ref()?;
    let number = port.port.to_string();
    UPSTREAM_PROTOCOL_ANNOTATIONS
        .iter()
        .find(|(key, _)| {
            annotations.get(*key).is_some_and(|ports| {
                ports.split(',').map(str::trim).any(|p| {
                    p == number || (!p.is_empty() && port.name.as_deref() == Some(p))
                })
            })
        })
        .map(|(_, protocol)| *protocol)
}

/// Builds the cluster for a service port.
pub(crate) fn service_cluster(config: &Config, port: &ServicePort, params: UpstreamParams) -> Cluster {
    let name = Cluster::service_name(&port.id.namespace, &port.id.name, port.port, &params);
    let discovery = match &port.external_name {
        Some(host) => ClusterDiscovery::StrictDns {
            targets: vec![DnsTarget {
                host: host.clone(),
                port: port.port,
                weight: 1,
            }],
        },
        None => ClusterDiscovery::Eds {
            service_name: port.eds_name.clone(),
        },
    };
    let UpstreamParams {
        protocol,
        validation,
        sni,
        lb_strategy,
    } = params;
    Cluster {
        name,
        discovery,
        protocol,
        validation,
        sni,
        lb_strategy,
        connect_timeout: config.connect_timeout,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ingress_controller_k8s_api::{
        ByteString, CertificateDelegation, IntOrString, ObjectMeta, ServiceSpec, TlsCertificateDelegation,
        TlsCertificateDelegationSpec,
    };
    use maplit::btreemap;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn meta(ns: &str, name: &str) -> ObjectMeta {
        ObjectMeta {
            namespace: Some(ns.to_string()),
            name: Some(name.to_string()),
            ..Default::default()
        }
    }

    fn snapshot() -> Snapshot {
        let mut snapshot = Snapshot::default();
        snapshot.secrets.insert(
            ResourceId::new("certs", "wildcard"),
            Arc::new(k8s::Secret {
                metadata: meta("certs", "wildcard"),
                type_: Some("kubernetes.io/tls".to_string()),
                data: Some(btreemap! {
                    TLS_CERT_KEY.to_string() => ByteString(b"cert".to_vec()),
                    TLS_PRIVATE_KEY.to_string() => ByteString(b"key".to_vec()),
                    CA_CERT_KEY.to_string() => ByteString(b"ca".to_vec()),
                }),
                ..Default::default()
            }),
        );
        snapshot.delegations.insert(
            ResourceId::new("certs", "delegation"),
            Arc::new(TlsCertificateDelegation {
                metadata: meta("certs", "delegation"),
                spec: TlsCertificateDelegationSpec {
                    delegations: vec![CertificateDelegation {
                        secret_name: "wildcard".to_string(),
                        target_namespaces: vec!["app".to_string()],
                    }],
                },
            }),
        );
        snapshot.services.insert(
            ResourceId::new("app", "backend"),
            Arc::new(k8s::Service {
                metadata: ObjectMeta {
                    annotations: Some(btreemap! {
                        "projectcontour.io/upstream-protocol.h2c".to_string() => "grpc".to_string(),
                    }),
                    ..meta("app", "backend")
                },
                spec: Some(ServiceSpec {
                    ports: Some(vec![
                        k8s::ServicePort {
                            port: 80,
                            target_port: Some(IntOrString::Int(8080)),
                            ..Default::default()
                        },
                        k8s::ServicePort {
                            name: Some("grpc".to_string()),
                            port: 9090,
                            ..Default::default()
                        },
                    ]),
                    ..Default::default()
                }),
                ..Default::default()
            }),
        );
        snapshot
    }

    #[test]
    fn delegated_secrets() {
        let snapshot = snapshot();
        let secret = tls_secret(&snapshot, "certs/wildcard", "app", ConditionType::Tls)
            .expect("delegated secret must resolve");
        assert_eq!(secret.name, "certs/wildcard");

        let err = tls_secret(&snapshot, "certs/wildcard", "other", ConditionType::Tls)
            .expect_err("undelegated secret must not resolve");
        assert_eq!(err.reason, "DelegationNotPermitted");

        let err = tls_secret(&snapshot, "missing", "certs", ConditionType::Tls)
            .expect_err("missing secret must not resolve");
        assert_eq!(err.reason, "SecretNotValid");
    }

    #[test]
    fn ca_secrets_are_named_separately() {
        let snapshot = snapshot();
        let ca = ca_secret(&snapshot, "wildcard", "certs", ConditionType::Service)
            .expect("CA must resolve");
        assert_eq!(ca.name, "certs/wildcard/ca");
        assert_eq!(ca.data, SecretData::Ca { ca: b"ca".to_vec() });
    }

    #[test]
    fn resolves_service_ports() {
        let snapshot = snapshot();
        let http = service_port(&snapshot, "app", "backend", PortRef::Number(80))
            .expect("port 80 must resolve");
        assert_eq!(http.eds_name, "app/backend");
        assert_eq!(http.protocol, None);

        let grpc = service_port(&snapshot, "app", "backend", PortRef::Name("grpc"))
            .expect("grpc port must resolve");
        assert_eq!(grpc.port, 9090);
        assert_eq!(grpc.eds_name, "app/backend/grpc");
        assert_eq!(grpc.protocol, Some(UpstreamProtocol::H2c));

        let err = service_port(&snapshot, "app", "backend", PortRef::Number(81))
            .expect_err("port 81 must not resolve");
        assert_eq!(err.reason, "ServiceUnresolvedReference");
    }
}
