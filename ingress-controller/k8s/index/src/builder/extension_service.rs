use super::{
    lookup::{self, PortRef},
    Context, Extension, Processor, Resources,
};
use ingress_controller_core::{
    cluster::{DnsTarget, UpstreamValidation},
    timeout::Timeout,
    Cluster, ClusterDiscovery, ConditionType, LoadBalancerStrategy, ObjectKey, ResourceId,
    StatusResult, UpstreamProtocol,
};
use ingress_controller_k8s_api::ExtensionService;

/// Turns each ExtensionService into a DNS-resolved cluster.
pub(crate) struct ExtensionServiceProcessor;

impl Processor for ExtensionServiceProcessor {
    fn name(&self) -> &'static str {
        "extension-service"
    }

    fn run(&self, ctx: &mut Context<'_>) {
        let snapshot = ctx.snapshot;
        let mut ids = snapshot.extension_services.keys().collect::<Vec<_>>();
        ids.sort();

        for id in ids {
            let ext = &snapshot.extension_services[id];
            let mut status = StatusResult::new(
                ObjectKey::extension_service(&id.namespace, &id.name),
                ext.metadata.generation,
            );
            let mut resources = Resources::default();
            let extension = build(ctx, id, ext, &mut status, &mut resources);

            match extension {
                Some((extension, cluster)) if status.is_valid() => {
                    tracing::debug!(namespace = %id.namespace, name = %id.name, cluster = %cluster.name, "Extension service");
                    resources.clusters.push(cluster);
                    ctx.commit(resources);
                    ctx.extensions.insert(id.clone(), extension);
                }
                _ => {
                    tracing::debug!(namespace = %id.namespace, name = %id.name, "Invalid extension service");
                }
            }
            ctx.record(status);
        }
    }
}

fn build(
    ctx: &Context<'_>,
    id: &ResourceId,
    ext: &ExtensionService,
    status: &mut StatusResult,
    resources: &mut Resources,
) -> Option<(Extension, Cluster)> {
    let spec = &ext.spec;

    let protocol = match spec.protocol.as_deref() {
        None | Some("") | Some("h2") => Some(UpstreamProtocol::H2),
        Some("h2c") => Some(UpstreamProtocol::H2c),
        Some(other) => {
            status.add_error(
                ConditionType::Spec,
                "UnsupportedProtocol",
                format!("unsupported protocol {other:?}; expected h2 or h2c"),
            );
            None
        }
    };

    let validation = match &spec.validation {
        None => None,
        Some(_) if protocol == Some(UpstreamProtocol::H2c) => {
            status.add_error(
                ConditionType::Spec,
                "UnsupportedProtocol",
                "upstream validation requires the h2 protocol",
            );
            None
        }
        Some(v) => match lookup::ca_secret(ctx.snapshot, &v.ca_secret, &id.namespace, ConditionType::Spec) {
            Ok(secret) => {
                let validation = UpstreamValidation {
                    ca_secret: secret.name.clone(),
                    subject_name: v.subject_name.clone(),
                };
                resources.secrets.push(secret);
                Some(validation)
            }
            Err(invalid) => {
                invalid.record(status);
                None
            }
        },
    };

    let lb_strategy = spec
        .load_balancer_policy
        .as_ref()
        .map(|p| p.strategy.parse::<LoadBalancerStrategy>())
        .transpose()
        .unwrap_or_else(|error| {
            status.add_error(ConditionType::Spec, "LoadBalancerPolicyNotValid", error.to_string());
            None
        })
        .unwrap_or_default();

    let response_timeout = spec
        .timeout_policy
        .as_ref()
        .map(|t| Timeout::parse_opt(t.response.as_deref()))
        .transpose()
        .unwrap_or_else(|error| {
            status.add_error(
                ConditionType::Spec,
                "TimeoutPolicyNotValid",
                format!("invalid response timeout: {error}"),
            );
            None
        })
        .unwrap_or_default();

    if spec.services.is_empty() {
        status.add_error(
            ConditionType::Service,
            "NoServicesPresent",
            "at least one service must be specified",
        );
    }
    let mut targets = Vec::with_capacity(spec.services.len());
    for target in &spec.services {
        match lookup::service_port(ctx.snapshot, &id.namespace, &target.name, PortRef::Number(target.port)) {
            Ok(port) => targets.push(DnsTarget {
                host: format!(
                    "{}.{}.svc.{}",
                    port.id.name, port.id.namespace, ctx.config.cluster_domain
                ),
                port: port.port,
                weight: target.weight.unwrap_or(1),
            }),
            Err(invalid) => invalid.record(status),
        }
    }

    let protocol = protocol?;
    if !status.is_valid() {
        return None;
    }

    let name = Cluster::extension_name(&id.namespace, &id.name);
    let sni = validation.as_ref().map(|v| v.subject_name.clone());
    let cluster = Cluster {
        name: name.clone(),
        discovery: ClusterDiscovery::StrictDns { targets },
        protocol,
        validation,
        sni,
        lb_strategy,
        connect_timeout: ctx.config.connect_timeout,
    };
    let extension = Extension {
        cluster: name,
        response_timeout,
    };
    Some((extension, cluster))
}
