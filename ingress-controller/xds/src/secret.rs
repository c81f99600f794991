use crate::{metrics::CacheMetrics, proto, SnapshotCache, SECRET_TYPE_URL};
use envoy_types::pb::envoy::extensions::transport_sockets::tls::v3::{
    secret, CertificateValidationContext, Secret, TlsCertificate,
};
use ingress_controller_core::{GraphObserver, RoutingGraph, SecretData};

/// Serves the TLS material referenced by the routing graph.
#[derive(Clone, Debug)]
pub struct SecretCache(SnapshotCache);

impl SecretCache {
    pub fn new(metrics: &CacheMetrics) -> Self {
        Self(SnapshotCache::new(
            SECRET_TYPE_URL,
            None,
            metrics.family("secret"),
        ))
    }

    pub fn cache(&self) -> &SnapshotCache {
        &self.0
    }
}

impl GraphObserver for SecretCache {
    fn on_change(&self, graph: &RoutingGraph) {
        let secrets = graph
            .secrets
            .values()
            .map(|s| {
                let secret = Secret {
                    name: s.name.clone(),
                    r#type: Some(match &s.data {
                        SecretData::Tls { cert, key } => {
                            secret::Type::TlsCertificate(TlsCertificate {
                                certificate_chain: Some(proto::inline_bytes(cert)),
                                private_key: Some(proto::inline_bytes(key)),
                                ..Default::default()
                            })
                        }
                        SecretData::Ca { ca } => {
                            secret::Type::ValidationContext(CertificateValidationContext {
                                trusted_ca: Some(proto::inline_bytes(ca)),
                                ..Default::default()
                            })
                        }
                    }),
                };
                (s.name.clone(), proto::any(SECRET_TYPE_URL, &secret))
            })
            .collect();
        self.0.replace(secrets);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ingress_controller_core::Secret as GraphSecret;
    use prost::Message;

    #[test]
    fn serves_referenced_secrets() {
        let cache = SecretCache::new(&CacheMetrics::default());
        let mut graph = RoutingGraph::default();
        graph.secrets.insert(
            "app/cert".to_string(),
            GraphSecret {
                name: "app/cert".to_string(),
                data: SecretData::Tls {
                    cert: b"cert".to_vec(),
                    key: b"key".to_vec(),
                },
            },
        );
        graph.secrets.insert(
            "app/ca/ca".to_string(),
            GraphSecret {
                name: "app/ca/ca".to_string(),
                data: SecretData::Ca { ca: b"ca".to_vec() },
            },
        );
        cache.on_change(&graph);

        let snapshot = cache.cache().snapshot();
        assert_eq!(snapshot.names().collect::<Vec<_>>(), vec!["app/ca/ca", "app/cert"]);

        let any = snapshot.get("app/cert").expect("secret must be served");
        let secret = Secret::decode(&*any.value).expect("secret must decode");
        match secret.r#type {
            Some(secret::Type::TlsCertificate(tls)) => {
                assert_eq!(tls.certificate_chain, Some(proto::inline_bytes(b"cert")));
                assert_eq!(tls.private_key, Some(proto::inline_bytes(b"key")));
            }
            other => panic!("unexpected secret type: {other:?}"),
        }

        cache.on_change(&RoutingGraph::default());
        assert!(cache.cache().snapshot().is_empty());
    }
}
