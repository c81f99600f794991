use sha2::{Digest, Sha256};
use std::{fmt, str::FromStr, time::Duration};

/// A deduplicated upstream, referenced from routes and TCP proxies by name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Cluster {
    pub name: String,
    pub discovery: ClusterDiscovery,
    pub protocol: UpstreamProtocol,
    pub validation: Option<UpstreamValidation>,
    pub sni: Option<String>,
    pub lb_strategy: LoadBalancerStrategy,
    pub connect_timeout: Duration,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClusterDiscovery {
    /// Endpoints are served by the endpoint cache under `service_name`.
    Eds { service_name: String },

    /// Endpoints are resolved by the proxy through DNS.
    StrictDns { targets: Vec<DnsTarget> },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DnsTarget {
    pub host: String,
    pub port: u16,
    pub weight: u32,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum UpstreamProtocol {
    #[default]
    Http1,
    /// Plaintext HTTP/2.
    H2c,
    /// HTTP/2 over TLS.
    H2,
    /// HTTP/1 over TLS.
    Tls,
}

/// Verification parameters for TLS connections to an upstream.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct UpstreamValidation {
    /// Name of the CA secret in the secret cache.
    pub ca_secret: String,
    pub subject_name: String,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum LoadBalancerStrategy {
    #[default]
    RoundRobin,
    WeightedLeastRequest,
    Random,
    Cookie,
}

#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
#[error("unsupported protocol: {0:?}")]
pub struct InvalidProtocol(pub String);

#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
#[error("unknown load balancer strategy: {0:?}")]
pub struct InvalidStrategy(pub String);

/// The parameters that distinguish clusters for the same backend port.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct UpstreamParams {
    pub protocol: UpstreamProtocol,
    pub validation: Option<UpstreamValidation>,
    pub sni: Option<String>,
    pub lb_strategy: LoadBalancerStrategy,
}

const HASH_LEN: usize = 10;

// === impl Cluster ===

impl Cluster {
    /// Names the cluster for a service port.
    ///
    /// Plain HTTP/1 round-robin clusters are named `namespace/service/port`.
    /// Any other parameter set appends a short content hash so that
    /// differently configured uses of the same port never collide.
    pub fn service_name(namespace: &str, service: &str, port: u16, params: &UpstreamParams) -> String {
        let base = format!("{namespace}/{service}/{port}");
        match params.hash() {
            Some(hash) => format!("{base}/{hash}"),
            None => base,
        }
    }

    pub fn extension_name(namespace: &str, name: &str) -> String {
        format!("extension/{namespace}/{name}")
    }

    pub fn eds_service_name(&self) -> Option<&str> {
        match &self.discovery {
            ClusterDiscovery::Eds { service_name } => Some(service_name),
            ClusterDiscovery::StrictDns { .. } => None,
        }
    }
}

// === impl UpstreamParams ===

impl UpstreamParams {
    fn is_default(&self) -> bool {
        *self == Self::default()
    }

    /// Returns a deterministic hash of non-default parameters.
    pub fn hash(&self) -> Option<String> {
        if self.is_default() {
            return None;
        }

        let mut hasher = Sha256::new();
        hasher.update(self.protocol.to_string());
        hasher.update([0u8]);
        if let Some(UpstreamValidation {
            ca_secret,
            subject_name,
        }) = &self.validation
        {
            hasher.update(ca_secret);
            hasher.update([0u8]);
            hasher.update(subject_name);
        }
        hasher.update([0u8]);
        if let Some(sni) = &self.sni {
            hasher.update(sni);
        }
        hasher.update([0u8]);
        hasher.update(format!("{:?}", self.lb_strategy));

        let mut hash = hex::encode(hasher.finalize());
        hash.truncate(HASH_LEN);
        Some(hash)
    }
}

// === impl UpstreamProtocol ===

impl UpstreamProtocol {
    /// Parses an optional protocol name, where an empty value means HTTP/1.
    pub fn parse(value: Option<&str>) -> Result<Self, InvalidProtocol> {
        match value.unwrap_or_default() {
            "" => Ok(Self::Http1),
            "h2c" => Ok(Self::H2c),
            "h2" => Ok(Self::H2),
            "tls" => Ok(Self::Tls),
            other => Err(InvalidProtocol(other.to_string())),
        }
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, Self::H2 | Self::Tls)
    }

    pub fn is_http2(&self) -> bool {
        matches!(self, Self::H2 | Self::H2c)
    }
}

impl fmt::Display for UpstreamProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Http1 => "",
            Self::H2c => "h2c",
            Self::H2 => "h2",
            Self::Tls => "tls",
        })
    }
}

// === impl LoadBalancerStrategy ===

impl FromStr for LoadBalancerStrategy {
    type Err = InvalidStrategy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "RoundRobin" => Ok(Self::RoundRobin),
            "WeightedLeastRequest" => Ok(Self::WeightedLeastRequest),
            "Random" => Ok(Self::Random),
            "Cookie" => Ok(Self::Cookie),
            other => Err(InvalidStrategy(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn validation(ca: &str, subject: &str) -> UpstreamParams {
        UpstreamParams {
            protocol: UpstreamProtocol::Tls,
            validation: Some(UpstreamValidation {
                ca_secret: ca.to_string(),
                subject_name: subject.to_string(),
            }),
            ..Default::default()
        }
    }

    #[test]
    fn default_params_are_unhashed() {
        assert_eq!(
            Cluster::service_name("app", "backend", 80, &UpstreamParams::default()),
            "app/backend/80"
        );
    }

    #[test]
    fn validation_params_change_name() {
        let a = Cluster::service_name("app", "backend", 443, &validation("app/ca", "a.example.com"));
        let b = Cluster::service_name("app", "backend", 443, &validation("app/ca", "b.example.com"));
        assert_ne!(a, b);
        assert!(a.starts_with("app/backend/443/"));
        assert_eq!(a.len(), "app/backend/443/".len() + HASH_LEN);
    }

    #[test]
    fn hash_is_deterministic() {
        let params = validation("app/ca", "backend.example.com");
        assert_eq!(params.hash(), params.clone().hash());
        assert_eq!(
            Cluster::service_name("app", "backend", 443, &params),
            Cluster::service_name("app", "backend", 443, &params.clone()),
        );
    }

    #[rstest]
    #[case(None, UpstreamProtocol::Http1)]
    #[case(Some(""), UpstreamProtocol::Http1)]
    #[case(Some("h2"), UpstreamProtocol::H2)]
    #[case(Some("h2c"), UpstreamProtocol::H2c)]
    #[case(Some("tls"), UpstreamProtocol::Tls)]
    fn parses_protocols(#[case] input: Option<&str>, #[case] expected: UpstreamProtocol) {
        assert_eq!(UpstreamProtocol::parse(input), Ok(expected));
    }

    #[test]
    fn rejects_unknown_protocol() {
        assert_eq!(
            UpstreamProtocol::parse(Some("h3")),
            Err(InvalidProtocol("h3".to_string()))
        );
    }

    #[test]
    fn strategy_changes_name() {
        let params = UpstreamParams {
            lb_strategy: LoadBalancerStrategy::Cookie,
            ..Default::default()
        };
        assert_ne!(
            Cluster::service_name("app", "backend", 80, &params),
            "app/backend/80"
        );
    }
}
