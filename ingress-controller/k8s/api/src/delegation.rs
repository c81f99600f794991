use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Permits TLS secrets in this namespace to be referenced from other
/// namespaces.
#[derive(Clone, Debug, Default, PartialEq, Eq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "projectcontour.io",
    version = "v1",
    kind = "TLSCertificateDelegation",
    root = "TlsCertificateDelegation",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct TlsCertificateDelegationSpec {
    pub delegations: Vec<CertificateDelegation>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CertificateDelegation {
    pub secret_name: String,
    /// Namespaces permitted to reference the secret; `*` permits all.
    pub target_namespaces: Vec<String>,
}

impl TlsCertificateDelegationSpec {
    pub fn permits(&self, secret: &str, namespace: &str) -> bool {
        self.delegations.iter().any(|d| {
            d.secret_name == secret
                && d.target_namespaces
                    .iter()
                    .any(|ns| ns == "*" || ns == namespace)
        })
    }
}
