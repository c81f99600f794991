use std::fmt;

/// Identifies a namespaced object irrespective of its kind.
#[derive(Clone, Debug, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub struct ResourceId {
    pub namespace: String,
    pub name: String,
}

/// The kinds of configuration objects the controller observes.
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub enum ObjectKind {
    Ingress,
    HttpProxy,
    Service,
    Endpoints,
    Secret,
    ExtensionService,
    TlsCertificateDelegation,
}

/// Identifies a configuration object by kind, namespace, and name.
#[derive(Clone, Debug, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub struct ObjectKey {
    pub kind: ObjectKind,
    pub id: ResourceId,
}

// === impl ResourceId ===

impl ResourceId {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Parses a `namespace/name` reference, defaulting the namespace when the
    /// reference is unqualified.
    pub fn parse_ref(reference: &str, default_ns: &str) -> Self {
        match reference.split_once('/') {
            Some((ns, name)) => Self::new(ns, name),
            None => Self::new(default_ns, reference),
        }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

// === impl ObjectKind ===

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ingress => "Ingress",
            Self::HttpProxy => "HTTPProxy",
            Self::Service => "Service",
            Self::Endpoints => "Endpoints",
            Self::Secret => "Secret",
            Self::ExtensionService => "ExtensionService",
            Self::TlsCertificateDelegation => "TLSCertificateDelegation",
        })
    }
}

// === impl ObjectKey ===

impl ObjectKey {
    pub fn new(kind: ObjectKind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            id: ResourceId::new(namespace, name),
        }
    }

    pub fn http_proxy(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(ObjectKind::HttpProxy, namespace, name)
    }

    pub fn extension_service(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(ObjectKind::ExtensionService, namespace, name)
    }

    pub fn ingress(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(ObjectKind::Ingress, namespace, name)
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.id)
    }
}
