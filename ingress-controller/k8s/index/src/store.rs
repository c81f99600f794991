use ahash::AHashMap as HashMap;
use ingress_controller_core::{ObjectKind, ResourceId};
use ingress_controller_k8s_api::{
    self as k8s, ExtensionService, HttpProxy, Ingress, ObjectMeta, ResourceExt,
    TlsCertificateDelegation,
};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::watch;

pub type SharedStore = Arc<RwLock<ObjectStore>>;

/// A configuration object delivered by a watch.
#[derive(Clone, Debug)]
pub enum Object {
    Ingress(Ingress),
    HttpProxy(HttpProxy),
    Service(k8s::Service),
    Endpoints(k8s::Endpoints),
    Secret(k8s::Secret),
    ExtensionService(ExtensionService),
    TlsCertificateDelegation(TlsCertificateDelegation),
}

/// Holds the latest observed version of every object the builder reads.
#[derive(Debug)]
pub struct ObjectStore {
    ingress_class: Option<String>,
    objects: Snapshot,
    changes: watch::Sender<u64>,
}

/// A point-in-time copy of the store's contents.
///
/// Objects are shared with the store, so taking a snapshot only copies the
/// maps.
#[derive(Clone, Debug, Default)]
pub struct Snapshot {
    pub ingresses: HashMap<ResourceId, Arc<Ingress>>,
    pub http_proxies: HashMap<ResourceId, Arc<HttpProxy>>,
    pub services: HashMap<ResourceId, Arc<k8s::Service>>,
    pub secrets: HashMap<ResourceId, Arc<k8s::Secret>>,
    pub extension_services: HashMap<ResourceId, Arc<ExtensionService>>,
    pub delegations: HashMap<ResourceId, Arc<TlsCertificateDelegation>>,
}

const TLS_SECRET_TYPE: &str = "kubernetes.io/tls";
pub(crate) const TLS_CERT_KEY: &str = "tls.crt";
pub(crate) const TLS_PRIVATE_KEY: &str = "tls.key";
pub(crate) const CA_CERT_KEY: &str = "ca.crt";

// === impl Object ===

impl Object {
    pub fn kind(&self) -> ObjectKind {
        match self {
            Self::Ingress(_) => ObjectKind::Ingress,
            Self::HttpProxy(_) => ObjectKind::HttpProxy,
            Self::Service(_) => ObjectKind::Service,
            Self::Endpoints(_) => ObjectKind::Endpoints,
            Self::Secret(_) => ObjectKind::Secret,
            Self::ExtensionService(_) => ObjectKind::ExtensionService,
            Self::TlsCertificateDelegation(_) => ObjectKind::TlsCertificateDelegation,
        }
    }

    fn metadata(&self) -> &ObjectMeta {
        match self {
            Self::Ingress(o) => &o.metadata,
            Self::HttpProxy(o) => &o.metadata,
            Self::Service(o) => &o.metadata,
            Self::Endpoints(o) => &o.metadata,
            Self::Secret(o) => &o.metadata,
            Self::ExtensionService(o) => &o.metadata,
            Self::TlsCertificateDelegation(o) => &o.metadata,
        }
    }

    pub fn id(&self) -> ResourceId {
        let meta = self.metadata();
        ResourceId::new(
            meta.namespace.clone().unwrap_or_default(),
            meta.name.clone().unwrap_or_default(),
        )
    }
}

macro_rules! impl_from {
    ($($variant:ident => $ty:ty),+ $(,)?) => {
        $(
            impl From<$ty> for Object {
                fn from(o: $ty) -> Self {
                    Self::$variant(o)
                }
            }
        )+
    };
}

impl_from! {
    Ingress => Ingress,
    HttpProxy => HttpProxy,
    Service => k8s::Service,
    Endpoints => k8s::Endpoints,
    Secret => k8s::Secret,
    ExtensionService => ExtensionService,
    TlsCertificateDelegation => TlsCertificateDelegation,
}

// === impl ObjectStore ===

impl ObjectStore {
    pub fn new(ingress_class: Option<String>) -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            ingress_class,
            objects: Snapshot::default(),
            changes,
        }
    }

    pub fn shared(self) -> SharedStore {
        Arc::new(RwLock::new(self))
    }

    /// Watches the store's change generation, which advances on every change.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    pub fn snapshot(&self) -> Snapshot {
        self.objects.clone()
    }

    /// Records the latest version of an object, returning whether the store
    /// changed.
    ///
    /// An object that is no longer relevant (for instance, an Ingress whose
    /// class changed) is removed.
    pub fn insert(&mut self, object: Object) -> bool {
        let kind = object.kind();
        let id = object.id();
        if !self.is_relevant(&object) {
            return self.remove(kind, id.namespace, id.name);
        }

        let key = id.clone();
        let changed = match object {
            Object::Ingress(o) => upsert(&mut self.objects.ingresses, key, o),
            Object::HttpProxy(o) => upsert(&mut self.objects.http_proxies, key, o),
            Object::Service(o) => upsert(&mut self.objects.services, key, o),
            Object::Secret(o) => upsert(&mut self.objects.secrets, key, o),
            Object::ExtensionService(o) => upsert(&mut self.objects.extension_services, key, o),
            Object::TlsCertificateDelegation(o) => upsert(&mut self.objects.delegations, key, o),
            // Endpoints are indexed by the endpoint cache and never affect the graph.
            Object::Endpoints(_) => false,
        };
        if changed {
            tracing::trace!(%kind, namespace = %id.namespace, name = %id.name, "Updated");
            self.notify();
        }
        changed
    }

    /// Forgets an object, returning whether it was present.
    pub fn remove(&mut self, kind: ObjectKind, namespace: String, name: String) -> bool {
        let id = ResourceId { namespace, name };
        let removed = match kind {
            ObjectKind::Ingress => self.objects.ingresses.remove(&id).is_some(),
            ObjectKind::HttpProxy => self.objects.http_proxies.remove(&id).is_some(),
            ObjectKind::Service => self.objects.services.remove(&id).is_some(),
            ObjectKind::Secret => self.objects.secrets.remove(&id).is_some(),
            ObjectKind::ExtensionService => self.objects.extension_services.remove(&id).is_some(),
            ObjectKind::TlsCertificateDelegation => self.objects.delegations.remove(&id).is_some(),
            ObjectKind::Endpoints => false,
        };
        if removed {
            tracing::trace!(%kind, namespace = %id.namespace, name = %id.name, "Removed");
            self.notify();
        }
        removed
    }

    fn notify(&self) {
        self.changes.send_modify(|generation| *generation += 1);
    }

    fn is_relevant(&self, object: &Object) -> bool {
        match object {
            Object::Secret(secret) => is_relevant_secret(secret),
            Object::Ingress(ingress) => {
                let class = ingress
                    .spec
                    .as_ref()
                    .and_then(|spec| spec.ingress_class_name.as_deref());
                self.matches_class(class, &ingress.metadata)
            }
            Object::HttpProxy(proxy) => {
                self.matches_class(proxy.spec.ingress_class_name.as_deref(), &proxy.metadata)
            }
            _ => true,
        }
    }

    /// Determines whether an object's ingress class selects this controller.
    ///
    /// The class may be set by a spec field or by either of the well-known
    /// annotations. Unclassed objects are only accepted when no class is
    /// configured.
    fn matches_class(&self, spec_class: Option<&str>, meta: &ObjectMeta) -> bool {
        let class = spec_class.or_else(|| {
            k8s::INGRESS_CLASS_ANNOTATIONS.iter().find_map(|key| {
                meta.annotations
                    .as_ref()
                    .and_then(|a| a.get(*key))
                    .map(String::as_str)
            })
        });
        match (self.ingress_class.as_deref(), class) {
            (Some(configured), Some(class)) => configured == class,
            (Some(_), None) => false,
            (None, None) => true,
            (None, Some(class)) => class == k8s::DEFAULT_INGRESS_CLASS,
        }
    }
}

fn upsert<T: ResourceExt>(map: &mut HashMap<ResourceId, Arc<T>>, id: ResourceId, object: T) -> bool {
    if let Some(existing) = map.get(&id) {
        let version = object.resource_version();
        if version.is_some() && existing.resource_version() == version {
            return false;
        }
    }
    map.insert(id, Arc::new(object));
    true
}

fn is_relevant_secret(secret: &k8s::Secret) -> bool {
    let data = match secret.data.as_ref() {
        Some(data) => data,
        None => return false,
    };
    if data.contains_key(CA_CERT_KEY) {
        return true;
    }
    secret.type_.as_deref() == Some(TLS_SECRET_TYPE)
        && data.contains_key(TLS_CERT_KEY)
        && data.contains_key(TLS_PRIVATE_KEY)
}

macro_rules! impl_index {
    ($($ty:ty => $kind:ident),+ $(,)?) => {
        $(
            impl kubert::index::IndexNamespacedResource<$ty> for ObjectStore {
                fn apply(&mut self, resource: $ty) {
                    self.insert(resource.into());
                }

                fn delete(&mut self, namespace: String, name: String) {
                    self.remove(ObjectKind::$kind, namespace, name);
                }
            }
        )+
    };
}

impl_index! {
    Ingress => Ingress,
    HttpProxy => HttpProxy,
    k8s::Service => Service,
    k8s::Secret => Secret,
    ExtensionService => ExtensionService,
    TlsCertificateDelegation => TlsCertificateDelegation,
}
