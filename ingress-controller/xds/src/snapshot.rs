use crate::metrics::FamilyMetrics;
use envoy_types::pb::google::protobuf::Any;
use std::{collections::BTreeMap, sync::Arc};
use tokio::sync::watch;

/// Produces the resource served for a requested name that has no current
/// match.
pub type Placeholder = fn(&str) -> Any;

/// An immutable, point-in-time set of encoded resources of a single type.
#[derive(Clone, Debug)]
pub struct Snapshot {
    type_url: &'static str,
    version: u64,
    resources: BTreeMap<String, Arc<Any>>,
    placeholder: Option<Placeholder>,
}

/// Publishes snapshots of one resource family.
///
/// Every update publishes a new snapshot with a higher version. Published
/// snapshots are never modified, so a reader holding one observes a
/// consistent view for as long as it holds it.
#[derive(Clone, Debug)]
pub struct SnapshotCache {
    tx: Arc<watch::Sender<Arc<Snapshot>>>,
    metrics: FamilyMetrics,
}

// === impl Snapshot ===

impl Snapshot {
    fn empty(type_url: &'static str, placeholder: Option<Placeholder>) -> Self {
        Self {
            type_url,
            version: 0,
            resources: BTreeMap::new(),
            placeholder,
        }
    }

    pub fn type_url(&self) -> &'static str {
        self.type_url
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> + '_ {
        self.resources.keys().map(String::as_str)
    }

    pub fn get(&self, name: &str) -> Option<&Any> {
        self.resources.get(name).map(|r| &**r)
    }

    /// Returns every resource, ordered by name.
    pub fn contents(&self) -> Vec<Any> {
        self.resources.values().map(|r| (**r).clone()).collect()
    }

    /// Returns the named resources, or all resources when `names` is empty.
    ///
    /// Families with a placeholder answer unknown names with an explicit
    /// empty resource; other families omit them.
    pub fn query(&self, names: &[String]) -> Vec<Any> {
        if names.is_empty() {
            return self.contents();
        }

        names
            .iter()
            .filter_map(|name| match self.resources.get(name) {
                Some(r) => Some((**r).clone()),
                None => self.placeholder.map(|p| p(name)),
            })
            .collect()
    }
}

// === impl SnapshotCache ===

impl SnapshotCache {
    pub(crate) fn new(
        type_url: &'static str,
        placeholder: Option<Placeholder>,
        metrics: FamilyMetrics,
    ) -> Self {
        let (tx, _) = watch::channel(Arc::new(Snapshot::empty(type_url, placeholder)));
        Self {
            tx: Arc::new(tx),
            metrics,
        }
    }

    pub fn type_url(&self) -> &'static str {
        self.tx.borrow().type_url
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.tx.borrow().clone()
    }

    pub fn version(&self) -> u64 {
        self.tx.borrow().version
    }

    pub fn contents(&self) -> Vec<Any> {
        self.snapshot().contents()
    }

    pub fn query(&self, names: &[String]) -> Vec<Any> {
        self.snapshot().query(names)
    }

    /// Observes every snapshot published after the current one.
    pub fn watch(&self) -> watch::Receiver<Arc<Snapshot>> {
        self.tx.subscribe()
    }

    /// Publishes a snapshot containing exactly `resources`.
    pub(crate) fn replace(&self, resources: BTreeMap<String, Any>) {
        let resources = resources
            .into_iter()
            .map(|(name, r)| (name, Arc::new(r)))
            .collect();
        self.publish(move |_| resources);
    }

    /// Publishes a snapshot derived from the current one.
    ///
    /// Unchanged resources are shared with the previous snapshot.
    pub(crate) fn update(&self, f: impl FnOnce(&mut BTreeMap<String, Arc<Any>>)) {
        self.publish(move |current| {
            let mut resources = current.resources.clone();
            f(&mut resources);
            resources
        });
    }

    fn publish(&self, f: impl FnOnce(&Snapshot) -> BTreeMap<String, Arc<Any>>) {
        self.tx.send_modify(|current| {
            let next = Snapshot {
                type_url: current.type_url,
                version: current.version + 1,
                resources: f(current),
                placeholder: current.placeholder,
            };
            self.metrics.published(next.resources.len(), next.version);
            tracing::debug!(
                type_url = next.type_url,
                version = next.version,
                resources = next.resources.len(),
                "Published snapshot"
            );
            *current = Arc::new(next);
        });
    }
}
