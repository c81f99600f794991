use ahash::AHashMap as HashMap;
use ingress_controller_core::{Leadership, ObjectKey, ObjectKind, StatusResult, StatusSink};
use ingress_controller_k8s_api::{ExtensionService, HttpProxy};
use parking_lot::RwLock;
use prometheus_client::{metrics::counter::Counter, registry::Registry};
use std::sync::Arc;
use tokio::sync::mpsc;

pub type SharedIndex = Arc<RwLock<Index>>;

/// Caches the most recent status result of every object and emits updates
/// for results that changed.
pub struct Index {
    leadership: Leadership,
    /// Whether this instance led during the last overwrite.
    leading: bool,
    statuses: HashMap<ObjectKey, StatusResult>,
    updates: mpsc::Sender<Update>,
    metrics: IndexMetrics,
}

/// A status result that should be written to the API.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Update {
    pub result: StatusResult,
}

#[derive(Clone, Debug, Default)]
pub struct IndexMetrics {
    patch_dropped: Counter,
}

/// Hands each rebuild's results to a shared [`Index`].
#[derive(Clone)]
pub struct IndexSink(SharedIndex);

// === impl IndexMetrics ===

impl IndexMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let patch_dropped = Counter::default();
        prom.register(
            "patch_dropped",
            "Count of status patches dropped because the update queue was full",
            patch_dropped.clone(),
        );
        Self { patch_dropped }
    }
}

// === impl Index ===

impl Index {
    pub fn shared(
        leadership: Leadership,
        updates: mpsc::Sender<Update>,
        metrics: IndexMetrics,
    ) -> SharedIndex {
        Arc::new(RwLock::new(Self {
            leadership,
            leading: false,
            statuses: HashMap::default(),
            updates,
            metrics,
        }))
    }

    pub fn get(&self, key: &ObjectKey) -> Option<&StatusResult> {
        self.statuses.get(key)
    }

    /// Forgets the cached result of a deleted object.
    pub fn invalidate(&mut self, key: &ObjectKey) -> Option<StatusResult> {
        self.statuses.remove(key)
    }

    /// Forgets `result` if it is still the cached result for its object.
    pub(crate) fn forget(&mut self, result: &StatusResult) {
        if self.statuses.get(&result.key) == Some(result) {
            self.statuses.remove(&result.key);
        }
    }

    /// Records a rebuild's results, emitting an update for each result that
    /// differs from the cached one.
    ///
    /// Nothing is cached or emitted while not leading. Ingress results are
    /// never written.
    pub fn overwrite(&mut self, results: Vec<StatusResult>) {
        let leader = self.leadership.is_leader();
        if leader && !self.leading {
            // Statuses may have been written by another leader since.
            self.statuses.clear();
        }
        self.leading = leader;
        if !leader {
            return;
        }

        for result in results {
            if result.key.kind == ObjectKind::Ingress {
                continue;
            }
            if self.statuses.get(&result.key) == Some(&result) {
                continue;
            }

            let key = result.key.clone();
            self.statuses.insert(key.clone(), result.clone());
            match self.updates.try_send(Update { result }) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(%key, "Status update queue is full; dropping update");
                    self.metrics.patch_dropped.inc();
                    // Emitted again by the next rebuild.
                    self.statuses.remove(&key);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    tracing::debug!(%key, "Status controller stopped");
                    self.statuses.remove(&key);
                }
            }
        }
    }
}

impl kubert::index::IndexNamespacedResource<HttpProxy> for Index {
    // Results are computed by the graph builder.
    fn apply(&mut self, _: HttpProxy) {}

    fn delete(&mut self, namespace: String, name: String) {
        self.invalidate(&ObjectKey::http_proxy(namespace, name));
    }
}

impl kubert::index::IndexNamespacedResource<ExtensionService> for Index {
    fn apply(&mut self, _: ExtensionService) {}

    fn delete(&mut self, namespace: String, name: String) {
        self.invalidate(&ObjectKey::extension_service(namespace, name));
    }
}

// === impl IndexSink ===

impl IndexSink {
    pub fn new(index: SharedIndex) -> Self {
        Self(index)
    }
}

impl StatusSink for IndexSink {
    fn overwrite(&self, results: Vec<StatusResult>) {
        self.0.write().overwrite(results);
    }
}
