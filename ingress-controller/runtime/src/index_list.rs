use kubert::index::IndexNamespacedResource;
use parking_lot::RwLock;
use std::sync::Arc;

/// Fans a single watch out to several indexes.
///
/// Indexes are updated in the order in which they were added.
pub struct IndexList<A, T> {
    index: Arc<RwLock<A>>,
    tail: Option<T>,
}

// === impl IndexList ===

impl<A, T, R> IndexNamespacedResource<R> for IndexList<A, T>
where
    A: IndexNamespacedResource<R>,
    T: IndexNamespacedResource<R>,
    R: Clone,
{
    fn apply(&mut self, resource: R) {
        if let Some(tail) = &mut self.tail {
            tail.apply(resource.clone());
        }
        self.index.write().apply(resource);
    }

    fn delete(&mut self, namespace: String, name: String) {
        if let Some(tail) = &mut self.tail {
            tail.delete(namespace.clone(), name.clone());
        }
        self.index.write().delete(namespace, name);
    }
}

impl<A, T> IndexList<A, T> {
    pub fn new(index: Arc<RwLock<A>>) -> IndexList<A, A> {
        IndexList { index, tail: None }
    }

    pub fn push<B>(self, index: Arc<RwLock<B>>) -> IndexList<B, Self> {
        IndexList {
            index,
            tail: Some(self),
        }
    }

    pub fn shared(self) -> Arc<RwLock<Self>> {
        Arc::new(RwLock::new(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[derive(Default)]
    struct Recorder(Vec<String>);

    impl IndexNamespacedResource<&'static str> for Recorder {
        fn apply(&mut self, resource: &'static str) {
            self.0.push(format!("apply {resource}"));
        }

        fn delete(&mut self, namespace: String, name: String) {
            self.0.push(format!("delete {namespace}/{name}"));
        }
    }

    #[test]
    fn every_index_sees_every_event() {
        let a = Arc::new(RwLock::new(Recorder::default()));
        let b = Arc::new(RwLock::new(Recorder::default()));
        let list = IndexList::<_, ()>::new(a.clone()).push(b.clone()).shared();

        list.write().apply("web");
        list.write().delete("ns".to_string(), "web".to_string());

        for index in [a, b] {
            assert_eq!(index.read().0, vec!["apply web", "delete ns/web"]);
        }
    }
}
