use super::*;
use crate::{Index, IndexMetrics, IndexSink, SharedIndex, Update};
use ingress_controller_core::{Leadership, StatusSink};
use kubert::index::IndexNamespacedResource;
use pretty_assertions::assert_eq;
use tokio::sync::mpsc;

fn index(leadership: Leadership, capacity: usize) -> (SharedIndex, mpsc::Receiver<Update>) {
    let (tx, rx) = mpsc::channel(capacity);
    (Index::shared(leadership, tx, IndexMetrics::default()), rx)
}

fn drain_updates(rx: &mut mpsc::Receiver<Update>) -> Vec<StatusResult> {
    let mut results = Vec::new();
    while let Ok(Update { result }) = rx.try_recv() {
        results.push(result);
    }
    results
}

#[test]
fn emits_changed_results() {
    let (index, mut rx) = index(Leadership::fixed(true), 16);
    let sink = IndexSink::new(index.clone());

    sink.overwrite(vec![valid("a"), valid("b")]);
    assert_eq!(drain_updates(&mut rx), vec![valid("a"), valid("b")]);

    // Unchanged results are not written again.
    sink.overwrite(vec![valid("a"), invalid("b")]);
    assert_eq!(drain_updates(&mut rx), vec![invalid("b")]);

    sink.overwrite(vec![valid("a"), invalid("b")]);
    assert!(drain_updates(&mut rx).is_empty());
    assert_eq!(index.read().get(&invalid("b").key), Some(&invalid("b")));
}

#[test]
fn deletion_invalidates() {
    let (index, mut rx) = index(Leadership::fixed(true), 16);
    index.write().overwrite(vec![valid("a")]);
    assert_eq!(drain_updates(&mut rx).len(), 1);

    IndexNamespacedResource::<ingress_controller_k8s_api::HttpProxy>::delete(
        &mut *index.write(),
        "app".to_string(),
        "a".to_string(),
    );
    assert_eq!(index.read().get(&valid("a").key), None);

    // A recreated object has its status written even if it is identical.
    index.write().overwrite(vec![valid("a")]);
    assert_eq!(drain_updates(&mut rx), vec![valid("a")]);
}

#[test]
fn followers_emit_nothing() {
    let (tx, leadership) = Leadership::channel(false);
    let (index, mut rx) = index(leadership, 16);

    index.write().overwrite(vec![valid("a"), invalid("b")]);
    assert!(drain_updates(&mut rx).is_empty());
    assert_eq!(index.read().get(&valid("a").key), None);

    tx.send(true).expect("index holds a receiver");
    index.write().overwrite(vec![valid("a"), invalid("b")]);
    assert_eq!(drain_updates(&mut rx), vec![valid("a"), invalid("b")]);
}

#[test]
fn new_leaders_rewrite_everything() {
    let (tx, leadership) = Leadership::channel(true);
    let (index, mut rx) = index(leadership, 16);

    index.write().overwrite(vec![valid("a")]);
    assert_eq!(drain_updates(&mut rx).len(), 1);

    tx.send(false).expect("index holds a receiver");
    index.write().overwrite(vec![valid("a")]);
    tx.send(true).expect("index holds a receiver");
    index.write().overwrite(vec![valid("a")]);
    assert_eq!(drain_updates(&mut rx), vec![valid("a")]);
}

#[test]
fn ingresses_are_not_written() {
    let (index, mut rx) = index(Leadership::fixed(true), 16);
    let ingress = StatusResult::new(ObjectKey::ingress("app", "web"), Some(1));
    index.write().overwrite(vec![ingress, valid("a")]);
    assert_eq!(drain_updates(&mut rx), vec![valid("a")]);
}

#[test]
fn full_queue_drops_until_the_next_rebuild() {
    let (index, mut rx) = index(Leadership::fixed(true), 1);

    index.write().overwrite(vec![valid("a"), valid("b")]);
    assert_eq!(drain_updates(&mut rx), vec![valid("a")]);
    assert_eq!(index.read().get(&valid("b").key), None);

    index.write().overwrite(vec![valid("a"), valid("b")]);
    assert_eq!(drain_updates(&mut rx), vec![valid("b")]);
}

#[test]
fn closed_queue_is_tolerated() {
    let (index, rx) = index(Leadership::fixed(true), 1);
    drop(rx);
    index.write().overwrite(vec![valid("a")]);
    assert_eq!(index.read().get(&valid("a").key), None);
}
