use super::*;
use crate::{
    Controller, ControllerMetrics, Index, IndexMetrics, IndexSink, StatusWriter, Update,
    WriteError,
};
use ingress_controller_core::{Leadership, StatusSink};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use std::{collections::VecDeque, sync::Arc, time::Duration};
use tokio::sync::mpsc;

#[derive(Copy, Clone, Debug)]
enum Outcome {
    Ok,
    NotFound,
    Conflict,
    Hang,
}

#[derive(Clone, Default)]
struct MockWriter {
    outcomes: Arc<Mutex<VecDeque<Outcome>>>,
    writes: Arc<Mutex<Vec<StatusResult>>>,
}

impl MockWriter {
    fn with_outcomes(outcomes: impl IntoIterator<Item = Outcome>) -> Self {
        let writer = Self::default();
        writer.outcomes.lock().extend(outcomes);
        writer
    }

    fn writes(&self) -> Vec<StatusResult> {
        self.writes.lock().clone()
    }
}

impl StatusWriter for MockWriter {
    async fn write(&self, result: &StatusResult) -> Result<(), WriteError> {
        self.writes.lock().push(result.clone());
        let outcome = self.outcomes.lock().pop_front().unwrap_or(Outcome::Ok);
        match outcome {
            Outcome::Ok => Ok(()),
            Outcome::NotFound => Err(WriteError::NotFound),
            Outcome::Conflict => Err(WriteError::Conflict),
            Outcome::Hang => std::future::pending().await,
        }
    }
}

async fn run(writer: &MockWriter, leadership: Leadership, results: Vec<StatusResult>) {
    let (tx, rx) = mpsc::channel(results.len().max(1));
    for result in results {
        tx.try_send(Update { result }).expect("queue has capacity");
    }
    drop(tx);
    Controller::new(
        writer.clone(),
        leadership,
        rx,
        Duration::from_secs(5),
        ControllerMetrics::default(),
    )
    .run()
    .await;
}

#[tokio::test]
async fn writes_each_update() {
    let writer = MockWriter::default();
    run(&writer, Leadership::fixed(true), vec![valid("a"), invalid("b")]).await;
    assert_eq!(writer.writes(), vec![valid("a"), invalid("b")]);
}

#[tokio::test]
async fn retries_a_conflict_once() {
    let writer = MockWriter::with_outcomes([Outcome::Conflict, Outcome::Ok]);
    run(&writer, Leadership::fixed(true), vec![valid("a")]).await;
    assert_eq!(writer.writes(), vec![valid("a"), valid("a")]);
}

#[tokio::test]
async fn gives_up_after_repeated_conflicts() {
    let writer = MockWriter::with_outcomes([Outcome::Conflict, Outcome::Conflict]);
    run(&writer, Leadership::fixed(true), vec![valid("a"), valid("b")]).await;
    assert_eq!(writer.writes(), vec![valid("a"), valid("a"), valid("b")]);
}

#[tokio::test]
async fn deleted_objects_are_skipped() {
    let writer = MockWriter::with_outcomes([Outcome::NotFound]);
    run(&writer, Leadership::fixed(true), vec![valid("a"), valid("b")]).await;
    assert_eq!(writer.writes(), vec![valid("a"), valid("b")]);
}

#[tokio::test(start_paused = true)]
async fn stalled_writes_are_retried() {
    let writer = MockWriter::with_outcomes([Outcome::Hang]);
    let start = tokio::time::Instant::now();
    run(&writer, Leadership::fixed(true), vec![valid("a"), valid("b")]).await;
    assert!(start.elapsed() >= Duration::from_secs(5));
    assert_eq!(writer.writes(), vec![valid("a"), valid("a"), valid("b")]);
}

#[tokio::test(start_paused = true)]
async fn stalled_writes_are_abandoned_after_three_attempts() {
    let writer = MockWriter::with_outcomes([Outcome::Hang, Outcome::Hang, Outcome::Hang]);
    run(&writer, Leadership::fixed(true), vec![valid("a"), valid("b")]).await;
    assert_eq!(
        writer.writes(),
        vec![valid("a"), valid("a"), valid("a"), valid("b")]
    );
}

#[tokio::test(start_paused = true)]
async fn failed_writes_are_sent_again_by_the_next_rebuild() {
    let (tx, rx) = mpsc::channel(16);
    let index = Index::shared(Leadership::fixed(true), tx, IndexMetrics::default());
    let sink = IndexSink::new(index.clone());
    let writer = MockWriter::with_outcomes([Outcome::Hang, Outcome::Hang, Outcome::Hang]);
    let controller = Controller::new(
        writer.clone(),
        Leadership::fixed(true),
        rx,
        Duration::from_secs(5),
        ControllerMetrics::default(),
    )
    .with_index(index.clone());
    let task = tokio::spawn(controller.run());

    sink.overwrite(vec![valid("a")]);
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(writer.writes().len(), 3);
    assert_eq!(index.read().get(&valid("a").key), None);

    // The result is no longer cached, so an identical rebuild emits it again.
    sink.overwrite(vec![valid("a")]);
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(writer.writes().len(), 4);
    assert_eq!(index.read().get(&valid("a").key), Some(&valid("a")));

    // Written results stay cached and are not emitted again.
    sink.overwrite(vec![valid("a")]);
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(writer.writes().len(), 4);

    // The controller holds the index, and so the update sender, open.
    task.abort();
}

#[tokio::test]
async fn followers_do_not_write() {
    let writer = MockWriter::default();
    run(&writer, Leadership::fixed(false), vec![valid("a")]).await;
    assert!(writer.writes().is_empty());
}
