use crate::{
    builder::{BuildOutput, Builder},
    metrics::RebuildMetrics,
    store::SharedStore,
};
use ingress_controller_core::{GraphObserver, Leadership, StatusSink};
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::watch,
    time::{self, Instant},
};

/// Coalesces bursts of changes into a single rebuild.
///
/// The first change after an idle period starts a burst. A burst fires once
/// no change has been observed for `holdoff`, or once `max_holdoff` has
/// elapsed since the burst started, whichever comes first.
#[derive(Clone, Debug)]
pub struct Debounce {
    holdoff: Duration,
    max_holdoff: Duration,
    pending: Option<Burst>,
}

#[derive(Copy, Clone, Debug)]
struct Burst {
    first: Instant,
    last: Instant,
}

/// Rebuilds the routing graph when the store changes and publishes the
/// result to observers.
pub struct Scheduler {
    store: SharedStore,
    builder: Builder,
    debounce: Debounce,
    leadership: Leadership,
    observers: Vec<Arc<dyn GraphObserver>>,
    statuses: Option<Arc<dyn StatusSink>>,
    metrics: RebuildMetrics,
    rebuilds: watch::Sender<u64>,
}

// === impl Debounce ===

impl Debounce {
    pub fn new(holdoff: Duration, max_holdoff: Duration) -> Self {
        Self {
            holdoff,
            max_holdoff: max_holdoff.max(holdoff),
            pending: None,
        }
    }

    /// Records a change.
    pub fn observe(&mut self, now: Instant) {
        match self.pending.as_mut() {
            Some(burst) => burst.last = now,
            None => self.pending = Some(Burst { first: now, last: now }),
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// The instant at which the pending burst fires.
    pub fn deadline(&self) -> Option<Instant> {
        self.pending
            .map(|b| std::cmp::min(b.last + self.holdoff, b.first + self.max_holdoff))
    }

    /// Returns true and clears the burst if its deadline has passed.
    pub fn poll(&mut self, now: Instant) -> bool {
        match self.deadline() {
            Some(deadline) if deadline <= now => {
                self.pending = None;
                true
            }
            _ => false,
        }
    }

    pub fn reset(&mut self) {
        self.pending = None;
    }
}

// === impl Scheduler ===

impl Scheduler {
    pub fn new(
        store: SharedStore,
        builder: Builder,
        debounce: Debounce,
        leadership: Leadership,
        metrics: RebuildMetrics,
    ) -> Self {
        let (rebuilds, _) = watch::channel(0);
        Self {
            store,
            builder,
            debounce,
            leadership,
            observers: Vec::new(),
            statuses: None,
            metrics,
            rebuilds,
        }
    }

    /// Adds an observer. Observers are notified in the order they are added.
    pub fn observe(mut self, observer: Arc<dyn GraphObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn with_status_sink(mut self, sink: Arc<dyn StatusSink>) -> Self {
        self.statuses = Some(sink);
        self
    }

    /// Watches the number of completed rebuilds.
    pub fn rebuilds(&self) -> watch::Receiver<u64> {
        self.rebuilds.subscribe()
    }

    /// Builds the store's current contents and publishes the result.
    pub fn rebuild(&self) {
        let snapshot = self.store.read().snapshot();
        let start = Instant::now();
        let BuildOutput { graph, statuses } = self.builder.build(&snapshot);

        for observer in &self.observers {
            observer.on_change(&graph);
        }
        if let Some(sink) = self.statuses.as_ref() {
            sink.overwrite(statuses.into_iter().map(|(_, status)| status).collect());
        }

        let elapsed = start.elapsed();
        self.metrics.rebuilt(&snapshot, elapsed);
        self.rebuilds.send_modify(|n| *n += 1);
        tracing::debug!(
            ?elapsed,
            listeners = graph.listeners.len(),
            clusters = graph.clusters.len(),
            secrets = graph.secrets.len(),
            "Rebuilt routing graph"
        );
    }

    pub async fn run(mut self, drain: drain::Watch) {
        let mut changes = self.store.read().subscribe();
        let mut leadership = self.leadership.clone();
        // A leader publishes once at startup even if the store is empty, so
        // that proxies are never left waiting for a first configuration.
        let populated = *changes.borrow_and_update() > 0;
        if populated || leadership.is_leader() {
            self.debounce.observe(Instant::now());
        }

        let shutdown = drain.signaled();
        tokio::pin!(shutdown);

        loop {
            // Only polled while a burst is pending.
            let deadline = self
                .debounce
                .deadline()
                .unwrap_or_else(|| Instant::now() + Duration::from_secs(60 * 60));

            tokio::select! {
                biased;

                release = &mut shutdown => {
                    tracing::debug!("Shutting down");
                    drop(release);
                    return;
                }

                res = changes.changed() => {
                    if res.is_err() {
                        tracing::debug!("Object store dropped");
                        return;
                    }
                    self.debounce.observe(Instant::now());
                }

                leader = leadership.changed() => {
                    if leader {
                        tracing::info!("Acquired leadership; rebuilding");
                        self.debounce.reset();
                        self.rebuild();
                    } else {
                        tracing::info!("Lost leadership");
                    }
                }

                () = time::sleep_until(deadline), if self.debounce.is_pending() => {
                    if !self.debounce.poll(Instant::now()) {
                        continue;
                    }
                    if leadership.is_leader() {
                        self.rebuild();
                    } else {
                        tracing::trace!("Not leading; skipping rebuild");
                        self.metrics.skipped();
                    }
                }
            }
        }
    }
}
