use crate::{
    index::{SharedIndex, Update},
    writer::{StatusWriter, WriteError},
};
use ingress_controller_core::{Leadership, StatusResult};
use prometheus_client::{metrics::counter::Counter, registry::Registry};
use tokio::{sync::mpsc, time};

/// Writes status updates to the API while this instance leads.
pub struct Controller<W> {
    writer: W,
    leadership: Leadership,
    updates: mpsc::Receiver<Update>,
    patch_timeout: time::Duration,
    metrics: ControllerMetrics,
    index: Option<SharedIndex>,
}

/// The number of times a write is attempted before it is abandoned.
const MAX_ATTEMPTS: usize = 3;

const RETRY_BACKOFF: time::Duration = time::Duration::from_secs(1);

#[derive(Clone, Debug, Default)]
pub struct ControllerMetrics {
    patch_succeeded: Counter,
    patch_not_found: Counter,
    patch_conflicts: Counter,
    patch_failed: Counter,
}

// === impl ControllerMetrics ===

impl ControllerMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let patch_succeeded = Counter::default();
        prom.register(
            "patch_succeeded",
            "Count of successful status patches",
            patch_succeeded.clone(),
        );

        let patch_not_found = Counter::default();
        prom.register(
            "patch_not_found",
            "Count of status patches skipped because the object was deleted",
            patch_not_found.clone(),
        );

        let patch_conflicts = Counter::default();
        prom.register(
            "patch_conflicts",
            "Count of status patches rejected because the object changed concurrently",
            patch_conflicts.clone(),
        );

        let patch_failed = Counter::default();
        prom.register(
            "patch_failed",
            "Count of status patches that failed or timed out",
            patch_failed.clone(),
        );

        Self {
            patch_succeeded,
            patch_not_found,
            patch_conflicts,
            patch_failed,
        }
    }
}

// === impl Controller ===

impl<W: StatusWriter> Controller<W> {
    pub fn new(
        writer: W,
        leadership: Leadership,
        updates: mpsc::Receiver<Update>,
        patch_timeout: time::Duration,
        metrics: ControllerMetrics,
    ) -> Self {
        Self {
            writer,
            leadership,
            updates,
            patch_timeout,
            metrics,
            index: None,
        }
    }

    /// Forgets results in `index` whose write failed, so that the next
    /// rebuild emits them again.
    pub fn with_index(mut self, index: SharedIndex) -> Self {
        self.index = Some(index);
        self
    }

    /// Processes updates until every sender is dropped.
    pub async fn run(mut self) {
        while let Some(Update { result }) = self.updates.recv().await {
            // Leadership may have been lost while the update was queued.
            if !self.leadership.is_leader() {
                tracing::debug!(key = %result.key, "Not leading; skipping status update");
                continue;
            }
            if !self.publish(&result).await {
                if let Some(index) = self.index.as_ref() {
                    index.write().forget(&result);
                }
            }
        }
        tracing::debug!("Status updates closed");
    }

    /// Writes a result, returning false if it could not be written.
    ///
    /// Timeouts and API errors are retried after a backoff. A conflict is
    /// retried once, immediately, against the latest version of the object.
    async fn publish(&self, result: &StatusResult) -> bool {
        let key = &result.key;
        let mut conflicted = false;
        for attempt in 1..=MAX_ATTEMPTS {
            match time::timeout(self.patch_timeout, self.writer.write(result)).await {
                Ok(Ok(())) => {
                    tracing::debug!(%key, status = %result.current, "Patched status");
                    self.metrics.patch_succeeded.inc();
                    return true;
                }
                Ok(Err(WriteError::NotFound)) => {
                    tracing::debug!(%key, "Object no longer exists; skipping status update");
                    self.metrics.patch_not_found.inc();
                    return true;
                }
                Ok(Err(WriteError::Conflict)) => {
                    self.metrics.patch_conflicts.inc();
                    if conflicted {
                        tracing::warn!(%key, "Status patch conflicted again; giving up");
                        break;
                    }
                    tracing::debug!(%key, "Status patch conflicted; retrying");
                    conflicted = true;
                    continue;
                }
                Ok(Err(error)) => {
                    tracing::warn!(%key, %error, attempt, "Failed to patch status");
                }
                Err(_) => {
                    tracing::warn!(%key, timeout = ?self.patch_timeout, attempt, "Status patch timed out");
                }
            }
            if attempt < MAX_ATTEMPTS {
                time::sleep(RETRY_BACKOFF).await;
            }
        }
        self.metrics.patch_failed.inc();
        false
    }
}
