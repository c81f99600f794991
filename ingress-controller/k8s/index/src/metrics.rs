use crate::store::Snapshot;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge, histogram::Histogram},
    registry::Registry,
};
use std::time::Duration;

/// Tracks routing graph rebuilds.
#[derive(Clone, Debug)]
pub struct RebuildMetrics {
    runs: Counter,
    skipped: Counter,
    duration: Histogram,
    objects: Family<KindLabels, Gauge>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct KindLabels {
    kind: String,
}

// === impl RebuildMetrics ===

impl RebuildMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let runs = Counter::default();
        prom.register("runs", "Count of routing graph rebuilds", runs.clone());

        let skipped = Counter::default();
        prom.register(
            "skipped",
            "Count of rebuilds deferred because this instance is not the leader",
            skipped.clone(),
        );

        let duration = Histogram::new([0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]);
        prom.register(
            "duration_seconds",
            "Histogram of routing graph rebuild durations",
            duration.clone(),
        );

        let objects = Family::default();
        prom.register(
            "objects",
            "Gauge of the number of objects in the snapshot of the last rebuild",
            objects.clone(),
        );

        Self {
            runs,
            skipped,
            duration,
            objects,
        }
    }

    pub(crate) fn rebuilt(&self, snapshot: &Snapshot, elapsed: Duration) {
        self.runs.inc();
        self.duration.observe(elapsed.as_secs_f64());

        let sizes = [
            ("Ingress", snapshot.ingresses.len()),
            ("HTTPProxy", snapshot.http_proxies.len()),
            ("Service", snapshot.services.len()),
            ("Secret", snapshot.secrets.len()),
            ("ExtensionService", snapshot.extension_services.len()),
            ("TLSCertificateDelegation", snapshot.delegations.len()),
        ];
        for (kind, size) in sizes {
            self.objects
                .get_or_create(&KindLabels {
                    kind: kind.to_string(),
                })
                .set(size as i64);
        }
    }

    pub(crate) fn skipped(&self) {
        self.skipped.inc();
    }
}

impl Default for RebuildMetrics {
    fn default() -> Self {
        Self::register(&mut Registry::default())
    }
}
