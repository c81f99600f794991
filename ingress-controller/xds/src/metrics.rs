use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{family::Family, gauge::Gauge},
    registry::Registry,
};

/// Tracks the size and version of each resource cache.
#[derive(Clone, Debug, Default)]
pub struct CacheMetrics {
    resources: Family<FamilyLabels, Gauge>,
    version: Family<FamilyLabels, Gauge>,
}

/// The gauges of a single cache.
#[derive(Clone, Debug, Default)]
pub(crate) struct FamilyMetrics {
    resources: Gauge,
    version: Gauge,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct FamilyLabels {
    family: &'static str,
}

// === impl CacheMetrics ===

impl CacheMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let resources = Family::default();
        prom.register(
            "resources",
            "Gauge of the number of resources in each cache",
            resources.clone(),
        );

        let version = Family::default();
        prom.register(
            "version",
            "Gauge of the current snapshot version of each cache",
            version.clone(),
        );

        Self { resources, version }
    }

    pub(crate) fn family(&self, family: &'static str) -> FamilyMetrics {
        let labels = FamilyLabels { family };
        FamilyMetrics {
            resources: self.resources.get_or_create(&labels).clone(),
            version: self.version.get_or_create(&labels).clone(),
        }
    }
}

// === impl FamilyMetrics ===

impl FamilyMetrics {
    pub(crate) fn published(&self, resources: usize, version: u64) {
        self.resources.set(resources as i64);
        self.version.set(version as i64);
    }
}
