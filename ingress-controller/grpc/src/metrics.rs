use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, histogram::Histogram},
    registry::{Registry, Unit},
};
use tokio::time;

/// Per-method counters of the discovery server's RPCs.
#[derive(Clone, Debug)]
pub struct DiscoveryMetrics {
    rpcs_started: Family<RpcLabels, Counter>,
    rpcs_handled: Family<OutcomeLabels, Counter>,
    rpc_duration: Family<RpcLabels, Histogram>,
    requests_received: Family<RpcLabels, Counter>,
    responses_sent: Family<RpcLabels, Counter>,
}

/// Records the requests, responses and outcome of a single RPC.
///
/// An RPC that is dropped before it finishes is recorded as `Ok`, since
/// clients end discovery streams by disconnecting.
pub(crate) struct RpcObserver {
    labels: RpcLabels,
    requests_received: Counter,
    responses_sent: Counter,
    started_at: Option<time::Instant>,
    metrics: DiscoveryMetrics,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct RpcLabels {
    service: &'static str,
    method: &'static str,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct OutcomeLabels {
    service: &'static str,
    method: &'static str,
    code: String,
}

// === impl DiscoveryMetrics ===

impl DiscoveryMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let rpcs_started = Family::default();
        reg.register(
            "rpcs_started",
            "Count of discovery RPCs started",
            rpcs_started.clone(),
        );

        let rpcs_handled = Family::default();
        reg.register(
            "rpcs_handled",
            "Count of discovery RPCs finished, by gRPC status code",
            rpcs_handled.clone(),
        );

        // Proxies hold streams open for as long as they run, so most streams
        // last until a restart.
        let rpc_duration = Family::<RpcLabels, Histogram>::new_with_constructor(|| {
            Histogram::new([0.1, 1.0, 300.0, 3600.0, 86400.0])
        });
        reg.register_with_unit(
            "rpc_duration",
            "Time from the start of a discovery RPC until it finished",
            Unit::Seconds,
            rpc_duration.clone(),
        );

        let requests_received = Family::default();
        reg.register(
            "requests_received",
            "Count of discovery requests received",
            requests_received.clone(),
        );

        let responses_sent = Family::default();
        reg.register(
            "responses_sent",
            "Count of discovery responses sent",
            responses_sent.clone(),
        );

        Self {
            rpcs_started,
            rpcs_handled,
            rpc_duration,
            requests_received,
            responses_sent,
        }
    }

    /// Starts recording an RPC.
    pub(crate) fn rpc(&self, service: &'static str, method: &'static str) -> RpcObserver {
        let labels = RpcLabels { service, method };
        self.rpcs_started.get_or_create(&labels).inc();
        RpcObserver {
            requests_received: self.requests_received.get_or_create(&labels).clone(),
            responses_sent: self.responses_sent.get_or_create(&labels).clone(),
            labels,
            started_at: Some(time::Instant::now()),
            metrics: self.clone(),
        }
    }
}

// === impl RpcObserver ===

impl RpcObserver {
    pub(crate) fn request_received(&self) {
        self.requests_received.inc();
    }

    pub(crate) fn response_sent(&self) {
        self.responses_sent.inc();
    }

    /// Records the RPC's outcome. Later calls have no effect.
    pub(crate) fn finish(&mut self, code: tonic::Code) {
        let Some(started_at) = self.started_at.take() else {
            return;
        };
        let RpcLabels { service, method } = self.labels.clone();
        self.metrics
            .rpc_duration
            .get_or_create(&self.labels)
            .observe(started_at.elapsed().as_secs_f64());
        self.metrics
            .rpcs_handled
            .get_or_create(&OutcomeLabels {
                service,
                method,
                code: format!("{code:?}"),
            })
            .inc();
    }
}

impl Drop for RpcObserver {
    fn drop(&mut self) {
        self.finish(tonic::Code::Ok);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn handled(metrics: &DiscoveryMetrics, code: &str) -> u64 {
        metrics
            .rpcs_handled
            .get_or_create(&OutcomeLabels {
                service: "svc",
                method: "Fetch",
                code: code.to_string(),
            })
            .get()
    }

    #[test]
    fn records_the_first_outcome_only() {
        let metrics = DiscoveryMetrics::register(&mut Registry::default());
        let mut rpc = metrics.rpc("svc", "Fetch");
        rpc.request_received();
        rpc.finish(tonic::Code::InvalidArgument);
        drop(rpc);

        assert_eq!(handled(&metrics, "InvalidArgument"), 1);
        assert_eq!(handled(&metrics, "Ok"), 0);
    }

    #[test]
    fn dropped_rpcs_are_ok() {
        let metrics = DiscoveryMetrics::register(&mut Registry::default());
        let rpc = metrics.rpc("svc", "Fetch");
        rpc.request_received();
        rpc.response_sent();
        drop(rpc);

        let labels = RpcLabels {
            service: "svc",
            method: "Fetch",
        };
        assert_eq!(metrics.rpcs_started.get_or_create(&labels).get(), 1);
        assert_eq!(metrics.requests_received.get_or_create(&labels).get(), 1);
        assert_eq!(metrics.responses_sent.get_or_create(&labels).get(), 1);
        assert_eq!(handled(&metrics, "Ok"), 1);
    }
}
