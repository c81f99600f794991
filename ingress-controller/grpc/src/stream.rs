use crate::metrics::RpcObserver;
use ahash::AHashMap as HashMap;
use envoy_types::pb::envoy::service::discovery::v3::{DiscoveryRequest, DiscoveryResponse};
use futures::prelude::*;
use ingress_controller_xds::{Caches, Snapshot, SnapshotCache};
use std::{collections::hash_map::Entry, pin::Pin, sync::Arc};
use tokio_stream::{wrappers::WatchStream, StreamMap};

pub(crate) type BoxDiscoveryStream =
    Pin<Box<dyn Stream<Item = Result<DiscoveryResponse, tonic::Status>> + Send>>;

/// The state-of-the-world subscriptions of a single discovery stream.
pub(crate) struct Subscriptions {
    caches: Caches,
    /// Set for single-family services, which only serve their own type.
    family: Option<&'static str>,
    by_type: HashMap<&'static str, Subscription>,
    updates: StreamMap<&'static str, WatchStream<Arc<Snapshot>>>,
}

#[derive(Debug, Default)]
struct Subscription {
    names: Vec<String>,
    /// The version of the last response.
    version: u64,
    nonce: u64,
}

enum Event {
    Request(Option<Result<DiscoveryRequest, tonic::Status>>),
    Update(&'static str, Arc<Snapshot>),
    Shutdown,
}

/// Serves a stream of discovery requests until the client closes it, the
/// request is invalid, or the server shuts down.
pub(crate) fn discovery_stream<S>(
    caches: Caches,
    family: Option<&'static str>,
    requests: S,
    drain: drain::Watch,
    mut observer: RpcObserver,
) -> BoxDiscoveryStream
where
    S: Stream<Item = Result<DiscoveryRequest, tonic::Status>> + Send + 'static,
{
    let mut subscriptions = Subscriptions::new(caches, family);
    Box::pin(async_stream::try_stream! {
        tokio::pin! {
            let requests = requests;
            let shutdown = drain.signaled();
        }

        loop {
            let event = tokio::select! {
                req = requests.next() => Event::Request(req),
                Some((type_url, snapshot)) = subscriptions.updates.next() => {
                    Event::Update(type_url, snapshot)
                }
                // Close the stream so that it doesn't hold the server open.
                _ = &mut shutdown => Event::Shutdown,
            };

            match event {
                Event::Request(Some(Ok(req))) => {
                    observer.request_received();
                    let rsp = subscriptions.on_request(req).map_err(|status| {
                        observer.finish(status.code());
                        status
                    })?;
                    if let Some(rsp) = rsp {
                        observer.response_sent();
                        yield rsp;
                    }
                }
                Event::Request(Some(Err(status))) => {
                    tracing::debug!(%status, "Discovery stream failed");
                    observer.finish(status.code());
                    return;
                }
                Event::Request(None) => {
                    tracing::debug!("Discovery stream closed");
                    return;
                }
                Event::Update(type_url, snapshot) => {
                    if let Some(rsp) = subscriptions.on_update(type_url, &snapshot) {
                        observer.response_sent();
                        yield rsp;
                    }
                }
                Event::Shutdown => return,
            }
        }
    })
}

/// Answers a single request with the current snapshot.
pub(crate) fn fetch(
    caches: &Caches,
    family: Option<&'static str>,
    req: &DiscoveryRequest,
) -> Result<DiscoveryResponse, tonic::Status> {
    let snapshot = resolve(caches, family, &req.type_url)?.snapshot();
    Ok(DiscoveryResponse {
        version_info: snapshot.version().to_string(),
        resources: snapshot.query(&req.resource_names),
        type_url: snapshot.type_url().to_string(),
        ..Default::default()
    })
}

fn resolve<'c>(
    caches: &'c Caches,
    family: Option<&'static str>,
    type_url: &str,
) -> Result<&'c SnapshotCache, tonic::Status> {
    let type_url = match family {
        Some(family) if type_url.is_empty() => family,
        Some(family) if type_url != family => {
            return Err(tonic::Status::invalid_argument(format!(
                "this service only serves {family}"
            )))
        }
        _ => type_url,
    };
    caches
        .cache(type_url)
        .ok_or_else(|| tonic::Status::invalid_argument(format!("unsupported type URL: {type_url}")))
}

// === impl Subscriptions ===

impl Subscriptions {
    pub(crate) fn new(caches: Caches, family: Option<&'static str>) -> Self {
        Self {
            caches,
            family,
            by_type: HashMap::default(),
            updates: StreamMap::new(),
        }
    }

    /// Handles a request, returning a response when the client needs one.
    ///
    /// A client needs a response when it first subscribes to a type, when it
    /// changes the names it subscribes to, or when it reports a version other
    /// than the current one in reply to the latest response.
    pub(crate) fn on_request(
        &mut self,
        req: DiscoveryRequest,
    ) -> Result<Option<DiscoveryResponse>, tonic::Status> {
        let cache = resolve(&self.caches, self.family, &req.type_url)?;
        let type_url = cache.type_url();

        if let Some(error) = req.error_detail.as_ref() {
            tracing::warn!(
                type_url,
                version = %req.version_info,
                nonce = %req.response_nonce,
                error = %error.message,
                "Configuration rejected"
            );
            return Ok(None);
        }

        let sub = match self.by_type.entry(type_url) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                tracing::debug!(type_url, names = ?req.resource_names, "Subscribed");
                // Answer with the snapshot the watch has seen, so that any
                // later publish is pushed.
                let mut updates = cache.watch();
                let snapshot = updates.borrow_and_update().clone();
                self.updates
                    .insert(type_url, WatchStream::from_changes(updates));
                let sub = entry.insert(Subscription {
                    names: req.resource_names,
                    ..Default::default()
                });
                return Ok(Some(sub.respond(&snapshot)));
            }
        };

        let snapshot = cache.snapshot();

        if !req.response_nonce.is_empty() && req.response_nonce != sub.nonce.to_string() {
            tracing::trace!(type_url, nonce = %req.response_nonce, "Ignoring stale request");
            return Ok(None);
        }

        if req.resource_names != sub.names {
            tracing::debug!(type_url, names = ?req.resource_names, "Subscription changed");
            sub.names = req.resource_names;
            return Ok(Some(sub.respond(&snapshot)));
        }

        if req.version_info != snapshot.version().to_string() {
            return Ok(Some(sub.respond(&snapshot)));
        }

        tracing::trace!(type_url, version = %req.version_info, "Acknowledged");
        Ok(None)
    }

    /// Pushes a newly published snapshot to its subscription.
    pub(crate) fn on_update(
        &mut self,
        type_url: &'static str,
        snapshot: &Snapshot,
    ) -> Option<DiscoveryResponse> {
        let sub = self.by_type.get_mut(type_url)?;
        if snapshot.version() <= sub.version {
            return None;
        }
        Some(sub.respond(snapshot))
    }
}

// === impl Subscription ===

impl Subscription {
    fn respond(&mut self, snapshot: &Snapshot) -> DiscoveryResponse {
        self.nonce += 1;
        self.version = snapshot.version();
        DiscoveryResponse {
            version_info: snapshot.version().to_string(),
            resources: snapshot.query(&self.names),
            type_url: snapshot.type_url().to_string(),
            nonce: self.nonce.to_string(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::DiscoveryMetrics;
    use envoy_types::pb::google::rpc::Status as RpcStatus;
    use ingress_controller_core::{
        graph::DEFAULT_CONNECT_TIMEOUT, Cluster, ClusterDiscovery, GraphObserver, RoutingGraph,
    };
    use ingress_controller_xds::{
        CacheMetrics, EndpointCache, CLUSTER_TYPE_URL, ENDPOINT_TYPE_URL, LISTENER_TYPE_URL,
    };
    use pretty_assertions::assert_eq;
    use prometheus_client::registry::Registry;
    use tokio::sync::mpsc;
    use tokio_stream::wrappers::ReceiverStream;

    fn caches() -> Caches {
        let metrics = CacheMetrics::default();
        Caches::new(&metrics, &EndpointCache::new(&metrics))
    }

    fn publish_clusters(caches: &Caches, names: &[&str]) {
        let mut graph = RoutingGraph::default();
        for name in names {
            graph.clusters.insert(
                name.to_string(),
                Cluster {
                    name: name.to_string(),
                    discovery: ClusterDiscovery::Eds {
                        service_name: name.to_string(),
                    },
                    protocol: Default::default(),
                    validation: None,
                    sni: None,
                    lb_strategy: Default::default(),
                    connect_timeout: DEFAULT_CONNECT_TIMEOUT,
                },
            );
        }
        caches.clusters.on_change(&graph);
    }

    fn request(type_url: &str, version: &str, nonce: &str, names: &[&str]) -> DiscoveryRequest {
        DiscoveryRequest {
            type_url: type_url.to_string(),
            version_info: version.to_string(),
            response_nonce: nonce.to_string(),
            resource_names: names.iter().map(|n| n.to_string()).collect(),
            ..Default::default()
        }
    }

    fn observer() -> RpcObserver {
        DiscoveryMetrics::register(&mut Registry::default()).rpc("test", "Stream")
    }

    #[test]
    fn first_request_is_answered_and_acks_are_not() {
        let caches = caches();
        publish_clusters(&caches, &["app/a/80", "app/b/80"]);
        let mut subs = Subscriptions::new(caches, None);

        let rsp = subs
            .on_request(request(CLUSTER_TYPE_URL, "", "", &[]))
            .expect("request must be valid")
            .expect("first request must be answered");
        assert_eq!(rsp.version_info, "1");
        assert_eq!(rsp.nonce, "1");
        assert_eq!(rsp.type_url, CLUSTER_TYPE_URL);
        assert_eq!(rsp.resources.len(), 2);

        let ack = subs
            .on_request(request(CLUSTER_TYPE_URL, "1", "1", &[]))
            .expect("request must be valid");
        assert_eq!(ack, None);
    }

    #[test]
    fn name_changes_are_answered() {
        let caches = caches();
        publish_clusters(&caches, &["app/a/80", "app/b/80"]);
        let mut subs = Subscriptions::new(caches, None);
        subs.on_request(request(CLUSTER_TYPE_URL, "", "", &["app/a/80"]))
            .expect("request must be valid");

        let rsp = subs
            .on_request(request(CLUSTER_TYPE_URL, "1", "1", &["app/b/80"]))
            .expect("request must be valid")
            .expect("name change must be answered");
        assert_eq!(rsp.nonce, "2");
        assert_eq!(rsp.resources.len(), 1);
    }

    #[test]
    fn version_mismatches_are_answered_unless_stale() {
        let caches = caches();
        publish_clusters(&caches, &["app/a/80"]);
        publish_clusters(&caches, &["app/a/80"]);
        let mut subs = Subscriptions::new(caches, None);
        subs.on_request(request(CLUSTER_TYPE_URL, "", "", &[]))
            .expect("request must be valid");

        // A reconnecting client reports the version it last applied.
        let rsp = subs
            .on_request(request(CLUSTER_TYPE_URL, "1", "1", &[]))
            .expect("request must be valid")
            .expect("version mismatch must be answered");
        assert_eq!(rsp.version_info, "2");

        let stale = subs
            .on_request(request(CLUSTER_TYPE_URL, "1", "1", &[]))
            .expect("request must be valid");
        assert_eq!(stale, None);
    }

    #[test]
    fn nacks_are_not_answered() {
        let caches = caches();
        let mut subs = Subscriptions::new(caches, None);
        subs.on_request(request(LISTENER_TYPE_URL, "", "", &[]))
            .expect("request must be valid");

        let mut nack = request(LISTENER_TYPE_URL, "", "1", &[]);
        nack.error_detail = Some(RpcStatus {
            code: 3,
            message: "invalid listener".to_string(),
            ..Default::default()
        });
        assert_eq!(subs.on_request(nack).expect("request must be valid"), None);
    }

    #[test]
    fn unknown_types_are_rejected() {
        let mut subs = Subscriptions::new(caches(), None);
        let status = subs
            .on_request(request("type.googleapis.com/envoy.Unknown", "", "", &[]))
            .expect_err("unknown type must fail");
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }

    #[test]
    fn single_family_services_serve_their_own_type() {
        let caches = caches();
        publish_clusters(&caches, &["app/a/80"]);
        let mut subs = Subscriptions::new(caches, Some(CLUSTER_TYPE_URL));

        let status = subs
            .on_request(request(LISTENER_TYPE_URL, "", "", &[]))
            .expect_err("other families must fail");
        assert_eq!(status.code(), tonic::Code::InvalidArgument);

        let rsp = subs
            .on_request(request("", "", "", &[]))
            .expect("request must be valid")
            .expect("first request must be answered");
        assert_eq!(rsp.type_url, CLUSTER_TYPE_URL);
    }

    #[test]
    fn updates_are_pushed_once() {
        let caches = caches();
        let mut subs = Subscriptions::new(caches.clone(), None);
        assert!(subs
            .on_update(CLUSTER_TYPE_URL, &caches.clusters.cache().snapshot())
            .is_none());

        subs.on_request(request(CLUSTER_TYPE_URL, "", "", &[]))
            .expect("request must be valid");
        publish_clusters(&caches, &["app/a/80"]);
        let snapshot = caches.clusters.cache().snapshot();
        let rsp = subs
            .on_update(CLUSTER_TYPE_URL, &snapshot)
            .expect("newer version must be pushed");
        assert_eq!(rsp.version_info, "1");
        assert_eq!(rsp.resources.len(), 1);
        assert!(subs.on_update(CLUSTER_TYPE_URL, &snapshot).is_none());
    }

    #[tokio::test]
    async fn subscriptions_watch_from_the_answered_version() {
        let caches = caches();
        publish_clusters(&caches, &["app/a/80"]);
        let mut subs = Subscriptions::new(caches.clone(), None);
        let rsp = subs
            .on_request(request(CLUSTER_TYPE_URL, "", "", &[]))
            .expect("request must be valid")
            .expect("first request must be answered");
        assert_eq!(rsp.version_info, "1");

        // The answered snapshot is not pushed again.
        assert!(subs.updates.next().now_or_never().is_none());

        publish_clusters(&caches, &["app/a/80", "app/b/80"]);
        let (type_url, snapshot) = subs
            .updates
            .next()
            .await
            .expect("publish must be observed");
        let rsp = subs
            .on_update(type_url, &snapshot)
            .expect("newer version must be pushed");
        assert_eq!(rsp.version_info, "2");
        assert_eq!(rsp.resources.len(), 2);
    }

    #[test]
    fn missing_endpoints_are_served_empty() {
        let mut subs = Subscriptions::new(caches(), None);
        let rsp = subs
            .on_request(request(ENDPOINT_TYPE_URL, "", "", &["app/gone/80"]))
            .expect("request must be valid")
            .expect("first request must be answered");
        assert_eq!(rsp.resources.len(), 1);
        assert_eq!(rsp.resources[0].type_url, ENDPOINT_TYPE_URL);
    }

    #[test]
    fn fetch_returns_the_current_snapshot() {
        let caches = caches();
        publish_clusters(&caches, &["app/a/80", "app/b/80"]);
        let rsp = fetch(
            &caches,
            Some(CLUSTER_TYPE_URL),
            &request("", "", "", &["app/b/80"]),
        )
        .expect("request must be valid");
        assert_eq!(rsp.version_info, "1");
        assert_eq!(rsp.resources.len(), 1);
        assert!(rsp.nonce.is_empty());
    }

    #[tokio::test]
    async fn streams_push_updates() {
        let caches = caches();
        let (tx, rx) = mpsc::channel(1);
        let (_signal, drain) = drain::channel();
        let mut stream = discovery_stream(
            caches.clone(),
            None,
            ReceiverStream::new(rx).map(Ok),
            drain,
            observer(),
        );

        tx.send(request(CLUSTER_TYPE_URL, "", "", &[]))
            .await
            .expect("stream must be live");
        let rsp = stream
            .next()
            .await
            .expect("stream must respond")
            .expect("response must succeed");
        assert_eq!(rsp.version_info, "0");
        assert!(rsp.resources.is_empty());

        publish_clusters(&caches, &["app/a/80"]);
        let rsp = stream
            .next()
            .await
            .expect("stream must push")
            .expect("push must succeed");
        assert_eq!(rsp.version_info, "1");
        assert_eq!(rsp.nonce, "2");

        drop(tx);
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn invalid_requests_end_the_stream() {
        let (tx, rx) = mpsc::channel(1);
        let (_signal, drain) = drain::channel();
        let mut stream = discovery_stream(
            caches(),
            None,
            ReceiverStream::new(rx).map(Ok),
            drain,
            observer(),
        );

        tx.send(request("type.googleapis.com/envoy.Unknown", "", "", &[]))
            .await
            .expect("stream must be live");
        let status = stream
            .next()
            .await
            .expect("stream must fail")
            .expect_err("request must be rejected");
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn shutdown_ends_the_stream() {
        let (_tx, rx) = mpsc::channel::<DiscoveryRequest>(1);
        let (signal, drain) = drain::channel();
        let mut stream = discovery_stream(
            caches(),
            None,
            ReceiverStream::new(rx).map(Ok),
            drain,
            observer(),
        );

        let mut draining = tokio_test::task::spawn(signal.drain());
        tokio_test::assert_pending!(draining.poll());
        assert!(stream.next().await.is_none());
        drop(stream);
        draining.await;
    }
}
